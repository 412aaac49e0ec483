#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use sala_domain::{Identity, MessageId, MessageKind, Room, RoomId, RoomPin, StoredMessage};
use tokio::sync::Mutex;

use crate::server::codec::MessageCodec;

/// Storage collaborator for rooms and messages.
///
/// Message sender and content are encrypted on write and decrypted on
/// read by the codec the store owns; callers only ever see plaintext.
#[async_trait::async_trait]
pub trait RoomStore: Send + Sync {
	async fn create_room(&self, room: &Room) -> anyhow::Result<()>;

	async fn find_room_by_pin(&self, pin: &RoomPin) -> anyhow::Result<Option<Room>>;

	async fn find_room_by_id(&self, id: RoomId) -> anyhow::Result<Option<Room>>;

	async fn create_message(&self, msg: &StoredMessage) -> anyhow::Result<()>;

	async fn update_message(&self, msg: &StoredMessage) -> anyhow::Result<()>;

	async fn find_message(&self, id: MessageId) -> anyhow::Result<Option<StoredMessage>>;
}

fn seal(codec: &MessageCodec, msg: &StoredMessage) -> anyhow::Result<(String, String)> {
	let sender = codec.encrypt(msg.sender.as_str()).context("encrypt sender")?;
	let content = codec.encrypt(&msg.content).context("encrypt content")?;
	Ok((sender, content))
}

fn open(codec: &MessageCodec, sender: &str, content: &str) -> anyhow::Result<(Identity, String)> {
	let sender = codec.decrypt(sender).context("decrypt sender")?;
	let sender = Identity::new(&sender).map_err(|e| anyhow!("stored sender is not a valid identity: {e}"))?;
	let content = codec.decrypt(content).context("decrypt content")?;
	Ok((sender, content))
}

/// In-memory store for tests and for running without a database.
///
/// Rows hold ciphertext like the SQL backends do, so the codec path is
/// exercised identically.
pub struct MemoryStore {
	inner: Mutex<MemoryInner>,
	codec: Arc<MessageCodec>,
}

#[derive(Default)]
struct MemoryInner {
	rooms: HashMap<RoomId, Room>,
	messages: HashMap<MessageId, SealedRow>,
}

/// Ciphertext row, mirroring what the SQL backends persist.
#[derive(Clone)]
struct SealedRow {
	room: RoomId,
	sender: String,
	content: String,
	kind: MessageKind,
	file_name: Option<String>,
	edited: bool,
	timestamp_ms: i64,
}

impl MemoryStore {
	pub fn new(codec: Arc<MessageCodec>) -> Self {
		Self {
			inner: Mutex::new(MemoryInner::default()),
			codec,
		}
	}
}

#[async_trait::async_trait]
impl RoomStore for MemoryStore {
	async fn create_room(&self, room: &Room) -> anyhow::Result<()> {
		let mut inner = self.inner.lock().await;
		inner.rooms.insert(room.id, room.clone());
		Ok(())
	}

	async fn find_room_by_pin(&self, pin: &RoomPin) -> anyhow::Result<Option<Room>> {
		let inner = self.inner.lock().await;
		Ok(inner.rooms.values().find(|r| r.pin == *pin).cloned())
	}

	async fn find_room_by_id(&self, id: RoomId) -> anyhow::Result<Option<Room>> {
		let inner = self.inner.lock().await;
		Ok(inner.rooms.get(&id).cloned())
	}

	async fn create_message(&self, msg: &StoredMessage) -> anyhow::Result<()> {
		let (sender, content) = seal(&self.codec, msg)?;
		let mut inner = self.inner.lock().await;
		inner.messages.insert(
			msg.id,
			SealedRow {
				room: msg.room,
				sender,
				content,
				kind: msg.kind,
				file_name: msg.file_name.clone(),
				edited: msg.edited,
				timestamp_ms: msg.timestamp_ms,
			},
		);
		Ok(())
	}

	async fn update_message(&self, msg: &StoredMessage) -> anyhow::Result<()> {
		let (sender, content) = seal(&self.codec, msg)?;
		let mut inner = self.inner.lock().await;
		let Some(row) = inner.messages.get_mut(&msg.id) else {
			return Err(anyhow!("message not found: {}", msg.id));
		};

		row.sender = sender;
		row.content = content;
		row.kind = msg.kind;
		row.edited = msg.edited;
		Ok(())
	}

	async fn find_message(&self, id: MessageId) -> anyhow::Result<Option<StoredMessage>> {
		let inner = self.inner.lock().await;
		let Some(row) = inner.messages.get(&id) else {
			return Ok(None);
		};

		let (sender, content) = open(&self.codec, &row.sender, &row.content)?;
		Ok(Some(StoredMessage {
			id,
			room: row.room,
			sender,
			content,
			kind: row.kind,
			file_name: row.file_name.clone(),
			edited: row.edited,
			timestamp_ms: row.timestamp_ms,
		}))
	}
}

/// SQL-backed store over SQLite or Postgres.
pub struct SqlStore {
	backend: SqlBackend,
	codec: Arc<MessageCodec>,
}

enum SqlBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

const DDL_ROOMS: &str = "CREATE TABLE IF NOT EXISTS rooms (\
	id TEXT PRIMARY KEY, \
	name TEXT NOT NULL, \
	pin TEXT NOT NULL, \
	created_by TEXT NOT NULL)";

const DDL_MESSAGES: &str = "CREATE TABLE IF NOT EXISTS messages (\
	id TEXT PRIMARY KEY, \
	room_id TEXT NOT NULL, \
	sender TEXT NOT NULL, \
	content TEXT NOT NULL, \
	kind TEXT NOT NULL, \
	file_name TEXT, \
	edited BIGINT NOT NULL DEFAULT 0, \
	timestamp_ms BIGINT NOT NULL)";

impl SqlStore {
	pub async fn connect(database_url: &str, codec: Arc<MessageCodec>) -> anyhow::Result<Self> {
		let backend = if database_url.starts_with("sqlite:") {
			let pool = sqlx::SqlitePool::connect(database_url).await.context("connect sqlite")?;
			sqlx::query(DDL_ROOMS).execute(&pool).await.context("create rooms table (sqlite)")?;
			sqlx::query(DDL_MESSAGES)
				.execute(&pool)
				.await
				.context("create messages table (sqlite)")?;
			SqlBackend::Sqlite(pool)
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			sqlx::query(DDL_ROOMS)
				.execute(&pool)
				.await
				.context("create rooms table (postgres)")?;
			sqlx::query(DDL_MESSAGES)
				.execute(&pool)
				.await
				.context("create messages table (postgres)")?;
			SqlBackend::Postgres(pool)
		} else {
			return Err(anyhow!("unsupported database_url (use sqlite: or postgres:)"));
		};

		Ok(Self { backend, codec })
	}

	fn row_to_message(&self, row: MessageRow) -> anyhow::Result<StoredMessage> {
		let (sender, content) = open(&self.codec, &row.sender, &row.content)?;
		Ok(StoredMessage {
			id: MessageId::from_str(&row.id).map_err(|e| anyhow!("stored message id: {e}"))?,
			room: RoomId::from_str(&row.room_id).map_err(|e| anyhow!("stored room id: {e}"))?,
			sender,
			content,
			kind: MessageKind::from_str(&row.kind).map_err(|e| anyhow!("stored message kind: {e}"))?,
			file_name: row.file_name,
			edited: row.edited != 0,
			timestamp_ms: row.timestamp_ms,
		})
	}
}

type MessageTuple = (String, String, String, String, String, Option<String>, i64, i64);

struct MessageRow {
	id: String,
	room_id: String,
	sender: String,
	content: String,
	kind: String,
	file_name: Option<String>,
	edited: i64,
	timestamp_ms: i64,
}

impl From<MessageTuple> for MessageRow {
	fn from((id, room_id, sender, content, kind, file_name, edited, timestamp_ms): MessageTuple) -> Self {
		Self {
			id,
			room_id,
			sender,
			content,
			kind,
			file_name,
			edited,
			timestamp_ms,
		}
	}
}

fn row_to_room(row: (String, String, String, String)) -> anyhow::Result<Room> {
	let (id, name, pin, created_by) = row;
	Ok(Room {
		id: RoomId::from_str(&id).map_err(|e| anyhow!("stored room id: {e}"))?,
		name,
		pin: RoomPin::from_str(&pin).map_err(|e| anyhow!("stored room pin: {e}"))?,
		created_by: Identity::new(&created_by).map_err(|e| anyhow!("stored room creator: {e}"))?,
	})
}

#[async_trait::async_trait]
impl RoomStore for SqlStore {
	async fn create_room(&self, room: &Room) -> anyhow::Result<()> {
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO rooms (id, name, pin, created_by) VALUES (?, ?, ?, ?) \
					ON CONFLICT(id) DO UPDATE SET name = excluded.name, pin = excluded.pin, created_by = excluded.created_by",
				)
				.bind(room.id.to_string())
				.bind(&room.name)
				.bind(room.pin.as_str())
				.bind(room.created_by.as_str())
				.execute(pool)
				.await
				.context("upsert room (sqlite)")?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO rooms (id, name, pin, created_by) VALUES ($1, $2, $3, $4) \
					ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, pin = EXCLUDED.pin, created_by = EXCLUDED.created_by",
				)
				.bind(room.id.to_string())
				.bind(&room.name)
				.bind(room.pin.as_str())
				.bind(room.created_by.as_str())
				.execute(pool)
				.await
				.context("upsert room (postgres)")?;
			}
		}
		Ok(())
	}

	async fn find_room_by_pin(&self, pin: &RoomPin) -> anyhow::Result<Option<Room>> {
		let row: Option<(String, String, String, String)> = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query_as("SELECT id, name, pin, created_by FROM rooms WHERE pin = ?")
					.bind(pin.as_str())
					.fetch_optional(pool)
					.await
					.context("select room by pin (sqlite)")?
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query_as("SELECT id, name, pin, created_by FROM rooms WHERE pin = $1")
					.bind(pin.as_str())
					.fetch_optional(pool)
					.await
					.context("select room by pin (postgres)")?
			}
		};

		row.map(row_to_room).transpose()
	}

	async fn find_room_by_id(&self, id: RoomId) -> anyhow::Result<Option<Room>> {
		let row: Option<(String, String, String, String)> = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query_as("SELECT id, name, pin, created_by FROM rooms WHERE id = ?")
					.bind(id.to_string())
					.fetch_optional(pool)
					.await
					.context("select room by id (sqlite)")?
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query_as("SELECT id, name, pin, created_by FROM rooms WHERE id = $1")
					.bind(id.to_string())
					.fetch_optional(pool)
					.await
					.context("select room by id (postgres)")?
			}
		};

		row.map(row_to_room).transpose()
	}

	async fn create_message(&self, msg: &StoredMessage) -> anyhow::Result<()> {
		let (sender, content) = seal(&self.codec, msg)?;

		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO messages (id, room_id, sender, content, kind, file_name, edited, timestamp_ms) \
					VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
				)
				.bind(msg.id.to_string())
				.bind(msg.room.to_string())
				.bind(sender)
				.bind(content)
				.bind(msg.kind.as_str())
				.bind(&msg.file_name)
				.bind(msg.edited as i64)
				.bind(msg.timestamp_ms)
				.execute(pool)
				.await
				.context("insert message (sqlite)")?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO messages (id, room_id, sender, content, kind, file_name, edited, timestamp_ms) \
					VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
				)
				.bind(msg.id.to_string())
				.bind(msg.room.to_string())
				.bind(sender)
				.bind(content)
				.bind(msg.kind.as_str())
				.bind(&msg.file_name)
				.bind(msg.edited as i64)
				.bind(msg.timestamp_ms)
				.execute(pool)
				.await
				.context("insert message (postgres)")?;
			}
		}
		Ok(())
	}

	async fn update_message(&self, msg: &StoredMessage) -> anyhow::Result<()> {
		let (sender, content) = seal(&self.codec, msg)?;

		let affected = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query("UPDATE messages SET sender = ?, content = ?, kind = ?, edited = ? WHERE id = ?")
					.bind(sender)
					.bind(content)
					.bind(msg.kind.as_str())
					.bind(msg.edited as i64)
					.bind(msg.id.to_string())
					.execute(pool)
					.await
					.context("update message (sqlite)")?
					.rows_affected()
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query("UPDATE messages SET sender = $1, content = $2, kind = $3, edited = $4 WHERE id = $5")
					.bind(sender)
					.bind(content)
					.bind(msg.kind.as_str())
					.bind(msg.edited as i64)
					.bind(msg.id.to_string())
					.execute(pool)
					.await
					.context("update message (postgres)")?
					.rows_affected()
			}
		};

		if affected == 0 {
			return Err(anyhow!("message not found: {}", msg.id));
		}
		Ok(())
	}

	async fn find_message(&self, id: MessageId) -> anyhow::Result<Option<StoredMessage>> {
		let row: Option<MessageTuple> = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query_as(
					"SELECT id, room_id, sender, content, kind, file_name, edited, timestamp_ms FROM messages WHERE id = ?",
				)
				.bind(id.to_string())
				.fetch_optional(pool)
				.await
				.context("select message (sqlite)")?
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query_as(
					"SELECT id, room_id, sender, content, kind, file_name, edited, timestamp_ms FROM messages WHERE id = $1",
				)
				.bind(id.to_string())
				.fetch_optional(pool)
				.await
				.context("select message (postgres)")?
			}
		};

		row.map(|r| self.row_to_message(MessageRow::from(r))).transpose()
	}
}
