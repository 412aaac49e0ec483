#![forbid(unsafe_code)]

use std::sync::Arc;

use sala_domain::{ConnId, Identity, MessageId, MessageKind, Room, RoomId, RoomPin, StoredMessage, tombstone};
use sala_protocol::{JoinRejection, ServerEvent, WireMessage};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::server::codec::CodecError;
use crate::server::room_hub::RoomHub;
use crate::server::roster::{BanList, RoomRoster};
use crate::server::sessions::{CooldownGuard, SessionRegistry, SessionStart};
use crate::server::store::RoomStore;

/// Relay timing policy.
#[derive(Debug, Clone)]
pub struct RelayConfig {
	/// Window during which a just-replaced connection may not rejoin.
	pub reconnect_cooldown_ms: i64,

	/// Idle time after which the sweeper evicts a session.
	pub inactivity_timeout_ms: i64,
}

impl Default for RelayConfig {
	fn default() -> Self {
		Self {
			reconnect_cooldown_ms: 10_000,
			inactivity_timeout_ms: 5 * 60 * 1000,
		}
	}
}

/// User-visible relay failures. None of these tear the process down;
/// each is converted into a targeted response for the initiating
/// connection.
#[derive(Debug, Error)]
pub enum RelayError {
	#[error("join rejected: {}", .0.as_str())]
	RejectedJoin(JoinRejection),

	#[error("not authorized for this operation")]
	Unauthorized,

	#[error("message or room not found")]
	NotFound,

	#[error("operation failed, please retry")]
	Persistence(anyhow::Error),

	#[error("message could not be processed")]
	Codec(CodecError),
}

fn store_error(err: anyhow::Error) -> RelayError {
	match err.downcast::<CodecError>() {
		Ok(codec) => RelayError::Codec(codec),
		Err(other) => RelayError::Persistence(other),
	}
}

/// The presence and session-integrity coordinator.
///
/// Every operation runs its read-check-mutate-broadcast sequence under
/// one coordinator lock, so broadcasts triggered by a single operation
/// are never interleaved with another operation on the same room or
/// identity. Persistence calls are the only awaits that do real work
/// inside the critical section; broadcasts wait for them so the wire
/// always reflects durable state.
pub struct Relay {
	core: Mutex<CoreState>,
	hub: RoomHub,
	store: Arc<dyn RoomStore>,
	cfg: RelayConfig,
}

struct CoreState {
	sessions: SessionRegistry,
	roster: RoomRoster,
	bans: BanList,
	cooldown: CooldownGuard,
}

/// What a message send should carry besides text.
#[derive(Debug, Clone, Default)]
pub struct SendMeta {
	pub file_name: Option<String>,
	/// Persisted id for `kind = file` messages, produced by the upload
	/// collaborator before the relay ever sees the event.
	pub message_id: Option<MessageId>,
}

impl Relay {
	pub fn new(hub: RoomHub, store: Arc<dyn RoomStore>, cfg: RelayConfig) -> Self {
		Self {
			core: Mutex::new(CoreState {
				sessions: SessionRegistry::new(),
				roster: RoomRoster::new(),
				bans: BanList::new(),
				cooldown: CooldownGuard::new(cfg.reconnect_cooldown_ms),
			}),
			hub,
			store,
			cfg,
		}
	}

	pub fn hub(&self) -> &RoomHub {
		&self.hub
	}

	pub fn config(&self) -> &RelayConfig {
		&self.cfg
	}

	/// Resolve a room by pin and enter it.
	///
	/// Gate order matters: bans are checked before session logic so a
	/// banned identity can never trigger a replacement cascade, and the
	/// cooldown gate blocks only the exact evicted connection.
	pub async fn join(&self, identity: &Identity, conn: ConnId, pin: &RoomPin, now_ms: i64) -> Result<Room, RelayError> {
		let room = self
			.store
			.find_room_by_pin(pin)
			.await
			.map_err(store_error)?
			.ok_or(RelayError::RejectedJoin(JoinRejection::BadPin))?;

		let mut core = self.core.lock().await;

		if core.bans.is_banned(room.id, identity) {
			metrics::counter!("sala_server_joins_rejected_total").increment(1);
			return Err(RelayError::RejectedJoin(JoinRejection::Banned));
		}

		if core.cooldown.is_blocked(identity, conn, now_ms) {
			metrics::counter!("sala_server_joins_rejected_total").increment(1);
			return Err(RelayError::RejectedJoin(JoinRejection::CooldownActive));
		}

		match core.sessions.begin_session(identity, conn, room.id, now_ms) {
			SessionStart::Accepted => {}
			SessionStart::Refreshed { prior_room } => {
				if prior_room != room.id {
					let notice = format!("{} ha salido de la sala", identity);
					self.leave_room_locked(&mut core, prior_room, identity, notice).await;
				}
			}
			SessionStart::Replaced { prior, prior_room } => {
				debug!(conn = %conn, prior = %prior, "session replaced by newer connection");
				metrics::counter!("sala_server_sessions_replaced_total").increment(1);

				core.cooldown.block(identity, prior, now_ms);
				self.hub.send_to(prior, ServerEvent::SessionReplaced).await;
				self.hub.unregister(prior).await;

				if prior_room != room.id {
					let notice = format!("{} se desconectó (sesión desde otro dispositivo)", identity);
					self.leave_room_locked(&mut core, prior_room, identity, notice).await;
				}
			}
		}

		core.roster.add_or_replace(room.id, identity, conn);

		self.hub
			.send_to(
				conn,
				ServerEvent::Joined {
					room_id: room.id,
					room_name: room.name.clone(),
				},
			)
			.await;

		let notice = format!("{} se ha unido a la sala", identity);
		self.broadcast_room_state(&core, room.id, Some(notice)).await;

		metrics::counter!("sala_server_joins_total").increment(1);
		info!(conn = %conn, room = %room.id, "join completed");

		Ok(room)
	}

	/// Relay a message to the sender's current room.
	pub async fn send(
		&self,
		sender: &Identity,
		conn: ConnId,
		room: RoomId,
		content: String,
		kind: MessageKind,
		meta: SendMeta,
		now_ms: i64,
	) -> Result<(), RelayError> {
		let mut core = self.core.lock().await;

		let session = core.sessions.get(sender).ok_or(RelayError::Unauthorized)?;
		if session.conn != conn || session.room != room {
			return Err(RelayError::Unauthorized);
		}
		let prev_activity_ms = session.last_activity_ms;
		core.sessions.touch(sender, now_ms);

		let result = match kind {
			MessageKind::File => self.relay_file_message(sender, room, meta).await,
			MessageKind::Text => self.relay_text_message(sender, room, content, now_ms).await,
			// A tombstone kind can only be produced by delete.
			MessageKind::Deleted => Err(RelayError::Unauthorized),
		};

		match result {
			Ok(stored) => {
				let targets = core.roster.conns(room);
				self.hub
					.broadcast(&targets, ServerEvent::NewMessage { message: stored })
					.await;
				metrics::counter!("sala_server_messages_total").increment(1);
				Ok(())
			}
			Err(err) => {
				// Roll the activity refresh back; observers never see a
				// message that failed to persist.
				core.sessions.touch(sender, prev_activity_ms);
				Err(err)
			}
		}
	}

	async fn relay_file_message(&self, sender: &Identity, room: RoomId, meta: SendMeta) -> Result<WireMessage, RelayError> {
		// File content is persisted and scanned by the upload
		// collaborator; the relay only re-reads and fans it out.
		let id = meta.message_id.ok_or(RelayError::NotFound)?;
		let msg = self
			.store
			.find_message(id)
			.await
			.map_err(store_error)?
			.ok_or(RelayError::NotFound)?;

		if msg.room != room || msg.sender != *sender {
			return Err(RelayError::NotFound);
		}

		Ok(wire_message(msg))
	}

	async fn relay_text_message(
		&self,
		sender: &Identity,
		room: RoomId,
		content: String,
		now_ms: i64,
	) -> Result<WireMessage, RelayError> {
		let msg = StoredMessage {
			id: MessageId::new_v4(),
			room,
			sender: sender.clone(),
			content,
			kind: MessageKind::Text,
			file_name: None,
			edited: false,
			timestamp_ms: now_ms,
		};

		self.store.create_message(&msg).await.map_err(store_error)?;

		// Re-read the durable record so every client, the sender
		// included, sees exactly what was stored.
		let stored = self
			.store
			.find_message(msg.id)
			.await
			.map_err(store_error)?
			.ok_or_else(|| RelayError::Persistence(anyhow::anyhow!("message vanished after write: {}", msg.id)))?;

		Ok(wire_message(stored))
	}

	/// Rewrite a message. Only the original sender of a live text
	/// message may edit; tombstones and file messages are immutable.
	pub async fn edit(
		&self,
		actor: &Identity,
		conn: ConnId,
		room: RoomId,
		message_id: MessageId,
		new_content: String,
	) -> Result<(), RelayError> {
		let core = self.core.lock().await;

		let session = core.sessions.get(actor).ok_or(RelayError::Unauthorized)?;
		if session.conn != conn || session.room != room {
			return Err(RelayError::Unauthorized);
		}

		let msg = self
			.store
			.find_message(message_id)
			.await
			.map_err(store_error)?
			.ok_or(RelayError::NotFound)?;

		if msg.sender != *actor || msg.kind != MessageKind::Text {
			return Err(RelayError::Unauthorized);
		}

		let updated = StoredMessage {
			content: new_content.clone(),
			edited: true,
			..msg
		};
		self.store.update_message(&updated).await.map_err(store_error)?;

		let targets = core.roster.conns(updated.room);
		self.hub
			.broadcast(
				&targets,
				ServerEvent::MessageEdited {
					message_id,
					new_content,
					edited: true,
				},
			)
			.await;

		Ok(())
	}

	/// Soft-delete a message. Authorized for the original sender or the
	/// room's creator; the row stays, its content becomes a tombstone.
	pub async fn delete(
		&self,
		actor: &Identity,
		conn: ConnId,
		room: RoomId,
		message_id: MessageId,
	) -> Result<(), RelayError> {
		let core = self.core.lock().await;

		let session = core.sessions.get(actor).ok_or(RelayError::Unauthorized)?;
		if session.conn != conn || session.room != room {
			return Err(RelayError::Unauthorized);
		}

		let msg = self
			.store
			.find_message(message_id)
			.await
			.map_err(store_error)?
			.ok_or(RelayError::NotFound)?;

		let room_rec = self
			.store
			.find_room_by_id(msg.room)
			.await
			.map_err(store_error)?
			.ok_or(RelayError::NotFound)?;

		let is_admin = room_rec.created_by == *actor;
		if msg.sender != *actor && !is_admin {
			return Err(RelayError::Unauthorized);
		}

		// Admin status wins: the creator deleting their own message still
		// leaves the admin-variant tombstone.
		let new_content = tombstone(is_admin).to_string();

		let updated = StoredMessage {
			content: new_content.clone(),
			kind: MessageKind::Deleted,
			..msg
		};
		self.store.update_message(&updated).await.map_err(store_error)?;

		let targets = core.roster.conns(updated.room);
		self.hub
			.broadcast(&targets, ServerEvent::MessageDeleted { message_id, new_content })
			.await;

		Ok(())
	}

	/// Ban and remove an identity from a room. Room creator only.
	pub async fn kick(
		&self,
		actor: &Identity,
		conn: ConnId,
		room: RoomId,
		target: &Identity,
	) -> Result<(), RelayError> {
		let mut core = self.core.lock().await;

		let session = core.sessions.get(actor).ok_or(RelayError::Unauthorized)?;
		if session.conn != conn || session.room != room {
			return Err(RelayError::Unauthorized);
		}

		let room_rec = self
			.store
			.find_room_by_id(room)
			.await
			.map_err(store_error)?
			.ok_or(RelayError::NotFound)?;

		if room_rec.created_by != *actor {
			return Err(RelayError::Unauthorized);
		}

		let target_conn = core.roster.entry(room, target).ok_or(RelayError::NotFound)?.conn;

		core.bans.ban(room, target);
		core.sessions.end_session(target, target_conn);
		core.roster.remove(room, target);

		self.hub.send_to(target_conn, ServerEvent::Kicked { room_id: room }).await;
		self.hub.unregister(target_conn).await;

		let notice = format!("{} ha sido expulsado de la sala", target);
		self.broadcast_room_state(&core, room, Some(notice)).await;

		metrics::counter!("sala_server_kicks_total").increment(1);
		info!(conn = %target_conn, room = %room, "kick completed");

		Ok(())
	}

	/// Refresh the inactivity clock. Idempotent; a ping without a
	/// session is a no-op.
	pub async fn touch_activity(&self, identity: &Identity, now_ms: i64) {
		let mut core = self.core.lock().await;
		core.sessions.touch(identity, now_ms);
	}

	/// Transport-level disconnect: guarded session teardown plus the
	/// shared room-leave path.
	pub async fn disconnect(&self, conn: ConnId, now_ms: i64) {
		let mut core = self.core.lock().await;

		core.cooldown.purge_expired(now_ms);

		let Some((identity, session)) = core.sessions.find_by_conn(conn).map(|(id, s)| (id.clone(), s.clone())) else {
			return;
		};

		core.cooldown.clear(&identity, conn);

		// The conn match guard keeps a stale disconnect from deleting a
		// newer session for the same identity.
		if core.sessions.end_session(&identity, conn).is_none() {
			return;
		}

		let notice = format!("{} ha salido de la sala", identity);
		self.leave_room_locked(&mut core, session.room, &identity, notice).await;
	}

	/// One sweeper pass: evict every session idle past the threshold.
	///
	/// Eviction is not a replacement, so no cooldown entry is written
	/// and the identity may rejoin immediately. A failure for one
	/// session never aborts the rest of the sweep.
	pub async fn sweep(&self, now_ms: i64) -> usize {
		let mut core = self.core.lock().await;
		core.cooldown.purge_expired(now_ms);

		let idle = core.sessions.idle_sessions(self.cfg.inactivity_timeout_ms, now_ms);
		let evicted = idle.len();

		for (identity, session) in idle {
			if !self.hub.send_to(session.conn, ServerEvent::InactivityDisconnect).await {
				warn!(conn = %session.conn, "sweeper: could not notify idle connection");
			}
			self.hub.unregister(session.conn).await;

			if core.sessions.end_session(&identity, session.conn).is_some() {
				let notice = format!("{} ha salido de la sala", identity);
				self.leave_room_locked(&mut core, session.room, &identity, notice).await;
			}
		}

		if evicted > 0 {
			metrics::counter!("sala_server_inactivity_evictions_total").increment(evicted as u64);
			debug!(evicted, "sweeper pass evicted idle sessions");
		}

		evicted
	}

	/// Snapshot of a room's roster, in join order.
	pub async fn roster(&self, room: RoomId) -> Vec<Identity> {
		let core = self.core.lock().await;
		core.roster.list(room)
	}

	/// Whether an identity is banned from a room.
	pub async fn is_banned(&self, room: RoomId, identity: &Identity) -> bool {
		let core = self.core.lock().await;
		core.bans.is_banned(room, identity)
	}

	async fn leave_room_locked(&self, core: &mut CoreState, room: RoomId, identity: &Identity, notice: String) {
		if !core.roster.remove(room, identity) {
			return;
		}

		self.broadcast_room_state(core, room, Some(notice)).await;
	}

	async fn broadcast_room_state(&self, core: &CoreState, room: RoomId, notice: Option<String>) {
		let targets = core.roster.conns(room);

		self.hub
			.broadcast(
				&targets,
				ServerEvent::RosterUpdate {
					room_id: room,
					users: core.roster.list(room),
				},
			)
			.await;

		if let Some(text) = notice {
			self.hub
				.broadcast(&targets, ServerEvent::SystemNotice { room_id: room, text })
				.await;
		}
	}
}

fn wire_message(msg: StoredMessage) -> WireMessage {
	WireMessage {
		id: msg.id,
		room_id: msg.room,
		sender: msg.sender,
		content: msg.content,
		kind: msg.kind,
		file_name: msg.file_name,
		edited: msg.edited,
		timestamp_ms: msg.timestamp_ms,
	}
}
