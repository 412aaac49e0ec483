#![forbid(unsafe_code)]

use std::sync::Arc;

use sala_domain::{
	ConnId, Identity, MessageId, MessageKind, Room, RoomId, RoomPin, StoredMessage, TOMBSTONE_ADMIN, TOMBSTONE_AUTHOR,
};
use sala_protocol::{JoinRejection, ServerEvent};
use tokio::sync::mpsc;

use crate::server::codec::MessageCodec;
use crate::server::relay::{Relay, RelayConfig, RelayError, SendMeta};
use crate::server::room_hub::{RoomHub, RoomHubConfig};
use crate::server::store::{MemoryStore, RoomStore};

const COOLDOWN_MS: i64 = 10_000;
const IDLE_MS: i64 = 300_000;

fn who(name: &str) -> Identity {
	Identity::new(name).expect("valid identity")
}

fn pin(digits: &str) -> RoomPin {
	RoomPin::new(digits).expect("valid pin")
}

fn test_room(creator: &str) -> Room {
	Room {
		id: RoomId::new_v4(),
		name: "sala general".into(),
		pin: pin("4321"),
		created_by: who(creator),
	}
}

fn drain(rx: &mut mpsc::Receiver<ServerEvent>) -> Vec<ServerEvent> {
	let mut events = Vec::new();
	while let Ok(event) = rx.try_recv() {
		events.push(event);
	}
	events
}

/// Relay over a keyed in-memory store, so every message send exercises
/// the full seal/open pipeline.
async fn setup(creator: &str) -> (Arc<Relay>, Arc<MemoryStore>, Room) {
	let codec = Arc::new(MessageCodec::new(Some([7u8; 32]), false));
	let store = Arc::new(MemoryStore::new(codec));
	let room = test_room(creator);
	store.create_room(&room).await.expect("seed room");

	let relay = Relay::new(
		RoomHub::new(RoomHubConfig::default()),
		store.clone() as Arc<dyn RoomStore>,
		RelayConfig {
			reconnect_cooldown_ms: COOLDOWN_MS,
			inactivity_timeout_ms: IDLE_MS,
		},
	);
	(Arc::new(relay), store, room)
}

async fn join(relay: &Relay, room: &Room, name: &str, conn: ConnId, now_ms: i64) -> mpsc::Receiver<ServerEvent> {
	let rx = relay.hub().register(conn).await;
	relay.join(&who(name), conn, &room.pin, now_ms).await.expect("join");
	rx
}

fn sent_message(events: &[ServerEvent]) -> &sala_protocol::WireMessage {
	events
		.iter()
		.find_map(|ev| match ev {
			ServerEvent::NewMessage { message } => Some(message),
			_ => None,
		})
		.expect("expected a NewMessage event")
}

#[tokio::test]
async fn join_acks_and_broadcasts_roster() {
	let (relay, _store, room) = setup("ana").await;

	let mut rx = join(&relay, &room, "ana", ConnId(1), 0).await;
	let events = drain(&mut rx);

	assert!(matches!(&events[0], ServerEvent::Joined { room_name, .. } if room_name == "sala general"));
	assert!(
		events
			.iter()
			.any(|ev| matches!(ev, ServerEvent::RosterUpdate { users, .. } if *users == vec![who("ana")]))
	);
	assert!(
		events
			.iter()
			.any(|ev| matches!(ev, ServerEvent::SystemNotice { text, .. } if text == "ana se ha unido a la sala"))
	);
}

#[tokio::test]
async fn bad_pin_is_rejected_without_session_state() {
	let (relay, _store, room) = setup("ana").await;
	let _rx = relay.hub().register(ConnId(1)).await;

	let err = relay.join(&who("ana"), ConnId(1), &pin("9999"), 0).await.unwrap_err();
	assert!(matches!(err, RelayError::RejectedJoin(JoinRejection::BadPin)));
	assert!(relay.roster(room.id).await.is_empty());
}

#[tokio::test]
async fn newer_connection_replaces_the_old_one() {
	let (relay, _store, room) = setup("ana").await;

	let mut rx1 = join(&relay, &room, "bob", ConnId(1), 0).await;
	drain(&mut rx1);

	let mut rx2 = join(&relay, &room, "bob", ConnId(2), 1_000).await;

	// The old device hears exactly one replacement notice, then the
	// stream closes.
	let old_events = drain(&mut rx1);
	let replaced = old_events
		.iter()
		.filter(|ev| matches!(ev, ServerEvent::SessionReplaced))
		.count();
	assert_eq!(replaced, 1);
	assert!(rx1.recv().await.is_none());

	// The roster still holds one entry for the identity, reachable on
	// the new connection only.
	assert_eq!(relay.roster(room.id).await, vec![who("bob")]);
	let new_events = drain(&mut rx2);
	assert!(
		new_events
			.iter()
			.any(|ev| matches!(ev, ServerEvent::RosterUpdate { users, .. } if *users == vec![who("bob")]))
	);
}

#[tokio::test]
async fn replacement_into_another_room_announces_the_device_switch() {
	let (relay, store, room_a) = setup("ana").await;
	let room_b = Room {
		id: RoomId::new_v4(),
		name: "sala privada".into(),
		pin: pin("8765"),
		created_by: who("ana"),
	};
	store.create_room(&room_b).await.expect("seed second room");

	let mut rx_eva = join(&relay, &room_a, "eva", ConnId(1), 0).await;
	let _rx_bob = join(&relay, &room_a, "bob", ConnId(2), 0).await;
	drain(&mut rx_eva);

	// Bob's new device lands in a different room; the old room hears a
	// device-switch notice, not the plain leave.
	let _rx_bob2 = relay.hub().register(ConnId(3)).await;
	relay.join(&who("bob"), ConnId(3), &room_b.pin, 1_000).await.expect("join other room");

	let events = drain(&mut rx_eva);
	assert!(
		events
			.iter()
			.any(|ev| matches!(ev, ServerEvent::SystemNotice { text, .. } if text == "bob se desconectó (sesión desde otro dispositivo)"))
	);
	assert_eq!(relay.roster(room_a.id).await, vec![who("eva")]);
}

#[tokio::test]
async fn cooldown_blocks_only_the_replaced_connection() {
	let (relay, _store, room) = setup("ana").await;

	let _rx1 = join(&relay, &room, "bob", ConnId(1), 0).await;
	let _rx2 = join(&relay, &room, "bob", ConnId(2), 1_000).await;

	// The evicted connection is locked out for the window.
	let _rx1b = relay.hub().register(ConnId(1)).await;
	let err = relay.join(&who("bob"), ConnId(1), &room.pin, 5_000).await.unwrap_err();
	assert!(matches!(err, RelayError::RejectedJoin(JoinRejection::CooldownActive)));

	// A genuinely new connection of the same identity is not.
	let _rx3 = relay.hub().register(ConnId(3)).await;
	relay.join(&who("bob"), ConnId(3), &room.pin, 5_000).await.expect("fresh connection joins");

	// And the lock lapses once the window has fully passed.
	let _rx1c = relay.hub().register(ConnId(1)).await;
	relay.join(&who("bob"), ConnId(1), &room.pin, 11_000).await.expect("cooldown expired");
}

#[tokio::test]
async fn rejoin_on_the_same_connection_is_idempotent() {
	let (relay, _store, room) = setup("ana").await;

	let mut rx = join(&relay, &room, "ana", ConnId(1), 0).await;
	drain(&mut rx);

	relay.join(&who("ana"), ConnId(1), &room.pin, 500).await.expect("rejoin");

	assert_eq!(relay.roster(room.id).await, vec![who("ana")]);
	let events = drain(&mut rx);
	assert!(!events.iter().any(|ev| matches!(ev, ServerEvent::SessionReplaced)));
}

#[tokio::test]
async fn kick_bans_for_the_rest_of_the_run() {
	let (relay, _store, room) = setup("ana").await;

	let mut rx_ana = join(&relay, &room, "ana", ConnId(1), 0).await;
	let mut rx_bob = join(&relay, &room, "bob", ConnId(2), 0).await;
	drain(&mut rx_ana);
	drain(&mut rx_bob);

	relay.kick(&who("ana"), ConnId(1), room.id, &who("bob")).await.expect("kick");

	let bob_events = drain(&mut rx_bob);
	assert!(bob_events.iter().any(|ev| matches!(ev, ServerEvent::Kicked { .. })));
	assert!(rx_bob.recv().await.is_none());
	assert_eq!(relay.roster(room.id).await, vec![who("ana")]);

	let ana_events = drain(&mut rx_ana);
	assert!(
		ana_events
			.iter()
			.any(|ev| matches!(ev, ServerEvent::SystemNotice { text, .. } if text == "bob ha sido expulsado de la sala"))
	);

	// Even a brand-new connection cannot get back in.
	let _rx3 = relay.hub().register(ConnId(3)).await;
	let err = relay.join(&who("bob"), ConnId(3), &room.pin, 60_000).await.unwrap_err();
	assert!(matches!(err, RelayError::RejectedJoin(JoinRejection::Banned)));
	assert!(relay.is_banned(room.id, &who("bob")).await);
}

#[tokio::test]
async fn only_the_room_creator_may_kick() {
	let (relay, _store, room) = setup("ana").await;

	let _rx_ana = join(&relay, &room, "ana", ConnId(1), 0).await;
	let _rx_bob = join(&relay, &room, "bob", ConnId(2), 0).await;

	let err = relay.kick(&who("bob"), ConnId(2), room.id, &who("ana")).await.unwrap_err();
	assert!(matches!(err, RelayError::Unauthorized));
	assert!(!relay.is_banned(room.id, &who("ana")).await);
}

#[tokio::test]
async fn kick_of_an_absent_identity_is_not_found() {
	let (relay, _store, room) = setup("ana").await;
	let _rx = join(&relay, &room, "ana", ConnId(1), 0).await;

	let err = relay.kick(&who("ana"), ConnId(1), room.id, &who("nadie")).await.unwrap_err();
	assert!(matches!(err, RelayError::NotFound));
}

#[tokio::test]
async fn text_send_persists_then_fans_out() {
	let (relay, store, room) = setup("ana").await;

	let mut rx_ana = join(&relay, &room, "ana", ConnId(1), 0).await;
	let mut rx_bob = join(&relay, &room, "bob", ConnId(2), 0).await;
	drain(&mut rx_ana);
	drain(&mut rx_bob);

	relay
		.send(&who("ana"), ConnId(1), room.id, "hola a todos".into(), MessageKind::Text, SendMeta::default(), 1_000)
		.await
		.expect("send");

	let mut id = None;
	for rx in [&mut rx_ana, &mut rx_bob] {
		let events = drain(rx);
		let msg = sent_message(&events);
		assert_eq!(msg.content, "hola a todos");
		assert_eq!(msg.sender, who("ana"));
		assert_eq!(msg.timestamp_ms, 1_000);
		assert!(!msg.edited);
		id = Some(msg.id);
	}

	// The broadcast reflects the durable row: the ciphertext round
	// trips back to the same plaintext.
	let stored = store
		.find_message(id.expect("broadcast carried an id"))
		.await
		.expect("lookup")
		.expect("message exists");
	assert_eq!(stored.content, "hola a todos");
	assert_eq!(stored.sender, who("ana"));
}

#[tokio::test]
async fn send_without_a_session_is_unauthorized() {
	let (relay, _store, room) = setup("ana").await;
	let _rx = relay.hub().register(ConnId(1)).await;

	let err = relay
		.send(&who("bob"), ConnId(1), room.id, "hola".into(), MessageKind::Text, SendMeta::default(), 0)
		.await
		.unwrap_err();
	assert!(matches!(err, RelayError::Unauthorized));
}

#[tokio::test]
async fn file_send_relays_a_previously_persisted_message() {
	let (relay, store, room) = setup("ana").await;

	let mut rx = join(&relay, &room, "ana", ConnId(1), 0).await;
	drain(&mut rx);

	let file_msg = StoredMessage {
		id: MessageId::new_v4(),
		room: room.id,
		sender: who("ana"),
		content: "sha256:abc123".into(),
		kind: MessageKind::File,
		file_name: Some("informe.pdf".into()),
		edited: false,
		timestamp_ms: 500,
	};
	store.create_message(&file_msg).await.expect("persist upload");

	relay
		.send(
			&who("ana"),
			ConnId(1),
			room.id,
			String::new(),
			MessageKind::File,
			SendMeta {
				file_name: Some("informe.pdf".into()),
				message_id: Some(file_msg.id),
			},
			1_000,
		)
		.await
		.expect("relay file");

	let events = drain(&mut rx);
	let msg = sent_message(&events);
	assert_eq!(msg.id, file_msg.id);
	assert_eq!(msg.file_name.as_deref(), Some("informe.pdf"));

	// Another identity cannot replay someone else's upload.
	let mut rx_bob = join(&relay, &room, "bob", ConnId(2), 0).await;
	drain(&mut rx_bob);
	let err = relay
		.send(
			&who("bob"),
			ConnId(2),
			room.id,
			String::new(),
			MessageKind::File,
			SendMeta {
				file_name: None,
				message_id: Some(file_msg.id),
			},
			1_100,
		)
		.await
		.unwrap_err();
	assert!(matches!(err, RelayError::NotFound));
}

#[tokio::test]
async fn edit_is_sender_only_and_skips_tombstones() {
	let (relay, _store, room) = setup("ana").await;

	let mut rx_ana = join(&relay, &room, "ana", ConnId(1), 0).await;
	let mut rx_bob = join(&relay, &room, "bob", ConnId(2), 0).await;
	drain(&mut rx_ana);
	drain(&mut rx_bob);

	relay
		.send(&who("bob"), ConnId(2), room.id, "borrador".into(), MessageKind::Text, SendMeta::default(), 100)
		.await
		.expect("send");
	let id = sent_message(&drain(&mut rx_bob)).id;
	drain(&mut rx_ana);

	// Someone else, even the room creator, cannot edit.
	let err = relay.edit(&who("ana"), ConnId(1), room.id, id, "x".into()).await.unwrap_err();
	assert!(matches!(err, RelayError::Unauthorized));

	relay.edit(&who("bob"), ConnId(2), room.id, id, "versión final".into()).await.expect("edit");
	let events = drain(&mut rx_ana);
	assert!(events.iter().any(|ev| matches!(
		ev,
		ServerEvent::MessageEdited { message_id, new_content, edited: true }
			if *message_id == id && new_content == "versión final"
	)));

	// A deleted message is immutable, its own author included.
	relay.delete(&who("bob"), ConnId(2), room.id, id).await.expect("delete");
	let err = relay.edit(&who("bob"), ConnId(2), room.id, id, "resucitado".into()).await.unwrap_err();
	assert!(matches!(err, RelayError::Unauthorized));
}

#[tokio::test]
async fn delete_tombstone_names_who_deleted() {
	let (relay, store, room) = setup("ana").await;

	let mut rx_ana = join(&relay, &room, "ana", ConnId(1), 0).await;
	let mut rx_bob = join(&relay, &room, "bob", ConnId(2), 0).await;
	drain(&mut rx_ana);
	drain(&mut rx_bob);

	relay
		.send(&who("bob"), ConnId(2), room.id, "uno".into(), MessageKind::Text, SendMeta::default(), 100)
		.await
		.expect("send");
	let own = sent_message(&drain(&mut rx_bob)).id;
	relay
		.send(&who("bob"), ConnId(2), room.id, "dos".into(), MessageKind::Text, SendMeta::default(), 200)
		.await
		.expect("send");
	let moderated = sent_message(&drain(&mut rx_bob)).id;
	drain(&mut rx_ana);

	// Author delete.
	relay.delete(&who("bob"), ConnId(2), room.id, own).await.expect("delete own");
	let events = drain(&mut rx_ana);
	assert!(events.iter().any(|ev| matches!(
		ev,
		ServerEvent::MessageDeleted { message_id, new_content }
			if *message_id == own && new_content == TOMBSTONE_AUTHOR
	)));

	// Creator delete of someone else's message.
	relay.delete(&who("ana"), ConnId(1), room.id, moderated).await.expect("delete as creator");
	let events = drain(&mut rx_bob);
	assert!(events.iter().any(|ev| matches!(
		ev,
		ServerEvent::MessageDeleted { message_id, new_content }
			if *message_id == moderated && new_content == TOMBSTONE_ADMIN
	)));

	let row = store.find_message(moderated).await.expect("lookup").expect("row stays");
	assert_eq!(row.kind, MessageKind::Deleted);
	assert_eq!(row.content, TOMBSTONE_ADMIN);
}

#[tokio::test]
async fn creator_deleting_their_own_message_leaves_the_admin_tombstone() {
	let (relay, store, room) = setup("ana").await;

	let mut rx_ana = join(&relay, &room, "ana", ConnId(1), 0).await;
	drain(&mut rx_ana);

	relay
		.send(&who("ana"), ConnId(1), room.id, "aviso".into(), MessageKind::Text, SendMeta::default(), 100)
		.await
		.expect("send");
	let id = sent_message(&drain(&mut rx_ana)).id;

	// Admin status outranks authorship when picking the tombstone.
	relay.delete(&who("ana"), ConnId(1), room.id, id).await.expect("delete own");
	let events = drain(&mut rx_ana);
	assert!(events.iter().any(|ev| matches!(
		ev,
		ServerEvent::MessageDeleted { message_id, new_content }
			if *message_id == id && new_content == TOMBSTONE_ADMIN
	)));

	let row = store.find_message(id).await.expect("lookup").expect("row stays");
	assert_eq!(row.content, TOMBSTONE_ADMIN);
}

#[tokio::test]
async fn bystander_cannot_delete() {
	let (relay, _store, room) = setup("ana").await;

	let _rx_ana = join(&relay, &room, "ana", ConnId(1), 0).await;
	let mut rx_bob = join(&relay, &room, "bob", ConnId(2), 0).await;
	let _rx_eva = join(&relay, &room, "eva", ConnId(3), 0).await;

	relay
		.send(&who("bob"), ConnId(2), room.id, "mío".into(), MessageKind::Text, SendMeta::default(), 100)
		.await
		.expect("send");
	let id = sent_message(&drain(&mut rx_bob)).id;

	let err = relay.delete(&who("eva"), ConnId(3), room.id, id).await.unwrap_err();
	assert!(matches!(err, RelayError::Unauthorized));
}

#[tokio::test]
async fn sweeper_evicts_idle_sessions_without_a_cooldown() {
	let (relay, _store, room) = setup("ana").await;

	let mut rx_ana = join(&relay, &room, "ana", ConnId(1), 0).await;
	let mut rx_bob = join(&relay, &room, "bob", ConnId(2), 0).await;
	drain(&mut rx_ana);
	drain(&mut rx_bob);

	// Bob pings, ana goes quiet.
	relay.touch_activity(&who("bob"), 200_000).await;

	let evicted = relay.sweep(300_500).await;
	assert_eq!(evicted, 1);

	let ana_events = drain(&mut rx_ana);
	assert!(ana_events.iter().any(|ev| matches!(ev, ServerEvent::InactivityDisconnect)));
	assert!(rx_ana.recv().await.is_none());
	assert_eq!(relay.roster(room.id).await, vec![who("bob")]);

	// Unlike a replacement, eviction sets no cooldown; the same
	// connection id may come straight back.
	let _rx1b = relay.hub().register(ConnId(1)).await;
	relay.join(&who("ana"), ConnId(1), &room.pin, 300_600).await.expect("immediate rejoin");
}

#[tokio::test]
async fn sweeper_leaves_sessions_at_the_threshold_alone() {
	let (relay, _store, room) = setup("ana").await;
	let _rx = join(&relay, &room, "ana", ConnId(1), 0).await;

	// Exactly the threshold is not past it.
	assert_eq!(relay.sweep(IDLE_MS).await, 0);
	assert_eq!(relay.roster(room.id).await, vec![who("ana")]);
}

#[tokio::test]
async fn disconnect_leaves_the_room_and_ignores_stale_connections() {
	let (relay, _store, room) = setup("ana").await;

	let mut rx_ana = join(&relay, &room, "ana", ConnId(1), 0).await;
	let _rx_bob = join(&relay, &room, "bob", ConnId(2), 0).await;
	drain(&mut rx_ana);

	relay.disconnect(ConnId(2), 1_000).await;
	assert_eq!(relay.roster(room.id).await, vec![who("ana")]);
	let events = drain(&mut rx_ana);
	assert!(
		events
			.iter()
			.any(|ev| matches!(ev, ServerEvent::SystemNotice { text, .. } if text == "bob ha salido de la sala"))
	);

	// Bob returns on a new connection; the old transport's late
	// disconnect must not tear the fresh session down.
	let _rx_bob2 = join(&relay, &room, "bob", ConnId(3), 2_000).await;
	relay.disconnect(ConnId(2), 2_500).await;
	assert_eq!(relay.roster(room.id).await, vec![who("ana"), who("bob")]);
}

struct BrokenWrites {
	inner: MemoryStore,
}

#[async_trait::async_trait]
impl RoomStore for BrokenWrites {
	async fn create_room(&self, room: &Room) -> anyhow::Result<()> {
		self.inner.create_room(room).await
	}

	async fn find_room_by_pin(&self, pin: &RoomPin) -> anyhow::Result<Option<Room>> {
		self.inner.find_room_by_pin(pin).await
	}

	async fn find_room_by_id(&self, id: RoomId) -> anyhow::Result<Option<Room>> {
		self.inner.find_room_by_id(id).await
	}

	async fn create_message(&self, _msg: &StoredMessage) -> anyhow::Result<()> {
		Err(anyhow::anyhow!("disk full"))
	}

	async fn update_message(&self, msg: &StoredMessage) -> anyhow::Result<()> {
		self.inner.update_message(msg).await
	}

	async fn find_message(&self, id: MessageId) -> anyhow::Result<Option<StoredMessage>> {
		self.inner.find_message(id).await
	}
}

#[tokio::test]
async fn failed_persistence_broadcasts_nothing_and_rolls_activity_back() {
	let store = Arc::new(BrokenWrites {
		inner: MemoryStore::new(Arc::new(MessageCodec::plaintext())),
	});
	let room = test_room("ana");
	store.create_room(&room).await.expect("seed room");

	let relay = Relay::new(
		RoomHub::new(RoomHubConfig::default()),
		store as Arc<dyn RoomStore>,
		RelayConfig {
			reconnect_cooldown_ms: COOLDOWN_MS,
			inactivity_timeout_ms: IDLE_MS,
		},
	);

	let mut rx = relay.hub().register(ConnId(1)).await;
	relay.join(&who("ana"), ConnId(1), &room.pin, 0).await.expect("join");
	drain(&mut rx);

	let err = relay
		.send(&who("ana"), ConnId(1), room.id, "hola".into(), MessageKind::Text, SendMeta::default(), 100)
		.await
		.unwrap_err();
	assert!(matches!(err, RelayError::Persistence(_)));

	let events = drain(&mut rx);
	assert!(!events.iter().any(|ev| matches!(ev, ServerEvent::NewMessage { .. })));

	// The failed send did not count as activity: with last activity
	// still at join time the sweeper evicts at the original deadline.
	assert_eq!(relay.sweep(300_050).await, 1);
}
