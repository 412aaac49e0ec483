#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};

use sala_domain::{ConnId, Identity, RoomId};

/// One presence row inside a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEntry {
	pub identity: Identity,
	pub conn: ConnId,
}

/// Per-room presence, ordered by join sequence.
///
/// Entries stay in sync with the session registry: the relay adds and
/// removes them inside the same critical section that mutates sessions.
#[derive(Debug, Default)]
pub struct RoomRoster {
	rooms: HashMap<RoomId, Vec<PresenceEntry>>,
}

impl RoomRoster {
	pub fn new() -> Self {
		Self::default()
	}

	/// Add `identity` to the room, replacing any stale entry for it
	/// first so a duplicate reconnect never yields two rows.
	pub fn add_or_replace(&mut self, room: RoomId, identity: &Identity, conn: ConnId) {
		let entries = self.rooms.entry(room).or_default();
		entries.retain(|e| e.identity != *identity);
		entries.push(PresenceEntry {
			identity: identity.clone(),
			conn,
		});
	}

	/// Remove the entry; returns whether one existed.
	pub fn remove(&mut self, room: RoomId, identity: &Identity) -> bool {
		let Some(entries) = self.rooms.get_mut(&room) else {
			return false;
		};

		let before = entries.len();
		entries.retain(|e| e.identity != *identity);
		let removed = entries.len() != before;

		if entries.is_empty() {
			self.rooms.remove(&room);
		}

		removed
	}

	/// Identities present in the room, in join order.
	pub fn list(&self, room: RoomId) -> Vec<Identity> {
		self.rooms
			.get(&room)
			.map(|entries| entries.iter().map(|e| e.identity.clone()).collect())
			.unwrap_or_default()
	}

	/// Connection handles for every entry in the room.
	pub fn conns(&self, room: RoomId) -> Vec<ConnId> {
		self.rooms
			.get(&room)
			.map(|entries| entries.iter().map(|e| e.conn).collect())
			.unwrap_or_default()
	}

	pub fn entry(&self, room: RoomId, identity: &Identity) -> Option<&PresenceEntry> {
		self.rooms.get(&room).and_then(|entries| entries.iter().find(|e| e.identity == *identity))
	}

	pub fn room_len(&self, room: RoomId) -> usize {
		self.rooms.get(&room).map(Vec::len).unwrap_or(0)
	}
}

/// Room-scoped bans. No unban path and no TTL; entries live for the
/// process lifetime.
#[derive(Debug, Default)]
pub struct BanList {
	bans: HashMap<RoomId, HashSet<Identity>>,
}

impl BanList {
	pub fn new() -> Self {
		Self::default()
	}

	/// Idempotent add.
	pub fn ban(&mut self, room: RoomId, identity: &Identity) {
		self.bans.entry(room).or_default().insert(identity.clone());
	}

	pub fn is_banned(&self, room: RoomId, identity: &Identity) -> bool {
		self.bans.get(&room).is_some_and(|set| set.contains(identity))
	}
}
