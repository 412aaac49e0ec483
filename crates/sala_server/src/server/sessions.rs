#![forbid(unsafe_code)]

use std::collections::HashMap;

use sala_domain::{ConnId, Identity, RoomId};

/// Live session state for one identity.
///
/// At most one session exists per identity at any instant; the registry
/// enforces this by keying on the identity itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
	pub conn: ConnId,
	pub room: RoomId,
	pub last_activity_ms: i64,
}

/// Outcome of a session begin attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStart {
	/// No prior session existed.
	Accepted,

	/// Same connection re-joined (room switch or rejoin); activity and
	/// room were refreshed in place.
	Refreshed { prior_room: RoomId },

	/// A different connection held the session. It has been evicted;
	/// the caller owns the eviction side effects (cooldown entry,
	/// notification, roster removal for the prior room).
	Replaced { prior: ConnId, prior_room: RoomId },
}

/// Identity-keyed session registry.
///
/// Purely synchronous; callers serialize access (the relay holds its
/// coordinator lock across every mutation).
#[derive(Debug, Default)]
pub struct SessionRegistry {
	sessions: HashMap<Identity, Session>,
}

impl SessionRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Create, refresh, or replace the session for `identity`.
	///
	/// Replacement removes the prior session before inserting the new
	/// one, so the single-session invariant holds at every return.
	pub fn begin_session(&mut self, identity: &Identity, conn: ConnId, room: RoomId, now_ms: i64) -> SessionStart {
		match self.sessions.get_mut(identity) {
			None => {
				self.sessions.insert(
					identity.clone(),
					Session {
						conn,
						room,
						last_activity_ms: now_ms,
					},
				);
				SessionStart::Accepted
			}
			Some(existing) if existing.conn == conn => {
				let prior_room = existing.room;
				existing.room = room;
				existing.last_activity_ms = now_ms;
				SessionStart::Refreshed { prior_room }
			}
			Some(existing) => {
				let prior = existing.conn;
				let prior_room = existing.room;
				*existing = Session {
					conn,
					room,
					last_activity_ms: now_ms,
				};
				SessionStart::Replaced { prior, prior_room }
			}
		}
	}

	/// Refresh the activity timestamp. No-op if no session exists.
	pub fn touch(&mut self, identity: &Identity, now_ms: i64) {
		if let Some(session) = self.sessions.get_mut(identity) {
			session.last_activity_ms = now_ms;
		}
	}

	/// Remove the session only if its recorded connection matches.
	///
	/// The match guard keeps a delayed disconnect from a just-replaced
	/// connection from deleting the replacement session.
	pub fn end_session(&mut self, identity: &Identity, conn: ConnId) -> Option<Session> {
		match self.sessions.get(identity) {
			Some(session) if session.conn == conn => self.sessions.remove(identity),
			_ => None,
		}
	}

	pub fn get(&self, identity: &Identity) -> Option<&Session> {
		self.sessions.get(identity)
	}

	/// Reverse lookup by connection handle.
	pub fn find_by_conn(&self, conn: ConnId) -> Option<(&Identity, &Session)> {
		self.sessions.iter().find(|(_, s)| s.conn == conn)
	}

	/// Sessions idle past `threshold_ms`, snapshotted for the sweeper.
	pub fn idle_sessions(&self, threshold_ms: i64, now_ms: i64) -> Vec<(Identity, Session)> {
		self.sessions
			.iter()
			.filter(|(_, s)| now_ms.saturating_sub(s.last_activity_ms) > threshold_ms)
			.map(|(id, s)| (id.clone(), s.clone()))
			.collect()
	}

	pub fn len(&self) -> usize {
		self.sessions.len()
	}

	pub fn is_empty(&self) -> bool {
		self.sessions.is_empty()
	}
}

/// Short-lived block on an exact (identity, connection) pair after a
/// forced replacement, so the evicted transport's automatic reconnect
/// cannot race the teardown. A fresh connection for the same identity
/// is never blocked.
#[derive(Debug)]
pub struct CooldownGuard {
	window_ms: i64,
	blocked: HashMap<(Identity, ConnId), i64>,
}

impl CooldownGuard {
	pub fn new(window_ms: i64) -> Self {
		Self {
			window_ms,
			blocked: HashMap::new(),
		}
	}

	/// Record the block at `now_ms`.
	pub fn block(&mut self, identity: &Identity, conn: ConnId, now_ms: i64) {
		self.blocked.insert((identity.clone(), conn), now_ms);
	}

	/// Whether the pair is still inside the window. Expired entries are
	/// dropped lazily on lookup.
	pub fn is_blocked(&mut self, identity: &Identity, conn: ConnId, now_ms: i64) -> bool {
		let key = (identity.clone(), conn);
		match self.blocked.get(&key) {
			Some(blocked_at) if now_ms.saturating_sub(*blocked_at) < self.window_ms => true,
			Some(_) => {
				self.blocked.remove(&key);
				false
			}
			None => false,
		}
	}

	/// Drop the entry for a matching disconnect.
	pub fn clear(&mut self, identity: &Identity, conn: ConnId) {
		self.blocked.remove(&(identity.clone(), conn));
	}

	/// Drop every expired entry.
	pub fn purge_expired(&mut self, now_ms: i64) {
		let window_ms = self.window_ms;
		self.blocked
			.retain(|_, blocked_at| now_ms.saturating_sub(*blocked_at) < window_ms);
	}

	pub fn len(&self) -> usize {
		self.blocked.len()
	}

	pub fn is_empty(&self) -> bool {
		self.blocked.is_empty()
	}
}
