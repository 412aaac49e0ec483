#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("value too long: {len} > {max}")]
	TooLong { len: usize, max: usize },
	#[error("invalid pin: expected 4-8 digits")]
	InvalidPin,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Display-name identity a connecting client presents.
///
/// Not a durable account: uniqueness is enforced only as "one live
/// connection at a time" by the session registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
	/// Maximum accepted display-name length, in characters.
	pub const MAX_LEN: usize = 32;

	/// Create a trimmed, non-empty `Identity`.
	pub fn new(name: impl Into<String>) -> Result<Self, ParseIdError> {
		let name = name.into();
		let trimmed = name.trim();
		if trimmed.is_empty() {
			return Err(ParseIdError::Empty);
		}

		let len = trimmed.chars().count();
		if len > Self::MAX_LEN {
			return Err(ParseIdError::TooLong { len, max: Self::MAX_LEN });
		}

		Ok(Self(trimmed.to_string()))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for Identity {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for Identity {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Identity::new(s)
	}
}

/// Short numeric room code handed out when a room is created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomPin(String);

impl RoomPin {
	/// Validate a 4-8 digit pin.
	pub fn new(pin: impl Into<String>) -> Result<Self, ParseIdError> {
		let pin = pin.into();
		let trimmed = pin.trim();
		if trimmed.is_empty() {
			return Err(ParseIdError::Empty);
		}
		if !(4..=8).contains(&trimmed.len()) || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
			return Err(ParseIdError::InvalidPin);
		}
		Ok(Self(trimmed.to_string()))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for RoomPin {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for RoomPin {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		RoomPin::new(s)
	}
}

/// Server-assigned room identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(pub uuid::Uuid);

impl RoomId {
	/// Create a new random room id.
	pub fn new_v4() -> Self {
		Self(uuid::Uuid::new_v4())
	}
}

impl fmt::Display for RoomId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for RoomId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		uuid::Uuid::parse_str(s)
			.map(Self)
			.map_err(|_| ParseIdError::InvalidFormat(format!("expected uuid, got {s:?}")))
	}
}

/// Server-assigned message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub uuid::Uuid);

impl MessageId {
	/// Create a new random message id.
	pub fn new_v4() -> Self {
		Self(uuid::Uuid::new_v4())
	}
}

impl fmt::Display for MessageId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for MessageId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		uuid::Uuid::parse_str(s)
			.map(Self)
			.map_err(|_| ParseIdError::InvalidFormat(format!("expected uuid, got {s:?}")))
	}
}

/// Opaque handle for one transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "conn-{}", self.0)
	}
}

/// Message payload kinds carried by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
	Text,
	File,
	Deleted,
}

impl MessageKind {
	/// Stable string identifier (also the persisted column value).
	pub const fn as_str(self) -> &'static str {
		match self {
			MessageKind::Text => "text",
			MessageKind::File => "file",
			MessageKind::Deleted => "deleted",
		}
	}
}

impl fmt::Display for MessageKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for MessageKind {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim() {
			"text" => Ok(MessageKind::Text),
			"file" => Ok(MessageKind::File),
			"deleted" => Ok(MessageKind::Deleted),
			other => Err(ParseIdError::InvalidFormat(format!("unknown message kind: {other}"))),
		}
	}
}

/// Tombstone written over a message deleted by its author.
pub const TOMBSTONE_AUTHOR: &str = "🗑️ Mensaje eliminado";

/// Tombstone written over a message deleted by the room admin.
pub const TOMBSTONE_ADMIN: &str = "🗑️ Mensaje eliminado por el administrador";

/// Tombstone text for a soft-deleted message.
pub const fn tombstone(by_admin: bool) -> &'static str {
	if by_admin { TOMBSTONE_ADMIN } else { TOMBSTONE_AUTHOR }
}

/// A chat room as the relay sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
	pub id: RoomId,
	pub name: String,
	pub pin: RoomPin,
	/// Identity of the room creator; the only identity allowed to kick
	/// and to delete other users' messages.
	pub created_by: Identity,
}

/// A chat message as stored by the persistence collaborator.
///
/// `sender` and `content` are plaintext here; the store encrypts them on
/// write and decrypts on read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
	pub id: MessageId,
	pub room: RoomId,
	pub sender: Identity,
	pub content: String,
	pub kind: MessageKind,
	pub file_name: Option<String>,
	pub edited: bool,
	pub timestamp_ms: i64,
}
