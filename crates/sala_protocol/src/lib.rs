#![forbid(unsafe_code)]

pub mod framing;

pub use framing::{
	DEFAULT_MAX_FRAME_SIZE, FramingError, decode_frame, encode_frame, encode_frame_default, encode_frame_into,
	frame_len_from_payload_len, try_decode_frame_from_buffer,
};

use sala_domain::{Identity, MessageId, MessageKind, RoomId, RoomPin};
use serde::{Deserialize, Serialize};

/// Protocol version constants.
pub mod version {
	/// Current protocol major version (v1).
	pub const PROTOCOL_MAJOR: u32 = 1;
	/// Current protocol minor version.
	pub const PROTOCOL_MINOR: u32 = 0;

	/// Compact representation useful for logs/metrics.
	pub const PROTOCOL_VERSION_U32: u32 = (PROTOCOL_MAJOR << 16) | PROTOCOL_MINOR;

	/// ALPN protocol identifier negotiated on the QUIC handshake.
	pub const ALPN: &[u8] = b"sala-v1";
}

/// Message payload as carried on the wire.
///
/// Content is plaintext here; encryption happens at the persistence
/// boundary, never on the wire envelope itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
	pub id: MessageId,
	pub room_id: RoomId,
	pub sender: Identity,
	pub content: String,
	pub kind: MessageKind,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub file_name: Option<String>,
	pub edited: bool,
	pub timestamp_ms: i64,
}

/// Events a client sends to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientEvent {
	/// Resolve a room by pin and enter it.
	Join {
		pin: RoomPin,
		identity: Identity,
	},

	/// Relay a message to the sender's current room.
	Send {
		room_id: RoomId,
		content: String,
		kind: MessageKind,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		file_name: Option<String>,
		/// Set only for `kind = file`: the already-persisted message id
		/// produced by the upload path.
		#[serde(default, skip_serializing_if = "Option::is_none")]
		message_id: Option<MessageId>,
	},

	/// Rewrite the content of a previously sent message.
	Edit {
		message_id: MessageId,
		room_id: RoomId,
		new_content: String,
	},

	/// Tombstone a message.
	Delete {
		message_id: MessageId,
		room_id: RoomId,
	},

	/// Remove and ban an identity from a room.
	Kick {
		room_id: RoomId,
		target: Identity,
	},

	/// Keep-alive marker; refreshes the inactivity clock.
	ActivityPing,
}

/// Reason a join attempt was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JoinRejection {
	BadPin,
	Banned,
	CooldownActive,
}

impl JoinRejection {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::BadPin => "badPin",
			Self::Banned => "banned",
			Self::CooldownActive => "cooldownActive",
		}
	}
}

/// Events the server sends to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerEvent {
	/// Join acknowledgement.
	Joined {
		room_id: RoomId,
		room_name: String,
	},

	NewMessage {
		message: WireMessage,
	},

	MessageEdited {
		message_id: MessageId,
		new_content: String,
		edited: bool,
	},

	MessageDeleted {
		message_id: MessageId,
		new_content: String,
	},

	/// Full roster snapshot, ordered by join time.
	RosterUpdate {
		room_id: RoomId,
		users: Vec<Identity>,
	},

	SystemNotice {
		room_id: RoomId,
		text: String,
	},

	/// Sent to the target of a kick before its connection closes.
	Kicked {
		room_id: RoomId,
	},

	/// Sent to the prior connection when the same identity joins
	/// from a new one.
	SessionReplaced,

	/// Sent before an inactivity eviction closes the connection.
	InactivityDisconnect,

	JoinError {
		reason: JoinRejection,
	},

	/// Generic user-visible failure for the initiating connection.
	Error {
		message: String,
	},
}
