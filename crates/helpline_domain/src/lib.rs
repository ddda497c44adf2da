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
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Identifier of a help request and of its chat room (one room per request).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
	/// Create a non-empty `RoomId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for RoomId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for RoomId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		RoomId::new(s.to_string())
	}
}

/// Stable user identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub uuid::Uuid);

impl UserId {
	/// Create a new random user id.
	pub fn new_v4() -> Self {
		Self(uuid::Uuid::new_v4())
	}

	/// Parse from the canonical hyphenated form.
	pub fn parse(s: &str) -> Result<Self, ParseIdError> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		uuid::Uuid::parse_str(s)
			.map(Self)
			.map_err(|_| ParseIdError::InvalidFormat(format!("expected uuid, got {s:?}")))
	}
}

impl fmt::Display for UserId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for UserId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		UserId::parse(s)
	}
}

/// Caller identity, passed explicitly into every gateway/workflow call.
///
/// Resolved by the external auth collaborator; this crate never looks
/// identity up from ambient state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
	pub user_id: UserId,
	pub name: String,
}

impl Identity {
	/// Construct an identity with a non-empty display name.
	pub fn new(user_id: UserId, name: impl Into<String>) -> Result<Self, ParseIdError> {
		let name = name.into();
		if name.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self { user_id, name })
	}
}

/// An open help request. The record exists only while the request is open;
/// resolution deletes it rather than flagging it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelpRequest {
	pub id: RoomId,
	pub owner: UserId,
	pub title: String,
	pub description: String,

	/// Unix milliseconds.
	pub created_at: i64,
}

/// A chat message as stored: append-only, stamped at write time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
	pub room: RoomId,
	pub sender_name: String,
	pub sender_id: Option<UserId>,
	pub body: String,

	/// Unix milliseconds, monotonically non-decreasing within a room.
	pub created_at: i64,
}

/// A user record with the reputation counter this subsystem maintains.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
	pub id: UserId,
	pub name: String,

	/// Incremented by exactly one per resolution naming this user.
	pub helped: i64,
}

/// Items delivered on a room connection's event stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RoomEvent {
	/// A message persisted and fanned out to the room.
	#[serde(rename = "message-received")]
	Message { message: StoredMessage },

	/// Terminal event: the room was torn down; no further messages follow.
	#[serde(rename = "room-closed")]
	Closed { reason: String },

	/// The member's queue overflowed and `dropped` events were discarded.
	Lagged { dropped: u64 },
}
