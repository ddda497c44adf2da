#![forbid(unsafe_code)]

use std::sync::Arc;

use helpline_domain::{Identity, RoomEvent, RoomId, StoredMessage};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::server::registry::{ConnectionId, RoomRegistry};
use crate::server::store::{MessageStore, NewMessage, RequestStore};
use crate::util::time::unix_ms_now;

/// Errors for joining a room.
#[derive(Debug, Error)]
pub enum ConnectError {
	#[error("room not found: {0}")]
	RoomNotFound(RoomId),

	#[error("failed to look up help request")]
	Store(#[source] anyhow::Error),
}

/// Errors for the send-message relay.
#[derive(Debug, Error)]
pub enum SendError {
	#[error("empty message body")]
	EmptyBody,

	#[error("room not found: {0}")]
	RoomNotFound(RoomId),

	#[error("failed to persist message")]
	Store(#[source] anyhow::Error),
}

/// Live handle to a joined room.
///
/// Owns the receiving end of the member's event queue. Dropping the handle
/// deterministically runs the leave path: the guard notifies the gateway's
/// janitor task, which removes the member from the registry.
pub struct RoomConnection {
	room: RoomId,
	conn_id: ConnectionId,
	events: mpsc::Receiver<RoomEvent>,

	_guard: HangupGuard,
}

impl RoomConnection {
	/// Next room event; `None` once the room entry is gone and the queue is
	/// drained.
	pub async fn recv(&mut self) -> Option<RoomEvent> {
		self.events.recv().await
	}

	pub fn room(&self) -> &RoomId {
		&self.room
	}

	pub fn conn_id(&self) -> ConnectionId {
		self.conn_id
	}
}

struct HangupGuard {
	room: RoomId,
	conn_id: ConnectionId,
	hangup_tx: mpsc::UnboundedSender<(RoomId, ConnectionId)>,
}

impl Drop for HangupGuard {
	fn drop(&mut self) {
		let _ = self.hangup_tx.send((self.room.clone(), self.conn_id));
	}
}

/// Thin coordination layer between connection handles, the room registry and
/// the message store. Owns no business state.
pub struct Gateway {
	registry: RoomRegistry,
	requests: Arc<dyn RequestStore>,
	messages: Arc<dyn MessageStore>,
	hangup_tx: mpsc::UnboundedSender<(RoomId, ConnectionId)>,
}

impl Gateway {
	/// Create the gateway and spawn its janitor task.
	pub fn new(registry: RoomRegistry, requests: Arc<dyn RequestStore>, messages: Arc<dyn MessageStore>) -> Arc<Self> {
		let (hangup_tx, mut hangup_rx) = mpsc::unbounded_channel::<(RoomId, ConnectionId)>();

		let janitor_registry = registry.clone();
		tokio::spawn(async move {
			while let Some((room, conn_id)) = hangup_rx.recv().await {
				debug!(room = %room, conn_id, "gateway janitor: leaving room");
				janitor_registry.leave(&room, conn_id).await;
			}
		});

		Arc::new(Self {
			registry,
			requests,
			messages,
			hangup_tx,
		})
	}

	pub fn registry(&self) -> &RoomRegistry {
		&self.registry
	}

	/// Join the room of an open help request.
	pub async fn connect(&self, room: RoomId, identity: &Identity) -> Result<RoomConnection, ConnectError> {
		let request = self.requests.get(&room).await.map_err(ConnectError::Store)?;
		if request.is_none() {
			return Err(ConnectError::RoomNotFound(room));
		}

		let (conn_id, events) = self.registry.join(room.clone(), identity.name.clone()).await;
		metrics::counter!("helpline_server_connects_total").increment(1);
		debug!(room = %room, conn_id, user = %identity.name, "gateway: connected");

		Ok(RoomConnection {
			room: room.clone(),
			conn_id,
			events,
			_guard: HangupGuard {
				room,
				conn_id,
				hangup_tx: self.hangup_tx.clone(),
			},
		})
	}

	/// Relay one message: validate, persist, then broadcast the stored form.
	///
	/// Persist-before-broadcast keeps the live view and the history from
	/// diverging: a message that failed to persist is never seen by peers.
	pub async fn send_message(&self, room: RoomId, identity: &Identity, body: &str) -> Result<StoredMessage, SendError> {
		if body.trim().is_empty() {
			return Err(SendError::EmptyBody);
		}

		let request = self.requests.get(&room).await.map_err(SendError::Store)?;
		if request.is_none() {
			// Resolved requests are deleted, so a closed room answers the
			// same as one that never existed.
			return Err(SendError::RoomNotFound(room));
		}

		let stored = self
			.messages
			.append(
				NewMessage {
					room: room.clone(),
					sender_name: identity.name.clone(),
					sender_id: Some(identity.user_id),
					body: body.to_string(),
				},
				unix_ms_now(),
			)
			.await
			.map_err(|e| {
				metrics::counter!("helpline_server_message_store_failures_total").increment(1);
				warn!(room = %room, error = %e, "message append failed; not broadcasting");
				SendError::Store(e)
			})?;

		self.registry.broadcast(&room, RoomEvent::Message { message: stored.clone() }).await;
		metrics::counter!("helpline_server_messages_total").increment(1);

		Ok(stored)
	}

	/// One-shot ordered read of a room's history, independent of any live
	/// connection.
	pub async fn fetch_history(&self, room: &RoomId) -> anyhow::Result<Vec<StoredMessage>> {
		self.messages.list(room).await
	}
}
