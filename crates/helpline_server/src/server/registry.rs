#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use helpline_domain::{RoomEvent, RoomId};
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::debug;

/// Identifier for one live connection inside the registry.
pub type ConnectionId = u64;

/// Configuration for `RoomRegistry`.
#[derive(Debug, Clone)]
pub struct RoomRegistryConfig {
	/// Maximum number of queued events per member.
	pub member_queue_capacity: usize,

	pub debug_logs: bool,
}

impl Default for RoomRegistryConfig {
	fn default() -> Self {
		Self {
			member_queue_capacity: 256,
			debug_logs: false,
		}
	}
}

/// Per-room arena of live members with best-effort fan-out.
///
/// Rooms are a side-effect of connections: an entry is created on first join
/// and garbage-collected when the last member leaves. Operations on one room
/// serialize on that room's lock; different rooms do not contend.
#[derive(Debug, Clone)]
pub struct RoomRegistry {
	rooms: Arc<RwLock<HashMap<RoomId, Arc<Mutex<RoomEntry>>>>>,
	next_conn_id: Arc<AtomicU64>,
	cfg: RoomRegistryConfig,
}

#[derive(Debug, Default)]
struct RoomEntry {
	members: HashMap<ConnectionId, Member>,
}

#[derive(Debug)]
struct Member {
	display_name: String,
	tx: mpsc::Sender<RoomEvent>,

	/// Events dropped while this member's queue was full.
	pending_lag: u64,
}

impl RoomRegistry {
	pub fn new(cfg: RoomRegistryConfig) -> Self {
		Self {
			rooms: Arc::new(RwLock::new(HashMap::new())),
			next_conn_id: Arc::new(AtomicU64::new(1)),
			cfg,
		}
	}

	/// Join a room, creating the entry if absent.
	///
	/// Returns the member's connection id and the receiving end of its event
	/// queue. Dropping the receiver is enough to get pruned lazily; callers
	/// that can do better should `leave` explicitly.
	pub async fn join(&self, room: RoomId, display_name: impl Into<String>) -> (ConnectionId, mpsc::Receiver<RoomEvent>) {
		let (tx, rx) = mpsc::channel(self.cfg.member_queue_capacity);
		let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
		let display_name = display_name.into();

		let entry = {
			let mut rooms = self.rooms.write().await;
			let created = !rooms.contains_key(&room);
			let entry = Arc::clone(rooms.entry(room.clone()).or_default());
			if created {
				metrics::gauge!("helpline_server_rooms_active").increment(1.0);
			}
			entry
		};

		let mut entry = entry.lock().await;
		entry.members.insert(
			conn_id,
			Member {
				display_name,
				tx,
				pending_lag: 0,
			},
		);
		metrics::counter!("helpline_server_room_joins_total").increment(1);

		if self.cfg.debug_logs {
			debug!(room = %room, conn_id, members = entry.members.len(), "room registry: joined");
		}

		(conn_id, rx)
	}

	/// Remove a member; garbage-collects the room entry when it empties.
	pub async fn leave(&self, room: &RoomId, conn_id: ConnectionId) {
		let Some(entry) = self.lookup(room).await else {
			return;
		};

		let emptied = {
			let mut entry = entry.lock().await;
			if entry.members.remove(&conn_id).is_some() {
				metrics::counter!("helpline_server_room_leaves_total").increment(1);
			}
			entry.members.is_empty()
		};

		if self.cfg.debug_logs {
			debug!(room = %room, conn_id, "room registry: left");
		}

		if emptied {
			self.collect_if_empty(room).await;
		}
	}

	/// Deliver `event` to every current member of `room`, best-effort.
	///
	/// Members whose receiver is gone are pruned; members with a full queue
	/// lose the event and get a `Lagged` marker once their queue drains.
	pub async fn broadcast(&self, room: &RoomId, event: RoomEvent) {
		let Some(entry) = self.lookup(room).await else {
			return;
		};

		let emptied = {
			let mut entry = entry.lock().await;
			deliver(&mut entry, &event);
			prune_closed_members(&mut entry);
			entry.members.is_empty()
		};

		if emptied {
			self.collect_if_empty(room).await;
		}
	}

	/// Broadcast the terminal `RoomClosed` event, then evict every member.
	///
	/// Used exclusively by the resolution workflow. After this returns no
	/// member of the room can receive further events; a racing `broadcast`
	/// either completed before the eviction or delivers to nobody.
	pub async fn close_room(&self, room: &RoomId, reason: impl Into<String>) {
		let entry = {
			let mut rooms = self.rooms.write().await;
			rooms.remove(room)
		};

		let Some(entry) = entry else {
			return;
		};
		metrics::gauge!("helpline_server_rooms_active").decrement(1.0);

		let reason = reason.into();
		let mut entry = entry.lock().await;
		let event = RoomEvent::Closed { reason: reason.clone() };
		deliver(&mut entry, &event);

		debug!(room = %room, reason = %reason, members = entry.members.len(), "room registry: closed room");
		entry.members.clear();
	}

	/// Get a snapshot of member counts per room.
	pub async fn room_member_counts(&self) -> HashMap<RoomId, usize> {
		let rooms = self.rooms.read().await;
		let mut counts = HashMap::with_capacity(rooms.len());
		for (room, entry) in rooms.iter() {
			let entry = entry.lock().await;
			counts.insert(
				room.clone(),
				entry.members.values().filter(|m| !m.tx.is_closed()).count(),
			);
		}
		counts
	}

	/// Display names of the room's current members (diagnostics).
	#[allow(dead_code)]
	pub async fn member_names(&self, room: &RoomId) -> Vec<String> {
		let Some(entry) = self.lookup(room).await else {
			return Vec::new();
		};
		let entry = entry.lock().await;
		entry.members.values().map(|m| m.display_name.clone()).collect()
	}

	async fn lookup(&self, room: &RoomId) -> Option<Arc<Mutex<RoomEntry>>> {
		let rooms = self.rooms.read().await;
		rooms.get(room).map(Arc::clone)
	}

	/// Re-check emptiness under the map write lock before removing the entry,
	/// so a join racing the gc is never lost.
	async fn collect_if_empty(&self, room: &RoomId) {
		let mut rooms = self.rooms.write().await;
		if let Some(entry) = rooms.get(room) {
			let empty = entry.lock().await.members.is_empty();
			if empty {
				rooms.remove(room);
				metrics::gauge!("helpline_server_rooms_active").decrement(1.0);
			}
		}
	}
}

fn deliver(entry: &mut RoomEntry, event: &RoomEvent) {
	let mut dropped_total: u64 = 0;

	for member in entry.members.values_mut() {
		match member.tx.try_send(event.clone()) {
			Ok(()) => {
				if member.pending_lag > 0
					&& member
						.tx
						.try_send(RoomEvent::Lagged {
							dropped: member.pending_lag,
						})
						.is_ok()
				{
					member.pending_lag = 0;
				}
			}
			Err(mpsc::error::TrySendError::Full(_)) => {
				dropped_total += 1;
				member.pending_lag = member.pending_lag.saturating_add(1);
			}
			Err(mpsc::error::TrySendError::Closed(_)) => {}
		}
	}

	if dropped_total > 0 {
		metrics::counter!("helpline_server_broadcast_dropped_total").increment(dropped_total);
	}
}

fn prune_closed_members(entry: &mut RoomEntry) {
	entry.members.retain(|_, m| !m.tx.is_closed());
}
