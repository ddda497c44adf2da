#![forbid(unsafe_code)]

use std::sync::Arc;

use helpline_domain::{Identity, RoomId};
use thiserror::Error;
use tracing::{error, info};

use crate::server::registry::RoomRegistry;
use crate::server::store::{RequestStore, UserStore};

/// Reason string broadcast with the terminal room event.
pub const CLOSE_REASON_RESOLVED: &str = "resolved";

/// Errors for the resolution workflow.
#[derive(Debug, Error)]
pub enum ResolveError {
	#[error("missing resolver name")]
	MissingResolver,

	#[error("help request not found: {0}")]
	RequestNotFound(RoomId),

	#[error("caller does not own this help request")]
	NotOwner,

	#[error("resolver not found: {0}")]
	ResolverNotFound(String),

	#[error("resolution failed")]
	Store(#[source] anyhow::Error),

	/// The reputation increment succeeded but the request deletion failed.
	/// The data is inconsistent until reconciled out-of-band; nothing is
	/// rolled back or retried here.
	#[error("request deletion failed after crediting {resolver}")]
	PartialCompletion {
		resolver: String,
		#[source]
		source: anyhow::Error,
	},
}

/// Orchestrates the open → resolved transition of a help request:
/// credit the resolver once, delete the record, tear the room down.
pub struct ResolutionWorkflow {
	registry: RoomRegistry,
	requests: Arc<dyn RequestStore>,
	users: Arc<dyn UserStore>,
}

impl ResolutionWorkflow {
	pub fn new(registry: RoomRegistry, requests: Arc<dyn RequestStore>, users: Arc<dyn UserStore>) -> Arc<Self> {
		Arc::new(Self {
			registry,
			requests,
			users,
		})
	}

	/// Resolve the request behind `room`, crediting `resolver_name`.
	///
	/// Only the request owner may resolve; `caller` is the verified identity
	/// passed in explicitly. Success is reported once the record is deleted;
	/// the room-closed notification is best-effort and does not gate the
	/// result.
	pub async fn resolve_request(&self, caller: &Identity, room: &RoomId, resolver_name: &str) -> Result<(), ResolveError> {
		let resolver_name = resolver_name.trim();
		if resolver_name.is_empty() {
			return Err(ResolveError::MissingResolver);
		}

		let request = self
			.requests
			.get(room)
			.await
			.map_err(ResolveError::Store)?
			.ok_or_else(|| ResolveError::RequestNotFound(room.clone()))?;

		if request.owner != caller.user_id {
			metrics::counter!("helpline_server_resolutions_denied_total").increment(1);
			return Err(ResolveError::NotOwner);
		}

		let resolver = self
			.users
			.find_by_name(resolver_name)
			.await
			.map_err(ResolveError::Store)?
			.ok_or_else(|| ResolveError::ResolverNotFound(resolver_name.to_string()))?;

		// The one mutation of the reputation counter: a single conditional
		// update, not a read-modify-write over two calls.
		let credited = self
			.users
			.increment_helped(&resolver.name)
			.await
			.map_err(ResolveError::Store)?;
		if !credited {
			// The user vanished between lookup and update; nothing mutated.
			return Err(ResolveError::ResolverNotFound(resolver_name.to_string()));
		}

		match self.requests.delete(room).await {
			Ok(_) => {}
			Err(e) => {
				// Inconsistency window: the counter moved but the request
				// survived. Surfaced distinctly for manual reconciliation;
				// rollback is undefined once readers may have observed the
				// new counter value.
				metrics::counter!("helpline_server_resolutions_partial_total").increment(1);
				error!(
					room = %room,
					resolver = %resolver.name,
					error = %e,
					anomaly = "partial_completion",
					"request deletion failed after reputation increment"
				);
				return Err(ResolveError::PartialCompletion {
					resolver: resolver.name,
					source: e,
				});
			}
		}

		metrics::counter!("helpline_server_resolutions_total").increment(1);
		info!(room = %room, resolver = %resolver.name, owner = %caller.user_id, "help request resolved");

		self.registry.close_room(room, CLOSE_REASON_RESOLVED).await;

		Ok(())
	}
}
