#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use helpline_domain::{HelpRequest, Identity, RoomEvent, RoomId, User, UserId};
use tokio::time::timeout;

use crate::server::gateway::{Gateway, SendError};
use crate::server::registry::{RoomRegistry, RoomRegistryConfig};
use crate::server::store::{MemoryStore, MessageStore, RequestStore, UserStore};
use crate::server::workflow::{CLOSE_REASON_RESOLVED, ResolutionWorkflow, ResolveError};
use crate::util::time::unix_ms_now;

struct Fixture {
	store: Arc<MemoryStore>,
	gateway: Arc<Gateway>,
	workflow: Arc<ResolutionWorkflow>,
	room: RoomId,
	owner: Identity,
	helper: Identity,
}

async fn fixture() -> Fixture {
	let store = MemoryStore::new();
	let registry = RoomRegistry::new(RoomRegistryConfig::default());

	let requests: Arc<dyn RequestStore> = store.clone();
	let messages: Arc<dyn MessageStore> = store.clone();
	let users: Arc<dyn UserStore> = store.clone();

	let gateway = Gateway::new(registry.clone(), Arc::clone(&requests), messages);
	let workflow = ResolutionWorkflow::new(registry, requests, users);

	let room = RoomId::new("42").expect("valid RoomId");
	let owner = Identity::new(UserId::new_v4(), "Alice").expect("identity");
	let helper = Identity::new(UserId::new_v4(), "Bob").expect("identity");

	store
		.create(HelpRequest {
			id: room.clone(),
			owner: owner.user_id,
			title: "stuck on linker errors".to_string(),
			description: String::new(),
			created_at: unix_ms_now(),
		})
		.await
		.expect("create request");

	store
		.create_user(User {
			id: helper.user_id,
			name: helper.name.clone(),
			helped: 2,
		})
		.await
		.expect("create user");

	Fixture {
		store,
		gateway,
		workflow,
		room,
		owner,
		helper,
	}
}

async fn helped_count(store: &MemoryStore, name: &str) -> i64 {
	store
		.find_by_name(name)
		.await
		.expect("find user")
		.map(|u| u.helped)
		.unwrap_or(0)
}

#[tokio::test]
async fn resolution_credits_deletes_and_tears_down() {
	let fx = fixture().await;

	let mut conn_a = fx.gateway.connect(fx.room.clone(), &fx.owner).await.expect("connect A");
	let mut conn_b = fx.gateway.connect(fx.room.clone(), &fx.helper).await.expect("connect B");

	fx.workflow
		.resolve_request(&fx.owner, &fx.room, &fx.helper.name)
		.await
		.expect("resolve");

	// (a) the resolver's counter moved by exactly one.
	assert_eq!(helped_count(&fx.store, "Bob").await, 3);

	// (b) the record is gone, not flagged.
	assert!(fx.store.get(&fx.room).await.expect("get").is_none());

	// (c) every member receives exactly one terminal event.
	for conn in [&mut conn_a, &mut conn_b] {
		let event = timeout(Duration::from_millis(250), conn.recv())
			.await
			.expect("expected terminal event")
			.expect("stream open");
		match event {
			RoomEvent::Closed { reason } => assert_eq!(reason, CLOSE_REASON_RESOLVED),
			other => panic!("expected Closed event, got: {other:?}"),
		}
		let end = timeout(Duration::from_millis(250), conn.recv()).await.expect("stream should end");
		assert!(end.is_none());
	}

	// (d) the room no longer accepts messages.
	match fx.gateway.send_message(fx.room.clone(), &fx.owner, "anyone?").await {
		Err(SendError::RoomNotFound(_)) => {}
		other => panic!("expected RoomNotFound after resolution, got: {other:?}"),
	}
}

#[tokio::test]
async fn missing_resolver_name_is_rejected_before_any_lookup() {
	let fx = fixture().await;

	match fx.workflow.resolve_request(&fx.owner, &fx.room, "   ").await {
		Err(ResolveError::MissingResolver) => {}
		other => panic!("expected MissingResolver, got: {other:?}"),
	}

	assert_eq!(helped_count(&fx.store, "Bob").await, 2);
	assert!(fx.store.get(&fx.room).await.expect("get").is_some());
}

#[tokio::test]
async fn unknown_resolver_mutates_nothing() {
	let fx = fixture().await;

	match fx.workflow.resolve_request(&fx.owner, &fx.room, "Mallory").await {
		Err(ResolveError::ResolverNotFound(name)) => assert_eq!(name, "Mallory"),
		other => panic!("expected ResolverNotFound, got: {other:?}"),
	}

	assert_eq!(helped_count(&fx.store, "Bob").await, 2);
	assert!(fx.store.get(&fx.room).await.expect("get").is_some(), "request must remain intact");
}

#[tokio::test]
async fn only_the_owner_may_resolve() {
	let fx = fixture().await;

	match fx.workflow.resolve_request(&fx.helper, &fx.room, &fx.helper.name).await {
		Err(ResolveError::NotOwner) => {}
		other => panic!("expected NotOwner, got: {other:?}"),
	}

	assert_eq!(helped_count(&fx.store, "Bob").await, 2);
	assert!(fx.store.get(&fx.room).await.expect("get").is_some());
}

#[tokio::test]
async fn resolving_twice_reports_not_found() {
	let fx = fixture().await;

	fx.workflow
		.resolve_request(&fx.owner, &fx.room, &fx.helper.name)
		.await
		.expect("first resolve");

	match fx.workflow.resolve_request(&fx.owner, &fx.room, &fx.helper.name).await {
		Err(ResolveError::RequestNotFound(_)) => {}
		other => panic!("expected RequestNotFound, got: {other:?}"),
	}

	// The counter moved exactly once across both attempts.
	assert_eq!(helped_count(&fx.store, "Bob").await, 3);
}

/// Request store whose deletes always fail; reads and creates delegate.
struct DeleteFails {
	inner: Arc<MemoryStore>,
}

#[async_trait]
impl RequestStore for DeleteFails {
	async fn create(&self, req: HelpRequest) -> anyhow::Result<()> {
		self.inner.create(req).await
	}

	async fn get(&self, id: &RoomId) -> anyhow::Result<Option<HelpRequest>> {
		RequestStore::get(self.inner.as_ref(), id).await
	}

	async fn delete(&self, _id: &RoomId) -> anyhow::Result<bool> {
		Err(anyhow!("delete unavailable"))
	}
}

#[tokio::test]
async fn deletion_failure_surfaces_the_partial_completion_anomaly() {
	let store = MemoryStore::new();
	let registry = RoomRegistry::new(RoomRegistryConfig::default());

	let requests: Arc<dyn RequestStore> = Arc::new(DeleteFails {
		inner: Arc::clone(&store),
	});
	let messages: Arc<dyn MessageStore> = store.clone();
	let users: Arc<dyn UserStore> = store.clone();

	let gateway = Gateway::new(registry.clone(), Arc::clone(&requests), messages);
	let workflow = ResolutionWorkflow::new(registry, requests, users);

	let room = RoomId::new("42").expect("valid RoomId");
	let owner = Identity::new(UserId::new_v4(), "Alice").expect("identity");
	let helper = Identity::new(UserId::new_v4(), "Bob").expect("identity");

	store
		.create(HelpRequest {
			id: room.clone(),
			owner: owner.user_id,
			title: "stuck".to_string(),
			description: String::new(),
			created_at: unix_ms_now(),
		})
		.await
		.expect("create request");
	store
		.create_user(User {
			id: helper.user_id,
			name: helper.name.clone(),
			helped: 2,
		})
		.await
		.expect("create user");

	let mut conn = gateway.connect(room.clone(), &owner).await.expect("connect");

	match workflow.resolve_request(&owner, &room, "Bob").await {
		Err(ResolveError::PartialCompletion { resolver, .. }) => assert_eq!(resolver, "Bob"),
		other => panic!("expected PartialCompletion, got: {other:?}"),
	}

	// The recognized inconsistency: the counter moved, the request survived,
	// and the room was not torn down.
	assert_eq!(helped_count(&store, "Bob").await, 3);
	assert!(store.get(&room).await.expect("get").is_some());
	assert!(
		timeout(Duration::from_millis(50), conn.recv()).await.is_err(),
		"room must not close when resolution did not complete"
	);
}
