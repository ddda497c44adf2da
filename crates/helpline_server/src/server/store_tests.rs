#![forbid(unsafe_code)]

use helpline_domain::{HelpRequest, RoomId, User, UserId};
use proptest::prelude::*;

use crate::server::store::{MemoryStore, MessageStore, NewMessage, RequestStore, Storage, UserStore};

fn room(id: &str) -> RoomId {
	RoomId::new(id).expect("valid RoomId")
}

fn new_message(room: &RoomId, body: &str) -> NewMessage {
	NewMessage {
		room: room.clone(),
		sender_name: "User".to_string(),
		sender_id: Some(UserId::new_v4()),
		body: body.to_string(),
	}
}

#[tokio::test]
async fn append_stamps_monotonic_timestamps() {
	let store = MemoryStore::new();
	let room = room("42");

	let first = store.append(new_message(&room, "a"), 100).await.expect("append");
	assert_eq!(first.created_at, 100);

	// Clock regression: the stamp never goes backwards.
	let second = store.append(new_message(&room, "b"), 50).await.expect("append");
	assert_eq!(second.created_at, 101);

	let third = store.append(new_message(&room, "c"), 102).await.expect("append");
	assert_eq!(third.created_at, 102);

	let listed = store.list(&room).await.expect("list");
	let stamps: Vec<_> = listed.iter().map(|m| m.created_at).collect();
	assert_eq!(stamps, [100, 101, 102]);
}

#[tokio::test]
async fn rooms_stamp_independently() {
	let store = MemoryStore::new();
	let room_a = room("a");
	let room_b = room("b");

	store.append(new_message(&room_a, "a-1"), 500).await.expect("append");
	let b = store.append(new_message(&room_b, "b-1"), 10).await.expect("append");

	// Room B's clock is not dragged forward by room A's history.
	assert_eq!(b.created_at, 10);
}

proptest! {
	/// For any clock sequence, per-room stamps are strictly increasing and
	/// never behind the clock value handed to the append.
	#[test]
	fn stamps_are_strictly_increasing(clocks in proptest::collection::vec(0i64..2_000, 1..40)) {
		let rt = tokio::runtime::Builder::new_current_thread()
			.build()
			.expect("runtime");

		rt.block_on(async move {
			let store = MemoryStore::new();
			let room = RoomId::new("prop").expect("valid RoomId");

			let mut previous = i64::MIN;
			for (i, now) in clocks.into_iter().enumerate() {
				let stored = store
					.append(new_message(&room, &format!("m{i}")), now)
					.await
					.expect("append");
				prop_assert!(stored.created_at > previous, "stamp went backwards");
				prop_assert!(stored.created_at >= now, "stamp is behind the clock");
				previous = stored.created_at;
			}
			Ok(())
		})?;
	}
}

async fn sqlite_storage() -> Storage {
	Storage::connect("sqlite::memory:").await.expect("connect sqlite")
}

#[tokio::test]
async fn sqlite_message_roundtrip_and_ordering() {
	let storage = sqlite_storage().await;
	let room = room("42");

	let first = storage.append(new_message(&room, "hi"), 100).await.expect("append");
	let second = storage.append(new_message(&room, "hello"), 60).await.expect("append");
	assert_eq!(first.created_at, 100);
	assert_eq!(second.created_at, 101, "regressed clock must still move forward");

	let listed = storage.list(&room).await.expect("list");
	let bodies: Vec<_> = listed.iter().map(|m| m.body.as_str()).collect();
	assert_eq!(bodies, ["hi", "hello"]);
	assert!(listed[0].created_at < listed[1].created_at);
	assert_eq!(listed[0].sender_id, first.sender_id);
}

#[tokio::test]
async fn sqlite_request_lifecycle() {
	let storage = sqlite_storage().await;
	let room = room("42");
	let owner = UserId::new_v4();

	storage
		.create(HelpRequest {
			id: room.clone(),
			owner,
			title: "borrowck fight".to_string(),
			description: "E0502 everywhere".to_string(),
			created_at: 1_700_000_000_000,
		})
		.await
		.expect("create");

	let loaded = storage.get(&room).await.expect("get").expect("present");
	assert_eq!(loaded.owner, owner);
	assert_eq!(loaded.title, "borrowck fight");

	assert!(storage.delete(&room).await.expect("delete"));
	assert!(storage.get(&room).await.expect("get").is_none());
	assert!(!storage.delete(&room).await.expect("second delete"), "second delete affects nothing");
}

#[tokio::test]
async fn sqlite_helped_counter_is_a_single_conditional_update() {
	let storage = sqlite_storage().await;

	storage
		.create_user(User {
			id: UserId::new_v4(),
			name: "Bob".to_string(),
			helped: 2,
		})
		.await
		.expect("create user");

	assert!(storage.increment_helped("Bob").await.expect("increment"));
	let bob = storage.find_by_name("Bob").await.expect("find").expect("present");
	assert_eq!(bob.helped, 3);

	assert!(!storage.increment_helped("Mallory").await.expect("increment unknown"));
	assert!(storage.find_by_name("Mallory").await.expect("find").is_none());
}
