#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use helpline_domain::{HelpRequest, RoomId, StoredMessage, User, UserId};
use tokio::sync::Mutex;

/// Input record for a message append; the store assigns `created_at`.
#[derive(Debug, Clone)]
pub struct NewMessage {
	pub room: RoomId,
	pub sender_name: String,
	pub sender_id: Option<UserId>,
	pub body: String,
}

/// Durable append-only log of chat messages per room.
#[async_trait]
pub trait MessageStore: Send + Sync {
	/// Append `msg`, stamping it with a per-room monotonic timestamp:
	/// `max(now_ms, previous + 1)` whenever the clock is at or behind the
	/// last stored message of the room.
	async fn append(&self, msg: NewMessage, now_ms: i64) -> anyhow::Result<StoredMessage>;

	/// All messages of a room in `created_at` ascending order.
	async fn list(&self, room: &RoomId) -> anyhow::Result<Vec<StoredMessage>>;
}

/// Durable record of help requests. A stored request is open; resolution
/// deletes the record.
#[async_trait]
pub trait RequestStore: Send + Sync {
	async fn create(&self, req: HelpRequest) -> anyhow::Result<()>;
	async fn get(&self, id: &RoomId) -> anyhow::Result<Option<HelpRequest>>;

	/// Returns `false` when no such record existed.
	async fn delete(&self, id: &RoomId) -> anyhow::Result<bool>;
}

/// User records and the `helped` reputation counter.
#[async_trait]
pub trait UserStore: Send + Sync {
	async fn create_user(&self, user: User) -> anyhow::Result<()>;
	async fn find_by_name(&self, name: &str) -> anyhow::Result<Option<User>>;

	/// Single conditional `helped = helped + 1` update; returns `false` when
	/// no row matched `name`.
	async fn increment_helped(&self, name: &str) -> anyhow::Result<bool>;
}

/// In-memory store for tests and for running without persistence.
#[derive(Default)]
pub struct MemoryStore {
	inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
	messages: HashMap<RoomId, Vec<StoredMessage>>,
	requests: HashMap<RoomId, HelpRequest>,
	users: HashMap<String, User>,
}

impl MemoryStore {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	/// Total stored message count across all rooms (test helper).
	pub async fn message_count(&self) -> usize {
		let inner = self.inner.lock().await;
		inner.messages.values().map(Vec::len).sum()
	}
}

#[async_trait]
impl MessageStore for MemoryStore {
	async fn append(&self, msg: NewMessage, now_ms: i64) -> anyhow::Result<StoredMessage> {
		let mut inner = self.inner.lock().await;
		let log = inner.messages.entry(msg.room.clone()).or_default();
		let previous = log.last().map(|m| m.created_at).unwrap_or(i64::MIN);
		let created_at = now_ms.max(previous.saturating_add(1));

		let stored = StoredMessage {
			room: msg.room,
			sender_name: msg.sender_name,
			sender_id: msg.sender_id,
			body: msg.body,
			created_at,
		};
		log.push(stored.clone());
		Ok(stored)
	}

	async fn list(&self, room: &RoomId) -> anyhow::Result<Vec<StoredMessage>> {
		let inner = self.inner.lock().await;
		Ok(inner.messages.get(room).cloned().unwrap_or_default())
	}
}

#[async_trait]
impl RequestStore for MemoryStore {
	async fn create(&self, req: HelpRequest) -> anyhow::Result<()> {
		let mut inner = self.inner.lock().await;
		if inner.requests.contains_key(&req.id) {
			return Err(anyhow!("help request already exists: {}", req.id));
		}
		inner.requests.insert(req.id.clone(), req);
		Ok(())
	}

	async fn get(&self, id: &RoomId) -> anyhow::Result<Option<HelpRequest>> {
		let inner = self.inner.lock().await;
		Ok(inner.requests.get(id).cloned())
	}

	async fn delete(&self, id: &RoomId) -> anyhow::Result<bool> {
		let mut inner = self.inner.lock().await;
		Ok(inner.requests.remove(id).is_some())
	}
}

#[async_trait]
impl UserStore for MemoryStore {
	async fn create_user(&self, user: User) -> anyhow::Result<()> {
		let mut inner = self.inner.lock().await;
		if inner.users.contains_key(&user.name) {
			return Err(anyhow!("user already exists: {}", user.name));
		}
		inner.users.insert(user.name.clone(), user);
		Ok(())
	}

	async fn find_by_name(&self, name: &str) -> anyhow::Result<Option<User>> {
		let inner = self.inner.lock().await;
		Ok(inner.users.get(name).cloned())
	}

	async fn increment_helped(&self, name: &str) -> anyhow::Result<bool> {
		let mut inner = self.inner.lock().await;
		match inner.users.get_mut(name) {
			Some(user) => {
				user.helped += 1;
				Ok(true)
			}
			None => Ok(false),
		}
	}
}

/// Persistent store over sqlx, selected by `database_url` scheme.
#[derive(Clone)]
pub struct Storage {
	backend: StorageBackend,
}

#[derive(Clone)]
enum StorageBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
	Mysql(sqlx::MySqlPool),
}

impl Storage {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			// Every pooled connection to an in-memory sqlite URL opens its
			// own empty database; pin those to a single connection.
			let pool = if database_url.contains(":memory:") || database_url.contains("mode=memory") {
				sqlx::sqlite::SqlitePoolOptions::new()
					.max_connections(1)
					.connect(database_url)
					.await
					.context("connect sqlite")?
			} else {
				sqlx::SqlitePool::connect(database_url).await.context("connect sqlite")?
			};
			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;

			Ok(Self {
				backend: StorageBackend::Sqlite(pool),
			})
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;

			Ok(Self {
				backend: StorageBackend::Postgres(pool),
			})
		} else if database_url.starts_with("mysql:") || database_url.starts_with("mariadb:") {
			let pool = sqlx::MySqlPool::connect(database_url).await.context("connect mysql")?;
			sqlx::migrate!("migrations/mysql")
				.run(&pool)
				.await
				.context("run mysql migrations")?;

			Ok(Self {
				backend: StorageBackend::Mysql(pool),
			})
		} else {
			Err(anyhow!("unsupported database_url (use sqlite:, postgres:, mysql:)"))
		}
	}
}

fn decode_message(room: &RoomId, row: (String, Option<String>, String, i64)) -> anyhow::Result<StoredMessage> {
	let (sender_name, sender_id, body, created_at) = row;
	let sender_id = match sender_id {
		Some(s) => Some(UserId::parse(&s).map_err(|e| anyhow!("stored sender_id: {e}"))?),
		None => None,
	};
	Ok(StoredMessage {
		room: room.clone(),
		sender_name,
		sender_id,
		body,
		created_at,
	})
}

#[async_trait]
impl MessageStore for Storage {
	async fn append(&self, msg: NewMessage, now_ms: i64) -> anyhow::Result<StoredMessage> {
		let room = msg.room.clone();
		let sender_id = msg.sender_id.map(|id| id.to_string());

		let created_at = match &self.backend {
			StorageBackend::Sqlite(pool) => {
				let mut tx = pool.begin().await.context("begin sqlite tx")?;
				let row: (i64,) = sqlx::query_as(
					"SELECT COALESCE(MAX(created_at), 0) FROM chat_messages WHERE room_id = ?",
				)
				.bind(room.as_str())
				.fetch_one(&mut *tx)
				.await
				.context("select last message time (sqlite)")?;

				let created_at = if now_ms > row.0 { now_ms } else { row.0 + 1 };
				sqlx::query(
					"INSERT INTO chat_messages (room_id, sender_name, sender_id, body, created_at) VALUES (?, ?, ?, ?, ?)",
				)
				.bind(room.as_str())
				.bind(&msg.sender_name)
				.bind(sender_id.as_deref())
				.bind(&msg.body)
				.bind(created_at)
				.execute(&mut *tx)
				.await
				.context("insert chat message (sqlite)")?;

				tx.commit().await.context("commit sqlite tx")?;
				created_at
			}
			StorageBackend::Postgres(pool) => {
				let mut tx = pool.begin().await.context("begin postgres tx")?;
				let row: (i64,) = sqlx::query_as(
					"SELECT COALESCE(MAX(created_at), 0) FROM chat_messages WHERE room_id = $1",
				)
				.bind(room.as_str())
				.fetch_one(&mut *tx)
				.await
				.context("select last message time (postgres)")?;

				let created_at = if now_ms > row.0 { now_ms } else { row.0 + 1 };
				sqlx::query(
					"INSERT INTO chat_messages (room_id, sender_name, sender_id, body, created_at) VALUES ($1, $2, $3, $4, $5)",
				)
				.bind(room.as_str())
				.bind(&msg.sender_name)
				.bind(sender_id.as_deref())
				.bind(&msg.body)
				.bind(created_at)
				.execute(&mut *tx)
				.await
				.context("insert chat message (postgres)")?;

				tx.commit().await.context("commit postgres tx")?;
				created_at
			}
			StorageBackend::Mysql(pool) => {
				let mut tx = pool.begin().await.context("begin mysql tx")?;
				let row: (i64,) = sqlx::query_as(
					"SELECT COALESCE(MAX(created_at), 0) FROM chat_messages WHERE room_id = ?",
				)
				.bind(room.as_str())
				.fetch_one(&mut *tx)
				.await
				.context("select last message time (mysql)")?;

				let created_at = if now_ms > row.0 { now_ms } else { row.0 + 1 };
				sqlx::query(
					"INSERT INTO chat_messages (room_id, sender_name, sender_id, body, created_at) VALUES (?, ?, ?, ?, ?)",
				)
				.bind(room.as_str())
				.bind(&msg.sender_name)
				.bind(sender_id.as_deref())
				.bind(&msg.body)
				.bind(created_at)
				.execute(&mut *tx)
				.await
				.context("insert chat message (mysql)")?;

				tx.commit().await.context("commit mysql tx")?;
				created_at
			}
		};

		Ok(StoredMessage {
			room: msg.room,
			sender_name: msg.sender_name,
			sender_id: msg.sender_id,
			body: msg.body,
			created_at,
		})
	}

	async fn list(&self, room: &RoomId) -> anyhow::Result<Vec<StoredMessage>> {
		let rows: Vec<(String, Option<String>, String, i64)> = match &self.backend {
			StorageBackend::Sqlite(pool) => sqlx::query_as(
				"SELECT sender_name, sender_id, body, created_at FROM chat_messages WHERE room_id = ? ORDER BY created_at ASC, id ASC",
			)
			.bind(room.as_str())
			.fetch_all(pool)
			.await
			.context("select chat messages (sqlite)")?,
			StorageBackend::Postgres(pool) => sqlx::query_as(
				"SELECT sender_name, sender_id, body, created_at FROM chat_messages WHERE room_id = $1 ORDER BY created_at ASC, id ASC",
			)
			.bind(room.as_str())
			.fetch_all(pool)
			.await
			.context("select chat messages (postgres)")?,
			StorageBackend::Mysql(pool) => sqlx::query_as(
				"SELECT sender_name, sender_id, body, created_at FROM chat_messages WHERE room_id = ? ORDER BY created_at ASC, id ASC",
			)
			.bind(room.as_str())
			.fetch_all(pool)
			.await
			.context("select chat messages (mysql)")?,
		};

		rows.into_iter().map(|row| decode_message(room, row)).collect()
	}
}

#[async_trait]
impl RequestStore for Storage {
	async fn create(&self, req: HelpRequest) -> anyhow::Result<()> {
		let owner = req.owner.to_string();
		match &self.backend {
			StorageBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO help_requests (id, owner_id, title, description, created_at) VALUES (?, ?, ?, ?, ?)",
				)
				.bind(req.id.as_str())
				.bind(&owner)
				.bind(&req.title)
				.bind(&req.description)
				.bind(req.created_at)
				.execute(pool)
				.await
				.context("insert help request (sqlite)")?;
			}
			StorageBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO help_requests (id, owner_id, title, description, created_at) VALUES ($1, $2, $3, $4, $5)",
				)
				.bind(req.id.as_str())
				.bind(&owner)
				.bind(&req.title)
				.bind(&req.description)
				.bind(req.created_at)
				.execute(pool)
				.await
				.context("insert help request (postgres)")?;
			}
			StorageBackend::Mysql(pool) => {
				sqlx::query(
					"INSERT INTO help_requests (id, owner_id, title, description, created_at) VALUES (?, ?, ?, ?, ?)",
				)
				.bind(req.id.as_str())
				.bind(&owner)
				.bind(&req.title)
				.bind(&req.description)
				.bind(req.created_at)
				.execute(pool)
				.await
				.context("insert help request (mysql)")?;
			}
		}
		Ok(())
	}

	async fn get(&self, id: &RoomId) -> anyhow::Result<Option<HelpRequest>> {
		let row: Option<(String, String, String, i64)> = match &self.backend {
			StorageBackend::Sqlite(pool) => sqlx::query_as(
				"SELECT owner_id, title, description, created_at FROM help_requests WHERE id = ?",
			)
			.bind(id.as_str())
			.fetch_optional(pool)
			.await
			.context("select help request (sqlite)")?,
			StorageBackend::Postgres(pool) => sqlx::query_as(
				"SELECT owner_id, title, description, created_at FROM help_requests WHERE id = $1",
			)
			.bind(id.as_str())
			.fetch_optional(pool)
			.await
			.context("select help request (postgres)")?,
			StorageBackend::Mysql(pool) => sqlx::query_as(
				"SELECT owner_id, title, description, created_at FROM help_requests WHERE id = ?",
			)
			.bind(id.as_str())
			.fetch_optional(pool)
			.await
			.context("select help request (mysql)")?,
		};

		match row {
			Some((owner_id, title, description, created_at)) => {
				let owner = UserId::parse(&owner_id).map_err(|e| anyhow!("stored owner_id: {e}"))?;
				Ok(Some(HelpRequest {
					id: id.clone(),
					owner,
					title,
					description,
					created_at,
				}))
			}
			None => Ok(None),
		}
	}

	async fn delete(&self, id: &RoomId) -> anyhow::Result<bool> {
		let affected = match &self.backend {
			StorageBackend::Sqlite(pool) => sqlx::query("DELETE FROM help_requests WHERE id = ?")
				.bind(id.as_str())
				.execute(pool)
				.await
				.context("delete help request (sqlite)")?
				.rows_affected(),
			StorageBackend::Postgres(pool) => sqlx::query("DELETE FROM help_requests WHERE id = $1")
				.bind(id.as_str())
				.execute(pool)
				.await
				.context("delete help request (postgres)")?
				.rows_affected(),
			StorageBackend::Mysql(pool) => sqlx::query("DELETE FROM help_requests WHERE id = ?")
				.bind(id.as_str())
				.execute(pool)
				.await
				.context("delete help request (mysql)")?
				.rows_affected(),
		};
		Ok(affected > 0)
	}
}

#[async_trait]
impl UserStore for Storage {
	async fn create_user(&self, user: User) -> anyhow::Result<()> {
		let id = user.id.to_string();
		match &self.backend {
			StorageBackend::Sqlite(pool) => {
				sqlx::query("INSERT INTO users (id, name, helped) VALUES (?, ?, ?)")
					.bind(&id)
					.bind(&user.name)
					.bind(user.helped)
					.execute(pool)
					.await
					.context("insert user (sqlite)")?;
			}
			StorageBackend::Postgres(pool) => {
				sqlx::query("INSERT INTO users (id, name, helped) VALUES ($1, $2, $3)")
					.bind(&id)
					.bind(&user.name)
					.bind(user.helped)
					.execute(pool)
					.await
					.context("insert user (postgres)")?;
			}
			StorageBackend::Mysql(pool) => {
				sqlx::query("INSERT INTO users (id, name, helped) VALUES (?, ?, ?)")
					.bind(&id)
					.bind(&user.name)
					.bind(user.helped)
					.execute(pool)
					.await
					.context("insert user (mysql)")?;
			}
		}
		Ok(())
	}

	async fn find_by_name(&self, name: &str) -> anyhow::Result<Option<User>> {
		let row: Option<(String, String, i64)> = match &self.backend {
			StorageBackend::Sqlite(pool) => sqlx::query_as("SELECT id, name, helped FROM users WHERE name = ?")
				.bind(name)
				.fetch_optional(pool)
				.await
				.context("select user (sqlite)")?,
			StorageBackend::Postgres(pool) => sqlx::query_as("SELECT id, name, helped FROM users WHERE name = $1")
				.bind(name)
				.fetch_optional(pool)
				.await
				.context("select user (postgres)")?,
			StorageBackend::Mysql(pool) => sqlx::query_as("SELECT id, name, helped FROM users WHERE name = ?")
				.bind(name)
				.fetch_optional(pool)
				.await
				.context("select user (mysql)")?,
		};

		match row {
			Some((id, name, helped)) => {
				let id = UserId::parse(&id).map_err(|e| anyhow!("stored user id: {e}"))?;
				Ok(Some(User { id, name, helped }))
			}
			None => Ok(None),
		}
	}

	async fn increment_helped(&self, name: &str) -> anyhow::Result<bool> {
		let affected = match &self.backend {
			StorageBackend::Sqlite(pool) => sqlx::query("UPDATE users SET helped = helped + 1 WHERE name = ?")
				.bind(name)
				.execute(pool)
				.await
				.context("increment helped (sqlite)")?
				.rows_affected(),
			StorageBackend::Postgres(pool) => sqlx::query("UPDATE users SET helped = helped + 1 WHERE name = $1")
				.bind(name)
				.execute(pool)
				.await
				.context("increment helped (postgres)")?
				.rows_affected(),
			StorageBackend::Mysql(pool) => sqlx::query("UPDATE users SET helped = helped + 1 WHERE name = ?")
				.bind(name)
				.execute(pool)
				.await
				.context("increment helped (mysql)")?
				.rows_affected(),
		};
		Ok(affected > 0)
	}
}
