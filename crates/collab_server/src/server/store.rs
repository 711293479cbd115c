#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use collab_domain::{ChatRecord, RoomName};
use sqlx::sqlite::SqliteConnectOptions;
use tokio::sync::Mutex;

/// How many chat records a joining client receives, oldest first.
pub const CHAT_TAIL_LIMIT: usize = 50;

/// Narrow persistence contract the hub depends on.
///
/// Implementations are internally thread-safe; the hub calls them from
/// multiple background tasks concurrently. Per-room document writes must be
/// last-writer-wins (upsert keyed by room).
#[async_trait::async_trait]
pub trait Store: Send + Sync {
	/// Most recently persisted snapshot for a room, if any.
	async fn load_document(&self, room: &RoomName) -> anyhow::Result<Option<String>>;

	/// Upsert the snapshot for a room.
	async fn save_document(&self, room: &RoomName, content: &str) -> anyhow::Result<()>;

	/// Append one chat message.
	async fn append_chat(&self, room: &RoomName, sender: &str, message: &str) -> anyhow::Result<()>;

	/// Chat tail for a room, oldest first, at most `limit` records.
	async fn load_chat_tail(&self, room: &RoomName, limit: usize) -> anyhow::Result<Vec<ChatRecord>>;

	/// Record that a user visited a room just now, bumping the timestamp on
	/// repeat visits.
	async fn upsert_visit(&self, username: &str, room: &RoomName) -> anyhow::Result<()>;
}

fn unix_ms_now() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or(Duration::from_secs(0))
		.as_millis() as i64
}

/// sqlite-backed store.
#[derive(Clone)]
pub struct SqliteStore {
	pool: sqlx::SqlitePool,
}

impl SqliteStore {
	/// Connect and apply migrations. The database file is created when
	/// missing.
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		let opts = SqliteConnectOptions::from_str(database_url)
			.context("parse sqlite database url")?
			.create_if_missing(true);

		let pool = sqlx::SqlitePool::connect_with(opts).await.context("connect sqlite")?;
		sqlx::migrate!("./migrations").run(&pool).await.context("run sqlite migrations")?;

		Ok(Self { pool })
	}
}

#[async_trait::async_trait]
impl Store for SqliteStore {
	async fn load_document(&self, room: &RoomName) -> anyhow::Result<Option<String>> {
		let row: Option<(String,)> = sqlx::query_as("SELECT content FROM documents WHERE room_id = ?")
			.bind(room.as_str())
			.fetch_optional(&self.pool)
			.await
			.context("select document")?;

		Ok(row.map(|(content,)| content))
	}

	async fn save_document(&self, room: &RoomName, content: &str) -> anyhow::Result<()> {
		sqlx::query(
			"INSERT INTO documents (room_id, content, updated_at) VALUES (?, ?, ?) \
			ON CONFLICT(room_id) DO UPDATE SET content = excluded.content, updated_at = excluded.updated_at",
		)
		.bind(room.as_str())
		.bind(content)
		.bind(unix_ms_now())
		.execute(&self.pool)
		.await
		.context("upsert document")?;

		Ok(())
	}

	async fn append_chat(&self, room: &RoomName, sender: &str, message: &str) -> anyhow::Result<()> {
		sqlx::query("INSERT INTO messages (room_id, sender, content, created_at) VALUES (?, ?, ?, ?)")
			.bind(room.as_str())
			.bind(sender)
			.bind(message)
			.bind(unix_ms_now())
			.execute(&self.pool)
			.await
			.context("insert chat message")?;

		Ok(())
	}

	async fn load_chat_tail(&self, room: &RoomName, limit: usize) -> anyhow::Result<Vec<ChatRecord>> {
		// Newest-first page, reversed so the caller sees oldest first.
		let rows: Vec<(String, String)> =
			sqlx::query_as("SELECT sender, content FROM messages WHERE room_id = ? ORDER BY id DESC LIMIT ?")
				.bind(room.as_str())
				.bind(limit as i64)
				.fetch_all(&self.pool)
				.await
				.context("select chat tail")?;

		let mut records = rows
			.into_iter()
			.map(|(sender, content)| ChatRecord::new(sender, content))
			.collect::<Vec<_>>();
		records.reverse();
		Ok(records)
	}

	async fn upsert_visit(&self, username: &str, room: &RoomName) -> anyhow::Result<()> {
		sqlx::query(
			"INSERT INTO visits (username, room_id, last_visited) VALUES (?, ?, ?) \
			ON CONFLICT(username, room_id) DO UPDATE SET last_visited = excluded.last_visited",
		)
		.bind(username)
		.bind(room.as_str())
		.bind(unix_ms_now())
		.execute(&self.pool)
		.await
		.context("upsert visit")?;

		Ok(())
	}
}

/// In-memory store, used when persistence is disabled and as the test
/// backend.
#[derive(Default)]
pub struct MemoryStore {
	inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
	documents: HashMap<String, String>,
	messages: HashMap<String, Vec<ChatRecord>>,
	visits: HashMap<(String, String), i64>,
	document_saves: u64,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Seed a document snapshot, as if persisted by an earlier process.
	pub async fn seed_document(&self, room: &RoomName, content: impl Into<String>) {
		let mut inner = self.inner.lock().await;
		inner.documents.insert(room.as_str().to_string(), content.into());
	}

	/// Read back a persisted snapshot.
	pub async fn document(&self, room: &RoomName) -> Option<String> {
		self.inner.lock().await.documents.get(room.as_str()).cloned()
	}

	/// Total `save_document` calls observed.
	pub async fn document_save_count(&self) -> u64 {
		self.inner.lock().await.document_saves
	}

	/// Full chat log for a room, oldest first.
	pub async fn chat_log(&self, room: &RoomName) -> Vec<ChatRecord> {
		self.inner.lock().await.messages.get(room.as_str()).cloned().unwrap_or_default()
	}

	/// Timestamp of the recorded visit, if any.
	pub async fn visit(&self, username: &str, room: &RoomName) -> Option<i64> {
		self.inner
			.lock()
			.await
			.visits
			.get(&(username.to_string(), room.as_str().to_string()))
			.copied()
	}
}

#[async_trait::async_trait]
impl Store for MemoryStore {
	async fn load_document(&self, room: &RoomName) -> anyhow::Result<Option<String>> {
		Ok(self.inner.lock().await.documents.get(room.as_str()).cloned())
	}

	async fn save_document(&self, room: &RoomName, content: &str) -> anyhow::Result<()> {
		let mut inner = self.inner.lock().await;
		inner.documents.insert(room.as_str().to_string(), content.to_string());
		inner.document_saves += 1;
		Ok(())
	}

	async fn append_chat(&self, room: &RoomName, sender: &str, message: &str) -> anyhow::Result<()> {
		let mut inner = self.inner.lock().await;
		inner
			.messages
			.entry(room.as_str().to_string())
			.or_default()
			.push(ChatRecord::new(sender, message));
		Ok(())
	}

	async fn load_chat_tail(&self, room: &RoomName, limit: usize) -> anyhow::Result<Vec<ChatRecord>> {
		let inner = self.inner.lock().await;
		let log = inner.messages.get(room.as_str()).map(Vec::as_slice).unwrap_or_default();
		let start = log.len().saturating_sub(limit);
		Ok(log[start..].to_vec())
	}

	async fn upsert_visit(&self, username: &str, room: &RoomName) -> anyhow::Result<()> {
		let mut inner = self.inner.lock().await;
		inner
			.visits
			.insert((username.to_string(), room.as_str().to_string()), unix_ms_now());
		Ok(())
	}
}
