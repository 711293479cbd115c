#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::anyhow;
use collab_domain::{ChatRecord, ClientId, RoomName};
use collab_protocol::{MessageKind, WireMessage};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Utf8Bytes;

use crate::server::hub::{ClientHandle, Envelope, Hub, HubConfig, HubHandle};
use crate::server::store::{MemoryStore, Store};

fn test_config() -> HubConfig {
	HubConfig {
		persist_interval: Duration::from_millis(50),
		..HubConfig::default()
	}
}

fn start_hub(store: Arc<dyn Store>, cfg: HubConfig) -> HubHandle {
	let (hub, handle) = Hub::new(store, cfg);
	tokio::spawn(hub.run());
	handle
}

fn room(name: &str) -> RoomName {
	RoomName::new(name).expect("valid room name")
}

async fn join(hub: &HubHandle, room_name: &str, username: &str, capacity: usize) -> (ClientId, mpsc::Receiver<Utf8Bytes>) {
	let id = ClientId::new_v4();
	let (tx, rx) = mpsc::channel(capacity);
	hub.register(ClientHandle::new(id, username, room(room_name), tx))
		.await
		.expect("register");
	(id, rx)
}

fn decode(frame: &Utf8Bytes) -> WireMessage {
	WireMessage::decode(frame.as_str()).expect("decode frame")
}

/// Collect every frame that arrives until the queue stays quiet for 100ms.
async fn drain(rx: &mut mpsc::Receiver<Utf8Bytes>) -> Vec<WireMessage> {
	let mut out = Vec::new();
	while let Ok(Some(frame)) = timeout(Duration::from_millis(100), rx.recv()).await {
		out.push(decode(&frame));
	}
	out
}

async fn recv_frame(rx: &mut mpsc::Receiver<Utf8Bytes>) -> WireMessage {
	let frame = timeout(Duration::from_millis(500), rx.recv())
		.await
		.expect("expected a frame within timeout")
		.expect("channel open");
	decode(&frame)
}

fn doc_update_payload(content: &str, sender: ClientId) -> Utf8Bytes {
	Utf8Bytes::from(format!(
		r#"{{"type":"doc_update","content":"{content}","clientUUID":"{sender}"}}"#
	))
}

async fn send(hub: &HubHandle, room_name: &str, payload: Utf8Bytes, sender: Option<ClientId>) {
	hub.broadcast(Envelope {
		room: room(room_name),
		payload,
		sender,
	})
	.await
	.expect("broadcast");
}

#[tokio::test]
async fn join_receives_roster_then_snapshot_then_history() {
	let store = Arc::new(MemoryStore::new());
	store.seed_document(&room("r2"), "prior").await;
	store
		.append_chat(&room("r2"), "earlier", "hello from the past")
		.await
		.expect("seed chat");
	let hub = start_hub(store, test_config());

	let (_id, mut rx) = join(&hub, "r2", "C", 64).await;
	let frames = drain(&mut rx).await;

	assert_eq!(frames.len(), 4, "expected roster, snapshot, history, roster; got: {frames:?}");
	assert_eq!(frames[0].kind, MessageKind::UserList);
	assert_eq!(frames[0].users.as_deref(), Some(["C".to_string()].as_slice()));

	assert_eq!(frames[1].kind, MessageKind::DocUpdate);
	assert_eq!(frames[1].content.as_deref(), Some("prior"));
	assert_eq!(frames[1].sender.as_deref(), Some("System"));

	assert_eq!(frames[2].kind, MessageKind::ChatHistory);
	assert_eq!(
		frames[2].history.as_deref(),
		Some([ChatRecord::new("earlier", "hello from the past")].as_slice())
	);

	assert_eq!(frames[3].kind, MessageKind::UserList);
}

#[tokio::test]
async fn join_of_empty_room_sends_no_snapshot_and_no_history() {
	let hub = start_hub(Arc::new(MemoryStore::new()), test_config());

	let (_id, mut rx) = join(&hub, "fresh", "C", 64).await;
	let frames = drain(&mut rx).await;

	let kinds = frames.iter().map(|f| f.kind).collect::<Vec<_>>();
	assert_eq!(kinds, vec![MessageKind::UserList, MessageKind::UserList], "got: {frames:?}");
}

#[tokio::test]
async fn doc_update_is_suppressed_for_the_sender() {
	let store = Arc::new(MemoryStore::new());
	let hub = start_hub(Arc::clone(&store) as Arc<dyn Store>, test_config());

	let (a, mut rx_a) = join(&hub, "r1", "A", 256).await;
	let (_b, mut rx_b) = join(&hub, "r1", "B", 256).await;
	drain(&mut rx_a).await;
	drain(&mut rx_b).await;

	for i in 0..100 {
		send(&hub, "r1", doc_update_payload(&format!("rev-{i}"), a), Some(a)).await;
	}

	let mut received = 0;
	while let Ok(Some(frame)) = timeout(Duration::from_millis(200), rx_b.recv()).await {
		let msg = decode(&frame);
		assert_eq!(msg.kind, MessageKind::DocUpdate);
		received += 1;
		if received == 100 {
			break;
		}
	}
	assert_eq!(received, 100, "peer must see every update");

	let leaked = timeout(Duration::from_millis(150), rx_a.recv()).await;
	assert!(leaked.is_err(), "sender must never receive its own doc_update");
}

#[tokio::test]
async fn doc_update_suppression_falls_back_to_the_frame_uuid() {
	let hub = start_hub(Arc::new(MemoryStore::new()), test_config());

	let (a, mut rx_a) = join(&hub, "r1", "A", 64).await;
	let (_b, mut rx_b) = join(&hub, "r1", "B", 64).await;
	drain(&mut rx_a).await;
	drain(&mut rx_b).await;

	// No envelope sender, as after a reconnect race; the uuid in the frame
	// body is still honored.
	send(&hub, "r1", doc_update_payload("x", a), None).await;

	assert_eq!(recv_frame(&mut rx_b).await.kind, MessageKind::DocUpdate);
	let leaked = timeout(Duration::from_millis(150), rx_a.recv()).await;
	assert!(leaked.is_err(), "frame uuid alone must suppress the echo");
}

#[tokio::test]
async fn chat_echoes_to_everyone_and_is_appended() {
	let store = Arc::new(MemoryStore::new());
	let hub = start_hub(Arc::clone(&store) as Arc<dyn Store>, test_config());

	let (a, mut rx_a) = join(&hub, "r1", "A", 64).await;
	let (_b, mut rx_b) = join(&hub, "r1", "B", 64).await;
	drain(&mut rx_a).await;
	drain(&mut rx_b).await;

	let payload = Utf8Bytes::from(r#"{"type":"chat","sender":"A","message":"hi"}"#);
	send(&hub, "r1", payload, Some(a)).await;

	assert_eq!(recv_frame(&mut rx_a).await.kind, MessageKind::Chat);
	assert_eq!(recv_frame(&mut rx_b).await.kind, MessageKind::Chat);

	// The append is dispatched to a background task; poll for it.
	let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
	loop {
		let log = store.chat_log(&room("r1")).await;
		if log == vec![ChatRecord::new("A", "hi")] {
			break;
		}
		assert!(tokio::time::Instant::now() < deadline, "chat was not appended, log: {log:?}");
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
}

#[tokio::test]
async fn duplicate_username_kicks_the_older_session() {
	let hub = start_hub(Arc::new(MemoryStore::new()), test_config());

	let (_a1, mut rx_a1) = join(&hub, "r3", "alice", 64).await;
	drain(&mut rx_a1).await;

	let (_a2, mut rx_a2) = join(&hub, "r3", "alice", 64).await;

	// The old session's queue is closed by the hub; drain whatever was left
	// and expect the closed marker.
	let closed = timeout(Duration::from_millis(500), async {
		while let Some(_frame) = rx_a1.recv().await {}
	})
	.await;
	assert!(closed.is_ok(), "old queue must be closed after the kick");

	let frames = drain(&mut rx_a2).await;
	for frame in &frames {
		if frame.kind == MessageKind::UserList {
			assert_eq!(
				frame.users.as_deref(),
				Some(["alice".to_string()].as_slice()),
				"roster must hold exactly the new session"
			);
		}
	}
}

#[tokio::test]
async fn dirty_room_is_persisted_once_per_tick() {
	let store = Arc::new(MemoryStore::new());
	let hub = start_hub(Arc::clone(&store) as Arc<dyn Store>, test_config());

	let (a, mut rx_a) = join(&hub, "r1", "A", 64).await;
	drain(&mut rx_a).await;

	send(&hub, "r1", doc_update_payload("draft", a), Some(a)).await;
	send(&hub, "r1", doc_update_payload("final", a), Some(a)).await;

	tokio::time::sleep(Duration::from_millis(200)).await;
	assert_eq!(store.document(&room("r1")).await.as_deref(), Some("final"));
	assert_eq!(store.document_save_count().await, 1, "one save per dirty window");

	// No further updates: the room is clean and must not be re-saved.
	tokio::time::sleep(Duration::from_millis(150)).await;
	assert_eq!(store.document_save_count().await, 1);
}

#[tokio::test]
async fn shutdown_flushes_every_room_before_acking() {
	let store = Arc::new(MemoryStore::new());
	let cfg = HubConfig {
		// Far beyond the test: nothing persists until the flush.
		persist_interval: Duration::from_secs(600),
		..HubConfig::default()
	};
	let hub = start_hub(Arc::clone(&store) as Arc<dyn Store>, cfg);

	let mut receivers = Vec::new();
	for name in ["s1", "s2", "s3"] {
		let (id, mut rx) = join(&hub, name, "writer", 64).await;
		drain(&mut rx).await;
		send(&hub, name, doc_update_payload(&format!("{name}-latest"), id), Some(id)).await;
		receivers.push(rx);
	}

	hub.shutdown().await.expect("flush on shutdown");

	for name in ["s1", "s2", "s3"] {
		assert_eq!(
			store.document(&room(name)).await.as_deref(),
			Some(format!("{name}-latest").as_str())
		);
	}
}

#[tokio::test]
async fn stuck_peer_does_not_stall_the_room() {
	let hub = start_hub(Arc::new(MemoryStore::new()), test_config());

	// The stuck peer's queue fills after two frames and is never drained.
	let stuck_id = ClientId::new_v4();
	let (stuck_tx, _rx_stuck_kept) = mpsc::channel(2);
	hub.register(ClientHandle::new(stuck_id, "stuck", room("r4"), stuck_tx))
		.await
		.expect("register");

	let (sender, mut rx_sender) = join(&hub, "r4", "writer", 8).await;
	let (_healthy, mut rx_healthy) = join(&hub, "r4", "healthy", 512).await;
	drain(&mut rx_sender).await;
	drain(&mut rx_healthy).await;

	let started = tokio::time::Instant::now();
	for i in 0..200 {
		send(&hub, "r4", doc_update_payload(&format!("rev-{i}"), sender), Some(sender)).await;
	}

	let mut received = 0;
	while received < 200 {
		let frame = timeout(Duration::from_millis(500), rx_healthy.recv())
			.await
			.expect("healthy peer must keep receiving")
			.expect("channel open");
		let _ = frame;
		received += 1;
	}
	assert!(
		started.elapsed() < Duration::from_secs(5),
		"fan-out must not wait on the stuck peer"
	);
}

#[tokio::test]
async fn unknown_type_fans_out_verbatim_with_no_state_change() {
	let store = Arc::new(MemoryStore::new());
	let hub = start_hub(Arc::clone(&store) as Arc<dyn Store>, test_config());

	let (a, mut rx_a) = join(&hub, "r6", "A", 64).await;
	let (_b, mut rx_b) = join(&hub, "r6", "B", 64).await;
	drain(&mut rx_a).await;
	drain(&mut rx_b).await;

	let payload = r#"{"type":"cursor_update","sender":"A","cursor":42}"#;
	send(&hub, "r6", Utf8Bytes::from(payload), Some(a)).await;

	let frame_a = timeout(Duration::from_millis(500), rx_a.recv())
		.await
		.expect("sender receives cursor updates too")
		.expect("channel open");
	let frame_b = timeout(Duration::from_millis(500), rx_b.recv())
		.await
		.expect("peer receives cursor updates")
		.expect("channel open");
	assert_eq!(frame_a.as_str(), payload, "bytes must pass through unchanged");
	assert_eq!(frame_b.as_str(), payload);

	tokio::time::sleep(Duration::from_millis(150)).await;
	assert_eq!(store.document_save_count().await, 0, "cursor updates never dirty a room");
	assert_eq!(store.document(&room("r6")).await, None);
}

#[tokio::test]
async fn malformed_frame_fans_out_verbatim() {
	let store = Arc::new(MemoryStore::new());
	let hub = start_hub(Arc::clone(&store) as Arc<dyn Store>, test_config());

	let (a, mut rx_a) = join(&hub, "r6", "A", 64).await;
	drain(&mut rx_a).await;

	send(&hub, "r6", Utf8Bytes::from("definitely not json"), Some(a)).await;

	let frame = timeout(Duration::from_millis(500), rx_a.recv())
		.await
		.expect("malformed frames still fan out")
		.expect("channel open");
	assert_eq!(frame.as_str(), "definitely not json");

	tokio::time::sleep(Duration::from_millis(150)).await;
	assert_eq!(store.document_save_count().await, 0);
}

#[tokio::test]
async fn unregister_is_idempotent() {
	let hub = start_hub(Arc::new(MemoryStore::new()), test_config());

	let (a, mut rx_a) = join(&hub, "r7", "A", 64).await;
	let (_b, mut rx_b) = join(&hub, "r7", "B", 64).await;
	drain(&mut rx_a).await;
	drain(&mut rx_b).await;

	hub.unregister(room("r7"), a).await.expect("unregister");
	hub.unregister(room("r7"), a).await.expect("double unregister");

	let frames = drain(&mut rx_b).await;
	let rosters = frames.iter().filter(|f| f.kind == MessageKind::UserList).collect::<Vec<_>>();
	assert_eq!(rosters.len(), 1, "exactly one roster update per departure, got: {frames:?}");
	assert_eq!(rosters[0].users.as_deref(), Some(["B".to_string()].as_slice()));
}

#[tokio::test]
async fn broadcast_to_unknown_room_is_dropped() {
	let hub = start_hub(Arc::new(MemoryStore::new()), test_config());

	send(&hub, "nowhere", Utf8Bytes::from(r#"{"type":"chat"}"#), None).await;

	// The hub is still serving.
	let (_id, mut rx) = join(&hub, "somewhere", "A", 64).await;
	assert_eq!(recv_frame(&mut rx).await.kind, MessageKind::UserList);
}

#[tokio::test]
async fn empty_clean_room_is_reclaimed_and_reseeded_from_the_store() {
	let store = Arc::new(MemoryStore::new());
	store.seed_document(&room("r8"), "first").await;
	let hub = start_hub(Arc::clone(&store) as Arc<dyn Store>, test_config());

	let (a, mut rx_a) = join(&hub, "r8", "A", 64).await;
	let frames = drain(&mut rx_a).await;
	assert!(frames.iter().any(|f| f.content.as_deref() == Some("first")));

	hub.unregister(room("r8"), a).await.expect("unregister");
	tokio::time::sleep(Duration::from_millis(50)).await;

	// A reclaimed room reloads whatever the store holds now.
	store.seed_document(&room("r8"), "second").await;
	let (_a2, mut rx_a2) = join(&hub, "r8", "A", 64).await;
	let frames = drain(&mut rx_a2).await;
	assert!(
		frames.iter().any(|f| f.content.as_deref() == Some("second")),
		"rejoin must see the reloaded snapshot, got: {frames:?}"
	);
}

/// Store wrapper that fails `save_document` while the flag is set.
struct FlakyStore {
	inner: MemoryStore,
	fail_saves: AtomicBool,
}

#[async_trait::async_trait]
impl Store for FlakyStore {
	async fn load_document(&self, room: &RoomName) -> anyhow::Result<Option<String>> {
		self.inner.load_document(room).await
	}

	async fn save_document(&self, room: &RoomName, content: &str) -> anyhow::Result<()> {
		if self.fail_saves.load(Ordering::Relaxed) {
			return Err(anyhow!("injected save failure"));
		}
		self.inner.save_document(room, content).await
	}

	async fn append_chat(&self, room: &RoomName, sender: &str, message: &str) -> anyhow::Result<()> {
		self.inner.append_chat(room, sender, message).await
	}

	async fn load_chat_tail(&self, room: &RoomName, limit: usize) -> anyhow::Result<Vec<ChatRecord>> {
		self.inner.load_chat_tail(room, limit).await
	}

	async fn upsert_visit(&self, username: &str, room: &RoomName) -> anyhow::Result<()> {
		self.inner.upsert_visit(username, room).await
	}
}

#[tokio::test]
async fn failed_save_re_marks_the_room_and_retries() {
	let store = Arc::new(FlakyStore {
		inner: MemoryStore::new(),
		fail_saves: AtomicBool::new(true),
	});
	let hub = start_hub(Arc::clone(&store) as Arc<dyn Store>, test_config());

	let (a, mut rx_a) = join(&hub, "r9", "A", 64).await;
	drain(&mut rx_a).await;
	send(&hub, "r9", doc_update_payload("precious", a), Some(a)).await;

	// First tick fails and must re-mark the room.
	tokio::time::sleep(Duration::from_millis(150)).await;
	assert_eq!(store.inner.document(&room("r9")).await, None);

	store.fail_saves.store(false, Ordering::Relaxed);
	tokio::time::sleep(Duration::from_millis(200)).await;
	assert_eq!(
		store.inner.document(&room("r9")).await.as_deref(),
		Some("precious"),
		"a later tick must retry the failed save"
	);
}
