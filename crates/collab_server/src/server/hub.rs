#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use collab_domain::{ClientId, RoomName};
use collab_protocol::{MessageKind, WireMessage};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Utf8Bytes;
use tracing::{debug, error, info, warn};

use crate::server::store::Store;

/// Outbound queue depth per client; overflow is a silent per-recipient drop.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Sender name attached to the snapshot a joining client receives.
const SYSTEM_SENDER: &str = "System";

/// Hub tuning knobs.
#[derive(Debug, Clone)]
pub struct HubConfig {
	/// Dirty-document flush cadence.
	pub persist_interval: Duration,

	/// Capacity of the hub's tagged-event queue.
	pub event_queue_capacity: usize,

	/// Chat records handed to a joining client.
	pub chat_tail_limit: usize,
}

impl Default for HubConfig {
	fn default() -> Self {
		Self {
			persist_interval: Duration::from_secs(5),
			event_queue_capacity: 1024,
			chat_tail_limit: crate::server::store::CHAT_TAIL_LIMIT,
		}
	}
}

/// A live room participant, owned by the hub once registered.
///
/// The hub holds the only sender for the client's outbound queue; dropping
/// the handle closes the queue and lets the writer loop exit.
#[derive(Debug)]
pub struct ClientHandle {
	pub id: ClientId,
	pub username: String,
	pub room: RoomName,
	outbound: mpsc::Sender<Utf8Bytes>,
}

impl ClientHandle {
	pub fn new(id: ClientId, username: impl Into<String>, room: RoomName, outbound: mpsc::Sender<Utf8Bytes>) -> Self {
		Self {
			id,
			username: username.into(),
			room,
			outbound,
		}
	}

	/// Non-blocking delivery; a full queue drops the frame for this
	/// recipient only.
	fn deliver(&self, frame: Utf8Bytes) -> bool {
		match self.outbound.try_send(frame) {
			Ok(()) => true,
			Err(mpsc::error::TrySendError::Full(_)) => {
				metrics::counter!("collab_server_frames_dropped_total").increment(1);
				debug!(client = %self.id, user = %self.username, "outbound queue full; dropping frame");
				false
			}
			Err(mpsc::error::TrySendError::Closed(_)) => false,
		}
	}
}

/// Raw inbound frame plus routing metadata, as queued by connection readers.
#[derive(Debug, Clone)]
pub struct Envelope {
	pub room: RoomName,
	pub payload: Utf8Bytes,
	/// Connection that produced the frame; `None` for system-originated
	/// frames.
	pub sender: Option<ClientId>,
}

/// Tagged events consumed by the hub loop.
#[derive(Debug)]
pub enum HubEvent {
	Register(ClientHandle),
	Unregister {
		room: RoomName,
		id: ClientId,
	},
	Broadcast(Envelope),
	/// Re-mark after a failed background save so the next tick retries.
	MarkDirty(RoomName),
	/// Flush every room synchronously, ack, and stop the loop.
	Shutdown(oneshot::Sender<()>),
}

/// Cloneable producer side of the hub's event queue.
#[derive(Debug, Clone)]
pub struct HubHandle {
	events: mpsc::Sender<HubEvent>,
}

impl HubHandle {
	pub async fn register(&self, client: ClientHandle) -> anyhow::Result<()> {
		self.send(HubEvent::Register(client)).await
	}

	pub async fn unregister(&self, room: RoomName, id: ClientId) -> anyhow::Result<()> {
		self.send(HubEvent::Unregister { room, id }).await
	}

	pub async fn broadcast(&self, envelope: Envelope) -> anyhow::Result<()> {
		self.send(HubEvent::Broadcast(envelope)).await
	}

	pub async fn mark_dirty(&self, room: RoomName) -> anyhow::Result<()> {
		self.send(HubEvent::MarkDirty(room)).await
	}

	/// Flush all rooms and stop the loop; resolves once the flush completed.
	pub async fn shutdown(&self) -> anyhow::Result<()> {
		let (ack_tx, ack_rx) = oneshot::channel();
		self.send(HubEvent::Shutdown(ack_tx)).await?;
		ack_rx.await.map_err(|_| anyhow!("hub stopped before acking flush"))
	}

	async fn send(&self, event: HubEvent) -> anyhow::Result<()> {
		self.events.send(event).await.map_err(|_| anyhow!("hub is not running"))
	}
}

#[derive(Debug)]
struct Room {
	clients: HashMap<ClientId, ClientHandle>,
	snapshot: String,
}

/// Single-writer mediator for rooms, membership, and fan-out.
///
/// All room state is owned by the loop task; connections talk to it only
/// through [`HubHandle`].
pub struct Hub {
	cfg: HubConfig,
	store: Arc<dyn Store>,
	rooms: HashMap<RoomName, Room>,
	dirty: HashSet<RoomName>,
	events: mpsc::Receiver<HubEvent>,
	handle: HubHandle,
}

impl Hub {
	pub fn new(store: Arc<dyn Store>, cfg: HubConfig) -> (Self, HubHandle) {
		let (tx, rx) = mpsc::channel(cfg.event_queue_capacity);
		let handle = HubHandle { events: tx };
		let hub = Self {
			cfg,
			store,
			rooms: HashMap::new(),
			dirty: HashSet::new(),
			events: rx,
			handle: handle.clone(),
		};
		(hub, handle)
	}

	/// Run the event loop until shutdown. One event is handled at a time;
	/// nothing else mutates hub state.
	pub async fn run(mut self) {
		let start = tokio::time::Instant::now() + self.cfg.persist_interval;
		let mut flush = tokio::time::interval_at(start, self.cfg.persist_interval);
		info!("hub started");

		loop {
			tokio::select! {
				event = self.events.recv() => match event {
					Some(HubEvent::Register(client)) => self.handle_register(client).await,
					Some(HubEvent::Unregister { room, id }) => self.handle_unregister(&room, id),
					Some(HubEvent::Broadcast(envelope)) => self.handle_broadcast(envelope),
					Some(HubEvent::MarkDirty(room)) => {
						if self.rooms.contains_key(&room) {
							self.dirty.insert(room);
						}
					}
					Some(HubEvent::Shutdown(ack)) => {
						self.flush_all().await;
						let _ = ack.send(());
						break;
					}
					None => {
						self.flush_all().await;
						break;
					}
				},
				_ = flush.tick() => self.flush_dirty(),
			}
		}

		info!("hub stopped");
	}

	async fn handle_register(&mut self, client: ClientHandle) {
		let room_id = client.room.clone();

		if !self.rooms.contains_key(&room_id) {
			let snapshot = match self.store.load_document(&room_id).await {
				Ok(content) => content.unwrap_or_default(),
				Err(e) => {
					warn!(room = %room_id, error = %e, "loading document failed; starting empty");
					String::new()
				}
			};
			self.rooms.insert(
				room_id.clone(),
				Room {
					clients: HashMap::new(),
					snapshot,
				},
			);
			metrics::gauge!("collab_server_rooms").increment(1.0);
		}

		let Some(room) = self.rooms.get_mut(&room_id) else {
			return;
		};

		// One live session per username and room; the newcomer wins.
		let duplicates = room
			.clients
			.values()
			.filter(|c| c.username == client.username)
			.map(|c| c.id)
			.collect::<Vec<_>>();
		for id in duplicates {
			if let Some(old) = room.clients.remove(&id) {
				info!(room = %room_id, user = %old.username, client = %old.id, "kicked duplicate session");
			}
		}

		info!(room = %room_id, user = %client.username, client = %client.id, "client joined");
		let joined_id = client.id;
		room.clients.insert(client.id, client);

		let roster = room.clients.values().map(|c| c.username.clone()).collect::<Vec<_>>();
		let joined = &room.clients[&joined_id];

		if let Some(frame) = encode_frame(&WireMessage::user_list(roster)) {
			joined.deliver(frame);
		}

		if !room.snapshot.is_empty()
			&& let Some(frame) = encode_frame(&WireMessage::doc_update(room.snapshot.clone(), SYSTEM_SENDER))
		{
			joined.deliver(frame);
		}

		// Join latency may degrade behind a slow store; steady-state fan-out
		// does not.
		match self.store.load_chat_tail(&room_id, self.cfg.chat_tail_limit).await {
			Ok(history) if !history.is_empty() => {
				if let Some(frame) = encode_frame(&WireMessage::chat_history(history)) {
					joined.deliver(frame);
				}
			}
			Ok(_) => {}
			Err(e) => warn!(room = %room_id, error = %e, "loading chat tail failed"),
		}

		let store = Arc::clone(&self.store);
		let username = joined.username.clone();
		let visit_room = room_id.clone();
		tokio::spawn(async move {
			if let Err(e) = store.upsert_visit(&username, &visit_room).await {
				warn!(room = %visit_room, user = %username, error = %e, "recording visit failed");
			}
		});

		self.broadcast_user_list(&room_id);
	}

	fn handle_unregister(&mut self, room_id: &RoomName, id: ClientId) {
		let Some(room) = self.rooms.get_mut(room_id) else {
			return;
		};

		// Double-unregister (or unregister after a kick) is a no-op.
		let Some(client) = room.clients.remove(&id) else {
			return;
		};
		info!(room = %room_id, user = %client.username, client = %id, "client left");

		if room.clients.is_empty() {
			// Reclaim clean empty rooms; a dirty one stays resident until its
			// snapshot reaches the store.
			if !self.dirty.contains(room_id) {
				self.rooms.remove(room_id);
				metrics::gauge!("collab_server_rooms").decrement(1.0);
			}
			return;
		}

		self.broadcast_user_list(room_id);
	}

	fn handle_broadcast(&mut self, envelope: Envelope) {
		let Some(room) = self.rooms.get_mut(&envelope.room) else {
			debug!(room = %envelope.room, "dropping broadcast for unknown room");
			return;
		};

		metrics::counter!("collab_server_broadcasts_total").increment(1);

		// Malformed frames still fan out; they just carry no known type.
		let decoded = WireMessage::decode(envelope.payload.as_str()).ok();
		let kind = decoded.as_ref().map(|m| m.kind).unwrap_or(MessageKind::Unknown);
		let frame_sender = decoded.as_ref().and_then(WireMessage::sender_identity);

		for client in room.clients.values() {
			if kind == MessageKind::DocUpdate {
				// Connection identity is the fast path; the uuid carried in
				// the frame is authoritative across reconnects.
				if envelope.sender.is_some_and(|sender| sender == client.id) {
					continue;
				}
				if frame_sender.is_some_and(|sender| sender == client.id) {
					continue;
				}
			}
			client.deliver(envelope.payload.clone());
		}

		match kind {
			MessageKind::DocUpdate => {
				if let Some(msg) = decoded {
					room.snapshot = msg.content.unwrap_or_default();
					self.dirty.insert(envelope.room);
				}
			}
			MessageKind::Chat => {
				if let Some(msg) = decoded {
					let store = Arc::clone(&self.store);
					let room_id = envelope.room;
					let sender = msg.sender.unwrap_or_default();
					let message = msg.message.unwrap_or_default();
					tokio::spawn(async move {
						if let Err(e) = store.append_chat(&room_id, &sender, &message).await {
							warn!(room = %room_id, error = %e, "appending chat failed");
						}
					});
				}
			}
			_ => {}
		}
	}

	/// Dispatch one background save per dirty resident room.
	fn flush_dirty(&mut self) {
		if self.dirty.is_empty() {
			return;
		}

		let dirty = std::mem::take(&mut self.dirty);
		for room_id in dirty {
			let Some(room) = self.rooms.get(&room_id) else {
				continue;
			};

			let store = Arc::clone(&self.store);
			let handle = self.handle.clone();
			let content = room.snapshot.clone();
			tokio::spawn(async move {
				match store.save_document(&room_id, &content).await {
					Ok(()) => {
						metrics::counter!("collab_server_documents_saved_total").increment(1);
					}
					Err(e) => {
						metrics::counter!("collab_server_document_save_failures_total").increment(1);
						warn!(room = %room_id, error = %e, "saving document failed; re-marking dirty");
						let _ = handle.mark_dirty(room_id).await;
					}
				}
			});
		}
	}

	/// Synchronous save of every non-empty snapshot. Errors are logged and
	/// the flush continues.
	async fn flush_all(&mut self) {
		for (room_id, room) in &self.rooms {
			if room.snapshot.is_empty() {
				continue;
			}
			match self.store.save_document(room_id, &room.snapshot).await {
				Ok(()) => {
					metrics::counter!("collab_server_documents_saved_total").increment(1);
				}
				Err(e) => {
					error!(room = %room_id, error = %e, "flush: saving document failed");
				}
			}
		}
		self.dirty.clear();
	}

	fn broadcast_user_list(&mut self, room_id: &RoomName) {
		let Some(room) = self.rooms.get(room_id) else {
			return;
		};

		let roster = room.clients.values().map(|c| c.username.clone()).collect::<Vec<_>>();
		let Some(frame) = encode_frame(&WireMessage::user_list(roster)) else {
			return;
		};

		for client in room.clients.values() {
			client.deliver(frame.clone());
		}
	}
}

fn encode_frame(msg: &WireMessage) -> Option<Utf8Bytes> {
	match msg.encode() {
		Ok(text) => Some(Utf8Bytes::from(text)),
		Err(e) => {
			error!(error = %e, "encoding server frame failed");
			None
		}
	}
}

/// Spawn the hub loop and return its handle.
pub fn spawn_hub(store: Arc<dyn Store>, cfg: HubConfig) -> HubHandle {
	let (hub, handle) = Hub::new(store, cfg);
	tokio::spawn(hub.run());
	handle
}
