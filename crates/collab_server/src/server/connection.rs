#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use bytes::Bytes;
use collab_domain::{ClientId, DEFAULT_USERNAME, RoomName, SecretString};
use collab_protocol::{DEFAULT_MAX_FRAME_SIZE, WireMessage};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use tokio_tungstenite::{WebSocketStream, accept_hdr_async_with_config};
use tracing::{debug, info, warn};

use crate::server::auth::{authorize, bearer_or_query_token};
use crate::server::hub::{ClientHandle, Envelope, HubHandle, OUTBOUND_QUEUE_CAPACITY};

/// Per-connection server settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	/// Maximum inbound frame payload.
	pub max_frame_bytes: usize,

	/// Outbound queue depth; overflow drops frames for that recipient.
	pub outbound_queue_capacity: usize,

	/// How long a connection may stay silent before the reader gives up.
	pub pong_wait: Duration,

	/// Deadline applied to every single write, pings included.
	pub write_deadline: Duration,

	/// When set, upgrades without a verifying token are rejected.
	pub auth_hmac_secret: Option<SecretString>,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			outbound_queue_capacity: OUTBOUND_QUEUE_CAPACITY,
			pong_wait: Duration::from_secs(60),
			write_deadline: Duration::from_secs(10),
			auth_hmac_secret: None,
		}
	}
}

impl ConnectionSettings {
	/// Ping cadence: 90% of the pong wait, so a healthy peer always answers
	/// in time.
	pub fn ping_period(&self) -> Duration {
		self.pong_wait.mul_f64(0.9)
	}
}

/// Parameters resolved from the upgrade request.
#[derive(Debug, Clone)]
struct ConnectParams {
	room: RoomName,
	username: String,
}

struct ConnectionGuard {
	active: Arc<AtomicUsize>,
}

impl ConnectionGuard {
	fn new(active: Arc<AtomicUsize>) -> Self {
		active.fetch_add(1, Ordering::Relaxed);
		metrics::gauge!("collab_server_active_connections").increment(1.0);
		Self { active }
	}
}

impl Drop for ConnectionGuard {
	fn drop(&mut self) {
		self.active.fetch_sub(1, Ordering::Relaxed);
		metrics::gauge!("collab_server_active_connections").decrement(1.0);
	}
}

/// Accept one WebSocket client: upgrade, assign an identity, register with
/// the hub, then run the reader until the connection dies.
pub async fn handle_connection(
	conn_id: u64,
	stream: TcpStream,
	hub: HubHandle,
	settings: ConnectionSettings,
	active: Arc<AtomicUsize>,
) -> anyhow::Result<()> {
	let _guard = ConnectionGuard::new(active);
	metrics::counter!("collab_server_connections_total").increment(1);

	let ws_config = WebSocketConfig::default()
		.max_message_size(Some(settings.max_frame_bytes))
		.max_frame_size(Some(settings.max_frame_bytes));

	let mut params: Option<ConnectParams> = None;
	let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
		match resolve_params(req, &settings) {
			Ok(p) => {
				params = Some(p);
				Ok(resp)
			}
			Err(e) => {
				warn!(conn_id, error = %e, "rejecting upgrade");
				Err(unauthorized())
			}
		}
	};

	let mut ws = accept_hdr_async_with_config(stream, callback, Some(ws_config))
		.await
		.context("websocket handshake")?;
	let params = params.ok_or_else(|| anyhow!("upgrade callback did not run"))?;

	let id = ClientId::new_v4();
	info!(conn_id, client = %id, room = %params.room, user = %params.username, "connection upgraded");

	// Identity goes out before the hub hears about this client, so it is the
	// first frame on the socket.
	let hello = WireMessage::client_id(id).encode().context("encode client_id frame")?;
	ws.send(Message::Text(Utf8Bytes::from(hello)))
		.await
		.context("send client_id frame")?;

	let (sink, stream) = ws.split();
	let (outbound_tx, outbound_rx) = mpsc::channel(settings.outbound_queue_capacity);

	let client = ClientHandle::new(id, params.username.clone(), params.room.clone(), outbound_tx);
	hub.register(client).await.context("register with hub")?;

	tokio::spawn(write_loop(conn_id, sink, outbound_rx, settings.clone()));

	read_loop(conn_id, stream, &hub, params.room.clone(), id, settings.pong_wait).await;

	// Best effort: at process shutdown the hub may already be gone.
	let _ = hub.unregister(params.room, id).await;
	debug!(conn_id, client = %id, "connection closed");
	Ok(())
}

/// Pull frames off the socket and feed the hub. Exits on read error, close,
/// or a silent peer.
async fn read_loop(
	conn_id: u64,
	mut stream: SplitStream<WebSocketStream<TcpStream>>,
	hub: &HubHandle,
	room: RoomName,
	id: ClientId,
	pong_wait: Duration,
) {
	loop {
		// Any inbound frame resets the deadline; the peer's pong replies to
		// our pings are enough to keep an idle connection alive.
		let msg = match tokio::time::timeout(pong_wait, stream.next()).await {
			Err(_) => {
				debug!(conn_id, client = %id, "read deadline exceeded");
				break;
			}
			Ok(None) => break,
			Ok(Some(Err(e))) => {
				debug!(conn_id, client = %id, error = %e, "read failed");
				break;
			}
			Ok(Some(Ok(msg))) => msg,
		};

		match msg {
			Message::Text(payload) => {
				metrics::counter!("collab_server_frames_in_total").increment(1);
				let envelope = Envelope {
					room: room.clone(),
					payload,
					sender: Some(id),
				};
				if hub.broadcast(envelope).await.is_err() {
					break;
				}
			}
			Message::Close(_) => break,
			Message::Binary(_) => {
				debug!(conn_id, client = %id, "ignoring binary frame");
			}
			Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
		}
	}
}

/// Drain the outbound queue to the socket, pinging on a timer. A closed
/// queue means the hub dropped this client; say goodbye and stop.
async fn write_loop(
	conn_id: u64,
	mut sink: SplitSink<WebSocketStream<TcpStream>, Message>,
	mut outbound: mpsc::Receiver<Utf8Bytes>,
	settings: ConnectionSettings,
) {
	let period = settings.ping_period();
	let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

	loop {
		tokio::select! {
			frame = outbound.recv() => match frame {
				Some(text) => {
					if !write_with_deadline(conn_id, &mut sink, Message::Text(text), settings.write_deadline).await {
						break;
					}
				}
				None => {
					let _ = tokio::time::timeout(settings.write_deadline, sink.send(Message::Close(None))).await;
					break;
				}
			},
			_ = ping.tick() => {
				if !write_with_deadline(conn_id, &mut sink, Message::Ping(Bytes::new()), settings.write_deadline).await {
					break;
				}
			}
		}
	}
}

async fn write_with_deadline(
	conn_id: u64,
	sink: &mut SplitSink<WebSocketStream<TcpStream>, Message>,
	msg: Message,
	deadline: Duration,
) -> bool {
	match tokio::time::timeout(deadline, sink.send(msg)).await {
		Ok(Ok(())) => true,
		Ok(Err(e)) => {
			debug!(conn_id, error = %e, "write failed");
			false
		}
		Err(_) => {
			debug!(conn_id, "write deadline exceeded");
			false
		}
	}
}

fn unauthorized() -> ErrorResponse {
	let mut resp = ErrorResponse::new(Some("invalid auth token".to_string()));
	*resp.status_mut() = StatusCode::UNAUTHORIZED;
	resp
}

/// Resolve room, username, and (when a secret is configured) auth from the
/// upgrade request.
fn resolve_params(req: &Request, settings: &ConnectionSettings) -> anyhow::Result<ConnectParams> {
	let query = req.uri().query().unwrap_or_default();

	let mut room = None;
	let mut username = None;
	let mut query_token = None;
	for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
		match key.as_ref() {
			"room" => room = Some(value.into_owned()),
			"username" => username = Some(value.into_owned()),
			"token" => query_token = Some(value.into_owned()),
			_ => {}
		}
	}

	let room = RoomName::from_query(room.as_deref());

	// Scoped tokens are checked against the room the client asked for.
	let claims = match settings.auth_hmac_secret.as_ref() {
		Some(secret) => {
			let auth_header = req.headers().get("authorization").and_then(|h| h.to_str().ok());
			let token =
				bearer_or_query_token(auth_header, query_token.as_deref()).ok_or_else(|| anyhow!("missing auth token"))?;
			Some(authorize(token, secret, &room)?)
		}
		None => None,
	};

	let username = username
		.filter(|u| !u.trim().is_empty())
		.or(claims.map(|c| c.sub))
		.unwrap_or_else(|| DEFAULT_USERNAME.to_string());

	Ok(ConnectParams { room, username })
}
