#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use anyhow::Context as _;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::warn;

const PHASE_STARTING: u8 = 0;
const PHASE_SERVING: u8 = 1;
const PHASE_DRAINING: u8 = 2;

/// Lifecycle phase reported on `/readyz`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
	Starting,
	Serving,
	Draining,
}

/// Lifecycle phase plus the live-connection count, shared with the accept
/// loop and the shutdown path.
#[derive(Clone)]
pub struct HealthState {
	phase: Arc<AtomicU8>,
	active_connections: Arc<AtomicUsize>,
}

impl HealthState {
	pub fn new(active_connections: Arc<AtomicUsize>) -> Self {
		Self {
			phase: Arc::new(AtomicU8::new(PHASE_STARTING)),
			active_connections,
		}
	}

	/// The endpoint is bound and accepting.
	pub fn mark_serving(&self) {
		self.phase.store(PHASE_SERVING, Ordering::Relaxed);
	}

	/// Shutdown has begun; readiness drops while connections drain.
	pub fn mark_draining(&self) {
		self.phase.store(PHASE_DRAINING, Ordering::Relaxed);
	}

	fn phase(&self) -> Phase {
		match self.phase.load(Ordering::Relaxed) {
			PHASE_SERVING => Phase::Serving,
			PHASE_DRAINING => Phase::Draining,
			_ => Phase::Starting,
		}
	}

	fn connections(&self) -> usize {
		self.active_connections.load(Ordering::Relaxed)
	}
}

/// Bind and spawn the health listener. An unusable address fails here, in
/// the caller's context; accept errors afterwards are logged and survived.
pub async fn start_health_server(bind: SocketAddr, state: HealthState) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind)
		.await
		.with_context(|| format!("bind health listener on {bind}"))?;

	tokio::spawn(async move {
		loop {
			let stream = match listener.accept().await {
				Ok((stream, _remote)) => stream,
				Err(e) => {
					warn!(error = %e, "health accept failed");
					continue;
				}
			};

			let state = state.clone();
			tokio::spawn(async move {
				let service = service_fn(move |req| {
					let state = state.clone();
					async move { Ok::<_, hyper::Error>(respond(&req, &state)) }
				});
				if let Err(e) = http1::Builder::new().serve_connection(TokioIo::new(stream), service).await {
					warn!(error = %e, "health connection error");
				}
			});
		}
	});

	Ok(())
}

fn respond(req: &Request<Incoming>, state: &HealthState) -> Response<Full<Bytes>> {
	match (req.method(), req.uri().path()) {
		(&Method::GET, "/healthz") => text(StatusCode::OK, "ok".into()),
		(&Method::GET, "/readyz") => match state.phase() {
			Phase::Serving => text(StatusCode::OK, "ready".into()),
			Phase::Starting => text(StatusCode::SERVICE_UNAVAILABLE, "starting".into()),
			Phase::Draining => text(
				StatusCode::SERVICE_UNAVAILABLE,
				format!("draining connections={}", state.connections()),
			),
		},
		(&Method::GET, _) => text(StatusCode::NOT_FOUND, String::new()),
		_ => text(StatusCode::METHOD_NOT_ALLOWED, String::new()),
	}
}

fn text(status: StatusCode, body: String) -> Response<Full<Bytes>> {
	let mut resp = Response::new(Full::new(Bytes::from(body)));
	*resp.status_mut() = status;
	resp
}
