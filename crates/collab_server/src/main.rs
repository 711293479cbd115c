#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use collab_server::config;
use collab_server::server::connection::{ConnectionSettings, handle_connection};
use collab_server::server::health::{HealthState, start_health_server};
use collab_server::server::hub::{HubConfig, spawn_hub};
use collab_server::server::store::{MemoryStore, SqliteStore, Store};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const DEFAULT_BIND: &str = "127.0.0.1:9320";

/// How long live connections get to drain after the flush.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: collab_server [--bind host:port]\n\
\n\
Options:\n\
\t--bind   WebSocket bind address (default: {DEFAULT_BIND})\n\
\t--help   Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> Option<String> {
	let mut bind = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected host:port)");
					usage_and_exit();
				}
				bind = Some(v);
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	bind
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,collab_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("collab_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let bind_arg = parse_args();

	let config_path = config::default_config_path()?;
	let server_cfg = config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let active = Arc::new(AtomicUsize::new(0));
	let health_state = HealthState::new(Arc::clone(&active));
	if let Some(bind) = server_cfg.server.health_bind.as_deref() {
		match bind.parse::<SocketAddr>() {
			Ok(addr) => match start_health_server(addr, health_state.clone()).await {
				Ok(()) => info!(%addr, "health server listening"),
				Err(e) => warn!(error = %e, "health server not started"),
			},
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	// Unreachable storage at init is fatal; after this point store errors
	// are logged and retried, never propagated into the hub loop.
	let store: Arc<dyn Store> = if server_cfg.persistence.enabled {
		let Some(database_url) = server_cfg.persistence.database_url.as_deref() else {
			return Err(anyhow::anyhow!("persistence enabled but no database_url configured"));
		};
		info!("persistence enabled (sqlite)");
		Arc::new(SqliteStore::connect(database_url).await?)
	} else {
		warn!("persistence disabled; documents and chat live in memory only");
		Arc::new(MemoryStore::new())
	};

	let hub = spawn_hub(
		store,
		HubConfig {
			persist_interval: Duration::from_secs(server_cfg.server.persist_interval_secs),
			..HubConfig::default()
		},
	);

	let conn_settings = ConnectionSettings {
		max_frame_bytes: server_cfg.server.max_frame_bytes,
		outbound_queue_capacity: server_cfg.server.outbound_queue_capacity,
		auth_hmac_secret: server_cfg.server.auth_hmac_secret.clone(),
		..ConnectionSettings::default()
	};

	let bind = bind_arg
		.or(server_cfg.server.bind.clone())
		.unwrap_or_else(|| DEFAULT_BIND.to_string());
	let bind_addr: SocketAddr = bind
		.parse()
		.map_err(|e| anyhow::anyhow!("invalid bind address {bind:?} (expected host:port): {e}"))?;

	let listener = TcpListener::bind(bind_addr).await?;
	info!(bind = %bind_addr, "collab_server: websocket endpoint ready");
	health_state.mark_serving();

	let mut next_conn_id: u64 = 1;

	loop {
		tokio::select! {
			_ = tokio::signal::ctrl_c() => break,
			accepted = listener.accept() => {
				let (stream, remote) = match accepted {
					Ok(pair) => pair,
					Err(e) => {
						warn!(error = %e, "accept failed");
						continue;
					}
				};

				let conn_id = next_conn_id;
				next_conn_id += 1;
				info!(conn_id, remote = %remote, "accepted connection");

				let hub = hub.clone();
				let conn_settings = conn_settings.clone();
				let active = Arc::clone(&active);
				tokio::spawn(async move {
					if let Err(e) = handle_connection(conn_id, stream, hub, conn_settings, active).await {
						warn!(conn_id, error = %e, "connection handler exited with error");
					}
				});
			}
		}
	}

	// Shutdown: stop accepting, flush every snapshot, then give writers a
	// bounded window to drain.
	info!("shutdown signal received");
	health_state.mark_draining();
	drop(listener);

	if let Err(e) = hub.shutdown().await {
		warn!(error = %e, "hub flush on shutdown failed");
	} else {
		info!("hub flushed");
	}

	let deadline = tokio::time::Instant::now() + SHUTDOWN_DRAIN;
	while active.load(Ordering::Relaxed) > 0 && tokio::time::Instant::now() < deadline {
		tokio::time::sleep(Duration::from_millis(50)).await;
	}
	info!(remaining = active.load(Ordering::Relaxed), "collab_server stopped");

	Ok(())
}
