#![forbid(unsafe_code)]

mod config;
mod quic;
mod server;
mod util;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use sala_domain::{ConnId, Identity, Room, RoomId, RoomPin};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::RoomSeed;
use crate::quic::config::QuicServerConfig;
use crate::server::codec::{MessageCodec, parse_key_base64};
use crate::server::connection::handle_connection;
use crate::server::health::{HealthState, spawn_health_server};
use crate::server::relay::{Relay, RelayConfig};
use crate::server::room_hub::{RoomHub, RoomHubConfig};
use crate::server::store::{MemoryStore, RoomStore, SqlStore};
use crate::server::sweeper::{SweeperConfig, spawn_sweeper};
use crate::util::endpoint::QuicEndpoint;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: sala_server [--bind quic://host:port]\n\
\n\
Options:\n\
\t--bind    Bind endpoint (default: quic://127.0.0.1:18400)\n\
\t         Format: quic://host:port\n\
\t--help   Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> SocketAddr {
	let mut bind_endpoint = "quic://127.0.0.1:18400".to_string();

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected quic://host:port)");
					usage_and_exit();
				}
				bind_endpoint = v;
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	let bind = QuicEndpoint::parse(&bind_endpoint).unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	let addr: SocketAddr = bind.to_socket_addr_if_ip_literal().unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	addr
}

fn init_rustls_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,sala_server=debug".to_string());

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
				let tracer = tracer_provider.tracer("sala_server");
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

	match bind.parse::<std::net::SocketAddr>() {
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

fn build_codec(cfg: &config::EncryptionSettings) -> anyhow::Result<MessageCodec> {
	let Some(key_base64) = cfg.key_base64.as_deref() else {
		warn!("no encryption key configured, messages are stored in plaintext");
		return Ok(MessageCodec::plaintext());
	};

	let key = parse_key_base64(key_base64).map_err(|e| anyhow::anyhow!("invalid encryption key: {e}"))?;
	Ok(MessageCodec::new(Some(key), cfg.fail_open))
}

async fn seed_rooms(store: &dyn RoomStore, seeds: &[RoomSeed]) -> anyhow::Result<()> {
	for seed in seeds {
		let pin = seed
			.pin
			.parse::<RoomPin>()
			.map_err(|e| anyhow::anyhow!("room seed {:?}: invalid pin: {e}", seed.name))?;
		let created_by =
			Identity::new(&seed.created_by).map_err(|e| anyhow::anyhow!("room seed {:?}: invalid creator: {e}", seed.name))?;

		if store.find_room_by_pin(&pin).await?.is_some() {
			continue;
		}

		let room = Room {
			id: RoomId::new_v4(),
			name: seed.name.clone(),
			pin,
			created_by,
		};
		store.create_room(&room).await?;
		info!(room = %room.id, "seeded room");
	}
	Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_rustls_crypto_provider();
	init_tracing();

	let bind_addr = parse_args();

	let config_path = crate::config::default_config_path()?;
	let server_cfg = crate::config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let health_state = HealthState::new();
	if let Some(bind) = server_cfg.server.health_bind.as_deref() {
		match bind.parse::<std::net::SocketAddr>() {
			Ok(addr) => {
				spawn_health_server(addr, health_state.clone());
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let quic_cfg = QuicServerConfig::dev(bind_addr);
	let endpoint = if let (Some(cert_path), Some(key_path)) = (
		server_cfg.server.tls_cert_path.as_deref(),
		server_cfg.server.tls_key_path.as_deref(),
	) {
		info!(cert = %cert_path.display(), key = %key_path.display(), "loading TLS cert/key");
		quic_cfg.bind_endpoint_with_tls(cert_path, key_path)?
	} else {
		let (endpoint, server_cert_der) = quic_cfg.bind_dev_endpoint()?;
		info!(
			bind = %bind_addr,
			cert_der_len = server_cert_der.len(),
			"sala_server: QUIC endpoint ready (dev self-signed cert)"
		);
		endpoint
	};

	let codec = Arc::new(build_codec(&server_cfg.encryption)?);

	let store: Arc<dyn RoomStore> = if let Some(database_url) = server_cfg.persistence.database_url.as_deref() {
		info!("connecting room store");
		Arc::new(SqlStore::connect(database_url, Arc::clone(&codec)).await?)
	} else {
		info!("no database_url configured, using in-memory room store");
		Arc::new(MemoryStore::new(Arc::clone(&codec)))
	};

	seed_rooms(store.as_ref(), &server_cfg.rooms).await?;

	let relay_cfg = RelayConfig {
		reconnect_cooldown_ms: (server_cfg.session.reconnect_cooldown_secs as i64) * 1000,
		inactivity_timeout_ms: (server_cfg.session.inactivity_timeout_secs as i64) * 1000,
	};

	let hub = RoomHub::new(RoomHubConfig::default());
	let relay = Arc::new(Relay::new(hub, store, relay_cfg));

	let _sweeper = spawn_sweeper(
		Arc::clone(&relay),
		SweeperConfig {
			period: Duration::from_secs(server_cfg.session.sweep_interval_secs),
		},
	);

	health_state.mark_ready();

	let mut next_conn_id: u64 = 1;

	loop {
		let Some(connecting) = endpoint.accept().await else {
			break;
		};

		let conn_id = ConnId(next_conn_id);
		next_conn_id += 1;
		metrics::counter!("sala_server_connections_total").increment(1);

		let relay = Arc::clone(&relay);
		tokio::spawn(async move {
			match connecting.await {
				Ok(connection) => {
					tracing::info!(conn = %conn_id, remote = %connection.remote_address(), "accepted connection");

					if let Err(e) = handle_connection(conn_id, connection, relay).await {
						warn!(conn = %conn_id, error = %e, "connection handler exited with error");
					}
				}
				Err(e) => {
					warn!(conn = %conn_id, error = %e, "failed to establish QUIC connection");
				}
			}
		});
	}

	Ok(())
}
