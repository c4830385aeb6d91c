#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use chatrelay_platform::{InnertubeUpstream, Upstream};
use chatrelay_server::config;
use chatrelay_server::server::http::{AppState, HealthState, router};
use chatrelay_server::server::registry::SessionRegistry;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: chatrelay_server [--bind host:port]\n\
\n\
Options:\n\
\t--bind    Bind address (default: 127.0.0.1:8370)\n\
\t--help   Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> SocketAddr {
	let mut bind = "127.0.0.1:8370".to_string();

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
				bind = v;
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	bind.parse::<SocketAddr>().unwrap_or_else(|e| {
		eprintln!("invalid bind address {bind}: {e}");
		usage_and_exit();
	})
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,chatrelay_server=debug".to_string());

	tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false))
		.init();
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

	let bind_addr = parse_args();

	let config_path = config::default_config_path()?;
	let server_cfg = config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let upstream: Arc<dyn Upstream> = Arc::new(InnertubeUpstream::new(server_cfg.upstream.to_upstream_config()));
	let registry = SessionRegistry::new(server_cfg.session.to_session_config(), Arc::clone(&upstream));
	registry.start_sweeper();

	let health = HealthState::new();
	let state = Arc::new(AppState {
		registry,
		upstream,
		health: health.clone(),
	});

	let listener = tokio::net::TcpListener::bind(bind_addr).await?;
	info!(bind = %bind_addr, "chatrelay_server: listening");
	health.mark_ready();

	axum::serve(listener, router(state)).await?;

	Ok(())
}
