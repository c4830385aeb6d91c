#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tracing::info;

use chatrelay_platform::UpstreamConfig;

use crate::server::session::SessionConfig;

/// Default config path: `~/.chatrelay/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".chatrelay").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

/// Server config (v1).
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub upstream: UpstreamSettings,
	pub session: SessionSettings,
}

/// Process-level settings.
#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
}

/// Upstream platform settings.
#[derive(Debug, Clone, Default)]
pub struct UpstreamSettings {
	/// Base URL of the watch pages.
	pub watch_base_url: Option<String>,
	/// Base URL of the chat API endpoint.
	pub chat_base_url: Option<String>,
	/// User-Agent presented to the platform.
	pub user_agent: Option<String>,
	/// Hard per-request deadline.
	pub request_timeout: Option<Duration>,
}

impl UpstreamSettings {
	pub fn to_upstream_config(&self) -> UpstreamConfig {
		let mut cfg = UpstreamConfig::default();
		if let Some(url) = &self.watch_base_url {
			cfg.watch_base_url = url.clone();
		}
		if let Some(url) = &self.chat_base_url {
			cfg.chat_base_url = url.clone();
		}
		if let Some(ua) = &self.user_agent {
			cfg.user_agent = ua.clone();
		}
		if let Some(timeout) = self.request_timeout {
			cfg.request_timeout = timeout;
		}
		cfg
	}
}

/// Session tuning knobs; anything unset keeps the built-in default.
#[derive(Debug, Clone, Default)]
pub struct SessionSettings {
	pub deadman: Option<Duration>,
	pub token_stall: Option<Duration>,
	pub heal_backoff_min: Option<Duration>,
	pub heal_backoff_max: Option<Duration>,
	pub dedup_capacity: Option<usize>,
	pub barrier_grace: Option<Duration>,
	pub outbox_capacity: Option<usize>,
	pub drain_interval: Option<Duration>,
	pub ping_interval: Option<Duration>,
	pub drained_grace: Option<Duration>,
}

impl SessionSettings {
	pub fn to_session_config(&self) -> SessionConfig {
		let mut cfg = SessionConfig::default();
		if let Some(v) = self.deadman {
			cfg.deadman = v;
		}
		if let Some(v) = self.token_stall {
			cfg.token_stall = v;
		}
		if let Some(v) = self.heal_backoff_min {
			cfg.heal_backoff_min = v;
		}
		if let Some(v) = self.heal_backoff_max {
			cfg.heal_backoff_max = v;
		}
		if let Some(v) = self.dedup_capacity {
			cfg.dedup_capacity = v;
		}
		if let Some(v) = self.barrier_grace {
			cfg.barrier_grace = v;
		}
		if let Some(v) = self.outbox_capacity {
			cfg.outbox_capacity = v;
		}
		if let Some(v) = self.drain_interval {
			cfg.drain_interval = v;
		}
		if let Some(v) = self.ping_interval {
			cfg.ping_interval = v;
		}
		if let Some(v) = self.drained_grace {
			cfg.drained_grace = v;
		}
		cfg
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	upstream: FileUpstreamSettings,

	#[serde(default)]
	session: FileSessionSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	metrics_bind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileUpstreamSettings {
	watch_base_url: Option<String>,
	chat_base_url: Option<String>,
	user_agent: Option<String>,
	request_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileSessionSettings {
	deadman_ms: Option<u64>,
	token_stall_ms: Option<u64>,
	heal_backoff_min_ms: Option<u64>,
	heal_backoff_max_ms: Option<u64>,
	dedup_capacity: Option<usize>,
	barrier_grace_ms: Option<u64>,
	outbox_capacity: Option<usize>,
	drain_interval_ms: Option<u64>,
	ping_interval_ms: Option<u64>,
	drained_grace_secs: Option<u64>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		Self {
			server: ServerSettings {
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
			},
			upstream: UpstreamSettings {
				watch_base_url: file.upstream.watch_base_url.filter(|s| !s.trim().is_empty()),
				chat_base_url: file.upstream.chat_base_url.filter(|s| !s.trim().is_empty()),
				user_agent: file.upstream.user_agent.filter(|s| !s.trim().is_empty()),
				request_timeout: file.upstream.request_timeout_ms.map(Duration::from_millis),
			},
			session: SessionSettings {
				deadman: file.session.deadman_ms.map(Duration::from_millis),
				token_stall: file.session.token_stall_ms.map(Duration::from_millis),
				heal_backoff_min: file.session.heal_backoff_min_ms.map(Duration::from_millis),
				heal_backoff_max: file.session.heal_backoff_max_ms.map(Duration::from_millis),
				dedup_capacity: file.session.dedup_capacity,
				barrier_grace: file.session.barrier_grace_ms.map(Duration::from_millis),
				outbox_capacity: file.session.outbox_capacity,
				drain_interval: file.session.drain_interval_ms.map(Duration::from_millis),
				ping_interval: file.session.ping_interval_ms.map(Duration::from_millis),
				drained_grace: file.session.drained_grace_secs.map(Duration::from_secs),
			},
		}
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Ok(v) = std::env::var("CHATRELAY_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("CHATRELAY_WATCH_BASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.upstream.watch_base_url = Some(v);
			info!("upstream config: watch_base_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("CHATRELAY_CHAT_BASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.upstream.chat_base_url = Some(v);
			info!("upstream config: chat_base_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("CHATRELAY_USER_AGENT") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.upstream.user_agent = Some(v);
			info!("upstream config: user_agent overridden by env");
		}
	}

	if let Ok(v) = std::env::var("CHATRELAY_REQUEST_TIMEOUT_MS")
		&& let Ok(ms) = v.trim().parse::<u64>()
	{
		cfg.upstream.request_timeout = Some(Duration::from_millis(ms));
		info!(ms, "upstream config: request_timeout overridden by env");
	}
}
