#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tracing::info;

/// Default config path: `~/.sala/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".sala").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
#[allow(dead_code)]
pub fn load_server_config() -> anyhow::Result<ServerConfig> {
	let path = default_config_path()?;
	load_server_config_from_path(&path)
}

/// Same as `load_server_config` but with an explicit config path.
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
	pub session: SessionSettings,
	pub persistence: PersistenceSettings,
	pub encryption: EncryptionSettings,
	pub rooms: Vec<RoomSeed>,
}

#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
	/// PEM-encoded certificate path for QUIC/TLS.
	pub tls_cert_path: Option<PathBuf>,
	/// PEM-encoded private key path for QUIC/TLS.
	pub tls_key_path: Option<PathBuf>,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
}

/// Session integrity timing: reconnect cooldown, sweep period and the
/// idle threshold past which the sweeper evicts a session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
	pub reconnect_cooldown_secs: u64,
	pub sweep_interval_secs: u64,
	pub inactivity_timeout_secs: u64,
}

impl Default for SessionSettings {
	fn default() -> Self {
		Self {
			reconnect_cooldown_secs: 10,
			sweep_interval_secs: 30,
			inactivity_timeout_secs: 300,
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	/// Database URL (sqlite: or postgres:). Without one the server
	/// keeps rooms and messages in memory.
	pub database_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EncryptionSettings {
	/// Base64-encoded 32-byte key for the at-rest message codec.
	pub key_base64: Option<String>,
	/// Fail-open on codec errors (pass the input through) instead of
	/// rejecting the message.
	pub fail_open: bool,
}

impl Default for EncryptionSettings {
	fn default() -> Self {
		Self {
			key_base64: None,
			fail_open: true,
		}
	}
}

/// Room seeded into the store at startup. Room creation is otherwise
/// an external concern.
#[derive(Debug, Clone, Deserialize)]
pub struct RoomSeed {
	pub name: String,
	pub pin: String,
	pub created_by: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	session: FileSessionSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,

	#[serde(default)]
	encryption: FileEncryptionSettings,

	#[serde(default)]
	rooms: Vec<RoomSeed>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	tls_cert_path: Option<String>,
	tls_key_path: Option<String>,
	metrics_bind: Option<String>,
	health_bind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileSessionSettings {
	reconnect_cooldown_secs: Option<u64>,
	sweep_interval_secs: Option<u64>,
	inactivity_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileEncryptionSettings {
	key_base64: Option<String>,
	fail_open: Option<bool>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults = SessionSettings::default();

		Self {
			server: ServerSettings {
				tls_cert_path: file.server.tls_cert_path.filter(|s| !s.trim().is_empty()).map(PathBuf::from),
				tls_key_path: file.server.tls_key_path.filter(|s| !s.trim().is_empty()).map(PathBuf::from),
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				health_bind: file.server.health_bind.filter(|s| !s.trim().is_empty()),
			},
			session: SessionSettings {
				reconnect_cooldown_secs: file
					.session
					.reconnect_cooldown_secs
					.unwrap_or(defaults.reconnect_cooldown_secs),
				sweep_interval_secs: file.session.sweep_interval_secs.unwrap_or(defaults.sweep_interval_secs),
				inactivity_timeout_secs: file
					.session
					.inactivity_timeout_secs
					.unwrap_or(defaults.inactivity_timeout_secs),
			},
			persistence: PersistenceSettings {
				database_url: file.persistence.database_url.filter(|s| !s.trim().is_empty()),
			},
			encryption: EncryptionSettings {
				key_base64: file.encryption.key_base64.filter(|s| !s.trim().is_empty()),
				fail_open: file.encryption.fail_open.unwrap_or(true),
			},
			rooms: file.rooms,
		}
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
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
	if let Ok(v) = std::env::var("SALA_TLS_CERT") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.tls_cert_path = Some(PathBuf::from(v));
			info!("server config: tls_cert_path overridden by env");
		}
	}

	if let Ok(v) = std::env::var("SALA_TLS_KEY") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.tls_key_path = Some(PathBuf::from(v));
			info!("server config: tls_key_path overridden by env");
		}
	}

	if let Ok(v) = std::env::var("SALA_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("SALA_HEALTH_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.health_bind = Some(v);
			info!("server config: health_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("SALA_RECONNECT_COOLDOWN_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
	{
		cfg.session.reconnect_cooldown_secs = secs;
		info!(secs, "session config: reconnect_cooldown_secs overridden by env");
	}

	if let Ok(v) = std::env::var("SALA_SWEEP_INTERVAL_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
	{
		cfg.session.sweep_interval_secs = secs;
		info!(secs, "session config: sweep_interval_secs overridden by env");
	}

	if let Ok(v) = std::env::var("SALA_INACTIVITY_TIMEOUT_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
	{
		cfg.session.inactivity_timeout_secs = secs;
		info!(secs, "session config: inactivity_timeout_secs overridden by env");
	}

	if let Ok(v) = std::env::var("SALA_DATABASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.persistence.database_url = Some(v);
			info!("persistence: database_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("SALA_ENCRYPTION_KEY") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.encryption.key_base64 = Some(v);
			info!("encryption: key overridden by env");
		}
	}

	if let Ok(v) = std::env::var("SALA_ENCRYPTION_FAIL_OPEN")
		&& let Some(fail_open) = parse_env_bool(&v)
	{
		cfg.encryption.fail_open = fail_open;
		info!(fail_open, "encryption: fail_open overridden by env");
	}
}
