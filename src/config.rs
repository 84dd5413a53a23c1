//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `SHROUD_LISTEN`, `SHROUD_AES_KEY` (or
//!    `AES_KEY`), `SHROUD_XOR_KEY` (or `OBFUSCATION_KEY`), `SHROUD_RELAY_URL`,
//!    `SHROUD_LOCAL_APP_URL`
//! 2. **Config file**: path via `--config <path>`, or `shroud.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:3003"
//! max_connections = 256
//!
//! [obfuscation]
//! aes_key = "<64 hex chars>"      # random per process if omitted
//! xor_key = "default-32-byte-key-for-xor-obfuscation!"
//! methods = ["xor", "aes", "base64"]
//! rotation_secs = 300
//!
//! [relay]
//! poll_interval_ms = 1000
//! max_poll_timeout_ms = 10000
//! resync_suffix = 3
//! max_queue_len = 1024
//! duplicate_retention_secs = 300
//! client_idle_secs = 300
//! sweep_interval_secs = 30
//! static_timeout_ms = 3000
//! request_timeout_ms = 10000
//! sync_timeout_ms = 10000
//! static_cache_max_age_secs = 300
//!
//! [agent]
//! relay_url = "http://relay.example.com:3003"
//! local_app_url = "http://127.0.0.1:8000"
//! client_id = "laptop-office"              # optional stable identity
//! poll_interval_ms = 1000
//! request_timeout_ms = 30000
//! ping_interval_secs = 30
//! reconnect_delay_secs = 1
//! reconnect_max_delay_secs = 60
//!
//! [logging]
//! level = "info"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

/// Why configuration could not be loaded.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub obfuscation: ObfuscationConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:3003`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Maximum requests served concurrently (default 256).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Codec keys and rotation.
#[derive(Debug, Clone, Deserialize)]
pub struct ObfuscationConfig {
    /// AES-256-GCM key as 64 hex characters. Override with `SHROUD_AES_KEY`.
    #[serde(default)]
    pub aes_key: Option<String>,
    /// Repeating XOR key. Override with `SHROUD_XOR_KEY`.
    #[serde(default = "default_xor_key")]
    pub xor_key: String,
    /// Rotation order of the default method.
    #[serde(default = "default_methods")]
    pub methods: Vec<String>,
    /// Seconds between rotations (default 300).
    #[serde(default = "default_rotation_secs")]
    pub rotation_secs: u64,
}

/// Queueing, polling and lease timings.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Advertised to pollers as `next_poll_in` (default 1000).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Upper bound on a long poll (default 10 000).
    #[serde(default = "default_max_poll_timeout_ms")]
    pub max_poll_timeout_ms: u64,
    /// Frames returned to a poller whose cursor is unknown (default 3).
    #[serde(default = "default_resync_suffix")]
    pub resync_suffix: usize,
    /// Undelivered frames kept per client before the oldest is dropped (default 1024).
    #[serde(default = "default_max_queue_len")]
    pub max_queue_len: usize,
    /// How long duplicate frames and responses are remembered (default 300).
    #[serde(default = "default_duplicate_retention_secs")]
    pub duplicate_retention_secs: u64,
    /// Clients silent for this long are evicted (default 300).
    #[serde(default = "default_client_idle_secs")]
    pub client_idle_secs: u64,
    /// Period of the housekeeping sweep (default 30).
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Lease for static-asset fetches (default 3000).
    #[serde(default = "default_static_timeout_ms")]
    pub static_timeout_ms: u64,
    /// Lease for browser requests (default 10 000).
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Lease for session-sync requests (default 10 000).
    #[serde(default = "default_sync_timeout_ms")]
    pub sync_timeout_ms: u64,
    /// `max-age` on relayed static assets (default 300).
    #[serde(default = "default_static_cache_max_age_secs")]
    pub static_cache_max_age_secs: u64,
    /// Reported in registration responses.
    #[serde(default = "default_server_version")]
    pub server_version: String,
}

/// Settings for `shroud agent`.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Relay base URL. Override with `SHROUD_RELAY_URL`.
    #[serde(default = "default_relay_url")]
    pub relay_url: String,
    /// Local app requests are replayed against. Override with `SHROUD_LOCAL_APP_URL`.
    #[serde(default = "default_local_app_url")]
    pub local_app_url: String,
    /// Stable identity across reconnects; assigned by the relay if unset.
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Timeout for one local-app request (default 30 000).
    #[serde(default = "default_agent_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Seconds between PING frames (default 30).
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    /// Initial reconnect backoff (default 1).
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
    /// Maximum reconnect backoff (default 60).
    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:3003".to_string()
}
fn default_max_connections() -> usize {
    256
}
fn default_xor_key() -> String {
    crate::obfuscation::xor::DEFAULT_XOR_KEY.to_string()
}
fn default_methods() -> Vec<String> {
    vec!["xor".into(), "aes".into(), "base64".into()]
}
fn default_rotation_secs() -> u64 {
    300
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_max_poll_timeout_ms() -> u64 {
    10_000
}
fn default_resync_suffix() -> usize {
    3
}
fn default_max_queue_len() -> usize {
    1024
}
fn default_duplicate_retention_secs() -> u64 {
    300
}
fn default_client_idle_secs() -> u64 {
    300
}
fn default_sweep_interval_secs() -> u64 {
    30
}
fn default_static_timeout_ms() -> u64 {
    3000
}
fn default_request_timeout_ms() -> u64 {
    10_000
}
fn default_sync_timeout_ms() -> u64 {
    10_000
}
fn default_static_cache_max_age_secs() -> u64 {
    300
}
fn default_server_version() -> String {
    "1.0.0-fast".to_string()
}
fn default_relay_url() -> String {
    "http://127.0.0.1:3003".to_string()
}
fn default_local_app_url() -> String {
    "http://127.0.0.1:8000".to_string()
}
fn default_agent_request_timeout_ms() -> u64 {
    30_000
}
fn default_ping_interval_secs() -> u64 {
    30
}
fn default_reconnect_delay() -> u64 {
    1
}
fn default_reconnect_max_delay() -> u64 {
    60
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for ObfuscationConfig {
    fn default() -> Self {
        Self {
            aes_key: None,
            xor_key: default_xor_key(),
            methods: default_methods(),
            rotation_secs: default_rotation_secs(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            max_poll_timeout_ms: default_max_poll_timeout_ms(),
            resync_suffix: default_resync_suffix(),
            max_queue_len: default_max_queue_len(),
            duplicate_retention_secs: default_duplicate_retention_secs(),
            client_idle_secs: default_client_idle_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            static_timeout_ms: default_static_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            sync_timeout_ms: default_sync_timeout_ms(),
            static_cache_max_age_secs: default_static_cache_max_age_secs(),
            server_version: default_server_version(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            relay_url: default_relay_url(),
            local_app_url: default_local_app_url(),
            client_id: None,
            poll_interval_ms: default_poll_interval_ms(),
            request_timeout_ms: default_agent_request_timeout_ms(),
            ping_interval_secs: default_ping_interval_secs(),
            reconnect_delay_secs: default_reconnect_delay(),
            reconnect_max_delay_secs: default_reconnect_max_delay(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl RelayConfig {
    pub fn static_timeout(&self) -> Duration {
        Duration::from_millis(self.static_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file. Otherwise looks for `shroud.toml`
    /// in the current directory, falling back to compiled defaults.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(p) => Some(p),
            None if Path::new("shroud.toml").exists() => Some("shroud.toml"),
            None => None,
        };
        let mut config = match file {
            Some(p) => Self::from_file(p)?,
            None => Config::default(),
        };
        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    /// Apply environment overrides. `lookup` returns a variable's value, if set.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let first = |names: &[&str]| names.iter().find_map(|n| lookup(n));

        if let Some(listen) = first(&["SHROUD_LISTEN"]) {
            self.server.listen = listen;
        }
        if let Some(key) = first(&["SHROUD_AES_KEY", "AES_KEY"]) {
            self.obfuscation.aes_key = Some(key);
        }
        if let Some(key) = first(&["SHROUD_XOR_KEY", "OBFUSCATION_KEY"]) {
            self.obfuscation.xor_key = key;
        }
        if let Some(url) = first(&["SHROUD_RELAY_URL"]) {
            self.agent.relay_url = url;
        }
        if let Some(url) = first(&["SHROUD_LOCAL_APP_URL"]) {
            self.agent.local_app_url = url;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = Config::default();
        assert_eq!(c.server.listen, "0.0.0.0:3003");
        assert_eq!(c.obfuscation.methods, ["xor", "aes", "base64"]);
        assert_eq!(c.relay.resync_suffix, 3);
        assert_eq!(c.relay.static_timeout(), Duration::from_secs(3));
        assert_eq!(c.relay.server_version, "1.0.0-fast");
        assert_eq!(c.agent.local_app_url, "http://127.0.0.1:8000");
        assert!(c.obfuscation.aes_key.is_none());
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let c: Config = toml::from_str(
            r#"
            [relay]
            request_timeout_ms = 2500

            [obfuscation]
            methods = ["aes"]
            "#,
        )
        .unwrap();
        assert_eq!(c.relay.request_timeout_ms, 2500);
        assert_eq!(c.relay.poll_interval_ms, 1000);
        assert_eq!(c.obfuscation.methods, ["aes"]);
        assert_eq!(c.obfuscation.rotation_secs, 300);
        assert_eq!(c.logging.level, "info");
    }

    #[test]
    fn env_overrides_and_aliases() {
        let env: HashMap<&str, &str> = [
            ("SHROUD_LISTEN", "127.0.0.1:9000"),
            ("AES_KEY", "ab"),
            ("OBFUSCATION_KEY", "legacy"),
            ("SHROUD_XOR_KEY", "preferred"),
        ]
        .into_iter()
        .collect();
        let mut c = Config::default();
        c.apply_env(|n| env.get(n).map(|v| (*v).to_string()));
        assert_eq!(c.server.listen, "127.0.0.1:9000");
        assert_eq!(c.obfuscation.aes_key.as_deref(), Some("ab"));
        assert_eq!(c.obfuscation.xor_key, "preferred");
        assert_eq!(c.agent.relay_url, "http://127.0.0.1:3003");
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = Config::load(Some("/nonexistent/shroud.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
