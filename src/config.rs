//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `REACHD_API_KEY`, `REACHD_LISTEN`,
//!    `REACHD_TUNNEL_LISTEN`
//! 2. **Config file**: path via `--config <path>`, or `reachd.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8090"
//! read_cap_bytes = 2097152  # 2 MiB
//! connect_timeout_ms = 10000
//! command_timeout_ms = 30000
//! max_sftp_concurrency = 16
//!
//! [auth]
//! api_key = "your-secret-key"
//!
//! [tunnel]
//! listen = "0.0.0.0:2222"
//! host_key_path = "/var/lib/reachd/host_key"
//! forward_bind_host = "127.0.0.1"
//! port_range_start = 40000
//! port_range_end = 41000
//!
//! [logging]
//! level = "info"
//!
//! [[servers]]
//! id = "edge-01"
//! connect_type = "tunnel"            # direct | tunnel | local
//! user = "root"
//! auth_type = "password"             # password | key
//! secret = "cGFzc3dvcmQ="            # base64
//! tunnel_token = "dG9rZW4="          # base64
//! services = [{ name = "ssh", tunnel_port = 40000 }]
//! ```

use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::store::ServerRecord;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid tunnel port range {start}-{end}")]
    PortRange { start: u16, end: u16 },
    #[error("duplicate server id {0:?}")]
    DuplicateServer(String),
}

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Statically configured servers.
    #[serde(default)]
    pub servers: Vec<ServerRecord>,
}

/// HTTP server and remote-operation settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:8090`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Hard cap for SFTP reads in bytes (default 2 MiB).
    #[serde(default = "default_read_cap_bytes")]
    pub read_cap_bytes: u64,
    /// Deadline for dial + handshake + auth in milliseconds (default 10 000).
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Deadline for one remote command or SFTP operation (default 30 000).
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    /// Concurrent SFTP requests before callers queue (default 16).
    #[serde(default = "default_max_sftp_concurrency")]
    pub max_sftp_concurrency: usize,
    /// Terminal rows when the client does not say (default 24).
    #[serde(default = "default_rows")]
    pub default_rows: u16,
    /// Terminal columns when the client does not say (default 80).
    #[serde(default = "default_cols")]
    pub default_cols: u16,
    /// Shell for container exec when neither request nor server names one.
    #[serde(default = "default_shell")]
    pub default_shell: String,
}

/// Authentication settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Pre-shared Bearer token. Override with `REACHD_API_KEY` env var.
    /// Defaults to `"change-me"` which triggers a startup warning.
    #[serde(default = "default_api_key")]
    pub api_key: String,
}

/// SSH tunnel broker settings.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
    /// Run the broker (default true).
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// SSH listen address (default `0.0.0.0:2222`).
    #[serde(default = "default_tunnel_listen")]
    pub listen: String,
    /// OpenSSH private key; generated (Ed25519) when missing.
    #[serde(default = "default_host_key_path")]
    pub host_key_path: String,
    /// Address forwarded service listeners bind to (default `127.0.0.1`).
    #[serde(default = "default_forward_bind_host")]
    pub forward_bind_host: String,
    /// First port of the forward pool, inclusive (default 40000).
    #[serde(default = "default_port_range_start")]
    pub port_range_start: u16,
    /// End of the forward pool, exclusive (default 41000).
    #[serde(default = "default_port_range_end")]
    pub port_range_end: u16,
    /// Delay before answering a failed auth attempt (default 1).
    #[serde(default = "default_auth_rejection_secs")]
    pub auth_rejection_secs: u64,
    /// Close connections idle this long; 0 disables (default 0).
    #[serde(default)]
    pub inactivity_timeout_secs: u64,
    /// SSH keepalive interval; 0 disables (default 30).
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:8090".to_string()
}
fn default_read_cap_bytes() -> u64 {
    2 * 1024 * 1024 // 2 MiB
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_command_timeout_ms() -> u64 {
    30_000
}
fn default_max_sftp_concurrency() -> usize {
    16
}
fn default_rows() -> u16 {
    24
}
fn default_cols() -> u16 {
    80
}
fn default_shell() -> String {
    "/bin/sh".to_string()
}
fn default_api_key() -> String {
    "change-me".to_string()
}
fn default_true() -> bool {
    true
}
fn default_tunnel_listen() -> String {
    "0.0.0.0:2222".to_string()
}
fn default_host_key_path() -> String {
    "reachd_host_key".to_string()
}
fn default_forward_bind_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port_range_start() -> u16 {
    40000
}
fn default_port_range_end() -> u16 {
    41000
}
fn default_auth_rejection_secs() -> u64 {
    1
}
fn default_keepalive_interval_secs() -> u64 {
    30
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            read_cap_bytes: default_read_cap_bytes(),
            connect_timeout_ms: default_connect_timeout_ms(),
            command_timeout_ms: default_command_timeout_ms(),
            max_sftp_concurrency: default_max_sftp_concurrency(),
            default_rows: default_rows(),
            default_cols: default_cols(),
            default_shell: default_shell(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_key: default_api_key(),
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: default_tunnel_listen(),
            host_key_path: default_host_key_path(),
            forward_bind_host: default_forward_bind_host(),
            port_range_start: default_port_range_start(),
            port_range_end: default_port_range_end(),
            auth_rejection_secs: default_auth_rejection_secs(),
            inactivity_timeout_secs: 0,
            keepalive_interval_secs: default_keepalive_interval_secs(),
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

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist and parse. Otherwise looks
    /// for `reachd.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new("reachd.toml").exists() => Self::from_file("reachd.toml")?,
            None => Config::default(),
        };

        if let Ok(key) = std::env::var("REACHD_API_KEY") {
            config.auth.api_key = key;
        }
        if let Ok(listen) = std::env::var("REACHD_LISTEN") {
            config.server.listen = listen;
        }
        if let Ok(listen) = std::env::var("REACHD_TUNNEL_LISTEN") {
            config.tunnel.listen = listen;
        }

        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::parse(&content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    /// Parse TOML text without env overrides or validation.
    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let (start, end) = (self.tunnel.port_range_start, self.tunnel.port_range_end);
        if start == 0 || start >= end {
            return Err(ConfigError::PortRange { start, end });
        }
        let mut seen = HashSet::new();
        for server in &self.servers {
            if !seen.insert(server.id.as_str()) {
                return Err(ConfigError::DuplicateServer(server.id.clone()));
            }
        }
        Ok(())
    }
}
