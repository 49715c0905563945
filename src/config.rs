//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `EDGETUN_TUNNEL_SERVER`,
//!    `EDGETUN_LOCAL_RELAY`
//! 2. **Config file** — path via `--config <path>`, or `edgetun.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [tunnel]
//! server = "tunnel.example.com:443"    # remote tunnel server, host[:port]
//! local_relay = "127.0.0.1:8080"       # local relay, host:port (no scheme)
//! ping_timeout_secs = 30
//! # proxy = "http://proxy.internal:3128"
//! # local_source_ip = "192.0.2.10"
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Tunnel endpoints and connection tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
    /// Remote tunnel server as `host[:port]`. The `wss://` scheme is implied.
    #[serde(default)]
    pub server: String,
    /// Local relay as `host:port`. Must not carry a scheme.
    #[serde(default)]
    pub local_relay: String,
    /// Maximum gap between pongs before the session is torn down (default 30).
    /// Also bounds the ping interval at a third of this value.
    #[serde(default = "default_ping_timeout_secs")]
    pub ping_timeout_secs: u64,
    /// Optional HTTP proxy URL for the outbound connection.
    pub proxy: Option<String>,
    /// Optional local IP to bind outbound sockets to.
    pub local_source_ip: Option<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_ping_timeout_secs() -> u64 {
    30
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            local_relay: String::new(),
            ping_timeout_secs: default_ping_timeout_secs(),
            proxy: None,
            local_source_ip: None,
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
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise
    /// looks for `edgetun.toml` in the current directory, falling back to
    /// compiled defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("edgetun.toml").exists() {
            let content =
                std::fs::read_to_string("edgetun.toml").expect("Failed to read edgetun.toml");
            toml::from_str(&content).expect("Failed to parse edgetun.toml")
        } else {
            Config {
                tunnel: TunnelConfig::default(),
                logging: LoggingConfig::default(),
            }
        };

        // Env var overrides
        if let Ok(server) = std::env::var("EDGETUN_TUNNEL_SERVER") {
            config.tunnel.server = server;
        }
        if let Ok(relay) = std::env::var("EDGETUN_LOCAL_RELAY") {
            config.tunnel.local_relay = relay;
        }

        config
    }
}
