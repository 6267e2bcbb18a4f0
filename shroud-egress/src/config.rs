use std::collections::HashSet;
use std::net::SocketAddr;

use clap::Parser;
use shroud_proto::addr::{parse_fallback_list, FallbackAddr};

/// Shroud egress worker.
///
/// Accepts authenticated WebSocket upgrades, reads the framed session
/// protocol, and relays bytes between the WebSocket and an upstream TCP
/// connection chosen by the client's CONNECT frame.
#[derive(Parser, Debug, Clone)]
#[command(version, about)]
pub struct Config {
    /// Address to listen on
    #[arg(long, env = "SHROUD_LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Shared token clients must offer as the WebSocket subprotocol
    #[arg(long, env = "SHROUD_TOKEN")]
    pub token: Option<String>,

    /// Comma-separated fallback endpoints tried after a transient dial failure
    /// (e.g. "1.2.3.4:21415,proxy.example.net")
    #[arg(long, env = "SHROUD_FALLBACK_IPS", default_value = "")]
    pub fallback_ips: String,

    /// Upstream TCP connect timeout in milliseconds
    #[arg(long, env = "SHROUD_CONNECT_TIMEOUT_MS", default_value_t = 5000)]
    pub connect_timeout_ms: u64,

    /// Session read timeout in milliseconds (no relay progress -> close)
    #[arg(long, env = "SHROUD_READ_TIMEOUT_MS", default_value_t = 180_000)]
    pub read_timeout_ms: u64,

    /// Maximum concurrent tunnel sessions
    #[arg(long, env = "SHROUD_MAX_SESSIONS", default_value_t = 100)]
    pub max_sessions: usize,

    /// Comma-separated list of destination hosts clients may CONNECT to
    /// (empty = any host)
    #[arg(long, env = "SHROUD_ALLOWED_HOSTS", value_delimiter = ',')]
    pub allowed_hosts: Vec<String>,

    /// Access-Control-Allow-Origin header value on upgrade responses
    #[arg(long, env = "SHROUD_ALLOW_ORIGIN", default_value = "*")]
    pub allow_origin: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "SHROUD_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "SHROUD_LOG_JSON", default_value_t = false)]
    pub log_json: bool,
}

impl Config {
    /// Parse the configured fallback list. Invalid entries are a startup
    /// error.
    pub fn fallbacks(&self) -> anyhow::Result<Vec<FallbackAddr>> {
        parse_fallback_list(&self.fallback_ips)
            .map_err(|e| anyhow::anyhow!("invalid SHROUD_FALLBACK_IPS: {e}"))
    }

    /// Allowed destination hosts, lowercased. Empty set means any host.
    pub fn allowed_hosts(&self) -> HashSet<String> {
        self.allowed_hosts
            .iter()
            .map(|h| h.trim().to_ascii_lowercase())
            .filter(|h| !h.is_empty())
            .collect()
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_sessions == 0 {
            anyhow::bail!("SHROUD_MAX_SESSIONS must be at least 1");
        }
        if self.connect_timeout_ms == 0 || self.read_timeout_ms == 0 {
            anyhow::bail!("timeouts must be non-zero");
        }
        self.fallbacks()?;
        Ok(())
    }
}
