//! Shared ingress state.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use shroud_proto::Endpoint;
use tokio::task::AbortHandle;

use crate::config::Config;
use crate::ech::EchCache;
use crate::ranges::RangeTables;

pub struct AppState {
    pub config: Config,
    /// Egress endpoint parsed from the config.
    pub server: Endpoint,
    /// Upgrade path on the egress ("/" when none given).
    pub server_path: String,
    /// CN range tables; written only by the startup loader. Readers clone
    /// the Arc so no guard is held across awaits.
    ranges: RwLock<Arc<RangeTables>>,
    /// ECH ConfigList cache; written only by the refresh path.
    pub ech: EchCache,
    /// HTTP client for the DoH bootstrap and range downloads.
    pub http: reqwest::Client,
    /// Live connections, for teardown on stop.
    pub conns: ConnTracker,
}

impl AppState {
    pub fn new(config: Config, ranges: RangeTables, http: reqwest::Client) -> anyhow::Result<Self> {
        let (server, server_path) = config.server_endpoint()?;
        Ok(Self {
            config,
            server,
            server_path,
            ranges: RwLock::new(Arc::new(ranges)),
            ech: EchCache::default(),
            http,
            conns: ConnTracker::default(),
        })
    }

    pub fn ranges(&self) -> Arc<RangeTables> {
        Arc::clone(&self.ranges.read())
    }

    /// Address the tunnel dial actually connects to: the override IP when
    /// configured, otherwise the resolved server host.
    pub async fn dial_addr(&self) -> anyhow::Result<SocketAddr> {
        if let Some(ip) = self.config.server_ip {
            return Ok(SocketAddr::new(ip, self.server.port));
        }
        tokio::net::lookup_host((self.server.host.as_str(), self.server.port))
            .await?
            .next()
            .ok_or_else(|| anyhow::anyhow!("no addresses for {}", self.server))
    }
}

/// Registry of live connection tasks, used only to cancel them on stop.
#[derive(Default)]
pub struct ConnTracker {
    conns: DashMap<u64, AbortHandle>,
    next_id: AtomicU64,
}

impl ConnTracker {
    pub fn register(&self, handle: AbortHandle) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.conns.insert(id, handle);
        id
    }

    pub fn deregister(&self, id: u64) {
        self.conns.remove(&id);
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    /// Abort every tracked connection. Called once during shutdown.
    pub fn abort_all(&self) {
        for entry in self.conns.iter() {
            entry.value().abort();
        }
        self.conns.clear();
    }
}
