//! Shared egress state: config, admission control, session gauge.

use std::collections::HashSet;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use shroud_proto::addr::FallbackAddr;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::Config;

pub struct AppState {
    pub config: Config,
    /// Fallback endpoints parsed once at startup.
    pub fallbacks: Vec<FallbackAddr>,
    /// Allowed destination hosts (lowercase). Empty = any.
    pub allowed_hosts: HashSet<String>,
    /// Admission control: one permit per live session.
    sessions: Arc<Semaphore>,
    /// Monotonic session id for log correlation.
    pub next_session_id: AtomicU64,
}

impl AppState {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let fallbacks = config.fallbacks()?;
        let allowed_hosts = config.allowed_hosts();
        let sessions = Arc::new(Semaphore::new(config.max_sessions));
        Ok(Self {
            config,
            fallbacks,
            allowed_hosts,
            sessions,
            next_session_id: AtomicU64::new(1),
        })
    }

    /// Try to admit a new session. `None` means the pool is exhausted and
    /// the upgrade must be rejected with 503.
    pub fn try_admit(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.sessions).try_acquire_owned().ok()
    }

    /// Live session count (for logs).
    pub fn active_sessions(&self) -> usize {
        self.config.max_sessions - self.sessions.available_permits()
    }

    /// True when `host` may be dialed.
    pub fn host_allowed(&self, host: &str) -> bool {
        self.allowed_hosts.is_empty() || self.allowed_hosts.contains(&host.to_ascii_lowercase())
    }
}
