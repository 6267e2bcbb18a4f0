//! ECH ConfigList cache and TLS client configuration.
//!
//! The ConfigList is fetched once (from the ECH domain's HTTPS record via
//! DoH) and cached for the life of the process; a dial failure that names
//! ECH clears the cache so the next attempt re-fetches. rustls treats a
//! server's ECH rejection as a hard handshake failure, so a rejected outer
//! certificate is never trusted.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use rustls::client::EchMode;
use rustls::crypto::aws_lc_rs;
use rustls_pki_types::EchConfigListBytes;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::doh;

/// Process-lifetime cache of the ECH ConfigList.
#[derive(Default)]
pub struct EchCache {
    config_list: ArcSwapOption<Vec<u8>>,
}

impl EchCache {
    pub fn get(&self) -> Option<Arc<Vec<u8>>> {
        self.config_list.load_full()
    }

    pub fn set(&self, bytes: Vec<u8>) {
        self.config_list.store(Some(Arc::new(bytes)));
    }

    /// Drop the cached list so the next dial re-fetches.
    pub fn clear(&self) {
        self.config_list.store(None);
    }
}

/// Return the cached ConfigList, fetching it over DoH when absent.
pub async fn ensure_config_list(
    cache: &EchCache,
    http: &reqwest::Client,
    config: &Config,
) -> Option<Arc<Vec<u8>>> {
    if let Some(list) = cache.get() {
        return Some(list);
    }
    match doh::fetch_ech_config(http, &config.doh_url(), &config.ech_domain).await {
        Ok(bytes) => {
            info!(
                domain = %config.ech_domain,
                len = bytes.len(),
                "ECH ConfigList resolved"
            );
            cache.set(bytes);
            cache.get()
        }
        Err(e) => {
            warn!(domain = %config.ech_domain, error = %e, "ECH ConfigList fetch failed");
            None
        }
    }
}

/// Build the TLS client config used for the tunnel dial: TLS 1.3 only,
/// webpki roots, and ECH enabled when a ConfigList is available.
pub fn build_tls_config(ech_config_list: Option<&[u8]>) -> anyhow::Result<rustls::ClientConfig> {
    let roots =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let provider = Arc::new(aws_lc_rs::default_provider());

    let config = match ech_config_list {
        Some(bytes) => {
            let ech_config = rustls::client::EchConfig::new(
                EchConfigListBytes::from(bytes.to_vec()),
                aws_lc_rs::hpke::ALL_SUPPORTED_SUITES,
            )?;
            rustls::ClientConfig::builder_with_provider(provider)
                .with_ech(EchMode::from(ech_config))?
                .with_root_certificates(roots)
                .with_no_client_auth()
        }
        None => {
            debug!("building TLS config without ECH");
            rustls::ClientConfig::builder_with_provider(provider)
                .with_protocol_versions(&[&rustls::version::TLS13])?
                .with_root_certificates(roots)
                .with_no_client_auth()
        }
    };
    Ok(config)
}

/// True when a dial failure names ECH and is worth an ECH refresh + retry.
/// Matches "ech" as a word rather than a substring so that e.g.
/// "mechanism" does not trigger a refresh.
pub fn is_ech_error(msg: &str) -> bool {
    let msg = msg.to_ascii_lowercase();
    msg.contains("encrypted client hello")
        || msg.contains("encryptedclienthello")
        || msg
            .split(|c: char| !c.is_ascii_alphanumeric())
            .any(|token| token == "ech")
}
