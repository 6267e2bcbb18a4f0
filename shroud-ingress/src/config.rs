use clap::Parser;
use shroud_proto::addr::Endpoint;

use crate::routing::RoutingMode;

/// Shroud ingress proxy.
///
/// Listens on a loopback port for SOCKS5 and HTTP(S)-CONNECT traffic and
/// relays it to a Shroud egress worker over a TLS WebSocket whose
/// ClientHello is hidden with Encrypted Client Hello (ECH). Traffic to CN
/// destinations can be split off to direct connections.
#[derive(Parser, Debug, Clone)]
#[command(version, about)]
pub struct Config {
    /// Local listen address for SOCKS5/HTTP clients
    #[arg(long, env = "SHROUD_LISTEN", default_value = "127.0.0.1:30000")]
    pub listen: std::net::SocketAddr,

    /// Egress server, `host:port` with an optional path
    /// (e.g. "worker.example.com:443/tunnel")
    #[arg(long, env = "SHROUD_SERVER")]
    pub server: String,

    /// Dial this IP instead of resolving the server hostname
    #[arg(long, env = "SHROUD_SERVER_IP")]
    pub server_ip: Option<std::net::IpAddr>,

    /// Shared token offered as the WebSocket subprotocol
    #[arg(long, env = "SHROUD_TOKEN")]
    pub token: Option<String>,

    /// DoH endpoint used to resolve the ECH HTTPS record
    #[arg(long, env = "SHROUD_DOH_URL", default_value = "dns.alidns.com/dns-query")]
    pub doh_url: String,

    /// Domain whose HTTPS record carries the ECH ConfigList
    #[arg(long, env = "SHROUD_ECH_DOMAIN", default_value = "cloudflare-ech.com")]
    pub ech_domain: String,

    /// Routing policy: tunnel everything, bypass CN ranges, or direct-only
    #[arg(long, env = "SHROUD_ROUTING", value_enum, default_value_t = RoutingMode::BypassCn)]
    pub routing: RoutingMode,

    /// Permit dialing without ECH when no ConfigList can be resolved
    #[arg(long, env = "SHROUD_ALLOW_NO_ECH", default_value_t = false)]
    pub allow_no_ech: bool,

    /// IPv4 CN range file (space-separated `start end` per line)
    #[arg(long, env = "SHROUD_CHN_IP_FILE", default_value = "chn_ip.txt")]
    pub chn_ip_file: String,

    /// IPv6 CN range file
    #[arg(long, env = "SHROUD_CHN_IP_V6_FILE", default_value = "chn_ip_v6.txt")]
    pub chn_ip_v6_file: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "SHROUD_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "SHROUD_LOG_JSON", default_value_t = false)]
    pub log_json: bool,
}

impl Config {
    /// Split the configured server into endpoint and upgrade path.
    /// A missing port defaults to 443; a missing path to "/".
    pub fn server_endpoint(&self) -> anyhow::Result<(Endpoint, String)> {
        parse_server_addr(&self.server)
    }

    /// The DoH URL with an https scheme forced on.
    pub fn doh_url(&self) -> String {
        if self.doh_url.starts_with("https://") || self.doh_url.starts_with("http://") {
            self.doh_url.clone()
        } else {
            format!("https://{}", self.doh_url)
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.server_endpoint()?;
        if self.ech_domain.trim().is_empty() {
            anyhow::bail!("ech domain must not be empty");
        }
        Ok(())
    }
}

fn parse_server_addr(s: &str) -> anyhow::Result<(Endpoint, String)> {
    let s = s.trim();
    let s = s
        .strip_prefix("wss://")
        .or_else(|| s.strip_prefix("https://"))
        .unwrap_or(s);

    let (authority, path) = match s.find('/') {
        Some(idx) => (&s[..idx], &s[idx..]),
        None => (s, "/"),
    };

    let endpoint = match Endpoint::parse(authority) {
        Ok(ep) => ep,
        // No port: default to 443.
        Err(shroud_proto::ParseAddrError::MissingPort(_)) if !authority.is_empty() => {
            let host = authority
                .strip_prefix('[')
                .and_then(|rest| rest.strip_suffix(']'))
                .unwrap_or(authority);
            Endpoint::new(host, 443)
        }
        Err(e) => anyhow::bail!("invalid server address {s:?}: {e}"),
    };
    Ok((endpoint, path.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_with_port_and_path() {
        let (ep, path) = parse_server_addr("worker.example.com:8443/tunnel").unwrap();
        assert_eq!(ep, Endpoint::new("worker.example.com", 8443));
        assert_eq!(path, "/tunnel");
    }

    #[test]
    fn server_defaults() {
        let (ep, path) = parse_server_addr("worker.example.com").unwrap();
        assert_eq!(ep, Endpoint::new("worker.example.com", 443));
        assert_eq!(path, "/");
    }

    #[test]
    fn server_scheme_stripped() {
        let (ep, _) = parse_server_addr("wss://worker.example.com:443/ws").unwrap();
        assert_eq!(ep.port, 443);
    }

    #[test]
    fn server_v6() {
        let (ep, path) = parse_server_addr("[2001:db8::1]:443/t").unwrap();
        assert_eq!(ep.host, "2001:db8::1");
        assert_eq!(path, "/t");

        let (ep, _) = parse_server_addr("[2001:db8::1]").unwrap();
        assert_eq!(ep.port, 443);
    }

    #[test]
    fn doh_url_scheme_forced() {
        let mut cfg = Config::parse_from(["shroud-ingress", "--server", "w.example.com:443"]);
        assert_eq!(cfg.doh_url(), "https://dns.alidns.com/dns-query");
        cfg.doh_url = "https://cloudflare-dns.com/dns-query".into();
        assert_eq!(cfg.doh_url(), "https://cloudflare-dns.com/dns-query");
    }
}
