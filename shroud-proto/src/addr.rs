//! Endpoint and fallback-address parsing.
//!
//! Canonical forms are `host:port` and `[v6]:port`. Path segments of an
//! egress URL additionally accept a `host-port` alias because `:` does not
//! survive URL paths.

use std::fmt;
use std::str::FromStr;

/// Address parsing errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseAddrError {
    #[error("empty address")]
    Empty,
    #[error("missing port in {0:?}")]
    MissingPort(String),
    #[error("invalid port in {0:?}")]
    InvalidPort(String),
    #[error("empty host in {0:?}")]
    EmptyHost(String),
    #[error("unbalanced brackets in {0:?}")]
    UnbalancedBrackets(String),
}

/// A `host:port` pair. The host is a DNS name, an IPv4 literal, or an IPv6
/// literal stored without brackets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host:port` or `[v6]:port`.
    ///
    /// Port 0 is rejected; an IPv6 literal without a port is rejected.
    pub fn parse(s: &str) -> Result<Self, ParseAddrError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ParseAddrError::Empty);
        }

        if let Some(rest) = s.strip_prefix('[') {
            // [v6]:port
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| ParseAddrError::UnbalancedBrackets(s.to_string()))?;
            let port_str = tail
                .strip_prefix(':')
                .ok_or_else(|| ParseAddrError::MissingPort(s.to_string()))?;
            if host.is_empty() {
                return Err(ParseAddrError::EmptyHost(s.to_string()));
            }
            return Ok(Self::new(host, parse_port(port_str, s)?));
        }

        // A bare IPv6 literal has more than one colon and no brackets; with
        // no way to tell host from port, reject it.
        if s.matches(':').count() > 1 {
            return Err(ParseAddrError::MissingPort(s.to_string()));
        }

        let (host, port_str) = s
            .rsplit_once(':')
            .ok_or_else(|| ParseAddrError::MissingPort(s.to_string()))?;
        if host.is_empty() {
            return Err(ParseAddrError::EmptyHost(s.to_string()));
        }
        Ok(Self::new(host, parse_port(port_str, s)?))
    }

    /// True if the host is an IPv4 or IPv6 literal rather than a DNS name.
    pub fn is_ip_literal(&self) -> bool {
        self.host.parse::<std::net::IpAddr>().is_ok()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = ParseAddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn parse_port(s: &str, whole: &str) -> Result<u16, ParseAddrError> {
    match s.parse::<u16>() {
        Ok(0) | Err(_) => Err(ParseAddrError::InvalidPort(whole.to_string())),
        Ok(p) => Ok(p),
    }
}

/// A fallback endpoint whose port may be omitted, in which case the target
/// port is inherited at attempt time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackAddr {
    pub host: String,
    pub port: Option<u16>,
}

impl FallbackAddr {
    /// Parse one comma-list item: `host`, `host:port`, `[v6]`, `[v6]:port`,
    /// or a bare IPv6 literal.
    pub fn parse(s: &str) -> Result<Self, ParseAddrError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ParseAddrError::Empty);
        }

        if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| ParseAddrError::UnbalancedBrackets(s.to_string()))?;
            if host.is_empty() {
                return Err(ParseAddrError::EmptyHost(s.to_string()));
            }
            let port = match tail.strip_prefix(':') {
                Some(p) => Some(parse_port(p, s)?),
                None if tail.is_empty() => None,
                None => return Err(ParseAddrError::InvalidPort(s.to_string())),
            };
            return Ok(Self {
                host: host.to_string(),
                port,
            });
        }

        // Bare IPv6 literal: keep whole string as host.
        if s.matches(':').count() > 1 {
            return Ok(Self {
                host: s.to_string(),
                port: None,
            });
        }

        match s.rsplit_once(':') {
            Some((host, port_str)) => {
                if host.is_empty() {
                    return Err(ParseAddrError::EmptyHost(s.to_string()));
                }
                Ok(Self {
                    host: host.to_string(),
                    port: Some(parse_port(port_str, s)?),
                })
            }
            None => Ok(Self {
                host: s.to_string(),
                port: None,
            }),
        }
    }

    /// Parse one URL path segment item, where `host-port` aliases
    /// `host:port`. Only the last hyphen is considered, and only when its
    /// suffix is a valid port, so hyphenated DNS names pass through intact.
    pub fn parse_path_segment(s: &str) -> Result<Self, ParseAddrError> {
        let s = s.trim();
        if let Some((host, port_str)) = s.rsplit_once('-') {
            if !host.is_empty() && !s.contains(':') {
                if let Ok(port @ 1..) = port_str.parse::<u16>() {
                    return Ok(Self {
                        host: host.to_string(),
                        port: Some(port),
                    });
                }
            }
        }
        Self::parse(s)
    }

    /// Resolve against a target port: a fallback without a port inherits it.
    pub fn endpoint(&self, default_port: u16) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port.unwrap_or(default_port))
    }
}

impl fmt::Display for FallbackAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bracketed = self.host.contains(':');
        match (bracketed, self.port) {
            (true, Some(p)) => write!(f, "[{}]:{}", self.host, p),
            (true, None) => write!(f, "{}", self.host),
            (false, Some(p)) => write!(f, "{}:{}", self.host, p),
            (false, None) => write!(f, "{}", self.host),
        }
    }
}

/// Parse a comma-separated fallback list. Empty items are skipped; a
/// malformed item fails the whole list.
pub fn parse_fallback_list(s: &str) -> Result<Vec<FallbackAddr>, ParseAddrError> {
    s.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(FallbackAddr::parse)
        .collect()
}

/// Parse a fallback list from an egress URL path segment (comma-separated,
/// `host-port` alias allowed).
pub fn parse_fallback_path_segment(s: &str) -> Result<Vec<FallbackAddr>, ParseAddrError> {
    s.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(FallbackAddr::parse_path_segment)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_host_port() {
        let ep = Endpoint::parse("example.com:443").unwrap();
        assert_eq!(ep.host, "example.com");
        assert_eq!(ep.port, 443);
        assert!(!ep.is_ip_literal());
    }

    #[test]
    fn parse_v6_bracketed() {
        let ep = Endpoint::parse("[2001:db8::1]:8443").unwrap();
        assert_eq!(ep.host, "2001:db8::1");
        assert_eq!(ep.port, 8443);
        assert!(ep.is_ip_literal());
    }

    #[test]
    fn display_round_trips() {
        for s in ["example.com:443", "[2001:db8::1]:8443", "1.2.3.4:80"] {
            assert_eq!(Endpoint::parse(s).unwrap().to_string(), s);
        }
    }

    #[test]
    fn rejects_bad_ports() {
        assert_eq!(
            Endpoint::parse("example.com:0"),
            Err(ParseAddrError::InvalidPort("example.com:0".into()))
        );
        assert_eq!(
            Endpoint::parse("example.com:65536"),
            Err(ParseAddrError::InvalidPort("example.com:65536".into()))
        );
        assert!(Endpoint::parse("example.com:http").is_err());
    }

    #[test]
    fn rejects_v6_without_port() {
        assert!(Endpoint::parse("2001:db8::1").is_err());
        assert!(Endpoint::parse("[2001:db8::1]").is_err());
    }

    #[test]
    fn rejects_missing_pieces() {
        assert!(Endpoint::parse("").is_err());
        assert!(Endpoint::parse("example.com").is_err());
        assert!(Endpoint::parse(":443").is_err());
        assert!(Endpoint::parse("[2001:db8::1:443").is_err());
    }

    #[test]
    fn fallback_optional_port() {
        let fb = FallbackAddr::parse("proxy.example.net").unwrap();
        assert_eq!(fb.port, None);
        assert_eq!(fb.endpoint(443), Endpoint::new("proxy.example.net", 443));

        let fb = FallbackAddr::parse("1.2.3.4:21415").unwrap();
        assert_eq!(fb.endpoint(443), Endpoint::new("1.2.3.4", 21415));
    }

    #[test]
    fn fallback_bare_v6() {
        let fb = FallbackAddr::parse("2001:db8::2").unwrap();
        assert_eq!(fb.host, "2001:db8::2");
        assert_eq!(fb.port, None);
    }

    #[test]
    fn fallback_list_parsing() {
        let list = parse_fallback_list("1.2.3.4:21415, proxy.example.net,").unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].port, Some(21415));
        assert_eq!(list[1].port, None);

        assert!(parse_fallback_list("1.2.3.4:0").is_err());
    }

    #[test]
    fn path_segment_hyphen_alias() {
        let list = parse_fallback_path_segment("1.2.3.4-21415,proxy.example.net").unwrap();
        assert_eq!(list[0].endpoint(443), Endpoint::new("1.2.3.4", 21415));
        assert_eq!(list[1].port, None);
    }

    #[test]
    fn path_segment_keeps_hyphenated_names() {
        let fb = FallbackAddr::parse_path_segment("my-proxy.example.net").unwrap();
        assert_eq!(fb.host, "my-proxy.example.net");
        assert_eq!(fb.port, None);

        let fb = FallbackAddr::parse_path_segment("my-proxy.example.net-8443").unwrap();
        assert_eq!(fb.host, "my-proxy.example.net");
        assert_eq!(fb.port, Some(8443));
    }
}
