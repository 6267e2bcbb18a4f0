//! CN IP range tables for split routing.
//!
//! Each table is a sorted list of inclusive `[start, end]` ranges loaded
//! from `chn_ip.txt` / `chn_ip_v6.txt` (one space-separated pair per line,
//! `#` comments and blanks ignored). Missing or empty files are fetched
//! from the pinned mirrors and persisted next to the configured path.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;

use tracing::{info, warn};

use crate::config::Config;

/// Download mirrors used when the on-disk files are missing or empty.
const CHN_IP_V4_URL: &str =
    "https://raw.githubusercontent.com/juerson/chn-ip-data/main/chn_ip.txt";
const CHN_IP_V6_URL: &str =
    "https://raw.githubusercontent.com/juerson/chn-ip-data/main/chn_ip_v6.txt";

#[derive(Debug, thiserror::Error)]
pub enum RangeError {
    #[error("line {line}: expected `start end`, got {text:?}")]
    Malformed { line: usize, text: String },
    #[error("line {line}: invalid address {text:?}")]
    BadAddress { line: usize, text: String },
    #[error("line {line}: range end precedes start")]
    Inverted { line: usize },
}

/// Sorted, binary-searchable v4 + v6 range tables.
#[derive(Debug, Default)]
pub struct RangeTables {
    v4: Vec<(u32, u32)>,
    v6: Vec<([u8; 16], [u8; 16])>,
}

impl RangeTables {
    /// Parse both table files. Either text may be empty.
    pub fn parse(v4_text: &str, v6_text: &str) -> Result<Self, RangeError> {
        let mut tables = Self {
            v4: parse_lines(v4_text, |s| s.parse::<Ipv4Addr>().map(u32::from).ok())?,
            v6: parse_lines(v6_text, |s| s.parse::<Ipv6Addr>().map(|a| a.octets()).ok())?,
        };
        tables.v4.sort_unstable_by_key(|r| r.0);
        tables.v6.sort_unstable_by_key(|r| r.0);
        Ok(tables)
    }

    pub fn is_empty(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty()
    }

    pub fn len(&self) -> usize {
        self.v4.len() + self.v6.len()
    }

    /// Membership test: true when `ip` falls inside any loaded range.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => lookup(&self.v4, u32::from(*v4)),
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(mapped) => lookup(&self.v4, u32::from(mapped)),
                None => lookup(&self.v6, v6.octets()),
            },
        }
    }
}

/// Binary search over ranges sorted by start.
fn lookup<T: Ord + Copy>(ranges: &[(T, T)], key: T) -> bool {
    let idx = ranges.partition_point(|r| r.0 <= key);
    idx > 0 && ranges[idx - 1].1 >= key
}

fn parse_lines<T, F>(text: &str, parse_addr: F) -> Result<Vec<(T, T)>, RangeError>
where
    T: Ord,
    F: Fn(&str) -> Option<T>,
{
    let mut out = Vec::new();
    for (i, raw) in text.lines().enumerate() {
        let line = i + 1;
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let mut parts = trimmed.split_whitespace();
        let (start_s, end_s) = match (parts.next(), parts.next()) {
            (Some(a), Some(b)) => (a, b),
            _ => {
                return Err(RangeError::Malformed {
                    line,
                    text: trimmed.to_string(),
                })
            }
        };
        let start = parse_addr(start_s).ok_or_else(|| RangeError::BadAddress {
            line,
            text: start_s.to_string(),
        })?;
        let end = parse_addr(end_s).ok_or_else(|| RangeError::BadAddress {
            line,
            text: end_s.to_string(),
        })?;
        if end < start {
            return Err(RangeError::Inverted { line });
        }
        out.push((start, end));
    }
    Ok(out)
}

/// Load the tables from disk, downloading missing files first. An IPv6
/// download failure degrades to a v4-only table.
pub async fn load_or_download(config: &Config, http: &reqwest::Client) -> anyhow::Result<RangeTables> {
    let v4_text = match read_nonempty(&config.chn_ip_file) {
        Some(text) => text,
        None => {
            let url = std::env::var("SHROUD_CHN_IP_URL").unwrap_or_else(|_| CHN_IP_V4_URL.into());
            info!(url = %url, "downloading IPv4 CN ranges");
            let text = fetch_text(http, &url).await?;
            persist(&config.chn_ip_file, &text);
            text
        }
    };

    let v6_text = match read_nonempty(&config.chn_ip_v6_file) {
        Some(text) => text,
        None => {
            let url =
                std::env::var("SHROUD_CHN_IP_V6_URL").unwrap_or_else(|_| CHN_IP_V6_URL.into());
            info!(url = %url, "downloading IPv6 CN ranges");
            match fetch_text(http, &url).await {
                Ok(text) => {
                    persist(&config.chn_ip_v6_file, &text);
                    text
                }
                Err(e) => {
                    warn!(error = %e, "IPv6 CN range download failed, continuing without");
                    String::new()
                }
            }
        }
    };

    let tables = RangeTables::parse(&v4_text, &v6_text)?;
    info!(ranges = tables.len(), "CN range tables loaded");
    Ok(tables)
}

fn read_nonempty(path: &str) -> Option<String> {
    match std::fs::read_to_string(path) {
        Ok(text) if !text.trim().is_empty() => Some(text),
        _ => None,
    }
}

fn persist(path: &str, text: &str) {
    if let Err(e) = std::fs::write(path, text) {
        warn!(path = %Path::new(path).display(), error = %e, "failed to persist range file");
    }
}

async fn fetch_text(http: &reqwest::Client, url: &str) -> anyhow::Result<String> {
    let response = http.get(url).send().await?.error_for_status()?;
    Ok(response.text().await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    const V4: &str = "\
# CN ranges
1.0.1.0 1.0.3.255

36.0.0.0 36.255.255.255
1.0.8.0 1.0.15.255
";

    const V6: &str = "2400:3200:: 2400:3200:ffff:ffff:ffff:ffff:ffff:ffff\n";

    #[test]
    fn parses_comments_and_blanks() {
        let tables = RangeTables::parse(V4, V6).unwrap();
        assert_eq!(tables.len(), 4);
    }

    #[test]
    fn tables_are_sorted_after_load() {
        let tables = RangeTables::parse(V4, "").unwrap();
        let starts: Vec<u32> = tables.v4.iter().map(|r| r.0).collect();
        let mut sorted = starts.clone();
        sorted.sort_unstable();
        assert_eq!(starts, sorted);
    }

    #[test]
    fn membership_and_boundaries() {
        let tables = RangeTables::parse(V4, V6).unwrap();
        assert!(tables.contains(&"1.0.1.0".parse().unwrap()));
        assert!(tables.contains(&"1.0.1.1".parse().unwrap()));
        assert!(tables.contains(&"1.0.3.255".parse().unwrap()));
        assert!(!tables.contains(&"1.0.4.0".parse().unwrap()));
        assert!(!tables.contains(&"0.255.255.255".parse().unwrap()));
        assert!(tables.contains(&"36.12.34.56".parse().unwrap()));
        assert!(!tables.contains(&"8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn v6_membership() {
        let tables = RangeTables::parse("", V6).unwrap();
        assert!(tables.contains(&"2400:3200::1".parse().unwrap()));
        assert!(!tables.contains(&"2400:3201::1".parse().unwrap()));
    }

    #[test]
    fn v4_mapped_v6_uses_v4_table() {
        let tables = RangeTables::parse(V4, "").unwrap();
        assert!(tables.contains(&"::ffff:1.0.1.1".parse().unwrap()));
    }

    #[test]
    fn malformed_lines_error() {
        assert!(RangeTables::parse("1.0.1.0", "").is_err());
        assert!(RangeTables::parse("1.0.1.0 not-an-ip", "").is_err());
        assert!(RangeTables::parse("2.0.0.0 1.0.0.0", "").is_err());
    }
}
