//! DNS-over-HTTPS plumbing.
//!
//! Two jobs live here: resolving the ECH ConfigList from an HTTPS (type 65)
//! resource record via a wire-format DoH query, and forwarding raw DNS
//! queries from the SOCKS5 UDP relay as DoH POSTs over an ECH-protected TLS
//! connection to the egress endpoint.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rustls_pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// DNS RR type for HTTPS service bindings.
const TYPE_HTTPS: u16 = 65;
/// SvcParamKey carrying the ECH ConfigList.
const SVC_PARAM_ECH: u16 = 5;
/// Host the UDP relay's DoH forwards are addressed to.
pub const DOH_TUNNEL_HOST: &str = "cloudflare-dns.com";

const DOH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum DohError {
    #[error("DoH request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("DNS message truncated at offset {0}")]
    Truncated(usize),
    #[error("no HTTPS record with an ech parameter in answer")]
    NoEchConfig,
}

/// Build a minimal wire-format query for the HTTPS record of `domain`:
/// ID 1, RD set, one IN question of type 65.
pub fn build_https_query(domain: &str) -> Vec<u8> {
    let mut msg = Vec::with_capacity(17 + domain.len());
    msg.extend_from_slice(&1u16.to_be_bytes()); // ID
    msg.extend_from_slice(&0x0100u16.to_be_bytes()); // RD
    msg.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    msg.extend_from_slice(&[0, 0, 0, 0, 0, 0]); // AN/NS/AR
    for label in domain.trim_end_matches('.').split('.') {
        msg.push(label.len() as u8);
        msg.extend_from_slice(label.as_bytes());
    }
    msg.push(0);
    msg.extend_from_slice(&TYPE_HTTPS.to_be_bytes());
    msg.extend_from_slice(&1u16.to_be_bytes()); // IN
    msg
}

/// Fetch the ECH ConfigList for `domain` via a DoH GET against `doh_url`.
pub async fn fetch_ech_config(
    http: &reqwest::Client,
    doh_url: &str,
    domain: &str,
) -> Result<Vec<u8>, DohError> {
    let query = URL_SAFE_NO_PAD.encode(build_https_query(domain));
    let response = http
        .get(format!("{doh_url}?dns={query}"))
        .header("Accept", "application/dns-message")
        .timeout(DOH_TIMEOUT)
        .send()
        .await?
        .error_for_status()?;
    let body = response.bytes().await?;
    extract_ech_config(&body)
}

/// Walk a DNS response for the first HTTPS record whose SvcParams contain
/// an `ech` (key 5) value. Handles name compression pointers.
pub fn extract_ech_config(msg: &[u8]) -> Result<Vec<u8>, DohError> {
    if msg.len() < 12 {
        return Err(DohError::Truncated(msg.len()));
    }
    let qdcount = u16::from_be_bytes([msg[4], msg[5]]);
    let ancount = u16::from_be_bytes([msg[6], msg[7]]);

    let mut pos = 12;
    for _ in 0..qdcount {
        pos = skip_name(msg, pos)?;
        pos = checked_add(msg, pos, 4)?; // QTYPE + QCLASS
    }

    for _ in 0..ancount {
        pos = skip_name(msg, pos)?;
        if pos + 10 > msg.len() {
            return Err(DohError::Truncated(pos));
        }
        let rtype = u16::from_be_bytes([msg[pos], msg[pos + 1]]);
        let rdlen = u16::from_be_bytes([msg[pos + 8], msg[pos + 9]]) as usize;
        pos += 10;
        if pos + rdlen > msg.len() {
            return Err(DohError::Truncated(pos));
        }
        let rdata = &msg[pos..pos + rdlen];
        pos += rdlen;

        if rtype != TYPE_HTTPS {
            continue;
        }
        if let Some(ech) = extract_from_rdata(rdata) {
            return Ok(ech);
        }
    }
    Err(DohError::NoEchConfig)
}

/// Within HTTPS RDATA: SvcPriority (2) | TargetName | SvcParams.
fn extract_from_rdata(rdata: &[u8]) -> Option<Vec<u8>> {
    let mut pos = 2usize;
    // TargetName is an uncompressed domain name.
    loop {
        let len = *rdata.get(pos)? as usize;
        pos += 1;
        if len == 0 {
            break;
        }
        pos += len;
    }
    while pos + 4 <= rdata.len() {
        let key = u16::from_be_bytes([rdata[pos], rdata[pos + 1]]);
        let len = u16::from_be_bytes([rdata[pos + 2], rdata[pos + 3]]) as usize;
        pos += 4;
        if pos + len > rdata.len() {
            return None;
        }
        if key == SVC_PARAM_ECH {
            return Some(rdata[pos..pos + len].to_vec());
        }
        pos += len;
    }
    None
}

/// Skip a possibly-compressed name starting at `pos`, returning the offset
/// just past it.
fn skip_name(msg: &[u8], mut pos: usize) -> Result<usize, DohError> {
    loop {
        let len = *msg.get(pos).ok_or(DohError::Truncated(pos))? as usize;
        if len & 0xC0 == 0xC0 {
            return checked_add(msg, pos, 2);
        }
        if len == 0 {
            return Ok(pos + 1);
        }
        pos = checked_add(msg, pos, 1 + len)?;
    }
}

fn checked_add(msg: &[u8], pos: usize, add: usize) -> Result<usize, DohError> {
    let next = pos + add;
    if next > msg.len() {
        Err(DohError::Truncated(pos))
    } else {
        Ok(next)
    }
}

/// Forward a raw DNS query as a DoH POST over an ECH TLS connection to the
/// egress endpoint (SNI [`DOH_TUNNEL_HOST`]). Returns the response body.
pub async fn forward_query_over_ech(
    tls: Arc<rustls::ClientConfig>,
    dial_addr: SocketAddr,
    query: &[u8],
) -> anyhow::Result<Vec<u8>> {
    let tcp = timeout(DOH_TIMEOUT, TcpStream::connect(dial_addr))
        .await
        .map_err(|_| anyhow::anyhow!("DoH forward connect timeout to {dial_addr}"))??;
    tcp.set_nodelay(true).ok();

    let connector = tokio_rustls::TlsConnector::from(tls);
    let server_name = ServerName::try_from(DOH_TUNNEL_HOST)?;
    let mut stream = timeout(DOH_TIMEOUT, connector.connect(server_name, tcp))
        .await
        .map_err(|_| anyhow::anyhow!("DoH forward TLS timeout"))??;

    let head = format!(
        "POST /dns-query HTTP/1.1\r\n\
         Host: {DOH_TUNNEL_HOST}\r\n\
         Content-Type: application/dns-message\r\n\
         Accept: application/dns-message\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n",
        query.len()
    );
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(query).await?;

    let mut raw = Vec::with_capacity(4096);
    timeout(DOH_TIMEOUT, stream.read_to_end(&mut raw))
        .await
        .map_err(|_| anyhow::anyhow!("DoH forward read timeout"))??;

    parse_doh_response(&raw)
}

/// Minimal HTTP/1.1 response parse: require a 200, return the body (bounded
/// by Content-Length when present).
fn parse_doh_response(raw: &[u8]) -> anyhow::Result<Vec<u8>> {
    let head_end = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or_else(|| anyhow::anyhow!("DoH response missing header terminator"))?;
    let head = std::str::from_utf8(&raw[..head_end])?;
    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap_or_default();
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| anyhow::anyhow!("malformed DoH status line {status_line:?}"))?;
    if status != 200 {
        anyhow::bail!("DoH forward returned status {status}");
    }

    let body = &raw[head_end + 4..];
    let content_length = lines
        .filter_map(|l| l.split_once(':'))
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.trim().parse::<usize>().ok());
    match content_length {
        Some(len) if len <= body.len() => Ok(body[..len].to_vec()),
        Some(len) => {
            debug!(expected = len, got = body.len(), "short DoH body");
            anyhow::bail!("DoH response body truncated")
        }
        None => Ok(body.to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_wire_format() {
        let q = build_https_query("cloudflare-ech.com");
        // Header: ID=1, RD, QDCOUNT=1.
        assert_eq!(&q[..12], &[0, 1, 1, 0, 0, 1, 0, 0, 0, 0, 0, 0]);
        // QNAME labels.
        assert_eq!(q[12], 14);
        assert_eq!(&q[13..27], b"cloudflare-ech");
        assert_eq!(q[27], 3);
        assert_eq!(&q[28..31], b"com");
        assert_eq!(q[31], 0);
        // QTYPE=65, QCLASS=IN.
        assert_eq!(&q[32..], &[0, 65, 0, 1]);
    }

    /// Build a response: one question, then the given answers appended.
    fn response_with_answers(answers: &[u8], ancount: u16) -> Vec<u8> {
        let mut msg = vec![0, 1, 0x81, 0x80, 0, 1, 0, 0, 0, 0, 0, 0];
        msg[6] = (ancount >> 8) as u8;
        msg[7] = (ancount & 0xff) as u8;
        // Question: example.com HTTPS IN
        msg.extend_from_slice(&[7]);
        msg.extend_from_slice(b"example");
        msg.extend_from_slice(&[3]);
        msg.extend_from_slice(b"com");
        msg.extend_from_slice(&[0, 0, 65, 0, 1]);
        msg.extend_from_slice(answers);
        msg
    }

    fn https_answer(rdata: &[u8]) -> Vec<u8> {
        let mut a = vec![0xC0, 0x0C]; // compressed name -> question
        a.extend_from_slice(&[0, 65, 0, 1, 0, 0, 0, 60]); // type, class, ttl
        a.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
        a.extend_from_slice(rdata);
        a
    }

    #[test]
    fn extracts_ech_param() {
        // SvcPriority=1, root TargetName, alpn(1)=h2, ech(5)=[9,9,9]
        let rdata = [
            0, 1, 0, // priority + target "."
            0, 1, 0, 3, 2, b'h', b'2', // alpn param
            0, 5, 0, 3, 9, 9, 9, // ech param
        ];
        let msg = response_with_answers(&https_answer(&rdata), 1);
        assert_eq!(extract_ech_config(&msg).unwrap(), vec![9, 9, 9]);
    }

    #[test]
    fn skips_non_https_answers() {
        // A record answer followed by the HTTPS answer.
        let mut answers = vec![0xC0, 0x0C, 0, 1, 0, 1, 0, 0, 0, 60, 0, 4, 1, 2, 3, 4];
        let rdata = [0, 1, 0, 0, 5, 0, 2, 7, 7];
        answers.extend_from_slice(&https_answer(&rdata));
        let msg = response_with_answers(&answers, 2);
        assert_eq!(extract_ech_config(&msg).unwrap(), vec![7, 7]);
    }

    #[test]
    fn no_ech_param_is_an_error() {
        let rdata = [0, 1, 0, 0, 1, 0, 3, 2, b'h', b'2'];
        let msg = response_with_answers(&https_answer(&rdata), 1);
        assert!(matches!(
            extract_ech_config(&msg),
            Err(DohError::NoEchConfig)
        ));
    }

    #[test]
    fn truncated_message_is_an_error() {
        assert!(matches!(
            extract_ech_config(&[0, 1, 2]),
            Err(DohError::Truncated(_))
        ));
        let msg = response_with_answers(&[0xC0, 0x0C, 0, 65], 1);
        assert!(matches!(
            extract_ech_config(&msg),
            Err(DohError::Truncated(_))
        ));
    }

    #[test]
    fn doh_response_parse() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Type: application/dns-message\r\nContent-Length: 3\r\n\r\n\x01\x02\x03";
        assert_eq!(parse_doh_response(raw).unwrap(), vec![1, 2, 3]);

        let err = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";
        assert!(parse_doh_response(err).is_err());
    }
}
