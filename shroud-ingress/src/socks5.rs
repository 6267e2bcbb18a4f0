//! SOCKS5 handler: RFC 1928 without authentication.
//!
//! Supports CONNECT and UDP ASSOCIATE. The UDP relay only forwards DNS
//! (port 53) datagrams, as DoH requests over the ECH channel; everything
//! else is dropped.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use shroud_proto::Endpoint;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::routing::{self, Route};
use crate::state::AppState;
use crate::tunnel::relay::{self, ProxyKind};
use crate::{direct, doh, ech};

const SOCKS_VERSION: u8 = 0x05;
const AUTH_NO_AUTH: u8 = 0x00;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;
const CMD_UDP_ASSOCIATE: u8 = 0x03;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REP_SUCCESS: u8 = 0x00;
const REP_GENERAL_FAILURE: u8 = 0x01;
const REP_HOST_UNREACHABLE: u8 = 0x04;
const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
const REP_ATYP_NOT_SUPPORTED: u8 = 0x08;

/// Greeting + request must complete within this window.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(300);

pub async fn handle(stream: TcpStream, state: Arc<AppState>) -> anyhow::Result<()> {
    let (stream, request) = match timeout(HANDSHAKE_TIMEOUT, handshake(stream)).await {
        Ok(Ok(v)) => v,
        Ok(Err(e)) => return Err(e),
        Err(_) => anyhow::bail!("SOCKS5 handshake timeout"),
    };

    match request {
        Request::Connect(target) => handle_connect(stream, state, target).await,
        Request::UdpAssociate => udp_associate(stream, state).await,
    }
}

enum Request {
    Connect(Endpoint),
    UdpAssociate,
}

/// Greeting, method selection, and request parsing.
async fn handshake(mut stream: TcpStream) -> anyhow::Result<(TcpStream, Request)> {
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        anyhow::bail!("invalid SOCKS version {}", head[0]);
    }
    let mut methods = vec![0u8; head[1] as usize];
    stream.read_exact(&mut methods).await?;
    if !methods.contains(&AUTH_NO_AUTH) {
        stream
            .write_all(&[SOCKS_VERSION, AUTH_NO_ACCEPTABLE])
            .await?;
        anyhow::bail!("client offered no supported auth method");
    }
    stream.write_all(&[SOCKS_VERSION, AUTH_NO_AUTH]).await?;

    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await?;
    if request[0] != SOCKS_VERSION {
        anyhow::bail!("invalid SOCKS version in request");
    }
    let cmd = request[1];
    let atyp = request[3];

    let (host, port) = match read_target(&mut stream, atyp).await {
        Ok(v) => v,
        Err(e) => {
            send_reply(&mut stream, REP_ATYP_NOT_SUPPORTED).await?;
            return Err(e);
        }
    };

    match cmd {
        CMD_CONNECT => {
            if port == 0 {
                send_reply(&mut stream, REP_GENERAL_FAILURE).await?;
                anyhow::bail!("invalid target port 0");
            }
            Ok((stream, Request::Connect(Endpoint::new(host, port))))
        }
        CMD_UDP_ASSOCIATE => Ok((stream, Request::UdpAssociate)),
        other => {
            send_reply(&mut stream, REP_CMD_NOT_SUPPORTED).await?;
            anyhow::bail!("unsupported SOCKS5 command {other}");
        }
    }
}

async fn read_target(stream: &mut TcpStream, atyp: u8) -> anyhow::Result<(String, u16)> {
    let host = match atyp {
        ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            Ipv4Addr::from(addr).to_string()
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            stream.read_exact(&mut name).await?;
            String::from_utf8(name)?
        }
        ATYP_IPV6 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            Ipv6Addr::from(addr).to_string()
        }
        other => anyhow::bail!("unknown address type {other}"),
    };
    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    Ok((host, u16::from_be_bytes(port)))
}

async fn handle_connect(
    mut stream: TcpStream,
    state: Arc<AppState>,
    target: Endpoint,
) -> anyhow::Result<()> {
    let tables = state.ranges();
    let route = routing::decide(state.config.routing, &target.host, &tables).await;
    debug!(target = %target, ?route, "SOCKS5 CONNECT");

    match route {
        Route::Direct => match direct::dial(&target).await {
            Ok(upstream) => {
                send_reply(&mut stream, REP_SUCCESS).await?;
                direct::run(stream, upstream, &[]).await;
                Ok(())
            }
            Err(e) => {
                debug!(target = %target, error = %e, "direct dial failed");
                send_reply(&mut stream, REP_HOST_UNREACHABLE).await?;
                Ok(())
            }
        },
        Route::Tunnel => {
            relay::run_tunneled(state, stream, target, Vec::new(), ProxyKind::Socks5).await;
            Ok(())
        }
    }
}

async fn send_reply(stream: &mut TcpStream, rep: u8) -> std::io::Result<()> {
    stream
        .write_all(&[SOCKS_VERSION, rep, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await
}

// ---------------------------------------------------------------------------
// UDP ASSOCIATE
// ---------------------------------------------------------------------------

/// A parsed SOCKS5 UDP request header.
#[derive(Debug, PartialEq, Eq)]
pub struct UdpRequest<'a> {
    pub frag: u8,
    pub host: String,
    pub port: u16,
    /// The raw header bytes, prefixed verbatim onto replies.
    pub header: &'a [u8],
    pub payload: &'a [u8],
}

/// Parse a SOCKS5 UDP datagram: RSV(2) FRAG(1) ATYP(1) DST PORT PAYLOAD.
pub fn parse_udp_datagram(data: &[u8]) -> Option<UdpRequest<'_>> {
    if data.len() < 4 {
        return None;
    }
    let frag = data[2];
    let atyp = data[3];
    let (host, addr_end) = match atyp {
        ATYP_IPV4 => {
            let bytes: [u8; 4] = data.get(4..8)?.try_into().ok()?;
            (Ipv4Addr::from(bytes).to_string(), 8)
        }
        ATYP_DOMAIN => {
            let len = *data.get(4)? as usize;
            let name = data.get(5..5 + len)?;
            (String::from_utf8(name.to_vec()).ok()?, 5 + len)
        }
        ATYP_IPV6 => {
            let bytes: [u8; 16] = data.get(4..20)?.try_into().ok()?;
            (Ipv6Addr::from(bytes).to_string(), 20)
        }
        _ => return None,
    };
    let port_bytes = data.get(addr_end..addr_end + 2)?;
    let port = u16::from_be_bytes([port_bytes[0], port_bytes[1]]);
    let header_end = addr_end + 2;
    Some(UdpRequest {
        frag,
        host,
        port,
        header: &data[..header_end],
        payload: &data[header_end..],
    })
}

/// Run the UDP relay. The TCP control socket doubles as the liveness
/// signal: when it closes, the relay stops.
async fn udp_associate(mut control: TcpStream, state: Arc<AppState>) -> anyhow::Result<()> {
    let udp = Arc::new(UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await?);
    let local = udp.local_addr()?;
    info!(bound = %local, "UDP ASSOCIATE");

    let port = local.port().to_be_bytes();
    control
        .write_all(&[
            SOCKS_VERSION,
            REP_SUCCESS,
            0x00,
            ATYP_IPV4,
            127,
            0,
            0,
            1,
            port[0],
            port[1],
        ])
        .await?;

    let mut tcp_buf = [0u8; 512];
    let mut udp_buf = vec![0u8; 65535];
    loop {
        tokio::select! {
            read = control.read(&mut tcp_buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(_) => {} // control chatter is ignored
            },
            received = udp.recv_from(&mut udp_buf) => {
                let (n, peer) = received?;
                dispatch_datagram(&state, &udp, &udp_buf[..n], peer);
            }
        }
    }

    info!(bound = %local, "UDP relay stopped");
    Ok(())
}

/// Validate one datagram and spawn the DoH forward for it.
fn dispatch_datagram(state: &Arc<AppState>, udp: &Arc<UdpSocket>, data: &[u8], peer: SocketAddr) {
    let Some(request) = parse_udp_datagram(data) else {
        debug!(%peer, "malformed UDP datagram dropped");
        return;
    };
    if request.frag != 0 {
        // Fragmentation is not supported.
        return;
    }
    if request.port != 53 {
        debug!(
            dst = %request.host,
            port = request.port,
            "non-DNS UDP datagram dropped"
        );
        return;
    }

    let header = request.header.to_vec();
    let query = request.payload.to_vec();
    let state = Arc::clone(state);
    let udp = Arc::clone(udp);
    tokio::spawn(async move {
        match forward_dns(&state, &query).await {
            Ok(answer) => {
                let mut reply = header;
                reply.extend_from_slice(&answer);
                if let Err(e) = udp.send_to(&reply, peer).await {
                    debug!(%peer, error = %e, "UDP reply send failed");
                }
            }
            Err(e) => {
                warn!(%peer, error = %e, "DNS forward failed");
            }
        }
    });
}

/// Send a raw DNS query as DoH over the tunnel's TLS+ECH channel.
async fn forward_dns(state: &Arc<AppState>, query: &[u8]) -> anyhow::Result<Vec<u8>> {
    let config_list = ech::ensure_config_list(&state.ech, &state.http, &state.config).await;
    let ech_bytes = match &config_list {
        Some(list) => Some(list.as_slice()),
        None if state.config.allow_no_ech => None,
        None => anyhow::bail!("no ECH ConfigList available for DNS forward"),
    };
    let tls = Arc::new(ech::build_tls_config(ech_bytes)?);
    let addr = state.dial_addr().await?;
    doh::forward_query_over_ech(tls, addr, query).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_v4_datagram() {
        // RSV RSV FRAG ATYP 8.8.8.8 :53 payload
        let data = [0, 0, 0, 1, 8, 8, 8, 8, 0, 53, 0xAA, 0xBB];
        let req = parse_udp_datagram(&data).unwrap();
        assert_eq!(req.frag, 0);
        assert_eq!(req.host, "8.8.8.8");
        assert_eq!(req.port, 53);
        assert_eq!(req.header, &data[..10]);
        assert_eq!(req.payload, &[0xAA, 0xBB]);
    }

    #[test]
    fn parse_domain_datagram() {
        let mut data = vec![0, 0, 0, 3, 7];
        data.extend_from_slice(b"dns.com");
        data.extend_from_slice(&[0, 53, 1]);
        let req = parse_udp_datagram(&data).unwrap();
        assert_eq!(req.host, "dns.com");
        assert_eq!(req.port, 53);
        assert_eq!(req.payload, &[1]);
    }

    #[test]
    fn parse_v6_datagram() {
        let mut data = vec![0, 0, 0, 4];
        data.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        data.extend_from_slice(&[0, 53]);
        let req = parse_udp_datagram(&data).unwrap();
        assert_eq!(req.host, "::1");
        assert!(req.payload.is_empty());
    }

    #[test]
    fn fragmented_datagram_is_flagged() {
        let data = [0, 0, 1, 1, 8, 8, 8, 8, 0, 53];
        let req = parse_udp_datagram(&data).unwrap();
        assert_eq!(req.frag, 1);
    }

    #[test]
    fn malformed_datagrams_rejected() {
        assert!(parse_udp_datagram(&[]).is_none());
        assert!(parse_udp_datagram(&[0, 0, 0]).is_none());
        assert!(parse_udp_datagram(&[0, 0, 0, 9, 1, 2]).is_none());
        // truncated IPv4 address
        assert!(parse_udp_datagram(&[0, 0, 0, 1, 8, 8]).is_none());
    }
}
