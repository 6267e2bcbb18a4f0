//! End-to-end tests for the ingress direct path: sniff, parse, relay.
//!
//! These run entirely over localhost; the tunnel path needs a live ECH
//! egress and is covered by the protocol-level unit tests instead.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;

use shroud_ingress::config::Config;
use shroud_ingress::ranges::RangeTables;
use shroud_ingress::routing::RoutingMode;
use shroud_ingress::server;
use shroud_ingress::state::AppState;

async fn spawn_ingress(routing: RoutingMode, tables: RangeTables) -> SocketAddr {
    let mut config = Config::parse_from(["shroud-ingress", "--server", "worker.example.com:443"]);
    config.routing = routing;
    let http = reqwest::Client::new();
    let state = Arc::new(AppState::new(config, tables, http).unwrap());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    // Leak the sender so the accept loop runs for the test's lifetime.
    std::mem::forget(_shutdown_tx);
    tokio::spawn(server::run(state, listener, shutdown_rx));
    addr
}

async fn spawn_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(v) => v,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 8192];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

async fn read_exactly(stream: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .expect("read timed out")
        .unwrap();
    buf
}

#[tokio::test]
async fn socks5_connect_direct() {
    let echo = spawn_echo().await;
    let ingress = spawn_ingress(RoutingMode::None, RangeTables::default()).await;

    let mut client = TcpStream::connect(ingress).await.unwrap();

    // Greeting: version 5, one method, no-auth.
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    assert_eq!(read_exactly(&mut client, 2).await, vec![0x05, 0x00]);

    // CONNECT 127.0.0.1:<echo port>.
    let mut request = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
    request.extend_from_slice(&echo.port().to_be_bytes());
    client.write_all(&request).await.unwrap();

    let reply = read_exactly(&mut client, 10).await;
    assert_eq!(&reply[..4], &[0x05, 0x00, 0x00, 0x01]);

    client.write_all(b"hello direct").await.unwrap();
    assert_eq!(read_exactly(&mut client, 12).await, b"hello direct");
}

#[tokio::test]
async fn socks5_domain_target() {
    let echo = spawn_echo().await;
    let ingress = spawn_ingress(RoutingMode::None, RangeTables::default()).await;

    let mut client = TcpStream::connect(ingress).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    read_exactly(&mut client, 2).await;

    let name = b"localhost";
    let mut request = vec![0x05, 0x01, 0x00, 0x03, name.len() as u8];
    request.extend_from_slice(name);
    request.extend_from_slice(&echo.port().to_be_bytes());
    client.write_all(&request).await.unwrap();

    let reply = read_exactly(&mut client, 10).await;
    assert_eq!(reply[1], 0x00);

    client.write_all(b"ok").await.unwrap();
    assert_eq!(read_exactly(&mut client, 2).await, b"ok");
}

#[tokio::test]
async fn socks5_unsupported_command() {
    let ingress = spawn_ingress(RoutingMode::None, RangeTables::default()).await;

    let mut client = TcpStream::connect(ingress).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    read_exactly(&mut client, 2).await;

    // BIND (0x02) is not supported.
    client
        .write_all(&[0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0, 80])
        .await
        .unwrap();
    let reply = read_exactly(&mut client, 10).await;
    assert_eq!(reply[1], 0x07);
}

#[tokio::test]
async fn socks5_udp_associate_binds_loopback() {
    let ingress = spawn_ingress(RoutingMode::None, RangeTables::default()).await;

    let mut client = TcpStream::connect(ingress).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    read_exactly(&mut client, 2).await;

    client
        .write_all(&[0x05, 0x03, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await
        .unwrap();
    let reply = read_exactly(&mut client, 10).await;
    assert_eq!(&reply[..4], &[0x05, 0x00, 0x00, 0x01]);
    assert_eq!(&reply[4..8], &[127, 0, 0, 1]);
    let port = u16::from_be_bytes([reply[8], reply[9]]);
    assert_ne!(port, 0);

    // Closing the control socket terminates the relay.
    drop(client);
}

#[tokio::test]
async fn http_connect_direct() {
    let echo = spawn_echo().await;
    let ingress = spawn_ingress(RoutingMode::None, RangeTables::default()).await;

    let mut client = TcpStream::connect(ingress).await.unwrap();
    let request = format!("CONNECT {echo} HTTP/1.1\r\nHost: {echo}\r\n\r\n");
    client.write_all(request.as_bytes()).await.unwrap();

    let expected = b"HTTP/1.1 200 Connection Established\r\n\r\n";
    assert_eq!(read_exactly(&mut client, expected.len()).await, expected);

    client.write_all(b"tls-bytes").await.unwrap();
    assert_eq!(read_exactly(&mut client, 9).await, b"tls-bytes");
}

#[tokio::test]
async fn http_connect_direct_in_bypass_cn_with_cn_range() {
    let echo = spawn_echo().await;
    let tables = RangeTables::parse("127.0.0.0 127.255.255.255\n", "").unwrap();
    let ingress = spawn_ingress(RoutingMode::BypassCn, tables).await;

    let mut client = TcpStream::connect(ingress).await.unwrap();
    let request = format!("CONNECT {echo} HTTP/1.1\r\nHost: {echo}\r\n\r\n");
    client.write_all(request.as_bytes()).await.unwrap();

    let expected = b"HTTP/1.1 200 Connection Established\r\n\r\n";
    assert_eq!(read_exactly(&mut client, expected.len()).await, expected);
}

#[tokio::test]
async fn http_forward_proxy_rewrites_request() {
    let echo = spawn_echo().await;
    let ingress = spawn_ingress(RoutingMode::None, RangeTables::default()).await;

    let mut client = TcpStream::connect(ingress).await.unwrap();
    let request = format!(
        "GET http://{echo}/hi HTTP/1.1\r\nHost: {echo}\r\nProxy-Connection: keep-alive\r\n\r\n"
    );
    client.write_all(request.as_bytes()).await.unwrap();

    // The echo upstream mirrors the rebuilt request straight back.
    let expected = format!("GET /hi HTTP/1.1\r\nHost: {echo}\r\n\r\n");
    let got = read_exactly(&mut client, expected.len()).await;
    assert_eq!(String::from_utf8(got).unwrap(), expected);
}

#[tokio::test]
async fn http_forward_proxy_body_is_bundled() {
    let echo = spawn_echo().await;
    let ingress = spawn_ingress(RoutingMode::None, RangeTables::default()).await;

    let mut client = TcpStream::connect(ingress).await.unwrap();
    let request = format!(
        "POST http://{echo}/submit HTTP/1.1\r\nHost: {echo}\r\nContent-Length: 4\r\n\r\nbody"
    );
    client.write_all(request.as_bytes()).await.unwrap();

    let expected = format!(
        "POST /submit HTTP/1.1\r\nHost: {echo}\r\nContent-Length: 4\r\n\r\nbody"
    );
    let got = read_exactly(&mut client, expected.len()).await;
    assert_eq!(String::from_utf8(got).unwrap(), expected);
}

#[tokio::test]
async fn http_forward_proxy_bundles_body_without_content_length() {
    let echo = spawn_echo().await;
    let ingress = spawn_ingress(RoutingMode::None, RangeTables::default()).await;

    let mut client = TcpStream::connect(ingress).await.unwrap();
    // Chunked body, no Content-Length; head and body arrive in one write.
    let request = format!(
        "POST http://{echo}/up HTTP/1.1\r\nHost: {echo}\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nbody\r\n0\r\n\r\n"
    );
    client.write_all(request.as_bytes()).await.unwrap();

    let expected = format!(
        "POST /up HTTP/1.1\r\nHost: {echo}\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nbody\r\n0\r\n\r\n"
    );
    let got = read_exactly(&mut client, expected.len()).await;
    assert_eq!(String::from_utf8(got).unwrap(), expected);
}

#[tokio::test]
async fn unsupported_http_method_is_405() {
    let ingress = spawn_ingress(RoutingMode::None, RangeTables::default()).await;

    let mut client = TcpStream::connect(ingress).await.unwrap();
    client
        .write_all(b"PROPFIND / HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();
    let reply = read_exactly(&mut client, 12).await;
    assert_eq!(&reply, b"HTTP/1.1 405");
}

#[tokio::test]
async fn unknown_protocol_is_dropped() {
    let ingress = spawn_ingress(RoutingMode::None, RangeTables::default()).await;

    let mut client = TcpStream::connect(ingress).await.unwrap();
    client.write_all(&[0xFF, 0x00, 0x01]).await.unwrap();

    let mut buf = [0u8; 1];
    let n = timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .expect("read timed out")
        .unwrap();
    assert_eq!(n, 0, "expected the connection to be closed");
}
