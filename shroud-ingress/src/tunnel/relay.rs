//! Tunneled relay path: client socket <-> framed WebSocket session.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use shroud_proto::frame::Frame;
use shroud_proto::Endpoint;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, sleep_until, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::direct::is_normal_close;
use crate::state::AppState;
use crate::tunnel::dial::{self, TunnelStream};

/// Which client protocol the session serves; decides the success/failure
/// bytes written back to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    Socks5,
    HttpConnect,
    /// Forward-proxy mode: the rebuilt request rides in the CONNECT frame
    /// and the upstream's response bytes stream straight through.
    HttpProxy,
}

/// Window for bundling early client bytes into the CONNECT frame.
const EARLY_READ_WINDOW: Duration = Duration::from_millis(100);
/// How long to wait for the egress to answer CONNECT.
const CONNECTED_WAIT: Duration = Duration::from_secs(30);
/// Application keepalive cadence while the relay runs.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
/// Connection deadline; renewed on every keepalive tick.
const CONNECTION_DEADLINE: Duration = Duration::from_secs(300);

const RELAY_CHUNK: usize = 32 * 1024;
const HIGH_WATER_BYTES: usize = 1 << 20;
const BACKOFF_INITIAL: Duration = Duration::from_millis(8);
const BACKOFF_MAX: Duration = Duration::from_millis(200);
const CLIENT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const CLIENT_WRITE_RETRIES: u32 = 2;
const CLIENT_WRITE_RETRY_DELAY: Duration = Duration::from_millis(100);

type WsSink = SplitSink<TunnelStream, Message>;
type WsRead = SplitStream<TunnelStream>;

/// Relay one client connection through the tunnel.
pub async fn run_tunneled(
    state: Arc<AppState>,
    mut client: TcpStream,
    target: Endpoint,
    first_payload: Vec<u8>,
    kind: ProxyKind,
) {
    let ws = match dial::dial(&state).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(target = %target, error = %e, "tunnel dial failed");
            send_failure(&mut client, kind).await;
            return;
        }
    };

    // Aggressive SOCKS5 clients push their first bytes (TLS ClientHello or
    // HTTP request) without waiting; bundling them into CONNECT saves a
    // round trip.
    let mut payload = first_payload;
    if kind == ProxyKind::Socks5 && payload.is_empty() {
        payload = read_early_bytes(&mut client).await;
    }
    let (ws_sink, mut ws_read) = ws.split();
    let (writer, mut writer_handle) = spawn_ws_writer(ws_sink);

    // The CONNECT frame is text; binary-unsafe early bytes are held back
    // and sent as the first binary frame instead.
    let (text_payload, held_binary) = match String::from_utf8(payload) {
        Ok(s) => (s, None),
        Err(e) => (String::new(), Some(e.into_bytes())),
    };

    let sent = writer
        .send_frame(Frame::Connect {
            target: target.to_string(),
            payload: text_payload,
        })
        .await;
    let established = sent && match await_connected(&mut ws_read).await {
        Ok(()) => true,
        Err(reason) => {
            warn!(target = %target, %reason, "tunnel CONNECT rejected");
            false
        }
    };

    if !established {
        send_failure(&mut client, kind).await;
        drop(writer);
        let _ = timeout(Duration::from_secs(5), &mut writer_handle).await;
        return;
    }

    if send_success(&mut client, kind).await.is_err() {
        let _ = writer.send_frame(Frame::Close).await;
        drop(writer);
        let _ = timeout(Duration::from_secs(5), &mut writer_handle).await;
        return;
    }
    if let Some(bytes) = held_binary {
        writer.send(Message::Binary(bytes)).await;
    }
    debug!(target = %target, ?kind, "tunnel relay established");

    let (client_read, client_write) = client.into_split();
    let (done_tx, mut done_rx) = mpsc::channel::<&'static str>(1);
    let reader_handle = spawn_client_reader(client_read, writer.clone(), done_tx);

    relay_ws_to_client(&mut ws_read, &writer, client_write, &mut done_rx).await;

    // Teardown: best-effort CLOSE, stop the reader, drain the writer.
    let _ = writer.send_frame(Frame::Close).await;
    reader_handle.abort();
    drop(writer);
    let _ = timeout(Duration::from_secs(5), &mut writer_handle).await;
    let _ = reader_handle.await;
    debug!(target = %target, "tunnel relay closed");
}

/// Grab whatever the client sends within the early-read window.
async fn read_early_bytes(client: &mut TcpStream) -> Vec<u8> {
    let mut buf = vec![0u8; RELAY_CHUNK];
    match timeout(EARLY_READ_WINDOW, client.read(&mut buf)).await {
        Ok(Ok(n)) if n > 0 => {
            buf.truncate(n);
            buf
        }
        _ => Vec::new(),
    }
}

/// Wait for the egress's answer to CONNECT. Anything but `CONNECTED` aborts.
async fn await_connected(ws_read: &mut WsRead) -> Result<(), String> {
    let deadline = Instant::now() + CONNECTED_WAIT;
    loop {
        let msg = tokio::select! {
            msg = ws_read.next() => msg,
            _ = sleep_until(deadline) => return Err("timed out waiting for CONNECTED".into()),
        };
        match msg {
            Some(Ok(Message::Text(text))) => {
                return match Frame::parse(&text) {
                    Ok(Frame::Connected) => Ok(()),
                    Ok(Frame::Error(info)) => Err(info.to_string()),
                    Ok(other) => Err(format!("unexpected frame {other:?}")),
                    Err(e) => Err(e.to_string()),
                };
            }
            Some(Ok(Message::Binary(_))) => return Err("binary frame before CONNECTED".into()),
            Some(Ok(Message::Close(_))) | None => return Err("tunnel closed".into()),
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(format!("tunnel read error: {e}")),
        }
    }
}

async fn send_success(client: &mut TcpStream, kind: ProxyKind) -> std::io::Result<()> {
    match kind {
        ProxyKind::Socks5 => {
            client
                .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
        }
        ProxyKind::HttpConnect => {
            client
                .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                .await
        }
        // Forward-proxy mode: the upstream's own response flows through.
        ProxyKind::HttpProxy => Ok(()),
    }
}

async fn send_failure(client: &mut TcpStream, kind: ProxyKind) {
    let _ = match kind {
        ProxyKind::Socks5 => {
            // 0x04: host unreachable
            client
                .write_all(&[0x05, 0x04, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
        }
        ProxyKind::HttpConnect | ProxyKind::HttpProxy => {
            client.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await
        }
    };
}

/// Gauge-tracked writer over the tunnel sink; all frame writes funnel
/// through one task so keepalive pings and relay data never interleave.
#[derive(Clone)]
pub struct WsWriter {
    tx: mpsc::Sender<Message>,
    queued: Arc<AtomicUsize>,
}

impl WsWriter {
    pub async fn send(&self, msg: Message) -> bool {
        self.queued.fetch_add(message_len(&msg), Ordering::AcqRel);
        self.tx.send(msg).await.is_ok()
    }

    pub async fn send_frame(&self, frame: Frame) -> bool {
        self.send(Message::Text(frame.encode().into())).await
    }

    pub fn queued_bytes(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }
}

fn message_len(msg: &Message) -> usize {
    match msg {
        Message::Text(t) => t.len(),
        Message::Binary(b) => b.len(),
        _ => 0,
    }
}

fn spawn_ws_writer(mut sink: WsSink) -> (WsWriter, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<Message>(256);
    let queued = Arc::new(AtomicUsize::new(0));
    let gauge = Arc::clone(&queued);

    let handle = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let len = message_len(&msg);
            let result = sink.send(msg).await;
            gauge.fetch_sub(len, Ordering::AcqRel);
            if let Err(e) = result {
                debug!(error = %e, "tunnel write failed");
                break;
            }
        }
        let _ = sink.close().await;
    });

    (WsWriter { tx, queued }, handle)
}

/// Pump client -> WS as binary frames, honoring backpressure.
fn spawn_client_reader(
    mut client_read: OwnedReadHalf,
    writer: WsWriter,
    done_tx: mpsc::Sender<&'static str>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; RELAY_CHUNK];
        loop {
            let n = match client_read.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    if !is_normal_close(&e) {
                        warn!(error = %e, "client read failed");
                    }
                    break;
                }
            };
            wait_for_drain(&writer).await;
            if !writer.send(Message::Binary(buf[..n].to_vec())).await {
                break;
            }
        }
        let _ = done_tx.send("client closed").await;
    })
}

/// Sleep-poll until the outbound tunnel queue drains below the mark.
async fn wait_for_drain(writer: &WsWriter) {
    let mut delay = BACKOFF_INITIAL;
    while writer.queued_bytes() > HIGH_WATER_BYTES {
        sleep(delay).await;
        delay = (delay * 3 / 2).min(BACKOFF_MAX);
    }
}

/// Pump WS -> client, with the keepalive timer and connection deadline.
async fn relay_ws_to_client(
    ws_read: &mut WsRead,
    writer: &WsWriter,
    mut client_write: OwnedWriteHalf,
    done_rx: &mut mpsc::Receiver<&'static str>,
) {
    let mut keepalive = interval_at(Instant::now() + KEEPALIVE_INTERVAL, KEEPALIVE_INTERVAL);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut deadline = Instant::now() + CONNECTION_DEADLINE;

    loop {
        tokio::select! {
            reason = done_rx.recv() => {
                if let Some(reason) = reason {
                    debug!(reason, "client pump finished");
                }
                break;
            }
            _ = keepalive.tick() => {
                if !writer.send(Message::Ping(Vec::new())).await {
                    break;
                }
                deadline = Instant::now() + CONNECTION_DEADLINE;
            }
            _ = sleep_until(deadline) => {
                warn!("connection deadline reached");
                break;
            }
            msg = ws_read.next() => {
                let msg = match msg {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => {
                        debug!(error = %e, "tunnel read ended");
                        break;
                    }
                    None => break,
                };
                match msg {
                    Message::Binary(data) => {
                        if write_client(&mut client_write, &data).await.is_err() {
                            break;
                        }
                    }
                    Message::Text(text) => match Frame::parse(&text) {
                        Ok(Frame::Data(payload)) => {
                            if write_client(&mut client_write, payload.as_bytes()).await.is_err() {
                                break;
                            }
                        }
                        Ok(Frame::Close) => break,
                        Ok(Frame::Ping) => {
                            writer.send_frame(Frame::Pong).await;
                        }
                        Ok(Frame::Pong) => {}
                        Ok(Frame::Error(info)) => {
                            warn!(error = %info, "egress reported error");
                        }
                        Ok(other) => {
                            debug!(frame = ?other, "ignoring unexpected frame");
                        }
                        Err(e) => {
                            warn!(error = %e, "unparseable text frame dropped");
                        }
                    },
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }

    let _ = client_write.shutdown().await;
}

/// Client write with a bounded timeout/retry, matching the upstream write
/// policy on the egress side.
async fn write_client(w: &mut OwnedWriteHalf, buf: &[u8]) -> std::io::Result<()> {
    let mut timeouts = 0u32;
    loop {
        match timeout(CLIENT_WRITE_TIMEOUT, w.write_all(buf)).await {
            Ok(result) => return result,
            Err(_) => {
                timeouts += 1;
                if timeouts > CLIENT_WRITE_RETRIES {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        format!("client write timed out after {timeouts} attempts"),
                    ));
                }
                sleep(CLIENT_WRITE_RETRY_DELAY).await;
            }
        }
    }
}
