//! Egress side of the framed session.
//!
//! One WebSocket carries exactly one TCP relay. The session waits for the
//! client's `CONNECT` frame, dials the upstream (with the fallback cascade),
//! confirms with `CONNECTED`, then pumps bytes in both directions until
//! either side closes or the read watchdog fires.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use shroud_proto::addr::{Endpoint, FallbackAddr};
use shroud_proto::frame::{ErrorInfo, Frame};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::sync::OwnedSemaphorePermit;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

use crate::state::AppState;
use crate::upstream;

/// Upstream read buffer size per chunk.
const RELAY_CHUNK: usize = 32 * 1024;
/// Outbound WebSocket queue high-water mark; the upstream reader pauses
/// above this.
const HIGH_WATER_BYTES: usize = 1 << 20;
/// Backpressure poll delays: 8ms growing 1.5x, capped at 200ms.
const BACKOFF_INITIAL: Duration = Duration::from_millis(8);
const BACKOFF_MAX: Duration = Duration::from_millis(200);
/// Per-write timeout to the upstream socket.
const UPSTREAM_WRITE_TIMEOUT: Duration = Duration::from_secs(5);
/// Write retries after a timeout, spaced 100ms apart.
const UPSTREAM_WRITE_RETRIES: u32 = 2;
const UPSTREAM_WRITE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Serialized, gauge-tracked writer over the WebSocket sink. Cloned by the
/// upstream reader pump; control frames and relay data never interleave
/// mid-frame because all writes funnel through one task.
#[derive(Clone)]
pub struct WsWriter {
    tx: mpsc::Sender<Message>,
    queued: Arc<AtomicUsize>,
}

impl WsWriter {
    /// Enqueue a message. Returns false once the writer task is gone.
    pub async fn send(&self, msg: Message) -> bool {
        self.queued.fetch_add(message_len(&msg), Ordering::AcqRel);
        self.tx.send(msg).await.is_ok()
    }

    pub fn queued_bytes(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    async fn send_frame(&self, frame: Frame) -> bool {
        self.send(Message::Text(frame.encode().into())).await
    }
}

fn message_len(msg: &Message) -> usize {
    match msg {
        Message::Text(t) => t.len(),
        Message::Binary(b) => b.len(),
        _ => 0,
    }
}

/// Spawn the dedicated WebSocket writer task.
fn spawn_ws_writer<S>(mut sink: S) -> (WsWriter, JoinHandle<()>)
where
    S: SinkExt<Message, Error = axum::Error> + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Message>(256);
    let queued = Arc::new(AtomicUsize::new(0));
    let gauge = Arc::clone(&queued);

    let handle = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let len = message_len(&msg);
            let result = sink.send(msg).await;
            gauge.fetch_sub(len, Ordering::AcqRel);
            if let Err(e) = result {
                debug!(error = %e, "WebSocket write failed");
                break;
            }
        }
        let _ = sink.close().await;
    });

    (WsWriter { tx, queued }, handle)
}

/// Relay-progress watchdog shared by both pumps.
#[derive(Clone)]
struct Watchdog {
    start: Instant,
    last_ms: Arc<AtomicU64>,
    timeout: Duration,
}

impl Watchdog {
    fn new(timeout: Duration) -> Self {
        Self {
            start: Instant::now(),
            last_ms: Arc::new(AtomicU64::new(0)),
            timeout,
        }
    }

    fn reset(&self) {
        let elapsed = self.start.elapsed().as_millis() as u64;
        self.last_ms.store(elapsed, Ordering::Release);
    }

    fn deadline(&self) -> Instant {
        self.start + Duration::from_millis(self.last_ms.load(Ordering::Acquire)) + self.timeout
    }

    fn expired(&self) -> bool {
        Instant::now() >= self.deadline()
    }
}

/// Run one tunnel session to completion. The semaphore permit is held for
/// the session's whole lifetime.
pub async fn run(
    socket: WebSocket,
    state: Arc<AppState>,
    fallbacks: Vec<FallbackAddr>,
    permit: OwnedSemaphorePermit,
) {
    let sid = state.next_session_id.fetch_add(1, Ordering::Relaxed);
    let _permit = permit;
    debug!(sid, active = state.active_sessions(), "session started");

    let (ws_sink, mut ws_read) = socket.split();
    let (writer, mut writer_handle) = spawn_ws_writer(ws_sink);

    let outcome = run_inner(&state, &fallbacks, sid, &mut ws_read, &writer).await;
    if let Err(reason) = outcome {
        debug!(sid, %reason, "session ended with error");
    }

    // Best-effort CLOSE, then drop the writer sender so the writer task
    // drains and closes the sink.
    let _ = writer.send_frame(Frame::Close).await;
    drop(writer);
    let _ = timeout(Duration::from_secs(5), &mut writer_handle).await;

    info!(sid, active = state.active_sessions() - 1, "session closed");
}

async fn run_inner(
    state: &Arc<AppState>,
    fallbacks: &[FallbackAddr],
    sid: u64,
    ws_read: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
    writer: &WsWriter,
) -> Result<(), String> {
    let watchdog = Watchdog::new(Duration::from_millis(state.config.read_timeout_ms));

    // INIT: the only acceptable frame is CONNECT.
    let (target, first_payload) = match await_connect(ws_read, writer, &watchdog).await? {
        Some(c) => c,
        None => return Ok(()), // peer went away before CONNECT
    };

    let target = match Endpoint::parse(&target) {
        Ok(t) => t,
        Err(e) => {
            let msg = format!("invalid target: {e}");
            writer
                .send_frame(Frame::Error(ErrorInfo::named(&msg, "ProtocolError")))
                .await;
            return Err(msg);
        }
    };

    if !state.host_allowed(&target.host) {
        let msg = format!("host {} not allowed", target.host);
        writer
            .send_frame(Frame::Error(ErrorInfo::named(&msg, "PolicyError")))
            .await;
        return Err(msg);
    }

    // CONNECTING: dial the cascade while rejecting any frames the client
    // sends early.
    let attempts = upstream::build_attempts(&target, fallbacks);
    let dial = upstream::dial_cascade(&attempts, state.config.connect_timeout_ms);
    tokio::pin!(dial);
    let (stream, chosen) = loop {
        tokio::select! {
            result = &mut dial => match result {
                Ok(ok) => break ok,
                Err(e) => {
                    let msg = e.to_string();
                    writer
                        .send_frame(Frame::Error(ErrorInfo::named(&msg, "DialError")))
                        .await;
                    return Err(msg);
                }
            },
            msg = ws_read.next() => match msg {
                Some(Ok(Message::Text(_) | Message::Binary(_))) => {
                    writer
                        .send_frame(Frame::Error(ErrorInfo::new("connect in progress")))
                        .await;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(format!("WebSocket read error: {e}")),
                None => return Ok(()),
            },
        }
    };
    if chosen != target {
        info!(sid, target = %target, via = %chosen, "connected via fallback");
    }

    let (up_read, mut up_write) = stream.into_split();

    // The first payload must reach the upstream before CONNECTED goes out.
    if !first_payload.is_empty() {
        write_upstream(&mut up_write, first_payload.as_bytes())
            .await
            .map_err(|e| format!("first payload write failed: {e}"))?;
    }
    if !writer.send_frame(Frame::Connected).await {
        return Err("WebSocket closed before CONNECTED".into());
    }
    debug!(sid, target = %target, "relay established");

    // CONNECTED: two pumps plus the watchdog.
    let bytes_up = Arc::new(AtomicU64::new(0));
    let bytes_down = Arc::new(AtomicU64::new(0));

    let (up_tx, up_rx) = mpsc::channel::<Bytes>(64);
    // Either pump finishing ends the session.
    let (done_tx, mut done_rx) = mpsc::channel::<&'static str>(2);
    let up_writer_handle = spawn_upstream_writer(
        up_write,
        up_rx,
        watchdog.clone(),
        Arc::clone(&bytes_up),
        writer.clone(),
        done_tx.clone(),
    );
    let up_reader_handle = spawn_upstream_reader(
        up_read,
        writer.clone(),
        watchdog.clone(),
        Arc::clone(&bytes_down),
        done_tx,
    );

    let result = relay_ws_to_upstream(ws_read, writer, &up_tx, &watchdog, &mut done_rx, sid).await;

    // Unblock and collect the pumps.
    drop(up_tx);
    up_reader_handle.abort();
    let _ = timeout(Duration::from_secs(5), up_writer_handle).await;
    let _ = up_reader_handle.await;

    info!(
        sid,
        target = %target,
        bytes_up = bytes_up.load(Ordering::Relaxed),
        bytes_down = bytes_down.load(Ordering::Relaxed),
        "relay finished"
    );
    result
}

/// Wait for the initial CONNECT frame.
async fn await_connect(
    ws_read: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
    writer: &WsWriter,
    watchdog: &Watchdog,
) -> Result<Option<(String, String)>, String> {
    loop {
        tokio::select! {
            msg = ws_read.next() => match msg {
                Some(Ok(Message::Text(text))) => match Frame::parse(text.as_str()) {
                    Ok(Frame::Connect { target, payload }) => {
                        return Ok(Some((target, payload)));
                    }
                    Ok(_) | Err(_) => {
                        writer
                            .send_frame(Frame::Error(ErrorInfo::named(
                                "expected CONNECT",
                                "ProtocolError",
                            )))
                            .await;
                        return Err("first frame was not CONNECT".into());
                    }
                },
                Some(Ok(Message::Binary(_))) => {
                    writer
                        .send_frame(Frame::Error(ErrorInfo::named(
                            "expected CONNECT",
                            "ProtocolError",
                        )))
                        .await;
                    return Err("binary frame before CONNECT".into());
                }
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(format!("WebSocket read error: {e}")),
            },
            _ = sleep_until(watchdog.deadline()) => {
                if watchdog.expired() {
                    return Err("timed out waiting for CONNECT".into());
                }
            }
        }
    }
}

/// Pump WS -> upstream: dispatch incoming frames until close, a finished
/// pump, or the watchdog.
async fn relay_ws_to_upstream(
    ws_read: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
    writer: &WsWriter,
    up_tx: &mpsc::Sender<Bytes>,
    watchdog: &Watchdog,
    done_rx: &mut mpsc::Receiver<&'static str>,
    sid: u64,
) -> Result<(), String> {
    loop {
        tokio::select! {
            reason = done_rx.recv() => {
                if let Some(reason) = reason {
                    debug!(sid, reason, "pump finished");
                }
                return Ok(());
            }
            msg = ws_read.next() => {
                let msg = match msg {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => return Err(format!("WebSocket read error: {e}")),
                    None => return Ok(()),
                };
                match msg {
                    Message::Binary(data) => {
                        if up_tx.send(data).await.is_err() {
                            return Ok(()); // upstream writer gone
                        }
                    }
                    Message::Text(text) => match Frame::parse(text.as_str()) {
                        Ok(Frame::Data(payload)) => {
                            if up_tx.send(Bytes::from(payload)).await.is_err() {
                                return Ok(());
                            }
                        }
                        Ok(Frame::Close) => return Ok(()),
                        Ok(Frame::Ping) => {
                            writer.send_frame(Frame::Pong).await;
                        }
                        Ok(Frame::Pong) => {}
                        Ok(Frame::Error(info)) => {
                            warn!(error = %info, "peer reported error");
                        }
                        Ok(Frame::Connect { .. }) | Ok(Frame::Connected) => {
                            writer
                                .send_frame(Frame::Error(ErrorInfo::named(
                                    "unexpected frame in relay",
                                    "ProtocolError",
                                )))
                                .await;
                            return Err("unexpected control frame during relay".into());
                        }
                        Err(e) => {
                            warn!(error = %e, "unparseable text frame dropped");
                        }
                    },
                    Message::Close(_) => return Ok(()),
                    _ => {}
                }
            }
            _ = sleep_until(watchdog.deadline()) => {
                if watchdog.expired() {
                    return Err("read timeout, no relay progress".into());
                }
            }
        }
    }
}

/// Serialized write queue to the upstream socket. Frames are applied in
/// arrival order; a write failure notifies the peer and ends the task.
fn spawn_upstream_writer(
    mut up_write: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Bytes>,
    watchdog: Watchdog,
    bytes_up: Arc<AtomicU64>,
    writer: WsWriter,
    done_tx: mpsc::Sender<&'static str>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(chunk) = rx.recv().await {
            if let Err(e) = write_upstream(&mut up_write, &chunk).await {
                warn!(error = %e, "upstream write failed");
                writer
                    .send_frame(Frame::Error(ErrorInfo::named(
                        format!("upstream write failed: {e}"),
                        "RelayError",
                    )))
                    .await;
                let _ = done_tx.send("upstream write failed").await;
                break;
            }
            bytes_up.fetch_add(chunk.len() as u64, Ordering::Relaxed);
            watchdog.reset();
        }
        let _ = up_write.shutdown().await;
    })
}

/// Pump upstream -> WS with backpressure against the outbound queue gauge.
fn spawn_upstream_reader(
    mut up_read: OwnedReadHalf,
    writer: WsWriter,
    watchdog: Watchdog,
    bytes_down: Arc<AtomicU64>,
    done_tx: mpsc::Sender<&'static str>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; RELAY_CHUNK];
        loop {
            let n = match up_read.read(&mut buf).await {
                Ok(0) => break, // upstream EOF
                Ok(n) => n,
                Err(e) => {
                    debug!(error = %e, "upstream read failed");
                    break;
                }
            };
            wait_for_drain(&writer).await;
            if !writer
                .send(Message::Binary(Bytes::copy_from_slice(&buf[..n])))
                .await
            {
                break;
            }
            bytes_down.fetch_add(n as u64, Ordering::Relaxed);
            watchdog.reset();
        }
        // Reaching here means the relay is over; tell the peer.
        writer.send_frame(Frame::Close).await;
        let _ = done_tx.send("upstream closed").await;
    })
}

/// Sleep-poll until the outbound queue drains below the high-water mark.
async fn wait_for_drain(writer: &WsWriter) {
    let mut delay = BACKOFF_INITIAL;
    while writer.queued_bytes() > HIGH_WATER_BYTES {
        sleep(delay).await;
        delay = (delay * 3 / 2).min(BACKOFF_MAX);
    }
}

/// Write with a per-attempt timeout; timeouts retry a bounded number of
/// times, hard I/O errors fail immediately.
async fn write_upstream(w: &mut OwnedWriteHalf, buf: &[u8]) -> std::io::Result<()> {
    let mut timeouts = 0u32;
    loop {
        match timeout(UPSTREAM_WRITE_TIMEOUT, w.write_all(buf)).await {
            Ok(result) => return result,
            Err(_) => {
                timeouts += 1;
                if timeouts > UPSTREAM_WRITE_RETRIES {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        format!("upstream write timed out after {timeouts} attempts"),
                    ));
                }
                sleep(UPSTREAM_WRITE_RETRY_DELAY).await;
            }
        }
    }
}
