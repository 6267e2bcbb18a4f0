//! Direct relay path: plain TCP to the target, no tunnel involved.

use std::time::Duration;

use shroud_proto::Endpoint;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

const DIRECT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Dial the target directly. The caller sends its protocol-specific reply
/// before handing the client socket to [`run`].
pub async fn dial(target: &Endpoint) -> std::io::Result<TcpStream> {
    let stream = timeout(
        DIRECT_DIAL_TIMEOUT,
        TcpStream::connect((target.host.as_str(), target.port)),
    )
    .await
    .map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("direct dial timeout to {target}"),
        )
    })??;
    stream.set_nodelay(true).ok();
    Ok(stream)
}

/// Copy bytes in both directions until either side closes. Any precomputed
/// first payload (the rebuilt forward-proxy request) is written before the
/// copy starts.
pub async fn run(mut client: TcpStream, mut upstream: TcpStream, first_payload: &[u8]) {
    if !first_payload.is_empty() {
        if let Err(e) = upstream.write_all(first_payload).await {
            if !is_normal_close(&e) {
                warn!(error = %e, "direct first payload write failed");
            }
            return;
        }
    }

    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
        Ok((up, down)) => {
            debug!(bytes_up = up, bytes_down = down, "direct relay closed");
        }
        Err(e) if is_normal_close(&e) => {}
        Err(e) => {
            warn!(error = %e, "direct relay failed");
        }
    }
}

/// Errors expected at the end of any TCP relay; these close quietly.
pub fn is_normal_close(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::NotConnected
    ) || e.to_string().contains("use of closed network connection")
}
