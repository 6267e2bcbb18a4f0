//! Ingress accept loop and per-connection protocol sniff.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::state::AppState;
use crate::{http, socks5};

/// How long the first byte may take to arrive.
const SNIFF_TIMEOUT: Duration = Duration::from_secs(30);

pub async fn run(
    state: Arc<AppState>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, "ingress listening");

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, peer) = match result {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                debug!(%peer, "new connection");
                stream.set_nodelay(true).ok();

                let conn_state = Arc::clone(&state);
                let handle = tokio::spawn(async move {
                    if let Err(e) = dispatch(stream, &conn_state).await {
                        debug!(%peer, error = %e, "connection ended with error");
                    }
                });

                // Track for teardown on stop; a waiter task deregisters on
                // normal completion.
                let id = state.conns.register(handle.abort_handle());
                let reg_state = Arc::clone(&state);
                tokio::spawn(async move {
                    let _ = handle.await;
                    reg_state.conns.deregister(id);
                });
            }
            _ = shutdown.changed() => {
                info!("ingress accept loop stopping");
                break;
            }
        }
    }

    Ok(())
}

/// Peek the first byte to pick a protocol handler: 0x05 is SOCKS5, an HTTP
/// method's first letter is HTTP, anything else is dropped.
async fn dispatch(stream: TcpStream, state: &Arc<AppState>) -> anyhow::Result<()> {
    let mut first = [0u8; 1];
    let n = timeout(SNIFF_TIMEOUT, stream.peek(&mut first))
        .await
        .map_err(|_| anyhow::anyhow!("sniff timeout"))??;
    if n == 0 {
        return Ok(());
    }

    match first[0] {
        0x05 => socks5::handle(stream, Arc::clone(state)).await,
        b'C' | b'G' | b'P' | b'H' | b'D' | b'O' | b'T' => {
            http::handle(stream, Arc::clone(state)).await
        }
        byte => {
            debug!(byte, "unknown protocol, dropping connection");
            Ok(())
        }
    }
}
