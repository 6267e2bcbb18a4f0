//! Tunnel dial path: TCP -> TLS (with ECH) -> WebSocket upgrade.

use std::sync::Arc;
use std::time::Duration;

use rustls_pki_types::ServerName;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::ech;
use crate::state::AppState;

pub type TunnelStream = WebSocketStream<tokio_rustls::client::TlsStream<TcpStream>>;

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
/// Total dial attempts; the second runs after an ECH refresh.
const MAX_DIAL_ATTEMPTS: u32 = 2;
const ECH_RETRY_DELAY: Duration = Duration::from_secs(1);
/// Relay chunks are small; 16 MiB leaves plenty of headroom.
const MAX_WS_FRAME: usize = 16 << 20;

/// Dial the egress tunnel. A failure that names ECH clears the ConfigList
/// cache, waits a beat, and retries once with a fresh fetch.
pub async fn dial(state: &Arc<AppState>) -> anyhow::Result<TunnelStream> {
    let mut attempt = 0;
    loop {
        attempt += 1;

        let config_list = ech::ensure_config_list(&state.ech, &state.http, &state.config).await;
        let ech_bytes = match &config_list {
            Some(list) => Some(list.as_slice()),
            None if state.config.allow_no_ech => {
                warn!("dialing WITHOUT ECH: ConfigList unavailable and --allow-no-ech is set");
                None
            }
            None => anyhow::bail!("no ECH ConfigList available (non-ECH dial is disabled)"),
        };

        match dial_once(state, ech_bytes).await {
            Ok(ws) => return Ok(ws),
            Err(e) if attempt < MAX_DIAL_ATTEMPTS && ech::is_ech_error(&e.to_string()) => {
                warn!(error = %e, "ECH dial failure, refreshing ConfigList and retrying");
                state.ech.clear();
                sleep(ECH_RETRY_DELAY).await;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn dial_once(state: &Arc<AppState>, ech_config: Option<&[u8]>) -> anyhow::Result<TunnelStream> {
    let tls_config = Arc::new(ech::build_tls_config(ech_config)?);
    let addr = state.dial_addr().await?;

    let tcp = timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| anyhow::anyhow!("tunnel TCP connect timeout to {addr}"))??;
    configure_tcp_socket(&tcp);

    let server_name = ServerName::try_from(state.server.host.clone())?;
    let tls_stream = timeout(
        DIAL_TIMEOUT,
        TlsConnector::from(tls_config).connect(server_name, tcp),
    )
    .await
    .map_err(|_| anyhow::anyhow!("tunnel TLS handshake timeout"))??;

    let url = format!("wss://{}{}", state.server, state.server_path);
    let mut request = url.clone().into_client_request()?;
    if let Some(token) = &state.config.token {
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", token.parse()?);
    }
    let ws_config = WebSocketConfig {
        max_frame_size: Some(MAX_WS_FRAME),
        max_message_size: Some(MAX_WS_FRAME),
        ..Default::default()
    };

    let (ws, response) = timeout(
        DIAL_TIMEOUT,
        tokio_tungstenite::client_async_with_config(request, tls_stream, Some(ws_config)),
    )
    .await
    .map_err(|_| anyhow::anyhow!("tunnel WebSocket handshake timeout"))??;

    debug!(status = %response.status(), "tunnel WebSocket established");
    info!(url = %url, via = %addr, ech = ech_config.is_some(), "tunnel connected");
    Ok(ws)
}

/// Keepalive and NODELAY on the long-lived tunnel socket.
fn configure_tcp_socket(stream: &TcpStream) {
    let sock_ref = socket2::SockRef::from(stream);

    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(60))
        .with_interval(Duration::from_secs(5));
    if let Err(e) = sock_ref.set_tcp_keepalive(&keepalive) {
        warn!(error = %e, "failed to set TCP keepalive on tunnel socket");
    }

    if let Err(e) = sock_ref.set_nodelay(true) {
        warn!(error = %e, "failed to set TCP_NODELAY on tunnel socket");
    }
}
