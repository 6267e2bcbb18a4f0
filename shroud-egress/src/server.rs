//! Egress HTTP surface.
//!
//! Every path answers plain HTTP unless the request is a WebSocket upgrade:
//! `/ping` returns a health JSON, `/` and `/index.html` a greeting, anything
//! else 404. Upgrades are gated by the shared token (401) and the session
//! pool (503); the final URL path segment may carry a fallback override
//! (`host-port` items, comma-separated).

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use shroud_proto::addr::{parse_fallback_path_segment, FallbackAddr};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::session;
use crate::state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new().fallback(handle).with_state(state)
}

/// Bind and serve until the shutdown signal flips.
pub async fn run(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(state.config.listen).await?;
    info!(addr = %state.config.listen, "egress listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;

    info!("egress stopped");
    Ok(())
}

async fn handle(
    State(state): State<Arc<AppState>>,
    uri: Uri,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    match ws {
        Ok(upgrade) => handle_upgrade(state, uri, headers, upgrade),
        Err(_) => handle_http(uri),
    }
}

fn handle_http(uri: Uri) -> Response {
    match uri.path() {
        "/ping" => {
            let ts = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0);
            axum::Json(serde_json::json!({ "status": "ok", "ts": ts })).into_response()
        }
        "/" | "/index.html" => "Hello World!".into_response(),
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

fn handle_upgrade(
    state: Arc<AppState>,
    uri: Uri,
    headers: HeaderMap,
    upgrade: WebSocketUpgrade,
) -> Response {
    let offered = offered_protocols(&headers);

    if let Some(expected) = state.config.token.as_deref() {
        if !offered.iter().any(|p| p == expected) {
            warn!("upgrade rejected: token mismatch");
            return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
        }
    }

    let permit = match state.try_admit() {
        Some(p) => p,
        None => {
            warn!(
                max = state.config.max_sessions,
                "upgrade rejected: session pool exhausted"
            );
            return (StatusCode::SERVICE_UNAVAILABLE, "Too many concurrent sessions")
                .into_response();
        }
    };

    let fallbacks = effective_fallbacks(&state, &uri);
    let allow_origin = state.config.allow_origin.clone();

    // Echo the negotiated subprotocol so the client handshake completes:
    // the token when one is configured, otherwise the client's first offer.
    let negotiated = state
        .config
        .token
        .clone()
        .or_else(|| offered.first().cloned());
    let upgrade = match negotiated {
        Some(p) => upgrade.protocols([p]),
        None => upgrade,
    };

    let mut response = upgrade
        .on_upgrade(move |socket| session::run(socket, state, fallbacks, permit));
    if let Ok(value) = allow_origin.parse() {
        response
            .headers_mut()
            .insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
    }
    response
}

fn offered_protocols(headers: &HeaderMap) -> Vec<String> {
    headers
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// The last URL path segment may override the configured fallback list.
fn effective_fallbacks(state: &AppState, uri: &Uri) -> Vec<FallbackAddr> {
    let segment = uri.path().trim_matches('/').rsplit('/').next().unwrap_or("");
    if !segment.is_empty() {
        match parse_fallback_path_segment(segment) {
            Ok(list) if !list.is_empty() => return list,
            Ok(_) => {}
            Err(e) => {
                warn!(segment, error = %e, "ignoring malformed fallback path segment");
            }
        }
    }
    state.fallbacks.clone()
}
