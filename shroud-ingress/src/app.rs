//! Application lifecycle: initialization, task orchestration, shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::info;

use crate::config::Config;
use crate::ranges::{self, RangeTables};
use crate::routing::RoutingMode;
use crate::server;
use crate::state::AppState;

/// Run the full ingress lifecycle after config has been parsed.
pub async fn run(config: Config) -> anyhow::Result<()> {
    config.validate()?;
    init_tracing(&config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %config.listen,
        routing = ?config.routing,
        server = %config.server,
        "shroud-ingress starting"
    );

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()?;

    // Range tables matter only in bypass_cn mode.
    let tables = if config.routing == RoutingMode::BypassCn {
        ranges::load_or_download(&config, &http).await?
    } else {
        RangeTables::default()
    };

    let state = Arc::new(AppState::new(config, tables, http)?);
    let listener = TcpListener::bind(state.config.listen).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = tokio::spawn(server::run(Arc::clone(&state), listener, shutdown_rx));
    info!("started");

    wait_for_shutdown().await;
    info!("shutdown signal received, cleaning up...");
    let _ = shutdown_tx.send(true);

    // Tear down live relays so their sockets close promptly.
    state.conns.abort_all();
    server.await??;

    info!("stopped");
    Ok(())
}

fn init_tracing(config: &Config) {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
