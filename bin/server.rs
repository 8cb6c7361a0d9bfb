// Trust Exchange - Web Server

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use trust_exchange::{http, Config, Exchange, LogEmitter, Store};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,trust_exchange=debug,tower_http=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_line_number(true),
        )
        .init();

    tracing::info!("Starting Trust Exchange server");

    let config = Config::from_env()?;

    let store = Store::open(&config.db_path, config.store.clone())
        .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?;
    tracing::info!(path = %config.db_path.display(), "database opened");

    let exchange = Arc::new(Exchange::new(store, Arc::new(LogEmitter)));

    // Pick up anything committed but not handed off before the last shutdown
    let relay = exchange.clone();
    let relayed = tokio::task::spawn_blocking(move || relay.outbox().relay_pending())
        .await
        .context("relay task panicked")??;
    if relayed > 0 {
        tracing::info!(relayed, "relayed pending notifications");
    }

    let app = http::router(exchange);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;

    tracing::info!(addr = %config.bind_addr, "server listening");

    axum::serve(listener, app)
        .await
        .context("Failed to start server")?;

    Ok(())
}
