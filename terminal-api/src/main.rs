//! Trading Terminal API Server
//!
//! Runs the sync engine against the streaming feed and serves the
//! normalized store, flash highlights and engine health over HTTP.

mod flash;
mod routes;

use axum::{
    http::{header, Method},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use terminal_core::TopicKey;
use terminal_sync::{FlashEngine, SyncConfig, SyncEngine, SyncHandle, SystemClock};
use tokio::sync::RwLock;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub sync: SyncHandle,
    pub flash: Arc<RwLock<FlashEngine>>,
    pub clock: Arc<SystemClock>,
}

/// Topics from a comma separated list, skipping entries that do not parse
fn parse_topics(raw: &str) -> Vec<TopicKey> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| match s.parse() {
            Ok(topic) => Some(topic),
            Err(e) => {
                warn!("Ignoring topic {:?}: {}", s, e);
                None
            }
        })
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env.local file
    if let Err(e) = dotenvy::from_filename(".env.local") {
        // Not an error if the file doesn't exist
        if !matches!(e, dotenvy::Error::Io(_)) {
            eprintln!("Warning: Failed to load .env.local: {}", e);
        }
    }

    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,terminal_sync=debug,terminal_api=debug")),
        )
        .init();

    info!("Starting Trading Terminal API");

    let config = SyncConfig::from_env()?;
    info!("Streaming from {}", config.stream_url);
    if config.snapshot_url.is_none() {
        info!("No SYNC_SNAPSHOT_URL set - resyncs rely on streamed snapshots only");
    }

    let clock = Arc::new(SystemClock::new());
    let flash = Arc::new(RwLock::new(FlashEngine::new(config.flash_duration)));

    let engine = SyncEngine::start(config)?;
    let sync = engine.handle();

    // Hold one subscription per configured topic for the life of the process
    let topics = parse_topics(&std::env::var("SYNC_TOPICS").unwrap_or_default());
    let mut subscriptions = Vec::with_capacity(topics.len());
    for topic in topics {
        info!("Subscribing to {}", topic);
        subscriptions.push(sync.acquire(topic).await?);
    }

    // Feed instrument changes into the flash board
    flash::spawn_watcher(sync.clone(), flash.clone(), clock.clone()).await?;

    let state = AppState {
        sync: sync.clone(),
        flash,
        clock,
    };

    // Configure CORS for frontend
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    // Build router
    let app = Router::new()
        .nest("/api", routes::api_routes())
        .layer(cors)
        .with_state(state);

    // Start server
    let port = std::env::var("SERVER_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(3001);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    info!("Shutting down sync engine");
    for subscription in subscriptions {
        let _ = sync.release(subscription).await;
    }
    engine.stop().await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_topics_skips_invalid_entries() {
        let topics = parse_topics("instrument:EURUSD, bogus ,position:P-1,,");
        assert_eq!(
            topics.iter().map(ToString::to_string).collect::<Vec<_>>(),
            vec!["instrument:EURUSD", "position:P-1"]
        );
    }
}
