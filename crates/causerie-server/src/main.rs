//! # causerie-server
//!
//! Coordination server for the Causerie chat network.
//!
//! This binary provides:
//! - **WebSocket gateway** for the real-time command/ack/event protocol
//! - **Chat engine** owning rooms, messages, scheduling, and fan-out
//! - **Encrypted SQLite store** (message content sealed at rest)
//! - **REST API** (axum) for health checks, history reads, and key
//!   distribution

mod api;
mod config;
mod dispatch;
mod e2e;
mod engine;
mod error;
mod gateway;
mod ledger;
mod mailer;
mod registry;
mod rooms;
mod scheduler;

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use causerie_store::Database;

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::engine::Engine;
use crate::mailer::LogMailer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,causerie_server=debug")),
        )
        .init();

    info!("Starting Causerie server v{}", env!("CARGO_PKG_VERSION"));

    let config = ServerConfig::from_env();
    info!(
        instance = %config.instance_name,
        db = %config.db_path.display(),
        http = %config.http_addr,
        "Loaded configuration"
    );

    let db = Database::open_at(&config.db_path, &config.seal_key)?;

    let engine = Engine::new(db, &config, Arc::new(LogMailer));
    engine.start().await.map_err(|e| anyhow::anyhow!("scheduler recovery failed: {e}"))?;

    let app_state = AppState {
        engine: Arc::clone(&engine),
        config: Arc::new(config.clone()),
    };

    tokio::select! {
        result = api::serve(app_state, config.http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                engine.stop().await;
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    engine.stop().await;
    Ok(())
}
