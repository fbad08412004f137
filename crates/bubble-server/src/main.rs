//! # bubble-server
//!
//! Daemon for the bubble proximity access-control engine.
//!
//! This binary:
//! - talks to the UWB accessory over Bluetooth LE
//! - classifies ranging distances into the secure bubble
//! - applies or lifts app restriction and records session logs
//! - serves the engine state and triggers over a REST API with Swagger UI
//!
//! ## Running
//!
//! ```bash
//! # Development, with a simulated accessory
//! cargo run --package bubble-server --features mock-bluetooth
//!
//! # Production
//! BUBBLE_ENV=production ./bubble-server
//! ```
//!
//! `BUBBLE_CONFIG` points at an alternative config file and `BUBBLE_BIND`
//! overrides the listen address (default `0.0.0.0:3000`).

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use std::net::SocketAddr;

use anyhow::Context;
use bubble_core::{Config, Event};
use bubble_server::state::AppState;
use bubble_server::{api, logging};
use tokio::net::TcpListener;
use tracing::{info, warn};

const DEFAULT_BIND: &str = "0.0.0.0:3000";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init(logging::is_production())?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting bubble-server");

    let config = match std::env::var_os("BUBBLE_CONFIG") {
        Some(path) => Config::load_from(&path)
            .with_context(|| format!("loading config from {}", path.to_string_lossy()))?,
        None => Config::load().context("loading config")?,
    };

    let running = AppState::start(config).await?;
    let engine = running.state.engine.clone();
    let app = api::create_router(running.state);

    let addr: SocketAddr = std::env::var("BUBBLE_BIND")
        .unwrap_or_else(|_| DEFAULT_BIND.to_string())
        .parse()
        .context("parsing BUBBLE_BIND")?;
    let listener = TcpListener::bind(addr).await?;

    info!(%addr, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Stopping engine");
    if engine.post(Event::Shutdown).is_err() {
        warn!("Engine already stopped");
    }
    if let Err(e) = running.coordinator.await {
        warn!(error = %e, "Coordinator task ended abnormally");
    }

    info!("bubble-server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
