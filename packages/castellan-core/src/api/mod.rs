//! HTTP API layer.
//!
//! This module contains thin handlers that delegate to the backends, the
//! router construction, and server startup.

use std::net::SocketAddr;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::audio::AudioBackend;
use crate::bootstrap::Backends;
use crate::events::Broadcaster;
use crate::players::PlayersBackend;
use crate::power::PowerBackend;
use crate::units::UnitsBackend;
use crate::utils;

pub mod http;
mod stream;

/// Errors that can occur when starting or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind the listening socket.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    /// The accept loop failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Static host metadata served by `GET /server`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerDescription {
    pub name: String,
    pub version: String,
    pub os: String,
}

impl ServerDescription {
    /// Reads host metadata once at startup.
    pub fn detect() -> Self {
        Self {
            name: hostname::get()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "unknown".to_string()),
            version: env!("CARGO_PKG_VERSION").to_string(),
            os: utils::os_description(),
        }
    }
}

/// Shared application state for the API layer.
///
/// A thin wrapper around the backends; all business logic lives in the
/// backends themselves. Disabled backends are `None` and their routes
/// answer 404.
#[derive(Clone)]
pub struct AppState {
    pub players: Option<Arc<PlayersBackend>>,
    pub audio: Option<Arc<AudioBackend>>,
    pub units: Option<Arc<UnitsBackend>>,
    pub power: Option<Arc<PowerBackend>>,
    pub broadcaster: Arc<Broadcaster>,
    pub server: Arc<ServerDescription>,
    /// Root token; streaming handlers terminate when it fires.
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Builds the API state from the bootstrapped backends.
    pub fn new(backends: &Backends, server: ServerDescription) -> Self {
        Self {
            players: backends.players.clone(),
            audio: backends.audio.clone(),
            units: backends.units.clone(),
            power: backends.power.clone(),
            broadcaster: Arc::clone(&backends.broadcaster),
            server: Arc::new(server),
            shutdown: backends.cancel_token.clone(),
        }
    }
}

/// Starts the HTTP server and serves until the shutdown token fires.
pub async fn start_server(
    state: AppState,
    addr: SocketAddr,
    cors_origins: &[String],
) -> Result<(), ServerError> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })?;
    log::info!("Server listening on http://{addr}");

    let shutdown = state.shutdown.clone();
    let app = http::create_router(state, cors_origins);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}
