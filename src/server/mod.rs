//! Reprojecting tile server (C12, spec §4.12).

pub mod handler;
pub mod transparent;

pub use handler::ServerState;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::Result;
use crate::fetcher::Fetcher;

/// Tile server configuration. `bind_addr` defaults to an ephemeral port on
/// the loopback interface (spec §4.12): the desktop app picks the actual
/// port up after `run` binds and reports it back to the embedder.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
        }
    }
}

/// The reprojecting tile server: wraps a shared [`Fetcher`] behind three
/// HTTP routes and a permissive CORS policy (spec §4.12).
pub struct TileServer {
    config: ServerConfig,
    fetcher: Arc<Fetcher>,
}

impl TileServer {
    pub fn new(fetcher: Arc<Fetcher>) -> Self {
        Self::with_config(fetcher, ServerConfig::default())
    }

    pub fn with_config(fetcher: Arc<Fetcher>, config: ServerConfig) -> Self {
        Self { config, fetcher }
    }

    /// Build the router without binding, useful for tests that drive it
    /// with `tower::ServiceExt::oneshot` instead of a real socket.
    pub fn router(&self) -> Router {
        let state = ServerState { fetcher: self.fetcher.clone() };

        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([axum::http::Method::GET, axum::http::Method::OPTIONS]);

        Router::new()
            .route("/google-earth/:date/:z/:x/:y", get(handler::handle_google_earth))
            .route(
                "/google-earth-historical/:date_hex/:z/:x/:y",
                get(handler::handle_google_earth_historical),
            )
            .route("/esri-wayback/:date/:z/:x/:y", get(handler::handle_esri_wayback))
            .with_state(state)
            .layer(cors)
            .layer(TraceLayer::new_for_http())
    }

    /// Bind and serve. Returns the actual bound address (useful when
    /// `bind_addr`'s port is `0`) alongside the server future.
    pub async fn run(self) -> Result<()> {
        let router = self.router();
        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!("reprojecting tile server listening on {local_addr}");

        axum::serve(listener, router)
            .await
            .map_err(|e| crate::error::Error::Other(format!("server error: {e}")))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_binds_loopback_ephemeral_port() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr.ip().to_string(), "127.0.0.1");
        assert_eq!(config.bind_addr.port(), 0);
    }
}
