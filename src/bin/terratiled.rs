//! Thin entry point: wires the provider clients, cache, rate limiter and
//! fetcher together and runs the reprojecting tile server (spec §0, §4.12).

use std::sync::Arc;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use terratile_core::cache::{CacheConfig, PersistentCache};
use terratile_core::fetcher::Fetcher;
use terratile_core::provider::{build_http_client, EsriClient, GeClient, DEFAULT_DEADLINE};
use terratile_core::ratelimit::RateLimitController;
use terratile_core::server::TileServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "terratile_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let http = build_http_client(DEFAULT_DEADLINE)?;
    let ge = Arc::new(GeClient::new(http.clone()));
    let esri = Arc::new(EsriClient::new(http));

    ge.initialize(terratile_core::provider::ge::Database::Current).await?;
    ge.initialize(terratile_core::provider::ge::Database::TimeMachine).await?;
    esri.initialize().await?;

    let cache = Arc::new(PersistentCache::new(CacheConfig::default())?);
    let rate_limiter = Arc::new(RateLimitController::with_defaults());

    let fetcher = Arc::new(Fetcher::new(ge, esri, cache, rate_limiter));
    let server = TileServer::new(fetcher);

    server.run().await?;
    Ok(())
}
