//! # terratile-core
//!
//! Acquisition core for historical satellite imagery: a client for Google
//! Earth's TimeMachine protocol and for Esri's Wayback WMTS service, a
//! Plate-Carrée/Web-Mercator projection bridge, a concurrent tile fetcher
//! with a persistent on-disk cache and per-provider rate-limit backoff, a
//! reprojecting HTTP tile server, and a GeoTIFF exporter.
//!
//! ## Layout
//!
//! - [`codec`] — the XOR stream cipher and zlib framing GE packets travel in
//! - [`dates`] — GE's packed 32-bit date encoding
//! - [`quadtree`] — quadtree path arithmetic (traversal, sub-indices)
//! - [`packet`] — the two wire formats a quadtree packet can arrive in
//! - [`provider`] — the GE and Esri HTTP clients
//! - [`tile`] — XYZ/Web-Mercator, GE Plate-Carrée, and the bridge between them
//! - [`cache`] — the persistent on-disk tile cache
//! - [`ratelimit`] — per-provider backoff state machine
//! - [`fetcher`] — the concurrent batch downloader
//! - [`server`] — the reprojecting HTTP tile server
//! - [`geotiff`] — GeoTIFF export for a fetched tile set
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use terratile_core::cache::{CacheConfig, PersistentCache};
//! use terratile_core::fetcher::Fetcher;
//! use terratile_core::provider::{build_http_client, EsriClient, GeClient, DEFAULT_DEADLINE};
//! use terratile_core::ratelimit::RateLimitController;
//!
//! # async fn example() -> terratile_core::Result<()> {
//! let http = build_http_client(DEFAULT_DEADLINE)?;
//! let ge = Arc::new(GeClient::new(http.clone()));
//! let esri = Arc::new(EsriClient::new(http));
//! let cache = Arc::new(PersistentCache::new(CacheConfig::default())?);
//! let rate_limiter = Arc::new(RateLimitController::with_defaults());
//!
//! let fetcher = Fetcher::new(ge, esri, cache, rate_limiter);
//! # let _ = fetcher;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod codec;
pub mod dates;
pub mod error;
pub mod fetcher;
pub mod geotiff;
pub mod packet;
pub mod provider;
pub mod quadtree;
pub mod ratelimit;
pub mod server;
pub mod tile;

pub use error::{Error, Result};

/// Current version of the library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// No provider in this crate is asked to serve tiles above this zoom
/// (spec non-goal: zoom levels above 21 are out of scope).
pub const MAX_ZOOM: u8 = 21;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_zoom_is_21() {
        assert_eq!(MAX_ZOOM, 21);
    }
}
