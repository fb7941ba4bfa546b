//! Concurrent tile fetcher (C11, spec §4.11).
//!
//! A bounded worker pool drains a batch of [`TileRequest`]s through the
//! cache, the rate-limit controller, and finally a provider client, with
//! the zoom-fallback-and-upscale strategy also reused by the tile server
//! (C12) for individual requests. Grounded in the `buffer_unordered`
//! worker-pool pattern from this crate's map-tile loader.

use std::sync::Arc;

use bytes::Bytes;
use chrono::NaiveDate;
use futures::stream::{self, StreamExt};
use image::imageops::FilterType;
use tokio::sync::mpsc;

use crate::cache::{CacheKey, PersistentCache, Provider};
use crate::error::{Error, Result};
use crate::provider::{EsriClient, GeClient};
use crate::quadtree::QuadtreePath;
use crate::ratelimit::RateLimitController;
use crate::tile::{xyz_tile_to_ge_tile, XyzTile, TILE_SIZE};

/// Default worker pool size (spec §4.11, §5), used when `FetcherConfig`
/// isn't overridden.
pub const WORKER_POOL_SIZE: usize = 10;

/// Zoom fallback never descends below this level.
pub const ZOOM_FLOOR: u8 = 10;

/// Tunables for a fetch batch.
#[derive(Debug, Clone, Copy)]
pub struct FetcherConfig {
    /// Bounded worker pool size for `run_batch`'s `buffer_unordered`.
    pub workers: usize,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get().min(WORKER_POOL_SIZE),
        }
    }
}

/// A single tile to fetch, tagged with which source/date to fetch it from.
#[derive(Debug, Clone)]
pub struct TileRequest {
    pub tile: XyzTile,
    pub source: TileSource,
}

/// Which provider (and which imagery) a [`TileRequest`] resolves against.
#[derive(Debug, Clone)]
pub enum TileSource {
    GeCurrent,
    GeHistorical { hex_date: String, date: String },
    Esri { date: NaiveDate },
}

impl TileSource {
    fn provider(&self) -> Provider {
        match self {
            TileSource::GeCurrent | TileSource::GeHistorical { .. } => Provider::GoogleEarth,
            TileSource::Esri { .. } => Provider::EsriWayback,
        }
    }

    fn cache_date(&self) -> Option<String> {
        match self {
            TileSource::GeCurrent => None,
            TileSource::GeHistorical { date, .. } => Some(date.clone()),
            TileSource::Esri { date } => Some(date.to_string()),
        }
    }
}

/// Outcome of fetching one tile.
#[derive(Debug)]
pub enum TileResult {
    Success { tile: XyzTile, bytes: Bytes },
    Failure { tile: XyzTile, error: String },
}

/// Batch progress, emitted after every completed tile (spec §4.11).
#[derive(Debug, Clone, Copy)]
pub struct FetchProgress {
    pub downloaded: usize,
    pub total: usize,
    pub percent: f32,
    pub current_date_index: usize,
    pub total_date_index: usize,
}

/// Cooperative cancellation: checked between tiles and at the top of each
/// network attempt (spec §5). Cloning shares the same underlying flag.
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<std::sync::atomic::AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(std::sync::atomic::Ordering::SeqCst)
    }
}

/// The collaborators a fetch batch needs; held as `Arc`s so a batch can be
/// spawned without borrowing the caller's state.
pub struct Fetcher {
    pub ge: Arc<GeClient>,
    pub esri: Arc<EsriClient>,
    pub cache: Arc<PersistentCache>,
    pub rate_limiter: Arc<RateLimitController>,
    config: FetcherConfig,
}

impl Fetcher {
    pub fn new(
        ge: Arc<GeClient>,
        esri: Arc<EsriClient>,
        cache: Arc<PersistentCache>,
        rate_limiter: Arc<RateLimitController>,
    ) -> Self {
        Self::with_config(ge, esri, cache, rate_limiter, FetcherConfig::default())
    }

    pub fn with_config(
        ge: Arc<GeClient>,
        esri: Arc<EsriClient>,
        cache: Arc<PersistentCache>,
        rate_limiter: Arc<RateLimitController>,
        config: FetcherConfig,
    ) -> Self {
        Self { ge, esri, cache, rate_limiter, config }
    }

    /// Run a batch of tile requests through the bounded worker pool,
    /// streaming progress and results to `progress_tx`/`result_tx`.
    /// Returns once every request has either succeeded or exhausted its
    /// fallbacks (or the batch was cancelled).
    pub async fn run_batch(
        &self,
        requests: Vec<TileRequest>,
        cancel: CancellationToken,
        progress_tx: Option<mpsc::UnboundedSender<FetchProgress>>,
        result_tx: Option<mpsc::UnboundedSender<TileResult>>,
    ) -> BatchSummary {
        let total = requests.len();
        let downloaded = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let succeeded = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        stream::iter(requests)
            .map(|req| {
                let cancel = cancel.clone();
                let downloaded = downloaded.clone();
                let succeeded = succeeded.clone();
                let progress_tx = progress_tx.clone();
                let result_tx = result_tx.clone();

                async move {
                    if cancel.is_cancelled() {
                        return;
                    }

                    let tile = req.tile;
                    let outcome = self.fetch_one(&req, &cancel).await;

                    let result = match outcome {
                        Ok(bytes) => {
                            succeeded.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                            TileResult::Success { tile, bytes }
                        }
                        Err(e) => TileResult::Failure {
                            tile,
                            error: e.to_string(),
                        },
                    };

                    let done = downloaded.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
                    if let Some(tx) = &progress_tx {
                        let _ = tx.send(FetchProgress {
                            downloaded: done,
                            total,
                            percent: (done as f32 / total.max(1) as f32) * 100.0,
                            current_date_index: 0,
                            total_date_index: 0,
                        });
                    }
                    if let Some(tx) = &result_tx {
                        let _ = tx.send(result);
                    }
                }
            })
            .buffer_unordered(self.config.workers.max(1))
            .collect::<Vec<_>>()
            .await;

        let succeeded = succeeded.load(std::sync::atomic::Ordering::SeqCst);
        let success_rate = if total == 0 { 1.0 } else { succeeded as f32 / total as f32 };

        if total > 0 && success_rate < 0.30 {
            tracing::warn!(
                succeeded,
                total,
                "tile batch success rate {:.1}% below 30% threshold",
                success_rate * 100.0
            );
        }

        BatchSummary {
            total,
            succeeded,
            success: succeeded >= 1,
        }
    }

    /// Fetch a single tile: cache, then rate-limit check, then provider
    /// client with zoom fallback. Also used directly by the tile server
    /// (C12) for one-off requests outside a batch.
    pub async fn fetch_one(&self, req: &TileRequest, cancel: &CancellationToken) -> Result<Bytes> {
        let key = CacheKey::new(
            req.source.provider(),
            req.tile.z,
            req.tile.x,
            req.tile.y,
            req.source.cache_date(),
        );

        if let Some(bytes) = self.cache.get(&key).await? {
            return Ok(bytes);
        }

        if cancel.is_cancelled() {
            return Err(Error::Other("cancelled".to_string()));
        }

        if self.rate_limiter.is_limited(key.provider).await {
            return Err(Error::RateLimited {
                provider: key.provider.to_string(),
                next_retry_at: chrono::Utc::now(),
            });
        }

        let bytes = Bytes::from(self.fetch_with_zoom_fallback(req, cancel).await?);
        self.cache.set(&key, bytes.clone()).await?;
        Ok(bytes)
    }

    /// Try the requested zoom, then fall back to lower zooms (spec §4.7,
    /// §4.11), extracting the covering quadrant and upscaling back to
    /// 256x256 on a lower-zoom success. Esri tiles are never zoom-adjusted;
    /// Esri already serves the exact requested zoom or nothing.
    async fn fetch_with_zoom_fallback(
        &self,
        req: &TileRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        match &req.source {
            TileSource::Esri { date } => {
                let layer = self
                    .esri
                    .layer_for_date(*date)
                    .await
                    .ok_or_else(|| Error::TileUnavailable {
                        tile: format!("{}/{}/{}", req.tile.z, req.tile.x, req.tile.y),
                        date: Some(date.to_string()),
                    })?;
                let result = self.esri.fetch_tile(&layer, req.tile).await;
                self.rate_limiter
                    .record_response(Provider::EsriWayback, status_of(&result))
                    .await;
                result
            }
            TileSource::GeCurrent | TileSource::GeHistorical { .. } => {
                let window = fallback_window(req.tile.z);
                let mut last_err = None;

                for dz in 0..=window {
                    if cancel.is_cancelled() {
                        return Err(Error::Other("cancelled".to_string()));
                    }
                    let zoom = match req.tile.z.checked_sub(dz) {
                        Some(z) if z >= ZOOM_FLOOR => z,
                        _ => break,
                    };

                    let ancestor = XyzTile::new(zoom, req.tile.x >> dz, req.tile.y >> dz)?;
                    match self.fetch_ge_tile(ancestor, &req.source).await {
                        Ok(bytes) if dz == 0 => return Ok(bytes),
                        Ok(bytes) => return upscale_quadrant(&bytes, dz, req.tile.x, req.tile.y),
                        Err(e) => last_err = Some(e),
                    }
                }

                Err(last_err.unwrap_or_else(|| Error::TileUnavailable {
                    tile: format!("{}/{}/{}", req.tile.z, req.tile.x, req.tile.y),
                    date: None,
                }))
            }
        }
    }

    async fn fetch_ge_tile(&self, tile: XyzTile, source: &TileSource) -> Result<Vec<u8>> {
        let ge_tile = xyz_tile_to_ge_tile(tile);
        let path = QuadtreePath::from_row_col_level(ge_tile.row, ge_tile.col, ge_tile.level)?;

        let result = match source {
            TileSource::GeCurrent => self.ge.fetch_current_tile(&path).await,
            TileSource::GeHistorical { hex_date, .. } => {
                self.ge.fetch_historical_tile(&path, hex_date).await
            }
            TileSource::Esri { .. } => unreachable!("esri handled separately"),
        };

        self.rate_limiter
            .record_response(Provider::GoogleEarth, status_of(&result))
            .await;
        result
    }
}

/// Approximate an HTTP status for rate-limit bookkeeping from a result:
/// success maps to 200, a 404-shaped [`Error::TileUnavailable`] maps to
/// 404, and anything else tries to recover the status embedded in the
/// provider client's network-error message.
fn status_of<T>(result: &Result<T>) -> u16 {
    match result {
        Ok(_) => 200,
        Err(Error::TileUnavailable { .. }) => 404,
        Err(e) => extract_status_code(&e.to_string()).unwrap_or(0),
    }
}

fn extract_status_code(message: &str) -> Option<u16> {
    let bytes = message.as_bytes();
    for i in 0..bytes.len().saturating_sub(2) {
        if bytes[i].is_ascii_digit() && bytes[i + 1].is_ascii_digit() && bytes[i + 2].is_ascii_digit() {
            if let Ok(code) = message[i..i + 3].parse::<u16>() {
                if (100..600).contains(&code) {
                    return Some(code);
                }
            }
        }
    }
    None
}

/// Fallback window per spec §4.7: at most 3 steps down for z >= 17, else 6.
fn fallback_window(z: u8) -> u8 {
    if z >= 17 {
        3
    } else {
        6
    }
}

/// Crop the sub-region of `image_bytes` (an ancestor tile `dz` levels above
/// the target) that the target tile occupies, and nearest-neighbor-upscale
/// it back to a full 256x256 tile.
fn upscale_quadrant(image_bytes: &[u8], dz: u8, x: u32, y: u32) -> Result<Vec<u8>> {
    let image = image::load_from_memory(image_bytes)?;
    let sub = (TILE_SIZE >> dz).max(1);
    let mask = (1u32 << dz) - 1;
    let off_x = (x & mask) * sub;
    let off_y = (y & mask) * sub;

    let cropped = image.crop_imm(off_x, off_y, sub, sub);
    let upscaled = cropped.resize_exact(TILE_SIZE, TILE_SIZE, FilterType::Nearest);

    let mut out = Vec::new();
    upscaled
        .to_rgb8()
        .write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Jpeg)?;
    Ok(out)
}

/// Summary returned after a batch finishes (spec §4.11).
#[derive(Debug, Clone, Copy)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub success: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_window_narrows_at_high_zoom() {
        assert_eq!(fallback_window(20), 3);
        assert_eq!(fallback_window(16), 6);
    }

    #[test]
    fn extracts_status_code_from_message() {
        assert_eq!(extract_status_code("packet fetch returned 429 Too Many Requests"), Some(429));
        assert_eq!(extract_status_code("no status here"), None);
    }

    #[test]
    fn cancellation_token_reflects_cancel() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
