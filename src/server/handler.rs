//! HTTP handlers for the reprojecting tile server (spec §4.12).

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use chrono::NaiveDate;
use image::{imageops::FilterType, ImageBuffer, Rgba, RgbaImage};

use crate::cache::{CacheKey, Provider};
use crate::error::{Error, Result};
use crate::fetcher::Fetcher;
use crate::quadtree::QuadtreePath;
use crate::tile::{lonlat_to_ge_tile_pixel, pixel_to_lonlat, GeTile, XyzTile, TILE_SIZE};

use super::transparent::TRANSPARENT_PNG;

const FALLBACK_FLOOR: u8 = 10;

#[derive(Clone)]
pub struct ServerState {
    pub fetcher: Arc<Fetcher>,
}

pub async fn handle_google_earth(
    State(state): State<ServerState>,
    Path((date, z, x, y)): Path<(String, u8, u32, u32)>,
) -> Response {
    handle_ge(state, date, z, x, y, None).await
}

pub async fn handle_google_earth_historical(
    State(state): State<ServerState>,
    Path((date_hex, z, x, y)): Path<(String, u8, u32, u32)>,
) -> Response {
    let Some((date, hex_date)) = date_hex.split_once('_') else {
        return (StatusCode::BAD_REQUEST, "expected {date}_{hexDate}").into_response();
    };
    handle_ge(state, date.to_string(), z, x, y, Some(hex_date.to_string())).await
}

async fn handle_ge(
    state: ServerState,
    date: String,
    z: u8,
    x: u32,
    y: u32,
    hex_date: Option<String>,
) -> Response {
    let tile = match XyzTile::new(z, x, y) {
        Ok(t) => t,
        Err(e) => return error_response(e),
    };

    let key = CacheKey::new(Provider::GoogleEarth, z, x, y, Some(date));

    match state.fetcher.cache.get(&key).await {
        Ok(Some(bytes)) => return jpeg_response(bytes),
        Ok(None) => {}
        Err(e) => return error_response(e),
    }

    match reproject_ge_tile(&state.fetcher, tile, hex_date.as_deref()).await {
        Ok(bytes) => {
            let bytes = Bytes::from(bytes);
            let _ = state.fetcher.cache.set(&key, bytes.clone()).await;
            jpeg_response(bytes)
        }
        Err(Error::TileUnavailable { .. }) => transparent_response(),
        Err(e) => error_response(e),
    }
}

pub async fn handle_esri_wayback(
    State(state): State<ServerState>,
    Path((date, z, x, y)): Path<(String, u8, u32, u32)>,
) -> Response {
    let tile = match XyzTile::new(z, x, y) {
        Ok(t) => t,
        Err(e) => return error_response(e),
    };
    let Ok(parsed_date) = NaiveDate::parse_from_str(&date, "%Y-%m-%d") else {
        return (StatusCode::BAD_REQUEST, "date must be YYYY-MM-DD").into_response();
    };

    let key = CacheKey::new(Provider::EsriWayback, z, x, y, Some(date));

    match state.fetcher.cache.get(&key).await {
        Ok(Some(bytes)) => return jpeg_response(bytes),
        Ok(None) => {}
        Err(e) => return error_response(e),
    }

    let layer = match state.fetcher.esri.layer_for_date(parsed_date).await {
        Some(layer) => layer,
        None => return transparent_response(),
    };

    match state.fetcher.esri.fetch_tile(&layer, tile).await {
        Ok(bytes) => {
            let bytes = Bytes::from(bytes);
            let _ = state.fetcher.cache.set(&key, bytes.clone()).await;
            jpeg_response(bytes)
        }
        Err(Error::TileUnavailable { .. }) => transparent_response(),
        Err(e) => error_response(e),
    }
}

/// Reproject a Web Mercator XYZ tile from GE's Plate-Carrée quadtree,
/// pixel by pixel (spec §4.12): each output pixel's lat/lon maps to a
/// source GE tile and pixel, sampled nearest-neighbor. Source tiles are
/// memoized per request since many output pixels land in the same one.
async fn reproject_ge_tile(
    fetcher: &Fetcher,
    tile: XyzTile,
    hex_date: Option<&str>,
) -> Result<Vec<u8>> {
    let mut source_cache: HashMap<(u32, u32, u8), RgbaImage> = HashMap::new();
    let mut canvas: RgbaImage = ImageBuffer::new(TILE_SIZE, TILE_SIZE);
    let mut any_sample = false;

    for py in 0..TILE_SIZE {
        for px in 0..TILE_SIZE {
            let (lon, lat) = pixel_to_lonlat(tile.x, tile.y, tile.z, px as f64, py as f64, TILE_SIZE as f64);
            let (ge_tile, (spx, spy)) = lonlat_to_ge_tile_pixel(lat, lon, tile.z, TILE_SIZE as f64);
            let source_key = (ge_tile.row, ge_tile.col, ge_tile.level);

            if !source_cache.contains_key(&source_key) {
                if let Ok(image) = fetch_ge_tile_image(fetcher, ge_tile, hex_date).await {
                    source_cache.insert(source_key, image);
                }
            }

            if let Some(image) = source_cache.get(&source_key) {
                if spx < image.width() && spy < image.height() {
                    canvas.put_pixel(px, py, *image.get_pixel(spx, spy));
                    any_sample = true;
                }
            }
        }
    }

    if !any_sample {
        return Err(Error::TileUnavailable {
            tile: format!("{}/{}/{}", tile.z, tile.x, tile.y),
            date: hex_date.map(str::to_string),
        });
    }

    let mut out = Vec::new();
    image::DynamicImage::ImageRgba8(canvas)
        .to_rgb8()
        .write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Jpeg)?;
    Ok(out)
}

/// Fetch one GE source tile, with the same zoom-fallback-and-upscale
/// strategy as the batch fetcher (spec §4.7), but addressed directly in
/// GE row/col/level space since a single output pixel always names one
/// exact source tile.
async fn fetch_ge_tile_image(
    fetcher: &Fetcher,
    tile: GeTile,
    hex_date: Option<&str>,
) -> Result<RgbaImage> {
    let window: u8 = if tile.level >= 17 { 3 } else { 6 };
    let mut last_err = None;

    for dz in 0..=window {
        let level = match tile.level.checked_sub(dz) {
            Some(l) if l >= FALLBACK_FLOOR => l,
            _ => break,
        };
        let row = tile.row >> dz;
        let col = tile.col >> dz;
        let path = match QuadtreePath::from_row_col_level(row, col, level) {
            Ok(p) => p,
            Err(e) => {
                last_err = Some(e);
                continue;
            }
        };

        let result = match hex_date {
            Some(hex) => fetcher.ge.fetch_historical_tile(&path, hex).await,
            None => fetcher.ge.fetch_current_tile(&path).await,
        };

        match result {
            Ok(bytes) => {
                let decoded = image::load_from_memory(&bytes)?.to_rgba8();
                if dz == 0 {
                    return Ok(decoded);
                }
                let mask = (1u32 << dz) - 1;
                let sub = (TILE_SIZE >> dz).max(1);
                let off_x = (tile.col & mask) * sub;
                let off_y = (tile.row & mask) * sub;
                let cropped = image::imageops::crop_imm(&decoded, off_x, off_y, sub, sub).to_image();
                let upscaled = image::imageops::resize(&cropped, TILE_SIZE, TILE_SIZE, FilterType::Nearest);
                return Ok(upscaled);
            }
            Err(e) => last_err = Some(e),
        }
    }

    Err(last_err.unwrap_or_else(|| Error::TileUnavailable {
        tile: format!("{}/{}/{}", tile.level, tile.row, tile.col),
        date: None,
    }))
}

fn jpeg_response(bytes: Bytes) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, "image/jpeg".parse().unwrap());
    headers.insert(header::CACHE_CONTROL, "max-age=86400".parse().unwrap());
    (StatusCode::OK, headers, bytes).into_response()
}

fn transparent_response() -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, "image/png".parse().unwrap());
    headers.insert(header::CACHE_CONTROL, "max-age=60".parse().unwrap());
    (StatusCode::NOT_FOUND, headers, Vec::from(TRANSPARENT_PNG)).into_response()
}

fn error_response(error: Error) -> Response {
    match error {
        Error::Validation(_) => (StatusCode::BAD_REQUEST, error.to_string()).into_response(),
        Error::TileUnavailable { .. } => transparent_response(),
        other => (StatusCode::INTERNAL_SERVER_ERROR, other.to_string()).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn historical_path_splits_on_underscore() {
        let combined = "2024-05-01_fd2be";
        let (date, hex) = combined.split_once('_').unwrap();
        assert_eq!(date, "2024-05-01");
        assert_eq!(hex, "fd2be");
    }
}
