//! Web Mercator (EPSG:3857) XYZ tile addressing and forward/inverse projection.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

use super::{EARTH_CIRCUMFERENCE, MAX_LATITUDE};

/// A Web Mercator XYZ tile: (x, y, z) with y top-down, as served by every
/// standard slippy-map client. Used only at the service boundary — the core
/// converts to Plate-Carrée through WGS84 at the pixel level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct XyzTile {
    pub z: u8,
    pub x: u32,
    pub y: u32,
}

impl XyzTile {
    pub fn new(z: u8, x: u32, y: u32) -> Result<Self> {
        let span = 1u32 << z;
        if x >= span || y >= span {
            return Err(Error::validation(format!(
                "xyz tile ({x},{y}) out of range at z={z}"
            )));
        }
        Ok(Self { z, x, y })
    }

    /// The standard Bing-style base-4 quadkey for this tile, used for the
    /// GeoTIFF filename convention (spec §6).
    pub fn to_quadkey(&self) -> String {
        let mut quadkey = String::with_capacity(self.z as usize);
        for i in (0..self.z).rev() {
            let mut digit = 0u8;
            let mask = 1u32 << i;
            if (self.x & mask) != 0 {
                digit += 1;
            }
            if (self.y & mask) != 0 {
                digit += 2;
            }
            quadkey.push((b'0' + digit) as char);
        }
        quadkey
    }
}

/// Convert longitude to Web Mercator X, in meters.
pub fn lon_to_mercator_x(lon: f64) -> f64 {
    lon * EARTH_CIRCUMFERENCE / 360.0
}

/// Convert latitude to Web Mercator Y, in meters. Clamps to ±85.051129°
/// first since the projection is undefined beyond that.
pub fn lat_to_mercator_y(lat: f64) -> f64 {
    let lat = lat.clamp(-MAX_LATITUDE, MAX_LATITUDE);
    let lat_rad = lat.to_radians();
    EARTH_CIRCUMFERENCE * (std::f64::consts::FRAC_PI_4 + lat_rad / 2.0).tan().ln()
        / (2.0 * std::f64::consts::PI)
}

/// Resolution in meters-per-pixel at a given zoom, 256px tiles.
pub fn resolution_at_zoom(zoom: u8) -> f64 {
    EARTH_CIRCUMFERENCE / (256.0 * (1u64 << zoom) as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equator_origin_is_zero() {
        assert!((lon_to_mercator_x(0.0)).abs() < 1e-6);
        assert!((lat_to_mercator_y(0.0)).abs() < 1e-6);
    }

    #[test]
    fn latitude_clamp_applied() {
        let clamped = lat_to_mercator_y(MAX_LATITUDE);
        let over = lat_to_mercator_y(89.9);
        assert!((clamped - over).abs() < 1e-6);
    }

    #[test]
    fn resolution_halves_per_zoom() {
        let r0 = resolution_at_zoom(0);
        let r1 = resolution_at_zoom(1);
        assert!((r0 / r1 - 2.0).abs() < 1e-9);
    }

    #[test]
    fn rejects_out_of_range_tile() {
        assert!(XyzTile::new(2, 4, 0).is_err());
        assert!(XyzTile::new(2, 3, 3).is_ok());
    }

    #[test]
    fn quadkey_matches_known_value() {
        let tile = XyzTile::new(3, 3, 5).unwrap();
        let quadkey = tile.to_quadkey();
        assert_eq!(quadkey.len(), 3);
        assert!(quadkey.chars().all(|c| ('0'..='3').contains(&c)));
    }

    #[test]
    fn quadkey_root_is_empty() {
        let tile = XyzTile::new(0, 0, 0).unwrap();
        assert_eq!(tile.to_quadkey(), "");
    }
}
