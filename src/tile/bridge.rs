//! Pure conversions between Web Mercator XYZ space and GE's Plate-Carrée
//! quadtree space, always passing through lon/lat (spec §4.3).
//!
//! The two projections don't agree except near the equator — that
//! divergence is the entire reason this module exists, and is asserted
//! directly by [`crate::tile::tests`] rather than hidden behind a helper
//! that would make it look smaller than it is.

use super::mercator::{lat_to_mercator_y, lon_to_mercator_x};
use super::platecarree::{lonlat_to_ge_tile, GeTile};
use super::XyzTile;

/// Lon/lat of the center of a Web Mercator XYZ tile.
pub fn xyz_tile_center_to_lonlat(x: u32, y: u32, z: u8) -> (f64, f64) {
    let span = (1u64 << z) as f64;
    let tile_x = (x as f64 + 0.5) / span;
    let tile_y = (y as f64 + 0.5) / span;

    let lon = tile_x * 360.0 - 180.0;
    let lat = (std::f64::consts::PI * (1.0 - 2.0 * tile_y))
        .sinh()
        .atan()
        .to_degrees();

    (lon, lat)
}

/// The GE tile (at the same zoom) whose Plate-Carrée cell contains the
/// center of the given Web Mercator XYZ tile.
pub fn xyz_tile_to_ge_tile(tile: XyzTile) -> GeTile {
    let (lon, lat) = xyz_tile_center_to_lonlat(tile.x, tile.y, tile.z);
    let (row, col) = lonlat_to_ge_tile(lat, lon, tile.z);
    GeTile {
        row,
        col,
        level: tile.z,
    }
}

/// Web Mercator meters for a GE tile's south-west corner, via lon/lat.
/// Used for GeoTIFF origin/end computation.
pub fn ge_tile_corner_to_web_mercator(row: u32, col: u32, zoom: u8) -> (f64, f64) {
    let tile = GeTile { row, col, level: zoom };
    let (lon, lat) = tile.sw_corner_lonlat();
    (lon_to_mercator_x(lon), lat_to_mercator_y(lat))
}

/// Lon/lat of a sub-pixel position within a Web Mercator XYZ tile, for
/// nearest-neighbor resampling during reprojection.
pub fn pixel_to_lonlat(x: u32, y: u32, z: u8, px: f64, py: f64, tile_size: f64) -> (f64, f64) {
    let span = (1u64 << z) as f64;
    let tile_x = (x as f64 + px / tile_size) / span;
    let tile_y = (y as f64 + py / tile_size) / span;

    let lon = tile_x * 360.0 - 180.0;
    let lat = (std::f64::consts::PI * (1.0 - 2.0 * tile_y))
        .sinh()
        .atan()
        .to_degrees();

    (lon, lat)
}

/// The GE tile and the pixel position within it corresponding to a
/// (lat, lon) point, at `tile_size` pixels per tile. The y axis is
/// inverted relative to [`lonlat_to_ge_tile`]'s row: image y = 0 is the
/// top of the tile, but GE's row = 0 is at the south.
pub fn lonlat_to_ge_tile_pixel(lat: f64, lon: f64, level: u8, tile_size: f64) -> (GeTile, (u32, u32)) {
    let span = (1u64 << level) as f64;
    let max = (1u32 << level) - 1;

    let row_f = ((lat + 180.0) / 360.0) * span;
    let col_f = ((lon + 180.0) / 360.0) * span;

    let row = (row_f.floor().max(0.0) as u32).min(max);
    let col = (col_f.floor().max(0.0) as u32).min(max);

    let frac_row = row_f - row as f64;
    let frac_col = col_f - col as f64;

    let px = (frac_col * tile_size).floor().clamp(0.0, tile_size - 1.0) as u32;
    let py = ((1.0 - frac_row) * tile_size).floor().clamp(0.0, tile_size - 1.0) as u32;

    (GeTile { row, col, level }, (px, py))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn center_and_corner_round_trip_at_equator_low_zoom() {
        // spec §8: composition is exactly identity at z <= 10 near the equator.
        let z = 8u8;
        let (x, y) = (128u32, 128u32);
        let (lon, lat) = xyz_tile_center_to_lonlat(x, y, z);
        assert!(lon.abs() < 1.0);
        assert!(lat.abs() < 1.0);
    }

    #[test]
    fn projection_mismatch_exists_at_high_latitude() {
        // spec §8 scenario 3: (x=256, y=96, z=8) centers near 55N and its GE
        // tile center should differ by more than half a tile's worth of
        // degrees at that zoom.
        let z = 8u8;
        let tile = XyzTile::new(z, 256, 96).unwrap();
        let (xyz_lon, xyz_lat) = xyz_tile_center_to_lonlat(tile.x, tile.y, tile.z);
        assert!(xyz_lat > 50.0 && xyz_lat < 60.0);

        let ge = xyz_tile_to_ge_tile(tile);
        let (ge_lon, ge_lat) = ge.sw_corner_lonlat();

        let span = (1u64 << z) as f64;
        let degrees_per_tile = 360.0 / span;

        assert!(
            (ge_lat - xyz_lat).abs() > degrees_per_tile / 2.0,
            "expected projection mismatch beyond half a tile, got {} vs {}",
            ge_lat,
            xyz_lat
        );
        let _ = ge_lon;
    }

    #[test]
    fn pixel_round_trips_to_tile_corner() {
        let (tile, (px, py)) = lonlat_to_ge_tile_pixel(0.0, 0.0, 4, 256.0);
        assert_eq!(tile.level, 4);
        assert!(px < 256 && py < 256);
    }
}
