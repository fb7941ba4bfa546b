//! Tile coordinate systems: Web Mercator XYZ at the service boundary,
//! Plate-Carrée inside the Google Earth quadtree, and the pure bridge
//! functions between them (spec §4.3).

pub mod bridge;
pub mod mercator;
pub mod platecarree;

pub use bridge::{
    ge_tile_corner_to_web_mercator, lonlat_to_ge_tile_pixel, pixel_to_lonlat,
    xyz_tile_center_to_lonlat, xyz_tile_to_ge_tile,
};
pub use mercator::{lat_to_mercator_y, lon_to_mercator_x, resolution_at_zoom, XyzTile};
pub use platecarree::{lonlat_to_ge_tile, GeTile};

/// Earth's equatorial circumference, meters.
pub const EARTH_CIRCUMFERENCE: f64 = 40_075_016.686;

/// Web Mercator's valid latitude range, degrees.
pub const MAX_LATITUDE: f64 = 85.051129;

/// Tile edge length in pixels, used throughout for both GE and XYZ tiles.
pub const TILE_SIZE: u32 = 256;
