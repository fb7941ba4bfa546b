//! Plate-Carrée tile addressing, the space Google Earth's quadtree lives in.

use crate::error::{Error, Result};
use crate::quadtree::QuadtreePath;

/// A Plate-Carrée tile: (row, col, level), row increasing northward —
/// the opposite of Web Mercator XYZ's top-down y.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GeTile {
    pub row: u32,
    pub col: u32,
    pub level: u8,
}

impl GeTile {
    pub fn new(row: u32, col: u32, level: u8) -> Result<Self> {
        let span = 1u32 << level;
        if row >= span || col >= span {
            return Err(Error::validation(format!(
                "ge tile ({row},{col}) out of range at level={level}"
            )));
        }
        Ok(Self { row, col, level })
    }

    pub fn path(&self) -> Result<QuadtreePath> {
        QuadtreePath::from_row_col_level(self.row, self.col, self.level)
    }

    pub fn from_path(path: &QuadtreePath) -> Self {
        let (row, col, level) = path.to_row_col_level();
        GeTile { row, col, level }
    }

    /// Geographic bounds of this tile's south-west corner, in Plate-Carrée
    /// degrees. Both axes span -180..180 in GE's quadtree, so the real
    /// latitude occupies only the middle half of the row space.
    pub fn sw_corner_lonlat(&self) -> (f64, f64) {
        let span = (1u32 << self.level) as f64;
        let lon = (self.col as f64 / span) * 360.0 - 180.0;
        let lat = (self.row as f64 / span) * 360.0 - 180.0;
        (lon, lat)
    }
}

/// Convert a (lat, lon) pair to the GE tile that contains it, per §4.3:
/// `row = floor((lat + 180) / 360 * 2^level)`,
/// `col = floor((lon + 180) / 360 * 2^level)`, clamped to valid range.
pub fn lonlat_to_ge_tile(lat: f64, lon: f64, level: u8) -> (u32, u32) {
    let span = (1u32 << level) as f64;
    let max = (1u32 << level) - 1;

    let row = (((lat + 180.0) / 360.0) * span).floor();
    let col = (((lon + 180.0) / 360.0) * span).floor();

    (
        (row.max(0.0) as u32).min(max),
        (col.max(0.0) as u32).min(max),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sw_corner_of_root_is_origin() {
        let tile = GeTile::new(0, 0, 0).unwrap();
        assert_eq!(tile.sw_corner_lonlat(), (-180.0, -180.0));
    }

    #[test]
    fn lonlat_round_trips_through_path() {
        let tile = GeTile::new(5, 3, 3).unwrap();
        let path = tile.path().unwrap();
        let back = GeTile::from_path(&path);
        assert_eq!(tile, back);
    }

    #[test]
    fn clamps_to_valid_range() {
        let (row, col) = lonlat_to_ge_tile(180.0, 180.0, 4);
        assert_eq!(row, 15);
        assert_eq!(col, 15);
    }
}
