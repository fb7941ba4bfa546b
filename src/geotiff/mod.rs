//! GeoTIFF export (C13, spec §4.13).
//!
//! Writes an in-memory RGBA mosaic canvas to an uncompressed GeoTIFF with
//! the three geo tags GDAL needs to place it in EPSG:3857, plus an
//! `.aux.xml` sidecar some GIS tools still prefer to read over the TIFF
//! tags directly. No example in this codebase writes GeoTIFF (the
//! teacher's own reader/writer pair only reads, and stubs the writer), so
//! this module goes straight to the `tiff` crate's encoder.

use std::io::Write;
use std::path::Path;

use tiff::encoder::{colortype, TiffEncoder};
use tiff::tags::Tag;

use crate::error::{Error, Result};
use crate::tile::ge_tile_corner_to_web_mercator;

/// GeoKeyDirectory contents for "projected CRS, pixel-is-area, EPSG:3857"
/// (spec §4.13, tag 34735).
const GEO_KEY_DIRECTORY: [u16; 16] = [1, 1, 0, 3, 1024, 0, 1, 1, 1025, 0, 1, 1, 3072, 0, 1, 3857];

const TAG_GEO_KEY_DIRECTORY: u16 = 34735;
const TAG_MODEL_PIXEL_SCALE: u16 = 33550;
const TAG_MODEL_TIEPOINT: u16 = 33922;

/// The bounding box of a stitched mosaic in GE tile space, used to compute
/// a GeoTIFF's origin and pixel scale (spec §4.13).
#[derive(Debug, Clone, Copy)]
pub struct GeTileExtent {
    pub min_row: u32,
    pub max_row: u32,
    pub min_col: u32,
    pub max_col: u32,
    pub level: u8,
}

/// Georeferencing parameters for one output raster.
#[derive(Debug, Clone, Copy)]
pub struct GeoTransform {
    pub origin_x: f64,
    pub origin_y: f64,
    pub pixel_width: f64,
    /// Signed; negative for a top-down raster (image y grows southward).
    pub pixel_height: f64,
}

impl GeoTransform {
    /// Derive the transform from a mosaic's GE tile extent and output
    /// raster size (spec §4.13): because Plate-Carrée row grows northward
    /// while image y grows southward, the top-left pixel corresponds to
    /// `(row = max_row + 1, col = min_col)` and the bottom-right to
    /// `(row = min_row, col = max_col + 1)`.
    pub fn from_ge_extent(extent: GeTileExtent, width: u32, height: u32) -> Self {
        let (origin_x, origin_y) =
            ge_tile_corner_to_web_mercator(extent.max_row + 1, extent.min_col, extent.level);
        let (end_x, end_y) =
            ge_tile_corner_to_web_mercator(extent.min_row, extent.max_col + 1, extent.level);

        Self {
            origin_x,
            origin_y,
            pixel_width: (end_x - origin_x) / width as f64,
            pixel_height: (end_y - origin_y) / height as f64,
        }
    }
}

/// Metadata embedded in the `.aux.xml` sidecar.
#[derive(Debug, Clone)]
pub struct GeoTiffMetadata {
    pub source: String,
    pub date: String,
}

/// Write an RGBA canvas as an uncompressed GeoTIFF plus `.aux.xml` sidecar
/// at `path` (spec §4.13). `rgba` must be exactly `width * height * 4`
/// bytes, row-major, top row first.
pub fn write_geotiff(
    path: &Path,
    rgba: &[u8],
    width: u32,
    height: u32,
    transform: GeoTransform,
    metadata: &GeoTiffMetadata,
) -> Result<()> {
    let expected_len = width as usize * height as usize * 4;
    if rgba.len() != expected_len {
        return Err(Error::tiff(format!(
            "rgba buffer is {} bytes, expected {expected_len} for {width}x{height}",
            rgba.len()
        )));
    }

    let file = std::fs::File::create(path)?;
    let mut encoder = TiffEncoder::new(file).map_err(|e| Error::tiff(e.to_string()))?;

    let mut image = encoder
        .new_image::<colortype::RGBA8>(width, height)
        .map_err(|e| Error::tiff(e.to_string()))?;

    image
        .encoder()
        .write_tag(Tag::Unknown(TAG_GEO_KEY_DIRECTORY), &GEO_KEY_DIRECTORY[..])
        .map_err(|e| Error::tiff(e.to_string()))?;
    image
        .encoder()
        .write_tag(
            Tag::Unknown(TAG_MODEL_PIXEL_SCALE),
            &[transform.pixel_width, transform.pixel_height.abs(), 0.0][..],
        )
        .map_err(|e| Error::tiff(e.to_string()))?;
    image
        .encoder()
        .write_tag(
            Tag::Unknown(TAG_MODEL_TIEPOINT),
            &[0.0, 0.0, 0.0, transform.origin_x, transform.origin_y, 0.0][..],
        )
        .map_err(|e| Error::tiff(e.to_string()))?;

    image.write_data(rgba).map_err(|e| Error::tiff(e.to_string()))?;

    write_aux_xml(path, transform, metadata)?;
    Ok(())
}

fn write_aux_xml(tiff_path: &Path, transform: GeoTransform, metadata: &GeoTiffMetadata) -> Result<()> {
    let aux_path = tiff_path.with_extension(
        tiff_path
            .extension()
            .map(|ext| format!("{}.aux.xml", ext.to_string_lossy()))
            .unwrap_or_else(|| "aux.xml".to_string()),
    );

    let xml = format!(
        "<PAMDataset>\n  <Source>{}</Source>\n  <Date>{}</Date>\n  <CRS>EPSG:3857</CRS>\n  <Generator>terratile-core {}</Generator>\n  <GeoTransform>{}, {}, 0.0, {}, 0.0, {}</GeoTransform>\n</PAMDataset>\n",
        xml_escape(&metadata.source),
        xml_escape(&metadata.date),
        crate::VERSION,
        transform.origin_x,
        transform.pixel_width,
        transform.origin_y,
        transform.pixel_height,
    );

    let mut file = std::fs::File::create(&aux_path)?;
    file.write_all(xml.as_bytes())?;
    Ok(())
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// Build the `{source}_{date}_{quadkey}_z{zoom}_{bboxStr}.tif` filename
/// (spec §6). `bbox` is `(south, north, west, east)` in degrees.
pub fn geotiff_filename(source: &str, date: &str, quadkey: &str, zoom: u8, bbox: (f64, f64, f64, f64)) -> String {
    format!(
        "{source}_{date}_{quadkey}_z{zoom}_{}.tif",
        bbox_string(bbox)
    )
}

/// Build the `{source}_{date}_z{zoom}_tiles` directory name for a raw tile
/// dump that hasn't been stitched into a GeoTIFF (spec §6).
pub fn tiles_dir_name(source: &str, date: &str, zoom: u8) -> String {
    format!("{source}_{date}_z{zoom}_tiles")
}

/// `{southLat}{N|S}-{northLat}{N|S}_{westLon}{E|W}-{eastLon}{E|W}` with the
/// decimal point replaced by `p` so the string is filesystem-safe
/// (spec §6).
fn bbox_string(bbox: (f64, f64, f64, f64)) -> String {
    let (south, north, west, east) = bbox;
    format!(
        "{}-{}_{}-{}",
        lat_component(south),
        lat_component(north),
        lon_component(west),
        lon_component(east),
    )
}

fn lat_component(lat: f64) -> String {
    let hemisphere = if lat < 0.0 { "S" } else { "N" };
    format!("{}{hemisphere}", decimal_safe(lat.abs()))
}

fn lon_component(lon: f64) -> String {
    let hemisphere = if lon < 0.0 { "W" } else { "E" };
    format!("{}{hemisphere}", decimal_safe(lon.abs()))
}

fn decimal_safe(value: f64) -> String {
    format!("{value:.4}").replace('.', "p")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transform_origin_uses_max_row_plus_one_for_top_left() {
        let extent = GeTileExtent {
            min_row: 10,
            max_row: 12,
            min_col: 5,
            max_col: 7,
            level: 6,
        };
        let transform = GeoTransform::from_ge_extent(extent, 256, 256);
        // Top-left y (origin_y) must come from row = max_row + 1 = 13,
        // which is further north (larger mercator y) than row = min_row.
        let (_, south_y) = ge_tile_corner_to_web_mercator(extent.min_row, extent.min_col, extent.level);
        assert!(transform.origin_y > south_y);
        assert!(transform.pixel_height < 0.0);
        assert!(transform.pixel_width > 0.0);
    }

    #[test]
    fn bbox_string_replaces_decimal_point() {
        let s = bbox_string((-12.5, 34.0, -100.25, 0.0));
        assert!(!s.contains('.'));
        assert!(s.contains("12p5000S"));
        assert!(s.contains("34p0000N"));
        assert!(s.contains("100p2500W"));
        assert!(s.contains("0p0000E"));
    }

    #[test]
    fn filename_matches_expected_shape() {
        let name = geotiff_filename("google-earth", "2024-05-01", "0231", 14, (10.0, 11.0, 20.0, 21.0));
        assert!(name.starts_with("google-earth_2024-05-01_0231_z14_"));
        assert!(name.ends_with(".tif"));
    }

    #[test]
    fn tiles_dir_name_matches_expected_shape() {
        assert_eq!(
            tiles_dir_name("esri-wayback", "2024-05-01", 16),
            "esri-wayback_2024-05-01_z16_tiles"
        );
    }
}
