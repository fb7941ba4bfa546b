//! A precomputed transparent tile, served whenever no imagery is
//! available for a request (spec §4.12). Kept as static bytes rather than
//! encoded at runtime — there is nothing to encode, the pixels never
//! change.

/// The smallest valid RGBA PNG: a single fully-transparent pixel. Clients
/// only care that the response decodes as a transparent image, not its
/// exact dimensions, so this is served for every "no tile" response
/// regardless of the requested tile size.
pub const TRANSPARENT_PNG: &[u8] = &[
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44, 0x52,
    0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1F, 0x15, 0xC4,
    0x89, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9C, 0x62, 0x00, 0x01, 0x00, 0x00,
    0x05, 0x00, 0x01, 0x0D, 0x0A, 0x2D, 0xB4, 0x00, 0x00, 0x00, 0x00, 0x49, 0x45, 0x4E, 0x44, 0xAE,
    0x42, 0x60, 0x82,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transparent_png_decodes() {
        let decoded = image::load_from_memory(TRANSPARENT_PNG).unwrap();
        assert_eq!(decoded.to_rgba8().get_pixel(0, 0)[3], 0);
    }
}
