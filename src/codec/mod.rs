//! XOR stream cipher and zlib-with-header framing used by the Google Earth
//! packet transport (spec §4.1).
//!
//! Decryption and decompression are always applied in that order: a fetched
//! packet is first XOR-decrypted in place with the database's key, then the
//! result is unframed and, if it carries the compression sentinel, inflated.

use crate::error::CodecError;
use flate2::read::ZlibDecoder;
use std::io::Read;

const MAGIC: u32 = 0x7468_dead;
const MAGIC_SWAPPED: u32 = 0xadde_6874;

/// XOR-decrypt `payload` in place using `key`.
///
/// The offset into `key` starts at 16 and advances by one per byte, with two
/// perturbations matching the reference client: every 8 bytes consumed the
/// offset jumps forward by 16, and whenever it would run past the end of the
/// key it wraps to `(offset + 8) % 24`. The key length used is always the
/// length of the key actually passed in — never a length cached elsewhere —
/// which is what makes mixing the current-imagery and TimeMachine keys a
/// compile-time impossible state rather than a runtime bug.
pub fn xor_decrypt(key: &[u8], payload: &mut [u8]) {
    if key.is_empty() {
        return;
    }

    let mut offset: usize = 16;
    for byte in payload.iter_mut() {
        *byte ^= key[offset % key.len()];
        offset += 1;

        if offset & 7 == 0 {
            offset += 16;
        }
        if offset >= key.len() {
            offset = (offset + 8) % 24;
        }
    }
}

/// Undo the little-endian `{magic, size, zlib stream}` framing.
///
/// If the payload is shorter than the 8 byte header this fails with
/// [`CodecError::Short`]. If the leading 4 bytes are neither sentinel the
/// payload is assumed to already be uncompressed and is returned unchanged.
pub fn decompress(payload: &[u8]) -> Result<Vec<u8>, CodecError> {
    if payload.len() < 8 {
        return Err(CodecError::Short);
    }

    let magic = u32::from_le_bytes(payload[0..4].try_into().unwrap());
    if magic != MAGIC && magic != MAGIC_SWAPPED {
        return Ok(payload.to_vec());
    }

    let expected_size = u32::from_le_bytes(payload[4..8].try_into().unwrap());
    let mut decoder = ZlibDecoder::new(&payload[8..]);
    let mut out = Vec::with_capacity(expected_size as usize);
    decoder
        .read_to_end(&mut out)
        .map_err(|e| CodecError::BadZlib(e.to_string()))?;

    if out.len() as u32 != expected_size {
        return Err(CodecError::SizeMismatch {
            expected: expected_size,
            actual: out.len(),
        });
    }

    Ok(out)
}

/// Decrypt then decompress a fetched packet, in the order the protocol requires.
pub fn decrypt_and_decompress(key: &[u8], payload: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut buf = payload.to_vec();
    xor_decrypt(key, &mut buf);
    decompress(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_key() -> Vec<u8> {
        (0u8..48).collect()
    }

    #[test]
    fn xor_roundtrip() {
        let key = sample_key();
        let original = b"the quick brown fox jumps over the lazy dog, many times over".to_vec();
        let mut buf = original.clone();

        xor_decrypt(&key, &mut buf);
        assert_ne!(buf, original);

        xor_decrypt(&key, &mut buf);
        assert_eq!(buf, original);
    }

    #[test]
    fn xor_uses_passed_in_key_length_not_some_shared_one() {
        // A short key and a long key must both be usable without panicking
        // and must produce different ciphertexts for the same input.
        let short = vec![1u8, 2, 3, 4];
        let long = sample_key();
        let mut a = b"payload payload payload".to_vec();
        let mut b = a.clone();

        xor_decrypt(&short, &mut a);
        xor_decrypt(&long, &mut b);

        assert_ne!(a, b);
    }

    fn zlib_frame(data: &[u8]) -> Vec<u8> {
        let mut encoder =
            flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(data).unwrap();
        let compressed = encoder.finish().unwrap();

        let mut framed = Vec::new();
        framed.extend_from_slice(&MAGIC.to_le_bytes());
        framed.extend_from_slice(&(data.len() as u32).to_le_bytes());
        framed.extend_from_slice(&compressed);
        framed
    }

    #[test]
    fn decompress_framed_zlib() {
        let data = b"hello quadtree packet".to_vec();
        let framed = zlib_frame(&data);
        let out = decompress(&framed).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn decompress_passes_through_unframed_payload() {
        let data = b"already plain bytes, no magic here!!".to_vec();
        let out = decompress(&data).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn decompress_rejects_short_payload() {
        let err = decompress(&[1, 2, 3]).unwrap_err();
        assert_eq!(err, CodecError::Short);
    }

    #[test]
    fn decompress_detects_size_mismatch() {
        let data = b"some data of a certain length".to_vec();
        let mut framed = zlib_frame(&data);
        // corrupt the declared size
        let bad_size = (data.len() as u32 + 10).to_le_bytes();
        framed[4..8].copy_from_slice(&bad_size);

        let err = decompress(&framed).unwrap_err();
        assert!(matches!(err, CodecError::SizeMismatch { .. }));
    }

    #[test]
    fn decrypt_then_decompress_order() {
        let key = sample_key();
        let data = b"order matters: decrypt first, then decompress".to_vec();
        let mut framed = zlib_frame(&data);
        xor_decrypt(&key, &mut framed);

        let out = decrypt_and_decompress(&key, &framed).unwrap();
        assert_eq!(out, data);
    }
}
