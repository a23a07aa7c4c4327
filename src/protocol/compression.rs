//! Payload compression for the wire codec (§4.1).
//!
//! The wire format uses raw (headerless) deflate as its primary scheme, with
//! a zlib-wrapped fallback on decode for interop with peers that produced a
//! zlib stream. Compression is only attempted when it helps: the encoder
//! only commits to the compressed form if it's strictly smaller than the raw
//! payload.

use flate2::read::{DeflateDecoder, ZlibDecoder};
use flate2::write::DeflateEncoder;
use flate2::Compression;
use std::io::{Read, Write};

use crate::error::{Error, Result};

/// Compress `data` with raw deflate. Returns `None` if compression did not
/// shrink the payload (caller should keep the raw bytes and clear the
/// `is_compressed` flag).
pub fn compress_if_smaller(data: &[u8]) -> Result<Option<Vec<u8>>> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| Error::WireCompressionFailed(e.to_string()))?;
    let compressed = encoder
        .finish()
        .map_err(|e| Error::WireCompressionFailed(e.to_string()))?;

    if compressed.len() < data.len() {
        Ok(Some(compressed))
    } else {
        Ok(None)
    }
}

/// Decompress a payload produced by `compress_if_smaller`, or (as a fallback
/// for cross-platform interop) a zlib-wrapped deflate stream.
pub fn decompress(data: &[u8], original_size: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(original_size);
    let mut decoder = DeflateDecoder::new(data);
    if decoder.read_to_end(&mut out).is_ok() && out.len() == original_size {
        return Ok(out);
    }

    out.clear();
    let mut zlib_decoder = ZlibDecoder::new(data);
    zlib_decoder
        .read_to_end(&mut out)
        .map_err(|e| Error::WireCompressionFailed(e.to_string()))?;

    if out.len() != original_size {
        return Err(Error::WireCompressionFailed(format!(
            "decompressed size {} does not match expected {}",
            out.len(),
            original_size
        )));
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_incompressible_payload_is_left_raw() {
        let data = vec![1u8, 2, 3];
        assert!(compress_if_smaller(&data).unwrap().is_none());
    }

    #[test]
    fn repetitive_payload_round_trips() {
        let data = vec![0x41u8; 500];
        let compressed = compress_if_smaller(&data).unwrap().expect("should compress");
        assert!(compressed.len() < data.len());
        let restored = decompress(&compressed, data.len()).unwrap();
        assert_eq!(restored, data);
    }

    #[test]
    fn zlib_wrapped_stream_is_accepted_as_fallback() {
        use flate2::write::ZlibEncoder;
        let data = vec![0x42u8; 300];
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&data).unwrap();
        let zlib_bytes = encoder.finish().unwrap();

        let restored = decompress(&zlib_bytes, data.len()).unwrap();
        assert_eq!(restored, data);
    }
}
