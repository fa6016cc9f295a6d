pub mod pipe;

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::Result;

/// Objects are stored at maximum gzip compression; they are written once
/// and read many times.
pub const GZIP_LEVEL: u32 = 9;

const COMPARE_BUF_SIZE: usize = 64 * 1024;

/// Gzip-compress everything from `reader` into `writer`.
/// Returns the number of uncompressed bytes consumed.
pub fn compress<R: Read, W: Write>(reader: &mut R, writer: W) -> Result<u64> {
    let mut encoder = GzEncoder::new(writer, Compression::new(GZIP_LEVEL));
    let n = std::io::copy(reader, &mut encoder)?;
    encoder.finish()?;
    Ok(n)
}

/// Decompress a gzip stream from `reader` into `writer`.
/// Returns the number of decompressed bytes produced.
pub fn decompress<R: Read, W: Write>(reader: R, writer: &mut W) -> Result<u64> {
    let mut decoder = GzDecoder::new(reader);
    let n = std::io::copy(&mut decoder, writer)?;
    Ok(n)
}

/// Decompress `compressed` chunk by chunk and compare against `plain`.
///
/// Returns `false` on any length or content divergence, including trailing
/// data on the plain side after the compressed stream ends. Never loads
/// either stream fully into memory.
pub fn compare_compressed_with_plain<C: Read, P: Read>(
    compressed: C,
    mut plain: P,
) -> Result<bool> {
    let mut decoder = GzDecoder::new(compressed);
    let mut decoded = vec![0u8; COMPARE_BUF_SIZE];
    let mut expected = vec![0u8; COMPARE_BUF_SIZE];

    loop {
        let n = decoder.read(&mut decoded)?;
        if n == 0 {
            // Plain side must be exhausted too.
            return Ok(plain.read(&mut expected[..1])? == 0);
        }

        let mut filled = 0;
        while filled < n {
            let m = plain.read(&mut expected[filled..n])?;
            if m == 0 {
                return Ok(false); // plain ended early
            }
            filled += m;
        }

        if decoded[..n] != expected[..n] {
            return Ok(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        compress(&mut Cursor::new(data), &mut out).unwrap();
        out
    }

    #[test]
    fn compress_decompress_roundtrip() {
        let original = b"the quick brown fox jumps over the lazy dog\n".repeat(100);
        let packed = gzip(&original);
        assert!(packed.len() < original.len());

        let mut restored = Vec::new();
        let n = decompress(Cursor::new(&packed), &mut restored).unwrap();
        assert_eq!(n, original.len() as u64);
        assert_eq!(restored, original);
    }

    #[test]
    fn compress_reports_bytes_consumed() {
        let mut out = Vec::new();
        let n = compress(&mut Cursor::new(b"123456"), &mut out).unwrap();
        assert_eq!(n, 6);
    }

    #[test]
    fn compare_accepts_identical_content() {
        let data = b"matching payload".repeat(50);
        let packed = gzip(&data);
        assert!(compare_compressed_with_plain(Cursor::new(&packed), Cursor::new(&data)).unwrap());
    }

    #[test]
    fn compare_rejects_content_mismatch() {
        let packed = gzip(b"aaaa");
        assert!(!compare_compressed_with_plain(Cursor::new(&packed), Cursor::new(b"aaab")).unwrap());
    }

    #[test]
    fn compare_rejects_short_plain_side() {
        let packed = gzip(b"aaaa");
        assert!(!compare_compressed_with_plain(Cursor::new(&packed), Cursor::new(b"aa")).unwrap());
    }

    #[test]
    fn compare_rejects_trailing_plain_data() {
        let packed = gzip(b"aaaa");
        assert!(
            !compare_compressed_with_plain(Cursor::new(&packed), Cursor::new(b"aaaaX")).unwrap()
        );
    }

    #[test]
    fn compare_empty_streams_match() {
        let packed = gzip(b"");
        assert!(compare_compressed_with_plain(Cursor::new(&packed), Cursor::new(b"")).unwrap());
    }
}
