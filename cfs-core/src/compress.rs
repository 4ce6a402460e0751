//! LZ4 (de)compression helper used by the directory-entry payload and by
//! the root-CoW bitmap/inode-metadata tail.
//!
//! `lz4_flex`'s size-prepended block API stands in for the "LZ4-frame-
//! compatible compressor...assumed available" note in the format: the
//! decompressor needs to know the output size up front, which is exactly
//! what `compress_prepend_size`/`decompress_size_prepended` provide. See
//! `DESIGN.md` for why this crate was picked over a frame-format one.

use crate::error::{CfsError, EResult};

pub fn compress(data: &[u8]) -> Vec<u8> {
    lz4_flex::block::compress_prepend_size(data)
}

pub fn decompress(data: &[u8]) -> EResult<Vec<u8>> {
    lz4_flex::block::decompress_size_prepended(data)
        .map_err(|e| CfsError::Compression(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_arbitrary_bytes() {
        let data = b"the quick brown fox jumps over the lazy dog".repeat(16);
        let compressed = compress(&data);
        let decompressed = decompress(&compressed).unwrap();
        assert_eq!(decompressed, data);
    }

    #[test]
    fn roundtrips_empty_input() {
        let compressed = compress(&[]);
        assert_eq!(decompress(&compressed).unwrap(), Vec::<u8>::new());
    }
}
