//! Compression codecs consumed by the TIFF parser and writer.
//!
//! Codecs operate on whole byte buffers: one compressed fragment (a strip or
//! tile) in, the decoded bytes out. The registry dispatches on the TIFF
//! compression code; schemes without a registered codec surface as
//! `UnsupportedCompression`.

use crate::error::{FormatError, SciioResult};
use crate::tags::CompressionMethod;

mod deflate;
mod lzw;
mod packbits;

pub use self::deflate::Deflate;
pub use self::lzw::Lzw;
pub use self::packbits::Packbits;

/// Per-fragment context handed to a codec.
#[derive(Clone, Copy, Debug)]
pub struct CodecOptions {
    /// Decoded byte count the caller expects from this fragment.
    pub expected_len: usize,
}

impl CodecOptions {
    pub fn with_expected_len(expected_len: usize) -> Self {
        CodecOptions { expected_len }
    }
}

/// A whole-buffer compression scheme.
pub trait Codec: std::fmt::Debug {
    fn name(&self) -> &'static str;

    fn compress(&self, data: &[u8], options: &CodecOptions) -> SciioResult<Vec<u8>>;

    fn decompress(&self, data: &[u8], options: &CodecOptions) -> SciioResult<Vec<u8>>;
}

/// The identity codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct Uncompressed;

impl Codec for Uncompressed {
    fn name(&self) -> &'static str {
        "Uncompressed"
    }

    fn compress(&self, data: &[u8], _options: &CodecOptions) -> SciioResult<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8], _options: &CodecOptions) -> SciioResult<Vec<u8>> {
        Ok(data.to_vec())
    }
}

/// Resolves the codec registered for a TIFF compression code.
pub fn for_method(method: CompressionMethod) -> SciioResult<Box<dyn Codec>> {
    match method {
        CompressionMethod::None => Ok(Box::new(Uncompressed)),
        CompressionMethod::LZW => Ok(Box::new(Lzw)),
        CompressionMethod::Deflate | CompressionMethod::OldDeflate => Ok(Box::new(Deflate)),
        CompressionMethod::PackBits => Ok(Box::new(Packbits)),
        other => Err(FormatError::UnsupportedCompression(other.to_u16()).into()),
    }
}

/// Resolves a codec by the name used in writer configuration.
pub fn for_name(name: &str) -> Option<(CompressionMethod, Box<dyn Codec>)> {
    match name {
        "Uncompressed" => Some((CompressionMethod::None, Box::new(Uncompressed))),
        "LZW" => Some((CompressionMethod::LZW, Box::new(Lzw))),
        "Deflate" => Some((CompressionMethod::Deflate, Box::new(Deflate))),
        "PackBits" => Some((CompressionMethod::PackBits, Box::new(Packbits))),
        _ => None,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub const TEST_DATA: &[u8] = b"This is a string for checking various compression algorithms.";

    pub fn round_trip(codec: &dyn Codec, data: &[u8]) {
        let options = CodecOptions::with_expected_len(data.len());
        let compressed = codec.compress(data, &options).unwrap();
        let decoded = codec.decompress(&compressed, &options).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn unsupported_compression_surfaces_code() {
        let err = for_method(CompressionMethod::JPEG).unwrap_err();
        assert!(matches!(
            err,
            crate::SciioError::Format(FormatError::UnsupportedCompression(6))
        ));
    }

    #[test]
    fn uncompressed_is_identity() {
        round_trip(&Uncompressed, TEST_DATA);
    }
}
