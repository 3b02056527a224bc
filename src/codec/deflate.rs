use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::error::SciioResult;

use super::{Codec, CodecOptions};

/// Zlib-wrapped Deflate, covering both the 8 and 0x80B2 compression codes.
#[derive(Debug, Clone, Copy, Default)]
pub struct Deflate;

impl Codec for Deflate {
    fn name(&self) -> &'static str {
        "Deflate"
    }

    fn compress(&self, data: &[u8], _options: &CodecOptions) -> SciioResult<Vec<u8>> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data)?;
        Ok(encoder.finish()?)
    }

    fn decompress(&self, data: &[u8], options: &CodecOptions) -> SciioResult<Vec<u8>> {
        let mut out = Vec::with_capacity(options.expected_len);
        ZlibDecoder::new(data).read_to_end(&mut out)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use crate::codec::tests::{round_trip, TEST_DATA};

    #[test]
    fn round_trips() {
        round_trip(&super::Deflate, TEST_DATA);
        round_trip(&super::Deflate, &[0u8; 10_000]);
    }
}
