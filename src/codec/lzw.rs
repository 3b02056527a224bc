use weezl::{decode, encode, BitOrder};

use crate::error::SciioResult;

use super::{Codec, CodecOptions};

/// LZW with the TIFF early-change code-size switch.
#[derive(Debug, Clone, Copy, Default)]
pub struct Lzw;

impl Codec for Lzw {
    fn name(&self) -> &'static str {
        "LZW"
    }

    fn compress(&self, data: &[u8], _options: &CodecOptions) -> SciioResult<Vec<u8>> {
        let mut out = Vec::with_capacity(data.len() / 2 + 16);
        let mut encoder = encode::Encoder::with_tiff_size_switch(BitOrder::Msb, 8);
        let result = encoder.into_vec(&mut out).encode_all(data);
        result.status?;
        Ok(out)
    }

    fn decompress(&self, data: &[u8], options: &CodecOptions) -> SciioResult<Vec<u8>> {
        let mut out = Vec::with_capacity(options.expected_len);
        let mut decoder = decode::Decoder::with_tiff_size_switch(BitOrder::Msb, 8);
        let result = decoder.into_vec(&mut out).decode_all(data);
        result.status?;
        Ok(out)
    }
}
