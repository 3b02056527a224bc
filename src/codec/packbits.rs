use crate::error::{FormatError, SciioResult};

use super::{Codec, CodecOptions};

// Minimum run worth breaking a literal block for
const MIN_REPT: usize = 3;
// Longest run or literal a single header byte can describe
const MAX_BYTES: usize = 128;

/// Apple's `PackBits` run-length scheme.
#[derive(Debug, Clone, Copy, Default)]
pub struct Packbits;

impl Codec for Packbits {
    fn name(&self) -> &'static str {
        "PackBits"
    }

    fn compress(&self, data: &[u8], _options: &CodecOptions) -> SciioResult<Vec<u8>> {
        let mut out = Vec::with_capacity(data.len() + data.len() / MAX_BYTES + 1);
        let mut index = 0;

        while index < data.len() {
            // measure the run starting here
            let byte = data[index];
            let mut run = 1;
            while index + run < data.len() && data[index + run] == byte && run < MAX_BYTES {
                run += 1;
            }

            if run >= MIN_REPT {
                out.push((257 - run) as u8);
                out.push(byte);
                index += run;
                continue;
            }

            // gather literals until a worthwhile run begins
            let start = index;
            index += run;
            while index < data.len() && index - start < MAX_BYTES {
                let byte = data[index];
                let mut next = 1;
                while index + next < data.len() && data[index + next] == byte && next < MIN_REPT {
                    next += 1;
                }
                if next >= MIN_REPT {
                    break;
                }
                index += next;
            }
            let literals = (index - start).min(MAX_BYTES);
            out.push((literals - 1) as u8);
            out.extend_from_slice(&data[start..start + literals]);
            index = start + literals;
        }

        Ok(out)
    }

    fn decompress(&self, data: &[u8], options: &CodecOptions) -> SciioResult<Vec<u8>> {
        let mut out = Vec::with_capacity(options.expected_len);
        let mut index = 0;

        while index < data.len() && out.len() < options.expected_len {
            let header = data[index] as i8;
            index += 1;
            if header >= 0 {
                let count = header as usize + 1;
                if index + count > data.len() {
                    return Err(FormatError::Format(String::from(
                        "PackBits literal block truncated",
                    ))
                    .into());
                }
                out.extend_from_slice(&data[index..index + count]);
                index += count;
            } else if header != -128 {
                let count = 1 - header as isize as usize;
                let Some(&value) = data.get(index) else {
                    return Err(FormatError::Format(String::from(
                        "PackBits repeat block truncated",
                    ))
                    .into());
                };
                index += 1;
                out.resize(out.len() + count, value);
            }
            // header == -128 is a no-op.
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::tests::{round_trip, TEST_DATA};

    #[test]
    fn decodes_reference_stream() {
        let encoded = [
            0xFEu8, 0xAA, 0x02, 0x80, 0x00, 0x2A, 0xFD, 0xAA, 0x03, 0x80, 0x00, 0x2A, 0x22, 0xF7,
            0xAA,
        ];
        let expected = [
            0xAAu8, 0xAA, 0xAA, 0x80, 0x00, 0x2A, 0xAA, 0xAA, 0xAA, 0xAA, 0x80, 0x00, 0x2A, 0x22,
            0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA,
        ];
        let decoded = Packbits
            .decompress(&encoded, &CodecOptions::with_expected_len(expected.len()))
            .unwrap();
        assert_eq!(decoded, expected);
    }

    #[test]
    fn round_trips() {
        round_trip(&Packbits, TEST_DATA);
        round_trip(&Packbits, &[0x3F]);
        round_trip(&Packbits, &[7u8; 1000]);

        let mut mixed = b"This st".to_vec();
        mixed.extend(std::iter::repeat(b'r').take(158));
        mixed.extend_from_slice(b"ing hangs.");
        mixed.extend(0..158u8);
        round_trip(&Packbits, &mixed);
    }
}
