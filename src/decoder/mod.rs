//! TIFF parsing: header validation, IFD chain walking and tag decoding.

use std::collections::HashSet;

use crate::error::{FormatError, SciioResult};
use crate::ifd::{Ifd, IfdChain, TagValue};
use crate::io::{BufferedStream, ByteOrder};
use crate::tags::Type;
use crate::util;

pub mod comment;
pub mod image;
mod predictor;

pub use self::predictor::rev_hpredict;

/// Upper bound on directories in one chain, against malicious inputs.
const MAX_IFD_COUNT: usize = 100_000;

/// Parsing limits.
#[derive(Clone, Debug)]
pub struct Limits {
    /// The maximum size of any single decoded tag value in bytes.
    pub ifd_value_size: usize,
    /// The maximum size of any decoded plane buffer in bytes.
    pub plane_size: usize,
}

impl Default for Limits {
    fn default() -> Limits {
        Limits {
            ifd_value_size: 1024 * 1024,
            plane_size: 1024 * 1024 * 1024,
        }
    }
}

/// One directory entry as stored on disk, before value resolution.
struct RawEntry {
    tag: u16,
    type_: u16,
    count: u64,
    value_or_offset: [u8; 8],
}

/// Walks a TIFF stream: header, directory chain, tag values.
pub struct TiffParser {
    stream: BufferedStream,
    bigtiff: bool,
    first_ifd_offset: u64,
    limits: Limits,
}

impl TiffParser {
    /// Validates the header and positions the parser at the first IFD.
    ///
    /// `"II"`/`"MM"` select the byte order; magic 42 is classic TIFF and 43
    /// is BigTIFF (with its fixed offset-size field). Anything else fails
    /// with `NotATiff`.
    pub fn new(mut stream: BufferedStream) -> SciioResult<Self> {
        stream.seek(0)?;
        let mut endian = [0u8; 2];
        stream.read_exact(&mut endian).map_err(|_| FormatError::NotATiff)?;
        match &endian {
            b"II" => stream.set_order(ByteOrder::LittleEndian),
            b"MM" => stream.set_order(ByteOrder::BigEndian),
            _ => return Err(FormatError::NotATiff.into()),
        }

        let magic = stream.read_u16().map_err(|_| FormatError::NotATiff)?;
        let bigtiff = match magic {
            42 => false,
            43 => true,
            _ => return Err(FormatError::NotATiff.into()),
        };

        let first_ifd_offset = if bigtiff {
            let offset_size = stream.read_u16().map_err(|_| FormatError::NotATiff)?;
            let reserved = stream.read_u16().map_err(|_| FormatError::NotATiff)?;
            if offset_size != 8 || reserved != 0 {
                return Err(FormatError::NotATiff.into());
            }
            stream.read_u64().map_err(|_| FormatError::NotATiff)?
        } else {
            u64::from(stream.read_u32().map_err(|_| FormatError::NotATiff)?)
        };

        Ok(TiffParser {
            stream,
            bigtiff,
            first_ifd_offset,
            limits: Limits::default(),
        })
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn is_big_tiff(&self) -> bool {
        self.bigtiff
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.stream.order()
    }

    pub fn first_ifd_offset(&self) -> u64 {
        self.first_ifd_offset
    }

    pub fn stream(&mut self) -> &mut BufferedStream {
        &mut self.stream
    }

    pub fn into_stream(self) -> BufferedStream {
        self.stream
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Offsets of every directory in the chain, in order.
    ///
    /// A revisited offset aborts with `CyclicIfd`; a chain longer than the
    /// directory cap aborts with `IfdCountExceeded`.
    pub fn ifd_offsets(&mut self) -> SciioResult<Vec<u64>> {
        let mut offsets = Vec::new();
        let mut seen = HashSet::new();
        let mut offset = self.first_ifd_offset;
        while offset != 0 {
            if !seen.insert(offset) {
                return Err(FormatError::CyclicIfd.into());
            }
            if offsets.len() >= MAX_IFD_COUNT {
                return Err(FormatError::IfdCountExceeded.into());
            }
            offsets.push(offset);
            offset = self.peek_next_offset(offset)?;
        }
        Ok(offsets)
    }

    /// Reads every directory in the chain.
    pub fn read_ifds(&mut self) -> SciioResult<IfdChain> {
        let offsets = self.ifd_offsets()?;
        let mut chain = Vec::with_capacity(offsets.len());
        for offset in offsets {
            let (ifd, _next) = self.read_ifd(offset)?;
            chain.push(ifd);
        }
        Ok(chain)
    }

    /// Skips over the directory at `offset` and returns the next-IFD field.
    fn peek_next_offset(&mut self, offset: u64) -> SciioResult<u64> {
        self.stream.seek(offset)?;
        let entry_count = if self.bigtiff {
            self.stream.read_u64()?
        } else {
            u64::from(self.stream.read_u16()?)
        };
        let entry_size = if self.bigtiff { 20 } else { 12 };
        self.stream.skip_bytes(entry_count * entry_size)?;
        self.read_offset_field()
    }

    fn read_offset_field(&mut self) -> SciioResult<u64> {
        if self.bigtiff {
            self.stream.read_u64()
        } else {
            Ok(u64::from(self.stream.read_u32()?))
        }
    }

    /// Reads the directory at `offset`, returning it with its next-IFD
    /// offset. Entries with unrecognized field types are skipped.
    pub fn read_ifd(&mut self, offset: u64) -> SciioResult<(Ifd, u64)> {
        self.stream.seek(offset)?;
        let entry_count = if self.bigtiff {
            self.stream.read_u64()?
        } else {
            u64::from(self.stream.read_u16()?)
        };
        if entry_count as usize > MAX_IFD_COUNT {
            return Err(FormatError::IfdCountExceeded.into());
        }

        let mut raw = Vec::with_capacity(entry_count as usize);
        for _ in 0..entry_count {
            raw.push(self.read_raw_entry()?);
        }
        let next = self.read_offset_field()?;

        let mut ifd = Ifd::new();
        for entry in raw {
            let Some(ty) = Type::from_u16(entry.type_) else {
                log::debug!(
                    "skipping tag {} with unrecognized type {}",
                    entry.tag,
                    entry.type_
                );
                continue;
            };
            let value = self.resolve_entry(&entry, ty)?;
            ifd.put_id(entry.tag, value);
        }
        Ok((ifd, next))
    }

    fn read_raw_entry(&mut self) -> SciioResult<RawEntry> {
        let tag = self.stream.read_u16()?;
        let type_ = self.stream.read_u16()?;
        let count = if self.bigtiff {
            self.stream.read_u64()?
        } else {
            u64::from(self.stream.read_u32()?)
        };
        let inline = if self.bigtiff { 8 } else { 4 };
        let mut value_or_offset = [0u8; 8];
        self.stream.read_exact(&mut value_or_offset[..inline])?;
        Ok(RawEntry {
            tag,
            type_,
            count,
            value_or_offset,
        })
    }

    /// Produces the decoded value for an entry, chasing the offset when the
    /// value does not fit inline.
    fn resolve_entry(&mut self, entry: &RawEntry, ty: Type) -> SciioResult<TagValue> {
        let little = self.stream.order().is_little();
        let value_bytes = ty
            .value_bytes(entry.count)
            .ok_or_else(|| FormatError::Format(String::from("tag value count overflows")))?;
        if value_bytes as usize > self.limits.ifd_value_size {
            return Err(FormatError::Format(format!(
                "tag {} value of {} bytes exceeds the limit",
                entry.tag, value_bytes
            ))
            .into());
        }

        let inline = if self.bigtiff { 8 } else { 4 };
        let raw = if value_bytes as usize <= inline {
            entry.value_or_offset[..value_bytes as usize].to_vec()
        } else {
            let offset = if self.bigtiff {
                util::bytes_to_u64(&entry.value_or_offset, 0, 8, little)
            } else {
                u64::from(util::bytes_to_u32(&entry.value_or_offset, 0, 4, little))
            };
            let resume = self.stream.position();
            self.stream.seek(offset)?;
            let mut bytes = vec![0u8; value_bytes as usize];
            self.stream.read_exact(&mut bytes)?;
            self.stream.seek(resume)?;
            bytes
        };

        Ok(decode_value(&raw, ty, entry.count as usize, little))
    }
}

/// Decodes a raw value region into its typed array.
pub(crate) fn decode_value(raw: &[u8], ty: Type, count: usize, little: bool) -> TagValue {
    match ty {
        Type::BYTE => TagValue::Bytes(raw[..count.min(raw.len())].to_vec()),
        Type::SBYTE => TagValue::SignedBytes(
            raw[..count.min(raw.len())]
                .iter()
                .map(|&b| b as i8)
                .collect(),
        ),
        Type::UNDEFINED => TagValue::Undefined(raw[..count.min(raw.len())].to_vec()),
        Type::ASCII => {
            let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
            TagValue::Ascii(String::from_utf8_lossy(&raw[..end]).into_owned())
        }
        Type::SHORT => TagValue::Shorts(
            (0..count)
                .map(|i| util::bytes_to_u16(raw, i * 2, 2, little))
                .collect(),
        ),
        Type::SSHORT => TagValue::SignedShorts(
            (0..count)
                .map(|i| util::bytes_to_i16(raw, i * 2, 2, little))
                .collect(),
        ),
        Type::LONG => TagValue::Longs(
            (0..count)
                .map(|i| util::bytes_to_u32(raw, i * 4, 4, little))
                .collect(),
        ),
        Type::SLONG => TagValue::SignedLongs(
            (0..count)
                .map(|i| util::bytes_to_i32(raw, i * 4, 4, little))
                .collect(),
        ),
        Type::RATIONAL => TagValue::Rationals(
            (0..count)
                .map(|i| {
                    (
                        util::bytes_to_u32(raw, i * 8, 4, little),
                        util::bytes_to_u32(raw, i * 8 + 4, 4, little),
                    )
                })
                .collect(),
        ),
        Type::SRATIONAL => TagValue::SignedRationals(
            (0..count)
                .map(|i| {
                    (
                        util::bytes_to_i32(raw, i * 8, 4, little),
                        util::bytes_to_i32(raw, i * 8 + 4, 4, little),
                    )
                })
                .collect(),
        ),
        Type::FLOAT => TagValue::Floats(
            (0..count)
                .map(|i| util::bytes_to_f32(raw, i * 4, little))
                .collect(),
        ),
        Type::DOUBLE => TagValue::Doubles(
            (0..count)
                .map(|i| util::bytes_to_f64(raw, i * 8, little))
                .collect(),
        ),
        Type::IFD => TagValue::Ifd(util::bytes_to_u32(raw, 0, 4, little)),
        Type::IFD8 => TagValue::Ifd8(util::bytes_to_u64(raw, 0, 8, little)),
        Type::LONG8 => TagValue::Long8s(
            (0..count)
                .map(|i| util::bytes_to_u64(raw, i * 8, 8, little))
                .collect(),
        ),
        Type::SLONG8 => TagValue::SignedLong8s(
            (0..count)
                .map(|i| util::bytes_to_i64(raw, i * 8, 8, little))
                .collect(),
        ),
        Type::Unknown(_) => TagValue::Undefined(raw.to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryHandle;

    fn stream_over(bytes: Vec<u8>) -> BufferedStream {
        BufferedStream::new(Box::new(MemoryHandle::new(bytes)))
    }

    #[test]
    fn rejects_non_tiff_signatures() {
        for bytes in [
            b"GIF8".to_vec(),
            b"II\x2B\x00".to_vec(), // BigTIFF magic with classic signature length
            b"MM\x00\x2C".to_vec(),
            vec![],
        ] {
            assert!(matches!(
                TiffParser::new(stream_over(bytes)),
                Err(crate::SciioError::Format(FormatError::NotATiff))
            ));
        }
    }

    #[test]
    fn parses_classic_header() {
        let mut bytes = b"II\x2A\x00".to_vec();
        bytes.extend_from_slice(&8u32.to_le_bytes());
        let parser = TiffParser::new(stream_over(bytes)).unwrap();
        assert!(!parser.is_big_tiff());
        assert_eq!(parser.first_ifd_offset(), 8);
        assert_eq!(parser.byte_order(), ByteOrder::LittleEndian);
    }

    #[test]
    fn parses_bigtiff_header() {
        let mut bytes = b"MM\x00\x2B".to_vec();
        bytes.extend_from_slice(&8u16.to_be_bytes());
        bytes.extend_from_slice(&0u16.to_be_bytes());
        bytes.extend_from_slice(&16u64.to_be_bytes());
        let parser = TiffParser::new(stream_over(bytes)).unwrap();
        assert!(parser.is_big_tiff());
        assert_eq!(parser.first_ifd_offset(), 16);
        assert_eq!(parser.byte_order(), ByteOrder::BigEndian);
    }

    #[test]
    fn detects_cyclic_chains() {
        // one empty IFD at offset 8 whose next pointer loops back to itself
        let mut bytes = b"II\x2A\x00".to_vec();
        bytes.extend_from_slice(&8u32.to_le_bytes());
        bytes.extend_from_slice(&0u16.to_le_bytes()); // zero entries
        bytes.extend_from_slice(&8u32.to_le_bytes()); // next = itself
        let mut parser = TiffParser::new(stream_over(bytes)).unwrap();
        assert!(matches!(
            parser.ifd_offsets(),
            Err(crate::SciioError::Format(FormatError::CyclicIfd))
        ));
    }

    #[test]
    fn decodes_inline_and_offset_values() {
        assert_eq!(
            decode_value(&[0x20, 0x00], Type::SHORT, 1, true),
            TagValue::Shorts(vec![32])
        );
        assert_eq!(
            decode_value(b"MetaMorph\0", Type::ASCII, 10, true),
            TagValue::Ascii(String::from("MetaMorph"))
        );
        assert_eq!(
            decode_value(
                &[0, 0, 0, 72, 0, 0, 0, 1],
                Type::RATIONAL,
                1,
                false
            ),
            TagValue::Rationals(vec![(72, 1)])
        );
    }
}
