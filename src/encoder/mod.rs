//! TIFF serialization: directory encoding, plane streaming, BigTIFF
//! promotion.

use log::info;

use crate::codec::{self, Codec, CodecOptions};
use crate::config::WriterConfig;
use crate::decoder::TiffParser;
use crate::error::{FormatError, SciioResult};
use crate::ifd::{Ifd, TagValue};
use crate::io::{BufferedStream, ByteOrder, MemoryHandle};
use crate::tags::{CompressionMethod, Tag, Type};

/// Both header layouts reserve 16 bytes, so a classic header can later be
/// rewritten as BigTIFF without moving data.
pub const HEADER_RESERVED: u64 = 16;

/// Serializes directories and plane bytes into a writable stream.
///
/// The saver only appends: pixel bytes and directories go to the end of the
/// file, and the previous directory's next-offset field (or the header) is
/// patched to link each new directory in.
pub struct TiffSaver {
    stream: BufferedStream,
    big_tiff: bool,
    sequential: bool,
    compression: CompressionMethod,
    codec: Box<dyn Codec>,
    /// Position of the pointer field that should receive the next IFD's
    /// offset; known once this saver has touched the chain.
    tail_pointer: Option<u64>,
}

impl TiffSaver {
    pub fn new(mut stream: BufferedStream, config: &WriterConfig) -> SciioResult<Self> {
        let (compression, codec) = codec::for_name(&config.compression).ok_or_else(|| {
            FormatError::Format(format!("unknown compression name {:?}", config.compression))
        })?;
        stream.set_order(if config.little_endian {
            ByteOrder::LittleEndian
        } else {
            ByteOrder::BigEndian
        });
        Ok(TiffSaver {
            stream,
            big_tiff: config.big_tiff.unwrap_or(false),
            sequential: config.sequential,
            compression,
            codec,
            tail_pointer: None,
        })
    }

    pub fn stream(&mut self) -> &mut BufferedStream {
        &mut self.stream
    }

    pub fn is_big_tiff(&self) -> bool {
        self.big_tiff
    }

    pub fn length(&self) -> u64 {
        self.stream.length()
    }

    pub fn flush(&mut self) -> SciioResult<()> {
        self.stream.flush()
    }

    pub fn close(&mut self) -> SciioResult<()> {
        self.stream.close()
    }

    /// Writes the magic, version and first-IFD placeholder. The header area
    /// is padded to [`HEADER_RESERVED`] bytes in both layouts.
    pub fn write_header(&mut self) -> SciioResult<()> {
        self.stream.seek(0)?;
        let order_mark = match self.stream.order() {
            ByteOrder::LittleEndian => b"II",
            ByteOrder::BigEndian => b"MM",
        };
        self.stream.write(order_mark)?;
        if self.big_tiff {
            self.stream.write_u16(43)?;
            self.stream.write_u16(8)?;
            self.stream.write_u16(0)?;
            self.stream.write_u64(0)?;
            self.tail_pointer = Some(8);
        } else {
            self.stream.write_u16(42)?;
            self.stream.write_u32(0)?;
            // pad so a BigTIFF header fits here later
            self.stream.write(&[0u8; 8])?;
            self.tail_pointer = Some(4);
        }
        Ok(())
    }

    /// Compresses and appends one plane as a single strip, then appends its
    /// directory and links it into the chain.
    pub fn write_image(&mut self, mut ifd: Ifd, buf: &[u8], height: u64) -> SciioResult<()> {
        let data_offset = self.stream.length();
        self.stream.seek(data_offset)?;
        let compressed = self
            .codec
            .compress(buf, &CodecOptions::with_expected_len(buf.len()))?;
        self.stream.write(&compressed)?;

        ifd.put(
            Tag::Compression,
            TagValue::Shorts(vec![self.compression.to_u16()]),
        );
        ifd.put(Tag::RowsPerStrip, TagValue::Longs(vec![height as u32]));
        if self.big_tiff {
            ifd.put(Tag::StripOffsets, TagValue::Long8s(vec![data_offset]));
            ifd.put(
                Tag::StripByteCounts,
                TagValue::Long8s(vec![compressed.len() as u64]),
            );
        } else {
            ifd.put(Tag::StripOffsets, TagValue::Longs(vec![data_offset as u32]));
            ifd.put(
                Tag::StripByteCounts,
                TagValue::Longs(vec![compressed.len() as u32]),
            );
        }

        let ifd_offset = self.write_ifd(&ifd)?;
        self.link_ifd(ifd_offset)?;
        Ok(())
    }

    /// Serializes a directory at the end of the file and returns the offset
    /// of its entry table. Values too large for the inline field are
    /// spilled ahead of the table, the way the entry count is known before
    /// any entry is emitted.
    fn write_ifd(&mut self, ifd: &Ifd) -> SciioResult<u64> {
        let inline = if self.big_tiff { 8usize } else { 4 };
        let little = self.stream.order().is_little();

        let mut encoded: Vec<(u16, Type, u64, Vec<u8>)> = Vec::with_capacity(ifd.len());
        for (tag, value) in ifd.iter() {
            let (ty, count, bytes) = encode_value(value, little);
            encoded.push((tag, ty, count, bytes));
        }

        // spill oversized values first
        let mut spill_at = self.stream.length();
        if spill_at % 2 == 1 {
            self.stream.seek(spill_at)?;
            self.stream.write_u8(0)?;
            spill_at += 1;
        }
        self.stream.seek(spill_at)?;
        let mut fields: Vec<(u16, Type, u64, Vec<u8>)> = Vec::with_capacity(encoded.len());
        for (tag, ty, count, bytes) in encoded {
            if bytes.len() > inline {
                let offset = self.stream.position();
                self.stream.write(&bytes)?;
                let mut field = Vec::with_capacity(inline);
                if self.big_tiff {
                    field.extend_from_slice(&to_order(offset, little));
                } else {
                    field.extend_from_slice(&to_order_u32(offset as u32, little));
                }
                fields.push((tag, ty, count, field));
            } else {
                let mut field = bytes;
                field.resize(inline, 0);
                fields.push((tag, ty, count, field));
            }
        }

        let table_offset = self.stream.position();
        if self.big_tiff {
            self.stream.write_u64(fields.len() as u64)?;
        } else {
            self.stream.write_u16(fields.len() as u16)?;
        }
        for (tag, ty, count, field) in fields {
            self.stream.write_u16(tag)?;
            self.stream.write_u16(ty.to_u16())?;
            if self.big_tiff {
                self.stream.write_u64(count)?;
            } else {
                self.stream.write_u32(count as u32)?;
            }
            self.stream.write(&field)?;
        }
        // next-IFD terminator; linking patches the previous one
        if self.big_tiff {
            self.stream.write_u64(0)?;
        } else {
            self.stream.write_u32(0)?;
        }
        Ok(table_offset)
    }

    /// Patches the chain tail (header field or previous directory's next
    /// pointer) to reference the directory at `ifd_offset`.
    fn link_ifd(&mut self, ifd_offset: u64) -> SciioResult<()> {
        let tail = match self.tail_pointer {
            Some(tail) if self.sequential => tail,
            _ => self.find_tail_pointer(ifd_offset)?,
        };
        self.stream.seek(tail)?;
        if self.big_tiff {
            self.stream.write_u64(ifd_offset)?;
        } else {
            self.stream.write_u32(ifd_offset as u32)?;
        }
        // the new directory's own next field becomes the tail
        self.tail_pointer = Some(self.next_field_position(ifd_offset)?);
        Ok(())
    }

    /// Position of the next-offset field of the directory at `offset`.
    fn next_field_position(&mut self, offset: u64) -> SciioResult<u64> {
        self.stream.seek(offset)?;
        let (count_size, entry_size) = if self.big_tiff { (8, 20) } else { (2, 12) };
        let entries = if self.big_tiff {
            self.stream.read_u64()?
        } else {
            u64::from(self.stream.read_u16()?)
        };
        Ok(offset + count_size + entries * entry_size)
    }

    /// Walks the existing chain to find the pointer field that still holds
    /// zero, ignoring the directory just written at `just_written`.
    fn find_tail_pointer(&mut self, just_written: u64) -> SciioResult<u64> {
        let header_field = if self.big_tiff { 8 } else { 4 };
        let mut pointer = header_field;
        loop {
            self.stream.seek(pointer)?;
            let target = if self.big_tiff {
                self.stream.read_u64()?
            } else {
                u64::from(self.stream.read_u32()?)
            };
            if target == 0 || target == just_written {
                return Ok(pointer);
            }
            pointer = self.next_field_position(target)?;
        }
    }

    /// Rewrites the file as BigTIFF: the header gains the 43 magic and
    /// 64-bit offsets, and every existing directory is re-emitted at the end
    /// of the file with 8-byte offset fields. Pixel bytes stay in place; the
    /// classic directories become dead space.
    pub fn promote_to_big_tiff(&mut self) -> SciioResult<()> {
        if self.big_tiff {
            return Ok(());
        }
        info!("promoting output to BigTIFF");
        self.stream.flush()?;

        let placeholder = BufferedStream::new(Box::new(MemoryHandle::new(Vec::new())));
        let stream = std::mem::replace(&mut self.stream, placeholder);
        let mut parser = TiffParser::new(stream)?;
        let chain = parser.read_ifds()?;
        self.stream = parser.into_stream();

        self.big_tiff = true;
        self.write_header()?;
        for ifd in &chain {
            let offset = self.write_ifd(ifd)?;
            // relink in order; the chain sequence is preserved
            let tail = self.tail_pointer.expect("header sets the tail");
            self.stream.seek(tail)?;
            self.stream.write_u64(offset)?;
            self.tail_pointer = Some(self.next_field_position(offset)?);
        }
        self.stream.flush()?;
        Ok(())
    }
}

fn to_order(value: u64, little: bool) -> [u8; 8] {
    if little {
        value.to_le_bytes()
    } else {
        value.to_be_bytes()
    }
}

fn to_order_u32(value: u32, little: bool) -> [u8; 4] {
    if little {
        value.to_le_bytes()
    } else {
        value.to_be_bytes()
    }
}

/// Serializes a tag value into `(field type, count, raw bytes)` in the
/// file's byte order. Inverse of the parser's value decoding.
pub(crate) fn encode_value(value: &TagValue, little: bool) -> (Type, u64, Vec<u8>) {
    fn scalars<T, const N: usize>(
        items: impl Iterator<Item = T>,
        encode: impl Fn(T) -> [u8; N],
    ) -> Vec<u8> {
        let mut out = Vec::new();
        for item in items {
            out.extend_from_slice(&encode(item));
        }
        out
    }

    match *value {
        TagValue::Bytes(ref v) => (Type::BYTE, v.len() as u64, v.clone()),
        TagValue::Undefined(ref v) => (Type::UNDEFINED, v.len() as u64, v.clone()),
        TagValue::SignedBytes(ref v) => (
            Type::SBYTE,
            v.len() as u64,
            v.iter().map(|&b| b as u8).collect(),
        ),
        TagValue::Ascii(ref s) => {
            let mut bytes = s.as_bytes().to_vec();
            bytes.push(0);
            (Type::ASCII, bytes.len() as u64, bytes)
        }
        TagValue::Shorts(ref v) => (
            Type::SHORT,
            v.len() as u64,
            scalars(v.iter().copied(), |e| {
                if little {
                    e.to_le_bytes()
                } else {
                    e.to_be_bytes()
                }
            }),
        ),
        TagValue::SignedShorts(ref v) => (
            Type::SSHORT,
            v.len() as u64,
            scalars(v.iter().copied(), |e| {
                if little {
                    e.to_le_bytes()
                } else {
                    e.to_be_bytes()
                }
            }),
        ),
        TagValue::Longs(ref v) => (
            Type::LONG,
            v.len() as u64,
            scalars(v.iter().copied(), |e| to_order_u32(e, little)),
        ),
        TagValue::SignedLongs(ref v) => (
            Type::SLONG,
            v.len() as u64,
            scalars(v.iter().copied(), |e| to_order_u32(e as u32, little)),
        ),
        TagValue::Rationals(ref v) => {
            let mut bytes = Vec::with_capacity(v.len() * 8);
            for &(n, d) in v {
                bytes.extend_from_slice(&to_order_u32(n, little));
                bytes.extend_from_slice(&to_order_u32(d, little));
            }
            (Type::RATIONAL, v.len() as u64, bytes)
        }
        TagValue::SignedRationals(ref v) => {
            let mut bytes = Vec::with_capacity(v.len() * 8);
            for &(n, d) in v {
                bytes.extend_from_slice(&to_order_u32(n as u32, little));
                bytes.extend_from_slice(&to_order_u32(d as u32, little));
            }
            (Type::SRATIONAL, v.len() as u64, bytes)
        }
        TagValue::Floats(ref v) => (
            Type::FLOAT,
            v.len() as u64,
            scalars(v.iter().copied(), |e| to_order_u32(e.to_bits(), little)),
        ),
        TagValue::Doubles(ref v) => (
            Type::DOUBLE,
            v.len() as u64,
            scalars(v.iter().copied(), |e| to_order(e.to_bits(), little)),
        ),
        TagValue::Ifd(v) => (Type::IFD, 1, to_order_u32(v, little).to_vec()),
        TagValue::Ifd8(v) => (Type::IFD8, 1, to_order(v, little).to_vec()),
        TagValue::Long8s(ref v) => (
            Type::LONG8,
            v.len() as u64,
            scalars(v.iter().copied(), |e| to_order(e, little)),
        ),
        TagValue::SignedLong8s(ref v) => (
            Type::SLONG8,
            v.len() as u64,
            scalars(v.iter().copied(), |e| to_order(e as u64, little)),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::decode_value;

    #[test]
    fn encode_decode_value_round_trip() {
        let values = [
            TagValue::Shorts(vec![1, 2, 3]),
            TagValue::Longs(vec![70_000]),
            TagValue::Rationals(vec![(72, 1)]),
            TagValue::Ascii(String::from("MetaMorph")),
            TagValue::Doubles(vec![0.25, -4.5]),
            TagValue::Long8s(vec![1 << 40]),
        ];
        for little in [true, false] {
            for value in &values {
                let (ty, count, bytes) = encode_value(value, little);
                let back = decode_value(&bytes, ty, count as usize, little);
                match value {
                    // counts include the NUL for ASCII; decoded text matches
                    TagValue::Ascii(s) => {
                        assert_eq!(back, TagValue::Ascii(s.clone()));
                    }
                    other => assert_eq!(&back, other),
                }
            }
        }
    }
}
