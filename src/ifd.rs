//! Abstractions over TIFF tags and image file directories.

use std::collections::BTreeMap;

use crate::error::{FormatError, SciioResult};
use crate::tags::{
    CompressionMethod, PhotometricInterpretation, PlanarConfiguration, Predictor, Tag, Type,
};

/// A decoded tag value, held as the typed array the entry described.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum TagValue {
    Bytes(Vec<u8>),
    Ascii(String),
    Shorts(Vec<u16>),
    Longs(Vec<u32>),
    Rationals(Vec<(u32, u32)>),
    SignedBytes(Vec<i8>),
    Undefined(Vec<u8>),
    SignedShorts(Vec<i16>),
    SignedLongs(Vec<i32>),
    SignedRationals(Vec<(i32, i32)>),
    Floats(Vec<f32>),
    Doubles(Vec<f64>),
    Ifd(u32),
    Long8s(Vec<u64>),
    SignedLong8s(Vec<i64>),
    Ifd8(u64),
}

impl TagValue {
    pub fn kind(&self) -> Type {
        match *self {
            TagValue::Bytes(_) => Type::BYTE,
            TagValue::Ascii(_) => Type::ASCII,
            TagValue::Shorts(_) => Type::SHORT,
            TagValue::Longs(_) => Type::LONG,
            TagValue::Rationals(_) => Type::RATIONAL,
            TagValue::SignedBytes(_) => Type::SBYTE,
            TagValue::Undefined(_) => Type::UNDEFINED,
            TagValue::SignedShorts(_) => Type::SSHORT,
            TagValue::SignedLongs(_) => Type::SLONG,
            TagValue::SignedRationals(_) => Type::SRATIONAL,
            TagValue::Floats(_) => Type::FLOAT,
            TagValue::Doubles(_) => Type::DOUBLE,
            TagValue::Ifd(_) => Type::IFD,
            TagValue::Long8s(_) => Type::LONG8,
            TagValue::SignedLong8s(_) => Type::SLONG8,
            TagValue::Ifd8(_) => Type::IFD8,
        }
    }

    pub fn count(&self) -> usize {
        match *self {
            TagValue::Bytes(ref v) | TagValue::Undefined(ref v) => v.len(),
            TagValue::Ascii(ref s) => s.len() + 1,
            TagValue::Shorts(ref v) => v.len(),
            TagValue::Longs(ref v) => v.len(),
            TagValue::Rationals(ref v) => v.len(),
            TagValue::SignedBytes(ref v) => v.len(),
            TagValue::SignedShorts(ref v) => v.len(),
            TagValue::SignedLongs(ref v) => v.len(),
            TagValue::SignedRationals(ref v) => v.len(),
            TagValue::Floats(ref v) => v.len(),
            TagValue::Doubles(ref v) => v.len(),
            TagValue::Ifd(_) | TagValue::Ifd8(_) => 1,
            TagValue::Long8s(ref v) => v.len(),
            TagValue::SignedLong8s(ref v) => v.len(),
        }
    }
}

/// An image file directory: an ordered `tag id -> value` mapping.
///
/// Iteration follows ascending tag order, the order TIFF 6.0 mandates on
/// disk, which keeps serialization stable. The directory itself is dumb
/// storage; interpretation of layout fields belongs to the parser and the
/// writer.
#[derive(Debug, Clone, Default)]
pub struct Ifd {
    entries: BTreeMap<u16, TagValue>,
}

/// The ordered IFD sequence of one file; position i holds plane i.
pub type IfdChain = Vec<Ifd>;

impl Ifd {
    pub fn new() -> Self {
        Ifd::default()
    }

    pub fn put(&mut self, tag: Tag, value: TagValue) {
        self.entries.insert(tag.to_u16(), value);
    }

    pub fn put_id(&mut self, id: u16, value: TagValue) {
        self.entries.insert(id, value);
    }

    pub fn get(&self, tag: Tag) -> Option<&TagValue> {
        self.entries.get(&tag.to_u16())
    }

    pub fn get_id(&self, id: u16) -> Option<&TagValue> {
        self.entries.get(&id)
    }

    pub fn contains(&self, tag: Tag) -> bool {
        self.entries.contains_key(&tag.to_u16())
    }

    pub fn remove(&mut self, tag: Tag) -> Option<TagValue> {
        self.entries.remove(&tag.to_u16())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u16, &TagValue)> {
        self.entries.iter().map(|(&id, value)| (id, value))
    }

    // -- typed getters; small widths coerce up --

    /// First element of an unsigned integer tag, coerced up to u64.
    pub fn get_uint(&self, tag: Tag) -> SciioResult<u64> {
        let id = tag.to_u16();
        let value = self.get_id(id).ok_or(FormatError::MissingTag(id))?;
        uint_at(value, 0, id)
    }

    pub fn get_uint_or(&self, tag: Tag, default: u64) -> SciioResult<u64> {
        match self.get(tag) {
            Some(value) => uint_at(value, 0, tag.to_u16()),
            None => Ok(default),
        }
    }

    /// Every element of an unsigned integer tag, coerced up to u64.
    pub fn get_uint_array(&self, tag: Tag) -> SciioResult<Vec<u64>> {
        let id = tag.to_u16();
        let value = self.get_id(id).ok_or(FormatError::MissingTag(id))?;
        let mut out = Vec::with_capacity(value.count());
        for i in 0..array_len(value) {
            out.push(uint_at(value, i, id)?);
        }
        Ok(out)
    }

    pub fn get_string(&self, tag: Tag) -> SciioResult<&str> {
        let id = tag.to_u16();
        let value = self.get_id(id).ok_or(FormatError::MissingTag(id))?;
        match *value {
            TagValue::Ascii(ref s) => Ok(s),
            ref other => Err(bad_type(id, other, Type::ASCII)),
        }
    }

    pub fn get_rational(&self, tag: Tag) -> SciioResult<(u32, u32)> {
        let id = tag.to_u16();
        let value = self.get_id(id).ok_or(FormatError::MissingTag(id))?;
        match *value {
            TagValue::Rationals(ref v) if !v.is_empty() => Ok(v[0]),
            ref other => Err(bad_type(id, other, Type::RATIONAL)),
        }
    }

    // -- interpreted layout fields, defaults per TIFF 6.0 --

    pub fn image_width(&self) -> SciioResult<u64> {
        self.get_uint(Tag::ImageWidth)
    }

    pub fn image_length(&self) -> SciioResult<u64> {
        self.get_uint(Tag::ImageLength)
    }

    pub fn bits_per_sample(&self) -> SciioResult<Vec<u16>> {
        match self.get(Tag::BitsPerSample) {
            None => Ok(vec![1]),
            Some(_) => Ok(self
                .get_uint_array(Tag::BitsPerSample)?
                .into_iter()
                .map(|v| v as u16)
                .collect()),
        }
    }

    pub fn samples_per_pixel(&self) -> SciioResult<u64> {
        self.get_uint_or(Tag::SamplesPerPixel, 1)
    }

    pub fn compression(&self) -> SciioResult<CompressionMethod> {
        let code = self.get_uint_or(Tag::Compression, 1)? as u16;
        Ok(CompressionMethod::from_u16_exhaustive(code))
    }

    pub fn photometric_interpretation(&self) -> SciioResult<PhotometricInterpretation> {
        let code = self.get_uint(Tag::PhotometricInterpretation)? as u16;
        Ok(PhotometricInterpretation::from_u16_exhaustive(code))
    }

    pub fn planar_configuration(&self) -> SciioResult<PlanarConfiguration> {
        let code = self.get_uint_or(Tag::PlanarConfiguration, 1)? as u16;
        PlanarConfiguration::from_u16(code)
            .ok_or_else(|| FormatError::Format(format!("planar configuration {code}")).into())
    }

    pub fn predictor(&self) -> SciioResult<Predictor> {
        let code = self.get_uint_or(Tag::Predictor, 1)? as u16;
        Predictor::from_u16(code)
            .ok_or_else(|| FormatError::Format(format!("predictor {code}")).into())
    }

    pub fn rows_per_strip(&self) -> SciioResult<u64> {
        self.get_uint_or(Tag::RowsPerStrip, self.image_length()?)
    }

    pub fn strip_offsets(&self) -> SciioResult<Vec<u64>> {
        self.get_uint_array(Tag::StripOffsets)
    }

    pub fn strip_byte_counts(&self) -> SciioResult<Vec<u64>> {
        self.get_uint_array(Tag::StripByteCounts)
    }

    pub fn is_tiled(&self) -> bool {
        self.contains(Tag::TileOffsets)
    }

    pub fn tile_width(&self) -> SciioResult<u64> {
        self.get_uint(Tag::TileWidth)
    }

    pub fn tile_length(&self) -> SciioResult<u64> {
        self.get_uint(Tag::TileLength)
    }

    pub fn tile_offsets(&self) -> SciioResult<Vec<u64>> {
        self.get_uint_array(Tag::TileOffsets)
    }

    pub fn tile_byte_counts(&self) -> SciioResult<Vec<u64>> {
        self.get_uint_array(Tag::TileByteCounts)
    }

    /// The resolution tags, as pixels per unit.
    pub fn x_resolution(&self) -> Option<f64> {
        rational_value(self.get(Tag::XResolution)?)
    }

    pub fn y_resolution(&self) -> Option<f64> {
        rational_value(self.get(Tag::YResolution)?)
    }

    /// The free-text comment: `IMAGE_DESCRIPTION`, NUL bytes stripped.
    pub fn comment(&self) -> Option<String> {
        match self.get(Tag::ImageDescription)? {
            TagValue::Ascii(s) => Some(s.replace('\0', "").trim().to_string()),
            TagValue::Bytes(b) | TagValue::Undefined(b) => Some(
                String::from_utf8_lossy(b)
                    .replace('\0', "")
                    .trim()
                    .to_string(),
            ),
            _ => None,
        }
    }

    /// Checks that every tag the parser relies on is present.
    pub fn validate_required(&self) -> SciioResult<()> {
        for tag in [
            Tag::ImageWidth,
            Tag::ImageLength,
            Tag::BitsPerSample,
            Tag::Compression,
            Tag::PhotometricInterpretation,
        ] {
            if !self.contains(tag) {
                return Err(FormatError::MissingTag(tag.to_u16()).into());
            }
        }
        let stripped = self.contains(Tag::StripOffsets) && self.contains(Tag::StripByteCounts);
        let tiled = self.contains(Tag::TileOffsets) && self.contains(Tag::TileByteCounts);
        if !stripped && !tiled {
            return Err(FormatError::MissingTag(Tag::StripOffsets.to_u16()).into());
        }
        Ok(())
    }
}

fn bad_type(tag: u16, have: &TagValue, want: Type) -> crate::SciioError {
    FormatError::BadTagType {
        tag,
        have: have.kind(),
        want,
    }
    .into()
}

fn array_len(value: &TagValue) -> usize {
    match *value {
        TagValue::Ascii(_) => 1,
        ref v => v.count(),
    }
}

/// Reads element `i` of an unsigned integer tag, coercing small widths up.
fn uint_at(value: &TagValue, i: usize, tag: u16) -> SciioResult<u64> {
    let element = match *value {
        TagValue::Bytes(ref v) => v.get(i).map(|&e| u64::from(e)),
        TagValue::Shorts(ref v) => v.get(i).map(|&e| u64::from(e)),
        TagValue::Longs(ref v) => v.get(i).map(|&e| u64::from(e)),
        TagValue::Long8s(ref v) => v.get(i).copied(),
        TagValue::Ifd(v) if i == 0 => Some(u64::from(v)),
        TagValue::Ifd8(v) if i == 0 => Some(v),
        ref other => return Err(bad_type(tag, other, Type::LONG)),
    };
    element.ok_or_else(|| FormatError::MissingTag(tag).into())
}

fn rational_value(value: &TagValue) -> Option<f64> {
    match *value {
        TagValue::Rationals(ref v) => v.first().and_then(|&(n, d)| {
            if d == 0 {
                None
            } else {
                Some(f64::from(n) / f64::from(d))
            }
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gray_ifd() -> Ifd {
        let mut ifd = Ifd::new();
        ifd.put(Tag::ImageWidth, TagValue::Shorts(vec![32]));
        ifd.put(Tag::ImageLength, TagValue::Longs(vec![32]));
        ifd.put(Tag::BitsPerSample, TagValue::Shorts(vec![8]));
        ifd.put(Tag::Compression, TagValue::Shorts(vec![1]));
        ifd.put(Tag::PhotometricInterpretation, TagValue::Shorts(vec![1]));
        ifd.put(Tag::StripOffsets, TagValue::Longs(vec![8]));
        ifd.put(Tag::StripByteCounts, TagValue::Longs(vec![1024]));
        ifd
    }

    #[test]
    fn small_widths_coerce_up() {
        let ifd = gray_ifd();
        assert_eq!(ifd.get_uint(Tag::ImageWidth).unwrap(), 32);
        assert_eq!(ifd.get_uint(Tag::ImageLength).unwrap(), 32);
        assert_eq!(ifd.strip_offsets().unwrap(), vec![8]);
    }

    #[test]
    fn missing_and_mistyped_tags() {
        let ifd = gray_ifd();
        assert!(matches!(
            ifd.get_uint(Tag::TileWidth),
            Err(crate::SciioError::Format(FormatError::MissingTag(322)))
        ));
        assert!(matches!(
            ifd.get_string(Tag::ImageWidth),
            Err(crate::SciioError::Format(FormatError::BadTagType {
                tag: 256,
                have: Type::SHORT,
                want: Type::ASCII,
            }))
        ));
    }

    #[test]
    fn layout_defaults() {
        let ifd = gray_ifd();
        assert_eq!(ifd.samples_per_pixel().unwrap(), 1);
        assert_eq!(
            ifd.planar_configuration().unwrap(),
            PlanarConfiguration::Chunky
        );
        assert_eq!(ifd.rows_per_strip().unwrap(), 32);
        assert!(!ifd.is_tiled());
        ifd.validate_required().unwrap();
    }

    #[test]
    fn validation_needs_a_layout() {
        let mut ifd = gray_ifd();
        ifd.remove(Tag::StripOffsets);
        assert!(ifd.validate_required().is_err());
    }

    #[test]
    fn iteration_is_tag_ordered() {
        let ifd = gray_ifd();
        let ids: Vec<u16> = ifd.iter().map(|(id, _)| id).collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn comments_strip_nuls() {
        let mut ifd = gray_ifd();
        ifd.put(
            Tag::ImageDescription,
            TagValue::Ascii(String::from("ImageJ=1.47\nimages=3\0")),
        );
        assert_eq!(ifd.comment().unwrap(), "ImageJ=1.47\nimages=3");
    }
}
