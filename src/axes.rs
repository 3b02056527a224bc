//! Image metadata: pixel types, dimensional axes, and plane buffers.

use std::sync::Arc;

use crate::error::{SciioResult, UsageError};

/// An enumeration over supported pixel encodings.
#[derive(Copy, PartialEq, Eq, Debug, Clone, Hash)]
#[non_exhaustive]
pub enum PixelType {
    Int8,
    Uint8,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Float32,
    Float64,
}

impl PixelType {
    pub fn bytes_per_pixel(&self) -> usize {
        match *self {
            PixelType::Int8 | PixelType::Uint8 => 1,
            PixelType::Int16 | PixelType::Uint16 => 2,
            PixelType::Int32 | PixelType::Uint32 | PixelType::Float32 => 4,
            PixelType::Float64 => 8,
        }
    }

    pub fn bits_per_pixel(&self) -> usize {
        self.bytes_per_pixel() * 8
    }

    pub fn is_signed(&self) -> bool {
        matches!(
            *self,
            PixelType::Int8
                | PixelType::Int16
                | PixelType::Int32
                | PixelType::Float32
                | PixelType::Float64
        )
    }

    pub fn is_float(&self) -> bool {
        matches!(*self, PixelType::Float32 | PixelType::Float64)
    }
}

/// The dimensional meaning of one axis.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
#[non_exhaustive]
pub enum AxisType {
    X,
    Y,
    Z,
    Channel,
    Time,
}

/// One calibrated dimension of an image.
#[derive(Clone, Debug, PartialEq)]
pub struct Axis {
    pub kind: AxisType,
    pub length: u64,
    /// Physical size of one sample along this axis, if known.
    pub scale: Option<f64>,
    pub unit: Option<String>,
}

impl Axis {
    pub fn new(kind: AxisType, length: u64) -> Self {
        Axis {
            kind,
            length,
            scale: None,
            unit: None,
        }
    }

    pub fn calibrated(kind: AxisType, length: u64, scale: f64) -> Self {
        Axis {
            kind,
            length,
            scale: Some(scale),
            unit: None,
        }
    }
}

/// Per-image structural metadata.
///
/// The first `planar_count` axes are the planar ones; every axis after them
/// indexes between planes. The plane count is the product of the non-planar
/// axis lengths.
#[derive(Clone, Debug)]
pub struct ImageMetadata {
    pub axes: Vec<Axis>,
    pub planar_count: usize,
    pub pixel_type: PixelType,
    pub little_endian: bool,
    pub indexed: bool,
    /// Number of leading planar axes whose samples interleave per pixel
    /// (0 when components are not interleaved).
    pub interleaved_count: usize,
    pub bits_per_pixel: usize,
    /// Lookup table for indexed images, one channel per row.
    pub color_table: Option<Vec<Vec<u16>>>,
    pub thumbnail: bool,
}

impl ImageMetadata {
    pub fn new(axes: Vec<Axis>, planar_count: usize, pixel_type: PixelType) -> Self {
        let bits = pixel_type.bits_per_pixel();
        ImageMetadata {
            axes,
            planar_count,
            pixel_type,
            little_endian: true,
            indexed: false,
            interleaved_count: 0,
            bits_per_pixel: bits,
            color_table: None,
            thumbnail: false,
        }
    }

    pub fn axes_planar(&self) -> &[Axis] {
        &self.axes[..self.planar_count]
    }

    pub fn axes_non_planar(&self) -> &[Axis] {
        &self.axes[self.planar_count..]
    }

    pub fn planar_lengths(&self) -> Vec<u64> {
        self.axes_planar().iter().map(|a| a.length).collect()
    }

    pub fn non_planar_lengths(&self) -> Vec<u64> {
        self.axes_non_planar().iter().map(|a| a.length).collect()
    }

    /// Index of the given axis kind within the full axis list.
    pub fn axis_index(&self, kind: AxisType) -> Option<usize> {
        self.axes.iter().position(|a| a.kind == kind)
    }

    pub fn axis_length(&self, kind: AxisType) -> Option<u64> {
        self.axis_index(kind).map(|i| self.axes[i].length)
    }

    /// Number of planes: the product of the non-planar axis lengths.
    pub fn plane_count(&self) -> u64 {
        self.axes_non_planar().iter().map(|a| a.length).product()
    }

    /// Byte size of one full plane.
    pub fn plane_size(&self) -> u64 {
        let samples: u64 = self.axes_planar().iter().map(|a| a.length).product();
        samples * self.pixel_type.bytes_per_pixel() as u64
    }

    pub fn is_multichannel(&self) -> bool {
        self.axis_index(AxisType::Channel)
            .map(|i| i < self.planar_count)
            .unwrap_or(false)
    }
}

/// Structural metadata for a whole dataset.
#[derive(Clone, Debug, Default)]
pub struct DatasetMetadata {
    pub images: Vec<Arc<ImageMetadata>>,
    /// Free-form key/value pairs harvested from format-specific comments.
    pub table: Vec<(String, String)>,
    pub dataset_name: Option<String>,
    pub companion_file: Option<String>,
}

impl DatasetMetadata {
    pub fn get(&self, image_index: usize) -> Option<&Arc<ImageMetadata>> {
        self.images.get(image_index)
    }

    pub fn put(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.table.push((key.into(), value.into()));
    }
}

/// A contiguous pixel buffer covering a planar sub-region of one image.
#[derive(Clone, Debug)]
pub struct Plane {
    bytes: Vec<u8>,
    offsets: Vec<u64>,
    lengths: Vec<u64>,
    meta: Arc<ImageMetadata>,
}

impl Plane {
    /// Allocates a zeroed plane covering `lengths` samples starting at
    /// `offsets` in the planar coordinate space of `meta`.
    pub fn new(meta: Arc<ImageMetadata>, offsets: &[u64], lengths: &[u64]) -> SciioResult<Self> {
        let samples = crate::util::safe_multiply_32(lengths)?;
        let bytes = vec![0u8; samples * meta.pixel_type.bytes_per_pixel()];
        Ok(Plane {
            bytes,
            offsets: offsets.to_vec(),
            lengths: lengths.to_vec(),
            meta,
        })
    }

    pub fn populate(
        meta: Arc<ImageMetadata>,
        bytes: Vec<u8>,
        offsets: &[u64],
        lengths: &[u64],
    ) -> Self {
        Plane {
            bytes,
            offsets: offsets.to_vec(),
            lengths: lengths.to_vec(),
            meta,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn offsets(&self) -> &[u64] {
        &self.offsets
    }

    pub fn lengths(&self) -> &[u64] {
        &self.lengths
    }

    pub fn metadata(&self) -> &Arc<ImageMetadata> {
        &self.meta
    }
}

/// Converts a linear plane index into per-axis coordinates over `lengths`,
/// fastest axis first.
pub fn raster_to_position(lengths: &[u64], mut index: u64) -> Vec<u64> {
    let mut position = vec![0u64; lengths.len()];
    for (i, &len) in lengths.iter().enumerate() {
        if len == 0 {
            continue;
        }
        position[i] = index % len;
        index /= len;
    }
    position
}

/// Converts per-axis coordinates over `lengths` back into a linear index.
/// Inverse of [`raster_to_position`].
pub fn position_to_raster(lengths: &[u64], position: &[u64]) -> u64 {
    let mut index = 0u64;
    let mut stride = 1u64;
    for (i, &len) in lengths.iter().enumerate() {
        index += position[i] * stride;
        stride *= len.max(1);
    }
    index
}

/// Validates a plane index against the image's plane count.
pub fn check_plane_index(meta: &ImageMetadata, plane_index: u64) -> SciioResult<()> {
    let count = meta.plane_count();
    if plane_index >= count {
        return Err(UsageError::IndexOutOfRange {
            index: plane_index,
            count,
        }
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xyczt() -> ImageMetadata {
        ImageMetadata::new(
            vec![
                Axis::new(AxisType::X, 64),
                Axis::new(AxisType::Y, 48),
                Axis::new(AxisType::Channel, 3),
                Axis::new(AxisType::Z, 5),
                Axis::new(AxisType::Time, 2),
            ],
            2,
            PixelType::Uint16,
        )
    }

    #[test]
    fn plane_counts() {
        let meta = xyczt();
        assert_eq!(meta.plane_count(), 3 * 5 * 2);
        assert_eq!(meta.plane_size(), 64 * 48 * 2);
        assert!(!meta.is_multichannel());
    }

    #[test]
    fn raster_round_trip() {
        let lengths = [3u64, 5, 2];
        for index in 0..30 {
            let pos = raster_to_position(&lengths, index);
            assert_eq!(position_to_raster(&lengths, &pos), index);
        }
        assert_eq!(raster_to_position(&lengths, 7), vec![1, 2, 0]);
    }

    #[test]
    fn index_check() {
        let meta = xyczt();
        assert!(check_plane_index(&meta, 29).is_ok());
        assert!(check_plane_index(&meta, 30).is_err());
    }
}
