//! The writer surface: per-plane saves over a `TiffSaver`.

use std::sync::Mutex;

use log::info;

use crate::axes::{check_plane_index, AxisType, DatasetMetadata, ImageMetadata, Plane};
use crate::config::WriterConfig;
use crate::encoder::TiffSaver;
use crate::error::{FormatError, SciioResult, UsageError};
use crate::ifd::{Ifd, TagValue};
use crate::io::BufferedStream;
use crate::tags::{PhotometricInterpretation, Tag};

/// Promotion threshold for auto-selected BigTIFF. Classic TIFF offsets can
/// address up to 2^32-1; promotion fires proactively at 2^31 so the planes
/// in flight never approach that hard ceiling.
const BIG_TIFF_THRESHOLD: u64 = 1 << 31;

/// Writes a dataset plane by plane.
///
/// One writer serializes all of its `save_plane` calls through a single
/// internal lock (acquired before the low-level saver is touched, never the
/// other way around); writers on different files are independent. The last
/// directory is flushed on close.
pub struct TiffWriter {
    state: Mutex<WriterState>,
    meta: DatasetMetadata,
    config: WriterConfig,
}

struct WriterState {
    saver: TiffSaver,
    header_written: bool,
}

impl TiffWriter {
    /// Prepares a writer over `stream` for the images described by `meta`.
    pub fn new(
        stream: BufferedStream,
        meta: DatasetMetadata,
        config: WriterConfig,
    ) -> SciioResult<Self> {
        if meta.images.is_empty() {
            return Err(UsageError::InvalidAxisSpec.into());
        }
        let saver = TiffSaver::new(stream, &config)?;
        Ok(TiffWriter {
            state: Mutex::new(WriterState {
                saver,
                header_written: false,
            }),
            meta,
            config,
        })
    }

    pub fn metadata(&self) -> &DatasetMetadata {
        &self.meta
    }

    /// Appends one plane. The `offsets`/`lengths` pair must cover the whole
    /// plane; TIFF planes are streamed in full.
    pub fn save_plane(
        &self,
        image_index: usize,
        plane_index: u64,
        plane: &Plane,
        offsets: &[u64],
        lengths: &[u64],
    ) -> SciioResult<()> {
        let image = self
            .meta
            .get(image_index)
            .ok_or(UsageError::IndexOutOfRange {
                index: image_index as u64,
                count: self.meta.images.len() as u64,
            })?
            .clone();
        check_plane_index(&image, plane_index)?;

        let full = image.planar_lengths();
        if offsets.len() != full.len()
            || lengths != full.as_slice()
            || offsets.iter().any(|&o| o != 0)
        {
            return Err(UsageError::InvalidAxisSpec.into());
        }
        if plane.bytes().len() as u64 != image.plane_size() {
            return Err(UsageError::InvalidAxisSpec.into());
        }

        let mut state = self.state.lock().unwrap();
        if !state.header_written {
            if state.saver.length() == 0 {
                state.saver.write_header()?;
            }
            state.header_written = true;
        }

        // widen to BigTIFF before the offsets can overflow
        if !state.saver.is_big_tiff() {
            let projected = state.saver.length() + 2 * image.plane_size();
            if projected >= BIG_TIFF_THRESHOLD {
                if self.config.big_tiff == Some(false) {
                    return Err(FormatError::WouldOverflow32.into());
                }
                info!(
                    "dataset exceeds the 32-bit offset range at plane {plane_index}; promoting"
                );
                state.saver.promote_to_big_tiff()?;
            }
        }

        let height = image
            .axis_length(AxisType::Y)
            .ok_or(UsageError::InvalidAxisSpec)?;
        let ifd = populate_ifd(&image);
        state.saver.write_image(ifd, plane.bytes(), height)?;
        Ok(())
    }

    /// Flushes the last directory and releases the output.
    pub fn close(&self) -> SciioResult<()> {
        let mut state = self.state.lock().unwrap();
        state.saver.close()
    }
}

/// Builds the per-plane directory from the image's structural metadata.
fn populate_ifd(image: &ImageMetadata) -> Ifd {
    let mut ifd = Ifd::new();
    let width = image.axis_length(AxisType::X).unwrap_or(0);
    let height = image.axis_length(AxisType::Y).unwrap_or(0);
    let samples = image
        .axes_planar()
        .iter()
        .find(|a| a.kind == AxisType::Channel)
        .map(|a| a.length)
        .unwrap_or(1);

    ifd.put(Tag::ImageWidth, TagValue::Longs(vec![width as u32]));
    ifd.put(Tag::ImageLength, TagValue::Longs(vec![height as u32]));
    ifd.put(
        Tag::BitsPerSample,
        TagValue::Shorts(vec![image.bits_per_pixel as u16; samples as usize]),
    );
    ifd.put(Tag::SamplesPerPixel, TagValue::Shorts(vec![samples as u16]));
    ifd.put(Tag::PlanarConfiguration, TagValue::Shorts(vec![1]));

    let sample_format = if image.pixel_type.is_float() {
        3
    } else if image.pixel_type.is_signed() {
        2
    } else {
        1
    };
    ifd.put(Tag::SampleFormat, TagValue::Shorts(vec![sample_format]));

    let photometric = if image.indexed {
        PhotometricInterpretation::RGBPalette
    } else if samples > 1 {
        PhotometricInterpretation::RGB
    } else {
        PhotometricInterpretation::BlackIsZero
    };
    ifd.put(
        Tag::PhotometricInterpretation,
        TagValue::Shorts(vec![photometric.to_u16()]),
    );

    if image.indexed {
        if let Some(table) = &image.color_table {
            let flattened: Vec<u16> = table.iter().flatten().copied().collect();
            ifd.put(Tag::ColorMap, TagValue::Shorts(flattened));
        }
    }

    // axis calibration becomes the resolution rationals (pixels per cm)
    let scales = [
        (AxisType::X, Tag::XResolution),
        (AxisType::Y, Tag::YResolution),
    ];
    let mut calibrated = false;
    for (kind, tag) in scales {
        let scale = image
            .axes_planar()
            .iter()
            .find(|a| a.kind == kind)
            .and_then(|a| a.scale);
        if let Some(scale) = scale {
            if scale > 0.0 {
                let pixels_per_unit = ((1.0 / scale) * 1000.0).round() as u32;
                ifd.put(tag, TagValue::Rationals(vec![(pixels_per_unit, 1000)]));
                calibrated = true;
            }
        }
    }
    if calibrated {
        ifd.put(Tag::ResolutionUnit, TagValue::Shorts(vec![3]));
    }

    ifd
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::axes::{Axis, PixelType};
    use crate::io::MemoryHandle;
    use std::sync::Arc;

    fn gray_meta(width: u64, height: u64) -> DatasetMetadata {
        let image = ImageMetadata::new(
            vec![
                Axis::new(AxisType::X, width),
                Axis::new(AxisType::Y, height),
                Axis::new(AxisType::Time, 2),
            ],
            2,
            PixelType::Uint8,
        );
        DatasetMetadata {
            images: vec![Arc::new(image)],
            ..DatasetMetadata::default()
        }
    }

    #[test]
    fn rejects_sub_region_saves() {
        let meta = gray_meta(8, 8);
        let image = meta.images[0].clone();
        let writer = TiffWriter::new(
            BufferedStream::new(Box::new(MemoryHandle::writable())),
            meta,
            WriterConfig::default(),
        )
        .unwrap();
        let plane = Plane::populate(image, vec![0u8; 64], &[0, 0], &[8, 8]);
        assert!(matches!(
            writer.save_plane(0, 0, &plane, &[1, 0], &[7, 8]),
            Err(crate::SciioError::Usage(UsageError::InvalidAxisSpec))
        ));
    }

    #[test]
    fn rejects_wrong_buffer_size() {
        let meta = gray_meta(8, 8);
        let image = meta.images[0].clone();
        let writer = TiffWriter::new(
            BufferedStream::new(Box::new(MemoryHandle::writable())),
            meta,
            WriterConfig::default(),
        )
        .unwrap();
        let plane = Plane::populate(image, vec![0u8; 63], &[0, 0], &[8, 8]);
        assert!(writer.save_plane(0, 0, &plane, &[0, 0], &[8, 8]).is_err());
    }
}
