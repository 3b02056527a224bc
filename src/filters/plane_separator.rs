//! Logic to virtually split non-planar axes out of a parent reader's planes.

use std::sync::Arc;

use crate::axes::{
    check_plane_index, position_to_raster, raster_to_position, Axis, AxisType, DatasetMetadata,
    ImageMetadata, Plane,
};
use crate::config::Config;
use crate::error::{ResourceError, SciioResult, UsageError};
use crate::reader::Reader;
use crate::util::{safe_multiply_32, MAX_PLANE_BYTES};

/// Default budget for holding one uncombined parent plane in memory.
const DEFAULT_MEMORY_BUDGET: u64 = MAX_PLANE_BYTES;

/// A filter that converts chosen planar axes into non-planar ones,
/// synthesizing virtual planes from sub-regions of parent planes.
///
/// The derived metadata moves the separated axis kinds to the front of the
/// non-planar tail; `offset` counts them, and the leading `offset`
/// components of a virtual plane's coordinate vector select the separated
/// position. A single-slot cache holds the last uncombined parent plane.
pub struct PlaneSeparator {
    parent: Box<dyn Reader>,
    meta: DatasetMetadata,
    separated: Vec<AxisType>,
    memory_budget: u64,

    last_plane: Option<Plane>,
    last_plane_index: Option<u64>,
    last_image_index: Option<usize>,
    last_offsets: Vec<u64>,
    last_lengths: Vec<u64>,
}

impl PlaneSeparator {
    /// Wraps `parent`, separating every axis in `kinds` that is planar in
    /// the parent. Separating the X or Y axis is rejected.
    pub fn new(parent: Box<dyn Reader>, kinds: Vec<AxisType>) -> SciioResult<Self> {
        if kinds
            .iter()
            .any(|&kind| kind == AxisType::X || kind == AxisType::Y)
        {
            return Err(UsageError::InvalidAxisSpec.into());
        }

        let mut images = Vec::with_capacity(parent.metadata().images.len());
        let mut separated = Vec::new();
        for parent_image in &parent.metadata().images {
            let (derived, kinds_here) = derive_metadata(parent_image, &kinds);
            if images.is_empty() {
                separated = kinds_here;
            }
            images.push(Arc::new(derived));
        }

        let meta = DatasetMetadata {
            images,
            table: parent.metadata().table.clone(),
            dataset_name: parent.metadata().dataset_name.clone(),
            companion_file: parent.metadata().companion_file.clone(),
        };

        Ok(PlaneSeparator {
            parent,
            meta,
            separated,
            memory_budget: DEFAULT_MEMORY_BUDGET,
            last_plane: None,
            last_plane_index: None,
            last_image_index: None,
            last_offsets: Vec::new(),
            last_lengths: Vec::new(),
        })
    }

    /// The wrapped reader.
    pub fn parent(&self) -> &dyn Reader {
        &*self.parent
    }

    /// Axis kinds this filter actually separates.
    pub fn separated_axes(&self) -> &[AxisType] {
        &self.separated
    }

    /// Number of axes split out of the parent's planar prefix.
    pub fn offset(&self) -> usize {
        self.separated.len()
    }

    /// Caps the bytes the filter may spend on one uncombined parent plane;
    /// larger planes are fetched strip by strip.
    pub fn set_memory_budget(&mut self, budget: u64) {
        self.memory_budget = budget;
    }

    /// Maps a virtual plane index back to the parent plane it draws from.
    ///
    /// Pure in the mathematical sense: the first `offset` components of the
    /// derived coordinate vector (the separated position) are dropped and
    /// the rest is rasterized over the parent's non-planar lengths.
    pub fn get_original_index(&self, image_index: usize, plane_index: u64) -> u64 {
        let Some(meta) = self.meta.get(image_index) else {
            return plane_index;
        };
        let Some(parent_meta) = self.parent.metadata().get(image_index) else {
            return plane_index;
        };
        if meta.plane_count() == parent_meta.plane_count() {
            return plane_index;
        }
        let coords = raster_to_position(&meta.non_planar_lengths(), plane_index);
        let offset = self.offset();
        let parent_lengths = parent_meta.non_planar_lengths();
        position_to_raster(&parent_lengths, &coords[offset..])
    }

    fn invalidate_cache(&mut self) {
        self.last_plane = None;
        self.last_plane_index = None;
        self.last_image_index = None;
        self.last_offsets.clear();
        self.last_lengths.clear();
    }

    /// Exact-match cache test: parent plane, image, and both the starting
    /// and ending positions of every axis must agree. Sub-region reuse is
    /// not supported.
    fn have_cached(
        &self,
        source: u64,
        image_index: usize,
        offsets: &[u64],
        lengths: &[u64],
    ) -> bool {
        if self.last_plane.is_none()
            || self.last_plane_index != Some(source)
            || self.last_image_index != Some(image_index)
        {
            return false;
        }
        if self.last_offsets.len() != offsets.len() || self.last_lengths.len() != lengths.len() {
            return false;
        }
        offsets.iter().enumerate().all(|(i, &o)| {
            o == self.last_offsets[i] && o + lengths[i] == self.last_offsets[i] + self.last_lengths[i]
        })
    }

    /// Translates virtual planar offsets/lengths into the parent's planar
    /// coordinate space: axes that remain planar copy through; split axes
    /// are requested as their full span.
    fn to_parent_region(
        &self,
        image_index: usize,
        offsets: &[u64],
        lengths: &[u64],
    ) -> SciioResult<(Vec<u64>, Vec<u64>)> {
        let meta = &self.meta.images[image_index];
        let parent_meta = &self.parent.metadata().images[image_index];

        let parent_planar = parent_meta.axes_planar();
        let mut parent_offsets = vec![0u64; parent_planar.len()];
        let mut parent_lengths = vec![0u64; parent_planar.len()];
        for (pi, axis) in parent_planar.iter().enumerate() {
            match meta.axis_index(axis.kind) {
                Some(ci) if ci < meta.planar_count => {
                    if ci >= offsets.len() || ci >= lengths.len() {
                        return Err(UsageError::InvalidAxisSpec.into());
                    }
                    parent_offsets[pi] = offsets[ci];
                    parent_lengths[pi] = lengths[ci];
                }
                _ => {
                    parent_offsets[pi] = 0;
                    parent_lengths[pi] = axis.length;
                }
            }
        }
        Ok((parent_offsets, parent_lengths))
    }
}

/// Builds the derived image metadata: separated planar axes move to the
/// front of the non-planar tail.
fn derive_metadata(parent: &ImageMetadata, kinds: &[AxisType]) -> (ImageMetadata, Vec<AxisType>) {
    let mut separated = Vec::new();
    for &kind in kinds {
        if let Some(index) = parent.axis_index(kind) {
            if index < parent.planar_count {
                separated.push(kind);
            }
        }
    }

    let mut axes = Vec::with_capacity(parent.axes.len());
    let mut split_axes = Vec::new();
    for axis in parent.axes_planar() {
        if separated.contains(&axis.kind) {
            split_axes.push(axis.clone());
        } else {
            axes.push(axis.clone());
        }
    }
    let planar_count = axes.len();
    axes.extend(split_axes);
    axes.extend(parent.axes_non_planar().iter().cloned());

    let mut derived = ImageMetadata::new(axes, planar_count, parent.pixel_type);
    derived.little_endian = parent.little_endian;
    derived.indexed = parent.indexed;
    derived.bits_per_pixel = parent.bits_per_pixel;
    derived.color_table = parent.color_table.clone();
    derived.thumbnail = parent.thumbnail;
    // splitting the interleaved channel axis leaves plain rasters behind
    derived.interleaved_count = if separated.is_empty() {
        parent.interleaved_count
    } else {
        0
    };
    (derived, separated)
}

/// Extracts one separated position from an uncombined parent buffer.
///
/// `pos`/`lengths` locate the separated coordinate among `n` interleaved or
/// contiguous channel blocks; `bytes` is the pixel width in bytes and
/// `out_len` the byte size of one extracted channel.
fn split_channels(
    parent: &[u8],
    out: &mut [u8],
    pos: &[u64],
    lengths: &[u64],
    bytes: usize,
    reverse: bool,
    interleaved: bool,
    out_len: usize,
) {
    let n_channels: u64 = lengths.iter().product::<u64>().max(1);
    let mut channel = position_to_raster(lengths, pos);
    if reverse {
        channel = n_channels - 1 - channel;
    }

    if interleaved {
        let pixels = out_len / bytes;
        for i in 0..pixels {
            let src = (i * n_channels as usize + channel as usize) * bytes;
            let dst = i * bytes;
            if src + bytes <= parent.len() && dst + bytes <= out.len() {
                out[dst..dst + bytes].copy_from_slice(&parent[src..src + bytes]);
            }
        }
    } else {
        let src = channel as usize * out_len;
        let end = (src + out_len).min(parent.len());
        if src < end {
            out[..end - src].copy_from_slice(&parent[src..end]);
        }
    }
}

impl Reader for PlaneSeparator {
    fn metadata(&self) -> &DatasetMetadata {
        &self.meta
    }

    fn plane_count(&self, image_index: usize) -> SciioResult<u64> {
        let meta = self
            .meta
            .get(image_index)
            .ok_or(UsageError::IndexOutOfRange {
                index: image_index as u64,
                count: self.meta.images.len() as u64,
            })?;
        Ok(meta.plane_count())
    }

    fn open_plane(
        &mut self,
        image_index: usize,
        plane_index: u64,
        offsets: &[u64],
        lengths: &[u64],
        config: &Config,
    ) -> SciioResult<Plane> {
        let meta = self
            .meta
            .get(image_index)
            .ok_or(UsageError::IndexOutOfRange {
                index: image_index as u64,
                count: self.meta.images.len() as u64,
            })?
            .clone();
        check_plane_index(&meta, plane_index)?;

        let parent_meta = self.parent.metadata().images[image_index].clone();

        // palette expansion is a downstream concern
        if parent_meta.indexed {
            return self
                .parent
                .open_plane(image_index, plane_index, offsets, lengths, config);
        }

        let source = self.get_original_index(image_index, plane_index);
        let offset = self.offset();
        let interleaved = parent_meta.interleaved_count > 0;
        let bpp = meta.pixel_type.bytes_per_pixel();

        let coords = raster_to_position(&meta.non_planar_lengths(), plane_index);
        let separated_position = coords[..offset].to_vec();
        let separated_lengths: Vec<u64> = meta.non_planar_lengths()[..offset].to_vec();

        let out_len = safe_multiply_32(lengths)? * bpp;
        let mut plane = Plane::new(meta.clone(), offsets, lengths)?;

        if self.have_cached(source, image_index, offsets, lengths) {
            let cached = self.last_plane.as_ref().expect("cache verified");
            split_channels(
                cached.bytes(),
                plane.bytes_mut(),
                &separated_position,
                &separated_lengths,
                bpp,
                false,
                interleaved,
                out_len,
            );
            return Ok(plane);
        }

        let (parent_offsets, parent_lengths) =
            self.to_parent_region(image_index, offsets, lengths)?;

        // the Y extent of the request decides how the fetch is chunked
        let y_index = meta
            .axes_planar()
            .iter()
            .position(|a| a.kind == AxisType::Y)
            .ok_or(UsageError::InvalidAxisSpec)?;
        let parent_y = parent_meta
            .axes_planar()
            .iter()
            .position(|a| a.kind == AxisType::Y)
            .ok_or(UsageError::InvalidAxisSpec)?;
        let h = lengths[y_index];

        let parent_plane_bytes = parent_meta.plane_size();
        let mut strips = 1u64;
        if parent_plane_bytes > self.memory_budget || parent_plane_bytes > MAX_PLANE_BYTES {
            strips = (h as f64).sqrt().floor() as u64;
        }
        if strips == 0 {
            return Err(ResourceError::OutOfMemoryPlane {
                image: image_index,
                plane: plane_index,
            }
            .into());
        }

        let strip_height = h / strips;
        let last_strip_height = strip_height + (h - strip_height * strips);
        if strip_height == 0 {
            return Err(ResourceError::OutOfMemoryPlane {
                image: image_index,
                plane: plane_index,
            }
            .into());
        }

        // bytes of one extracted channel row span
        let row_len: u64 = lengths
            .iter()
            .enumerate()
            .filter(|&(i, _)| i != y_index)
            .map(|(_, &l)| l)
            .product();

        for i in 0..strips {
            let rows = if i == strips - 1 {
                last_strip_height
            } else {
                strip_height
            };
            let mut strip_offsets = parent_offsets.clone();
            let mut strip_lengths = parent_lengths.clone();
            strip_offsets[parent_y] = parent_offsets[parent_y] + i * strip_height;
            strip_lengths[parent_y] = rows;

            let parent_plane = self.parent.open_plane(
                image_index,
                source,
                &strip_offsets,
                &strip_lengths,
                config,
            )?;

            let strip_len = (rows * row_len) as usize * bpp;
            let mut strip = vec![0u8; strip_len];
            split_channels(
                parent_plane.bytes(),
                &mut strip,
                &separated_position,
                &separated_lengths,
                bpp,
                false,
                interleaved,
                strip_len,
            );
            let dst = (i * strip_height * row_len) as usize * bpp;
            plane.bytes_mut()[dst..dst + strip_len].copy_from_slice(&strip);

            if strips == 1 {
                // cache the uncombined parent plane under the requested key
                self.last_plane = Some(parent_plane);
                self.last_plane_index = Some(source);
                self.last_image_index = Some(image_index);
                self.last_offsets = offsets.to_vec();
                self.last_lengths = lengths.to_vec();
            }
        }
        if strips > 1 {
            // a strip-wise fetch never materialized the full parent plane
            self.invalidate_cache();
        }

        Ok(plane)
    }

    fn open_thumb_plane(&mut self, image_index: usize, plane_index: u64) -> SciioResult<Plane> {
        let meta = self
            .meta
            .get(image_index)
            .ok_or(UsageError::IndexOutOfRange {
                index: image_index as u64,
                count: self.meta.images.len() as u64,
            })?
            .clone();
        check_plane_index(&meta, plane_index)?;

        let source = self.get_original_index(image_index, plane_index);
        let thumb = self.parent.open_thumb_plane(image_index, source)?;

        let offset = self.offset();
        let coords = raster_to_position(&meta.non_planar_lengths(), plane_index);
        let separated_position = coords[..offset].to_vec();
        let separated_lengths: Vec<u64> = meta.non_planar_lengths()[..offset].to_vec();
        let interleaved = self.parent.metadata().images[image_index].interleaved_count > 0;
        let bpp = meta.pixel_type.bytes_per_pixel();

        let offsets = vec![0u64; meta.planar_count];
        let lengths = meta.planar_lengths();
        let out_len = safe_multiply_32(&lengths)? * bpp;
        let mut plane = Plane::new(meta, &offsets, &lengths)?;
        split_channels(
            thumb.bytes(),
            plane.bytes_mut(),
            &separated_position,
            &separated_lengths,
            bpp,
            false,
            interleaved,
            out_len,
        );
        Ok(plane)
    }

    fn close(&mut self) -> SciioResult<()> {
        self.invalidate_cache();
        self.parent.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_channels_interleaved_extracts_middle_byte() {
        // rgb rgb rgb rgb
        let parent: Vec<u8> = (0..12u8).collect();
        let mut out = vec![0u8; 4];
        split_channels(&parent, &mut out, &[1], &[3], 1, false, true, 4);
        assert_eq!(out, vec![1, 4, 7, 10]);
    }

    #[test]
    fn split_channels_contiguous_blocks() {
        // rrrr gggg bbbb
        let parent: Vec<u8> = (0..12u8).collect();
        let mut out = vec![0u8; 4];
        split_channels(&parent, &mut out, &[2], &[3], 1, false, false, 4);
        assert_eq!(out, vec![8, 9, 10, 11]);
    }

    #[test]
    fn split_channels_reverse_flips_order() {
        let parent: Vec<u8> = (0..6u8).collect();
        let mut out = vec![0u8; 2];
        split_channels(&parent, &mut out, &[0], &[3], 1, true, true, 2);
        assert_eq!(out, vec![2, 5]);
    }

    #[test]
    fn split_channels_multibyte_pixels() {
        // two-byte samples, two channels interleaved
        let parent: Vec<u8> = vec![0, 1, 10, 11, 2, 3, 12, 13];
        let mut out = vec![0u8; 4];
        split_channels(&parent, &mut out, &[1], &[2], 2, false, true, 4);
        assert_eq!(out, vec![10, 11, 12, 13]);
    }
}
