//! The reader surface: dataset opening, format dispatch, plane access.

use std::sync::Arc;

use log::warn;

use crate::axes::{check_plane_index, Axis, AxisType, DatasetMetadata, ImageMetadata, Plane};
use crate::config::{Config, ParserLevel};
use crate::decoder::comment;
use crate::decoder::image::{PlaneLayout, Region};
use crate::decoder::{Limits, TiffParser};
use crate::error::{FormatError, SciioResult, UsageError};
use crate::filters::PlaneSeparator;
use crate::ifd::{IfdChain, TagValue};
use crate::io::{
    BufferedStream, Bzip2Handle, FileHandle, GzipHandle, Location, LocationKind, LocationRegistry,
    MemoryHandle, SourceHandle, UrlHandle, ZipHandle,
};
use crate::tags::{PhotometricInterpretation, Tag};
use crate::util::check_suffix;

/// Suffixes whose siblings count as companion metadata files.
const COMPANION_SUFFIXES: &[&str] = &["xml", "txt"];

/// A reader over one parsed dataset.
///
/// Each reader owns its backing stream and directory model outright; close
/// releases them together.
pub trait Reader {
    fn metadata(&self) -> &DatasetMetadata;

    fn image_count(&self) -> usize {
        self.metadata().images.len()
    }

    fn plane_count(&self, image_index: usize) -> SciioResult<u64>;

    /// Opens the planar sub-region `offsets`/`lengths` of one plane. The
    /// vectors follow the image's planar axis order.
    fn open_plane(
        &mut self,
        image_index: usize,
        plane_index: u64,
        offsets: &[u64],
        lengths: &[u64],
        config: &Config,
    ) -> SciioResult<Plane>;

    /// Opens a whole plane.
    fn open_full_plane(
        &mut self,
        image_index: usize,
        plane_index: u64,
        config: &Config,
    ) -> SciioResult<Plane> {
        let meta = self
            .metadata()
            .get(image_index)
            .ok_or(UsageError::IndexOutOfRange {
                index: image_index as u64,
                count: self.metadata().images.len() as u64,
            })?
            .clone();
        let offsets = vec![0; meta.planar_count];
        let lengths = meta.planar_lengths();
        self.open_plane(image_index, plane_index, &offsets, &lengths, config)
    }

    /// Opens the thumbnail projection of a plane.
    fn open_thumb_plane(&mut self, image_index: usize, plane_index: u64) -> SciioResult<Plane>;

    fn close(&mut self) -> SciioResult<()>;
}

/// Reader for TIFF and BigTIFF datasets.
pub struct TiffReader {
    stream: BufferedStream,
    chain: IfdChain,
    meta: DatasetMetadata,
    limits: Limits,
}

impl TiffReader {
    pub fn new(stream: BufferedStream, config: &Config) -> SciioResult<Self> {
        let mut parser = TiffParser::new(stream)?;
        let limits = parser.limits().clone();
        let little = parser.byte_order().is_little();
        let mut chain = parser.read_ifds()?;
        let mut stream = parser.into_stream();
        if chain.is_empty() {
            return Err(FormatError::Format(String::from("empty directory chain")).into());
        }
        chain[0].validate_required()?;

        let layout = PlaneLayout::from_ifd(&chain[0])?;
        let pixel_type = layout.pixel_type(&chain[0])?;
        let multichannel = layout.samples > 1;

        let mut table = Vec::new();
        let info = comment::interpret(&mut chain, stream.length(), multichannel, &mut table)?;
        let (c, z, t) = comment::derive_axes(&info, chain.len() as u64, multichannel);

        // planar axes reflect the in-plane sample layout
        let mut axes = Vec::new();
        let mut interleaved_count = 0;
        let planar_count;
        if multichannel && layout.chunky {
            axes.push(Axis::new(AxisType::Channel, layout.samples as u64));
            axes.push(Axis::new(AxisType::X, layout.width));
            axes.push(Axis::new(AxisType::Y, layout.height));
            planar_count = 3;
            interleaved_count = 1;
        } else if multichannel {
            axes.push(Axis::new(AxisType::X, layout.width));
            axes.push(Axis::new(AxisType::Y, layout.height));
            axes.push(Axis::new(AxisType::Channel, layout.samples as u64));
            planar_count = 3;
        } else {
            axes.push(Axis::new(AxisType::X, layout.width));
            axes.push(Axis::new(AxisType::Y, layout.height));
            planar_count = 2;
        }
        if c > 1 {
            axes.push(Axis::new(AxisType::Channel, c));
        }
        if z > 1 {
            let mut axis = Axis::new(AxisType::Z, z);
            axis.scale = info.spacing;
            axes.push(axis);
        }
        if t > 1 {
            let mut axis = Axis::new(AxisType::Time, t);
            axis.scale = info.frame_interval;
            axes.push(axis);
        }

        calibrate(&mut axes, &chain[0]);

        let mut image = ImageMetadata::new(axes, planar_count, pixel_type);
        image.little_endian = little;
        image.bits_per_pixel = usize::from(layout.bit_depth);
        image.interleaved_count = interleaved_count;
        image.thumbnail = chain[0].get_uint_or(Tag::NewSubfileType, 0)? == 1;
        if chain[0].photometric_interpretation()? == PhotometricInterpretation::RGBPalette {
            image.indexed = true;
            image.color_table = color_table(&chain[0]);
        }

        let mut meta = DatasetMetadata {
            images: vec![Arc::new(image)],
            table,
            dataset_name: None,
            companion_file: None,
        };
        if config.parser_level != ParserLevel::Minimum {
            populate_table(&mut meta, &chain);
        }

        Ok(TiffReader {
            stream,
            chain,
            meta,
            limits,
        })
    }

    pub fn is_indexed(&self) -> bool {
        self.meta.images[0].indexed
    }

    pub fn ifd_count(&self) -> usize {
        self.chain.len()
    }

    fn region_from(
        meta: &ImageMetadata,
        offsets: &[u64],
        lengths: &[u64],
    ) -> SciioResult<Region> {
        let planar = meta.axes_planar();
        if offsets.len() != planar.len() || lengths.len() != planar.len() {
            return Err(UsageError::InvalidAxisSpec.into());
        }
        let mut region = Region {
            x: 0,
            y: 0,
            w: 1,
            h: 1,
            c: 0,
            nc: 1,
        };
        for (i, axis) in planar.iter().enumerate() {
            match axis.kind {
                AxisType::X => {
                    region.x = offsets[i];
                    region.w = lengths[i];
                }
                AxisType::Y => {
                    region.y = offsets[i];
                    region.h = lengths[i];
                }
                AxisType::Channel => {
                    region.c = offsets[i];
                    region.nc = lengths[i];
                }
                _ => return Err(UsageError::InvalidAxisSpec.into()),
            }
        }
        Ok(region)
    }
}

impl Reader for TiffReader {
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
        _config: &Config,
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

        let ifd = self
            .chain
            .get(plane_index as usize)
            .ok_or(UsageError::IndexOutOfRange {
                index: plane_index,
                count: self.chain.len() as u64,
            })?;
        let region = Self::region_from(&meta, offsets, lengths)?;
        let bytes =
            crate::decoder::image::open_region(&mut self.stream, ifd, plane_index, &region, &self.limits)?;
        Ok(Plane::populate(meta, bytes, offsets, lengths))
    }

    fn open_thumb_plane(&mut self, image_index: usize, plane_index: u64) -> SciioResult<Plane> {
        // thumbnails are served at full resolution
        self.open_full_plane(image_index, plane_index, &Config::default())
    }

    fn close(&mut self) -> SciioResult<()> {
        self.stream.close()
    }
}

fn calibrate(axes: &mut [Axis], ifd: &crate::ifd::Ifd) {
    // resolutions are pixels per unit; their inverse is the pixel size
    for (kind, resolution) in [
        (AxisType::X, ifd.x_resolution()),
        (AxisType::Y, ifd.y_resolution()),
    ] {
        let Some(resolution) = resolution else {
            continue;
        };
        if resolution > 0.0 && resolution.is_finite() {
            if let Some(axis) = axes.iter_mut().find(|a| a.kind == kind) {
                axis.scale = Some(1.0 / resolution);
            }
        } else {
            warn!("expected positive value for physical size; got {resolution}");
        }
    }
}

fn color_table(ifd: &crate::ifd::Ifd) -> Option<Vec<Vec<u16>>> {
    let TagValue::Shorts(values) = ifd.get(Tag::ColorMap)? else {
        return None;
    };
    if values.len() % 3 != 0 {
        return None;
    }
    let per_channel = values.len() / 3;
    Some(
        values
            .chunks(per_channel)
            .map(|chunk| chunk.to_vec())
            .collect(),
    )
}

/// Fills the free-form table from the first IFD the way the extended parser
/// level asks for.
fn populate_table(meta: &mut DatasetMetadata, chain: &IfdChain) {
    let first = &chain[0];
    for (tag, key) in [
        (Tag::Software, "Software"),
        (Tag::DateTime, "DateTime"),
        (Tag::Artist, "Artist"),
        (Tag::Make, "Instrument Make"),
        (Tag::Model, "Instrument Model"),
        (Tag::HostComputer, "HostComputer"),
        (Tag::Copyright, "Copyright"),
    ] {
        if let Ok(value) = first.get_string(tag) {
            meta.put(key, value.to_string());
        }
    }
    for (i, ifd) in chain.iter().enumerate() {
        if let Ok(name) = ifd.get_string(Tag::PageName) {
            meta.put(format!("PageName #{i}"), name.to_string());
        }
    }
    if let Ok(width) = first.image_width() {
        meta.put("ImageWidth", width.to_string());
    }
    if let Ok(length) = first.image_length() {
        meta.put("ImageLength", length.to_string());
    }
    if let Ok(bits) = first.bits_per_sample() {
        meta.put("BitsPerSample", format!("{}", bits[0]));
    }
    if let Ok(compression) = first.compression() {
        meta.put("Compression", format!("{compression:?}"));
    }

    // reusable proprietary tags may carry extra metadata
    for (id, value) in first.iter() {
        if id < 65_000 {
            continue;
        }
        let text = match value {
            TagValue::Ascii(s) => s.clone(),
            TagValue::Bytes(b) | TagValue::Undefined(b) => {
                String::from_utf8_lossy(b).replace('\0', "")
            }
            TagValue::Shorts(v) => v.iter().map(|&s| (s & 0xff) as u8 as char).collect(),
            _ => continue,
        };
        meta.put(id.to_string(), text);
    }
}

/// Opens the dataset behind `id` and assembles the configured reader stack.
///
/// The identifier is resolved through the registry (mapped in-memory
/// sources first, then aliases), the source kind is chosen from the
/// location and its suffix, and the enabled filters are stacked on top of
/// the parsed reader.
pub fn open(
    registry: &LocationRegistry,
    id: &str,
    config: &Config,
) -> SciioResult<Box<dyn Reader>> {
    let mapped = registry.get_mapped_id(id);

    let handle: Box<dyn SourceHandle> = if let Some(bytes) = registry.get_mapped_source(&mapped) {
        Box::new(MemoryHandle::new(bytes.as_ref().clone()))
    } else {
        let location = Location::new(registry, &mapped);
        let base: Box<dyn SourceHandle> = match location.kind() {
            LocationKind::Url => Box::new(UrlHandle::open(location.absolute_path())?),
            LocationKind::File => Box::new(FileHandle::open(location.absolute_path())?),
        };
        if check_suffix(&mapped, &["gz"]) {
            Box::new(GzipHandle::open(base)?)
        } else if check_suffix(&mapped, &["bz2"]) {
            Box::new(Bzip2Handle::open(base)?)
        } else if check_suffix(&mapped, &["zip"]) {
            Box::new(ZipHandle::open(base, None)?)
        } else {
            base
        }
    };

    let stream = BufferedStream::new(handle);
    let mut reader = TiffReader::new(stream, config)?;
    reader.meta.dataset_name = Some(mapped.clone());

    if config.group_files {
        reader.meta.companion_file = find_companion(registry, &mapped);
    }

    let mut reader: Box<dyn Reader> = Box::new(reader);
    if let Some(axes) = &config.plane_separator {
        reader = Box::new(PlaneSeparator::new(reader, axes.clone())?);
    }
    Ok(reader)
}

/// Looks for an `xml`/`txt` sibling sharing the dataset's stem.
fn find_companion(registry: &LocationRegistry, id: &str) -> Option<String> {
    let location = Location::new(registry, id);
    let parent = location.parent()?;
    let current = location.name();
    let listing = registry.list(parent.absolute_path(), false).ok()?;
    for file in listing.iter() {
        let stem = file.split('.').next().unwrap_or(file.as_str());
        if current.starts_with(stem) && check_suffix(file, COMPANION_SUFFIXES) {
            return Some(format!("{}/{}", parent.absolute_path(), file));
        }
    }
    None
}
