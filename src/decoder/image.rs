//! Strip and tile reassembly: turning one IFD's fragments into plane bytes.

use crate::axes::PixelType;
use crate::codec::{self, CodecOptions};
use crate::error::{FormatError, SciioResult, UsageError};
use crate::ifd::Ifd;
use crate::io::BufferedStream;
use crate::tags::{CompressionMethod, PlanarConfiguration, Predictor, SampleFormat, Tag};
use crate::util;

use super::{rev_hpredict, Limits};

/// The pixel geometry of one IFD, interpreted once per plane open.
#[derive(Clone, Debug)]
pub struct PlaneLayout {
    pub width: u64,
    pub height: u64,
    pub samples: usize,
    pub bit_depth: u8,
    pub chunky: bool,
    pub compression: CompressionMethod,
    pub predictor: Predictor,
}

impl PlaneLayout {
    pub fn from_ifd(ifd: &Ifd) -> SciioResult<Self> {
        let bits = ifd.bits_per_sample()?;
        let bit_depth = bits.first().copied().unwrap_or(8) as u8;
        if bits.iter().any(|&b| b as u8 != bit_depth) {
            return Err(
                FormatError::Format(format!("inconsistent bits per sample: {bits:?}")).into(),
            );
        }
        Ok(PlaneLayout {
            width: ifd.image_width()?,
            height: ifd.image_length()?,
            samples: ifd.samples_per_pixel()? as usize,
            bit_depth,
            chunky: ifd.planar_configuration()? == PlanarConfiguration::Chunky,
            compression: ifd.compression()?,
            predictor: ifd.predictor()?,
        })
    }

    pub fn bytes_per_sample(&self) -> usize {
        (usize::from(self.bit_depth) / 8).max(1)
    }

    /// Resolves the pixel type from bit depth and sample format.
    pub fn pixel_type(&self, ifd: &Ifd) -> SciioResult<PixelType> {
        let format = ifd.get_uint_or(Tag::SampleFormat, 1)? as u16;
        let format = SampleFormat::from_u16_exhaustive(format);
        match (format, self.bit_depth) {
            (SampleFormat::Uint | SampleFormat::Void | SampleFormat::Unknown(_), 1..=8) => {
                Ok(PixelType::Uint8)
            }
            (SampleFormat::Uint | SampleFormat::Void | SampleFormat::Unknown(_), 16) => {
                Ok(PixelType::Uint16)
            }
            (SampleFormat::Uint | SampleFormat::Void | SampleFormat::Unknown(_), 32) => {
                Ok(PixelType::Uint32)
            }
            (SampleFormat::Int, 1..=8) => Ok(PixelType::Int8),
            (SampleFormat::Int, 16) => Ok(PixelType::Int16),
            (SampleFormat::Int, 32) => Ok(PixelType::Int32),
            (SampleFormat::IEEEFP, 32) => Ok(PixelType::Float32),
            (SampleFormat::IEEEFP, 64) => Ok(PixelType::Float64),
            (_, depth) => {
                Err(FormatError::Format(format!("unsupported sample layout: {depth} bits")).into())
            }
        }
    }
}

/// A planar sub-region request in pixel coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region {
    pub x: u64,
    pub y: u64,
    pub w: u64,
    pub h: u64,
    /// First component and component count of the request.
    pub c: u64,
    pub nc: u64,
}

impl Region {
    pub fn full(layout: &PlaneLayout) -> Region {
        Region {
            x: 0,
            y: 0,
            w: layout.width,
            h: layout.height,
            c: 0,
            nc: layout.samples as u64,
        }
    }

    fn validate(&self, layout: &PlaneLayout) -> SciioResult<()> {
        let fits = self.w > 0
            && self.h > 0
            && self.nc > 0
            && self.x + self.w <= layout.width
            && self.y + self.h <= layout.height
            && self.c + self.nc <= layout.samples as u64;
        if !fits {
            return Err(UsageError::InvalidAxisSpec.into());
        }
        Ok(())
    }
}

/// Opens the requested sub-region of the plane described by `ifd`.
///
/// Output layout matches the file's: interleaved components for chunky
/// files, component-major for planar files. Bytes stay in the file's byte
/// order.
pub fn open_region(
    stream: &mut BufferedStream,
    ifd: &Ifd,
    plane_index: u64,
    region: &Region,
    limits: &Limits,
) -> SciioResult<Vec<u8>> {
    let layout = PlaneLayout::from_ifd(ifd)?;
    region.validate(&layout)?;

    let bps = layout.bytes_per_sample();
    let out_len = util::safe_multiply_32(&[region.w, region.h, region.nc])? * bps;
    if out_len > limits.plane_size {
        return Err(FormatError::Format(String::from("plane exceeds the size limit")).into());
    }
    let mut out = vec![0u8; out_len];

    if ifd.is_tiled() {
        assemble_tiles(stream, ifd, &layout, plane_index, region, &mut out)?;
    } else {
        assemble_strips(stream, ifd, &layout, plane_index, region, &mut out)?;
    }
    Ok(out)
}

/// Reads and decodes one compressed fragment, padding shortfalls with zeros.
fn read_fragment(
    stream: &mut BufferedStream,
    layout: &PlaneLayout,
    plane_index: u64,
    offset: u64,
    byte_count: u64,
    expected_len: usize,
    row_samples: usize,
) -> SciioResult<Vec<u8>> {
    if offset + byte_count > stream.length() {
        return Err(FormatError::TruncatedPlane(plane_index).into());
    }
    stream.seek(offset)?;
    let mut compressed = vec![0u8; byte_count as usize];
    stream.read_exact(&mut compressed)?;

    let codec = codec::for_method(layout.compression)?;
    let mut bytes =
        codec.decompress(&compressed, &CodecOptions::with_expected_len(expected_len))?;
    bytes.resize(expected_len, 0);

    if layout.predictor == Predictor::Horizontal {
        let samples = if layout.chunky { layout.samples } else { 1 };
        rev_hpredict(
            &mut bytes,
            layout.bit_depth,
            samples,
            row_samples,
            stream.order().is_little(),
        );
    }
    Ok(bytes)
}

fn assemble_strips(
    stream: &mut BufferedStream,
    ifd: &Ifd,
    layout: &PlaneLayout,
    plane_index: u64,
    region: &Region,
    out: &mut [u8],
) -> SciioResult<()> {
    let offsets = ifd.strip_offsets()?;
    let counts = ifd.strip_byte_counts()?;
    if offsets.len() != counts.len() || offsets.is_empty() {
        return Err(FormatError::BadStripLayout.into());
    }

    let rows_per_strip = ifd.rows_per_strip()?.max(1);
    let strips_per_comp = layout.height.div_ceil(rows_per_strip) as usize;
    let comps = if layout.chunky {
        1
    } else {
        layout.samples
    };
    if offsets.len() < strips_per_comp * comps {
        return Err(FormatError::BadStripLayout.into());
    }

    let bps = layout.bytes_per_sample();
    let row_samples = layout.width as usize * if layout.chunky { layout.samples } else { 1 };

    let comp_range = if layout.chunky {
        0..1u64
    } else {
        region.c..region.c + region.nc
    };
    for comp in comp_range {
        for strip in 0..strips_per_comp as u64 {
            let strip_y0 = strip * rows_per_strip;
            let strip_rows = rows_per_strip.min(layout.height - strip_y0);
            let y0 = region.y.max(strip_y0);
            let y1 = (region.y + region.h).min(strip_y0 + strip_rows);
            if y0 >= y1 {
                continue;
            }

            let index = comp as usize * strips_per_comp + strip as usize;
            let expected = strip_rows as usize * row_samples * bps;
            let fragment = read_fragment(
                stream,
                layout,
                plane_index,
                offsets[index],
                counts[index],
                expected,
                row_samples,
            )?;

            for y in y0..y1 {
                copy_row(layout, region, &fragment, out, y, strip_y0, 0, layout.width, comp);
            }
        }
    }
    Ok(())
}

fn assemble_tiles(
    stream: &mut BufferedStream,
    ifd: &Ifd,
    layout: &PlaneLayout,
    plane_index: u64,
    region: &Region,
    out: &mut [u8],
) -> SciioResult<()> {
    let offsets = ifd.tile_offsets()?;
    let counts = ifd.tile_byte_counts()?;
    let tile_width = ifd.tile_width()?.max(1);
    let tile_length = ifd.tile_length()?.max(1);

    let grid_w = layout.width.div_ceil(tile_width) as usize;
    let grid_h = layout.height.div_ceil(tile_length) as usize;
    let tiles_per_comp = grid_w * grid_h;
    let comps = if layout.chunky {
        1
    } else {
        layout.samples
    };
    if offsets.len() != counts.len() || offsets.len() < tiles_per_comp * comps {
        return Err(FormatError::BadTileLayout.into());
    }

    let bps = layout.bytes_per_sample();
    let tile_row_samples = tile_width as usize * if layout.chunky { layout.samples } else { 1 };

    let comp_range = if layout.chunky {
        0..1u64
    } else {
        region.c..region.c + region.nc
    };
    for comp in comp_range {
        for tile in 0..tiles_per_comp {
            let tile_x0 = (tile % grid_w) as u64 * tile_width;
            let tile_y0 = (tile / grid_w) as u64 * tile_length;
            let x0 = region.x.max(tile_x0);
            let x1 = (region.x + region.w).min(tile_x0 + tile_width);
            let y0 = region.y.max(tile_y0);
            let y1 = (region.y + region.h).min(tile_y0 + tile_length);
            if x0 >= x1 || y0 >= y1 {
                continue;
            }

            let index = comp as usize * tiles_per_comp + tile;
            // tiles are always padded to the full tile size
            let expected = tile_length as usize * tile_row_samples * bps;
            let fragment = read_fragment(
                stream,
                layout,
                plane_index,
                offsets[index],
                counts[index],
                expected,
                tile_row_samples,
            )?;

            for y in y0..y1 {
                copy_row(layout, region, &fragment, out, y, tile_y0, tile_x0, tile_width, comp);
            }
        }
    }
    Ok(())
}

/// Copies the requested span of row `y` from a decoded fragment into the
/// output buffer.
#[allow(clippy::too_many_arguments)]
fn copy_row(
    layout: &PlaneLayout,
    region: &Region,
    fragment: &[u8],
    out: &mut [u8],
    y: u64,
    frag_y0: u64,
    frag_x0: u64,
    frag_width: u64,
    comp: u64,
) {
    let bps = layout.bytes_per_sample();
    let x0 = region.x.max(frag_x0);
    let x1 = (region.x + region.w).min(frag_x0 + frag_width);
    if x0 >= x1 {
        return;
    }
    let span = (x1 - x0) as usize;

    if layout.chunky {
        let pixel = layout.samples * bps;
        let out_pixel = region.nc as usize * bps;
        let src_row = ((y - frag_y0) * frag_width + (x0 - frag_x0)) as usize * pixel;
        let dst_row =
            (((y - region.y) * region.w) + (x0 - region.x)) as usize * out_pixel;
        if region.c == 0 && region.nc as usize == layout.samples {
            out[dst_row..dst_row + span * pixel]
                .copy_from_slice(&fragment[src_row..src_row + span * pixel]);
        } else {
            for px in 0..span {
                let src = src_row + px * pixel + region.c as usize * bps;
                let dst = dst_row + px * out_pixel;
                out[dst..dst + out_pixel].copy_from_slice(&fragment[src..src + out_pixel]);
            }
        }
    } else {
        // component-major output: [nc][h][w]
        let ci = (comp - region.c) as usize;
        let src =
            ((y - frag_y0) * frag_width + (x0 - frag_x0)) as usize * bps;
        let dst = ((ci as u64 * region.h + (y - region.y)) * region.w + (x0 - region.x)) as usize
            * bps;
        out[dst..dst + span * bps].copy_from_slice(&fragment[src..src + span * bps]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ifd::TagValue;
    use crate::io::{BufferedStream, MemoryHandle};

    /// Builds a raw in-memory "file" holding only pixel data at offset 8,
    /// with an IFD describing it.
    fn gray_fixture(width: u64, height: u64, rows_per_strip: u64) -> (BufferedStream, Ifd) {
        let mut bytes = vec![0u8; 8];
        for i in 0..(width * height) {
            bytes.push((i % 251) as u8);
        }
        let strips = height.div_ceil(rows_per_strip);
        let mut offsets = Vec::new();
        let mut counts = Vec::new();
        for s in 0..strips {
            let rows = rows_per_strip.min(height - s * rows_per_strip);
            offsets.push((8 + s * rows_per_strip * width) as u32);
            counts.push((rows * width) as u32);
        }

        let mut ifd = Ifd::new();
        ifd.put(Tag::ImageWidth, TagValue::Longs(vec![width as u32]));
        ifd.put(Tag::ImageLength, TagValue::Longs(vec![height as u32]));
        ifd.put(Tag::BitsPerSample, TagValue::Shorts(vec![8]));
        ifd.put(Tag::Compression, TagValue::Shorts(vec![1]));
        ifd.put(Tag::PhotometricInterpretation, TagValue::Shorts(vec![1]));
        ifd.put(Tag::RowsPerStrip, TagValue::Longs(vec![rows_per_strip as u32]));
        ifd.put(Tag::StripOffsets, TagValue::Longs(offsets));
        ifd.put(Tag::StripByteCounts, TagValue::Longs(counts));

        let stream = BufferedStream::new(Box::new(MemoryHandle::new(bytes)));
        (stream, ifd)
    }

    #[test]
    fn full_plane_matches_source() {
        let (mut stream, ifd) = gray_fixture(16, 16, 4);
        let layout = PlaneLayout::from_ifd(&ifd).unwrap();
        let out = open_region(
            &mut stream,
            &ifd,
            0,
            &Region::full(&layout),
            &Limits::default(),
        )
        .unwrap();
        let expected: Vec<u8> = (0..256u64).map(|i| (i % 251) as u8).collect();
        assert_eq!(out, expected);
    }

    #[test]
    fn sub_region_straddles_strips() {
        let (mut stream, ifd) = gray_fixture(16, 16, 4);
        let region = Region {
            x: 3,
            y: 2,
            w: 5,
            h: 9,
            c: 0,
            nc: 1,
        };
        let out = open_region(&mut stream, &ifd, 0, &region, &Limits::default()).unwrap();
        assert_eq!(out.len(), 45);
        for row in 0..9u64 {
            for col in 0..5u64 {
                let src = (2 + row) * 16 + 3 + col;
                assert_eq!(out[(row * 5 + col) as usize], (src % 251) as u8);
            }
        }
    }

    #[test]
    fn out_of_bounds_region_rejected() {
        let (mut stream, ifd) = gray_fixture(16, 16, 16);
        let region = Region {
            x: 10,
            y: 0,
            w: 7,
            h: 16,
            c: 0,
            nc: 1,
        };
        assert!(matches!(
            open_region(&mut stream, &ifd, 0, &region, &Limits::default()),
            Err(crate::SciioError::Usage(UsageError::InvalidAxisSpec))
        ));
    }

    #[test]
    fn truncated_strip_detected() {
        let (mut stream, mut ifd) = gray_fixture(16, 16, 16);
        ifd.put(Tag::StripOffsets, TagValue::Longs(vec![100_000]));
        let layout = PlaneLayout::from_ifd(&ifd).unwrap();
        assert!(matches!(
            open_region(
                &mut stream,
                &ifd,
                3,
                &Region::full(&layout),
                &Limits::default()
            ),
            Err(crate::SciioError::Format(FormatError::TruncatedPlane(3)))
        ));
    }

    /// 16x16 gray image cut into four 8x8 tiles, row-major.
    fn tiled_fixture() -> (BufferedStream, Ifd, Vec<u8>) {
        let (width, height, tile) = (16u64, 16u64, 8u64);
        let grid = (width / tile) as usize;

        let mut expected = vec![0u8; (width * height) as usize];
        let mut bytes = vec![0u8; 8];
        let mut offsets = Vec::new();
        let mut counts = Vec::new();
        for t in 0..grid * grid {
            offsets.push(bytes.len() as u32);
            counts.push((tile * tile) as u32);
            let (tx, ty) = ((t % grid) as u64 * tile, (t / grid) as u64 * tile);
            for row in 0..tile {
                for col in 0..tile {
                    let value = ((t as u64 * tile * tile + row * tile + col) % 251) as u8;
                    bytes.push(value);
                    expected[((ty + row) * width + tx + col) as usize] = value;
                }
            }
        }

        let mut ifd = Ifd::new();
        ifd.put(Tag::ImageWidth, TagValue::Longs(vec![width as u32]));
        ifd.put(Tag::ImageLength, TagValue::Longs(vec![height as u32]));
        ifd.put(Tag::BitsPerSample, TagValue::Shorts(vec![8]));
        ifd.put(Tag::Compression, TagValue::Shorts(vec![1]));
        ifd.put(Tag::PhotometricInterpretation, TagValue::Shorts(vec![1]));
        ifd.put(Tag::TileWidth, TagValue::Longs(vec![tile as u32]));
        ifd.put(Tag::TileLength, TagValue::Longs(vec![tile as u32]));
        ifd.put(Tag::TileOffsets, TagValue::Longs(offsets));
        ifd.put(Tag::TileByteCounts, TagValue::Longs(counts));

        let stream = BufferedStream::new(Box::new(MemoryHandle::new(bytes)));
        (stream, ifd, expected)
    }

    #[test]
    fn tiles_reassemble_row_major() {
        let (mut stream, ifd, expected) = tiled_fixture();
        let layout = PlaneLayout::from_ifd(&ifd).unwrap();
        let out = open_region(
            &mut stream,
            &ifd,
            0,
            &Region::full(&layout),
            &Limits::default(),
        )
        .unwrap();
        assert_eq!(out, expected);
    }

    #[test]
    fn tile_sub_region_straddles_the_grid() {
        let (mut stream, ifd, expected) = tiled_fixture();
        let region = Region {
            x: 5,
            y: 6,
            w: 7,
            h: 6,
            c: 0,
            nc: 1,
        };
        let out = open_region(&mut stream, &ifd, 0, &region, &Limits::default()).unwrap();
        for row in 0..6u64 {
            for col in 0..7u64 {
                assert_eq!(
                    out[(row * 7 + col) as usize],
                    expected[((6 + row) * 16 + 5 + col) as usize],
                    "mismatch at ({col}, {row})"
                );
            }
        }
    }

    /// Two-component planar-configuration-2 image: one strip per component.
    fn planar_fixture() -> (BufferedStream, Ifd) {
        let (width, height) = (16u32, 16u32);
        let comp = (width * height) as usize;
        let mut bytes = vec![0u8; 8];
        bytes.extend((0..comp).map(|i| (i % 251) as u8)); // component 0
        bytes.extend((0..comp).map(|i| ((i + 100) % 251) as u8)); // component 1

        let mut ifd = Ifd::new();
        ifd.put(Tag::ImageWidth, TagValue::Longs(vec![width]));
        ifd.put(Tag::ImageLength, TagValue::Longs(vec![height]));
        ifd.put(Tag::BitsPerSample, TagValue::Shorts(vec![8, 8]));
        ifd.put(Tag::Compression, TagValue::Shorts(vec![1]));
        ifd.put(Tag::PhotometricInterpretation, TagValue::Shorts(vec![1]));
        ifd.put(Tag::SamplesPerPixel, TagValue::Shorts(vec![2]));
        ifd.put(Tag::PlanarConfiguration, TagValue::Shorts(vec![2]));
        ifd.put(Tag::RowsPerStrip, TagValue::Longs(vec![height]));
        ifd.put(
            Tag::StripOffsets,
            TagValue::Longs(vec![8, 8 + comp as u32]),
        );
        ifd.put(
            Tag::StripByteCounts,
            TagValue::Longs(vec![comp as u32, comp as u32]),
        );

        let stream = BufferedStream::new(Box::new(MemoryHandle::new(bytes)));
        (stream, ifd)
    }

    #[test]
    fn planar_components_select_independently() {
        let (mut stream, ifd) = planar_fixture();
        let second = Region {
            x: 0,
            y: 0,
            w: 16,
            h: 16,
            c: 1,
            nc: 1,
        };
        let out = open_region(&mut stream, &ifd, 0, &second, &Limits::default()).unwrap();
        assert_eq!(out.len(), 256);
        for (i, &b) in out.iter().enumerate() {
            assert_eq!(b, ((i + 100) % 251) as u8);
        }

        let layout = PlaneLayout::from_ifd(&ifd).unwrap();
        let both = open_region(
            &mut stream,
            &ifd,
            0,
            &Region::full(&layout),
            &Limits::default(),
        )
        .unwrap();
        // component-major output
        assert_eq!(both.len(), 512);
        assert_eq!(both[0], 0);
        assert_eq!(both[256], 100);
    }

    #[test]
    fn horizontal_predictor_is_undone() {
        let (width, height) = (8u32, 2u32);
        let mut bytes = vec![0u8; 8];
        // rows of deltas: absolute values are 10,11,...,17 and 20,21,...,27
        bytes.push(10);
        bytes.extend(std::iter::repeat(1).take(7));
        bytes.push(20);
        bytes.extend(std::iter::repeat(1).take(7));

        let mut ifd = Ifd::new();
        ifd.put(Tag::ImageWidth, TagValue::Longs(vec![width]));
        ifd.put(Tag::ImageLength, TagValue::Longs(vec![height]));
        ifd.put(Tag::BitsPerSample, TagValue::Shorts(vec![8]));
        ifd.put(Tag::Compression, TagValue::Shorts(vec![1]));
        ifd.put(Tag::PhotometricInterpretation, TagValue::Shorts(vec![1]));
        ifd.put(Tag::Predictor, TagValue::Shorts(vec![2]));
        ifd.put(Tag::RowsPerStrip, TagValue::Longs(vec![height]));
        ifd.put(Tag::StripOffsets, TagValue::Longs(vec![8]));
        ifd.put(Tag::StripByteCounts, TagValue::Longs(vec![16]));

        let mut stream = BufferedStream::new(Box::new(MemoryHandle::new(bytes)));
        let layout = PlaneLayout::from_ifd(&ifd).unwrap();
        let out = open_region(
            &mut stream,
            &ifd,
            0,
            &Region::full(&layout),
            &Limits::default(),
        )
        .unwrap();
        assert_eq!(&out[..8], &[10, 11, 12, 13, 14, 15, 16, 17]);
        assert_eq!(&out[8..], &[20, 21, 22, 23, 24, 25, 26, 27]);
    }
}
