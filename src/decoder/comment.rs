//! Interpretation of TIFF comment dialects: ImageJ, MetaMorph, generic INI.

use log::{debug, info, warn};

use crate::error::SciioResult;
use crate::ifd::{Ifd, IfdChain, TagValue};
use crate::tags::{CompressionMethod, Tag};

/// Which dialect the first IFD's comment matched.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CommentStyle {
    ImageJ,
    MetaMorph,
    Generic,
}

/// Everything harvested from the comment block.
#[derive(Clone, Debug)]
pub struct CommentInfo {
    pub style: CommentStyle,
    pub channels: u64,
    pub slices: u64,
    pub frames: u64,
    pub unit: Option<String>,
    pub frame_interval: Option<f64>,
    pub spacing: Option<f64>,
    pub x_origin: Option<i64>,
    pub y_origin: Option<i64>,
    pub color_mode: Option<String>,
    pub description: Option<String>,
}

impl Default for CommentInfo {
    fn default() -> Self {
        CommentInfo {
            style: CommentStyle::Generic,
            channels: 1,
            slices: 1,
            frames: 1,
            unit: None,
            frame_interval: None,
            spacing: None,
            x_origin: None,
            y_origin: None,
            color_mode: None,
            description: None,
        }
    }
}

/// Inspects IFD #0's comment, fills the metadata table, and — for truncated
/// ImageJ stacks — synthesizes the missing directories in place.
///
/// `source_length` is the byte length of the backing source, needed to work
/// out how many planes a truncated stack actually carries.
pub fn interpret(
    chain: &mut IfdChain,
    source_length: u64,
    multichannel: bool,
    table: &mut Vec<(String, String)>,
) -> SciioResult<CommentInfo> {
    let comment = chain.first().and_then(|ifd| ifd.comment());
    debug!("checking comment style");

    let mut info = CommentInfo::default();
    let Some(comment) = comment else {
        return Ok(info);
    };

    if comment.starts_with("ImageJ=") {
        info.style = CommentStyle::ImageJ;
        parse_imagej(chain, &comment, &mut info, table)?;
        synthesize_truncated_stack(chain, source_length, multichannel, &info)?;
    } else if is_metamorph(chain) {
        info.style = CommentStyle::MetaMorph;
        parse_metamorph(&comment, &mut info, table);
        table.push((String::from("MetaMorph"), String::from("yes")));
    } else {
        info.style = CommentStyle::Generic;
        parse_generic(&comment, &mut info, table);
        table.push((String::from("MetaMorph"), String::from("no")));
    }
    Ok(info)
}

fn is_metamorph(chain: &IfdChain) -> bool {
    chain
        .first()
        .and_then(|ifd| ifd.get_string(Tag::Software).ok())
        .map(|software| software.contains("MetaMorph"))
        .unwrap_or(false)
}

/// Text carried by the private ImageJ extension tag, if present.
fn imagej_tag_text(ifd: &Ifd) -> Option<String> {
    let text = match ifd.get(Tag::ImageJMeta)? {
        TagValue::Ascii(s) => s.clone(),
        TagValue::Bytes(b) | TagValue::Undefined(b) => String::from_utf8_lossy(b).into_owned(),
        TagValue::Shorts(v) => v.iter().map(|&s| (s & 0xff) as u8 as char).collect(),
        _ => return None,
    };
    Some(text.replace('\0', ""))
}

fn parse_imagej(
    chain: &IfdChain,
    comment: &str,
    info: &mut CommentInfo,
    table: &mut Vec<(String, String)>,
) -> SciioResult<()> {
    let mut text = comment.to_string();
    if let Some(extra) = chain.first().and_then(imagej_tag_text) {
        text.push('\n');
        text.push_str(&extra);
    }

    let version = text
        .lines()
        .next()
        .map(|line| line.trim_start_matches("ImageJ=").to_string())
        .unwrap_or_default();
    table.push((String::from("ImageJ"), version));

    for line in text.lines().skip(1) {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let (key, value) = (key.trim(), value.trim());
        match key {
            "channels" => info.channels = parse_int(value),
            "slices" => info.slices = parse_int(value),
            "frames" => info.frames = parse_int(value),
            "mode" => {
                info.color_mode = Some(value.to_string());
                table.push((String::from("Color mode"), value.to_string()));
            }
            "unit" => {
                info.unit = Some(value.to_string());
                table.push((String::from("Unit"), value.to_string()));
            }
            "finterval" => {
                info.frame_interval = Some(parse_float(value));
                table.push((String::from("Frame Interval"), value.to_string()));
            }
            "spacing" => {
                info.spacing = Some(parse_float(value));
                table.push((String::from("Spacing"), value.to_string()));
            }
            "xorigin" => {
                info.x_origin = Some(parse_int(value) as i64);
                table.push((String::from("X Origin"), value.to_string()));
            }
            "yorigin" => {
                info.y_origin = Some(parse_int(value) as i64);
                table.push((String::from("Y Origin"), value.to_string()));
            }
            "images" => {}
            _ => table.push((key.to_string(), value.to_string())),
        }
    }
    Ok(())
}

/// ImageJ writes the comment and all pixel data before the trailing IFDs, so
/// an interrupted write leaves a single-IFD file with the remaining planes'
/// bytes intact. When the declared geometry promises more planes than the
/// chain has, the missing directories are reconstructed by cloning IFD #0
/// and advancing its strip offsets.
///
/// The first IFD's strip byte counts are trusted for every synthesized
/// plane; with variable-sized strips the offsets may be miscomputed. This is
/// a best-effort recovery.
fn synthesize_truncated_stack(
    chain: &mut IfdChain,
    source_length: u64,
    multichannel: bool,
    info: &CommentInfo,
) -> SciioResult<()> {
    let declared = info.slices * info.frames * if multichannel { 1 } else { info.channels };
    if chain.len() != 1 || declared <= 1 {
        return Ok(());
    }
    let first = &chain[0];
    if first.compression()? != CompressionMethod::None {
        return Ok(());
    }

    let plane_size =
        first.image_width()? * first.image_length()? * first.samples_per_pixel()? * u64::from(
            first.bits_per_sample()?.first().copied().unwrap_or(8) / 8,
        );
    if plane_size == 0 {
        return Ok(());
    }
    let offsets = first.strip_offsets()?;
    let counts = first.strip_byte_counts()?;
    let (Some(&last_offset), Some(&last_count)) = (offsets.last(), counts.last()) else {
        return Ok(());
    };

    let end_of_first_plane = last_offset + last_count;
    if source_length <= end_of_first_plane {
        return Ok(());
    }
    let total_planes = (source_length - end_of_first_plane) / plane_size + 1;
    if total_planes <= 1 {
        return Ok(());
    }

    warn!(
        "ImageJ stack is truncated: 1 IFD for {} declared planes; synthesizing {} directories",
        declared, total_planes
    );

    let mut prev_offsets = offsets;
    for _ in 1..total_planes {
        let mut ifd = chain[0].clone();
        let mut next = vec![0u64; prev_offsets.len()];
        next[0] = prev_offsets[prev_offsets.len() - 1] + counts[counts.len() - 1];
        for j in 1..next.len() {
            next[j] = next[j - 1] + counts[j - 1];
        }
        ifd.put(Tag::StripOffsets, TagValue::Long8s(next.clone()));
        prev_offsets = next;
        chain.push(ifd);
    }
    info!("recovered {} planes from truncated stack", chain.len());
    Ok(())
}

fn parse_metamorph(comment: &str, info: &mut CommentInfo, table: &mut Vec<(String, String)>) {
    for line in comment.lines() {
        match line.split_once(':') {
            Some((key, value)) => {
                table.push((key.trim().to_string(), value.trim().to_string()));
            }
            None => {
                if info.description.is_none() && !line.trim().is_empty() {
                    info.description = Some(line.trim().to_string());
                    table.push((String::from("Comment"), line.trim().to_string()));
                }
            }
        }
    }
}

fn parse_generic(comment: &str, info: &mut CommentInfo, table: &mut Vec<(String, String)>) {
    let mut description = String::new();
    for line in comment.lines() {
        if let Some((key, value)) = line.split_once('=') {
            table.push((key.trim().to_string(), value.trim().to_string()));
        } else if !line.starts_with('[') && !line.trim().is_empty() {
            description.push_str(line);
            description.push('\n');
        }
    }
    if !description.is_empty() {
        table.push((String::from("Comment"), description.trim().to_string()));
        info.description = Some(description.trim().to_string());
    }
}

/// Reconciled non-planar axis lengths for the chain.
///
/// Ties favor the multichannel layout: when the channel samples already
/// interleave within each plane, the channel count does not divide the
/// directory count.
pub fn derive_axes(info: &CommentInfo, ifd_count: u64, multichannel: bool) -> (u64, u64, u64) {
    let (c, z, t) = (info.channels, info.slices, info.frames);
    let c_between = if multichannel { 1 } else { c };
    if z * t * c_between == ifd_count {
        (c_between, z, t)
    } else if z * c * t == ifd_count && !multichannel {
        (c, z, t)
    } else {
        (1, 1, ifd_count)
    }
}

fn parse_int(s: &str) -> u64 {
    s.parse().unwrap_or_else(|_| {
        debug!("failed to parse integer value {s:?}");
        0
    })
}

fn parse_float(s: &str) -> f64 {
    s.parse().unwrap_or_else(|_| {
        debug!("failed to parse floating point value {s:?}");
        0.0
    })
}
