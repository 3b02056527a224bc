//! Typed configuration for readers, writers and filters.

use crate::axes::AxisType;

/// How much metadata the parser should harvest beyond the structural minimum.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ParserLevel {
    /// Only what is required to open planes.
    Minimum,
    /// Everything except overlay/annotation structures.
    NoOverlays,
    /// Everything the format offers.
    All,
}

/// The full option surface accepted by [`crate::open`] and the plane-open
/// paths. Unknown options are unrepresentable; construct via `Default` and
/// override fields.
#[derive(Clone, Debug)]
pub struct Config {
    /// Look for companion files sharing the dataset's stem.
    pub group_files: bool,
    pub parser_level: ParserLevel,
    /// Expand indexed planes through their color table.
    pub channel_filler: bool,
    /// Separate the given axis kinds out of the planar layout.
    pub plane_separator: Option<Vec<AxisType>>,
    /// Track per-plane minimum/maximum sample values.
    pub min_max_filter: bool,
    /// Image to open when a dataset holds several.
    pub image_index: usize,
    /// Planar sub-region `(offsets, lengths)` to open instead of full planes.
    pub sub_region: Option<(Vec<u64>, Vec<u64>)>,
    pub compute_min_max: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            group_files: false,
            parser_level: ParserLevel::All,
            channel_filler: false,
            plane_separator: None,
            min_max_filter: false,
            image_index: 0,
            sub_region: None,
            compute_min_max: false,
        }
    }
}

/// Options handed to a writer when it is created.
#[derive(Clone, Debug)]
pub struct WriterConfig {
    /// `None` selects BigTIFF automatically once offsets would overflow
    /// 32 bits; `Some(false)` makes such a write fail instead.
    pub big_tiff: Option<bool>,
    /// Codec name understood by the codec registry ("Uncompressed", "LZW",
    /// "Deflate", "PackBits").
    pub compression: String,
    pub little_endian: bool,
    /// Planes arrive in IFD order; skips the prior-directory lookup.
    pub sequential: bool,
}

impl Default for WriterConfig {
    fn default() -> WriterConfig {
        WriterConfig {
            big_tiff: None,
            compression: String::from("Uncompressed"),
            little_endian: true,
            sequential: true,
        }
    }
}
