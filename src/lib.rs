//! Scientific-image I/O engine.
//!
//! Given an image dataset — a file on disk, a byte blob, or a URL — this
//! crate identifies the container, parses its metadata, and exposes the
//! content as images composed of planes: 2-D rasters plus non-planar index
//! axes such as channel, Z and time. Datasets are written back out as TIFF
//! or BigTIFF.
//!
//! The crate is organized in three layers:
//!
//! * [`io`] — uniform, seekable, endian-aware byte sources over memory
//!   buffers, files, URLs and compressed archives, plus the buffered
//!   primitive stream and the location registry.
//! * [`decoder`] / [`encoder`] — TIFF and BigTIFF parsing and writing:
//!   directory walking, tag decoding, strip/tile reassembly, ImageJ and
//!   MetaMorph comment dialects, streaming plane writes with automatic
//!   BigTIFF promotion.
//! * [`filters`] — composable reader transforms, most notably the plane
//!   separator, which virtually splits non-planar axes out of a parent
//!   reader with memory-bounded strip-wise reassembly and a one-plane
//!   cache.
//!
//! # Related Links
//! * <https://web.archive.org/web/20210108073850/https://www.adobe.io/open/standards/TIFF.html> - The TIFF specification

pub mod axes;
pub mod codec;
pub mod config;
pub mod decoder;
pub mod encoder;
mod error;
pub mod filters;
pub mod ifd;
pub mod io;
pub mod tags;
pub mod util;

mod reader;
mod writer;

pub use self::axes::{Axis, AxisType, DatasetMetadata, ImageMetadata, PixelType, Plane};
pub use self::config::{Config, ParserLevel, WriterConfig};
pub use self::error::{FormatError, IoError, ResourceError, SciioError, SciioResult, UsageError};
pub use self::io::{BufferedStream, ByteOrder, LocationRegistry, SourceHandle};
pub use self::reader::{open, Reader, TiffReader};
pub use self::writer::TiffWriter;
