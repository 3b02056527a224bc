use std::error::Error;
use std::fmt;
use std::io;
use std::str;
use std::string;

use crate::tags::Type;

/// Error kinds produced anywhere in the crate.
#[derive(Debug)]
pub enum SciioError {
    /// The dataset is not formatted properly.
    Format(FormatError),

    /// An I/O failure occurred while reading or writing a source.
    Io(IoError),

    /// The caller used the API in a way that is incompatible with the dataset.
    Usage(UsageError),

    /// A resource limit was hit while servicing the request.
    Resource(ResourceError),
}

/// The dataset is not formatted properly.
///
/// This indicates that the producer of the file misbehaved or that the input
/// has been corrupted. The list of variants may grow; matching exhaustively
/// is not covered by interface stability guarantees.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum FormatError {
    NotATiff,
    CyclicIfd,
    IfdCountExceeded,
    MissingTag(u16),
    BadTagType {
        tag: u16,
        have: Type,
        want: Type,
    },
    UnsupportedCompression(u16),
    BadStripLayout,
    BadTileLayout,
    TruncatedPlane(u64),
    WouldOverflow32,
    InvalidTag,
    Format(String),
}

impl fmt::Display for FormatError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        use self::FormatError::*;
        match *self {
            NotATiff => write!(fmt, "Not a TIFF file: bad signature."),
            CyclicIfd => write!(fmt, "File contains a cycle in the list of IFDs."),
            IfdCountExceeded => write!(fmt, "IFD chain exceeds the directory count limit."),
            MissingTag(tag) => write!(fmt, "Required tag {} not found.", tag),
            BadTagType { tag, have, want } => write!(
                fmt,
                "Tag {} has type {:?}, which cannot coerce to {:?}.",
                tag, have, want
            ),
            UnsupportedCompression(code) => {
                write!(fmt, "Compression scheme {} is unsupported.", code)
            }
            BadStripLayout => write!(fmt, "Strip offsets and byte counts are inconsistent."),
            BadTileLayout => write!(fmt, "Tile offsets and byte counts are inconsistent."),
            TruncatedPlane(plane) => {
                write!(fmt, "Plane {} extends past the end of the source.", plane)
            }
            WouldOverflow32 => write!(
                fmt,
                "File is too large for 32-bit TIFF but BigTIFF was disabled."
            ),
            InvalidTag => write!(fmt, "File contains an invalid tag."),
            Format(ref msg) => write!(fmt, "Invalid format: {}.", msg),
        }
    }
}

/// An I/O failure while reading or writing a source handle.
#[derive(Debug)]
pub enum IoError {
    /// A read could not be satisfied before the end of the source.
    UnexpectedEnd,
    /// A write was attempted on a read-only source.
    ReadOnly,
    /// The source was closed while an operation was in flight.
    Cancelled,
    /// A lower-level failure, propagated.
    Io(io::Error),
}

impl fmt::Display for IoError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        match *self {
            IoError::UnexpectedEnd => write!(fmt, "Unexpected end of source."),
            IoError::ReadOnly => write!(fmt, "Source is read-only."),
            IoError::Cancelled => write!(fmt, "Source was closed."),
            IoError::Io(ref e) => e.fmt(fmt),
        }
    }
}

/// The caller attempted an operation incompatible with the dataset.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum UsageError {
    IndexOutOfRange { index: u64, count: u64 },
    IntegerOverflow,
    InvalidAxisSpec,
}

impl fmt::Display for UsageError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        use self::UsageError::*;
        match *self {
            IndexOutOfRange { index, count } => {
                write!(fmt, "Index {} requested, only {} available.", index, count)
            }
            IntegerOverflow => write!(fmt, "Computed size overflows a signed 32-bit value."),
            InvalidAxisSpec => write!(fmt, "Axis specification is invalid for this image."),
        }
    }
}

/// A resource limit was hit while servicing the request.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceError {
    OutOfMemoryPlane { image: usize, plane: u64 },
}

impl fmt::Display for ResourceError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        match *self {
            ResourceError::OutOfMemoryPlane { image, plane } => write!(
                fmt,
                "Plane {} of image {} cannot be decoded within available memory.",
                plane, image
            ),
        }
    }
}

impl fmt::Display for SciioError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        match *self {
            SciioError::Format(ref e) => write!(fmt, "Format error: {}", e),
            SciioError::Io(ref e) => write!(fmt, "I/O error: {}", e),
            SciioError::Usage(ref e) => write!(fmt, "Usage error: {}", e),
            SciioError::Resource(ref e) => write!(fmt, "Resource error: {}", e),
        }
    }
}

impl Error for SciioError {
    fn cause(&self) -> Option<&dyn Error> {
        match *self {
            SciioError::Io(IoError::Io(ref e)) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for SciioError {
    fn from(err: io::Error) -> SciioError {
        match err.kind() {
            io::ErrorKind::UnexpectedEof => SciioError::Io(IoError::UnexpectedEnd),
            _ => SciioError::Io(IoError::Io(err)),
        }
    }
}

impl From<FormatError> for SciioError {
    fn from(err: FormatError) -> SciioError {
        SciioError::Format(err)
    }
}

impl From<IoError> for SciioError {
    fn from(err: IoError) -> SciioError {
        SciioError::Io(err)
    }
}

impl From<UsageError> for SciioError {
    fn from(err: UsageError) -> SciioError {
        SciioError::Usage(err)
    }
}

impl From<ResourceError> for SciioError {
    fn from(err: ResourceError) -> SciioError {
        SciioError::Resource(err)
    }
}

impl From<str::Utf8Error> for SciioError {
    fn from(_err: str::Utf8Error) -> SciioError {
        SciioError::Format(FormatError::InvalidTag)
    }
}

impl From<string::FromUtf8Error> for SciioError {
    fn from(_err: string::FromUtf8Error) -> SciioError {
        SciioError::Format(FormatError::InvalidTag)
    }
}

impl From<std::num::TryFromIntError> for SciioError {
    fn from(_err: std::num::TryFromIntError) -> SciioError {
        SciioError::Usage(UsageError::IntegerOverflow)
    }
}

impl From<weezl::LzwError> for SciioError {
    fn from(err: weezl::LzwError) -> SciioError {
        match err {
            weezl::LzwError::InvalidCode => SciioError::Format(FormatError::Format(String::from(
                "LZW compressed data corrupted",
            ))),
        }
    }
}

/// Result of any decoding/encoding operation in this crate.
pub type SciioResult<T> = Result<T, SciioError>;
