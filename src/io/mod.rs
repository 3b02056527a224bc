//! Random-access byte sources and the buffered stream layered on top.

use std::io;

use crate::error::{IoError, SciioResult};

mod archive;
mod file;
mod location;
mod memory;
mod stream;
mod url;

pub use self::archive::{Bzip2Handle, GzipHandle, ZipHandle};
pub use self::file::FileHandle;
pub use self::location::{Location, LocationKind, LocationRegistry};
pub use self::memory::MemoryHandle;
pub use self::stream::BufferedStream;
pub use self::url::UrlHandle;

/// Byte order of a source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ByteOrder {
    /// little endian byte order
    LittleEndian,
    /// big endian byte order
    BigEndian,
}

impl ByteOrder {
    pub fn is_little(self) -> bool {
        matches!(self, ByteOrder::LittleEndian)
    }
}

/// An open random-access byte stream with a position, a length and a byte
/// order.
///
/// Consumed as `Box<dyn SourceHandle>` by [`BufferedStream`]. Read-only
/// variants keep the default `write`/`set_length`, which fail with
/// `ReadOnly`.
pub trait SourceHandle {
    /// Current length of the stream in bytes.
    fn length(&self) -> u64;

    /// Current position of the stream pointer.
    fn position(&self) -> u64;

    /// Moves the stream pointer. Growable sources extend their length when
    /// `pos` lies past the current end.
    fn seek(&mut self, pos: u64) -> SciioResult<()>;

    /// Reads up to `buf.len()` bytes, returning the count actually read.
    /// Returns 0 at the end of the stream.
    fn read(&mut self, buf: &mut [u8]) -> SciioResult<usize>;

    /// Writes all of `buf` at the current position.
    fn write(&mut self, _buf: &[u8]) -> SciioResult<()> {
        Err(IoError::ReadOnly.into())
    }

    /// Truncates or extends the stream.
    fn set_length(&mut self, _len: u64) -> SciioResult<()> {
        Err(IoError::ReadOnly.into())
    }

    fn order(&self) -> ByteOrder;

    fn set_order(&mut self, order: ByteOrder);

    fn is_writable(&self) -> bool {
        false
    }

    /// Releases the source. Subsequent reads fail with `Cancelled`.
    fn close(&mut self) -> SciioResult<()> {
        Ok(())
    }

    /// Fills `buf` completely or fails with `UnexpectedEnd`.
    fn read_fully(&mut self, buf: &mut [u8]) -> SciioResult<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(&mut buf[filled..])?;
            if n == 0 {
                return Err(IoError::UnexpectedEnd.into());
            }
            filled += n;
        }
        Ok(())
    }
}

/// Adapter exposing a [`SourceHandle`] through `std::io::Read` + `Seek`, for
/// the decompression crates that want those traits.
pub struct HandleReader {
    inner: Box<dyn SourceHandle>,
}

impl HandleReader {
    pub fn new(inner: Box<dyn SourceHandle>) -> Self {
        HandleReader { inner }
    }

    pub fn into_inner(self) -> Box<dyn SourceHandle> {
        self.inner
    }

    pub fn handle(&self) -> &dyn SourceHandle {
        &*self.inner
    }
}

fn to_io_error(err: crate::error::SciioError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err.to_string())
}

impl io::Read for HandleReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf).map_err(to_io_error)
    }
}

impl io::Seek for HandleReader {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        let target = match pos {
            io::SeekFrom::Start(p) => p,
            io::SeekFrom::End(delta) => {
                let end = self.inner.length() as i64 + delta;
                if end < 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "seek before start",
                    ));
                }
                end as u64
            }
            io::SeekFrom::Current(delta) => {
                let cur = self.inner.position() as i64 + delta;
                if cur < 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "seek before start",
                    ));
                }
                cur as u64
            }
        };
        self.inner.seek(target).map_err(to_io_error)?;
        Ok(target)
    }
}
