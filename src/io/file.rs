//! File-backed source handle: memory-mapped when possible, paged otherwise.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use memmap2::Mmap;

use crate::error::{IoError, SciioResult};

use super::{ByteOrder, SourceHandle};

/// Files at or below this size are memory-mapped when opened read-only.
const MAP_LIMIT: u64 = (isize::MAX as u64) / 2;

enum Backing {
    Mapped(Mmap),
    Paged(File),
}

/// A source handle over a local file.
///
/// Read-only handles map the file when it fits the address-space limit and
/// fall back to paged reads otherwise. Read-write handles are always paged
/// and grow the file on writes past the end.
pub struct FileHandle {
    backing: Backing,
    length: u64,
    position: u64,
    order: ByteOrder,
    writable: bool,
    closed: bool,
}

impl FileHandle {
    /// Opens a file read-only.
    pub fn open(path: impl AsRef<Path>) -> SciioResult<Self> {
        let file = File::open(path)?;
        let length = file.metadata()?.len();
        let backing = if length <= MAP_LIMIT {
            // Safety: the mapping is read-only and the handle owns the file.
            match unsafe { Mmap::map(&file) } {
                Ok(map) => Backing::Mapped(map),
                Err(_) => Backing::Paged(file),
            }
        } else {
            Backing::Paged(file)
        };
        Ok(FileHandle {
            backing,
            length,
            position: 0,
            order: ByteOrder::BigEndian,
            writable: false,
            closed: false,
        })
    }

    /// Opens (creating if needed) a file for reading and writing.
    pub fn open_rw(path: impl AsRef<Path>) -> SciioResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let length = file.metadata()?.len();
        Ok(FileHandle {
            backing: Backing::Paged(file),
            length,
            position: 0,
            order: ByteOrder::BigEndian,
            writable: true,
            closed: false,
        })
    }

    fn check_open(&self) -> SciioResult<()> {
        if self.closed {
            return Err(IoError::Cancelled.into());
        }
        Ok(())
    }
}

impl SourceHandle for FileHandle {
    fn length(&self) -> u64 {
        self.length
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn seek(&mut self, pos: u64) -> SciioResult<()> {
        self.check_open()?;
        if pos > self.length && !self.writable {
            return Err(IoError::UnexpectedEnd.into());
        }
        self.position = pos;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> SciioResult<usize> {
        self.check_open()?;
        if self.position >= self.length {
            return Ok(0);
        }
        let n = match self.backing {
            Backing::Mapped(ref map) => {
                let pos = self.position as usize;
                let n = buf.len().min(map.len() - pos);
                buf[..n].copy_from_slice(&map[pos..pos + n]);
                n
            }
            Backing::Paged(ref mut file) => {
                file.seek(SeekFrom::Start(self.position))?;
                file.read(buf)?
            }
        };
        self.position += n as u64;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> SciioResult<()> {
        self.check_open()?;
        if !self.writable {
            return Err(IoError::ReadOnly.into());
        }
        match self.backing {
            Backing::Paged(ref mut file) => {
                file.seek(SeekFrom::Start(self.position))?;
                file.write_all(buf)?;
            }
            Backing::Mapped(_) => return Err(IoError::ReadOnly.into()),
        }
        self.position += buf.len() as u64;
        self.length = self.length.max(self.position);
        Ok(())
    }

    fn set_length(&mut self, len: u64) -> SciioResult<()> {
        self.check_open()?;
        if !self.writable {
            return Err(IoError::ReadOnly.into());
        }
        match self.backing {
            Backing::Paged(ref file) => file.set_len(len)?,
            Backing::Mapped(_) => return Err(IoError::ReadOnly.into()),
        }
        self.length = len;
        self.position = self.position.min(len);
        Ok(())
    }

    fn order(&self) -> ByteOrder {
        self.order
    }

    fn set_order(&mut self, order: ByteOrder) {
        self.order = order;
    }

    fn is_writable(&self) -> bool {
        self.writable
    }

    fn close(&mut self) -> SciioResult<()> {
        if !self.closed {
            if let Backing::Paged(ref mut file) = self.backing {
                if self.writable {
                    file.flush()?;
                }
            }
            self.closed = true;
        }
        Ok(())
    }
}
