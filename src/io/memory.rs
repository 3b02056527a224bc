//! In-memory source handle with optional growth.

use crate::error::{IoError, SciioResult};

use super::{ByteOrder, SourceHandle};

/// Initial capacity of a freshly allocated writable handle.
const INITIAL_CAPACITY: usize = 1 << 20;

/// A source handle backed by an in-memory byte buffer.
///
/// The writable variant grows: extending the length past the current
/// capacity reallocates at twice the requested size, preserving contents,
/// byte order and position. Seeking past the end extends the length.
pub struct MemoryHandle {
    buf: Vec<u8>,
    length: usize,
    position: u64,
    order: ByteOrder,
    writable: bool,
    closed: bool,
}

impl MemoryHandle {
    /// Wraps existing bytes read-only.
    pub fn new(bytes: Vec<u8>) -> Self {
        let length = bytes.len();
        MemoryHandle {
            buf: bytes,
            length,
            position: 0,
            order: ByteOrder::BigEndian,
            writable: false,
            closed: false,
        }
    }

    /// Creates an empty writable handle.
    pub fn writable() -> Self {
        MemoryHandle {
            buf: vec![0; INITIAL_CAPACITY],
            length: 0,
            position: 0,
            order: ByteOrder::BigEndian,
            writable: true,
            closed: false,
        }
    }

    /// Creates a writable handle over existing bytes.
    pub fn writable_over(bytes: Vec<u8>) -> Self {
        let length = bytes.len();
        MemoryHandle {
            buf: bytes,
            length,
            position: 0,
            order: ByteOrder::BigEndian,
            writable: true,
            closed: false,
        }
    }

    /// The valid prefix of the backing buffer.
    pub fn bytes(&self) -> &[u8] {
        &self.buf[..self.length]
    }

    pub fn into_bytes(mut self) -> Vec<u8> {
        self.buf.truncate(self.length);
        self.buf
    }

    fn check_open(&self) -> SciioResult<()> {
        if self.closed {
            return Err(IoError::Cancelled.into());
        }
        Ok(())
    }

    fn grow_to(&mut self, length: usize) {
        if length > self.buf.len() {
            let mut grown = vec![0u8; length.saturating_mul(2)];
            grown[..self.length].copy_from_slice(&self.buf[..self.length]);
            self.buf = grown;
        }
        self.length = length;
    }
}

impl SourceHandle for MemoryHandle {
    fn length(&self) -> u64 {
        self.length as u64
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn seek(&mut self, pos: u64) -> SciioResult<()> {
        self.check_open()?;
        if pos > self.length as u64 {
            if !self.writable {
                return Err(IoError::UnexpectedEnd.into());
            }
            self.grow_to(pos as usize);
        }
        self.position = pos;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> SciioResult<usize> {
        self.check_open()?;
        let pos = self.position as usize;
        if pos >= self.length {
            return Ok(0);
        }
        let n = buf.len().min(self.length - pos);
        buf[..n].copy_from_slice(&self.buf[pos..pos + n]);
        self.position += n as u64;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> SciioResult<()> {
        self.check_open()?;
        if !self.writable {
            return Err(IoError::ReadOnly.into());
        }
        let end = self.position as usize + buf.len();
        if end > self.length {
            self.grow_to(end);
        }
        let pos = self.position as usize;
        self.buf[pos..end].copy_from_slice(buf);
        self.position = end as u64;
        Ok(())
    }

    fn set_length(&mut self, len: u64) -> SciioResult<()> {
        self.check_open()?;
        if !self.writable {
            return Err(IoError::ReadOnly.into());
        }
        let len = len as usize;
        if len >= self.length {
            self.grow_to(len);
        } else {
            // truncation keeps the capacity
            self.length = len;
            self.position = self.position.min(len as u64);
        }
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
        self.closed = true;
        Ok(())
    }
}
