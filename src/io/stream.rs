//! Buffered, endian-aware primitive reads and writes over any source handle.

use crate::error::{IoError, SciioResult};

use super::{ByteOrder, SourceHandle};

const DEFAULT_CAPACITY: usize = 64 * 1024;

/// A buffered view over a [`SourceHandle`].
///
/// Keeps an in-memory window that serves either as a read cache or as a
/// pending-write buffer, a logical file pointer independent of the window,
/// and a mutable byte order honored by every multi-byte primitive.
/// Transfers at least as large as the window bypass it; correctness never
/// depends on the window size. Flushing is idempotent and closing flushes.
pub struct BufferedStream {
    handle: Box<dyn SourceHandle>,
    window: Vec<u8>,
    window_start: u64,
    window_len: usize,
    dirty: bool,
    position: u64,
    order: ByteOrder,
}

impl BufferedStream {
    pub fn new(handle: Box<dyn SourceHandle>) -> Self {
        Self::with_capacity(handle, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(handle: Box<dyn SourceHandle>, capacity: usize) -> Self {
        let order = handle.order();
        BufferedStream {
            handle,
            window: vec![0; capacity.max(16)],
            window_start: 0,
            window_len: 0,
            dirty: false,
            position: 0,
            order,
        }
    }

    /// The logical position in the underlying source.
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn seek(&mut self, pos: u64) -> SciioResult<()> {
        // growable sources extend on a seek past the end
        if pos > self.length() && self.handle.is_writable() {
            self.flush()?;
            self.handle.seek(pos)?;
        }
        self.position = pos;
        Ok(())
    }

    pub fn skip_bytes(&mut self, count: u64) -> SciioResult<()> {
        self.seek(self.position + count)
    }

    pub fn length(&self) -> u64 {
        let pending = if self.dirty {
            self.window_start + self.window_len as u64
        } else {
            0
        };
        self.handle.length().max(pending)
    }

    pub fn order(&self) -> ByteOrder {
        self.order
    }

    pub fn set_order(&mut self, order: ByteOrder) {
        self.order = order;
    }

    pub fn is_writable(&self) -> bool {
        self.handle.is_writable()
    }

    /// Truncates or extends the underlying source.
    pub fn set_length(&mut self, len: u64) -> SciioResult<()> {
        self.flush()?;
        self.handle.set_length(len)?;
        self.window_len = 0;
        Ok(())
    }

    /// Writes any pending window back to the source. Safe to call twice.
    pub fn flush(&mut self) -> SciioResult<()> {
        if self.dirty {
            self.handle.seek(self.window_start)?;
            self.handle.write(&self.window[..self.window_len])?;
            self.dirty = false;
        }
        Ok(())
    }

    /// Flushes and releases the underlying source.
    pub fn close(&mut self) -> SciioResult<()> {
        self.flush()?;
        self.handle.close()
    }

    pub fn read(&mut self, buf: &mut [u8]) -> SciioResult<usize> {
        if buf.len() >= self.window.len() {
            // direct transfer, bypassing the window
            self.flush()?;
            self.window_len = 0;
            self.handle.seek(self.position)?;
            let n = self.handle.read(buf)?;
            self.position += n as u64;
            return Ok(n);
        }

        let in_window = !self.dirty
            && self.position >= self.window_start
            && self.position < self.window_start + self.window_len as u64;
        if !in_window {
            self.flush()?;
            self.handle.seek(self.position)?;
            self.window_start = self.position;
            self.window_len = 0;
            // fill as much of the window as the source provides
            while self.window_len < self.window.len() {
                let n = self.handle.read(&mut self.window[self.window_len..])?;
                if n == 0 {
                    break;
                }
                self.window_len += n;
            }
            if self.window_len == 0 {
                return Ok(0);
            }
        }

        let offset = (self.position - self.window_start) as usize;
        let n = buf.len().min(self.window_len - offset);
        buf[..n].copy_from_slice(&self.window[offset..offset + n]);
        self.position += n as u64;
        Ok(n)
    }

    pub fn read_exact(&mut self, buf: &mut [u8]) -> SciioResult<()> {
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

    pub fn write(&mut self, buf: &[u8]) -> SciioResult<()> {
        if !self.handle.is_writable() {
            return Err(IoError::ReadOnly.into());
        }
        if buf.len() >= self.window.len() {
            // direct transfer; the window no longer mirrors the source
            self.flush()?;
            self.window_len = 0;
            self.handle.seek(self.position)?;
            self.handle.write(buf)?;
            self.position += buf.len() as u64;
            return Ok(());
        }

        let appends = self.dirty
            && self.position == self.window_start + self.window_len as u64
            && self.window_len + buf.len() <= self.window.len();
        if !appends {
            self.flush()?;
            self.window_start = self.position;
            self.window_len = 0;
            self.dirty = true;
        }
        let offset = (self.position - self.window_start) as usize;
        self.window[offset..offset + buf.len()].copy_from_slice(buf);
        self.window_len = self.window_len.max(offset + buf.len());
        self.position += buf.len() as u64;
        Ok(())
    }

    // -- primitive reads, honoring the current byte order --

    pub fn read_bool(&mut self) -> SciioResult<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u8(&mut self) -> SciioResult<u8> {
        let mut n = [0u8; 1];
        self.read_exact(&mut n)?;
        Ok(n[0])
    }

    pub fn read_i8(&mut self) -> SciioResult<i8> {
        Ok(self.read_u8()? as i8)
    }

    pub fn read_u16(&mut self) -> SciioResult<u16> {
        let mut n = [0u8; 2];
        self.read_exact(&mut n)?;
        Ok(match self.order {
            ByteOrder::LittleEndian => u16::from_le_bytes(n),
            ByteOrder::BigEndian => u16::from_be_bytes(n),
        })
    }

    pub fn read_i16(&mut self) -> SciioResult<i16> {
        let mut n = [0u8; 2];
        self.read_exact(&mut n)?;
        Ok(match self.order {
            ByteOrder::LittleEndian => i16::from_le_bytes(n),
            ByteOrder::BigEndian => i16::from_be_bytes(n),
        })
    }

    pub fn read_u32(&mut self) -> SciioResult<u32> {
        let mut n = [0u8; 4];
        self.read_exact(&mut n)?;
        Ok(match self.order {
            ByteOrder::LittleEndian => u32::from_le_bytes(n),
            ByteOrder::BigEndian => u32::from_be_bytes(n),
        })
    }

    pub fn read_i32(&mut self) -> SciioResult<i32> {
        let mut n = [0u8; 4];
        self.read_exact(&mut n)?;
        Ok(match self.order {
            ByteOrder::LittleEndian => i32::from_le_bytes(n),
            ByteOrder::BigEndian => i32::from_be_bytes(n),
        })
    }

    pub fn read_u64(&mut self) -> SciioResult<u64> {
        let mut n = [0u8; 8];
        self.read_exact(&mut n)?;
        Ok(match self.order {
            ByteOrder::LittleEndian => u64::from_le_bytes(n),
            ByteOrder::BigEndian => u64::from_be_bytes(n),
        })
    }

    pub fn read_i64(&mut self) -> SciioResult<i64> {
        let mut n = [0u8; 8];
        self.read_exact(&mut n)?;
        Ok(match self.order {
            ByteOrder::LittleEndian => i64::from_le_bytes(n),
            ByteOrder::BigEndian => i64::from_be_bytes(n),
        })
    }

    pub fn read_f32(&mut self) -> SciioResult<f32> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    pub fn read_f64(&mut self) -> SciioResult<f64> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    /// Reads a fixed-length ASCII field, truncated at the first NUL byte.
    pub fn read_string(&mut self, len: usize) -> SciioResult<String> {
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf)?;
        if let Some(nul) = buf.iter().position(|&b| b == 0) {
            buf.truncate(nul);
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Reads a u16-length-prefixed UTF-8 string.
    pub fn read_pascal_string(&mut self) -> SciioResult<String> {
        let len = self.read_u16()? as usize;
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf)?;
        Ok(String::from_utf8(buf)?)
    }

    /// Reads bytes until `\n` or the end of the source; the delimiter is
    /// consumed but not returned.
    pub fn read_line(&mut self) -> SciioResult<String> {
        let mut buf = Vec::new();
        loop {
            if self.position >= self.length() {
                break;
            }
            let byte = self.read_u8()?;
            if byte == b'\n' {
                break;
            }
            buf.push(byte);
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    // -- primitive writes, honoring the current byte order --

    pub fn write_bool(&mut self, v: bool) -> SciioResult<()> {
        self.write_u8(v as u8)
    }

    pub fn write_u8(&mut self, n: u8) -> SciioResult<()> {
        self.write(&[n])
    }

    pub fn write_i8(&mut self, n: i8) -> SciioResult<()> {
        self.write_u8(n as u8)
    }

    pub fn write_u16(&mut self, n: u16) -> SciioResult<()> {
        let bytes = match self.order {
            ByteOrder::LittleEndian => n.to_le_bytes(),
            ByteOrder::BigEndian => n.to_be_bytes(),
        };
        self.write(&bytes)
    }

    pub fn write_i16(&mut self, n: i16) -> SciioResult<()> {
        self.write_u16(n as u16)
    }

    pub fn write_u32(&mut self, n: u32) -> SciioResult<()> {
        let bytes = match self.order {
            ByteOrder::LittleEndian => n.to_le_bytes(),
            ByteOrder::BigEndian => n.to_be_bytes(),
        };
        self.write(&bytes)
    }

    pub fn write_i32(&mut self, n: i32) -> SciioResult<()> {
        self.write_u32(n as u32)
    }

    pub fn write_u64(&mut self, n: u64) -> SciioResult<()> {
        let bytes = match self.order {
            ByteOrder::LittleEndian => n.to_le_bytes(),
            ByteOrder::BigEndian => n.to_be_bytes(),
        };
        self.write(&bytes)
    }

    pub fn write_i64(&mut self, n: i64) -> SciioResult<()> {
        self.write_u64(n as u64)
    }

    pub fn write_f32(&mut self, n: f32) -> SciioResult<()> {
        self.write_u32(n.to_bits())
    }

    pub fn write_f64(&mut self, n: f64) -> SciioResult<()> {
        self.write_u64(n.to_bits())
    }

    /// Writes a u16-length-prefixed UTF-8 string.
    pub fn write_pascal_string(&mut self, s: &str) -> SciioResult<()> {
        self.write_u16(s.len() as u16)?;
        self.write(s.as_bytes())
    }
}

impl Drop for BufferedStream {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryHandle;

    fn over(bytes: Vec<u8>) -> BufferedStream {
        BufferedStream::new(Box::new(MemoryHandle::new(bytes)))
    }

    #[test]
    fn order_switch_affects_next_read() {
        let mut stream = over(vec![0x0F, 0x0E, 0x0F, 0x0E]);
        stream.set_order(ByteOrder::BigEndian);
        assert_eq!(stream.read_u16().unwrap(), 0x0F0E);
        stream.set_order(ByteOrder::LittleEndian);
        stream.seek(0).unwrap();
        assert_eq!(stream.read_u16().unwrap(), 0x0E0F);
    }

    #[test]
    fn position_is_logical() {
        let mut stream = over((0..100u8).collect());
        stream.seek(42).unwrap();
        assert_eq!(stream.position(), 42);
        stream.read_u8().unwrap();
        assert_eq!(stream.position(), 43);
    }

    #[test]
    fn tiny_window_still_correct() {
        let bytes: Vec<u8> = (0..64u8).collect();
        let mut stream =
            BufferedStream::with_capacity(Box::new(MemoryHandle::new(bytes.clone())), 16);
        let mut out = vec![0u8; 64];
        stream.read_exact(&mut out).unwrap();
        assert_eq!(out, bytes);
    }

    #[test]
    fn interleaved_reads_and_writes() {
        let mut stream = BufferedStream::new(Box::new(MemoryHandle::writable()));
        stream.write_u32(0xDEAD_BEEF).unwrap();
        stream.write_u32(0xCAFE_F00D).unwrap();
        stream.seek(4).unwrap();
        assert_eq!(stream.read_u32().unwrap(), 0xCAFE_F00D);
        stream.seek(0).unwrap();
        assert_eq!(stream.read_u32().unwrap(), 0xDEAD_BEEF);
    }

    #[test]
    fn flush_is_idempotent() {
        let mut stream = BufferedStream::new(Box::new(MemoryHandle::writable()));
        stream.write_u16(7).unwrap();
        stream.flush().unwrap();
        stream.flush().unwrap();
        assert_eq!(stream.length(), 2);
    }

    #[test]
    fn string_reads() {
        let mut bytes = b"name\0pad".to_vec();
        bytes.extend_from_slice(&[0, 5]); // pascal length, big-endian
        bytes.extend_from_slice(b"hello");
        bytes.extend_from_slice(b"line one\nline two\n");
        let mut stream = over(bytes);
        stream.set_order(ByteOrder::BigEndian);
        assert_eq!(stream.read_string(8).unwrap(), "name");
        assert_eq!(stream.read_pascal_string().unwrap(), "hello");
        assert_eq!(stream.read_line().unwrap(), "line one");
        assert_eq!(stream.read_line().unwrap(), "line two");
    }

    #[test]
    fn read_only_write_fails() {
        let mut stream = over(vec![0; 4]);
        assert!(stream.write_u8(1).is_err());
    }
}
