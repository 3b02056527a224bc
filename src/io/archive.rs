//! Read-only source handles over compressed containers.
//!
//! Each handle behaves as if the decompressed stream were fully
//! materialized, but decodes lazily. Forward seeks discard; backward seeks
//! restart the decoder from its sync point (the stream start, or the chosen
//! zip entry's start).

use std::io::{self, Read};

use bzip2::read::BzDecoder;
use flate2::read::MultiGzDecoder;
use zip::ZipArchive;

use crate::error::{IoError, SciioResult};

use super::{ByteOrder, HandleReader, SourceHandle};

const DISCARD_CHUNK: usize = 8 * 1024;
const ZIP_WINDOW: usize = 64 * 1024;

fn decode_error(err: io::Error) -> crate::error::SciioError {
    IoError::Io(err).into()
}

/// Decoders that can be torn down to their underlying reader and rebuilt
/// from the start of the compressed stream.
pub trait RestartableDecoder: Read + Sized {
    fn build(inner: HandleReader) -> io::Result<Self>;
    fn into_inner(self) -> HandleReader;
}

impl RestartableDecoder for MultiGzDecoder<HandleReader> {
    fn build(inner: HandleReader) -> io::Result<Self> {
        Ok(MultiGzDecoder::new(inner))
    }

    fn into_inner(self) -> HandleReader {
        MultiGzDecoder::into_inner(self)
    }
}

impl RestartableDecoder for BzDecoder<HandleReader> {
    fn build(inner: HandleReader) -> io::Result<Self> {
        Ok(BzDecoder::new(inner))
    }

    fn into_inner(self) -> HandleReader {
        BzDecoder::into_inner(self)
    }
}

/// A read-only handle over a single-stream compressed source.
pub struct DecompressedHandle<D: RestartableDecoder> {
    decoder: Option<D>,
    /// Position of the next byte the decoder will yield.
    decoded_pos: u64,
    position: u64,
    length: u64,
    order: ByteOrder,
    closed: bool,
}

/// Gzip-compressed source handle (multi-member streams included).
pub type GzipHandle = DecompressedHandle<MultiGzDecoder<HandleReader>>;

/// Bzip2-compressed source handle.
pub type Bzip2Handle = DecompressedHandle<BzDecoder<HandleReader>>;

impl<D: RestartableDecoder> DecompressedHandle<D> {
    /// Wraps a compressed source. The decompressed length is computed once
    /// up front by decoding the stream to its end.
    pub fn open(inner: Box<dyn SourceHandle>) -> SciioResult<Self> {
        let mut decoder = D::build(HandleReader::new(inner)).map_err(decode_error)?;
        let mut length = 0u64;
        let mut scratch = [0u8; DISCARD_CHUNK];
        loop {
            let n = decoder.read(&mut scratch).map_err(decode_error)?;
            if n == 0 {
                break;
            }
            length += n as u64;
        }

        let mut handle = DecompressedHandle {
            decoder: Some(decoder),
            decoded_pos: length,
            position: 0,
            length,
            order: ByteOrder::BigEndian,
            closed: false,
        };
        handle.restart()?;
        Ok(handle)
    }

    fn restart(&mut self) -> SciioResult<()> {
        let decoder = self.decoder.take().expect("decoder present");
        let mut reader = decoder.into_inner();
        io::Seek::seek(&mut reader, io::SeekFrom::Start(0)).map_err(decode_error)?;
        self.decoder = Some(D::build(reader).map_err(decode_error)?);
        self.decoded_pos = 0;
        Ok(())
    }

    /// Advances the decoder until it is about to yield `self.position`.
    fn sync(&mut self) -> SciioResult<()> {
        if self.position < self.decoded_pos {
            self.restart()?;
        }
        let mut scratch = [0u8; DISCARD_CHUNK];
        while self.decoded_pos < self.position {
            let want = ((self.position - self.decoded_pos) as usize).min(DISCARD_CHUNK);
            let n = self
                .decoder
                .as_mut()
                .expect("decoder present")
                .read(&mut scratch[..want])
                .map_err(decode_error)?;
            if n == 0 {
                return Err(IoError::UnexpectedEnd.into());
            }
            self.decoded_pos += n as u64;
        }
        Ok(())
    }
}

impl<D: RestartableDecoder> SourceHandle for DecompressedHandle<D> {
    fn length(&self) -> u64 {
        self.length
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn seek(&mut self, pos: u64) -> SciioResult<()> {
        if self.closed {
            return Err(IoError::Cancelled.into());
        }
        if pos > self.length {
            return Err(IoError::UnexpectedEnd.into());
        }
        self.position = pos;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> SciioResult<usize> {
        if self.closed {
            return Err(IoError::Cancelled.into());
        }
        if self.position >= self.length {
            return Ok(0);
        }
        self.sync()?;
        let n = self
            .decoder
            .as_mut()
            .expect("decoder present")
            .read(buf)
            .map_err(decode_error)?;
        self.decoded_pos += n as u64;
        self.position += n as u64;
        Ok(n)
    }

    fn order(&self) -> ByteOrder {
        self.order
    }

    fn set_order(&mut self, order: ByteOrder) {
        self.order = order;
    }

    fn close(&mut self) -> SciioResult<()> {
        self.closed = true;
        Ok(())
    }
}

/// A read-only handle over one entry of a zip archive.
///
/// Backward seeks restart decompression from the entry's start; a retained
/// window keeps sequential and repeated reads cheap.
pub struct ZipHandle {
    archive: ZipArchive<HandleReader>,
    entry_index: usize,
    length: u64,
    position: u64,
    order: ByteOrder,
    window: Vec<u8>,
    window_start: u64,
    closed: bool,
}

fn zip_error(err: zip::result::ZipError) -> crate::error::SciioError {
    IoError::Io(io::Error::new(io::ErrorKind::InvalidData, err.to_string())).into()
}

impl ZipHandle {
    /// Opens `entry` (or the first file entry when `None`) of the archive.
    pub fn open(inner: Box<dyn SourceHandle>, entry: Option<&str>) -> SciioResult<Self> {
        let mut archive = ZipArchive::new(HandleReader::new(inner)).map_err(zip_error)?;

        let mut entry_index = None;
        for i in 0..archive.len() {
            let file = archive.by_index(i).map_err(zip_error)?;
            let chosen = match entry {
                Some(name) => file.name() == name,
                None => file.is_file(),
            };
            if chosen {
                entry_index = Some(i);
                break;
            }
        }
        let entry_index =
            entry_index.ok_or_else(|| zip_error(zip::result::ZipError::FileNotFound))?;
        let length = archive.by_index(entry_index).map_err(zip_error)?.size();

        Ok(ZipHandle {
            archive,
            entry_index,
            length,
            position: 0,
            order: ByteOrder::BigEndian,
            window: Vec::new(),
            window_start: 0,
            closed: false,
        })
    }

    /// Decompresses from the entry start, retaining a window at `start`.
    fn fill_window(&mut self, start: u64, want: usize) -> SciioResult<()> {
        let mut file = self.archive.by_index(self.entry_index).map_err(zip_error)?;
        let mut remaining = start;
        let mut scratch = [0u8; DISCARD_CHUNK];
        while remaining > 0 {
            let chunk = (remaining as usize).min(DISCARD_CHUNK);
            let n = file.read(&mut scratch[..chunk]).map_err(decode_error)?;
            if n == 0 {
                return Err(IoError::UnexpectedEnd.into());
            }
            remaining -= n as u64;
        }
        let mut window = vec![0u8; want.max(ZIP_WINDOW)];
        let mut filled = 0;
        while filled < window.len() {
            let n = file.read(&mut window[filled..]).map_err(decode_error)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        window.truncate(filled);
        self.window = window;
        self.window_start = start;
        Ok(())
    }
}

impl SourceHandle for ZipHandle {
    fn length(&self) -> u64 {
        self.length
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn seek(&mut self, pos: u64) -> SciioResult<()> {
        if self.closed {
            return Err(IoError::Cancelled.into());
        }
        if pos > self.length {
            return Err(IoError::UnexpectedEnd.into());
        }
        self.position = pos;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> SciioResult<usize> {
        if self.closed {
            return Err(IoError::Cancelled.into());
        }
        if self.position >= self.length {
            return Ok(0);
        }
        let in_window = self.position >= self.window_start
            && self.position < self.window_start + self.window.len() as u64;
        if !in_window {
            self.fill_window(self.position, buf.len())?;
        }
        let offset = (self.position - self.window_start) as usize;
        if offset >= self.window.len() {
            return Ok(0);
        }
        let n = buf.len().min(self.window.len() - offset);
        buf[..n].copy_from_slice(&self.window[offset..offset + n]);
        self.position += n as u64;
        Ok(n)
    }

    fn order(&self) -> ByteOrder {
        self.order
    }

    fn set_order(&mut self, order: ByteOrder) {
        self.order = order;
    }

    fn close(&mut self) -> SciioResult<()> {
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryHandle;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn gzip_bytes(payload: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(payload).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn gzip_reads_as_if_materialized() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(20_000).collect();
        let inner = MemoryHandle::new(gzip_bytes(&payload));

        let mut handle = GzipHandle::open(Box::new(inner)).unwrap();
        assert_eq!(handle.length(), payload.len() as u64);

        let mut buf = [0u8; 16];
        handle.seek(10_000).unwrap();
        handle.read_fully(&mut buf).unwrap();
        assert_eq!(&buf[..], &payload[10_000..10_016]);

        // backward seek restarts the decoder
        handle.seek(4).unwrap();
        handle.read_fully(&mut buf).unwrap();
        assert_eq!(&buf[..], &payload[4..20]);
    }

    #[test]
    fn gzip_rejects_writes() {
        let inner = MemoryHandle::new(gzip_bytes(b"payload"));
        let mut handle = GzipHandle::open(Box::new(inner)).unwrap();
        assert!(matches!(
            handle.write(b"x"),
            Err(crate::SciioError::Io(IoError::ReadOnly))
        ));
    }

    #[test]
    fn zip_reads_chosen_entry() {
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut zip = zip::ZipWriter::new(&mut cursor);
            let options = zip::write::FileOptions::default();
            zip.start_file("a.bin", options).unwrap();
            zip.write_all(b"first entry").unwrap();
            zip.start_file("b.bin", options).unwrap();
            zip.write_all(b"second entry").unwrap();
            zip.finish().unwrap();
        }
        let inner = MemoryHandle::new(cursor.into_inner());

        let mut handle = ZipHandle::open(Box::new(inner), Some("b.bin")).unwrap();
        assert_eq!(handle.length(), 12);
        let mut buf = [0u8; 5];
        handle.seek(7).unwrap();
        handle.read_fully(&mut buf).unwrap();
        assert_eq!(&buf[..], b"entry");
    }
}
