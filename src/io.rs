//! Positioned access to the archive bytes.
//!
//! The archive is never shared through a single cursor. Ingestion wraps it in a forward-only
//! [`StreamReader`], open files get their own [`SectionReader`] window, and both only ever issue
//! positioned reads against the underlying [`Reader`].

use std::cmp;
use std::fs::File;
use std::io::{self, Read};
use std::os::unix::fs::FileExt;
use std::sync::Arc;

/// Random access to a byte source. Implementations must allow concurrent calls.
pub trait ReadAt {
    /// Read up to `buf.len()` bytes starting at `offset`. Returns `0` at the end of the data.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;
}

/// Our reader type instance used for archive access.
pub type Reader = Arc<dyn ReadAt + Send + Sync + 'static>;

impl ReadAt for File {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        FileExt::read_at(self, buf, offset)
    }
}

impl ReadAt for Vec<u8> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let start = match usize::try_from(offset) {
            Ok(start) if start < self.len() => start,
            _ => return Ok(0),
        };
        let len = cmp::min(buf.len(), self.len() - start);
        buf[..len].copy_from_slice(&self[start..(start + len)]);
        Ok(len)
    }
}

/// Sequential [`Read`] over the first `size` bytes of a [`Reader`].
pub struct StreamReader {
    reader: Reader,
    pos: u64,
    size: u64,
}

impl StreamReader {
    pub fn new(reader: Reader, size: u64) -> Self {
        Self {
            reader,
            pos: 0,
            size,
        }
    }

    /// Number of bytes consumed so far.
    pub fn position(&self) -> u64 {
        self.pos
    }
}

impl Read for StreamReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.size.saturating_sub(self.pos);
        if remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let len = cmp::min(buf.len() as u64, remaining) as usize;
        let got = self.reader.read_at(&mut buf[..len], self.pos)?;
        self.pos += got as u64;
        Ok(got)
    }
}

/// The window `[start, start + len)` of a [`Reader`].
///
/// Offsets passed to [`SectionReader::read_at`] are relative to `start`, and reads never return
/// bytes past the end of the window.
#[derive(Clone)]
pub struct SectionReader {
    reader: Reader,
    start: u64,
    len: u64,
}

impl SectionReader {
    pub fn new(reader: Reader, start: u64, len: u64) -> Self {
        Self { reader, start, len }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl ReadAt for SectionReader {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        if offset >= self.len {
            return Ok(0);
        }
        let len = cmp::min(buf.len() as u64, self.len - offset) as usize;
        let pos = self.start.checked_add(offset).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "read offset out of range")
        })?;
        self.reader.read_at(&mut buf[..len], pos)
    }
}
