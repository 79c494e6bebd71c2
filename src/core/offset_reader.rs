//! Bounded, seekable views into a byte range of a backing file
//!
//! An [`OffsetReader`] exposes bytes `[start, start + len)` of its inner
//! stream as if they were a whole file: position 0 is `start`, EOF is at
//! `len`. Several views over the same path may be alive at once, each with
//! its own handle.

use crate::error::{AssetError, Result};
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Object-safe `Read + Seek` stream handed out for asset contents
pub trait ReadSeek: Read + Seek + Send {}

impl<T: Read + Seek + Send> ReadSeek for T {}

/// Source of bounded readers over one backing file
///
/// Implemented by [`FileOpener`] (fresh handle per call) and
/// [`ReaderPool`](crate::pool::ReaderPool) (reused handles).
pub trait RangeOpener: Send + Sync + fmt::Debug {
    /// Open a view of `len` bytes starting at absolute offset `start`
    fn open_range(&self, start: u64, len: u64) -> Result<Box<dyn ReadSeek>>;

    /// Backing file path
    fn path(&self) -> &Path;
}

/// Bounded view over `[start, start + len)` of `inner`
#[derive(Debug)]
pub struct OffsetReader<R> {
    inner: R,
    start: u64,
    len: u64,
    pos: u64,
    /// Whether `inner`'s cursor is known to sit at `start + pos`
    synced: bool,
}

impl<R: Read + Seek> OffsetReader<R> {
    pub fn new(inner: R, start: u64, len: u64) -> Self {
        OffsetReader {
            inner,
            start,
            len,
            pos: 0,
            synced: false,
        }
    }

    /// Absolute offset of the first byte of the view
    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Current position relative to the view
    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read + Seek> Read for OffsetReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.len || buf.is_empty() {
            return Ok(0);
        }
        if !self.synced {
            self.inner.seek(SeekFrom::Start(self.start + self.pos))?;
            self.synced = true;
        }

        let remaining = self.len - self.pos;
        let want = usize::try_from(remaining).map_or(buf.len(), |r| r.min(buf.len()));
        let n = self.inner.read(&mut buf[..want])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "backing file ended {} bytes short of range end {}",
                    remaining,
                    self.start + self.len
                ),
            ));
        }
        self.pos += n as u64;
        Ok(n)
    }
}

impl<R: Read + Seek> Seek for OffsetReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::End(off) => offset(self.len, off),
            SeekFrom::Current(off) => offset(self.pos, off),
        };
        let target = target.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek to a negative or overflowing position",
            )
        })?;

        if target != self.pos {
            self.pos = target;
            self.synced = false;
        }
        Ok(self.pos)
    }
}

fn offset(base: u64, off: i64) -> Option<u64> {
    if off >= 0 {
        base.checked_add(off as u64)
    } else {
        base.checked_sub(off.unsigned_abs())
    }
}

/// Open `path` and return a view of `len` bytes from `start`
///
/// `len = None` means "to the end of the file", computed from the file's
/// current length.
pub fn open<P: AsRef<Path>>(path: P, start: u64, len: Option<u64>) -> Result<OffsetReader<File>> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| AssetError::io(path, e))?;
    let len = match len {
        Some(len) => len,
        None => {
            let total = file.metadata().map_err(|e| AssetError::io(path, e))?.len();
            total.saturating_sub(start)
        }
    };
    Ok(OffsetReader::new(file, start, len))
}

/// Opens a fresh file handle for every requested range
#[derive(Debug, Clone)]
pub struct FileOpener {
    path: PathBuf,
}

impl FileOpener {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileOpener { path: path.into() }
    }
}

impl RangeOpener for FileOpener {
    fn open_range(&self, start: u64, len: u64) -> Result<Box<dyn ReadSeek>> {
        Ok(Box::new(open(&self.path, start, Some(len))?))
    }

    fn path(&self) -> &Path {
        &self.path
    }
}
