//! Bounded pool of read handles over a single file
//!
//! Used when assets live inside the running executable: opening the binary
//! once per asset read is wasteful, and an unbounded number of handles can
//! exhaust descriptors under concurrent reads. At most `capacity` handles are
//! open at any time; `acquire` blocks until one is returned.

use crate::error::{AssetError, Result};
use crate::offset_reader::{OffsetReader, RangeOpener, ReadSeek};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace};

/// Default number of handles
pub const DEFAULT_POOL_CAPACITY: usize = 4;

struct PoolState {
    idle: Vec<File>,
    leased: usize,
    closed: bool,
}

struct PoolInner {
    path: PathBuf,
    capacity: usize,
    state: Mutex<PoolState>,
    returned: Condvar,
}

impl PoolInner {
    fn check_in(&self, file: File) {
        let mut state = self.state.lock();
        state.leased -= 1;
        if !state.closed {
            state.idle.push(file);
        }
        drop(state);
        self.returned.notify_one();
    }
}

/// Reusable read handles over one path
#[derive(Clone)]
pub struct ReaderPool {
    inner: Arc<PoolInner>,
}

impl ReaderPool {
    /// Create a pool over `path`; no handle is opened until first use
    pub fn new(path: impl Into<PathBuf>, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(AssetError::Config("reader pool capacity must be at least 1".into()));
        }
        let path = path.into();
        debug!("Reader pool over {} (capacity {})", path.display(), capacity);

        Ok(ReaderPool {
            inner: Arc::new(PoolInner {
                path,
                capacity,
                state: Mutex::new(PoolState {
                    idle: Vec::with_capacity(capacity),
                    leased: 0,
                    closed: false,
                }),
                returned: Condvar::new(),
            }),
        })
    }

    /// Pool over the running executable
    pub fn for_current_exe(capacity: usize) -> Result<Self> {
        let exe = std::env::current_exe()?;
        Self::new(exe, capacity)
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Handles currently checked out
    pub fn leased(&self) -> usize {
        self.inner.state.lock().leased
    }

    /// Handles open but not checked out
    pub fn idle(&self) -> usize {
        self.inner.state.lock().idle.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Take a handle, blocking while all `capacity` handles are in use
    pub fn acquire(&self) -> Result<PooledFile> {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        loop {
            if state.closed {
                return Err(AssetError::PoolClosed);
            }
            if let Some(file) = state.idle.pop() {
                state.leased += 1;
                return Ok(PooledFile::new(file, Arc::clone(inner)));
            }
            if state.leased < inner.capacity {
                state.leased += 1;
                drop(state);
                return match File::open(&inner.path) {
                    Ok(file) => {
                        trace!("Opened pooled handle on {}", inner.path.display());
                        Ok(PooledFile::new(file, Arc::clone(inner)))
                    }
                    Err(e) => {
                        inner.state.lock().leased -= 1;
                        inner.returned.notify_one();
                        Err(AssetError::io(&inner.path, e))
                    }
                };
            }
            inner.returned.wait(&mut state);
        }
    }

    /// Bounded view over `[start, start + len)`; `None` reads to end of file
    pub fn open(&self, start: u64, len: Option<u64>) -> Result<OffsetReader<PooledFile>> {
        let mut file = self.acquire()?;
        let len = match len {
            Some(len) => len,
            None => {
                let total = file.metadata().map_err(|e| AssetError::io(&self.inner.path, e))?.len();
                total.saturating_sub(start)
            }
        };
        file.seek(SeekFrom::Start(start))?;
        Ok(OffsetReader::new(file, start, len))
    }

    /// Drop idle handles and fail all current and future `acquire` calls
    ///
    /// Handles still leased are closed when their holders drop them.
    pub fn close(&self) {
        let mut state = self.inner.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        let dropped = state.idle.len();
        state.idle.clear();
        drop(state);
        self.inner.returned.notify_all();
        debug!(
            "Closed reader pool over {} ({} idle handles released)",
            self.inner.path.display(),
            dropped
        );
    }
}

impl fmt::Debug for ReaderPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ReaderPool")
            .field("path", &self.inner.path)
            .field("capacity", &self.inner.capacity)
            .field("leased", &state.leased)
            .field("idle", &state.idle.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl RangeOpener for ReaderPool {
    fn open_range(&self, start: u64, len: u64) -> Result<Box<dyn ReadSeek>> {
        Ok(Box::new(self.open(start, Some(len))?))
    }

    fn path(&self) -> &Path {
        &self.inner.path
    }
}

/// A file handle on loan from a [`ReaderPool`]; returned on drop
pub struct PooledFile {
    file: Option<File>,
    pool: Arc<PoolInner>,
}

impl PooledFile {
    fn new(file: File, pool: Arc<PoolInner>) -> Self {
        PooledFile {
            file: Some(file),
            pool,
        }
    }

    fn file(&mut self) -> io::Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "pooled handle already returned"))
    }

    fn metadata(&mut self) -> io::Result<std::fs::Metadata> {
        self.file()?.metadata()
    }
}

impl Read for PooledFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file()?.read(buf)
    }
}

impl Seek for PooledFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file()?.seek(pos)
    }
}

impl Drop for PooledFile {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            self.pool.check_in(file);
        }
    }
}

impl fmt::Debug for PooledFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledFile").field("path", &self.pool.path).finish()
    }
}
