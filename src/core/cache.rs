//! Parsed containers shared across registries
//!
//! Several registries (or several lookups of the same package) may point at
//! one backing file. The cache parses each file at most once and hands out
//! the same `Arc<Container>` afterwards.

use crate::container::{Container, OpenOptions};
use crate::error::{AssetError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    path: PathBuf,
    ended: bool,
    end_position: Option<u64>,
}

#[derive(Debug, Default)]
pub struct ContainerCache {
    entries: Mutex<HashMap<CacheKey, Arc<Container>>>,
}

impl ContainerCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide cache used by [`LoaderConfig`](crate::config::LoaderConfig)
    pub fn global() -> &'static ContainerCache {
        static GLOBAL: OnceLock<ContainerCache> = OnceLock::new();
        GLOBAL.get_or_init(ContainerCache::new)
    }

    /// Parsed container for `path`, opening it on first request
    ///
    /// Opens are serialized so concurrent first requests for one path parse
    /// it only once.
    pub fn open(&self, path: &Path, options: &OpenOptions) -> Result<Arc<Container>> {
        let key = CacheKey {
            path: absolute(path)?,
            ended: options.ended,
            end_position: options.end_position,
        };

        let mut entries = self.entries.lock();
        if let Some(hit) = entries.get(&key) {
            debug!("Container cache hit for {}", key.path.display());
            return Ok(Arc::clone(hit));
        }

        let container = Arc::new(Container::open_file(&key.path, options)?);
        entries.insert(key, Arc::clone(&container));
        Ok(container)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Forget every cached container; live `Arc`s stay valid
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

/// Canonical path when the file exists, otherwise the path made absolute
fn absolute(path: &Path) -> Result<PathBuf> {
    if let Ok(canonical) = path.canonicalize() {
        return Ok(canonical);
    }
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().map_err(AssetError::Io)?;
    Ok(cwd.join(path))
}
