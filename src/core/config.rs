//! Loader configuration: how a consuming package finds and opens its assets
//!
//! ```toml
//! package = "acme-web"
//! candidates = ["/usr/share/acme-web/assets.bin"]
//! embedded = true
//! pool_capacity = 8
//! verify_digests = false
//! ```

use crate::cache::ContainerCache;
use crate::container::OpenOptions;
use crate::error::{AssetError, Result};
use crate::locate::Locator;
use crate::offset_reader::{FileOpener, RangeOpener};
use crate::pool::{ReaderPool, DEFAULT_POOL_CAPACITY};
use crate::registry::Registry;
use crate::tree::AssetMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

fn default_pool_capacity() -> usize {
    DEFAULT_POOL_CAPACITY
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoaderConfig {
    /// Package identity; names the `ASSETBIN_ARCHIVE__*` override variable
    pub package: String,

    /// Compiled-in container locations, tried in order
    #[serde(default)]
    pub candidates: Vec<PathBuf>,

    /// Fall back to a container appended to the running executable
    #[serde(default)]
    pub embedded: bool,

    /// Open handles kept on the executable
    #[serde(default = "default_pool_capacity")]
    pub pool_capacity: usize,

    /// Keep `<path>.gz` after decompressing; unset defers to `ASSETBIN_KEEP_GZ`
    #[serde(default)]
    pub keep_compressed: Option<bool>,

    /// Re-hash every payload when the container is first loaded
    #[serde(default)]
    pub verify_digests: bool,
}

impl LoaderConfig {
    pub fn new(package: impl Into<String>) -> Self {
        LoaderConfig {
            package: package.into(),
            candidates: Vec::new(),
            embedded: false,
            pool_capacity: DEFAULT_POOL_CAPACITY,
            keep_compressed: None,
            verify_digests: false,
        }
    }

    pub fn candidate(mut self, path: impl Into<PathBuf>) -> Self {
        self.candidates.push(path.into());
        self
    }

    pub fn embedded(mut self, embedded: bool) -> Self {
        self.embedded = embedded;
        self
    }

    pub fn verify_digests(mut self, verify: bool) -> Self {
        self.verify_digests = verify;
        self
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: LoaderConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| AssetError::io(path, e))?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.package.trim().is_empty() {
            return Err(AssetError::Config("package must not be empty".into()));
        }
        if self.pool_capacity == 0 {
            return Err(AssetError::Config("pool_capacity must be at least 1".into()));
        }
        Ok(())
    }

    pub fn locator(&self) -> Result<Locator> {
        Ok(Locator::new(&self.package)?
            .candidates(self.candidates.iter().cloned())
            .embedded(self.embedded))
    }

    /// Locate, open and map the container's assets
    ///
    /// Containers inside the executable are read through a bounded handle
    /// pool; standalone files get a fresh handle per read.
    pub fn load_assets(&self, cache: &ContainerCache) -> Result<AssetMap> {
        self.validate()?;
        let located = self.locator()?.locate()?;
        debug!(
            "Loading assets for {} from {} (ended: {})",
            self.package,
            located.path.display(),
            located.ended
        );

        let options = OpenOptions {
            ended: located.ended,
            end_position: None,
            keep_compressed: self.keep_compressed,
        };
        let container = cache.open(&located.path, &options)?;

        let opener: Arc<dyn RangeOpener> = match (located.ended, container.path()) {
            (true, Some(path)) => Arc::new(ReaderPool::new(path, self.pool_capacity)?),
            (false, Some(path)) => Arc::new(FileOpener::new(path)),
            (_, None) => return Err(AssetError::NotLocated(located.path.display().to_string())),
        };

        if self.verify_digests {
            container.verify_with(opener.as_ref())?;
            info!("Verified {} assets for {}", container.len(), self.package);
        }
        Ok(container.assets_map(opener))
    }

    /// Registry that loads through the global container cache on first use
    pub fn into_registry(self) -> Registry {
        Registry::lazy(move || self.load_assets(ContainerCache::global()))
    }
}
