//! Lazily loaded, process-wide view of a set of assets
//!
//! A [`Registry`] is either built from a ready asset map or from a factory
//! that produces one on first use. The factory runs at most once even when
//! many threads hit the registry at the same time; they all block until it
//! finishes and then observe the same result. A failed load is sticky: every
//! later access reports the same `LoadFailed` error without retrying. A
//! factory that panics counts as a failed load.

use crate::digest::Digest;
use crate::error::{AssetError, Result};
use crate::tree::{Asset, AssetMap, Dir, Node};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tracing::{debug, error, info};

type Loaded = std::result::Result<AssetMap, Arc<AssetError>>;
type Factory = Box<dyn FnOnce() -> Result<AssetMap> + Send>;

pub struct Registry {
    factory: Mutex<Option<Factory>>,
    assets: OnceLock<Loaded>,
    tree: OnceLock<std::result::Result<Dir, Arc<AssetError>>>,
}

impl Registry {
    /// Registry over an already loaded map
    pub fn new(assets: AssetMap) -> Self {
        let registry = Registry {
            factory: Mutex::new(None),
            assets: OnceLock::new(),
            tree: OnceLock::new(),
        };
        let _ = registry.assets.set(Ok(assets));
        registry
    }

    /// Registry whose assets come from `factory` on first access
    pub fn lazy<F>(factory: F) -> Self
    where
        F: FnOnce() -> Result<AssetMap> + Send + 'static,
    {
        Registry {
            factory: Mutex::new(Some(Box::new(factory))),
            assets: OnceLock::new(),
            tree: OnceLock::new(),
        }
    }

    /// Registry keyed by each asset's own path
    pub fn from_assets<I: IntoIterator<Item = Asset>>(assets: I) -> Self {
        Self::new(assets.into_iter().map(|a| (a.path().to_string(), a)).collect())
    }

    /// Whether the load has run (successfully or not)
    pub fn is_loaded(&self) -> bool {
        self.assets.get().is_some()
    }

    /// Run the factory if it has not run yet and return the loaded map
    pub fn ensure_loaded(&self) -> Result<&AssetMap> {
        let loaded = self.assets.get_or_init(|| {
            let factory = self.factory.lock().take();
            match factory {
                Some(factory) => {
                    let started = Instant::now();
                    let outcome = panic::catch_unwind(AssertUnwindSafe(factory))
                        .unwrap_or_else(|payload| {
                            Err(AssetError::FactoryPanicked(panic_message(payload.as_ref())))
                        });
                    match outcome {
                        Ok(map) => {
                            info!("Loaded {} assets in {:?}", map.len(), started.elapsed());
                            Ok(map)
                        }
                        Err(e) => {
                            error!("Asset load failed: {}", e);
                            Err(Arc::new(e))
                        }
                    }
                }
                None => Err(Arc::new(AssetError::Config(
                    "asset factory was consumed without producing a result".to_string(),
                ))),
            }
        });
        loaded.as_ref().map_err(|e| AssetError::LoadFailed(Arc::clone(e)))
    }

    pub fn assets(&self) -> Result<&AssetMap> {
        self.ensure_loaded()
    }

    pub fn get(&self, path: &str) -> Result<&Asset> {
        let key = path.trim_start_matches('/');
        self.ensure_loaded()?
            .get(key)
            .ok_or_else(|| AssetError::NotFound(key.to_string()))
    }

    pub fn contains(&self, path: &str) -> Result<bool> {
        Ok(self.ensure_loaded()?.contains_key(path.trim_start_matches('/')))
    }

    /// Asset paths in sorted order
    pub fn names(&self) -> Result<Vec<String>> {
        Ok(self.ensure_loaded()?.keys().cloned().collect())
    }

    /// Path to digest for every asset
    pub fn digests(&self) -> Result<BTreeMap<String, Digest>> {
        Ok(self
            .ensure_loaded()?
            .iter()
            .map(|(k, a)| (k.clone(), a.digest()))
            .collect())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.ensure_loaded()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.ensure_loaded()?.is_empty())
    }

    /// Directory tree over all assets, built once
    pub fn root(&self) -> Result<&Dir> {
        let assets = self.ensure_loaded()?;
        let tree = self.tree.get_or_init(|| Dir::build(assets).map_err(Arc::new));
        tree.as_ref().map_err(|e| AssetError::LoadFailed(Arc::clone(e)))
    }

    /// Tree lookup; `""` is not a node, use [`root`](Self::root)
    pub fn lookup(&self, path: &str) -> Result<&Node> {
        self.root()?.get(path)
    }

    /// Write one asset under `dir` at its logical path
    pub fn restore_asset(&self, dir: impl AsRef<Path>, name: &str) -> Result<PathBuf> {
        self.get(name)?.restore(dir)
    }

    /// Write everything below `name` (file or directory) under `dir`;
    /// `""` restores all assets
    pub fn restore_dir(&self, dir: impl AsRef<Path>, name: &str) -> Result<usize> {
        let dir = dir.as_ref();
        let root = self.root()?;
        let count = if name.trim_matches('/').is_empty() || name == "." {
            root.restore(dir)?
        } else {
            root.get(name)?.restore(dir)?
        };
        debug!("Restored {} assets under {:?} into {}", count, name, dir.display());
        Ok(count)
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.assets.get() {
            None => "pending".to_string(),
            Some(Ok(map)) => format!("{} assets", map.len()),
            Some(Err(e)) => format!("failed: {}", e),
        };
        f.debug_struct("Registry").field("state", &state).finish()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(AssetMap::new())
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
