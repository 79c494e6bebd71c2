//! # assetbin - Outlined Asset Containers
//!
//! `assetbin-rs` packs a directory tree into a single container file, either
//! standalone or appended to an existing file such as a compiled executable,
//! and serves the assets back at runtime without loading them into memory.
//!
//! - **Single-pass layout**: fixed header section, then payloads back to back
//! - **Appended mode**: a 4-byte trailer locates the container from the end
//! - **Integrity**: per-asset SHA-256 plus a whole-container hash
//! - **Gzip siblings**: `<path>.gz` is expanded transparently on open
//! - **Lazy registry**: assets are located and indexed on first access only
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use assetbin_rs::{AssetBundle, BundleBuilder, Result};
//!
//! # fn main() -> Result<()> {
//! // Pack ./public into assets.bin
//! BundleBuilder::new().source_dir("public").write("assets.bin")?;
//!
//! // Read it back
//! let bundle = AssetBundle::open("assets.bin")?;
//! let css = bundle.read("css/site.css")?;
//! for entry in bundle.list_children("")? {
//!     println!("{} {}", if entry.is_dir { "d" } else { "-" }, entry.path);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Runtime Lookup
//!
//! ```rust,no_run
//! use assetbin_rs::{AssetBundle, LoaderConfig};
//!
//! // $ASSETBIN_ARCHIVE__ACME_WEB, then the candidate, then the executable
//! let bundle = AssetBundle::load(
//!     LoaderConfig::new("acme-web")
//!         .candidate("/usr/share/acme-web/assets.bin")
//!         .embedded(true),
//! );
//! let index = bundle.read("index.html")?;
//! # Ok::<(), assetbin_rs::AssetError>(())
//! ```

pub mod core;

// Re-export core modules internally so crate:: paths in core still work
#[allow(unused_imports)]
pub(crate) use self::core::{
    cache, config, container, digest, error, header, locate, offset_reader, pool, registry, tree,
    writer,
};

pub use crate::core::{
    cache::ContainerCache,
    config::LoaderConfig,
    container::{Container, OpenOptions},
    digest::{digest_file, digest_reader, Digest},
    error::{AssetError, HeaderField, Result, Stage},
    header::Header,
    locate::{env_var_name, Located, Locator},
    offset_reader::{FileOpener, OffsetReader, RangeOpener, ReadSeek},
    pool::ReaderPool,
    registry::Registry,
    tree::{Asset, AssetMap, Dir, Node, Position, Walk},
    writer::{collect_headers, StoreOptions, StoreSummary, WriteMode},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Metadata about a file or directory in a bundle
///
/// # Examples
///
/// ```rust,no_run
/// use assetbin_rs::AssetBundle;
///
/// # fn main() -> assetbin_rs::Result<()> {
/// let bundle = AssetBundle::open("assets.bin")?;
/// for entry in bundle.list_entries("img")? {
///     if !entry.is_dir {
///         println!("{} ({} bytes)", entry.path, entry.size.unwrap_or(0));
///     }
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Entry {
    /// Full logical path (e.g., "img/icons/logo.svg")
    pub path: String,

    /// Last path segment (e.g., "logo.svg" or "icons")
    pub name: String,

    /// Parent directory path; empty for top-level entries
    pub parent: String,

    pub is_dir: bool,

    /// Content size in bytes (None for directories)
    pub size: Option<u64>,

    /// Unix permission and type bits
    pub mode: u32,

    /// Modification time (None for directories)
    pub modified: Option<DateTime<Utc>>,

    /// SHA-256 of the content (None for directories)
    pub digest: Option<Digest>,

    /// Depth below the root; top-level entries are 1
    pub depth: usize,
}

impl Entry {
    fn from_node(node: &Node) -> Self {
        let path = node.path().to_string();
        let parent = match path.rfind('/') {
            Some(idx) => path[..idx].to_string(),
            None => String::new(),
        };
        let asset = node.as_asset();
        Entry {
            name: node.name().to_string(),
            parent,
            is_dir: node.is_dir(),
            size: asset.map(Asset::size),
            mode: node.mode(),
            modified: node.mod_time(),
            digest: asset.map(Asset::digest),
            depth: node.position().depth,
            path,
        }
    }
}

/// Read-only asset bundle
///
/// Wraps a [`Registry`] with path-oriented conveniences. Cloning shares the
/// underlying registry.
///
/// # Examples
///
/// ```rust,no_run
/// use assetbin_rs::{AssetBundle, Result};
///
/// # fn main() -> Result<()> {
/// let bundle = AssetBundle::open("assets.bin")?;
/// let text = bundle.asset("README.md")?.data_string()?;
/// bundle.restore("docs", "/tmp/out")?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct AssetBundle {
    registry: Arc<Registry>,
}

impl AssetBundle {
    /// Open a standalone container (or its `.gz` sibling)
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with(path, &OpenOptions::standalone())
    }

    /// Open a container appended to `path`, e.g. an executable
    pub fn open_appended<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with(path, &OpenOptions::ended())
    }

    pub fn open_with<P: AsRef<Path>>(path: P, options: &OpenOptions) -> Result<Self> {
        info!("Opening asset bundle at {:?}", path.as_ref());
        let container = Container::open_file(path, options)?;
        let opener = container.file_opener()?;
        Ok(Self::from_registry(Registry::new(container.assets_map(opener))))
    }

    /// Bundle located and loaded on first access according to `config`
    pub fn load(config: LoaderConfig) -> Self {
        debug!("Deferring asset load for package {}", config.package);
        Self::from_registry(config.into_registry())
    }

    pub fn from_registry(registry: Registry) -> Self {
        AssetBundle {
            registry: Arc::new(registry),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn asset(&self, path: &str) -> Result<&Asset> {
        self.registry.get(path)
    }

    /// Whole content of the asset at `path`
    pub fn read(&self, path: &str) -> Result<Vec<u8>> {
        debug!("Reading {}", path);
        self.registry.get(path)?.data()
    }

    /// Every entry below `prefix`, in walk order; `""` lists everything
    pub fn list_entries(&self, prefix: &str) -> Result<Vec<Entry>> {
        let dir = self.registry.root()?.get_dir(prefix)?;
        let mut entries = Vec::new();
        dir.walk(|node| {
            entries.push(Entry::from_node(node));
            Ok(Walk::Continue)
        })?;
        Ok(entries)
    }

    /// Immediate children of `parent`, in name order
    pub fn list_children(&self, parent: &str) -> Result<Vec<Entry>> {
        let dir = self.registry.root()?.get_dir(parent)?;
        Ok(dir.list().iter().map(Entry::from_node).collect())
    }

    pub fn entry(&self, path: &str) -> Result<Entry> {
        Ok(Entry::from_node(self.registry.lookup(path)?))
    }

    pub fn exists(&self, path: &str) -> Result<bool> {
        match self.registry.lookup(path) {
            Ok(_) => Ok(true),
            Err(AssetError::NotFound(_)) | Err(AssetError::NotADirectory(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn is_dir(&self, path: &str) -> Result<bool> {
        match self.registry.lookup(path) {
            Ok(node) => Ok(node.is_dir()),
            Err(AssetError::NotFound(_)) | Err(AssetError::NotADirectory(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Write `path` (a file or a whole directory) under `target`
    pub fn restore<P: AsRef<Path>>(&self, path: &str, target: P) -> Result<usize> {
        self.registry.restore_dir(target, path)
    }
}

/// Builder for writing a container from a directory
///
/// # Examples
///
/// ```rust,no_run
/// use assetbin_rs::BundleBuilder;
///
/// # fn main() -> assetbin_rs::Result<()> {
/// // Append ./public to the binary
/// let summary = BundleBuilder::new()
///     .source_dir("public")
///     .append(true)
///     .write("target/release/server")?;
/// println!("{} assets, hash {}", summary.assets, summary.content_hash);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct BundleBuilder {
    source_dir: Option<PathBuf>,
    headers: Vec<Header>,
    options: StoreOptions,
}

impl BundleBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Include every file under `dir`, at paths relative to it
    pub fn source_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.source_dir = Some(dir.into());
        self
    }

    /// Include one file under an explicit logical path
    pub fn file<P: AsRef<Path>>(mut self, logical: &str, source: P) -> Result<Self> {
        let header = Header::from_path(logical, source)?;
        self.headers.push(header);
        Ok(self)
    }

    pub fn append(mut self, append: bool) -> Self {
        self.options.mode = if append { WriteMode::Append } else { WriteMode::Truncate };
        self
    }

    pub fn gzip(mut self, gzip: bool) -> Self {
        self.options.gzip = gzip;
        self
    }

    pub fn build_time(mut self, t: DateTime<Utc>) -> Self {
        self.options.build_time = Some(t);
        self
    }

    /// Store everything into `path`
    pub fn write<P: AsRef<Path>>(self, path: P) -> Result<StoreSummary> {
        let mut headers = match &self.source_dir {
            Some(dir) => collect_headers(dir)?,
            None => Vec::new(),
        };
        headers.extend(self.headers);
        if headers.is_empty() && self.source_dir.is_none() {
            return Err(AssetError::Config("no source directory or files given".into()));
        }

        let base = self.source_dir.unwrap_or_else(|| PathBuf::from("."));
        info!("Writing {} assets from {:?} to {:?}", headers.len(), base, path.as_ref());
        writer::store_file(path, &mut headers, &base, &self.options)
    }
}

/// Read-only filesystem view over a set of assets
///
/// Lets fs adapters and HTTP handlers stay agnostic of where assets come
/// from.
pub trait AssetFs {
    /// Every entry below `prefix`
    fn list_entries(&self, prefix: &str) -> Result<Vec<Entry>>;

    /// Immediate children of a directory
    fn list_children(&self, parent: &str) -> Result<Vec<Entry>>;

    fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Streaming access to a file's content
    fn open(&self, path: &str) -> Result<Box<dyn ReadSeek>>;

    fn exists(&self, path: &str) -> Result<bool>;

    fn is_dir(&self, path: &str) -> Result<bool>;

    fn entry(&self, path: &str) -> Result<Entry>;
}

impl AssetFs for AssetBundle {
    fn list_entries(&self, prefix: &str) -> Result<Vec<Entry>> {
        self.list_entries(prefix)
    }

    fn list_children(&self, parent: &str) -> Result<Vec<Entry>> {
        self.list_children(parent)
    }

    fn read(&self, path: &str) -> Result<Vec<u8>> {
        self.read(path)
    }

    fn open(&self, path: &str) -> Result<Box<dyn ReadSeek>> {
        self.asset(path)?.open()
    }

    fn exists(&self, path: &str) -> Result<bool> {
        self.exists(path)
    }

    fn is_dir(&self, path: &str) -> Result<bool> {
        self.is_dir(path)
    }

    fn entry(&self, path: &str) -> Result<Entry> {
        self.entry(path)
    }
}
