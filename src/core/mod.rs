//! Outlined asset container format and runtime
//!
//! ## Format
//!
//! - [`header`] - Per-asset header record and its codec
//! - [`container`] - Container framing, trailer handling and the reader
//! - [`writer`] - Two-pass writer (digest pass, copy pass)
//! - [`digest`] - SHA-256 helpers
//!
//! ## Runtime
//!
//! - [`offset_reader`] - Bounded views into a byte range of a file
//! - [`pool`] - Bounded pool of read handles over one file
//! - [`tree`] - Assets and the virtual directory tree
//! - [`registry`] - Lazily loaded asset registry
//! - [`locate`] - Finding a package's container at runtime
//! - [`config`] - Loader configuration
//! - [`cache`] - Parsed containers shared by path

pub mod cache;
pub mod config;
pub mod container;
pub mod digest;
pub mod error;
pub mod header;
pub mod locate;
pub mod offset_reader;
pub mod pool;
pub mod registry;
pub mod tree;
pub mod writer;

// Re-export commonly used types
pub use cache::ContainerCache;
pub use config::LoaderConfig;
pub use container::{Container, OpenOptions};
pub use digest::Digest;
pub use error::{AssetError, Result, Stage};
pub use header::Header;
pub use locate::{Located, Locator};
pub use offset_reader::{FileOpener, OffsetReader, RangeOpener, ReadSeek};
pub use pool::ReaderPool;
pub use registry::Registry;
pub use tree::{Asset, AssetMap, Dir, Node, Position, Walk};
pub use writer::{StoreOptions, StoreSummary, WriteMode};
