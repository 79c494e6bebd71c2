//! Error types for container, tree and registry operations

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Section of a container being parsed when a framing error occurred
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Whole-container SHA-256
    ContentHash,
    /// Build timestamp
    BuildTime,
    /// Header count
    HeaderCount,
    /// The i-th header record
    Header(usize),
    /// Concatenated payload section
    Payload,
    /// Trailing size marker of an appended container
    Trailer,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::ContentHash => f.write_str("content hash"),
            Stage::BuildTime => f.write_str("build time"),
            Stage::HeaderCount => f.write_str("header count"),
            Stage::Header(i) => write!(f, "header #{}", i),
            Stage::Payload => f.write_str("payload"),
            Stage::Trailer => f.write_str("trailer"),
        }
    }
}

/// Field of a header record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderField {
    Size,
    Mode,
    ModTime,
    ChangeTime,
    PathLength,
    Path,
    Digest,
}

impl fmt::Display for HeaderField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HeaderField::Size => "size",
            HeaderField::Mode => "mode",
            HeaderField::ModTime => "mod-time",
            HeaderField::ChangeTime => "change-time",
            HeaderField::PathLength => "path length",
            HeaderField::Path => "path",
            HeaderField::Digest => "digest",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum AssetError {
    #[error("Malformed container at {stage}: {reason}")]
    Framing { stage: Stage, reason: String },

    #[error("Short read of header {field}: {reason}")]
    ShortHeader { field: HeaderField, reason: String },

    #[error("Size of {path} changed: expected {expected} bytes, found {actual}")]
    SizeMismatch {
        path: String,
        expected: u64,
        actual: u64,
    },

    #[error("Digest mismatch for {path}")]
    DigestMismatch { path: String },

    #[error("Digest of {0} has not been computed")]
    MissingDigest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Not a file: {0}")]
    NotAFile(String),

    #[error("Path is both a file and a directory: {0}")]
    PathConflict(String),

    #[error("Invalid asset path: {0:?}")]
    InvalidPath(String),

    #[error("I/O error on {path}: {source}")]
    IoPath {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to decompress {path}: {source}")]
    Decompress {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Reader pool is closed")]
    PoolClosed,

    #[error("No container found (checked ${0} and candidate paths)")]
    NotLocated(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Asset factory panicked: {0}")]
    FactoryPanicked(String),

    #[error("Asset load failed: {0}")]
    LoadFailed(Arc<AssetError>),
}

impl AssetError {
    /// Attach a filesystem path to an I/O error
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        AssetError::IoPath {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn framing(stage: Stage, reason: impl fmt::Display) -> Self {
        AssetError::Framing {
            stage,
            reason: reason.to_string(),
        }
    }

    /// True for lookup misses (`NotFound`), including a cached load failure
    /// that was itself a miss
    pub fn is_not_found(&self) -> bool {
        match self {
            AssetError::NotFound(_) => true,
            AssetError::LoadFailed(inner) => inner.is_not_found(),
            _ => false,
        }
    }
}

impl From<toml::de::Error> for AssetError {
    fn from(e: toml::de::Error) -> Self {
        AssetError::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AssetError>;
