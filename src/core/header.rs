//! Per-asset header record and its binary codec
//!
//! Layout of one marshaled header (big-endian):
//!
//! ```text
//! [8]  size
//! [4]  mode bits
//! [8]  mod-time, unix nanoseconds
//! [8]  change-time, unix nanoseconds
//! [4]  path length L
//! [L]  path bytes (UTF-8)
//! [32] SHA-256 digest
//! ```
//!
//! The newline delimiter that follows each record in a container is written
//! by the container codec, not here.

use crate::digest::{digest_reader, Digest, DIGEST_SIZE};
use crate::error::{AssetError, HeaderField, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fs::{File, Metadata};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

/// Fixed part of a header record, excluding path bytes
pub const HEADER_FIXED_SIZE: usize = 8 + 4 + 8 + 8 + 4 + DIGEST_SIZE;

/// Upper bound on a stored path; anything larger is treated as corruption
pub const MAX_PATH_LEN: u32 = 64 * 1024;

/// Metadata of one asset
///
/// Equality compares the stored fields only, not the source location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Header {
    path: String,
    size: u64,
    mode: u32,
    /// Unix nanoseconds
    mod_time: i64,
    /// Unix nanoseconds
    change_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    digest: Option<Digest>,
    /// On-disk source when it differs from `base_dir/path`
    #[serde(skip)]
    source: Option<PathBuf>,
}

impl Header {
    pub fn new(
        path: impl Into<String>,
        size: u64,
        mode: u32,
        mod_time: DateTime<Utc>,
        change_time: DateTime<Utc>,
    ) -> Self {
        Header {
            path: normalize(path.into()),
            size,
            mode,
            mod_time: to_nanos(mod_time),
            change_time: to_nanos(change_time),
            digest: None,
            source: None,
        }
    }

    /// Build a header by stat-ing `source`, recording it under `logical`
    ///
    /// The digest is left unset; the container writer computes it while
    /// streaming the file.
    pub fn from_path<P: AsRef<Path>>(logical: impl Into<String>, source: P) -> Result<Self> {
        let source = source.as_ref();
        let meta = std::fs::metadata(source).map_err(|e| AssetError::io(source, e))?;
        if !meta.is_file() {
            return Err(AssetError::NotAFile(source.display().to_string()));
        }
        let (mode, mod_time, change_time) = stat_times(&meta);

        Ok(Header {
            path: normalize(logical.into()),
            size: meta.len(),
            mode,
            mod_time,
            change_time,
            digest: None,
            source: Some(source.to_path_buf()),
        })
    }

    /// Read the source from `source` instead of `base_dir/path`
    pub fn with_source(mut self, source: impl Into<PathBuf>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Copy with the source location dropped, as stored in a container
    pub fn stored(&self) -> Header {
        Header {
            source: None,
            ..self.clone()
        }
    }

    /// Attach an already known digest
    pub fn with_digest(mut self, digest: Digest) -> Self {
        self.digest = Some(digest);
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Last path segment
    pub fn name(&self) -> &str {
        base_name(&self.path)
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn mode(&self) -> u32 {
        self.mode
    }

    pub fn mod_time(&self) -> DateTime<Utc> {
        Utc.timestamp_nanos(self.mod_time)
    }

    pub fn change_time(&self) -> DateTime<Utc> {
        Utc.timestamp_nanos(self.change_time)
    }

    pub fn digest(&self) -> Option<Digest> {
        self.digest
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Where the writer reads this asset from
    pub fn resolve_source(&self, base_dir: &Path) -> PathBuf {
        match &self.source {
            Some(p) => p.clone(),
            None => self.path.split('/').fold(base_dir.to_path_buf(), |acc, seg| acc.join(seg)),
        }
    }

    /// Stream the source through SHA-256 and record the digest
    ///
    /// Every byte also goes into `running` when given. A header whose digest
    /// is already set is re-hashed and must match; the digest never changes
    /// once set. Fails with `SizeMismatch` when the number of bytes read
    /// differs from the recorded size.
    pub fn load_digest(&mut self, base_dir: &Path, running: Option<&mut Sha256>) -> Result<Digest> {
        let source = self.resolve_source(base_dir);
        let mut file = File::open(&source).map_err(|e| AssetError::io(&source, e))?;
        let (digest, n) =
            digest_reader(&mut file, running).map_err(|e| AssetError::io(&source, e))?;

        if n != self.size {
            return Err(AssetError::SizeMismatch {
                path: self.path.clone(),
                expected: self.size,
                actual: n,
            });
        }

        match self.digest {
            Some(existing) if existing != digest => Err(AssetError::DigestMismatch {
                path: self.path.clone(),
            }),
            Some(existing) => Ok(existing),
            None => {
                self.digest = Some(digest);
                Ok(digest)
            }
        }
    }

    /// Bytes this header occupies when marshaled
    pub fn encoded_len(&self) -> usize {
        HEADER_FIXED_SIZE + self.path.len()
    }

    /// Serialize to `w` in the fixed field order
    pub fn marshal<W: Write>(&self, w: &mut W) -> Result<()> {
        let digest = self
            .digest
            .ok_or_else(|| AssetError::MissingDigest(self.path.clone()))?;
        let path_len = u32::try_from(self.path.len())
            .ok()
            .filter(|&l| l <= MAX_PATH_LEN)
            .ok_or_else(|| AssetError::InvalidPath(self.path.clone()))?;

        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.extend_from_slice(&self.size.to_be_bytes());
        buf.extend_from_slice(&self.mode.to_be_bytes());
        buf.extend_from_slice(&(self.mod_time as u64).to_be_bytes());
        buf.extend_from_slice(&(self.change_time as u64).to_be_bytes());
        buf.extend_from_slice(&path_len.to_be_bytes());
        buf.extend_from_slice(self.path.as_bytes());
        buf.extend_from_slice(digest.as_bytes());

        w.write_all(&buf)?;
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.marshal(&mut buf)?;
        Ok(buf)
    }

    /// Deserialize one header from `r`
    ///
    /// A short read of any field fails with `ShortHeader` naming the field;
    /// no partially decoded header is ever returned.
    pub fn unmarshal<R: Read>(r: &mut R) -> Result<Self> {
        let size = u64::from_be_bytes(read_field(r, HeaderField::Size)?);
        let mode = u32::from_be_bytes(read_field(r, HeaderField::Mode)?);
        let mod_time = u64::from_be_bytes(read_field(r, HeaderField::ModTime)?) as i64;
        let change_time = u64::from_be_bytes(read_field(r, HeaderField::ChangeTime)?) as i64;
        let path_len = u32::from_be_bytes(read_field(r, HeaderField::PathLength)?);

        if path_len > MAX_PATH_LEN {
            return Err(AssetError::ShortHeader {
                field: HeaderField::PathLength,
                reason: format!("path length {} exceeds {}", path_len, MAX_PATH_LEN),
            });
        }

        let mut path = vec![0u8; path_len as usize];
        r.read_exact(&mut path).map_err(|e| short(HeaderField::Path, e))?;
        let path = String::from_utf8(path).map_err(|e| AssetError::ShortHeader {
            field: HeaderField::Path,
            reason: e.to_string(),
        })?;

        let digest: [u8; DIGEST_SIZE] = read_field(r, HeaderField::Digest)?;

        Ok(Header {
            path,
            size,
            mode,
            mod_time,
            change_time,
            digest: Some(Digest::from_bytes(digest)),
            source: None,
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut cursor = bytes;
        Self::unmarshal(&mut cursor)
    }
}

impl PartialEq for Header {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
            && self.size == other.size
            && self.mode == other.mode
            && self.mod_time == other.mod_time
            && self.change_time == other.change_time
            && self.digest == other.digest
    }
}

impl Eq for Header {}

fn read_field<R: Read, const N: usize>(r: &mut R, field: HeaderField) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf).map_err(|e| short(field, e))?;
    Ok(buf)
}

fn short(field: HeaderField, e: io::Error) -> AssetError {
    AssetError::ShortHeader {
        field,
        reason: e.to_string(),
    }
}

fn normalize(path: String) -> String {
    if path.contains('\\') {
        path.replace('\\', "/")
    } else {
        path
    }
}

pub(crate) fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn to_nanos(t: DateTime<Utc>) -> i64 {
    // Out of range for i64 nanoseconds (before 1677 or after 2262)
    t.timestamp_nanos_opt().unwrap_or(0)
}

#[cfg(unix)]
fn stat_times(meta: &Metadata) -> (u32, i64, i64) {
    use std::os::unix::fs::MetadataExt;

    let mtime = meta.mtime().saturating_mul(1_000_000_000).saturating_add(meta.mtime_nsec());
    let ctime = meta.ctime().saturating_mul(1_000_000_000).saturating_add(meta.ctime_nsec());
    (meta.mode(), mtime, ctime)
}

#[cfg(not(unix))]
fn stat_times(meta: &Metadata) -> (u32, i64, i64) {
    let mtime = meta
        .modified()
        .ok()
        .map(|t| to_nanos(DateTime::<Utc>::from(t)))
        .unwrap_or(0);
    let mode = if meta.permissions().readonly() { 0o444 } else { 0o644 };
    (mode, mtime, mtime)
}
