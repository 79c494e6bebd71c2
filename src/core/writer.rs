//! Container writer
//!
//! Storing is two passes over the sources. [`prepare`] streams every source
//! once to fill in per-asset digests and the whole-container hash, which
//! must be known before the first header byte is written. [`Prepared::write`]
//! then emits the header section and copies the payloads, re-checking each
//! source's size and digest so a file that changed in between is caught
//! instead of silently producing a container whose offsets are wrong.

use crate::container::{gz_sibling, Container, DELIMITER, PREAMBLE_SIZE, TRAILER_SIZE};
use crate::digest::{Digest, HashingWriter};
use crate::error::{AssetError, Result};
use crate::header::Header;
use chrono::{DateTime, Utc};
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest as _, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// How the destination file is treated
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WriteMode {
    /// Replace the file; the container occupies all of it
    #[default]
    Truncate,
    /// Add the container after existing bytes, followed by a trailer
    Append,
}

/// Options for [`store_file`]
#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    pub mode: WriteMode,
    /// Write `<path>.gz` instead of `path`
    pub gzip: bool,
    /// Build time recorded in the container; defaults to now
    pub build_time: Option<DateTime<Utc>>,
}

impl StoreOptions {
    pub fn append() -> Self {
        StoreOptions {
            mode: WriteMode::Append,
            ..Self::default()
        }
    }

    pub fn gzip(mut self, gzip: bool) -> Self {
        self.gzip = gzip;
        self
    }

    pub fn build_time(mut self, t: DateTime<Utc>) -> Self {
        self.build_time = Some(t);
        self
    }
}

/// Result of a completed store
#[derive(Debug, Clone)]
pub struct StoreSummary {
    /// File actually written (`<path>.gz` when compressing)
    pub path: PathBuf,
    pub assets: usize,
    pub content_hash: Digest,
    pub build_time: DateTime<Utc>,
    pub headers_size: u64,
    /// Header section plus payloads, excluding any trailer
    pub container_len: u64,
    /// Where the container starts in the uncompressed file, counting the
    /// decompressed size of earlier gzip members
    pub offset: u64,
}

/// Headers whose digests are known and ready to be written
#[derive(Debug)]
pub struct Prepared<'a> {
    headers: &'a [Header],
    base_dir: PathBuf,
    content_hash: Digest,
    build_time: DateTime<Utc>,
    build_secs: u64,
    headers_size: u64,
}

/// First pass: digest every source in header order
///
/// Fills in missing digests; headers that already carry one are re-hashed
/// and must match. Sources are `base_dir/<path>` unless a header names its
/// own source file. Build times before the unix epoch cannot be recorded.
pub fn prepare<'a>(
    headers: &'a mut [Header],
    base_dir: &Path,
    build_time: DateTime<Utc>,
) -> Result<Prepared<'a>> {
    let build_secs = u64::try_from(build_time.timestamp()).map_err(|_| {
        AssetError::Config(format!("build time {} is before the unix epoch", build_time))
    })?;

    let mut running = Sha256::new();
    for header in headers.iter_mut() {
        header.load_digest(base_dir, Some(&mut running))?;
    }
    let content_hash = Digest::from_hasher(running);
    let headers_size = headers_size(headers);
    debug!(
        "Prepared {} headers ({} header bytes, content hash {})",
        headers.len(),
        headers_size,
        content_hash
    );

    Ok(Prepared {
        headers,
        base_dir: base_dir.to_path_buf(),
        content_hash,
        build_time,
        build_secs,
        headers_size,
    })
}

/// Size of the header section for `headers`
pub fn headers_size(headers: &[Header]) -> u64 {
    PREAMBLE_SIZE + headers.iter().map(|h| h.encoded_len() as u64 + 1).sum::<u64>()
}

impl<'a> Prepared<'a> {
    pub fn content_hash(&self) -> Digest {
        self.content_hash
    }

    pub fn build_time(&self) -> DateTime<Utc> {
        self.build_time
    }

    pub fn headers_size(&self) -> u64 {
        self.headers_size
    }

    pub fn headers(&self) -> &[Header] {
        self.headers
    }

    /// Header section plus payloads
    pub fn container_len(&self) -> u64 {
        self.headers_size + self.headers.iter().map(Header::size).sum::<u64>()
    }

    /// Second pass: header section then payloads; returns bytes written
    pub fn write<W: Write>(&self, sink: &mut W) -> Result<u64> {
        let mut out = CountingWriter::new(sink);
        self.write_header_section(&mut out)?;
        if out.count != self.headers_size {
            return Err(AssetError::Io(io::Error::new(
                io::ErrorKind::Other,
                format!("header section is {} bytes, expected {}", out.count, self.headers_size),
            )));
        }

        for header in self.headers {
            self.copy_payload(header, &mut out)?;
        }
        out.flush()?;
        Ok(out.count)
    }

    /// Like [`write`](Self::write), then the trailer; returns bytes written
    /// including the trailer
    pub fn write_appended<W: Write>(&self, sink: &mut W) -> Result<u64> {
        let len = self.container_len();
        let trailer = u32::try_from(len).map_err(|_| {
            AssetError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("container of {} bytes is too large for an appended trailer", len),
            ))
        })?;

        let written = self.write(sink)?;
        sink.write_all(&trailer.to_be_bytes())?;
        sink.flush()?;
        Ok(written + TRAILER_SIZE)
    }

    /// Container describing what [`write`](Self::write) produces
    pub fn to_container(&self) -> Container {
        let headers = self.headers.iter().map(Header::stored).collect();
        Container::from_parts(headers, self.headers_size, self.content_hash, self.build_time)
    }

    fn write_header_section<W: Write>(&self, out: &mut W) -> Result<()> {
        let count = u32::try_from(self.headers.len()).map_err(|_| {
            AssetError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "more than u32::MAX headers",
            ))
        })?;
        out.write_all(self.content_hash.as_bytes())?;
        out.write_all(&[DELIMITER])?;
        out.write_all(&self.build_secs.to_be_bytes())?;
        out.write_all(&[DELIMITER])?;
        out.write_all(&count.to_be_bytes())?;
        out.write_all(&[DELIMITER])?;

        for header in self.headers {
            header.marshal(out)?;
            out.write_all(&[DELIMITER])?;
        }
        Ok(())
    }

    fn copy_payload<W: Write>(&self, header: &Header, out: &mut W) -> Result<()> {
        let source = header.resolve_source(&self.base_dir);
        let file = File::open(&source).map_err(|e| AssetError::io(&source, e))?;
        let on_disk = file.metadata().map_err(|e| AssetError::io(&source, e))?.len();
        if on_disk != header.size() {
            return Err(AssetError::SizeMismatch {
                path: header.path().to_string(),
                expected: header.size(),
                actual: on_disk,
            });
        }

        let mut hashing = HashingWriter::new(out);
        let copied = io::copy(&mut file.take(header.size()), &mut hashing)
            .map_err(|e| AssetError::io(&source, e))?;
        let (_, digest, _) = hashing.finish();

        if copied != header.size() {
            return Err(AssetError::SizeMismatch {
                path: header.path().to_string(),
                expected: header.size(),
                actual: copied,
            });
        }
        if Some(digest) != header.digest() {
            return Err(AssetError::DigestMismatch {
                path: header.path().to_string(),
            });
        }
        Ok(())
    }
}

/// Digest and write `headers` as a standalone container
pub fn store<W: Write>(
    headers: &mut [Header],
    base_dir: &Path,
    build_time: DateTime<Utc>,
    sink: &mut W,
) -> Result<u64> {
    prepare(headers, base_dir, build_time)?.write(sink)
}

/// Digest and write `headers` followed by a trailer
pub fn append<W: Write>(
    headers: &mut [Header],
    base_dir: &Path,
    build_time: DateTime<Utc>,
    sink: &mut W,
) -> Result<u64> {
    prepare(headers, base_dir, build_time)?.write_appended(sink)
}

/// Store `headers` into the file at `path`
///
/// Truncate mode writes a temporary file next to the destination and renames
/// it into place only on success. Append mode extends the existing file and
/// cuts it back to its original length if anything fails. With `gzip` the
/// destination is `<path>.gz`; in append mode the container is added as a
/// new gzip member. Gzip appends are refused while `path` itself exists,
/// since opening the container would expand the archive over it.
pub fn store_file<P: AsRef<Path>>(
    path: P,
    headers: &mut [Header],
    base_dir: &Path,
    options: &StoreOptions,
) -> Result<StoreSummary> {
    let path = path.as_ref();
    if options.gzip && options.mode == WriteMode::Append && path.exists() {
        return Err(AssetError::Config(format!(
            "refusing to gzip-append next to existing {}: opening it would replace the file",
            path.display()
        )));
    }
    let target = if options.gzip { gz_sibling(path) } else { path.to_path_buf() };
    let build_time = options.build_time.unwrap_or_else(Utc::now);
    let prepared = prepare(headers, base_dir, build_time)?;

    let offset = match options.mode {
        WriteMode::Truncate => {
            write_replacing(&target, &prepared, options.gzip)?;
            0
        }
        WriteMode::Append => write_appending(&target, &prepared, options.gzip)?,
    };

    info!(
        "Stored {} assets into {} ({} bytes, {:?}{})",
        prepared.headers().len(),
        target.display(),
        prepared.container_len(),
        options.mode,
        if options.gzip { ", gzip" } else { "" }
    );

    Ok(StoreSummary {
        path: target,
        assets: prepared.headers().len(),
        content_hash: prepared.content_hash(),
        build_time,
        headers_size: prepared.headers_size(),
        container_len: prepared.container_len(),
        offset,
    })
}

fn write_replacing(target: &Path, prepared: &Prepared<'_>, gzip: bool) -> Result<()> {
    let dir = match target.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| AssetError::io(dir, e))?;

    {
        let file = tmp.as_file_mut();
        if gzip {
            let mut enc = GzEncoder::new(BufWriter::new(file), Compression::default());
            prepared.write(&mut enc)?;
            enc.finish()?.flush()?;
        } else {
            let mut out = BufWriter::new(file);
            prepared.write(&mut out)?;
            out.flush()?;
        }
    }

    tmp.as_file().sync_all().map_err(|e| AssetError::io(tmp.path(), e))?;
    set_default_permissions(tmp.path(), target)?;
    tmp.persist(target).map_err(|e| AssetError::io(target, e.error))?;
    Ok(())
}

/// Returns the offset at which the container starts once decompressed
fn write_appending(target: &Path, prepared: &Prepared<'_>, gzip: bool) -> Result<u64> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(target)
        .map_err(|e| AssetError::io(target, e))?;
    let original_len = file.metadata().map_err(|e| AssetError::io(target, e))?.len();
    let offset = if gzip && original_len > 0 {
        decompressed_len(target)?
    } else {
        original_len
    };

    let result = if gzip {
        let mut enc = GzEncoder::new(BufWriter::new(&mut file), Compression::default());
        prepared
            .write_appended(&mut enc)
            .and_then(|_| Ok(enc.finish()?.flush()?))
    } else {
        let mut out = BufWriter::new(&mut file);
        prepared.write_appended(&mut out).and_then(|_| Ok(out.flush()?))
    };

    if let Err(e) = result {
        if let Err(cut) = file.set_len(original_len) {
            warn!(
                "Could not truncate {} back to {} bytes after failed append: {}",
                target.display(),
                original_len,
                cut
            );
        }
        return Err(e);
    }
    file.sync_all().map_err(|e| AssetError::io(target, e))?;
    Ok(offset)
}

/// Total size of every gzip member in `path`
fn decompressed_len(path: &Path) -> Result<u64> {
    let file = File::open(path).map_err(|e| AssetError::io(path, e))?;
    let mut decoder = MultiGzDecoder::new(io::BufReader::new(file));
    io::copy(&mut decoder, &mut io::sink()).map_err(|source| AssetError::Decompress {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(unix)]
fn set_default_permissions(tmp: &Path, target: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    // Keep an existing file's mode; temp files start out 0600
    let perms = match fs::metadata(target) {
        Ok(meta) => meta.permissions(),
        Err(_) => fs::Permissions::from_mode(0o644),
    };
    fs::set_permissions(tmp, perms).map_err(|e| AssetError::io(tmp, e))
}

#[cfg(not(unix))]
fn set_default_permissions(_tmp: &Path, _target: &Path) -> Result<()> {
    Ok(())
}

/// Headers for every regular file under `base_dir`, in walk order with
/// siblings sorted by name
///
/// Logical paths are relative to `base_dir` with `/` separators.
pub fn collect_headers<P: AsRef<Path>>(base_dir: P) -> Result<Vec<Header>> {
    let base_dir = base_dir.as_ref();
    let mut headers = Vec::new();

    for entry in WalkDir::new(base_dir).follow_links(true).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(base_dir).to_path_buf();
            let source = e
                .into_io_error()
                .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "filesystem loop"));
            AssetError::io(path, source)
        })?;
        if !entry.file_type().is_file() {
            continue;
        }

        let rel = entry
            .path()
            .strip_prefix(base_dir)
            .map_err(|_| AssetError::InvalidPath(entry.path().display().to_string()))?;
        let logical = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        headers.push(Header::from_path(logical, entry.path())?);
    }

    debug!("Collected {} files under {}", headers.len(), base_dir.display());
    Ok(headers)
}

struct CountingWriter<W> {
    inner: W,
    count: u64,
}

impl<W: Write> CountingWriter<W> {
    fn new(inner: W) -> Self {
        CountingWriter { inner, count: 0 }
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
