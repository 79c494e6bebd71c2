//! Container framing and the reader side
//!
//! ```text
//! [32] SHA-256 of all payloads concatenated      '\n'
//! [8]  build time, unix seconds                  '\n'
//! [4]  header count N                            '\n'
//! N x  header record                             '\n'
//! payload 0 | payload 1 | ... | payload N-1
//! [4]  trailer (appended containers only)
//! ```
//!
//! All integers are big-endian. Payload `i` starts at
//! `headers_size + Σ size[0..i]`, relative to the container start. In an
//! appended container the trailer holds the number of container bytes that
//! precede it, so the container starts at `end - 4 - trailer`.

use crate::digest::{digest_reader, Digest, DIGEST_SIZE};
use crate::error::{AssetError, Result, Stage};
use crate::header::Header;
use crate::offset_reader::{FileOpener, RangeOpener};
use crate::tree::{Asset, AssetMap};
use chrono::{DateTime, TimeZone, Utc};
use flate2::read::MultiGzDecoder;
use sha2::{Digest as _, Sha256};
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Delimiter after every fixed section and header record
pub const DELIMITER: u8 = b'\n';

/// Size of the appended-container trailer
pub const TRAILER_SIZE: u64 = 4;

/// Bytes before the first header record
pub const PREAMBLE_SIZE: u64 = (DIGEST_SIZE as u64 + 1) + (8 + 1) + (4 + 1);

/// Set to any value to keep `<path>.gz` after decompressing it
pub const KEEP_GZ_ENV: &str = "ASSETBIN_KEEP_GZ";

/// How to open a container file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpenOptions {
    /// The container sits at the end of the file behind a trailer
    pub ended: bool,
    /// Logical end of an appended container; defaults to the file length
    pub end_position: Option<u64>,
    /// Keep `<path>.gz` after decompression; `None` consults `ASSETBIN_KEEP_GZ`
    pub keep_compressed: Option<bool>,
}

impl OpenOptions {
    /// Options for a container occupying the whole file
    pub fn standalone() -> Self {
        Self::default()
    }

    /// Options for a container appended to another file
    pub fn ended() -> Self {
        OpenOptions {
            ended: true,
            ..Self::default()
        }
    }

    pub fn end_position(mut self, end: u64) -> Self {
        self.end_position = Some(end);
        self
    }

    pub fn keep_compressed(mut self, keep: bool) -> Self {
        self.keep_compressed = Some(keep);
        self
    }
}

/// A parsed container: its headers and where their payloads live
#[derive(Debug, Clone)]
pub struct Container {
    headers: Vec<Header>,
    headers_size: u64,
    /// Sum of all header sizes, checked for overflow when parsed
    payload_len: u64,
    content_hash: Digest,
    build_time: DateTime<Utc>,
    path: Option<PathBuf>,
    ended: bool,
    /// Absolute offset of the container start in the backing file
    base_offset: u64,
}

impl Container {
    pub(crate) fn from_parts(
        headers: Vec<Header>,
        headers_size: u64,
        content_hash: Digest,
        build_time: DateTime<Utc>,
    ) -> Self {
        let payload_len = headers.iter().fold(0u64, |acc, h| acc.saturating_add(h.size()));
        Container {
            headers,
            headers_size,
            payload_len,
            content_hash,
            build_time,
            path: None,
            ended: false,
            base_offset: 0,
        }
    }

    /// Parse the fixed sections and all headers from `r`
    ///
    /// Consumes exactly `headers_size` bytes; the payloads are left unread.
    pub fn read<R: Read>(r: R) -> Result<Self> {
        let mut r = CountingReader::new(r);

        let mut hash = [0u8; DIGEST_SIZE];
        r.read_exact(&mut hash)
            .map_err(|e| AssetError::framing(Stage::ContentHash, e))?;
        expect_delimiter(&mut r, Stage::ContentHash)?;

        let mut secs = [0u8; 8];
        r.read_exact(&mut secs)
            .map_err(|e| AssetError::framing(Stage::BuildTime, e))?;
        expect_delimiter(&mut r, Stage::BuildTime)?;
        let secs = u64::from_be_bytes(secs);
        let build_time = i64::try_from(secs)
            .ok()
            .and_then(|s| Utc.timestamp_opt(s, 0).single())
            .ok_or_else(|| {
                AssetError::framing(Stage::BuildTime, format!("timestamp {} out of range", secs))
            })?;

        let mut count = [0u8; 4];
        r.read_exact(&mut count)
            .map_err(|e| AssetError::framing(Stage::HeaderCount, e))?;
        expect_delimiter(&mut r, Stage::HeaderCount)?;
        let count = u32::from_be_bytes(count) as usize;

        let mut headers = Vec::with_capacity(count.min(4096));
        let mut payload_len = 0u64;
        for i in 0..count {
            let header = Header::unmarshal(&mut r)
                .map_err(|e| AssetError::framing(Stage::Header(i), e))?;
            expect_delimiter(&mut r, Stage::Header(i))?;
            payload_len = payload_len.checked_add(header.size()).ok_or_else(|| {
                AssetError::framing(
                    Stage::Header(i),
                    format!("size {} overflows the total payload length", header.size()),
                )
            })?;
            headers.push(header);
        }
        if r.count.checked_add(payload_len).is_none() {
            return Err(AssetError::framing(
                Stage::Payload,
                format!("{} payload bytes after {} header bytes overflow", payload_len, r.count),
            ));
        }

        Ok(Container {
            headers,
            headers_size: r.count,
            payload_len,
            content_hash: Digest::from_bytes(hash),
            build_time,
            path: None,
            ended: false,
            base_offset: 0,
        })
    }

    /// Open a container stored in (or appended to) the file at `path`
    ///
    /// When `<path>.gz` exists it is decompressed into `path` first and
    /// removed unless `keep_compressed` says otherwise. A `path` that itself
    /// ends in `.gz` is treated as naming the compressed sibling.
    ///
    /// In ended mode an existing `path` is the host executable and is never
    /// replaced; a sibling next to it is ignored.
    pub fn open_file<P: AsRef<Path>>(path: P, options: &OpenOptions) -> Result<Self> {
        let path = strip_gz(path.as_ref());
        if options.ended && path.is_file() {
            let sibling = gz_sibling(&path);
            if sibling.exists() {
                warn!(
                    "Ignoring {}: {} is an existing host and will not be replaced",
                    sibling.display(),
                    path.display()
                );
            }
        } else {
            let keep = options
                .keep_compressed
                .unwrap_or_else(|| std::env::var_os(KEEP_GZ_ENV).is_some());
            decompress_sibling(&path, keep)?;
        }

        let mut file = File::open(&path).map_err(|e| AssetError::io(&path, e))?;
        let file_len = file.metadata().map_err(|e| AssetError::io(&path, e))?.len();

        let (base_offset, available) = if options.ended {
            let end = options.end_position.unwrap_or(file_len);
            let (start, len) = locate_trailer(&mut file, end, file_len).map_err(|e| match e {
                AssetError::Io(e) => AssetError::io(&path, e),
                other => other,
            })?;
            file.seek(SeekFrom::Start(start)).map_err(|e| AssetError::io(&path, e))?;
            (start, len)
        } else {
            (0, file_len)
        };

        let mut container = Self::read(BufReader::new(file.take(available)))?;
        let needed = container.container_len();
        if needed > available {
            return Err(AssetError::framing(
                Stage::Payload,
                format!(
                    "{} headers need {} bytes but only {} are present",
                    container.headers.len(),
                    needed,
                    available
                ),
            ));
        }

        container.path = Some(path);
        container.ended = options.ended;
        container.base_offset = base_offset;

        info!(
            "Opened container {} ({} assets, {} bytes{})",
            container.path().map(|p| p.display().to_string()).unwrap_or_default(),
            container.headers.len(),
            needed,
            if options.ended {
                format!(", appended at offset {}", base_offset)
            } else {
                String::new()
            }
        );
        Ok(container)
    }

    pub fn headers(&self) -> &[Header] {
        &self.headers
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    /// Bytes occupied by the fixed sections and all header records
    pub fn headers_size(&self) -> u64 {
        self.headers_size
    }

    pub fn content_hash(&self) -> Digest {
        self.content_hash
    }

    pub fn build_time(&self) -> DateTime<Utc> {
        self.build_time
    }

    /// Backing file, for containers opened from disk
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Absolute offset of the container start in the backing file
    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    /// Sum of all payload sizes
    pub fn payload_len(&self) -> u64 {
        self.payload_len
    }

    /// Headers plus payloads, excluding any trailer
    pub fn container_len(&self) -> u64 {
        self.headers_size.saturating_add(self.payload_len)
    }

    /// Each header with the absolute offset of its payload in the backing file
    pub fn segments(&self) -> impl Iterator<Item = (&Header, u64)> + '_ {
        let mut offset = self.base_offset.saturating_add(self.headers_size);
        self.headers.iter().map(move |h| {
            let at = offset;
            offset = offset.saturating_add(h.size());
            (h, at)
        })
    }

    /// Reader factory over the backing file that opens a fresh handle per read
    pub fn file_opener(&self) -> Result<Arc<dyn RangeOpener>> {
        let path = self.require_path()?;
        Ok(Arc::new(FileOpener::new(path)))
    }

    /// One asset per header, reading through `opener`
    pub fn assets(&self, opener: Arc<dyn RangeOpener>) -> Vec<Asset> {
        self.segments()
            .map(|(h, offset)| Asset::from_range(h.clone(), Arc::clone(&opener), offset))
            .collect()
    }

    /// Assets keyed by logical path
    ///
    /// A path stored twice keeps its last occurrence.
    pub fn assets_map(&self, opener: Arc<dyn RangeOpener>) -> AssetMap {
        let mut map = AssetMap::new();
        for asset in self.assets(opener) {
            if let Some(prev) = map.insert(asset.path().to_string(), asset) {
                warn!("Duplicate asset path {} in container", prev.path());
            }
        }
        map
    }

    /// Re-read every payload and check sizes, digests and the content hash
    pub fn verify(&self) -> Result<()> {
        let opener = self.file_opener()?;
        self.verify_with(opener.as_ref())
    }

    pub fn verify_with(&self, opener: &dyn RangeOpener) -> Result<()> {
        let mut running = Sha256::new();
        for (header, offset) in self.segments() {
            let mut reader = opener.open_range(offset, header.size())?;
            let (digest, n) =
                digest_reader(&mut reader, Some(&mut running)).map_err(|e| match e.kind() {
                    io::ErrorKind::UnexpectedEof => AssetError::framing(Stage::Payload, e),
                    _ => AssetError::io(opener.path(), e),
                })?;
            if n != header.size() {
                return Err(AssetError::SizeMismatch {
                    path: header.path().to_string(),
                    expected: header.size(),
                    actual: n,
                });
            }
            if Some(digest) != header.digest() {
                return Err(AssetError::DigestMismatch {
                    path: header.path().to_string(),
                });
            }
        }

        if Digest::from_hasher(running) != self.content_hash {
            return Err(AssetError::DigestMismatch {
                path: "<container>".to_string(),
            });
        }
        debug!("Verified {} assets against content hash {}", self.headers.len(), self.content_hash);
        Ok(())
    }

    fn require_path(&self) -> Result<&Path> {
        self.path
            .as_deref()
            .ok_or_else(|| AssetError::NotFound("container has no backing file".to_string()))
    }
}

/// Read the trailer ending at `end`; returns the container's start and length
fn locate_trailer(file: &mut File, end: u64, file_len: u64) -> Result<(u64, u64)> {
    if end > file_len {
        return Err(AssetError::framing(
            Stage::Trailer,
            format!("end position {} is past end of file ({} bytes)", end, file_len),
        ));
    }
    if end < TRAILER_SIZE {
        return Err(AssetError::framing(
            Stage::Trailer,
            format!("{} bytes is too short to hold a trailer", end),
        ));
    }

    let trailer_at = end - TRAILER_SIZE;
    file.seek(SeekFrom::Start(trailer_at))?;
    let mut raw = [0u8; TRAILER_SIZE as usize];
    file.read_exact(&mut raw)
        .map_err(|e| AssetError::framing(Stage::Trailer, e))?;
    let len = u64::from(u32::from_be_bytes(raw));

    let start = trailer_at.checked_sub(len).ok_or_else(|| {
        AssetError::framing(
            Stage::Trailer,
            format!("container length {} exceeds the {} bytes before the trailer", len, trailer_at),
        )
    })?;
    Ok((start, len))
}

fn expect_delimiter<R: Read>(r: &mut R, stage: Stage) -> Result<()> {
    let mut b = [0u8; 1];
    r.read_exact(&mut b)
        .map_err(|e| AssetError::framing(stage, format!("missing delimiter: {}", e)))?;
    if b[0] != DELIMITER {
        return Err(AssetError::framing(
            stage,
            format!("expected delimiter 0x0a, found 0x{:02x}", b[0]),
        ));
    }
    Ok(())
}

/// `<path>.gz`
pub fn gz_sibling(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".gz");
    PathBuf::from(name)
}

fn strip_gz(path: &Path) -> PathBuf {
    if path.extension().is_some_and(|ext| ext == "gz") {
        path.with_extension("")
    } else {
        path.to_path_buf()
    }
}

/// Expand `<path>.gz` into `path`, returning the decompressed size
///
/// Does nothing when the sibling is absent. The output is written to a
/// temporary file and renamed into place, so a failed decompression never
/// leaves a partial `path` behind.
pub fn decompress_sibling(path: &Path, keep_compressed: bool) -> Result<Option<u64>> {
    let gz = gz_sibling(path);
    let input = match File::open(&gz) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(AssetError::io(&gz, e)),
    };

    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| AssetError::io(dir, e))?;
    let mut decoder = MultiGzDecoder::new(BufReader::new(input));
    let n = io::copy(&mut decoder, tmp.as_file_mut()).map_err(|source| AssetError::Decompress {
        path: gz.clone(),
        source,
    })?;
    tmp.as_file().sync_all().map_err(|e| AssetError::io(tmp.path(), e))?;
    tmp.persist(path).map_err(|e| AssetError::io(path, e.error))?;

    if keep_compressed {
        debug!("Decompressed {} ({} bytes), keeping archive", gz.display(), n);
    } else {
        fs::remove_file(&gz).map_err(|e| AssetError::io(&gz, e))?;
        debug!("Decompressed {} ({} bytes) and removed it", gz.display(), n);
    }
    Ok(Some(n))
}

struct CountingReader<R> {
    inner: R,
    count: u64,
}

impl<R> CountingReader<R> {
    fn new(inner: R) -> Self {
        CountingReader { inner, count: 0 }
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}
