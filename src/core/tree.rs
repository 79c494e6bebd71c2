//! Virtual directory tree over a flat set of assets
//!
//! Assets are keyed by slash-separated logical paths. [`Dir::build`] folds
//! them into a tree of [`Node`]s: leaves are assets, interior nodes are
//! synthesized directories. Children are ordered by name (byte order) and
//! every node knows its depth and its position among its siblings.
//!
//! ```text
//! {"a/b/c.txt", "a/d.txt", "e.txt"}
//!
//! <root>              depth 0
//! ├── a/              depth 1, index 0, first
//! │   ├── b/          depth 2, index 0, first
//! │   │   └── c.txt   depth 3, index 0, first, last
//! │   └── d.txt       depth 2, index 1, last
//! └── e.txt           depth 1, index 1, last
//! ```

use crate::digest::{digest_file, digest_reader, Digest};
use crate::error::{AssetError, Result};
use crate::header::Header;
use crate::offset_reader::{self, RangeOpener, ReadSeek};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufWriter, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Assets keyed by logical path
pub type AssetMap = BTreeMap<String, Asset>;

/// Mode reported for synthesized directories
pub const DIR_MODE: u32 = 0o040755;

/// Placement of a node among its siblings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Position {
    /// Root is 0, its children 1
    pub depth: usize,
    /// Index among siblings in name order
    pub index: usize,
    pub first: bool,
    pub last: bool,
}

#[derive(Clone)]
enum Content {
    /// Range of a container file
    Range {
        opener: Arc<dyn RangeOpener>,
        offset: u64,
    },
    Memory(Arc<[u8]>),
    Static(&'static [u8]),
    /// A file on disk, read as-is
    Local(PathBuf),
}

impl fmt::Debug for Content {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Content::Range { opener, offset } => {
                write!(f, "Range({}@{})", opener.path().display(), offset)
            }
            Content::Memory(b) => write!(f, "Memory({} bytes)", b.len()),
            Content::Static(b) => write!(f, "Static({} bytes)", b.len()),
            Content::Local(p) => write!(f, "Local({})", p.display()),
        }
    }
}

/// A single stored file: its metadata plus a way to read its bytes
///
/// Cloning is cheap; the header is shared.
#[derive(Debug, Clone)]
pub struct Asset {
    header: Arc<Header>,
    digest: Digest,
    content: Content,
    position: Position,
}

impl Asset {
    /// Asset whose payload is `header.size()` bytes at `offset` of the
    /// opener's file
    pub fn from_range(header: Header, opener: Arc<dyn RangeOpener>, offset: u64) -> Self {
        let digest = header.digest().unwrap_or_default();
        Asset {
            header: Arc::new(header),
            digest,
            content: Content::Range { opener, offset },
            position: Position::default(),
        }
    }

    /// Asset backed by an owned buffer; size and digest come from `data`
    pub fn from_bytes(header: Header, data: impl Into<Arc<[u8]>>) -> Self {
        let data: Arc<[u8]> = data.into();
        let digest = Digest::of(&data);
        let header = rebase(header, data.len() as u64, digest);
        Asset {
            header: Arc::new(header),
            digest,
            content: Content::Memory(data),
            position: Position::default(),
        }
    }

    /// Asset backed by bytes compiled into the binary
    pub fn from_static(header: Header, data: &'static [u8]) -> Self {
        let digest = Digest::of(data);
        let header = rebase(header, data.len() as u64, digest);
        Asset {
            header: Arc::new(header),
            digest,
            content: Content::Static(data),
            position: Position::default(),
        }
    }

    /// Asset read straight from a file on disk, stored under `logical`
    pub fn from_local(logical: impl Into<String>, source: impl AsRef<Path>) -> Result<Self> {
        let source = source.as_ref();
        let header = Header::from_path(logical, source)?;
        let (digest, size) = digest_file(source)?;
        Ok(Asset {
            header: Arc::new(rebase(header, size, digest)),
            digest,
            content: Content::Local(source.to_path_buf()),
            position: Position::default(),
        })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn path(&self) -> &str {
        self.header.path()
    }

    pub fn name(&self) -> &str {
        self.header.name()
    }

    pub fn size(&self) -> u64 {
        self.header.size()
    }

    pub fn mode(&self) -> u32 {
        self.header.mode()
    }

    pub fn mod_time(&self) -> DateTime<Utc> {
        self.header.mod_time()
    }

    pub fn change_time(&self) -> DateTime<Utc> {
        self.header.change_time()
    }

    pub fn digest(&self) -> Digest {
        self.digest
    }

    pub fn position(&self) -> Position {
        self.position
    }

    /// Offset of the payload in the backing container, if any
    pub fn offset(&self) -> Option<u64> {
        match &self.content {
            Content::Range { offset, .. } => Some(*offset),
            _ => None,
        }
    }

    /// A fresh stream over exactly `size` bytes of content
    pub fn open(&self) -> Result<Box<dyn ReadSeek>> {
        match &self.content {
            Content::Range { opener, offset } => opener.open_range(*offset, self.size()),
            Content::Memory(data) => Ok(Box::new(Cursor::new(Arc::clone(data)))),
            Content::Static(data) => Ok(Box::new(Cursor::new(*data))),
            Content::Local(path) => Ok(Box::new(offset_reader::open(path, 0, Some(self.size()))?)),
        }
    }

    /// Whole content in memory
    pub fn data(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(usize::try_from(self.size()).unwrap_or(0));
        self.open()?
            .read_to_end(&mut out)
            .map_err(|e| self.read_error(e))?;
        Ok(out)
    }

    /// Content as UTF-8 text; invalid sequences are replaced
    pub fn data_string(&self) -> Result<String> {
        let data = self.data()?;
        Ok(String::from_utf8(data)
            .unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned()))
    }

    /// Re-read the content and compare size and digest with the header
    pub fn verify(&self) -> Result<()> {
        let mut reader = self.open()?;
        let (digest, n) = digest_reader(&mut reader, None).map_err(|e| self.read_error(e))?;
        if n != self.size() {
            return Err(AssetError::SizeMismatch {
                path: self.path().to_string(),
                expected: self.size(),
                actual: n,
            });
        }
        if digest != self.digest {
            return Err(AssetError::DigestMismatch {
                path: self.path().to_string(),
            });
        }
        Ok(())
    }

    /// Write the content to `dest`, creating parent directories and applying
    /// the stored permission bits
    pub fn save(&self, dest: impl AsRef<Path>) -> Result<()> {
        let dest = dest.as_ref();
        if let Some(parent) = dest.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| AssetError::io(parent, e))?;
            }
        }

        let mut reader = self.open()?;
        let file = File::create(dest).map_err(|e| AssetError::io(dest, e))?;
        let mut out = BufWriter::new(file);
        io::copy(&mut reader, &mut out).map_err(|e| AssetError::io(dest, e))?;
        out.flush().map_err(|e| AssetError::io(dest, e))?;
        set_mode(dest, self.mode())?;
        Ok(())
    }

    /// Save under `dir` at this asset's full logical path
    pub fn restore(&self, dir: impl AsRef<Path>) -> Result<PathBuf> {
        let dest = logical_join(dir.as_ref(), self.path());
        self.save(&dest)?;
        Ok(dest)
    }

    fn with_position(&self, position: Position) -> Self {
        Asset {
            position,
            ..self.clone()
        }
    }

    fn read_error(&self, e: io::Error) -> AssetError {
        match &self.content {
            Content::Range { opener, .. } => AssetError::io(opener.path(), e),
            Content::Local(path) => AssetError::io(path, e),
            _ => AssetError::Io(e),
        }
    }
}

fn rebase(header: Header, size: u64, digest: Digest) -> Header {
    Header::new(header.path(), size, header.mode(), header.mod_time(), header.change_time())
        .with_digest(digest)
}

/// A node of the tree
#[derive(Debug, Clone)]
pub enum Node {
    File(Asset),
    Dir(Dir),
}

impl Node {
    pub fn is_dir(&self) -> bool {
        matches!(self, Node::Dir(_))
    }

    pub fn path(&self) -> &str {
        match self {
            Node::File(a) => a.path(),
            Node::Dir(d) => d.path(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Node::File(a) => a.name(),
            Node::Dir(d) => d.name(),
        }
    }

    pub fn position(&self) -> Position {
        match self {
            Node::File(a) => a.position(),
            Node::Dir(d) => d.position(),
        }
    }

    /// Content size; 0 for directories
    pub fn size(&self) -> u64 {
        match self {
            Node::File(a) => a.size(),
            Node::Dir(_) => 0,
        }
    }

    pub fn mode(&self) -> u32 {
        match self {
            Node::File(a) => a.mode(),
            Node::Dir(_) => DIR_MODE,
        }
    }

    /// Modification time; directories have none
    pub fn mod_time(&self) -> Option<DateTime<Utc>> {
        match self {
            Node::File(a) => Some(a.mod_time()),
            Node::Dir(_) => None,
        }
    }

    pub fn as_asset(&self) -> Option<&Asset> {
        match self {
            Node::File(a) => Some(a),
            Node::Dir(_) => None,
        }
    }

    pub fn as_dir(&self) -> Option<&Dir> {
        match self {
            Node::Dir(d) => Some(d),
            Node::File(_) => None,
        }
    }

    /// Write this node (and for directories, everything below it) under
    /// `target` at its full logical path; returns the number of files written
    pub fn restore(&self, target: impl AsRef<Path>) -> Result<usize> {
        match self {
            Node::File(a) => a.restore(target).map(|_| 1),
            Node::Dir(d) => d.restore(target),
        }
    }
}

/// What a walk visitor wants next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Walk {
    Continue,
    /// Do not descend into this directory; ignored for files
    SkipDir,
}

/// A synthesized directory
#[derive(Debug, Clone, Default)]
pub struct Dir {
    path: String,
    name: String,
    position: Position,
    children: Vec<Node>,
}

#[derive(Default)]
struct Builder {
    asset: Option<Asset>,
    children: BTreeMap<String, Builder>,
}

impl Dir {
    /// Fold assets into a tree rooted at an unnamed directory
    ///
    /// Fails with `PathConflict` when a path is used both as a file and as a
    /// directory, and with `InvalidPath` for empty or dot segments.
    pub fn build(assets: &AssetMap) -> Result<Dir> {
        let mut root = Builder::default();
        for (key, asset) in assets {
            insert(&mut root, key, asset)?;
        }

        let root_pos = Position {
            depth: 0,
            index: 0,
            first: true,
            last: true,
        };
        let dir = finish_dir(root, String::new(), String::new(), root_pos);
        debug!(
            "Built asset tree: {} assets, {} top-level entries",
            assets.len(),
            dir.children.len()
        );
        Ok(dir)
    }

    /// Full logical path; empty for the root
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn position(&self) -> Position {
        self.position
    }

    pub fn is_root(&self) -> bool {
        self.position.depth == 0
    }

    /// Direct children in name order
    pub fn list(&self) -> &[Node] {
        &self.children
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn child(&self, name: &str) -> Option<&Node> {
        self.children
            .binary_search_by(|n| n.name().cmp(name))
            .ok()
            .map(|i| &self.children[i])
    }

    /// Resolve a path relative to this directory
    ///
    /// Fails with `NotFound` naming the first missing segment's path, or
    /// `NotADirectory` when a non-final segment is a file.
    pub fn get(&self, path: &str) -> Result<&Node> {
        let segments = split(path);
        if segments.is_empty() {
            return Err(AssetError::InvalidPath(path.to_string()));
        }

        let mut dir = self;
        for (i, seg) in segments.iter().enumerate() {
            let node = dir
                .child(seg)
                .ok_or_else(|| AssetError::NotFound(segments[..=i].join("/")))?;
            if i + 1 == segments.len() {
                return Ok(node);
            }
            match node {
                Node::Dir(d) => dir = d,
                Node::File(_) => return Err(AssetError::NotADirectory(segments[..=i].join("/"))),
            }
        }
        Err(AssetError::InvalidPath(path.to_string()))
    }

    /// Like [`get`](Self::get) but the target must be a directory; `""` and
    /// `"."` name this directory
    pub fn get_dir(&self, path: &str) -> Result<&Dir> {
        if split(path).is_empty() {
            return Ok(self);
        }
        match self.get(path)? {
            Node::Dir(d) => Ok(d),
            Node::File(a) => Err(AssetError::NotADirectory(a.path().to_string())),
        }
    }

    /// Like [`get`](Self::get) but the target must be a file
    pub fn find_asset(&self, path: &str) -> Result<&Asset> {
        match self.get(path)? {
            Node::File(a) => Ok(a),
            Node::Dir(d) => Err(AssetError::NotAFile(d.path().to_string())),
        }
    }

    /// Depth-first, parent before children, siblings in name order
    ///
    /// This directory itself is not visited. The first visitor error aborts
    /// the walk and is returned.
    pub fn walk<F>(&self, mut visit: F) -> Result<()>
    where
        F: FnMut(&Node) -> Result<Walk>,
    {
        self.walk_inner(&mut visit)
    }

    fn walk_inner<F>(&self, visit: &mut F) -> Result<()>
    where
        F: FnMut(&Node) -> Result<Walk>,
    {
        for child in &self.children {
            let next = visit(child)?;
            if let (Node::Dir(d), Walk::Continue) = (child, next) {
                d.walk_inner(visit)?;
            }
        }
        Ok(())
    }

    /// All assets below this directory in walk order
    pub fn assets(&self) -> Vec<&Asset> {
        let mut out = Vec::new();
        collect_assets(self, &mut out);
        out
    }

    /// Write every asset below this directory under `target`, each at its
    /// full logical path; returns the number of files written
    pub fn restore(&self, target: impl AsRef<Path>) -> Result<usize> {
        let target = target.as_ref();
        let mut count = 0;
        if !self.path.is_empty() {
            let here = logical_join(target, &self.path);
            fs::create_dir_all(&here).map_err(|e| AssetError::io(&here, e))?;
        }
        self.walk(|node| {
            match node {
                Node::File(a) => {
                    a.restore(target)?;
                    count += 1;
                }
                Node::Dir(d) => {
                    let dest = logical_join(target, d.path());
                    fs::create_dir_all(&dest).map_err(|e| AssetError::io(&dest, e))?;
                }
            }
            Ok(Walk::Continue)
        })?;
        debug!("Restored {} files from {:?} into {}", count, self.path, target.display());
        Ok(count)
    }
}

fn collect_assets<'a>(dir: &'a Dir, out: &mut Vec<&'a Asset>) {
    for child in &dir.children {
        match child {
            Node::File(a) => out.push(a),
            Node::Dir(d) => collect_assets(d, out),
        }
    }
}

fn split(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty() && *s != ".").collect()
}

fn insert(root: &mut Builder, key: &str, asset: &Asset) -> Result<()> {
    let segments: Vec<&str> = key.split('/').collect();
    if segments.iter().any(|s| s.is_empty() || *s == "." || *s == "..") {
        return Err(AssetError::InvalidPath(key.to_string()));
    }

    let (leaf, parents) = match segments.split_last() {
        Some(parts) => parts,
        None => return Err(AssetError::InvalidPath(key.to_string())),
    };

    let mut node = root;
    for (i, seg) in parents.iter().enumerate() {
        node = node.children.entry((*seg).to_string()).or_default();
        if node.asset.is_some() {
            return Err(AssetError::PathConflict(segments[..=i].join("/")));
        }
    }

    let slot = node.children.entry((*leaf).to_string()).or_default();
    if slot.asset.is_some() || !slot.children.is_empty() {
        return Err(AssetError::PathConflict(key.to_string()));
    }
    slot.asset = Some(asset.clone());
    Ok(())
}

fn finish_dir(builder: Builder, path: String, name: String, position: Position) -> Dir {
    let count = builder.children.len();
    let children = builder
        .children
        .into_iter()
        .enumerate()
        .map(|(index, (child_name, child))| {
            let pos = Position {
                depth: position.depth + 1,
                index,
                first: index == 0,
                last: index + 1 == count,
            };
            let child_path = if path.is_empty() {
                child_name.clone()
            } else {
                format!("{}/{}", path, child_name)
            };
            match child.asset {
                Some(asset) => Node::File(asset.with_position(pos)),
                None => Node::Dir(finish_dir(child, child_path, child_name, pos)),
            }
        })
        .collect();

    Dir {
        path,
        name,
        position,
        children,
    }
}

/// `dir` joined with each segment of a slash-separated logical path
pub(crate) fn logical_join(dir: &Path, logical: &str) -> PathBuf {
    logical
        .split('/')
        .filter(|s| !s.is_empty())
        .fold(dir.to_path_buf(), |acc, seg| acc.join(seg))
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let perm = mode & 0o7777;
    if perm == 0 {
        return Ok(());
    }
    fs::set_permissions(path, fs::Permissions::from_mode(perm)).map_err(|e| AssetError::io(path, e))
}

#[cfg(not(unix))]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    let mut perms = fs::metadata(path).map_err(|e| AssetError::io(path, e))?.permissions();
    perms.set_readonly(mode & 0o200 == 0);
    fs::set_permissions(path, perms).map_err(|e| AssetError::io(path, e))
}

impl fmt::Display for Dir {
    /// Indented listing, one node per line
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn write_level(dir: &Dir, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            for child in dir.list() {
                let indent = "  ".repeat(child.position().depth.saturating_sub(1));
                match child {
                    Node::Dir(d) => {
                        writeln!(f, "{}{}/", indent, d.name())?;
                        write_level(d, f)?;
                    }
                    Node::File(a) => writeln!(f, "{}{} ({} bytes)", indent, a.name(), a.size())?,
                }
            }
            Ok(())
        }
        write_level(self, f)
    }
}
