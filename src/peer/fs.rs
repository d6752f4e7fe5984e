//! Filesystem capabilities for serving shares and storing downloads
//!
//! Serving adapters map a `(share, filename)` path onto local
//! directories; the download side creates sinks for inbound transfers.
//! Filenames crossing the trust boundary are checked on the way out
//! (reject) and sanitized on the way in (rewrite).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncRead, AsyncWrite};

use crate::peer::{DownloadToken, PeerPath};

/// An open readable file handed to the transfer writer.
pub type FileSource = Box<dyn AsyncRead + Send + Unpin>;

/// An open writable sink for an inbound transfer.
pub type FileSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Filesystem error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsError {
    /// Unknown share directory
    DirNotFound,
    /// Unknown or rejected filename
    FileNotFound,
    /// No token authorizes this download
    DownloadRejected,
    /// Underlying filesystem error
    Io(String),
}

impl std::fmt::Display for FsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FsError::DirNotFound => write!(f, "dir not found"),
            FsError::FileNotFound => write!(f, "file not found"),
            FsError::DownloadRejected => write!(f, "download rejected"),
            FsError::Io(e) => write!(f, "fs error: {}", e),
        }
    }
}

impl std::error::Error for FsError {}

impl From<std::io::Error> for FsError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::NotFound {
            FsError::FileNotFound
        } else {
            FsError::Io(e.to_string())
        }
    }
}

/// Capability to open shared files for reading.
pub trait FileSystem: Send + Sync {
    /// Open the file at `path` for reading.
    fn open(&self, path: &PeerPath) -> Result<FileSource, FsError>;
}

/// Enumeration capability on top of [`FileSystem`].
pub trait FileSystemEx: FileSystem {
    /// Names of the share directories.
    fn dirs(&self) -> Vec<String>;

    /// Leaf filenames inside one share directory.
    fn files(&self, dir: &str) -> Result<Vec<String>, FsError>;
}

/// Capability to create sinks for inbound transfers.
pub trait TargetStore: Send + Sync {
    /// Create a sink for `path`. `token` is the handle stored at request
    /// time; `None` means no request matches this transfer.
    fn create(&self, token: Option<DownloadToken>, path: &PeerPath)
        -> Result<FileSink, FsError>;
}

/// Whether a wire filename must be rejected: any path separator, or the
/// literal `.`.
pub fn bad_file_name(name: &str) -> bool {
    if name == "." {
        return true;
    }
    name.bytes()
        .any(|b| b == b'/' || b == b'\\' || b == std::path::MAIN_SEPARATOR as u8)
}

/// Rewrite a wire filename for local storage: separators and control
/// bytes become `_`.
pub fn clean_file_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c < ' ' || c == '/' || c == '\\' || c == std::path::MAIN_SEPARATOR {
                '_'
            } else {
                c
            }
        })
        .collect()
}

fn leaf_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn open_source(path: PathBuf) -> Result<FileSource, FsError> {
    let file = std::fs::File::open(path)?;
    Ok(Box::new(tokio::fs::File::from_std(file)))
}

fn read_names(path: &Path) -> Result<Vec<String>, FsError> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(path)? {
        names.push(entry?.file_name().to_string_lossy().into_owned());
    }
    Ok(names)
}

/// A single shared directory; its share name is the directory's leaf name.
#[derive(Debug, Clone)]
pub struct Dir {
    path: PathBuf,
}

impl Dir {
    /// Share the given directory.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn share_name(&self) -> String {
        leaf_name(&self.path)
    }
}

impl FileSystem for Dir {
    fn open(&self, path: &PeerPath) -> Result<FileSource, FsError> {
        if bad_file_name(&path.name) {
            return Err(FsError::FileNotFound);
        }
        if path.domain != self.share_name() {
            return Err(FsError::DirNotFound);
        }
        open_source(self.path.join(&path.name))
    }
}

impl FileSystemEx for Dir {
    fn dirs(&self) -> Vec<String> {
        vec![self.share_name()]
    }

    fn files(&self, dir: &str) -> Result<Vec<String>, FsError> {
        if dir != self.share_name() {
            return Err(FsError::DirNotFound);
        }
        read_names(&self.path)
    }
}

/// A collection of shared directories tried in order.
#[derive(Debug, Clone, Default)]
pub struct DirSet {
    dirs: Vec<Dir>,
}

impl DirSet {
    /// Share the given directories.
    pub fn new(dirs: Vec<Dir>) -> Self {
        Self { dirs }
    }
}

impl FileSystem for DirSet {
    fn open(&self, path: &PeerPath) -> Result<FileSource, FsError> {
        let mut last = Err(FsError::DirNotFound);
        for dir in &self.dirs {
            last = dir.open(path);
            if !matches!(last, Err(FsError::DirNotFound)) {
                break;
            }
        }
        last
    }
}

impl FileSystemEx for DirSet {
    fn dirs(&self) -> Vec<String> {
        self.dirs.iter().map(Dir::share_name).collect()
    }

    fn files(&self, dir: &str) -> Result<Vec<String>, FsError> {
        let mut last = Err(FsError::DirNotFound);
        for d in &self.dirs {
            last = d.files(dir);
            if !matches!(last, Err(FsError::DirNotFound)) {
                break;
            }
        }
        last
    }
}

/// Share names mapped onto arbitrary directories.
#[derive(Debug, Clone, Default)]
pub struct DirMap {
    map: HashMap<String, PathBuf>,
}

impl DirMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Map a share name onto a directory.
    pub fn insert(&mut self, share: impl Into<String>, dir: impl Into<PathBuf>) {
        self.map.insert(share.into(), dir.into());
    }
}

impl FileSystem for DirMap {
    fn open(&self, path: &PeerPath) -> Result<FileSource, FsError> {
        if bad_file_name(&path.name) {
            return Err(FsError::FileNotFound);
        }
        let dir = self.map.get(&path.domain).ok_or(FsError::DirNotFound)?;
        open_source(dir.join(&path.name))
    }
}

impl FileSystemEx for DirMap {
    fn dirs(&self) -> Vec<String> {
        self.map.keys().cloned().collect()
    }

    fn files(&self, dir: &str) -> Result<Vec<String>, FsError> {
        let path = self.map.get(dir).ok_or(FsError::DirNotFound)?;
        read_names(path)
    }
}

/// Target store that writes every accepted download into one folder.
#[derive(Debug, Clone)]
pub struct DownloadFolder {
    dir: PathBuf,
}

impl DownloadFolder {
    /// Store downloads under the given directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// A token accepted by this store.
    pub fn token(&self) -> DownloadToken {
        Box::new(())
    }
}

impl TargetStore for DownloadFolder {
    fn create(
        &self,
        token: Option<DownloadToken>,
        path: &PeerPath,
    ) -> Result<FileSink, FsError> {
        if token.is_none() {
            return Err(FsError::DownloadRejected);
        }
        let name = clean_file_name(&path.name);
        let file = std::fs::File::create(self.dir.join(name)).map_err(|e| FsError::Io(e.to_string()))?;
        Ok(Box::new(tokio::fs::File::from_std(file)))
    }
}
