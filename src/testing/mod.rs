//! Test utilities
//!
//! In-memory stand-ins for the filesystem and download-store
//! capabilities, used by unit and integration tests.

use std::collections::BTreeMap;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::peer::{
    DownloadToken, FileSink, FileSource, FileSystem, FileSystemEx, FsError, PeerPath, TargetStore,
};

/// In-memory share: `(share, filename) -> contents`.
#[derive(Debug, Default)]
pub struct MemFs {
    files: BTreeMap<(String, String), Vec<u8>>,
}

impl MemFs {
    /// Create an empty share.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a file.
    pub fn insert(&mut self, share: &str, name: &str, data: impl Into<Vec<u8>>) {
        self.files
            .insert((share.to_string(), name.to_string()), data.into());
    }
}

impl FileSystem for MemFs {
    fn open(&self, path: &PeerPath) -> Result<FileSource, FsError> {
        if crate::peer::bad_file_name(&path.name) {
            return Err(FsError::FileNotFound);
        }
        let key = (path.domain.clone(), path.name.clone());
        let data = self.files.get(&key).ok_or(FsError::FileNotFound)?;
        Ok(Box::new(io::Cursor::new(data.clone())))
    }
}

impl FileSystemEx for MemFs {
    fn dirs(&self) -> Vec<String> {
        let mut dirs: Vec<String> = self.files.keys().map(|(d, _)| d.clone()).collect();
        dirs.dedup();
        dirs
    }

    fn files(&self, dir: &str) -> Result<Vec<String>, FsError> {
        let names: Vec<String> = self
            .files
            .keys()
            .filter(|(d, _)| d == dir)
            .map(|(_, f)| f.clone())
            .collect();
        if names.is_empty() {
            return Err(FsError::DirNotFound);
        }
        Ok(names)
    }
}

/// Target store that collects downloads into shared memory.
#[derive(Debug, Default)]
pub struct MemStore {
    downloads: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl MemStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// A token accepted by this store.
    pub fn token(&self) -> DownloadToken {
        Box::new(())
    }

    /// Snapshot of a finished download by wire filename.
    pub fn get(&self, name: &str) -> Option<Vec<u8>> {
        self.downloads.lock().get(name).cloned()
    }

    /// Number of downloads started.
    pub fn len(&self) -> usize {
        self.downloads.lock().len()
    }

    /// Whether no download has started.
    pub fn is_empty(&self) -> bool {
        self.downloads.lock().is_empty()
    }
}

impl TargetStore for MemStore {
    fn create(
        &self,
        token: Option<DownloadToken>,
        path: &PeerPath,
    ) -> Result<FileSink, FsError> {
        if token.is_none() {
            return Err(FsError::DownloadRejected);
        }
        let name = crate::peer::clean_file_name(&path.name);
        let downloads = self.downloads.clone();
        downloads.lock().insert(name.clone(), Vec::new());
        Ok(Box::new(MemSink { name, downloads }))
    }
}

/// Sink backing [`MemStore`].
struct MemSink {
    name: String,
    downloads: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl AsyncWrite for MemSink {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if let Some(data) = this.downloads.lock().get_mut(&this.name) {
            data.extend_from_slice(buf);
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// A read source that reports EOF only once released; used to hold a
/// transfer in flight.
pub struct StallSource {
    release: tokio::sync::oneshot::Receiver<()>,
    done: bool,
}

impl StallSource {
    /// Create a stalled source and its release handle.
    pub fn new() -> (Self, tokio::sync::oneshot::Sender<()>) {
        let (tx, rx) = tokio::sync::oneshot::channel();
        (Self { release: rx, done: false }, tx)
    }
}

impl AsyncRead for StallSource {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(Ok(()));
        }
        match Pin::new(&mut this.release).poll(cx) {
            Poll::Ready(_) => {
                this.done = true;
                // EOF once released.
                Poll::Ready(Ok(()))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
