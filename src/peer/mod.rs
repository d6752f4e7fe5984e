//! Peer-to-peer file transfer protocol
//!
//! A peer session is full duplex and carries mixed traffic: handshake
//! and request/response control messages plus bulk file streams. The
//! serving side schedules control ahead of bulk with a two-queue
//! priority writer and bounds concurrent transfers; the client side
//! demultiplexes the inbound stream and routes file chunks into sinks
//! gated by per-download tokens.

pub mod client;
pub mod fs;
pub mod server;

use std::any::Any;
use std::collections::HashMap;

use parking_lot::Mutex;

pub use client::{Client, ClientContext};
pub use fs::{
    bad_file_name, clean_file_name, Dir, DirMap, DirSet, DownloadFolder, FileSink, FileSource,
    FileSystem, FileSystemEx, FsError, TargetStore,
};
pub use server::Server;

/// A remote share path: a share namespace and a leaf filename.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerPath {
    /// Share namespace, normally the owning peer's domain
    pub domain: String,
    /// Leaf name, no separators
    pub name: String,
}

impl PeerPath {
    /// Build a path from its two components.
    pub fn new(domain: impl Into<String>, name: impl Into<String>) -> Self {
        Self { domain: domain.into(), name: name.into() }
    }
}

impl std::fmt::Display for PeerPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.domain, self.name)
    }
}

/// Opaque handle supplied at request time; consumed by the first
/// matching `dl.start` and handed to the target store.
pub type DownloadToken = Box<dyn Any + Send>;

/// Error in a peer session
#[derive(Debug)]
pub enum PeerError {
    /// Handshake failed to produce key material
    Crypto,
    /// Malformed or unexpected document structure
    Protocol,
    /// Session is closed
    Closed,
    /// The serving peer refused the transfer
    Refused {
        /// Status code from the reply
        code: i32,
        /// Server-supplied text
        message: String,
    },
    /// Transport error
    Io(String),
}

impl std::fmt::Display for PeerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerError::Crypto => write!(f, "crypto error"),
            PeerError::Protocol => write!(f, "protocol error"),
            PeerError::Closed => write!(f, "session closed"),
            PeerError::Refused { code, message } => {
                write!(f, "transfer refused ({}): {}", code, message)
            }
            PeerError::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for PeerError {}

impl From<std::io::Error> for PeerError {
    fn from(e: std::io::Error) -> Self {
        PeerError::Io(e.to_string())
    }
}

/// Map of requested paths to their download tokens.
///
/// A token goes in at request time and comes out exactly once, when the
/// transfer's `dl.start` arrives.
#[derive(Default)]
pub struct PathTokenMap {
    inner: Mutex<HashMap<PeerPath, DownloadToken>>,
}

impl PathTokenMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a token for a path, replacing any previous one.
    pub fn put(&self, path: PeerPath, token: DownloadToken) {
        self.inner.lock().insert(path, token);
    }

    /// Remove and return the token for a path.
    pub fn take(&self, path: &PeerPath) -> Option<DownloadToken> {
        self.inner.lock().remove(path)
    }

    /// Whether a token is stored for a path.
    pub fn contains(&self, path: &PeerPath) -> bool {
        self.inner.lock().contains_key(path)
    }
}
