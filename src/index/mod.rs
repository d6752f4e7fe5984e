//! Index server protocol
//!
//! A servent logs in to an index server with its identity, publishes
//! metadata documents for its shared files, and queries the server for
//! files held by other peers. Authentication and the query layer are
//! capabilities supplied by the embedding application; the wire session
//! lives in `server` and `client`.

pub mod client;
pub mod server;

use std::sync::Arc;

use crate::network::document::Doc;

pub use client::{Client, ClientContext};
pub use server::Server;

/// Login status carried by a session token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Verification has not finished yet
    Pending,
    /// The claimed identity could not be verified
    Rejected,
    /// The login is verified
    Accepted,
}

impl Status {
    /// Wire encoding of the status.
    pub fn as_i32(self) -> i32 {
        match self {
            Status::Pending => 0,
            Status::Rejected => 1,
            Status::Accepted => 2,
        }
    }

    /// Decode a wire status; unknown values read as Pending.
    pub fn from_i32(v: i32) -> Self {
        match v {
            1 => Status::Rejected,
            2 => Status::Accepted,
            _ => Status::Pending,
        }
    }
}

/// Error in an index session
#[derive(Debug)]
pub enum IndexError {
    /// The handshake digest did not match
    AuthFailed,
    /// Handshake failed to produce key material
    Crypto,
    /// Malformed or unexpected document structure
    Protocol,
    /// Transport error
    Io(String),
}

impl std::fmt::Display for IndexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexError::AuthFailed => write!(f, "auth failed"),
            IndexError::Crypto => write!(f, "crypto error"),
            IndexError::Protocol => write!(f, "protocol error"),
            IndexError::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for IndexError {}

impl From<std::io::Error> for IndexError {
    fn from(e: std::io::Error) -> Self {
        IndexError::Io(e.to_string())
    }
}

/// A session's evolving login state.
pub trait SessionToken: Send + Sync {
    /// Current status of the login.
    fn status(&self) -> Status;

    /// The authenticated domain.
    fn domain(&self) -> &str;
}

/// Capability that turns a proven key possession into a session token.
pub trait Auth: Send + Sync {
    /// Begin a login for `(public, domain)`.
    fn login(&self, public: &[u8], domain: &str) -> Arc<dyn SessionToken>;
}

/// Capability over the inventory the index server maintains.
///
/// Publish and retract are expected to silently ignore tokens that are
/// not `Accepted`; a query against a `Rejected` token never reaches this
/// layer.
pub trait Queries: Send + Sync {
    /// Drop everything the session published.
    fn retract_all(&self, token: &dyn SessionToken);

    /// Add one metadata document to the inventory.
    fn publish(&self, token: &dyn SessionToken, doc: Doc<'_>);

    /// Remove one metadata document from the inventory.
    fn retract(&self, token: &dyn SessionToken, doc: Doc<'_>);

    /// Evaluate a terms document, returning an encoded response document
    /// with at most `max` results.
    fn query(&self, token: &dyn SessionToken, terms: Doc<'_>, max: usize) -> Vec<u8>;
}
