//! Veilshare
//!
//! Decentralized file sharing between hidden-service peers. Every node
//! is a servent: it serves its shared directories to peers, downloads
//! from peers, announces its inventory to index servers and queries
//! them for files held by others. All traffic is framed documents over
//! a mutually authenticated channel carried through an anonymizing
//! overlay (a SOCKS dialer to a hidden service).
//!
//! # Module Structure
//!
//! - `alloc`: recyclable buffer pool threaded through every connection
//! - `network`: document wire format, framed codec, dialing capability
//! - `security`: P-256 identities and the mutual handshake
//! - `peer`: the file-transfer session (server and client sides)
//! - `index`: the inventory/search session (server and client sides)
//! - `search`: keyword index realizing the query capability
//! - `servent`: orchestration (pools, verification, replication, fan-out)
//! - `config`: ports and tunables
//! - `testing`: in-memory capabilities for tests
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use veilshare::{
//!     alloc::BufferPool, config::Config, peer, security,
//!     servent::ServentConfig,
//! };
//!
//! let servent = ServentConfig {
//!     fs: Arc::new(peer::Dir::new("/srv/share")),
//!     target: Arc::new(peer::DownloadFolder::new("/srv/downloads")),
//!     metadata: None,
//!     pool: BufferPool::with_defaults(),
//!     key_pair: security::generate_key_pair("myself.onion".into()),
//!     dialer: socks_dialer, // from the hidden-service control channel
//!     config: Config::default(),
//! }
//! .create();
//!
//! servent.add_server("index.onion").await?;
//! let client = servent.get_client("peer.onion").await?;
//! ```

pub mod alloc;
pub mod config;
pub mod index;
pub mod network;
pub mod peer;
pub mod search;
pub mod security;
pub mod servent;
pub mod testing;

// Re-export main API types for convenience
pub use alloc::{Buffer, BufferPool};
pub use config::{Config, PORT_C2S, PORT_P2P};
pub use network::{Dialer, Doc, DocBuilder, OwnedElement};
pub use peer::{PeerPath, PeerError};
pub use security::{generate_key_pair, KeyPair, KeySet};
pub use servent::{PeerConnectAuth, Servent, ServentConfig};
