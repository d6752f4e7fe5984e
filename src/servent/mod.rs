//! Servent orchestration
//!
//! A servent is a server and a client at once: it serves its shares to
//! peers, downloads from peers, replicates its inventory to index
//! servers and fans queries out across them. This module owns the two
//! connection pools (peers and index sessions, one live entry per
//! remote domain), the accept loop, and the filesystem event fan-out.

pub mod supervisor;
pub mod verify;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::alloc::BufferPool;
use crate::config::{Config, PORT_C2S, PORT_P2P};
use crate::index;
use crate::network::dialer::Dialer;
use crate::network::document::OwnedElement;
use crate::peer::{
    self, FileSystemEx, FsError, PeerError, PeerPath, TargetStore,
};
use crate::security::KeyPair;

pub use supervisor::{EventKind, FsEvent, IndexSession};
pub use verify::PeerConnectAuth;

/// Capability that extracts a metadata document from a shared file.
///
/// Failures fall back to the minimal `{_, f}` document at the call site.
pub trait MetadataAdapter: Send + Sync {
    /// Extract metadata for `path`.
    fn metadata(&self, fs: &dyn FileSystemEx, path: &PeerPath) -> Result<Vec<u8>, FsError>;
}

/// Everything a servent needs to run.
pub struct ServentConfig {
    /// Shared directories served to peers
    pub fs: Arc<dyn FileSystemEx>,
    /// Store receiving accepted downloads
    pub target: Arc<dyn TargetStore>,
    /// Metadata extractor for published inventory, if any
    pub metadata: Option<Arc<dyn MetadataAdapter>>,
    /// Buffer pool threaded through every connection
    pub pool: Arc<BufferPool>,
    /// This node's identity
    pub key_pair: KeyPair,
    /// Overlay dialer for outgoing connections
    pub dialer: Arc<dyn Dialer>,
    /// Tunables
    pub config: Config,
}

impl ServentConfig {
    /// Assemble the servent.
    pub fn create(self) -> Arc<Servent> {
        let server = Arc::new(peer::Server::new(
            self.pool.clone(),
            self.fs.clone(),
            self.key_pair.clone(),
            self.config.clone(),
        ));
        let peer_ctx = peer::ClientContext::new(self.pool.clone(), self.target.clone());
        let index_ctx = index::ClientContext::new(self.pool.clone(), self.key_pair.clone());

        Arc::new(Servent {
            server,
            peer_ctx,
            index_ctx,
            fs: self.fs,
            metadata: self.metadata,
            dialer: self.dialer,
            config: self.config,
            peers: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
        })
    }
}

/// A running servent node.
pub struct Servent {
    server: Arc<peer::Server>,
    peer_ctx: peer::ClientContext,
    index_ctx: index::ClientContext,
    fs: Arc<dyn FileSystemEx>,
    metadata: Option<Arc<dyn MetadataAdapter>>,
    dialer: Arc<dyn Dialer>,
    config: Config,
    /// Peer pool: at most one live client per remote domain
    peers: RwLock<HashMap<String, Arc<peer::Client>>>,
    /// Index pool: at most one supervised session per remote domain
    sessions: RwLock<HashMap<String, Arc<IndexSession>>>,
}

impl Servent {
    // ========== Serving ==========

    /// Serve one inbound peer connection.
    pub async fn serve_p2p_conn<S>(&self, stream: S)
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
    {
        self.server.serve(stream).await;
    }

    /// Accept peer connections until cancelled. Accept errors back off
    /// for a second instead of spinning.
    pub async fn serve_p2p(&self, listener: TcpListener, cancel: CancellationToken) {
        info!("peer accept loop running");
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, addr)) => {
                    debug!(peer = %addr, "inbound peer connection");
                    let server = self.server.clone();
                    tokio::spawn(async move { server.serve(stream).await });
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => {}
                    }
                }
            }
        }
        info!("peer accept loop stopped");
    }

    // ========== Peer pool ==========

    /// Get the live client for a peer domain, dialing if necessary.
    pub async fn get_client(&self, domain: &str) -> Result<Arc<peer::Client>, PeerError> {
        let stale = {
            let peers = self.peers.read().await;
            match peers.get(domain) {
                Some(client) if client.alive() => return Ok(client.clone()),
                Some(client) => Some(client.clone()),
                None => None,
            }
        };
        if let Some(stale) = stale {
            self.evict_peer(domain, &stale).await;
        }

        let conduit = self.dialer.dial(domain, PORT_P2P).await?;
        let client = self.peer_ctx.new_client(conduit);

        // Load-or-store: another task may have installed a client while
        // we were dialing; the loser closes its connection.
        let winner = {
            let mut peers = self.peers.write().await;
            match peers.get(domain) {
                Some(existing) => Some(existing.clone()),
                None => {
                    peers.insert(domain.to_string(), client.clone());
                    None
                }
            }
        };
        match winner {
            Some(existing) => {
                debug!(domain = %domain, "lost dial race, using existing client");
                client.close().await;
                Ok(existing)
            }
            None => {
                debug!(domain = %domain, "peer client installed");
                Ok(client)
            }
        }
    }

    /// Drop a peer client, closing it when still alive.
    pub async fn remove_client(&self, domain: &str) {
        let current = self.peers.read().await.get(domain).cloned();
        if let Some(client) = current {
            self.evict_peer(domain, &client).await;
            if client.alive() {
                client.close().await;
            }
        }
    }

    /// Remove the pool entry only if it still is this exact client, so a
    /// concurrently installed replacement survives.
    async fn evict_peer(&self, domain: &str, dead: &Arc<peer::Client>) {
        let mut peers = self.peers.write().await;
        if let Some(current) = peers.get(domain) {
            if Arc::ptr_eq(current, dead) {
                peers.remove(domain);
            }
        }
    }

    // ========== Index pool ==========

    async fn get_session(&self, domain: &str) -> Result<Arc<IndexSession>, index::IndexError> {
        let stale = {
            let sessions = self.sessions.read().await;
            match sessions.get(domain) {
                Some(session) if session.alive() => return Ok(session.clone()),
                Some(session) => Some(session.clone()),
                None => None,
            }
        };
        if let Some(stale) = stale {
            self.evict_session(domain, &stale).await;
        }

        let conduit = self.dialer.dial(domain, PORT_C2S).await?;
        let client = Arc::new(self.index_ctx.new_client(conduit).await?);

        let installed = {
            let mut sessions = self.sessions.write().await;
            match sessions.get(domain) {
                Some(existing) => Err(existing.clone()),
                None => {
                    let session = IndexSession::spawn(
                        client.clone(),
                        self.fs.clone(),
                        self.metadata.clone(),
                        &self.config,
                    );
                    sessions.insert(domain.to_string(), session.clone());
                    Ok(session)
                }
            }
        };
        match installed {
            Ok(session) => {
                debug!(domain = %domain, "index session installed");
                Ok(session)
            }
            Err(existing) => {
                debug!(domain = %domain, "lost dial race, using existing session");
                client.close().await;
                Ok(existing)
            }
        }
    }

    async fn evict_session(&self, domain: &str, dead: &Arc<IndexSession>) {
        let mut sessions = self.sessions.write().await;
        if let Some(current) = sessions.get(domain) {
            if Arc::ptr_eq(current, dead) {
                sessions.remove(domain);
            }
        }
    }

    /// Connect to an index server (idempotent per domain).
    pub async fn add_server(&self, domain: &str) -> Result<(), index::IndexError> {
        self.get_session(domain).await.map(|_| ())
    }

    /// Disconnect from an index server.
    pub async fn remove_server(&self, domain: &str) {
        let current = self.sessions.read().await.get(domain).cloned();
        if let Some(session) = current {
            self.evict_session(domain, &session).await;
            if session.alive() {
                session.client().close().await;
                session.wake();
            }
        }
    }

    /// Domains of the connected index servers.
    pub async fn servers(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    async fn snapshot_sessions(&self) -> Vec<Arc<IndexSession>> {
        self.sessions.read().await.values().cloned().collect()
    }

    // ========== Queries and events ==========

    /// Fan a query out across every connected index session and union
    /// the results. A failing session is woken so its supervisor
    /// re-checks status; the first error surfaces only when the union
    /// is empty.
    pub async fn query(
        &self,
        terms: &[u8],
        max_per_conn: usize,
    ) -> Result<Vec<OwnedElement>, index::IndexError> {
        let sessions = self.snapshot_sessions().await;
        let mut results = Vec::new();
        let mut first_error = None;

        for session in sessions {
            match session.client().query(terms, max_per_conn).await {
                Ok(mut elems) => results.append(&mut elems),
                Err(e) => {
                    debug!(error = %e, "query leg failed");
                    session.wake();
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        match first_error {
            Some(e) if results.is_empty() => Err(e),
            _ => Ok(results),
        }
    }

    async fn fan_out(&self, paths: Vec<PeerPath>, kind: EventKind) {
        let sessions = self.snapshot_sessions().await;
        for session in sessions {
            session
                .deliver(FsEvent { paths: paths.clone(), kind })
                .await;
        }
    }

    /// Announce newly shared files to every index session.
    pub async fn created(&self, paths: Vec<PeerPath>) {
        self.fan_out(paths, EventKind::Created).await;
    }

    /// Announce changed files to every index session.
    pub async fn changed(&self, paths: Vec<PeerPath>) {
        self.fan_out(paths, EventKind::Changed).await;
    }

    /// Announce removed files to every index session.
    pub async fn removed(&self, paths: Vec<PeerPath>) {
        self.fan_out(paths, EventKind::Removed).await;
    }
}
