//! Per-index-session supervisor
//!
//! One task per connected index server. While the login is pending it
//! polls the status on a timer; on acceptance it replicates the full
//! local inventory, then streams incremental filesystem events. A
//! liveness signal forces an immediate status poll so a dead connection
//! is detected outside the timer cadence.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::index::{Client, Status};
use crate::network::document::DocBuilder;
use crate::peer::{FileSystemEx, PeerPath};
use crate::servent::MetadataAdapter;

/// Depth of the filesystem-event queue.
const EVENT_QUEUE_DEPTH: usize = 128;

/// What happened to a batch of shared paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Files appeared
    Created,
    /// Files changed
    Changed,
    /// Files disappeared
    Removed,
}

/// A filesystem change delivered to every index session.
#[derive(Debug, Clone)]
pub struct FsEvent {
    /// Affected paths
    pub paths: Vec<PeerPath>,
    /// What happened
    pub kind: EventKind,
}

/// A supervised index session.
pub struct IndexSession {
    client: Arc<Client>,
    alive: CancellationToken,
    signal: Arc<Notify>,
    events: mpsc::Sender<FsEvent>,
}

impl IndexSession {
    /// Wrap a logged-in client and start its supervisor task.
    pub fn spawn(
        client: Arc<Client>,
        fs: Arc<dyn FileSystemEx>,
        metadata: Option<Arc<dyn MetadataAdapter>>,
        config: &Config,
    ) -> Arc<Self> {
        let alive = CancellationToken::new();
        let signal = Arc::new(Notify::new());
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);

        let session = Arc::new(Self {
            client: client.clone(),
            alive: alive.clone(),
            signal: signal.clone(),
            events: event_tx,
        });

        let supervisor = Supervisor {
            client,
            fs,
            metadata,
            poll_interval: std::time::Duration::from_secs(config.status_poll_interval_secs),
            batch_size: config.publish_batch_size,
        };
        tokio::spawn(async move {
            supervisor.run(event_rx, signal, alive).await;
        });

        session
    }

    /// The underlying index client.
    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    /// Whether the supervisor is still running.
    pub fn alive(&self) -> bool {
        !self.alive.is_cancelled()
    }

    /// Force an immediate status poll (liveness check).
    pub fn wake(&self) {
        self.signal.notify_one();
    }

    /// Deliver a filesystem event; drops it when the session is gone.
    pub async fn deliver(&self, event: FsEvent) {
        tokio::select! {
            _ = self.alive.cancelled() => {}
            _ = self.events.send(event) => {}
        }
    }
}

/// State owned by the supervisor task.
struct Supervisor {
    client: Arc<Client>,
    fs: Arc<dyn FileSystemEx>,
    metadata: Option<Arc<dyn MetadataAdapter>>,
    poll_interval: std::time::Duration,
    batch_size: usize,
}

impl Supervisor {
    async fn run(
        self,
        mut events: mpsc::Receiver<FsEvent>,
        signal: Arc<Notify>,
        alive: CancellationToken,
    ) {
        let mut status = Status::Pending;
        // Set while a full-inventory publish is in flight; event-driven
        // updates are skipped then (coarse deduplication).
        let commit = Arc::new(AtomicBool::new(false));

        let mut tick = tokio::time::interval(self.poll_interval);
        tick.tick().await; // skip the immediate tick

        loop {
            tokio::select! {
                _ = signal.notified() => {
                    // Liveness check: any error ends the session.
                    if self.client.status().await.is_err() {
                        debug!("index session failed liveness check");
                        break;
                    }
                }
                _ = tick.tick() => {
                    if status != Status::Pending {
                        continue;
                    }
                    match self.client.status().await {
                        Err(e) => {
                            debug!(error = %e, "status poll failed");
                            break;
                        }
                        Ok(Status::Rejected) => {
                            warn!("index login rejected");
                            break;
                        }
                        Ok(Status::Accepted) => {
                            status = Status::Accepted;
                            info!("index login accepted, replicating inventory");
                            commit.store(true, Ordering::SeqCst);
                            let publisher = self.publisher();
                            let commit = commit.clone();
                            tokio::spawn(async move {
                                publisher.publish_all().await;
                                commit.store(false, Ordering::SeqCst);
                            });
                        }
                        Ok(Status::Pending) => {}
                    }
                }
                event = events.recv() => {
                    let Some(event) = event else { break };
                    if status != Status::Accepted {
                        continue;
                    }
                    if commit.load(Ordering::SeqCst) {
                        // Full publish in progress covers these paths.
                        continue;
                    }
                    match event.kind {
                        EventKind::Created | EventKind::Changed => {
                            self.publisher().publish_paths(&event.paths).await;
                        }
                        EventKind::Removed => {
                            self.publisher().retract_paths(&event.paths).await;
                        }
                    }
                }
            }
        }

        alive.cancel();
        self.client.close().await;
    }

    fn publisher(&self) -> Publisher {
        Publisher {
            client: self.client.clone(),
            fs: self.fs.clone(),
            metadata: self.metadata.clone(),
            batch_size: self.batch_size,
        }
    }
}

/// Inventory replication over one index session.
struct Publisher {
    client: Arc<Client>,
    fs: Arc<dyn FileSystemEx>,
    metadata: Option<Arc<dyn MetadataAdapter>>,
    batch_size: usize,
}

impl Publisher {
    /// Metadata for one path; extraction failures fall back to the
    /// minimal document.
    fn meta_doc(&self, path: &PeerPath) -> Vec<u8> {
        if let Some(adapter) = &self.metadata {
            if let Ok(doc) = adapter.metadata(self.fs.as_ref(), path) {
                return doc;
            }
        }
        DocBuilder::new()
            .append_string("_", &path.domain)
            .append_string("f", &path.name)
            .build()
    }

    /// Walk every shared directory and publish the whole inventory in
    /// bounded batches.
    async fn publish_all(&self) {
        let mut batch = Vec::with_capacity(self.batch_size);
        let mut published = 0usize;
        for dir in self.fs.dirs() {
            let files = match self.fs.files(&dir) {
                Ok(files) => files,
                Err(e) => {
                    warn!(dir = %dir, error = %e, "cannot enumerate share");
                    continue;
                }
            };
            for file in files {
                let path = PeerPath::new(dir.clone(), file);
                batch.push(self.meta_doc(&path));
                if batch.len() < self.batch_size {
                    continue;
                }
                published += batch.len();
                if self.client.publish(&batch).await.is_err() {
                    return;
                }
                batch.clear();
            }
        }
        if !batch.is_empty() {
            published += batch.len();
            if self.client.publish(&batch).await.is_err() {
                return;
            }
        }
        debug!(count = published, "inventory replicated");
    }

    async fn publish_paths(&self, paths: &[PeerPath]) {
        let docs: Vec<Vec<u8>> = paths.iter().map(|p| self.meta_doc(p)).collect();
        if docs.is_empty() {
            return;
        }
        if let Err(e) = self.client.publish(&docs).await {
            debug!(error = %e, "incremental publish failed");
        }
    }

    async fn retract_paths(&self, paths: &[PeerPath]) {
        let docs: Vec<Vec<u8>> = paths
            .iter()
            .map(|p| {
                DocBuilder::new()
                    .append_string("_", &p.domain)
                    .append_string("f", &p.name)
                    .build()
            })
            .collect();
        if docs.is_empty() {
            return;
        }
        if let Err(e) = self.client.retract(&docs).await {
            debug!(error = %e, "retract failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::alloc::BufferPool;
    use crate::index::{self, Auth, SessionToken};
    use crate::search::{MemCatalog, SearchIndex};
    use crate::security::generate_key_pair;
    use crate::testing::MemFs;

    /// Auth that keeps logins pending for `delay_polls` status checks,
    /// then settles them.
    struct SlowAuth {
        settle_to: Status,
        delay_polls: u32,
    }

    struct SlowToken {
        settle_to: Status,
        remaining: std::sync::atomic::AtomicU32,
        domain: String,
    }

    impl SessionToken for SlowToken {
        fn status(&self) -> Status {
            let left = &self.remaining;
            if left.load(Ordering::SeqCst) == 0 {
                return self.settle_to;
            }
            left.fetch_sub(1, Ordering::SeqCst);
            Status::Pending
        }
        fn domain(&self) -> &str {
            &self.domain
        }
    }

    impl Auth for SlowAuth {
        fn login(&self, _public: &[u8], domain: &str) -> Arc<dyn SessionToken> {
            Arc::new(SlowToken {
                settle_to: self.settle_to,
                remaining: std::sync::atomic::AtomicU32::new(self.delay_polls),
                domain: domain.to_string(),
            })
        }
    }

    async fn session_fixture(
        settle_to: Status,
        delay_polls: u32,
        fs: MemFs,
    ) -> (Arc<IndexSession>, Arc<MemCatalog>) {
        let catalog = Arc::new(MemCatalog::new());
        let server = index::Server::new(
            BufferPool::with_defaults(),
            Arc::new(SlowAuth { settle_to, delay_polls }),
            Arc::new(SearchIndex::new(catalog.clone())),
        );

        let (client_side, server_side) = tokio::io::duplex(1 << 16);
        tokio::spawn(async move { server.serve(server_side).await });

        let context = index::ClientContext::new(
            BufferPool::with_defaults(),
            generate_key_pair("me.onion".into()),
        );
        let client = Arc::new(context.new_client(Box::new(client_side)).await.unwrap());

        let config = Config::for_testing();
        let session = IndexSession::spawn(client, Arc::new(fs), None, &config);
        (session, catalog)
    }

    fn shared_fs(count: usize) -> MemFs {
        let mut fs = MemFs::new();
        for i in 0..count {
            fs.insert("me.onion", &format!("file{}.ogg", i), b"data".to_vec());
        }
        fs
    }

    async fn wait_for<F: Fn() -> bool>(what: &str, check: F) {
        for _ in 0..600 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    #[tokio::test]
    async fn test_accepted_login_replicates_inventory() {
        let (session, catalog) = session_fixture(Status::Accepted, 0, shared_fs(9)).await;

        wait_for("full inventory publish", || catalog.len() == 9).await;
        assert!(session.alive());
    }

    #[tokio::test]
    async fn test_rejected_login_ends_session() {
        let (session, catalog) = session_fixture(Status::Rejected, 0, shared_fs(3)).await;

        wait_for("session to die", || !session.alive()).await;
        assert!(catalog.is_empty());
    }

    #[tokio::test]
    async fn test_pending_login_keeps_polling() {
        let (session, catalog) = session_fixture(Status::Accepted, 2, shared_fs(2)).await;

        // Still pending after the first poll; nothing published yet.
        assert!(session.alive());

        wait_for("inventory after acceptance", || catalog.len() == 2).await;
    }

    #[tokio::test]
    async fn test_events_publish_and_retract() {
        let (session, catalog) = session_fixture(Status::Accepted, 0, shared_fs(1)).await;
        wait_for("initial publish", || catalog.len() == 1).await;

        // A created file is published...
        session
            .deliver(FsEvent {
                paths: vec![PeerPath::new("me.onion", "new.ogg")],
                kind: EventKind::Created,
            })
            .await;
        wait_for("created event", || catalog.len() == 2).await;

        // ...and a removed file retracted.
        session
            .deliver(FsEvent {
                paths: vec![PeerPath::new("me.onion", "new.ogg")],
                kind: EventKind::Removed,
            })
            .await;
        wait_for("removed event", || catalog.len() == 1).await;
    }

    #[tokio::test]
    async fn test_wake_detects_dead_connection() {
        let (session, _catalog) = session_fixture(Status::Accepted, 0, shared_fs(1)).await;

        // Kill the connection underneath the session, then wake it.
        session.client().close().await;
        session.wake();

        wait_for("session to notice", || !session.alive()).await;
    }
}
