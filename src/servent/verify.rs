//! Back-connect verification of index logins
//!
//! A login asserts `(public key, domain)`, but the handshake only proves
//! key possession. The cheapest proof that the key belongs to the domain
//! is to dial the domain through the overlay and complete a challenge
//! exchange against the claimed key: reaching the hidden service at all
//! requires control of its private key.
//!
//! Verified pairs are memoized in a two-generation rotating cache so
//! repeat logins skip the dial.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::alloc::BufferPool;
use crate::config::PORT_P2P;
use crate::index::{Auth, SessionToken, Status};
use crate::network::dialer::Dialer;
use crate::peer::{ClientContext, DownloadToken, FileSink, FsError, PeerError, PeerPath, TargetStore};
use crate::security::ServerAuth;

/// Approvals held per generation before rotation.
struct Memoizer {
    inner: RwLock<MemoizerInner>,
}

struct MemoizerInner {
    generations: [HashMap<String, Vec<u8>>; 2],
    active: usize,
    cap: usize,
}

impl Memoizer {
    fn new(cap: usize) -> Self {
        Self {
            inner: RwLock::new(MemoizerInner {
                generations: [HashMap::new(), HashMap::new()],
                active: 0,
                cap,
            }),
        }
    }

    /// Whether `(domain, public)` was approved and not yet rotated out.
    fn check(&self, domain: &str, public: &[u8]) -> bool {
        let inner = self.inner.read();
        let found = inner.generations[inner.active]
            .get(domain)
            .or_else(|| inner.generations[inner.active ^ 1].get(domain));
        match found {
            Some(stored) => stored.as_slice() == public,
            None => false,
        }
    }

    /// Record an approval. When the active generation reaches the bound,
    /// the other generation is cleared and becomes the active one.
    fn approve(&self, domain: &str, public: &[u8]) {
        let mut inner = self.inner.write();
        let active = inner.active;
        inner.generations[active ^ 1].remove(domain);
        inner.generations[active].insert(domain.to_string(), public.to_vec());
        if inner.generations[active].len() >= inner.cap {
            inner.active = active ^ 1;
            let next = inner.active;
            inner.generations[next].clear();
        }
    }
}

/// Token whose status is settled by the verification task.
struct VerifyToken {
    status: AtomicI32,
    domain: String,
}

impl VerifyToken {
    fn new(domain: String) -> Self {
        Self { status: AtomicI32::new(Status::Pending.as_i32()), domain }
    }

    fn accept(&self) {
        self.status.store(Status::Accepted.as_i32(), Ordering::SeqCst);
    }

    /// Settle: a login still pending at this point is rejected.
    fn settle(&self) {
        let _ = self.status.compare_exchange(
            Status::Pending.as_i32(),
            Status::Rejected.as_i32(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }
}

impl SessionToken for VerifyToken {
    fn status(&self) -> Status {
        Status::from_i32(self.status.load(Ordering::SeqCst))
    }

    fn domain(&self) -> &str {
        &self.domain
    }
}

/// Token for a memoized approval.
struct ApprovedToken {
    domain: String,
}

impl SessionToken for ApprovedToken {
    fn status(&self) -> Status {
        Status::Accepted
    }

    fn domain(&self) -> &str {
        &self.domain
    }
}

/// Target store that refuses every download; the verification client
/// never transfers files.
struct RejectStore;

impl TargetStore for RejectStore {
    fn create(
        &self,
        _token: Option<DownloadToken>,
        _path: &PeerPath,
    ) -> Result<FileSink, FsError> {
        Err(FsError::DownloadRejected)
    }
}

/// Auth capability that proves logins by connecting back to the
/// claimed domain.
pub struct PeerConnectAuth {
    dialer: Arc<dyn Dialer>,
    pool: Arc<BufferPool>,
    memo: Arc<Memoizer>,
}

impl PeerConnectAuth {
    /// Create the capability. `max_cache_entries` bounds each memoizer
    /// generation.
    pub fn new(dialer: Arc<dyn Dialer>, pool: Arc<BufferPool>, max_cache_entries: usize) -> Self {
        Self {
            dialer,
            pool,
            memo: Arc::new(Memoizer::new(max_cache_entries)),
        }
    }
}

impl Auth for PeerConnectAuth {
    fn login(&self, public: &[u8], domain: &str) -> Arc<dyn SessionToken> {
        if self.memo.check(domain, public) {
            debug!(domain = %domain, "login approved from cache");
            return Arc::new(ApprovedToken { domain: domain.to_string() });
        }

        let token = Arc::new(VerifyToken::new(domain.to_string()));
        let task_token = token.clone();
        let dialer = self.dialer.clone();
        let pool = self.pool.clone();
        let memo = self.memo.clone();
        let public = public.to_vec();
        tokio::spawn(async move {
            verify_peer(dialer, pool, memo, task_token, public).await;
        });
        token
    }
}

/// Dial back to the claimed domain and run the challenge exchange.
async fn verify_peer(
    dialer: Arc<dyn Dialer>,
    pool: Arc<BufferPool>,
    memo: Arc<Memoizer>,
    token: Arc<VerifyToken>,
    public: Vec<u8>,
) {
    match attempt(&dialer, pool, &token.domain, &public).await {
        Ok(true) => {
            debug!(domain = %token.domain, "back-connect verification succeeded");
            token.accept();
            // Memoize so repeat logins skip the dial.
            memo.approve(&token.domain, &public);
        }
        Ok(false) => {
            warn!(domain = %token.domain, "back-connect verification: key mismatch");
        }
        Err(e) => {
            warn!(domain = %token.domain, error = %e, "back-connect verification failed");
        }
    }
    token.settle();
}

async fn attempt(
    dialer: &Arc<dyn Dialer>,
    pool: Arc<BufferPool>,
    domain: &str,
    public: &[u8],
) -> Result<bool, PeerError> {
    let conduit = dialer.dial(domain, PORT_P2P).await?;
    let context = ClientContext::new(pool, Arc::new(RejectStore));
    let client = context.new_client(conduit);

    let mut auth = ServerAuth::new();
    let ok = client.auth_step2(&mut auth, public, domain).await;
    client.close().await;
    ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::time::Duration;

    use futures::future::BoxFuture;

    use crate::config::Config;
    use crate::network::dialer::BoxedConduit;
    use crate::peer::Server;
    use crate::security::{generate_key_pair, KeyPair};
    use crate::testing::MemFs;

    #[test]
    fn test_memoizer_approve_then_check() {
        let memo = Memoizer::new(8);
        assert!(!memo.check("a.onion", b"key-a"));

        memo.approve("a.onion", b"key-a");
        assert!(memo.check("a.onion", b"key-a"));
        assert!(!memo.check("a.onion", b"other-key"));
        assert!(!memo.check("b.onion", b"key-a"));
    }

    #[test]
    fn test_memoizer_survives_one_rotation() {
        let memo = Memoizer::new(2);
        memo.approve("a.onion", b"ka");
        memo.approve("b.onion", b"kb"); // active generation full, rotates

        // Both still visible through the previous generation.
        assert!(memo.check("a.onion", b"ka"));
        assert!(memo.check("b.onion", b"kb"));
    }

    #[test]
    fn test_memoizer_forgets_after_two_rotations() {
        let memo = Memoizer::new(2);
        memo.approve("a.onion", b"ka");
        memo.approve("b.onion", b"kb"); // rotation 1
        memo.approve("c.onion", b"kc");
        memo.approve("d.onion", b"kd"); // rotation 2: a and b are gone

        assert!(!memo.check("a.onion", b"ka"));
        assert!(!memo.check("b.onion", b"kb"));
        assert!(memo.check("c.onion", b"kc"));
        assert!(memo.check("d.onion", b"kd"));
    }

    #[test]
    fn test_memoizer_reapprove_moves_to_active() {
        let memo = Memoizer::new(2);
        memo.approve("a.onion", b"ka");
        memo.approve("b.onion", b"kb"); // rotation: prev={a,b}, active={}

        // Re-approving a removes it from the previous generation and
        // writes it into the active one.
        memo.approve("a.onion", b"ka2");
        assert!(memo.check("a.onion", b"ka2"));
        assert!(!memo.check("a.onion", b"ka"));
    }

    /// Dialer that spawns a peer server per dial.
    struct ServerDialer {
        server: Arc<Server>,
    }

    impl ServerDialer {
        fn new(key_pair: KeyPair) -> Self {
            let server = Server::new(
                BufferPool::with_defaults(),
                Arc::new(MemFs::new()),
                key_pair,
                Config::for_testing(),
            );
            Self { server: Arc::new(server) }
        }
    }

    impl Dialer for ServerDialer {
        fn dial<'a>(
            &'a self,
            _host: &'a str,
            _port: u16,
        ) -> BoxFuture<'a, io::Result<BoxedConduit>> {
            let server = self.server.clone();
            Box::pin(async move {
                let (client_side, server_side) = tokio::io::duplex(1 << 16);
                tokio::spawn(async move { server.serve(server_side).await });
                Ok(Box::new(client_side) as BoxedConduit)
            })
        }
    }

    async fn settled_status(token: &Arc<dyn SessionToken>) -> Status {
        for _ in 0..200 {
            let status = token.status();
            if status != Status::Pending {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Status::Pending
    }

    #[tokio::test]
    async fn test_login_with_matching_key_is_accepted() {
        let key_pair = generate_key_pair("peer.onion".into());
        let public = key_pair.public;
        let dialer = Arc::new(ServerDialer::new(key_pair));
        let auth = PeerConnectAuth::new(dialer, BufferPool::with_defaults(), 16);

        let token = auth.login(&public, "peer.onion");
        assert_eq!(settled_status(&token).await, Status::Accepted);
    }

    #[tokio::test]
    async fn test_login_with_wrong_key_is_rejected() {
        let key_pair = generate_key_pair("peer.onion".into());
        let imposter = generate_key_pair("peer.onion".into());
        let dialer = Arc::new(ServerDialer::new(key_pair));
        let auth = PeerConnectAuth::new(dialer, BufferPool::with_defaults(), 16);

        let token = auth.login(&imposter.public, "peer.onion");
        assert_eq!(settled_status(&token).await, Status::Rejected);
    }

    #[tokio::test]
    async fn test_unreachable_domain_is_rejected() {
        struct FailDialer;
        impl Dialer for FailDialer {
            fn dial<'a>(
                &'a self,
                _host: &'a str,
                _port: u16,
            ) -> BoxFuture<'a, io::Result<BoxedConduit>> {
                Box::pin(async { Err(io::Error::new(io::ErrorKind::ConnectionRefused, "down")) })
            }
        }

        let auth = PeerConnectAuth::new(Arc::new(FailDialer), BufferPool::with_defaults(), 16);
        let token = auth.login(b"anything", "gone.onion");
        assert_eq!(settled_status(&token).await, Status::Rejected);
    }

    #[tokio::test]
    async fn test_memoized_login_is_accepted_immediately() {
        let key_pair = generate_key_pair("peer.onion".into());
        let public = key_pair.public;
        let dialer = Arc::new(ServerDialer::new(key_pair));
        let auth = PeerConnectAuth::new(dialer, BufferPool::with_defaults(), 16);

        let token = auth.login(&public, "peer.onion");
        assert_eq!(settled_status(&token).await, Status::Accepted);

        // The second login never waits for a dial.
        let token = auth.login(&public, "peer.onion");
        assert_eq!(token.status(), Status::Accepted);
        assert_eq!(token.domain(), "peer.onion");
    }
}
