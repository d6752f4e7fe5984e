//! End-to-end scenarios over an in-process network
//!
//! Wires full servents and an index server together through a dialer
//! that routes `domain:port` to in-process nodes, exercising login with
//! back-connect verification, inventory replication, fan-out query and
//! peer-to-peer download.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;

use veilshare::alloc::BufferPool;
use veilshare::config::{Config, PORT_C2S, PORT_P2P};
use veilshare::index;
use veilshare::network::dialer::{BoxedConduit, Dialer};
use veilshare::network::document::{Doc, DocBuilder};
use veilshare::peer::PeerPath;
use veilshare::search::{MemCatalog, SearchIndex};
use veilshare::security::generate_key_pair;
use veilshare::servent::{PeerConnectAuth, Servent, ServentConfig};
use veilshare::testing::{MemFs, MemStore};

/// One reachable endpoint in the test network.
enum Route {
    Servent(Arc<Servent>),
    Index(Arc<index::Server>),
}

/// Dialer routing `domain:port` onto in-process nodes.
#[derive(Default)]
struct Network {
    routes: Mutex<HashMap<(String, u16), Arc<Route>>>,
}

impl Network {
    fn add_servent(&self, domain: &str, servent: Arc<Servent>) {
        self.routes.lock().insert(
            (domain.to_string(), PORT_P2P),
            Arc::new(Route::Servent(servent)),
        );
    }

    fn add_index(&self, domain: &str, server: Arc<index::Server>) {
        self.routes.lock().insert(
            (domain.to_string(), PORT_C2S),
            Arc::new(Route::Index(server)),
        );
    }
}

impl Dialer for Network {
    fn dial<'a>(&'a self, host: &'a str, port: u16) -> BoxFuture<'a, io::Result<BoxedConduit>> {
        let route = self.routes.lock().get(&(host.to_string(), port)).cloned();
        Box::pin(async move {
            let Some(route) = route else {
                return Err(io::Error::new(io::ErrorKind::NotFound, "unreachable domain"));
            };
            let (near, far) = tokio::io::duplex(1 << 16);
            match route.as_ref() {
                Route::Servent(servent) => {
                    let servent = servent.clone();
                    tokio::spawn(async move { servent.serve_p2p_conn(far).await });
                }
                Route::Index(server) => {
                    let server = server.clone();
                    tokio::spawn(async move { server.serve(far).await });
                }
            }
            Ok(Box::new(near) as BoxedConduit)
        })
    }
}

struct Node {
    servent: Arc<Servent>,
    store: Arc<MemStore>,
}

/// Build a servent sharing `files` under its own domain.
fn make_node(network: &Arc<Network>, domain: &str, files: &[(&str, &[u8])]) -> Node {
    let mut fs = MemFs::new();
    for (name, data) in files {
        fs.insert(domain, name, data.to_vec());
    }
    let store = Arc::new(MemStore::new());
    let servent = ServentConfig {
        fs: Arc::new(fs),
        target: store.clone(),
        metadata: None,
        pool: BufferPool::with_defaults(),
        key_pair: generate_key_pair(domain.into()),
        dialer: network.clone(),
        config: Config::for_testing(),
    }
    .create();
    network.add_servent(domain, servent.clone());
    Node { servent, store }
}

/// Build an index server whose logins are proven by connecting back
/// through the test network.
fn make_index(network: &Arc<Network>, domain: &str) -> Arc<MemCatalog> {
    let catalog = Arc::new(MemCatalog::new());
    let auth = PeerConnectAuth::new(network.clone(), BufferPool::with_defaults(), 64);
    let server = Arc::new(index::Server::new(
        BufferPool::with_defaults(),
        Arc::new(auth),
        Arc::new(SearchIndex::new(catalog.clone())),
    ));
    network.add_index(domain, server);
    catalog
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
async fn test_verified_login_replicates_and_serves_queries() {
    let network = Arc::new(Network::default());
    let catalog = make_index(&network, "idx.onion");
    let alice = make_node(
        &network,
        "alice.onion",
        &[("nevermind.ogg", b"grunge"), ("bleach.ogg", b"more grunge")],
    );

    // Login is pending until the index server has connected back to
    // alice.onion and verified her key; then the inventory lands.
    alice.servent.add_server("idx.onion").await.unwrap();
    wait_for("verified replication", || catalog.len() == 2).await;
}

#[tokio::test]
async fn test_imposter_login_is_rejected_and_publishes_dropped() {
    let network = Arc::new(Network::default());
    let catalog = make_index(&network, "idx.onion");

    // Alice owns alice.onion.
    let _alice = make_node(&network, "alice.onion", &[("real.ogg", b"hers")]);

    // Mallory claims alice.onion with a different key; back-connect
    // verification reaches the real alice and the digests mismatch.
    let mut fs = MemFs::new();
    fs.insert("alice.onion", "fake.ogg", b"forged".to_vec());
    let mallory = ServentConfig {
        fs: Arc::new(fs),
        target: Arc::new(MemStore::new()),
        metadata: None,
        pool: BufferPool::with_defaults(),
        key_pair: generate_key_pair("alice.onion".into()),
        dialer: network.clone(),
        config: Config::for_testing(),
    }
    .create();

    mallory.add_server("idx.onion").await.unwrap();

    // Give verification and several status polls time to run: the
    // login settles to Rejected and nothing is ever indexed.
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(catalog.is_empty());
}

#[tokio::test]
async fn test_query_then_download_across_nodes() {
    let network = Arc::new(Network::default());
    let catalog = make_index(&network, "idx.onion");
    let payload: Vec<u8> = (0u8..=255).cycle().take(5000).collect();

    let alice = make_node(&network, "alice.onion", &[("song.ogg", &payload)]);
    let bob = make_node(&network, "bob.onion", &[]);

    alice.servent.add_server("idx.onion").await.unwrap();
    wait_for("alice's inventory", || catalog.len() == 1).await;

    bob.servent.add_server("idx.onion").await.unwrap();

    // Bob searches for the song and learns who shares it.
    let terms = DocBuilder::new().append_string("f", "song").build();
    let results = bob.servent.query(&terms, 16).await.unwrap();
    assert_eq!(results.len(), 1);
    let source_domain = String::from_utf8(results[0].key_bytes().to_vec()).unwrap();
    assert_eq!(source_domain, "alice.onion");
    let meta = results[0].value().unwrap().as_doc().unwrap().as_bytes().to_vec();
    let filename = Doc::new(&meta).lookup("f").unwrap().as_str().unwrap().to_string();
    assert_eq!(filename, "song.ogg");

    // Bob downloads it straight from alice.
    let client = bob.servent.get_client(&source_domain).await.unwrap();
    client
        .get_file(bob.store.token(), PeerPath::new(&source_domain, &filename))
        .await
        .unwrap();

    let store = bob.store.clone();
    let expected_len = payload.len();
    wait_for("download to finish", move || {
        store.get("song.ogg").map(|d| d.len()) == Some(expected_len)
    })
    .await;
    assert_eq!(bob.store.get("song.ogg").unwrap(), payload);
}

#[tokio::test]
async fn test_missing_file_refused_across_nodes() {
    let network = Arc::new(Network::default());
    let _catalog = make_index(&network, "idx.onion");
    let _alice = make_node(&network, "alice.onion", &[]);
    let bob = make_node(&network, "bob.onion", &[]);

    let client = bob.servent.get_client("alice.onion").await.unwrap();
    let err = client
        .get_file(bob.store.token(), PeerPath::new("alice.onion", "ghost.ogg"))
        .await
        .unwrap_err();
    assert!(matches!(err, veilshare::PeerError::Refused { code: 404, .. }));
    assert!(bob.store.is_empty());
}

#[tokio::test]
async fn test_removed_file_disappears_from_results() {
    let network = Arc::new(Network::default());
    let catalog = make_index(&network, "idx.onion");
    let alice = make_node(&network, "alice.onion", &[("keep.ogg", b"k"), ("drop.ogg", b"d")]);

    alice.servent.add_server("idx.onion").await.unwrap();
    wait_for("replication", || catalog.len() == 2).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    alice
        .servent
        .removed(vec![PeerPath::new("alice.onion", "drop.ogg")])
        .await;
    wait_for("retraction", || catalog.len() == 1).await;

    let terms = DocBuilder::new().append_string("f", "drop").build();
    let results = alice.servent.query(&terms, 16).await.unwrap();
    assert!(results.is_empty());
}
