//! Index client
//!
//! Thin request/response client over one framed connection. Every call
//! holds the session lock across its write and the matching reply, so
//! requests never interleave on the wire.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::alloc::BufferPool;
use crate::index::{IndexError, Status};
use crate::network::conn::Conn;
use crate::network::document::{Doc, DocBuilder, OwnedElement};
use crate::network::dialer::BoxedConduit;
use crate::security::KeyPair;

/// Shared context for index clients: buffer pool and login identity.
pub struct ClientContext {
    /// Pool backing inbound document buffers
    pub pool: Arc<BufferPool>,
    /// Identity presented at login
    pub key_pair: KeyPair,
}

impl ClientContext {
    /// Create a context.
    pub fn new(pool: Arc<BufferPool>, key_pair: KeyPair) -> Self {
        Self { pool, key_pair }
    }

    /// Handshake over an established stream and return the session.
    pub async fn new_client(&self, conduit: BoxedConduit) -> Result<Client, IndexError> {
        let mut conn = Conn::new(conduit, self.pool.clone());

        conn.write_document(&self.key_pair.step1()).await?;
        let challenge = conn.read_document().await?;
        let answer = self
            .key_pair
            .step2(Doc::new(&challenge))
            .map_err(|_| IndexError::Crypto)?;
        drop(challenge);
        conn.write_document(&answer).await?;

        debug!(domain = %self.key_pair.domain, "index login sent");
        Ok(Client { io: Mutex::new(conn) })
    }
}

/// An authenticated index session from the servent side.
pub struct Client {
    io: Mutex<Conn<BoxedConduit>>,
}

impl Client {
    /// Close the session.
    pub async fn close(&self) {
        let _ = self.io.lock().await.close().await;
    }

    /// Poll the server for the login status.
    pub async fn status(&self) -> Result<Status, IndexError> {
        let mut io = self.io.lock().await;
        let req = DocBuilder::new().append_string("ready", "").build();
        io.write_document(&req).await?;
        let reply = io.read_document().await?;
        let status = Doc::new(&reply)
            .lookup("status")
            .and_then(|v| v.as_i32())
            .ok_or(IndexError::Protocol)?;
        Ok(Status::from_i32(status))
    }

    /// Retract everything this session published.
    pub async fn retract_all(&self) -> Result<(), IndexError> {
        let mut io = self.io.lock().await;
        let req = DocBuilder::new().append_string("sweep", "").build();
        io.write_document(&req).await?;
        Ok(())
    }

    /// Publish a batch of metadata documents.
    pub async fn publish(&self, docs: &[Vec<u8>]) -> Result<(), IndexError> {
        self.send_batch("publish", docs).await
    }

    /// Retract a batch of metadata documents.
    pub async fn retract(&self, docs: &[Vec<u8>]) -> Result<(), IndexError> {
        self.send_batch("retract", docs).await
    }

    /// The first document rides under the opcode key, the rest under
    /// empty keys; the server treats all of them as payload.
    async fn send_batch(&self, opcode: &str, docs: &[Vec<u8>]) -> Result<(), IndexError> {
        let Some((head, tail)) = docs.split_first() else {
            return Ok(());
        };
        let mut builder = DocBuilder::new().append_document(opcode, head);
        for doc in tail {
            builder = builder.append_document("", doc);
        }
        let mut io = self.io.lock().await;
        io.write_document(&builder.build()).await?;
        Ok(())
    }

    /// Query the server; results come back as owned response elements.
    pub async fn query(&self, terms: &[u8], max: usize) -> Result<Vec<OwnedElement>, IndexError> {
        let mut builder = DocBuilder::new().append_document("query", terms);
        if max > 0 {
            builder = builder.append_int32("max", max as i32);
        }
        let req = builder.build();

        let mut io = self.io.lock().await;
        io.write_document(&req).await?;
        let reply = io.read_document().await?;
        let elems = Doc::new(&reply)
            .elements()
            .map_err(|_| IndexError::Protocol)?;
        Ok(elems.iter().map(|e| e.to_owned()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;

    use crate::index::{Auth, Queries, Server, SessionToken};
    use crate::security::generate_key_pair;

    /// Auth that accepts everyone immediately.
    struct AcceptAll;

    struct AcceptedToken {
        domain: String,
    }

    impl SessionToken for AcceptedToken {
        fn status(&self) -> Status {
            Status::Accepted
        }
        fn domain(&self) -> &str {
            &self.domain
        }
    }

    impl Auth for AcceptAll {
        fn login(&self, _public: &[u8], domain: &str) -> Arc<dyn SessionToken> {
            Arc::new(AcceptedToken { domain: domain.to_string() })
        }
    }

    /// Inventory that stores published docs verbatim and answers queries
    /// with everything it holds.
    #[derive(Default)]
    struct VecQueries {
        docs: SyncMutex<Vec<Vec<u8>>>,
    }

    impl Queries for VecQueries {
        fn retract_all(&self, _token: &dyn SessionToken) {
            self.docs.lock().clear();
        }
        fn publish(&self, _token: &dyn SessionToken, doc: Doc<'_>) {
            self.docs.lock().push(doc.as_bytes().to_vec());
        }
        fn retract(&self, _token: &dyn SessionToken, doc: Doc<'_>) {
            self.docs.lock().retain(|d| d != doc.as_bytes());
        }
        fn query(&self, _token: &dyn SessionToken, _terms: Doc<'_>, max: usize) -> Vec<u8> {
            let mut builder = DocBuilder::new();
            for doc in self.docs.lock().iter().take(max) {
                builder = builder.append_document("hit", doc);
            }
            builder.build()
        }
    }

    async fn connected_client(queries: Arc<VecQueries>) -> (Client, tokio::task::JoinHandle<()>) {
        let server = Server::new(BufferPool::with_defaults(), Arc::new(AcceptAll), queries);
        let (client_side, server_side) = tokio::io::duplex(1 << 16);
        let task = tokio::spawn(async move { server.serve(server_side).await });

        let context = ClientContext::new(
            BufferPool::with_defaults(),
            generate_key_pair("me.onion".into()),
        );
        let client = context.new_client(Box::new(client_side)).await.unwrap();
        (client, task)
    }

    fn meta(name: &str) -> Vec<u8> {
        DocBuilder::new()
            .append_string("_", "me.onion")
            .append_string("f", name)
            .build()
    }

    #[tokio::test]
    async fn test_status_round_trip() {
        let (client, task) = connected_client(Arc::new(VecQueries::default())).await;
        assert_eq!(client.status().await.unwrap(), Status::Accepted);
        client.close().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_then_query() {
        let queries = Arc::new(VecQueries::default());
        let (client, task) = connected_client(queries.clone()).await;

        client.publish(&[meta("a.ogg"), meta("b.ogg")]).await.unwrap();

        let terms = DocBuilder::new().append_string("f", "ogg").build();
        let hits = client.query(&terms, 10).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].key_bytes(), b"hit");

        client.close().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_retract_removes_document() {
        let queries = Arc::new(VecQueries::default());
        let (client, task) = connected_client(queries.clone()).await;

        client.publish(&[meta("a.ogg"), meta("b.ogg")]).await.unwrap();
        client.retract(&[meta("a.ogg")]).await.unwrap();

        let terms = DocBuilder::new().append_string("f", "ogg").build();
        let hits = client.query(&terms, 10).await.unwrap();
        assert_eq!(hits.len(), 1);

        client.close().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_batch_is_a_no_op() {
        let queries = Arc::new(VecQueries::default());
        let (client, task) = connected_client(queries.clone()).await;

        client.publish(&[]).await.unwrap();
        assert_eq!(client.status().await.unwrap(), Status::Accepted);
        assert!(queries.docs.lock().is_empty());

        client.close().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_query_respects_max() {
        let queries = Arc::new(VecQueries::default());
        let (client, task) = connected_client(queries.clone()).await;

        let docs: Vec<Vec<u8>> = (0..5).map(|i| meta(&format!("f{}.ogg", i))).collect();
        client.publish(&docs).await.unwrap();

        let terms = DocBuilder::new().append_string("f", "ogg").build();
        let hits = client.query(&terms, 2).await.unwrap();
        assert_eq!(hits.len(), 2);

        client.close().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_status_after_close_errors() {
        let (client, task) = connected_client(Arc::new(VecQueries::default())).await;
        client.close().await;
        assert!(client.status().await.is_err());
        task.await.unwrap();
    }
}
