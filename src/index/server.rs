//! Index server session
//!
//! One task per inbound connection: handshake, login, then one request
//! per document until the peer closes or errors. Teardown always
//! retracts the session's inventory so a rejected or abandoned login
//! leaves nothing behind.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace};

use crate::alloc::BufferPool;
use crate::index::{Auth, IndexError, Queries, SessionToken, Status};
use crate::network::conn::Conn;
use crate::network::document::{empty_doc, Doc, DocBuilder, Element};
use crate::security::ServerAuth;

/// Default result cap for a query without a `max` element.
const DEFAULT_QUERY_MAX: usize = 1 << 10;

/// Index server: authenticates logins and maintains inventory through
/// the supplied capabilities.
pub struct Server {
    pool: Arc<BufferPool>,
    auth: Arc<dyn Auth>,
    queries: Arc<dyn Queries>,
}

impl Server {
    /// Create a server over auth and query capabilities.
    pub fn new(pool: Arc<BufferPool>, auth: Arc<dyn Auth>, queries: Arc<dyn Queries>) -> Self {
        Self { pool, auth, queries }
    }

    /// Serve one inbound connection until it closes or errors.
    pub async fn serve<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let mut conn = Conn::new(stream, self.pool.clone());

        let token = match self.handshake(&mut conn).await {
            Ok(token) => token,
            Err(e) => {
                debug!(error = %e, "index login failed");
                let _ = conn.close().await;
                return;
            }
        };
        debug!(domain = %token.domain(), "index session open");

        loop {
            match self.serve_request(&mut conn, token.as_ref()).await {
                Ok(()) => {}
                Err(e) => {
                    debug!(domain = %token.domain(), error = %e, "index session closed");
                    break;
                }
            }
        }

        // A session that logged in always retracts on the way out.
        self.queries.retract_all(token.as_ref());
        let _ = conn.close().await;
    }

    async fn handshake<S>(&self, conn: &mut Conn<S>) -> Result<Arc<dyn SessionToken>, IndexError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let mut auth = ServerAuth::new();

        let msg = conn.read_document().await?;
        let challenge = auth
            .step1(Doc::new(&msg))
            .map_err(|_| IndexError::Crypto)?;
        drop(msg);
        conn.write_document(&challenge).await?;

        let msg = conn.read_document().await?;
        let ok = auth.step2(Doc::new(&msg));
        drop(msg);
        if !ok {
            return Err(IndexError::AuthFailed);
        }

        Ok(self.auth.login(auth.client_public(), auth.domain()))
    }

    async fn serve_request<S>(
        &self,
        conn: &mut Conn<S>,
        token: &dyn SessionToken,
    ) -> Result<(), IndexError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let msg = conn.read_document().await?;
        let doc = Doc::new(&msg);
        let elems = doc.elements().map_err(|_| IndexError::Protocol)?;
        let Some(first) = elems.first() else {
            return Ok(());
        };

        match first.key_bytes() {
            b"ready" => {
                let reply = DocBuilder::new()
                    .append_int32("status", token.status().as_i32())
                    .build();
                conn.write_document(&reply).await?;
            }
            b"publish" => {
                // Every element carrying a document is payload, the
                // opcode element included.
                for elem in &elems {
                    if let Some(doc) = elem.value().as_doc() {
                        self.queries.publish(token, doc);
                    }
                }
                trace!(domain = %token.domain(), count = elems.len(), "publish batch");
            }
            b"retract" => {
                for elem in &elems {
                    if let Some(doc) = elem.value().as_doc() {
                        self.queries.retract(token, doc);
                    }
                }
                trace!(domain = %token.domain(), count = elems.len(), "retract batch");
            }
            b"sweep" => {
                self.queries.retract_all(token);
            }
            b"query" => {
                self.serve_query(conn, token, &elems).await?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn serve_query<S>(
        &self,
        conn: &mut Conn<S>,
        token: &dyn SessionToken,
        elems: &[Element<'_>],
    ) -> Result<(), IndexError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        if token.status() == Status::Rejected {
            conn.write_document(&empty_doc()).await?;
            return Ok(());
        }
        let terms = elems[0].value().as_doc().ok_or(IndexError::Protocol)?;
        let max = elems
            .iter()
            .find(|e| e.key_bytes() == b"max")
            .and_then(|e| e.value().as_i32())
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_QUERY_MAX);

        let response = self.queries.query(token, terms, max);
        conn.write_document(&response).await?;
        Ok(())
    }
}
