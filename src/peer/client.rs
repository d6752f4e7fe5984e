//! Client side of the peer session
//!
//! A reader task demultiplexes the inbound stream by element-name
//! prefix: `dl.*` messages feed the file writer, everything else is an
//! application-level reply. Requests hold the session lock across their
//! write and the matching reply, so at most one request is in flight.
//!
//! Downloads are gated by tokens: `get_file` parks a token under the
//! requested path, the first `dl.start` for that path consumes it, and
//! the target store decides whether the sink may be created.

use std::sync::Arc;

use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::alloc::{Buffer, BufferPool};
use crate::network::conn::{Conn, DocReader, DocWriter};
use crate::network::document::{Doc, DocBuilder};
use crate::network::dialer::BoxedConduit;
use crate::peer::{
    DownloadToken, FileSink, PathTokenMap, PeerError, PeerPath, TargetStore,
};
use crate::security::ServerAuth;

/// Depth of the application-reply channel.
const APP_QUEUE_DEPTH: usize = 32;

/// Depth of the file-stream channel.
const FILE_QUEUE_DEPTH: usize = 8;

/// Shared context for peer clients: buffer pool and download store.
pub struct ClientContext {
    /// Pool backing inbound document buffers
    pub pool: Arc<BufferPool>,
    /// Store that creates sinks for accepted downloads
    pub target: Arc<dyn TargetStore>,
}

impl ClientContext {
    /// Create a context.
    pub fn new(pool: Arc<BufferPool>, target: Arc<dyn TargetStore>) -> Self {
        Self { pool, target }
    }

    /// Wrap an established stream into a running client session.
    pub fn new_client(&self, conduit: BoxedConduit) -> Arc<Client> {
        let conn = Conn::new(conduit, self.pool.clone());
        let (reader, writer) = conn.into_split();

        let alive = CancellationToken::new();
        let (app_tx, app_rx) = mpsc::channel(APP_QUEUE_DEPTH);
        let (file_tx, file_rx) = mpsc::channel(FILE_QUEUE_DEPTH);
        let tokens = Arc::new(PathTokenMap::new());

        tokio::spawn(read_loop(reader, app_tx, file_tx, alive.clone()));
        tokio::spawn(file_loop(
            file_rx,
            tokens.clone(),
            self.target.clone(),
            alive.clone(),
        ));

        Arc::new(Client {
            alive,
            io: Mutex::new(ClientIo { writer, app: app_rx }),
            tokens,
        })
    }
}

/// Write side plus the application-reply queue, locked per request.
struct ClientIo {
    writer: DocWriter<WriteHalf<BoxedConduit>>,
    app: mpsc::Receiver<Buffer>,
}

/// A peer session from the requesting side.
pub struct Client {
    alive: CancellationToken,
    io: Mutex<ClientIo>,
    tokens: Arc<PathTokenMap>,
}

impl Client {
    /// Whether the session is still open.
    pub fn alive(&self) -> bool {
        !self.alive.is_cancelled()
    }

    /// Close the session, unblocking every task attached to it.
    pub async fn close(&self) {
        self.alive.cancel();
        let mut io = self.io.lock().await;
        let _ = io.writer.shutdown().await;
    }

    async fn read_reply(&self, io: &mut ClientIo) -> Result<Buffer, PeerError> {
        tokio::select! {
            _ = self.alive.cancelled() => Err(PeerError::Closed),
            msg = io.app.recv() => msg.ok_or(PeerError::Closed),
        }
    }

    /// Mutually authenticate with the remote peer: learn its identity,
    /// then verify it against a fresh challenge.
    pub async fn authenticate(&self, auth: &mut ServerAuth) -> Result<bool, PeerError> {
        let challenge = self.exchange_step1(auth).await?;
        self.exchange_step2(auth, challenge).await
    }

    /// One-shot verification: synthesize the identity locally from a
    /// supplied `(public, domain)` and run only the challenge exchange.
    /// Success proves the remote peer controls the matching private key.
    pub async fn auth_step2(
        &self,
        auth: &mut ServerAuth,
        public: &[u8],
        domain: &str,
    ) -> Result<bool, PeerError> {
        let challenge = auth
            .one_pass_prep(public, domain)
            .map_err(|_| PeerError::Crypto)?;
        self.exchange_step2(auth, challenge).await
    }

    async fn exchange_step1(&self, auth: &mut ServerAuth) -> Result<Vec<u8>, PeerError> {
        let mut io = self.io.lock().await;
        let req = DocBuilder::new().append_string("hs.s1", "").build();
        io.writer.write_document(&req).await?;
        let msg = self.read_reply(&mut io).await?;
        let login = Doc::new(&msg)
            .lookup("hs.s1")
            .and_then(|v| v.as_doc())
            .ok_or(PeerError::Protocol)?;
        auth.step1(login).map_err(|_| PeerError::Crypto)
    }

    async fn exchange_step2(
        &self,
        auth: &mut ServerAuth,
        challenge: Vec<u8>,
    ) -> Result<bool, PeerError> {
        let mut io = self.io.lock().await;
        let req = DocBuilder::new().append_document("hs.s2", &challenge).build();
        io.writer.write_document(&req).await?;
        let msg = self.read_reply(&mut io).await?;
        let ok = match Doc::new(&msg).lookup("hs.s2").and_then(|v| v.as_doc()) {
            Some(answer) => auth.step2(answer),
            None => false,
        };
        Ok(ok)
    }

    /// Request a file. On acceptance the stream arrives asynchronously
    /// and lands in the target store under `token`.
    pub async fn get_file(&self, token: DownloadToken, path: PeerPath) -> Result<(), PeerError> {
        self.tokens.put(path.clone(), token);

        let mut io = self.io.lock().await;
        let req = DocBuilder::new()
            .append_string("getfile", &path.domain)
            .append_string("f", &path.name)
            .build();
        io.writer.write_document(&req).await?;

        let msg = self.read_reply(&mut io).await?;
        let elems = Doc::new(&msg).elements().map_err(|_| PeerError::Protocol)?;
        if elems.len() < 2 {
            return Err(PeerError::Protocol);
        }
        let code = elems[0].value().as_i32().unwrap_or_default();
        if code != 200 {
            let message = elems[1].value().as_str().unwrap_or_default().to_string();
            return Err(PeerError::Refused { code, message });
        }
        Ok(())
    }

    #[cfg(test)]
    fn tokens(&self) -> &PathTokenMap {
        &self.tokens
    }
}

/// Demultiplex inbound documents into the file and application queues.
async fn read_loop(
    mut reader: DocReader<ReadHalf<BoxedConduit>>,
    app: mpsc::Sender<Buffer>,
    file: mpsc::Sender<Buffer>,
    alive: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            _ = alive.cancelled() => break,
            read = reader.read_document() => match read {
                Ok(msg) => msg,
                Err(e) => {
                    debug!(error = %e, "peer session closed");
                    alive.cancel();
                    break;
                }
            },
        };

        let route_file = match Doc::new(&msg).element(0) {
            Ok(first) => first.key_bytes().starts_with(b"dl."),
            // Unreadable documents are dropped, the session stays up.
            Err(_) => continue,
        };

        let target = if route_file { &file } else { &app };
        let closed = tokio::select! {
            _ = alive.cancelled() => true,
            sent = target.send(msg) => sent.is_err(),
        };
        if closed {
            break;
        }
    }
}

/// Drive download sinks from the file-stream queue.
async fn file_loop(
    mut file: mpsc::Receiver<Buffer>,
    tokens: Arc<PathTokenMap>,
    target: Arc<dyn TargetStore>,
    alive: CancellationToken,
) {
    let mut sink: Option<FileSink> = None;
    loop {
        let msg = tokio::select! {
            _ = alive.cancelled() => break,
            msg = file.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        let doc = Doc::new(&msg);
        let Ok(first) = doc.element(0) else { continue };
        match first.key_bytes() {
            b"dl.start" => {
                let Some(header) = first.value().as_doc() else { continue };
                let path = header_path(header);
                let token = tokens.take(&path);

                if let Some(mut old) = sink.take() {
                    let _ = old.shutdown().await;
                }
                match target.create(token, &path) {
                    Ok(new_sink) => {
                        trace!(path = %path, "download started");
                        sink = Some(new_sink);
                    }
                    Err(e) => {
                        debug!(path = %path, error = %e, "download sink refused");
                        sink = None;
                    }
                }
            }
            b"dl.bin" => {
                if let Some((_, data)) = first.value().as_binary() {
                    if let Some(current) = sink.as_mut() {
                        let _ = current.write_all(data).await;
                    }
                }
            }
            b"dl.end" => {
                if let Some(mut current) = sink.take() {
                    let _ = current.shutdown().await;
                    trace!("download finished");
                }
            }
            _ => {}
        }
    }

    if let Some(mut current) = sink.take() {
        let _ = current.shutdown().await;
    }
}

/// Read `(domain, filename)` from a transfer header's first two elements.
fn header_path(header: Doc<'_>) -> PeerPath {
    let elems = header.elements().unwrap_or_default();
    let domain = elems
        .first()
        .and_then(|e| e.value().as_str())
        .unwrap_or_default();
    let name = elems
        .get(1)
        .and_then(|e| e.value().as_str())
        .unwrap_or_default();
    PeerPath::new(domain, name)
}
