//! Serving side of the peer session
//!
//! Four cooperating tasks per connection:
//! - the reader/dispatcher (this function's own loop)
//! - a priority writer draining a high- and a low-priority queue
//! - a file writer streaming accepted downloads in fixed-size chunks
//! - teardown that drains the download queue, closing queued files
//!
//! Control replies ride the high-priority queue; `dl.start`, `dl.bin`
//! and `dl.end` ride the low-priority queue so control traffic preempts
//! bulk transfer. Concurrent transfers are bounded by the download
//! queue: excess requests are refused cheaply with a 204.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::alloc::BufferPool;
use crate::config::Config;
use crate::network::conn::{Conn, DocWriter};
use crate::network::document::{empty_doc, Doc, DocBuilder, BIN_GENERIC};
use crate::peer::{FileSource, FileSystem, PeerPath};
use crate::security::KeyPair;

/// Depth of the high-priority (control) queue.
const HI_QUEUE_DEPTH: usize = 32;

/// Depth of the low-priority (bulk) queue.
const LO_QUEUE_DEPTH: usize = 16;

/// An accepted transfer waiting for the file writer.
struct QueueElement {
    source: FileSource,
    path: PeerPath,
}

/// Peer session server: serves files out of a [`FileSystem`] and
/// answers identity challenges with its own key pair.
pub struct Server {
    pool: Arc<BufferPool>,
    fs: Arc<dyn FileSystem>,
    key_pair: KeyPair,
    config: Config,
}

impl Server {
    /// Create a server over a filesystem capability.
    pub fn new(
        pool: Arc<BufferPool>,
        fs: Arc<dyn FileSystem>,
        key_pair: KeyPair,
        config: Config,
    ) -> Self {
        Self { pool, fs, key_pair, config }
    }

    /// Serve one inbound connection until it closes or errors.
    pub async fn serve<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let conn = Conn::new(stream, self.pool.clone());
        let (mut reader, writer) = conn.into_split();

        let alive = CancellationToken::new();
        let (hi_tx, hi_rx) = mpsc::channel::<Vec<u8>>(HI_QUEUE_DEPTH);
        let (lo_tx, lo_rx) = mpsc::channel::<Vec<u8>>(LO_QUEUE_DEPTH);
        let (dl_tx, dl_rx) = mpsc::channel::<QueueElement>(self.config.transfer_queue_depth);

        let writer_task = tokio::spawn(write_loop(writer, hi_rx, lo_rx, alive.clone()));
        let file_task = tokio::spawn(file_loop(
            lo_tx,
            dl_rx,
            alive.clone(),
            self.config.transfer_chunk_size,
        ));

        loop {
            let msg = tokio::select! {
                _ = alive.cancelled() => break,
                read = reader.read_document() => match read {
                    Ok(msg) => msg,
                    Err(e) => {
                        debug!(error = %e, "peer connection closed");
                        break;
                    }
                },
            };

            if !self.dispatch(Doc::new(&msg), &hi_tx, &dl_tx).await {
                break;
            }
        }

        alive.cancel();
        drop(hi_tx);
        drop(dl_tx);
        let _ = writer_task.await;
        let _ = file_task.await;
    }

    /// Handle one inbound document. Returns false when the session must end.
    async fn dispatch(
        &self,
        doc: Doc<'_>,
        hi: &mpsc::Sender<Vec<u8>>,
        dl: &mpsc::Sender<QueueElement>,
    ) -> bool {
        let elems = match doc.elements() {
            Ok(elems) => elems,
            Err(e) => {
                warn!(error = %e, "malformed peer document");
                return false;
            }
        };
        let Some(first) = elems.first() else {
            return true;
        };

        match first.key_bytes() {
            b"hs.s1" => {
                let reply = DocBuilder::new()
                    .append_document("hs.s1", &self.key_pair.step1())
                    .build();
                hi.send(reply).await.is_ok()
            }
            b"hs.s2" => {
                let challenge = first.value().as_doc();
                let answer = match challenge {
                    Some(chal) => self.key_pair.step2(chal).unwrap_or_else(|_| empty_doc()),
                    None => empty_doc(),
                };
                let reply = DocBuilder::new().append_document("hs.s2", &answer).build();
                hi.send(reply).await.is_ok()
            }
            b"getfile" => {
                if elems.len() < 2 {
                    return true;
                }
                let path = PeerPath::new(
                    first.value().as_str().unwrap_or_default(),
                    elems[1].value().as_str().unwrap_or_default(),
                );
                self.handle_getfile(path, hi, dl).await
            }
            _ => true,
        }
    }

    async fn handle_getfile(
        &self,
        path: PeerPath,
        hi: &mpsc::Sender<Vec<u8>>,
        dl: &mpsc::Sender<QueueElement>,
    ) -> bool {
        let source = match self.fs.open(&path) {
            Ok(source) => source,
            Err(e) => {
                debug!(path = %path, error = %e, "file request failed");
                let reply = DocBuilder::new()
                    .append_int32("putfile", 404)
                    .append_string("txt", &e.to_string())
                    .build();
                return hi.send(reply).await.is_ok();
            }
        };

        match dl.try_send(QueueElement { source, path: path.clone() }) {
            Ok(()) => {
                debug!(path = %path, "transfer accepted");
                let reply = DocBuilder::new()
                    .append_int32("putfile", 200)
                    .append_string("d", &path.domain)
                    .append_string("f", &path.name)
                    .build();
                hi.send(reply).await.is_ok()
            }
            Err(mpsc::error::TrySendError::Full(elem)) => {
                // Closing the file is the cheap part of refusing load.
                drop(elem);
                debug!(path = %path, "transfer refused, queue full");
                let reply = DocBuilder::new()
                    .append_int32("putfile", 204)
                    .append_string("txt", "queue ran full")
                    .build();
                hi.send(reply).await.is_ok()
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Priority writer: drain high first, else one low, block when idle.
async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: DocWriter<W>,
    mut hi: mpsc::Receiver<Vec<u8>>,
    mut lo: mpsc::Receiver<Vec<u8>>,
    alive: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            biased;
            _ = alive.cancelled() => break,
            msg = hi.recv() => msg,
            msg = lo.recv() => msg,
        };
        let Some(msg) = msg else { break };
        if let Err(e) = writer.write_document(&msg).await {
            debug!(error = %e, "peer write failed");
            alive.cancel();
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// Stream accepted downloads; on shutdown drain the queue so every
/// queued file is closed.
async fn file_loop(
    lo: mpsc::Sender<Vec<u8>>,
    mut dl: mpsc::Receiver<QueueElement>,
    alive: CancellationToken,
    chunk_size: usize,
) {
    loop {
        let elem = tokio::select! {
            _ = alive.cancelled() => break,
            elem = dl.recv() => match elem {
                Some(elem) => elem,
                None => break,
            },
        };
        write_file(&lo, elem, &alive, chunk_size).await;
    }

    dl.close();
    while let Ok(elem) = dl.try_recv() {
        trace!(path = %elem.path, "dropping queued transfer on shutdown");
        drop(elem);
    }
}

/// Emit `dl.start`, the chunk stream, and `dl.end` for one transfer.
async fn write_file(
    lo: &mpsc::Sender<Vec<u8>>,
    mut elem: QueueElement,
    alive: &CancellationToken,
    chunk_size: usize,
) {
    let header = DocBuilder::new()
        .append_string("d", &elem.path.domain)
        .append_string("f", &elem.path.name)
        .build();
    let start = DocBuilder::new().append_document("dl.start", &header).build();
    if !send_lo(lo, alive, start).await {
        return;
    }

    let mut buf = vec![0u8; chunk_size];
    loop {
        let n = match elem.source.read(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                debug!(path = %elem.path, error = %e, "transfer read failed");
                break;
            }
        };
        if n == 0 {
            break;
        }
        let chunk = DocBuilder::new()
            .append_binary("dl.bin", BIN_GENERIC, &buf[..n])
            .build();
        if !send_lo(lo, alive, chunk).await {
            return;
        }
        if n < chunk_size {
            break;
        }
    }

    let end = DocBuilder::new().append_int32("dl.end", 0).build();
    send_lo(lo, alive, end).await;
    trace!(path = %elem.path, "transfer finished");
}

async fn send_lo(lo: &mpsc::Sender<Vec<u8>>, alive: &CancellationToken, msg: Vec<u8>) -> bool {
    tokio::select! {
        _ = alive.cancelled() => false,
        sent = lo.send(msg) => sent.is_ok(),
    }
}
