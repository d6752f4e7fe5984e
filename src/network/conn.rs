//! Framed document connection codec
//!
//! Wraps a bidirectional byte stream and a buffer pool. Inbound documents
//! land in pool buffers sized from the 4-byte length prefix; on a read
//! error the partially-filled buffer goes back to the pool before the
//! error surfaces. Writes are whole-document and are not serialized here:
//! the caller guarantees no interleaving.

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use crate::alloc::{Buffer, BufferPool};
use crate::network::document;

/// Smallest well-formed document: length prefix plus terminator.
const MIN_DOC_LEN: usize = 5;

/// A framed document connection over a bidirectional stream.
pub struct Conn<S> {
    stream: S,
    pool: Arc<BufferPool>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Conn<S> {
    /// Wrap a stream with a buffer pool for inbound documents.
    pub fn new(stream: S, pool: Arc<BufferPool>) -> Self {
        Self { stream, pool }
    }

    /// Read one document into a pool buffer.
    pub async fn read_document(&mut self) -> io::Result<Buffer> {
        read_document(&mut self.stream, &self.pool).await
    }

    /// Write one document.
    ///
    /// A document whose length prefix disagrees with the buffer is
    /// skipped without error; see the codec module notes.
    pub async fn write_document(&mut self, doc: &[u8]) -> io::Result<()> {
        write_document(&mut self.stream, doc).await
    }

    /// Shut down the underlying stream.
    pub async fn close(&mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }

    /// Split into independently owned read and write sides.
    pub fn into_split(self) -> (DocReader<ReadHalf<S>>, DocWriter<WriteHalf<S>>) {
        let (r, w) = tokio::io::split(self.stream);
        (
            DocReader { stream: r, pool: self.pool },
            DocWriter { stream: w },
        )
    }
}

/// Read side of a split connection.
pub struct DocReader<R> {
    stream: R,
    pool: Arc<BufferPool>,
}

impl<R: AsyncRead + Unpin> DocReader<R> {
    /// Read one document into a pool buffer.
    pub async fn read_document(&mut self) -> io::Result<Buffer> {
        read_document(&mut self.stream, &self.pool).await
    }
}

/// Write side of a split connection.
pub struct DocWriter<W> {
    stream: W,
}

impl<W: AsyncWrite + Unpin> DocWriter<W> {
    /// Write one document.
    pub async fn write_document(&mut self, doc: &[u8]) -> io::Result<()> {
        write_document(&mut self.stream, doc).await
    }

    /// Shut down the write side.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }
}

async fn read_document<R: AsyncRead + Unpin>(
    stream: &mut R,
    pool: &Arc<BufferPool>,
) -> io::Result<Buffer> {
    let mut prefix = [0u8; 4];
    stream.read_exact(&mut prefix).await?;
    let total = u32::from_le_bytes(prefix) as usize;
    if total < MIN_DOC_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("document claims {} bytes", total),
        ));
    }

    let mut buf = pool.alloc(total);
    buf[..4].copy_from_slice(&prefix);
    match stream.read_exact(&mut buf[4..]).await {
        Ok(_) => Ok(buf),
        Err(e) => {
            // Dropping hands the partial buffer back to the pool.
            drop(buf);
            Err(e)
        }
    }
}

async fn write_document<W: AsyncWrite + Unpin>(stream: &mut W, doc: &[u8]) -> io::Result<()> {
    if document::declared_len(doc) != Some(doc.len()) {
        return Ok(());
    }
    stream.write_all(doc).await?;
    stream.flush().await
}
