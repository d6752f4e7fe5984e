//! Outbound dialing capability
//!
//! Peers live behind an anonymizing overlay, so the servent never opens
//! sockets itself: it asks a [`Dialer`] for a byte stream to a domain and
//! port. Production wires in a SOCKS dialer obtained from the
//! hidden-service control channel; [`TcpDialer`] dials directly and is
//! good for tests and clearnet setups.

use std::io;

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// A bidirectional byte stream usable by the document codec.
pub trait Conduit: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Conduit for T {}

/// An owned, type-erased byte stream.
pub type BoxedConduit = Box<dyn Conduit>;

/// Capability to open a stream to a remote domain.
pub trait Dialer: Send + Sync {
    /// Open a stream to `host:port`.
    fn dial<'a>(&'a self, host: &'a str, port: u16) -> BoxFuture<'a, io::Result<BoxedConduit>>;
}

/// Dialer that connects directly over TCP.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

impl Dialer for TcpDialer {
    fn dial<'a>(&'a self, host: &'a str, port: u16) -> BoxFuture<'a, io::Result<BoxedConduit>> {
        Box::pin(async move {
            let stream = TcpStream::connect((host, port)).await?;
            Ok(Box::new(stream) as BoxedConduit)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_dialer_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hello");
            stream.write_all(b"world").await.unwrap();
        });

        let dialer = TcpDialer;
        let mut conduit = dialer.dial("127.0.0.1", port).await.unwrap();
        conduit.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        conduit.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_tcp_dialer_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let dialer = TcpDialer;
        assert!(dialer.dial("127.0.0.1", port).await.is_err());
    }
}
