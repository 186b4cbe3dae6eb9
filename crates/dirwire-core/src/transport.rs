//! Byte streams, dialing and stream upgrades.

use std::io;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Any bidirectional byte stream a connection can run over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Opens the raw stream to a directory server.
pub trait SocketFactory: Send + Sync + 'static {
    fn connect<'a>(&'a self, host: &'a str, port: u16) -> BoxFuture<'a, io::Result<BoxedStream>>;

    /// Whether the connect timeout can be enforced around [`Self::connect`].
    /// Factories returning `false` are dialed without a bound.
    fn connect_timeout_capable(&self) -> bool {
        true
    }
}

/// Plain TCP with `TCP_NODELAY`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpSocketFactory;

impl SocketFactory for TcpSocketFactory {
    fn connect<'a>(&'a self, host: &'a str, port: u16) -> BoxFuture<'a, io::Result<BoxedStream>> {
        async move {
            let stream = TcpStream::connect((host, port)).await?;
            stream.set_nodelay(true)?;
            tracing::debug!(host, port, "tcp connected");
            Ok(Box::new(stream) as BoxedStream)
        }
        .boxed()
    }
}

/// Wraps an open stream in a secure layer (TLS, SASL security layer).
pub trait StreamUpgrader: Send + Sync + 'static {
    fn upgrade(&self, stream: BoxedStream) -> BoxFuture<'static, io::Result<BoxedStream>>;
}

impl<F> StreamUpgrader for F
where
    F: Fn(BoxedStream) -> BoxFuture<'static, io::Result<BoxedStream>> + Send + Sync + 'static,
{
    fn upgrade(&self, stream: BoxedStream) -> BoxFuture<'static, io::Result<BoxedStream>> {
        self(stream)
    }
}
