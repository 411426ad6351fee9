//! Outbound connection establishment for tracked flows.

use futures::FutureExt;
use futures::future::BoxFuture;
use std::io;
use std::net::SocketAddrV4;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// A bidirectional byte stream a flow relays into.
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Connection for T {}

pub type BoxConnection = Box<dyn Connection>;

/// Opens outbound connections.
///
/// `dial` is called synchronously when the first SYN of a flow arrives; the
/// returned future runs on its own task and reports back to the tracker.
pub trait Dialer: Send + Sync + 'static {
    fn dial(&self, addr: SocketAddrV4) -> BoxFuture<'static, io::Result<BoxConnection>>;
}

/// Dials real TCP connections with tokio.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    connect_timeout: Duration,
}

impl TcpDialer {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Dialer for TcpDialer {
    fn dial(&self, addr: SocketAddrV4) -> BoxFuture<'static, io::Result<BoxConnection>> {
        let connect_timeout = self.connect_timeout;
        async move {
            let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
                .await
                .map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("connect to {addr} timed out after {connect_timeout:?}"),
                    )
                })??;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream) as BoxConnection)
        }
        .boxed()
    }
}
