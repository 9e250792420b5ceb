//! Peer transport collaborator.
//!
//! The scheduler only needs a bidirectional byte stream per connection;
//! frames are layered on top by the connection tasks. Production uses TCP,
//! tests use an in-memory fabric handing out duplex stream halves.

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

/// Marker for boxed bidirectional streams.
pub trait StreamIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> StreamIo for T {}

/// Boxed bidirectional peer stream.
pub type PeerStream = Box<dyn StreamIo>;

/// Dial/accept capability for peer connections.
#[async_trait]
pub trait PeerNetwork: Send + Sync + 'static {
    /// Address remote peers should dial, as announced to the tracker.
    fn local_addr(&self) -> SocketAddr;

    /// Opens a stream to a remote peer.
    ///
    /// # Errors
    /// Returns the underlying transport error; the caller treats a failed
    /// dial like a failed handshake.
    async fn dial(&self, addr: SocketAddr) -> std::io::Result<PeerStream>;

    /// Waits for the next inbound stream.
    ///
    /// # Errors
    /// Returns the underlying transport error; the accept loop logs and
    /// continues.
    async fn accept(&self) -> std::io::Result<PeerStream>;
}

/// TCP-backed peer network.
pub struct TcpPeerNetwork {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl TcpPeerNetwork {
    /// Binds a listener on `addr`.
    ///
    /// # Errors
    /// Returns the bind error from the operating system.
    pub async fn bind(addr: SocketAddr) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
        })
    }
}

#[async_trait]
impl PeerNetwork for TcpPeerNetwork {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn dial(&self, addr: SocketAddr) -> std::io::Result<PeerStream> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    async fn accept(&self) -> std::io::Result<PeerStream> {
        let (stream, _) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn test_tcp_network_dial_accept() {
        let server = TcpPeerNetwork::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = server.local_addr();
        let client = TcpPeerNetwork::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        let accept = tokio::spawn(async move { server.accept().await.unwrap() });
        let mut outbound = client.dial(addr).await.unwrap();
        let mut inbound = accept.await.unwrap();

        outbound.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        inbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }
}
