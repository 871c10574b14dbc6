// TCP transport: dial and listen, upgrading each stream with the handshake

use super::framing::{FrameReader, FrameWriter};
use super::handshake::handshake;
use super::Connection;
use crate::error::RpcError;
use crate::identity::IdentityKeys;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

/// Run the handshake over `stream` and wrap it as an authenticated connection.
pub async fn upgrade<S>(stream: S, keys: &IdentityKeys) -> Result<Connection, RpcError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = FrameReader::new(read_half);
    let mut writer = FrameWriter::new(write_half);
    let peer = handshake(keys, &mut reader, &mut writer).await?;
    Ok(Connection::new(peer, reader.into_inner(), writer.into_inner()))
}

/// Connect to `addr` and authenticate the remote end.
pub async fn dial(addr: &str, keys: &IdentityKeys) -> Result<Connection, RpcError> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    let conn = upgrade(stream, keys).await?;
    info!(addr, peer = %conn.peer, "connected");
    Ok(conn)
}

/// Listening socket handing out raw streams.
///
/// The handshake is left to the caller so a slow peer cannot stall the
/// accept loop.
pub struct Listener {
    inner: TcpListener,
    keys: Arc<IdentityKeys>,
}

impl Listener {
    pub async fn bind(addr: &str, keys: Arc<IdentityKeys>) -> Result<Self, RpcError> {
        let inner = TcpListener::bind(addr).await?;
        info!(addr = %inner.local_addr()?, "listening");
        Ok(Self { inner, keys })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RpcError> {
        Ok(self.inner.local_addr()?)
    }

    pub fn keys(&self) -> &Arc<IdentityKeys> {
        &self.keys
    }

    /// Accept the next raw stream.
    pub async fn accept_stream(&self) -> Result<(TcpStream, SocketAddr), RpcError> {
        let (stream, addr) = self.inner.accept().await?;
        stream.set_nodelay(true)?;
        debug!(%addr, "inbound stream");
        Ok((stream, addr))
    }

    /// Accept the next stream and authenticate it.
    pub async fn accept(&self) -> Result<Connection, RpcError> {
        let (stream, _) = self.accept_stream().await?;
        upgrade(stream, &self.keys).await
    }
}

// ===== TESTS =====
