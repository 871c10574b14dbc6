// Transport: authenticated byte streams carrying framed envelopes

pub mod framing;
pub mod handshake;
pub mod tcp;

pub use framing::{FrameReader, FrameWriter};
pub use tcp::{dial, upgrade, Listener};

use crate::identity::PeerIdentity;
use tokio::io::{AsyncRead, AsyncWrite};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One bidirectional stream to a remote peer.
///
/// `peer` is the transport-level identity of the remote end. Connections
/// produced by [`dial`], [`Listener::accept`] and [`upgrade`] have proven it
/// with the handshake.
pub struct Connection {
    pub peer: PeerIdentity,
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
}

impl Connection {
    pub fn new<R, W>(peer: PeerIdentity, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            peer,
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }

    /// Two ends of an in-memory stream between `a` and `b`, for in-process use.
    ///
    /// The first connection is `a`'s view (its peer is `b`), the second is
    /// `b`'s. No handshake runs: identities are taken as given.
    pub fn pair(a: &PeerIdentity, b: &PeerIdentity) -> (Connection, Connection) {
        let (left, right) = tokio::io::duplex(256 * 1024);
        let (lr, lw) = tokio::io::split(left);
        let (rr, rw) = tokio::io::split(right);
        (
            Connection::new(b.clone(), lr, lw),
            Connection::new(a.clone(), rr, rw),
        )
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("peer", &self.peer).finish()
    }
}
