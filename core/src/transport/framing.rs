//! Length-prefixed envelope framing over any async byte stream
//!
//! Each frame is a big-endian `u32` length followed by that many bytes of
//! bincode-encoded envelope.

use crate::error::RpcError;
use crate::protocol::{decode_envelope, encode_envelope, Envelope, MAX_FRAME_SIZE};
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

pub struct FrameReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read one frame. `Ok(None)` means the stream ended cleanly.
    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, RpcError> {
        let len = match self.inner.read_u32().await {
            Ok(len) => len as usize,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        // An oversized length cannot be skipped safely: the stream is unusable.
        if len > MAX_FRAME_SIZE {
            return Err(RpcError::PayloadTooLarge {
                size: len,
                max: MAX_FRAME_SIZE,
            });
        }
        let mut buf = vec![0u8; len];
        self.inner.read_exact(&mut buf).await?;
        trace!(len, "frame read");
        Ok(Some(buf))
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn write_frame(&mut self, bytes: &[u8]) -> Result<(), RpcError> {
        if bytes.len() > MAX_FRAME_SIZE {
            return Err(RpcError::PayloadTooLarge {
                size: bytes.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        self.inner.write_u32(bytes.len() as u32).await?;
        self.inner.write_all(bytes).await?;
        self.inner.flush().await?;
        trace!(len = bytes.len(), "frame written");
        Ok(())
    }

    pub async fn write_envelope(&mut self, envelope: &Envelope) -> Result<(), RpcError> {
        let bytes = encode_envelope(envelope)?;
        self.write_frame(&bytes).await
    }

    pub async fn shutdown(&mut self) -> Result<(), RpcError> {
        self.inner.shutdown().await?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Drain the connection's outbound queue onto `writer`, in order.
///
/// Ends when every sender is dropped or the stream fails; either way the
/// connection is marked offline.
pub fn spawn_writer<W>(
    writer: W,
    mut outbound: mpsc::UnboundedReceiver<Envelope>,
    online: Arc<AtomicBool>,
    peer: String,
) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut writer = FrameWriter::new(writer);
        while let Some(envelope) = outbound.recv().await {
            match writer.write_envelope(&envelope).await {
                Ok(()) => {}
                Err(RpcError::Io(e)) => {
                    warn!(peer = %peer, error = %e, "write failed, closing connection");
                    break;
                }
                Err(e) => {
                    warn!(
                        peer = %peer,
                        kind = envelope.message_type(),
                        id = envelope.id(),
                        error = %e,
                        "dropping unencodable envelope"
                    );
                }
            }
        }
        online.store(false, Ordering::SeqCst);
        let _ = writer.shutdown().await;
        debug!(peer = %peer, "writer finished");
    })
}

/// Feed every well-formed inbound envelope to `on_envelope`, in arrival order.
///
/// Malformed frames are logged and dropped; returns when the stream ends or fails.
pub async fn drain<R, F>(mut reader: FrameReader<R>, peer: &str, mut on_envelope: F)
where
    R: AsyncRead + Unpin,
    F: FnMut(Envelope),
{
    loop {
        let frame = match reader.read_frame().await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!(peer = %peer, "stream ended");
                return;
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "stream failed");
                return;
            }
        };
        match decode_envelope(&frame) {
            Ok(envelope) => on_envelope(envelope),
            Err(e) => warn!(peer = %peer, error = %e, "dropping malformed envelope"),
        }
    }
}

// ===== TESTS =====

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ErrorCode, Response};

    #[tokio::test]
    async fn test_frames_in_order() {
        let (a, b) = tokio::io::duplex(4096);
        let mut writer = FrameWriter::new(a);
        let mut reader = FrameReader::new(b);

        writer.write_frame(b"one").await.unwrap();
        writer.write_frame(b"two").await.unwrap();
        drop(writer);

        assert_eq!(reader.read_frame().await.unwrap().unwrap(), b"one");
        assert_eq!(reader.read_frame().await.unwrap().unwrap(), b"two");
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_length_is_fatal() {
        let (mut a, b) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(b);

        a.write_u32((MAX_FRAME_SIZE + 1) as u32).await.unwrap();
        assert!(matches!(
            reader.read_frame().await,
            Err(RpcError::PayloadTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_drain_skips_malformed_frames() {
        let (a, b) = tokio::io::duplex(4096);
        let mut writer = FrameWriter::new(a);

        writer.write_frame(&[0xff, 0xff, 0xff, 0xff]).await.unwrap();
        writer
            .write_envelope(&Envelope::Response(Response::error(2, ErrorCode::Nack)))
            .await
            .unwrap();
        drop(writer);

        let mut seen = Vec::new();
        drain(FrameReader::new(b), "test", |env| seen.push(env)).await;

        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].id(), 2);
    }

    #[tokio::test]
    async fn test_writer_marks_offline_when_queue_closes() {
        let (a, b) = tokio::io::duplex(4096);
        let (tx, rx) = mpsc::unbounded_channel();
        let online = Arc::new(AtomicBool::new(true));

        let task = spawn_writer(a, rx, Arc::clone(&online), "test".into());
        tx.send(Envelope::lookup(2, "QmPeer")).unwrap();
        drop(tx);
        task.await.unwrap();

        assert!(!online.load(Ordering::SeqCst));

        let mut reader = FrameReader::new(b);
        let frame = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(decode_envelope(&frame).unwrap(), Envelope::lookup(2, "QmPeer"));
        assert!(reader.read_frame().await.unwrap().is_none());
    }
}
