// Authenticated connection handshake
//
// Both ends run the same exchange:
// 1. Send Hello { protocol, public_key, nonce }
// 2. Receive the peer's Hello and check the protocol tag
// 3. Send Proof: signature over (protocol || peer_nonce || own_public_key)
// 4. Receive the peer's Proof and verify it against the key it announced
//
// A completed handshake proves the remote holds the secret key for the
// identity it claims, so sessions can trust `Connection::peer`.

use super::framing::{FrameReader, FrameWriter};
use crate::error::RpcError;
use crate::identity::{IdentityKeys, PeerIdentity};
use crate::protocol::PROTOCOL_TAG;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

/// Upper bound on the whole handshake
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

const NONCE_LEN: usize = 32;

#[derive(Debug, Serialize, Deserialize)]
struct Hello {
    protocol: String,
    public_key: [u8; 32],
    nonce: [u8; NONCE_LEN],
}

#[derive(Debug, Serialize, Deserialize)]
struct Proof {
    signature: Vec<u8>,
}

fn transcript(nonce: &[u8; NONCE_LEN], signer: &[u8; 32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(PROTOCOL_TAG.len() + NONCE_LEN + 32);
    out.extend_from_slice(PROTOCOL_TAG.as_bytes());
    out.extend_from_slice(nonce);
    out.extend_from_slice(signer);
    out
}

async fn read_message<R, M>(reader: &mut FrameReader<R>) -> Result<M, RpcError>
where
    R: AsyncRead + Unpin,
    M: for<'de> Deserialize<'de>,
{
    let frame = reader
        .read_frame()
        .await?
        .ok_or_else(|| RpcError::Handshake("connection closed".into()))?;
    bincode::deserialize(&frame).map_err(|e| RpcError::Handshake(e.to_string()))
}

/// Authenticate both ends of a fresh stream and return the remote identity.
pub async fn handshake<R, W>(
    keys: &IdentityKeys,
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
) -> Result<PeerIdentity, RpcError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    tokio::time::timeout(HANDSHAKE_TIMEOUT, run(keys, reader, writer))
        .await
        .map_err(|_| RpcError::Handshake("timed out".into()))?
}

async fn run<R, W>(
    keys: &IdentityKeys,
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
) -> Result<PeerIdentity, RpcError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let own_key = keys.identity().public_key_bytes();
    let mut nonce = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    let hello = Hello {
        protocol: PROTOCOL_TAG.to_string(),
        public_key: own_key,
        nonce,
    };
    writer.write_frame(&bincode::serialize(&hello)?).await?;

    let remote_hello: Hello = read_message(reader).await?;
    if remote_hello.protocol != PROTOCOL_TAG {
        return Err(RpcError::Handshake(format!(
            "protocol mismatch: expected {}, got {}",
            PROTOCOL_TAG, remote_hello.protocol
        )));
    }
    let remote = PeerIdentity::from_bytes(&remote_hello.public_key)
        .map_err(|e| RpcError::Handshake(e.to_string()))?;

    let proof = Proof {
        signature: keys.sign(&transcript(&remote_hello.nonce, &own_key)),
    };
    writer.write_frame(&bincode::serialize(&proof)?).await?;

    let remote_proof: Proof = read_message(reader).await?;
    if !remote.verify(
        &transcript(&nonce, &remote_hello.public_key),
        &remote_proof.signature,
    ) {
        return Err(RpcError::Handshake(format!(
            "{} failed to prove key ownership",
            remote
        )));
    }

    debug!(peer = %remote, "handshake complete");
    Ok(remote)
}

// ===== TESTS =====
