// Envelope codec: bincode serialization with size limits to prevent abuse

use super::{Envelope, MAX_DATA_SIZE};
use crate::error::RpcError;

/// Maximum encoded envelope size: payload ceiling plus headroom for
/// namespace, signature and the serialized remote identity.
pub const MAX_FRAME_SIZE: usize = MAX_DATA_SIZE + 64 * 1024;

/// Serialize an Envelope to bytes (bincode)
pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>, RpcError> {
    check_data_len(envelope)?;

    let bytes = bincode::serialize(envelope)?;

    if bytes.len() > MAX_FRAME_SIZE {
        return Err(RpcError::PayloadTooLarge {
            size: bytes.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    Ok(bytes)
}

/// Deserialize bytes to an Envelope
pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope, RpcError> {
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(RpcError::PayloadTooLarge {
            size: bytes.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    let envelope: Envelope = bincode::deserialize(bytes)?;
    check_data_len(&envelope)?;
    Ok(envelope)
}

fn check_data_len(envelope: &Envelope) -> Result<(), RpcError> {
    let size = envelope.data_len();
    if size > MAX_DATA_SIZE {
        return Err(RpcError::PayloadTooLarge {
            size,
            max: MAX_DATA_SIZE,
        });
    }
    Ok(())
}

// ===== TESTS =====
