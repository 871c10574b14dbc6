//! Error types shared by sessions, the relay and the exchange facade

use crate::protocol::ErrorCode;
use thiserror::Error;

/// Failure of a single call, envelope or connection step.
///
/// Only [`RpcError::Remote`] travels over the wire; every other variant is
/// raised locally.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("{0}")]
    Remote(ErrorCode),
    #[error("Call timed out")]
    Timeout,
    #[error("Not online")]
    NotOnline,
    #[error("No rendezvous points connected")]
    NoRendezvousPoints,
    #[error("Id is not matching: requested {requested}, got {returned}")]
    IdMismatch { requested: String, returned: String },
    #[error("Signature check failed")]
    SignatureInvalid,
    #[error("No public key known for peer {0}")]
    MissingPublicKey(String),
    #[error("Payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("Cryptography error: {0}")]
    Crypto(String),
    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),
    #[error("Codec error: {0}")]
    Codec(String),
    #[error("Handshake failed: {0}")]
    Handshake(String),
    #[error("Unexpected reply")]
    UnexpectedReply,
    #[error("Relay server not enabled")]
    ServerDisabled,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<bincode::Error> for RpcError {
    fn from(err: bincode::Error) -> Self {
        RpcError::Codec(err.to_string())
    }
}

// ===== TESTS =====

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_display_uses_code_description() {
        let err = RpcError::Remote(ErrorCode::NotFound);
        assert_eq!(err.to_string(), "Peer not found (peer might not be connected?)");
        assert_eq!(
            RpcError::Remote(ErrorCode::Nack).to_string(),
            "Other side refused to process request"
        );
    }

    #[test]
    fn test_bincode_failure_becomes_codec_error() {
        let err: RpcError = bincode::deserialize::<String>(&[0xff]).unwrap_err().into();
        assert!(matches!(err, RpcError::Codec(_)));
    }
}
