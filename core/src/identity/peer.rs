//! Public peer identity and the peer-id string derived from it
//!
//! A peer-id is the base58 encoding of a sha2-256 multihash of the 32-byte
//! Ed25519 public key, so every id starts with `Qm`.

use crate::error::RpcError;
use ed25519_dalek::{Signature, VerifyingKey};
use sha2::{Digest, Sha256};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Multihash prefix: sha2-256, 32-byte digest
const MULTIHASH_SHA256: [u8; 2] = [0x12, 0x20];

/// Derive the peer-id string for a raw Ed25519 public key
pub fn peer_id_from_public_key(public_key: &[u8; 32]) -> String {
    let digest = Sha256::digest(public_key);
    let mut multihash = Vec::with_capacity(34);
    multihash.extend_from_slice(&MULTIHASH_SHA256);
    multihash.extend_from_slice(&digest);
    bs58::encode(multihash).into_string()
}

/// A peer's public key and the peer-id derived from it. Immutable.
#[derive(Clone)]
pub struct PeerIdentity {
    public_key: VerifyingKey,
    peer_id: String,
}

impl PeerIdentity {
    pub fn from_verifying_key(public_key: VerifyingKey) -> Self {
        let peer_id = peer_id_from_public_key(public_key.as_bytes());
        Self {
            public_key,
            peer_id,
        }
    }

    /// Parse a serialized identity (32-byte Ed25519 public key)
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RpcError> {
        let raw: &[u8; 32] = bytes.try_into().map_err(|_| {
            RpcError::InvalidIdentity(format!("expected 32 bytes, got {}", bytes.len()))
        })?;
        let public_key = VerifyingKey::from_bytes(raw)
            .map_err(|_| RpcError::InvalidIdentity("not a valid Ed25519 point".into()))?;
        if public_key.is_weak() {
            return Err(RpcError::InvalidIdentity("weak public key".into()));
        }
        Ok(Self::from_verifying_key(public_key))
    }

    /// Serialize for the envelope `remote` field
    pub fn to_bytes(&self) -> Vec<u8> {
        self.public_key.to_bytes().to_vec()
    }

    pub fn public_key(&self) -> &VerifyingKey {
        &self.public_key
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.public_key.to_bytes()
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Verify a 64-byte Ed25519 signature over `data`
    pub fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        let signature: &[u8; 64] = match signature.try_into() {
            Ok(sig) => sig,
            Err(_) => return false,
        };
        self.public_key
            .verify_strict(data, &Signature::from_bytes(signature))
            .is_ok()
    }
}

impl PartialEq for PeerIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.public_key.as_bytes() == other.public_key.as_bytes()
    }
}

impl Eq for PeerIdentity {}

impl Hash for PeerIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.public_key.as_bytes().hash(state);
    }
}

impl fmt::Debug for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerIdentity({})", self.peer_id)
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.peer_id)
    }
}

/// Addresses a peer either by bare peer-id or by full identity.
///
/// A full identity already carries the public key and needs no lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerRef {
    Id(String),
    Identity(PeerIdentity),
}

impl PeerRef {
    pub fn peer_id(&self) -> &str {
        match self {
            PeerRef::Id(id) => id,
            PeerRef::Identity(identity) => identity.peer_id(),
        }
    }

    /// The identity, when the public key is known
    pub fn identity(&self) -> Option<&PeerIdentity> {
        match self {
            PeerRef::Id(_) => None,
            PeerRef::Identity(identity) => Some(identity),
        }
    }
}

impl From<PeerIdentity> for PeerRef {
    fn from(identity: PeerIdentity) -> Self {
        PeerRef::Identity(identity)
    }
}

impl From<&PeerIdentity> for PeerRef {
    fn from(identity: &PeerIdentity) -> Self {
        PeerRef::Identity(identity.clone())
    }
}

impl From<String> for PeerRef {
    fn from(peer_id: String) -> Self {
        PeerRef::Id(peer_id)
    }
}

impl From<&str> for PeerRef {
    fn from(peer_id: &str) -> Self {
        PeerRef::Id(peer_id.to_string())
    }
}

// ===== TESTS =====

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityKeys;

    #[test]
    fn test_peer_id_is_stable_and_prefixed() {
        let keys = IdentityKeys::generate();
        let identity = keys.identity();
        assert!(identity.peer_id().starts_with("Qm"));
        assert_eq!(identity.peer_id(), peer_id_from_public_key(&identity.public_key_bytes()));
    }

    #[test]
    fn test_parse_roundtrip() {
        let identity = IdentityKeys::generate().identity();
        let parsed = PeerIdentity::from_bytes(&identity.to_bytes()).unwrap();
        assert_eq!(parsed, identity);
        assert_eq!(parsed.peer_id(), identity.peer_id());
    }

    #[test]
    fn test_parse_rejects_wrong_length() {
        assert!(matches!(
            PeerIdentity::from_bytes(&[1u8; 31]),
            Err(RpcError::InvalidIdentity(_))
        ));
        assert!(PeerIdentity::from_bytes(b"QmNotAnIdentity").is_err());
    }

    #[test]
    fn test_verify_rejects_short_signature() {
        let identity = IdentityKeys::generate().identity();
        assert!(!identity.verify(b"data", &[0u8; 10]));
    }

    #[test]
    fn test_peer_ref_conversions() {
        let identity = IdentityKeys::generate().identity();
        let by_identity = PeerRef::from(&identity);
        assert_eq!(by_identity.peer_id(), identity.peer_id());
        assert!(by_identity.identity().is_some());

        let by_id = PeerRef::from("Qm123");
        assert_eq!(by_id.peer_id(), "Qm123");
        assert!(by_id.identity().is_none());
    }
}
