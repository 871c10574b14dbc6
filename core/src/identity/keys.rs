// Local key pair: the only place a private key lives

use super::PeerIdentity;
use anyhow::{anyhow, Result};
use ed25519_dalek::{Signer, SigningKey, SECRET_KEY_LENGTH};
use rand::RngCore;
use zeroize::Zeroizing;

/// This node's Ed25519 key pair.
///
/// `Debug` prints the peer-id only.
#[derive(Clone)]
pub struct IdentityKeys {
    signing: SigningKey,
}

impl IdentityKeys {
    pub fn generate() -> Self {
        let mut seed = Zeroizing::new([0u8; SECRET_KEY_LENGTH]);
        rand::rngs::OsRng.fill_bytes(&mut seed[..]);
        Self {
            signing: SigningKey::from_bytes(&seed),
        }
    }

    /// Rebuild keys from the 32-byte secret written by [`Self::secret_bytes`]
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self> {
        let seed: Zeroizing<[u8; SECRET_KEY_LENGTH]> =
            Zeroizing::new(bytes.try_into().map_err(|_| {
                anyhow!(
                    "identity secret must be {} bytes, got {}",
                    SECRET_KEY_LENGTH,
                    bytes.len()
                )
            })?);
        Ok(Self {
            signing: SigningKey::from_bytes(&seed),
        })
    }

    /// Secret seed, wiped from memory when the returned buffer drops
    pub fn secret_bytes(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(self.signing.to_bytes().to_vec())
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.signing
    }

    /// Public half of these keys
    pub fn identity(&self) -> PeerIdentity {
        PeerIdentity::from_verifying_key(self.signing.verifying_key())
    }

    pub fn peer_id(&self) -> String {
        self.identity().peer_id().to_string()
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.identity().public_key_bytes())
    }

    /// 64-byte Ed25519 signature over `data`
    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        self.signing.sign(data).to_bytes().to_vec()
    }
}

impl std::fmt::Debug for IdentityKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeys")
            .field("peer_id", &self.peer_id())
            .finish_non_exhaustive()
    }
}

// ===== TESTS =====
