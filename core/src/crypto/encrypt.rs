// Payload encryption to a peer identity: X25519 ECDH + XChaCha20-Poly1305
//
// Sealed layout: ephemeral X25519 public key (32) || nonce (24) || ciphertext.
// Both ends map their Ed25519 keys onto Curve25519, agree on a shared point
// with the ephemeral key, and run it through a Blake3 KDF.
//
// The recipient's public key is bound as AAD, so a sealed payload cannot be
// re-targeted at another peer.

use crate::error::RpcError;
use crate::identity::{IdentityKeys, PeerIdentity};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use ed25519_dalek::SigningKey;
use rand::RngCore;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroize;

/// KDF context string for deriving encryption keys from ECDH shared secrets.
/// Changing this breaks compatibility with all sealed payloads in flight.
const KDF_CONTEXT: &str = "rendezvous exchange v1 payload encryption";

const EPHEMERAL_LEN: usize = 32;
const NONCE_LEN: usize = 24;
const TAG_LEN: usize = 16;

/// Bytes `seal` adds on top of the plaintext
pub const SEALED_OVERHEAD: usize = EPHEMERAL_LEN + NONCE_LEN + TAG_LEN;

/// Convert an Ed25519 signing key to an X25519 static secret for ECDH.
///
/// Ed25519 secret scalar is SHA-512(secret_key_bytes)[0..32], clamped;
/// x25519-dalek does its own clamping.
fn ed25519_to_x25519_secret(signing_key: &SigningKey) -> StaticSecret {
    let mut hash = <sha2::Sha512 as sha2::Digest>::digest(signing_key.to_bytes());
    let mut secret_bytes = [0u8; 32];
    secret_bytes.copy_from_slice(&hash[..32]);

    let secret = StaticSecret::from(secret_bytes);

    secret_bytes.zeroize();
    hash.as_mut_slice().zeroize();

    secret
}

/// Convert an Ed25519 verifying key to an X25519 public key
/// (birational map from twisted Edwards to Montgomery form).
fn ed25519_public_to_x25519(identity: &PeerIdentity) -> Result<X25519PublicKey, RpcError> {
    use curve25519_dalek::edwards::CompressedEdwardsY;

    let edwards_point = CompressedEdwardsY(identity.public_key_bytes())
        .decompress()
        .ok_or_else(|| RpcError::Crypto("Failed to decompress Ed25519 public key".into()))?;

    Ok(X25519PublicKey::from(edwards_point.to_montgomery().to_bytes()))
}

/// AEAD keyed from an ECDH shared point; the derived key is wiped once the cipher holds it.
fn cipher_for(shared_secret: &[u8]) -> Result<XChaCha20Poly1305, RpcError> {
    let mut key = blake3::derive_key(KDF_CONTEXT, shared_secret);
    let cipher = XChaCha20Poly1305::new_from_slice(&key)
        .map_err(|e| RpcError::Crypto(format!("Failed to create cipher: {}", e)));
    key.zeroize();
    cipher
}

/// Encrypt `plaintext` so that only `recipient` can open it.
pub fn seal(recipient: &PeerIdentity, plaintext: &[u8]) -> Result<Vec<u8>, RpcError> {
    let recipient_x25519 = ed25519_public_to_x25519(recipient)?;

    let ephemeral = EphemeralSecret::random_from_rng(rand::rngs::OsRng);
    let ephemeral_public = X25519PublicKey::from(&ephemeral);
    let cipher = cipher_for(ephemeral.diffie_hellman(&recipient_x25519).as_bytes())?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from_slice(&nonce_bytes);

    let recipient_key = recipient.public_key_bytes();
    let ciphertext = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad: &recipient_key,
            },
        )
        .map_err(|e| RpcError::Crypto(format!("Encryption failed: {}", e)))?;

    let mut sealed = Vec::with_capacity(EPHEMERAL_LEN + NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(ephemeral_public.as_bytes());
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Decrypt a payload produced by [`seal`] for `keys`.
pub fn open(keys: &IdentityKeys, sealed: &[u8]) -> Result<Vec<u8>, RpcError> {
    if sealed.len() < SEALED_OVERHEAD {
        return Err(RpcError::Crypto("Sealed payload too short".into()));
    }

    let (ephemeral, rest) = sealed.split_at(EPHEMERAL_LEN);
    let (nonce_bytes, ciphertext) = rest.split_at(NONCE_LEN);

    let ephemeral_public = X25519PublicKey::from(
        <[u8; EPHEMERAL_LEN]>::try_from(ephemeral)
            .map_err(|_| RpcError::Crypto("Bad ephemeral key".into()))?,
    );

    let recipient_secret = ed25519_to_x25519_secret(keys.signing_key());
    let cipher = cipher_for(recipient_secret.diffie_hellman(&ephemeral_public).as_bytes())?;

    let recipient_key = keys.identity().public_key_bytes();
    cipher
        .decrypt(
            XNonce::from_slice(nonce_bytes),
            Payload {
                msg: ciphertext,
                aad: &recipient_key,
            },
        )
        .map_err(|_| RpcError::Crypto("Decryption failed: invalid ciphertext or wrong key".into()))
}

/// Encrypt to `recipient`, then sign the ciphertext with `keys`.
///
/// Returns `(ciphertext, signature)` ready for an envelope.
pub fn seal_and_sign(
    keys: &IdentityKeys,
    recipient: &PeerIdentity,
    plaintext: &[u8],
) -> Result<(Vec<u8>, Vec<u8>), RpcError> {
    let sealed = seal(recipient, plaintext)?;
    let signature = keys.sign(&sealed);
    Ok((sealed, signature))
}

/// Verify `signature` over `sealed` against `sender`, then decrypt with `keys`.
///
/// The signature is always checked before any decryption is attempted.
pub fn verify_and_open(
    keys: &IdentityKeys,
    sender: &PeerIdentity,
    sealed: &[u8],
    signature: Option<&[u8]>,
) -> Result<Vec<u8>, RpcError> {
    match signature {
        Some(sig) if sender.verify(sealed, sig) => open(keys, sealed),
        _ => Err(RpcError::SignatureInvalid),
    }
}

// ===== TESTS =====
