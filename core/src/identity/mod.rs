// Identity: local keys, public peer identities, persistence

mod keys;
mod peer;
mod store;

pub use keys::IdentityKeys;
pub use peer::{peer_id_from_public_key, PeerIdentity, PeerRef};
pub use store::IdentityStore;

use anyhow::Result;
use std::path::Path;

/// The node's key pair together with the store it was loaded from.
///
/// Opening a store that holds no keys generates and saves a fresh pair, so a
/// manager always has keys.
pub struct IdentityManager {
    store: IdentityStore,
    keys: IdentityKeys,
}

impl IdentityManager {
    pub fn open(store: IdentityStore) -> Result<Self> {
        let keys = match store.load_keys()? {
            Some(keys) => {
                tracing::info!(peer_id = %keys.peer_id(), "loaded identity");
                keys
            }
            None => {
                let keys = IdentityKeys::generate();
                store.save_keys(&keys)?;
                tracing::info!(peer_id = %keys.peer_id(), "generated identity");
                keys
            }
        };
        Ok(Self { store, keys })
    }

    /// Keys that vanish with the process
    pub fn ephemeral() -> Result<Self> {
        Self::open(IdentityStore::memory())
    }

    /// Keys kept in a sled database at `path`
    pub fn open_path(path: &Path) -> Result<Self> {
        Self::open(IdentityStore::persistent(&path.to_string_lossy())?)
    }

    pub fn keys(&self) -> &IdentityKeys {
        &self.keys
    }

    pub fn identity(&self) -> PeerIdentity {
        self.keys.identity()
    }

    /// Replace the stored key pair with a new one. Peers that cached the old
    /// identity will no longer be able to reach this node under it.
    pub fn regenerate(&mut self) -> Result<&IdentityKeys> {
        let keys = IdentityKeys::generate();
        self.store.save_keys(&keys)?;
        tracing::warn!(old = %self.keys.peer_id(), new = %keys.peer_id(), "identity regenerated");
        self.keys = keys;
        Ok(&self.keys)
    }
}

// ===== TESTS =====
