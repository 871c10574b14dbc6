// Identity persistence: one versioned key record in a sled tree

use super::IdentityKeys;
use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

const TREE: &str = "identity";
const RECORD_KEY: &[u8] = b"local";
const RECORD_VERSION: u8 = 1;

#[derive(Serialize, Deserialize)]
struct KeyRecord {
    version: u8,
    secret: Vec<u8>,
}

/// Where the local key pair is kept between runs.
///
/// `Memory` only lives as long as the store value; `Sled` survives restarts.
pub enum IdentityStore {
    Memory(Mutex<Option<Zeroizing<Vec<u8>>>>),
    Sled(sled::Tree),
}

impl IdentityStore {
    pub fn memory() -> Self {
        Self::Memory(Mutex::new(None))
    }

    /// Open (or create) the database at `path`
    pub fn persistent(path: &str) -> Result<Self> {
        let db = sled::open(path).with_context(|| format!("opening identity db at {}", path))?;
        Ok(Self::Sled(db.open_tree(TREE)?))
    }

    pub fn save_keys(&self, keys: &IdentityKeys) -> Result<()> {
        match self {
            Self::Memory(slot) => {
                *slot.lock() = Some(keys.secret_bytes());
            }
            Self::Sled(tree) => {
                let record = KeyRecord {
                    version: RECORD_VERSION,
                    secret: keys.secret_bytes().to_vec(),
                };
                let encoded = Zeroizing::new(bincode::serialize(&record)?);
                drop(Zeroizing::new(record.secret));
                tree.insert(RECORD_KEY, encoded.as_slice())?;
                tree.flush()?;
            }
        }
        Ok(())
    }

    pub fn load_keys(&self) -> Result<Option<IdentityKeys>> {
        let secret = match self {
            Self::Memory(slot) => slot.lock().clone(),
            Self::Sled(tree) => match tree.get(RECORD_KEY)? {
                None => None,
                Some(raw) => {
                    let record: KeyRecord =
                        bincode::deserialize(&raw).context("corrupt identity record")?;
                    if record.version != RECORD_VERSION {
                        bail!("unsupported identity record version {}", record.version);
                    }
                    Some(Zeroizing::new(record.secret))
                }
            },
        };
        secret.map(|bytes| IdentityKeys::from_secret_bytes(&bytes)).transpose()
    }
}

// ===== TESTS =====
