//! Relay directory: who is registered on this relay, and through which session
//!
//! Two maps keyed by peer-id: the registered public identity, and a weak
//! handle to the live session that registered it. Re-registration overwrites
//! both. An entry is purged only by the session that wrote it, so a stale
//! session closing late cannot evict a newer registration.

use super::session::{RelaySession, WeakRelaySession};
use crate::identity::PeerIdentity;
use parking_lot::RwLock;
use std::collections::HashMap;

struct SessionEntry {
    generation: u64,
    session: WeakRelaySession,
}

#[derive(Default)]
struct Maps {
    identities: HashMap<String, PeerIdentity>,
    sessions: HashMap<String, SessionEntry>,
}

pub struct RelayDirectory {
    maps: RwLock<Maps>,
    capacity: usize,
}

impl RelayDirectory {
    pub fn new(capacity: usize) -> Self {
        Self {
            maps: RwLock::new(Maps::default()),
            capacity,
        }
    }

    /// Record `identity` as reachable through `session`.
    ///
    /// Returns false when the directory is full and `identity` is not
    /// already present.
    pub fn register(&self, identity: PeerIdentity, session: &RelaySession) -> bool {
        let mut maps = self.maps.write();
        let peer_id = identity.peer_id().to_string();
        if !maps.identities.contains_key(&peer_id) && maps.identities.len() >= self.capacity {
            return false;
        }
        maps.sessions.insert(
            peer_id.clone(),
            SessionEntry {
                generation: session.generation(),
                session: session.downgrade(),
            },
        );
        maps.identities.insert(peer_id, identity);
        true
    }

    /// Registered identity for `peer_id`
    pub fn identity(&self, peer_id: &str) -> Option<PeerIdentity> {
        self.maps.read().identities.get(peer_id).cloned()
    }

    /// Live session for `peer_id`, if it is still online
    pub fn session(&self, peer_id: &str) -> Option<RelaySession> {
        self.maps
            .read()
            .sessions
            .get(peer_id)
            .and_then(|entry| entry.session.upgrade())
            .filter(|session| session.is_online())
    }

    /// Remove `peer_id` if it is still owned by the session with `generation`.
    pub fn purge(&self, peer_id: &str, generation: u64) -> bool {
        let mut maps = self.maps.write();
        let owned = maps
            .sessions
            .get(peer_id)
            .map_or(false, |entry| entry.generation == generation);
        if owned {
            maps.sessions.remove(peer_id);
            maps.identities.remove(peer_id);
        }
        owned
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.maps.read().identities.contains_key(peer_id)
    }

    pub fn len(&self) -> usize {
        self.maps.read().identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.read().identities.is_empty()
    }

    pub fn clear(&self) {
        let mut maps = self.maps.write();
        maps.identities.clear();
        maps.sessions.clear();
    }
}

// ===== TESTS =====
