//! Exchange facade: one entry point over every relay this peer is connected to
//!
//! Calls go to the first online session; on failure the same call is retried
//! on the next one, and the last session's error is what the caller sees.

use crate::error::RpcError;
use crate::identity::{IdentityKeys, PeerIdentity, PeerRef};
use crate::protocol::CALL_TIMEOUT;
use crate::relay::{RelayServer, RelayServerConfig, RelaySession};
use crate::rpc::{ClientSession, RequestHandler, SessionConfig};
use crate::transport::{self, Connection, Listener};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Exchange configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    /// Also act as a relay for inbound connections
    pub enable_server: bool,
    /// Encrypt and sign request payloads end to end
    pub secure: bool,
    /// Seconds before an unanswered call times out
    pub call_timeout_secs: u64,
    /// Looked-up identities kept for reuse (0 disables the cache)
    pub identity_cache_size: usize,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            enable_server: false,
            secure: true,
            call_timeout_secs: CALL_TIMEOUT.as_secs(),
            identity_cache_size: 256,
        }
    }
}

impl ExchangeConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            secure: self.secure,
            call_timeout: self.call_timeout(),
        }
    }
}

/// Bounded first-in first-out identity cache
struct IdentityCache {
    capacity: usize,
    entries: HashMap<String, PeerIdentity>,
    order: VecDeque<String>,
}

impl IdentityCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&self, peer_id: &str) -> Option<PeerIdentity> {
        self.entries.get(peer_id).cloned()
    }

    fn insert(&mut self, identity: PeerIdentity) {
        if self.capacity == 0 {
            return;
        }
        let peer_id = identity.peer_id().to_string();
        if self.entries.insert(peer_id.clone(), identity).is_some() {
            return;
        }
        self.order.push_back(peer_id);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

pub struct Exchange {
    config: ExchangeConfig,
    keys: Arc<IdentityKeys>,
    handler: Arc<dyn RequestHandler>,
    sessions: RwLock<Vec<ClientSession>>,
    cache: Mutex<IdentityCache>,
    relay: Option<Arc<RelayServer>>,
}

impl Exchange {
    pub fn new(keys: IdentityKeys, handler: Arc<dyn RequestHandler>, config: ExchangeConfig) -> Self {
        let relay = config.enable_server.then(|| {
            Arc::new(RelayServer::with_config(RelayServerConfig {
                call_timeout: config.call_timeout(),
                ..RelayServerConfig::default()
            }))
        });
        info!(
            peer_id = %keys.peer_id(),
            secure = config.secure,
            relay = config.enable_server,
            "exchange created"
        );
        Self {
            cache: Mutex::new(IdentityCache::new(config.identity_cache_size)),
            config,
            keys: Arc::new(keys),
            handler,
            sessions: RwLock::new(Vec::new()),
            relay,
        }
    }

    pub fn config(&self) -> &ExchangeConfig {
        &self.config
    }

    /// Local public identity
    pub fn identity(&self) -> PeerIdentity {
        self.keys.identity()
    }

    pub fn keys(&self) -> &Arc<IdentityKeys> {
        &self.keys
    }

    /// Embedded relay server, when `enable_server` is set
    pub fn relay(&self) -> Option<&Arc<RelayServer>> {
        self.relay.as_ref()
    }

    /// Open a client session over `conn` and add it after the existing ones.
    pub fn connect(&self, conn: Connection) -> ClientSession {
        let session = ClientSession::spawn(
            conn,
            Arc::clone(&self.keys),
            Arc::clone(&self.handler),
            self.config.session_config(),
        );
        self.sessions.write().push(session.clone());
        session
    }

    /// Dial a relay over TCP and open a session to it.
    pub async fn dial(&self, addr: &str) -> Result<ClientSession, RpcError> {
        let conn = transport::dial(addr, &self.keys).await?;
        Ok(self.connect(conn))
    }

    /// Hand an inbound connection to the embedded relay server.
    pub fn accept(&self, conn: Connection) -> Result<RelaySession, RpcError> {
        match &self.relay {
            Some(relay) => Ok(relay.accept(conn)),
            None => Err(RpcError::ServerDisabled),
        }
    }

    /// Run the embedded relay's accept loop on `listener` until the relay stops.
    pub async fn serve(&self, listener: Listener) -> Result<(), RpcError> {
        match &self.relay {
            Some(relay) => Arc::clone(relay).serve(listener).await,
            None => Err(RpcError::ServerDisabled),
        }
    }

    /// Sessions still online
    pub fn session_count(&self) -> usize {
        self.sessions
            .read()
            .iter()
            .filter(|s| s.is_online())
            .count()
    }

    /// Identities currently cached
    pub fn cached_identities(&self) -> usize {
        self.cache.lock().len()
    }

    /// Resolve `peer` to a full identity, asking the relays only when needed.
    pub async fn get_identity(&self, peer: impl Into<PeerRef>) -> Result<PeerIdentity, RpcError> {
        let peer = peer.into();
        if let Some(identity) = peer.identity() {
            return Ok(identity.clone());
        }
        let peer_id = peer.peer_id().to_string();
        let cached = self.cache.lock().get(&peer_id);
        if let Some(identity) = cached {
            debug!(peer_id = %peer_id, "identity cache hit");
            return Ok(identity);
        }

        let identity = self
            .with_failover("lookup", |session| {
                let peer_id = peer_id.clone();
                async move { session.lookup(&peer_id).await }
            })
            .await?;
        self.cache.lock().insert(identity.clone());
        Ok(identity)
    }

    /// Send `data` to `peer` under `namespace` through the first relay that
    /// delivers it.
    pub async fn request(
        &self,
        peer: impl Into<PeerRef>,
        namespace: &str,
        data: Vec<u8>,
    ) -> Result<Vec<u8>, RpcError> {
        let mut target = peer.into();
        if self.config.secure && target.identity().is_none() {
            target = PeerRef::Identity(self.get_identity(target).await?);
        }

        self.with_failover("request", |session| {
            let target = target.clone();
            let namespace = namespace.to_string();
            let data = data.clone();
            async move { session.request(&target, &namespace, data).await }
        })
        .await
    }

    /// Close every client session and stop the embedded relay.
    pub fn stop(&self) {
        let sessions: Vec<ClientSession> = self.sessions.write().drain(..).collect();
        for session in &sessions {
            session.close();
        }
        if let Some(relay) = &self.relay {
            relay.stop();
        }
        info!(sessions = sessions.len(), "exchange stopped");
    }

    /// Drop offline sessions and snapshot the rest, in order.
    fn live_sessions(&self) -> Result<Vec<ClientSession>, RpcError> {
        let mut sessions = self.sessions.write();
        sessions.retain(|s| s.is_online());
        if sessions.is_empty() {
            return Err(RpcError::NoRendezvousPoints);
        }
        Ok(sessions.clone())
    }

    async fn with_failover<T, F, Fut>(&self, call: &'static str, mut attempt: F) -> Result<T, RpcError>
    where
        F: FnMut(ClientSession) -> Fut,
        Fut: Future<Output = Result<T, RpcError>>,
    {
        let mut last_error = RpcError::NoRendezvousPoints;
        for session in self.live_sessions()? {
            let relay = session.relay().clone();
            match attempt(session).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    debug!(call, relay = %relay, error = %e, "call failed, trying next rendezvous point");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }
}

impl Drop for Exchange {
    fn drop(&mut self) {
        self.stop();
    }
}

// ===== TESTS =====

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::NackHandler;

    fn exchange(config: ExchangeConfig) -> Exchange {
        Exchange::new(IdentityKeys::generate(), Arc::new(NackHandler), config)
    }

    #[test]
    fn test_config_defaults() {
        let config = ExchangeConfig::default();
        assert!(!config.enable_server);
        assert!(config.secure);
        assert_eq!(config.call_timeout(), Duration::from_secs(10));
        assert_eq!(config.identity_cache_size, 256);
    }

    #[test]
    fn test_config_partial_json_uses_defaults() {
        let config: ExchangeConfig = serde_json::from_str(r#"{"secure": false}"#).unwrap();
        assert!(!config.secure);
        assert_eq!(config.call_timeout_secs, 10);
    }

    #[test]
    fn test_cache_evicts_oldest() {
        let mut cache = IdentityCache::new(2);
        let a = IdentityKeys::generate().identity();
        let b = IdentityKeys::generate().identity();
        let c = IdentityKeys::generate().identity();

        cache.insert(a.clone());
        cache.insert(b.clone());
        cache.insert(a.clone());
        cache.insert(c.clone());

        assert!(cache.get(a.peer_id()).is_none());
        assert_eq!(cache.get(b.peer_id()), Some(b));
        assert_eq!(cache.get(c.peer_id()), Some(c));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_zero_capacity_cache_stores_nothing() {
        let mut cache = IdentityCache::new(0);
        cache.insert(IdentityKeys::generate().identity());
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test]
    async fn test_no_sessions_fails_fast() {
        let exchange = exchange(ExchangeConfig::default());
        assert!(matches!(
            exchange.get_identity("QmNobody").await,
            Err(RpcError::NoRendezvousPoints)
        ));
        assert!(matches!(
            exchange.request("QmNobody", "ns", vec![]).await,
            Err(RpcError::NoRendezvousPoints)
        ));
    }

    #[tokio::test]
    async fn test_full_identity_needs_no_lookup() {
        let exchange = exchange(ExchangeConfig::default());
        let peer = IdentityKeys::generate().identity();
        // No sessions: any network call would fail
        assert_eq!(exchange.get_identity(&peer).await.unwrap(), peer);
    }

    #[tokio::test]
    async fn test_accept_requires_server() {
        let exchange = exchange(ExchangeConfig::default());
        let a = IdentityKeys::generate().identity();
        let (_mine, theirs) = Connection::pair(&a, &exchange.identity());
        assert!(matches!(
            exchange.accept(theirs),
            Err(RpcError::ServerDisabled)
        ));
    }

    #[test]
    fn test_embedded_relay_uses_call_timeout() {
        let exchange = exchange(ExchangeConfig {
            enable_server: true,
            call_timeout_secs: 3,
            ..ExchangeConfig::default()
        });
        let relay = exchange.relay().unwrap();
        assert_eq!(relay.config().call_timeout, Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_serve_requires_server() {
        let exchange = exchange(ExchangeConfig::default());
        let listener = Listener::bind("127.0.0.1:0", Arc::clone(exchange.keys()))
            .await
            .unwrap();
        assert!(matches!(
            exchange.serve(listener).await,
            Err(RpcError::ServerDisabled)
        ));
    }

    #[tokio::test]
    async fn test_offline_sessions_are_pruned() {
        let exchange = exchange(ExchangeConfig::default());
        let relay = IdentityKeys::generate().identity();
        let (conn, _relay_side) = Connection::pair(&exchange.identity(), &relay);
        let session = exchange.connect(conn);
        assert_eq!(exchange.session_count(), 1);

        session.close();
        assert_eq!(exchange.session_count(), 0);
        assert!(matches!(
            exchange.get_identity("QmNobody").await,
            Err(RpcError::NoRendezvousPoints)
        ));
    }
}
