//! Relay Server: accepts client connections and routes between them

use super::directory::RelayDirectory;
use super::session::RelaySession;
use crate::error::RpcError;
use crate::protocol::CALL_TIMEOUT;
use crate::transport::{upgrade, Connection, Listener};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Relay server configuration
#[derive(Debug, Clone)]
pub struct RelayServerConfig {
    /// Remove a peer's directory entries when its session closes
    pub purge_on_disconnect: bool,
    /// Maximum registered peers
    pub max_sessions: usize,
    /// Window for a forwarded request to be answered
    pub call_timeout: Duration,
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        Self {
            purge_on_disconnect: true,
            max_sessions: 10_000,
            call_timeout: CALL_TIMEOUT,
        }
    }
}

/// Statistics about relay server operations
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayServerStats {
    /// Sessions whose connection is still open
    pub sessions_active: usize,
    /// Successful registrations
    pub registrations: u64,
    /// Directory queries answered
    pub lookups: u64,
    /// Requests forwarded and answered by their destination
    pub requests_forwarded: u64,
    /// Forwarded requests that failed or timed out
    pub forward_failures: u64,
}

/// State shared by the server and all of its sessions
pub(crate) struct RelayContext {
    pub config: RelayServerConfig,
    pub directory: RelayDirectory,
    pub stats: RwLock<RelayServerStats>,
}

/// The relay server
pub struct RelayServer {
    context: Arc<RelayContext>,
    /// Sessions accepted so far, pruned of closed ones on each accept
    sessions: Mutex<Vec<RelaySession>>,
    shutdown: watch::Sender<bool>,
}

impl RelayServer {
    /// Create a new relay server with default configuration
    pub fn new() -> Self {
        Self::with_config(RelayServerConfig::default())
    }

    /// Create a new relay server with custom configuration
    pub fn with_config(config: RelayServerConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            context: Arc::new(RelayContext {
                directory: RelayDirectory::new(config.max_sessions),
                stats: RwLock::new(RelayServerStats::default()),
                config,
            }),
            sessions: Mutex::new(Vec::new()),
            shutdown,
        }
    }

    pub fn config(&self) -> &RelayServerConfig {
        &self.context.config
    }

    pub fn directory(&self) -> &RelayDirectory {
        &self.context.directory
    }

    /// Start serving an already authenticated connection.
    pub fn accept(&self, conn: Connection) -> RelaySession {
        let session = RelaySession::spawn(conn, Arc::clone(&self.context));
        let mut sessions = self.sessions.lock();
        sessions.retain(|s| s.is_online());
        sessions.push(session.clone());
        session
    }

    /// Accept and authenticate TCP connections until [`RelayServer::stop`].
    pub async fn serve(self: Arc<Self>, listener: Listener) -> Result<(), RpcError> {
        let mut shutdown = self.shutdown.subscribe();
        info!(addr = %listener.local_addr()?, "relay serving");

        while !*shutdown.borrow() {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept_stream() => {
                    let (stream, addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let server = Arc::clone(&self);
                    let keys = Arc::clone(listener.keys());
                    tokio::spawn(async move {
                        match upgrade(stream, &keys).await {
                            Ok(conn) => {
                                server.accept(conn);
                            }
                            Err(e) => warn!(%addr, error = %e, "handshake failed"),
                        }
                    });
                }
            }
        }

        info!("relay stopped serving");
        Ok(())
    }

    /// Close every session and empty the directory.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
        let sessions: Vec<RelaySession> = self.sessions.lock().drain(..).collect();
        let count = sessions.len();
        for session in sessions {
            session.close();
        }
        self.context.directory.clear();
        info!(sessions = count, "relay server stopped");
    }

    pub fn get_stats(&self) -> RelayServerStats {
        self.context.stats.read().clone()
    }
}

impl Default for RelayServer {
    fn default() -> Self {
        Self::new()
    }
}

// ===== TESTS =====
