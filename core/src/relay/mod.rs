//! Rendezvous relay
//!
//! Any peer can act as a relay: it keeps a directory of the peers
//! registered on it and forwards requests between their sessions without
//! reading the payloads.

pub mod directory;
pub mod server;
pub mod session;

pub use directory::RelayDirectory;
pub use server::{RelayServer, RelayServerConfig, RelayServerStats};
pub use session::{Registration, RelaySession, WeakRelaySession};
