//! Rendezvous exchange protocol: envelopes, error codes and limits

pub mod codec;
pub mod envelope;

use std::time::Duration;

pub use codec::{decode_envelope, encode_envelope, MAX_FRAME_SIZE};
pub use envelope::{Envelope, ErrorCode, IdLookup, Remote, Request, Response};

/// Protocol tag routing streams to this handler
pub const PROTOCOL_TAG: &str = "/p2p/exchange/rendezvous/1.0.0";

/// Maximum `data` payload carried by one envelope: 1 MiB
pub const MAX_DATA_SIZE: usize = 1024 * 1024;

/// Window after which an unanswered call settles with `TIMEOUT`
pub const CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Correlation id reserved for the self-registration `ID_LOOKUP`
pub const REGISTRATION_ID: u64 = 0;
