//! Envelope: the unit exchanged on a rendezvous connection

use super::REGISTRATION_ID;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Error codes carried in `ID_LOOKUP` and `RESPONSE` envelopes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Addressed peer is unknown to the relay
    NotFound,
    /// Responder declined the request
    Nack,
    /// No answer within the call window
    Timeout,
    /// Internal failure
    Other,
}

impl ErrorCode {
    /// Human-readable description of the code
    pub fn description(&self) -> &'static str {
        match self {
            ErrorCode::NotFound => "Peer not found (peer might not be connected?)",
            ErrorCode::Nack => "Other side refused to process request",
            ErrorCode::Timeout => "Other side did not respond in time",
            ErrorCode::Other => "Internal server error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// The `remote` field: a serialized identity or a bare peer-id string
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Remote {
    /// Serialized public identity (registration, lookup answer, forwarded caller)
    Identity(Vec<u8>),
    /// Peer-id string (lookup query, forwarding target)
    PeerId(String),
}

/// `ID_LOOKUP`: registration, directory query, or directory answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdLookup {
    pub id: u64,
    pub error: Option<ErrorCode>,
    pub remote: Option<Remote>,
}

/// `REQUEST`: application call addressed to (or forwarded from) a peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub namespace: String,
    pub data: Vec<u8>,
    pub signature: Option<Vec<u8>>,
    pub remote: Remote,
}

/// `RESPONSE`: answer to a `REQUEST` with the same correlation id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub error: Option<ErrorCode>,
    pub data: Vec<u8>,
    pub signature: Option<Vec<u8>>,
}

impl Response {
    /// Successful response carrying `data`
    pub fn ok(id: u64, data: Vec<u8>, signature: Option<Vec<u8>>) -> Self {
        Self {
            id,
            error: None,
            data,
            signature,
        }
    }

    /// Failed response carrying only an error code
    pub fn error(id: u64, code: ErrorCode) -> Self {
        Self {
            id,
            error: Some(code),
            data: Vec::new(),
            signature: None,
        }
    }
}

/// A message on a rendezvous connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Envelope {
    IdLookup(IdLookup),
    Request(Request),
    Response(Response),
}

impl Envelope {
    /// Self-registration sent as the first envelope on every client→relay stream
    pub fn registration(identity: Vec<u8>) -> Self {
        Envelope::IdLookup(IdLookup {
            id: REGISTRATION_ID,
            error: None,
            remote: Some(Remote::Identity(identity)),
        })
    }

    /// Directory query for `peer_id`
    pub fn lookup(id: u64, peer_id: impl Into<String>) -> Self {
        Envelope::IdLookup(IdLookup {
            id,
            error: None,
            remote: Some(Remote::PeerId(peer_id.into())),
        })
    }

    /// Directory answer carrying a serialized identity
    pub fn lookup_found(id: u64, identity: Vec<u8>) -> Self {
        Envelope::IdLookup(IdLookup {
            id,
            error: None,
            remote: Some(Remote::Identity(identity)),
        })
    }

    /// Directory answer carrying an error code
    pub fn lookup_failed(id: u64, code: ErrorCode) -> Self {
        Envelope::IdLookup(IdLookup {
            id,
            error: Some(code),
            remote: None,
        })
    }

    /// Correlation id of the envelope
    pub fn id(&self) -> u64 {
        match self {
            Envelope::IdLookup(m) => m.id,
            Envelope::Request(m) => m.id,
            Envelope::Response(m) => m.id,
        }
    }

    /// Size of the opaque payload
    pub fn data_len(&self) -> usize {
        match self {
            Envelope::IdLookup(_) => 0,
            Envelope::Request(m) => m.data.len(),
            Envelope::Response(m) => m.data.len(),
        }
    }

    /// True for the reserved self-registration `ID_LOOKUP`
    pub fn is_registration(&self) -> bool {
        matches!(self, Envelope::IdLookup(m) if m.id == REGISTRATION_ID)
    }

    /// Wire name of the message type
    pub fn message_type(&self) -> &'static str {
        match self {
            Envelope::IdLookup(_) => "ID_LOOKUP",
            Envelope::Request(_) => "REQUEST",
            Envelope::Response(_) => "RESPONSE",
        }
    }
}

// ===== TESTS =====

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration_uses_reserved_id() {
        let env = Envelope::registration(vec![7u8; 32]);
        assert_eq!(env.id(), REGISTRATION_ID);
        assert!(env.is_registration());
        assert_eq!(env.message_type(), "ID_LOOKUP");
    }

    #[test]
    fn test_lookup_is_not_registration() {
        let env = Envelope::lookup(2, "QmPeer");
        assert!(!env.is_registration());
        match env {
            Envelope::IdLookup(IdLookup { remote: Some(Remote::PeerId(p)), .. }) => {
                assert_eq!(p, "QmPeer");
            }
            _ => panic!("Wrong message shape"),
        }
    }

    #[test]
    fn test_response_constructors() {
        let ok = Response::ok(4, vec![1, 2, 3], Some(vec![9]));
        assert_eq!(ok.error, None);
        assert_eq!(ok.data, vec![1, 2, 3]);

        let failed = Response::error(4, ErrorCode::Nack);
        assert_eq!(failed.error, Some(ErrorCode::Nack));
        assert!(failed.data.is_empty());
        assert!(failed.signature.is_none());
    }

    #[test]
    fn test_data_len() {
        let req = Envelope::Request(Request {
            id: 2,
            namespace: "ns".into(),
            data: vec![0u8; 100],
            signature: None,
            remote: Remote::PeerId("QmX".into()),
        });
        assert_eq!(req.data_len(), 100);
        assert_eq!(Envelope::lookup(2, "QmX").data_len(), 0);
    }
}
