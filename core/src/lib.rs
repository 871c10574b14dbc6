// Rendezvous Exchange: request/response through relay peers
//
// Two peers that share no direct connection exchange signed, encrypted
// request/response envelopes through one or more rendezvous relays. The
// relay forwards opaque bytes; in secure mode it can neither read nor forge
// them.

pub mod crypto;
pub mod error;
pub mod exchange;
pub mod identity;
pub mod protocol;
pub mod relay;
pub mod rpc;
pub mod transport;

pub use error::RpcError;
pub use exchange::{Exchange, ExchangeConfig};
pub use identity::{IdentityKeys, IdentityManager, PeerIdentity, PeerRef};
pub use protocol::{Envelope, ErrorCode, PROTOCOL_TAG};
pub use relay::{RelayServer, RelayServerConfig};
pub use rpc::{handler_fn, ClientSession, HandlerReply, NackHandler, RequestHandler};
pub use transport::Connection;
