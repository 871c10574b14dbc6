//! Client-side call machinery: pending calls, sessions, request handlers

pub mod handler;
pub mod pending;
pub mod session;

pub use handler::{handler_fn, FnHandler, HandlerReply, NackHandler, RequestHandler};
pub use pending::{CorrelationIds, PendingCalls, Settlement, Settler};
pub use session::{ClientSession, SessionConfig};
