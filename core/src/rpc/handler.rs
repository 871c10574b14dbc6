//! Application request handler seam

use crate::identity::PeerIdentity;
use async_trait::async_trait;
use std::future::Future;

/// What the application answers to an inbound request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerReply {
    /// Success payload, sent back to the caller
    Result(Vec<u8>),
    /// Negative acknowledgement: the request is declined
    Nack,
}

/// Handles requests addressed to the local peer.
///
/// An `Err` is reported to the caller as `NACK`.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        namespace: &str,
        caller: &PeerIdentity,
        payload: Vec<u8>,
    ) -> anyhow::Result<HandlerReply>;
}

/// Declines every request
#[derive(Debug, Clone, Copy, Default)]
pub struct NackHandler;

#[async_trait]
impl RequestHandler for NackHandler {
    async fn handle(
        &self,
        _namespace: &str,
        _caller: &PeerIdentity,
        _payload: Vec<u8>,
    ) -> anyhow::Result<HandlerReply> {
        Ok(HandlerReply::Nack)
    }
}

/// Adapter turning an async closure into a [`RequestHandler`]
pub struct FnHandler<F> {
    f: F,
}

/// Wrap `f(namespace, caller, payload)` as a request handler
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(String, PeerIdentity, Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<HandlerReply>> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> RequestHandler for FnHandler<F>
where
    F: Fn(String, PeerIdentity, Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<HandlerReply>> + Send + 'static,
{
    async fn handle(
        &self,
        namespace: &str,
        caller: &PeerIdentity,
        payload: Vec<u8>,
    ) -> anyhow::Result<HandlerReply> {
        (self.f)(namespace.to_string(), caller.clone(), payload).await
    }
}

// ===== TESTS =====

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityKeys;

    #[tokio::test]
    async fn test_nack_handler_declines() {
        let caller = IdentityKeys::generate().identity();
        let reply = NackHandler.handle("ns", &caller, vec![1]).await.unwrap();
        assert_eq!(reply, HandlerReply::Nack);
    }

    #[tokio::test]
    async fn test_handler_fn_sees_arguments() {
        let caller = IdentityKeys::generate().identity();
        let expected = caller.peer_id().to_string();

        let handler = handler_fn(move |ns, from: PeerIdentity, payload| {
            let expected = expected.clone();
            async move {
                assert_eq!(from.peer_id(), expected);
                let mut out = ns.into_bytes();
                out.extend(payload);
                Ok(HandlerReply::Result(out))
            }
        });

        let reply = handler.handle("echo:", &caller, b"hi".to_vec()).await.unwrap();
        assert_eq!(reply, HandlerReply::Result(b"echo:hi".to_vec()));
    }
}
