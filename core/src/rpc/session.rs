//! Client session: one connection from this peer to a rendezvous relay
//!
//! The session owns the connection's outbound queue and its pending call
//! table. A driver task reads envelopes in arrival order and settles calls;
//! inbound requests for the local application are answered from their own
//! tasks so a slow handler never stalls the connection.

use super::handler::{HandlerReply, RequestHandler};
use super::pending::{CorrelationIds, PendingCalls};
use crate::crypto;
use crate::error::RpcError;
use crate::identity::{IdentityKeys, PeerIdentity, PeerRef};
use crate::protocol::{
    Envelope, ErrorCode, IdLookup, Remote, Request, Response, CALL_TIMEOUT, MAX_DATA_SIZE,
};
use crate::transport::framing::{drain, spawn_writer, FrameReader};
use crate::transport::Connection;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

/// Per-session call settings
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Encrypt and sign payloads end to end
    pub secure: bool,
    /// Window after which an unanswered call settles with `Timeout`
    pub call_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            secure: true,
            call_timeout: CALL_TIMEOUT,
        }
    }
}

/// What a pending call expects back, kept to validate the reply
enum CallKind {
    Lookup { peer_id: String },
    Request { target: PeerRef },
}

impl CallKind {
    fn is_lookup(&self) -> bool {
        matches!(self, CallKind::Lookup { .. })
    }

    fn is_request(&self) -> bool {
        matches!(self, CallKind::Request { .. })
    }
}

enum Reply {
    Identity(PeerIdentity),
    Payload(Vec<u8>),
}

struct SessionInner {
    keys: Arc<IdentityKeys>,
    config: SessionConfig,
    relay: PeerIdentity,
    online: Arc<AtomicBool>,
    ids: CorrelationIds,
    pending: PendingCalls<CallKind, Reply>,
    outbound: mpsc::UnboundedSender<Envelope>,
    handler: Arc<dyn RequestHandler>,
    tasks: Mutex<Vec<AbortHandle>>,
}

/// Handle to a client session. Clones share the same connection.
#[derive(Clone)]
pub struct ClientSession {
    inner: Arc<SessionInner>,
}

impl ClientSession {
    /// Start driving `conn`. The self-registration envelope is queued before
    /// anything else.
    pub fn spawn(
        conn: Connection,
        keys: Arc<IdentityKeys>,
        handler: Arc<dyn RequestHandler>,
        config: SessionConfig,
    ) -> Self {
        let Connection {
            peer: relay,
            reader,
            writer,
        } = conn;
        let (outbound, queue) = mpsc::unbounded_channel();
        let online = Arc::new(AtomicBool::new(true));

        // The receiver is alive here, so this send cannot fail.
        let _ = outbound.send(Envelope::registration(keys.identity().to_bytes()));

        let inner = Arc::new(SessionInner {
            keys,
            config,
            relay: relay.clone(),
            online: Arc::clone(&online),
            ids: CorrelationIds::even(),
            pending: PendingCalls::new(),
            outbound,
            handler,
            tasks: Mutex::new(Vec::new()),
        });

        let writer = spawn_writer(writer, queue, online, relay.peer_id().to_string());
        let driver = {
            let inner = Arc::clone(&inner);
            tokio::spawn(async move {
                let label = inner.relay.peer_id().to_string();
                drain(FrameReader::new(reader), &label, |envelope| {
                    inner.dispatch(envelope)
                })
                .await;
                inner.online.store(false, Ordering::SeqCst);
                let abandoned = inner.pending.fail_all();
                info!(relay = %label, abandoned, "client session offline");
            })
        };
        inner
            .tasks
            .lock()
            .extend([writer.abort_handle(), driver.abort_handle()]);

        info!(relay = %relay, secure = inner.config.secure, "client session opened");
        Self { inner }
    }

    /// Identity of the relay at the other end
    pub fn relay(&self) -> &PeerIdentity {
        &self.inner.relay
    }

    /// False once the connection's stream has ended
    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    /// Calls waiting for a reply
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    /// Ask the relay for the public identity registered under `peer_id`.
    pub async fn lookup(&self, peer_id: &str) -> Result<PeerIdentity, RpcError> {
        self.ensure_online()?;
        let kind = CallKind::Lookup {
            peer_id: peer_id.to_string(),
        };
        match self.call(kind, |id| Envelope::lookup(id, peer_id)).await? {
            Reply::Identity(identity) => Ok(identity),
            Reply::Payload(_) => Err(RpcError::UnexpectedReply),
        }
    }

    /// Send `data` to `target` under `namespace` and wait for its answer.
    ///
    /// In secure mode `target` must carry a public key.
    pub async fn request(
        &self,
        target: &PeerRef,
        namespace: &str,
        data: Vec<u8>,
    ) -> Result<Vec<u8>, RpcError> {
        self.ensure_online()?;
        let (data, signature) = if self.inner.config.secure {
            let identity = target
                .identity()
                .ok_or_else(|| RpcError::MissingPublicKey(target.peer_id().to_string()))?;
            let (sealed, signature) = crypto::seal_and_sign(&self.inner.keys, identity, &data)?;
            (sealed, Some(signature))
        } else {
            (data, None)
        };
        if data.len() > MAX_DATA_SIZE {
            return Err(RpcError::PayloadTooLarge {
                size: data.len(),
                max: MAX_DATA_SIZE,
            });
        }

        let kind = CallKind::Request {
            target: target.clone(),
        };
        let remote = Remote::PeerId(target.peer_id().to_string());
        let reply = self
            .call(kind, |id| {
                Envelope::Request(Request {
                    id,
                    namespace: namespace.to_string(),
                    data,
                    signature,
                    remote,
                })
            })
            .await?;
        match reply {
            Reply::Payload(payload) => Ok(payload),
            Reply::Identity(_) => Err(RpcError::UnexpectedReply),
        }
    }

    /// Stop the session. Calls still pending settle with `NotOnline`.
    pub fn close(&self) {
        self.inner.online.store(false, Ordering::SeqCst);
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        self.inner.pending.fail_all();
        debug!(relay = %self.inner.relay, "client session closed");
    }

    fn ensure_online(&self) -> Result<(), RpcError> {
        if self.is_online() {
            Ok(())
        } else {
            Err(RpcError::NotOnline)
        }
    }

    async fn call(
        &self,
        kind: CallKind,
        build: impl FnOnce(u64) -> Envelope,
    ) -> Result<Reply, RpcError> {
        let inner = &self.inner;
        let id = inner.ids.next();
        let call = inner.pending.register(id, kind);
        // The driver fails the table once it stops; a slot added after that would only time out
        self.ensure_online()?;
        inner.send(build(id))?;
        call.wait(inner.config.call_timeout).await
    }
}

impl SessionInner {
    fn send(&self, envelope: Envelope) -> Result<(), RpcError> {
        self.outbound.send(envelope).map_err(|_| {
            self.online.store(false, Ordering::SeqCst);
            RpcError::NotOnline
        })
    }

    fn dispatch(self: &Arc<Self>, envelope: Envelope) {
        debug!(
            relay = %self.relay,
            kind = envelope.message_type(),
            id = envelope.id(),
            "inbound envelope"
        );
        match envelope {
            Envelope::IdLookup(reply) => self.on_lookup_reply(reply),
            Envelope::Response(response) => self.on_response(response),
            Envelope::Request(request) => {
                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    let response = inner.answer(request).await;
                    if inner.send(Envelope::Response(response)).is_err() {
                        debug!(relay = %inner.relay, "connection gone before response was sent");
                    }
                });
            }
        }
    }

    fn on_lookup_reply(&self, reply: IdLookup) {
        match self.pending.claim_matching(reply.id, CallKind::is_lookup) {
            Some((CallKind::Lookup { peer_id }, settler)) => {
                settler.settle(resolve_lookup(&peer_id, reply).map(Reply::Identity))
            }
            Some((_, settler)) => settler.settle(Err(RpcError::UnexpectedReply)),
            None => debug!(id = reply.id, "dropping lookup reply for unknown call"),
        }
    }

    fn on_response(&self, response: Response) {
        match self.pending.claim_matching(response.id, CallKind::is_request) {
            Some((CallKind::Request { target }, settler)) => {
                settler.settle(self.open_response(&target, response).map(Reply::Payload))
            }
            Some((_, settler)) => settler.settle(Err(RpcError::UnexpectedReply)),
            None => debug!(id = response.id, "dropping response for unknown call"),
        }
    }

    fn open_response(&self, target: &PeerRef, response: Response) -> Result<Vec<u8>, RpcError> {
        if let Some(code) = response.error {
            return Err(RpcError::Remote(code));
        }
        if !self.config.secure {
            return Ok(response.data);
        }
        let identity = target
            .identity()
            .ok_or_else(|| RpcError::MissingPublicKey(target.peer_id().to_string()))?;
        crypto::verify_and_open(
            &self.keys,
            identity,
            &response.data,
            response.signature.as_deref(),
        )
    }

    /// Build the response to a request addressed to the local application.
    async fn answer(&self, request: Request) -> Response {
        let id = request.id;
        let (caller, payload) = match self.accept_request(&request) {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(id, namespace = %request.namespace, error = %e, "refusing request");
                return Response::error(id, ErrorCode::Nack);
            }
        };

        let result = match self.handler.handle(&request.namespace, &caller, payload).await {
            Ok(HandlerReply::Result(result)) => result,
            Ok(HandlerReply::Nack) => {
                debug!(id, caller = %caller, namespace = %request.namespace, "handler declined");
                return Response::error(id, ErrorCode::Nack);
            }
            Err(e) => {
                warn!(id, caller = %caller, namespace = %request.namespace, error = %e, "handler failed");
                return Response::error(id, ErrorCode::Nack);
            }
        };

        if !self.config.secure {
            return Response::ok(id, result, None);
        }
        match crypto::seal_and_sign(&self.keys, &caller, &result) {
            Ok((sealed, signature)) if sealed.len() <= MAX_DATA_SIZE => {
                Response::ok(id, sealed, Some(signature))
            }
            Ok((sealed, _)) => {
                warn!(id, size = sealed.len(), "handler result too large");
                Response::error(id, ErrorCode::Other)
            }
            Err(e) => {
                warn!(id, error = %e, "failed to seal response");
                Response::error(id, ErrorCode::Other)
            }
        }
    }

    /// Identify the caller and recover the cleartext payload.
    fn accept_request(&self, request: &Request) -> Result<(PeerIdentity, Vec<u8>), RpcError> {
        let caller = match &request.remote {
            Remote::Identity(bytes) => PeerIdentity::from_bytes(bytes)?,
            Remote::PeerId(peer_id) => {
                return Err(RpcError::InvalidIdentity(format!(
                    "request names {} without an identity",
                    peer_id
                )))
            }
        };
        let payload = if self.config.secure {
            crypto::verify_and_open(
                &self.keys,
                &caller,
                &request.data,
                request.signature.as_deref(),
            )?
        } else {
            request.data.clone()
        };
        Ok((caller, payload))
    }
}

/// Validate a lookup answer against the peer-id that was asked for.
fn resolve_lookup(requested: &str, reply: IdLookup) -> Result<PeerIdentity, RpcError> {
    if let Some(code) = reply.error {
        return Err(RpcError::Remote(code));
    }
    match reply.remote {
        Some(Remote::Identity(bytes)) => {
            let identity = PeerIdentity::from_bytes(&bytes)?;
            if identity.peer_id() != requested {
                return Err(RpcError::IdMismatch {
                    requested: requested.to_string(),
                    returned: identity.peer_id().to_string(),
                });
            }
            Ok(identity)
        }
        _ => Err(RpcError::InvalidIdentity(
            "lookup answer carries no identity".into(),
        )),
    }
}

// ===== TESTS =====
