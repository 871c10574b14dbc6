//! Relay session: the relay's end of one client connection
//!
//! A session starts `Unregistered`. The client's first envelope, the
//! reserved `ID_LOOKUP` with id 0, moves it to `Registered` when the declared
//! identity matches the identity the transport authenticated. Directory
//! queries and request forwarding are refused before that.

use super::server::RelayContext;
use crate::error::RpcError;
use crate::identity::PeerIdentity;
use crate::protocol::{Envelope, ErrorCode, IdLookup, Remote, Request, Response, REGISTRATION_ID};
use crate::rpc::{CorrelationIds, PendingCalls};
use crate::transport::framing::{drain, spawn_writer, FrameReader};
use crate::transport::Connection;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Registration state of a relay session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    Unregistered,
    Registered(PeerIdentity),
}

struct RelayInner {
    generation: u64,
    transport_peer: PeerIdentity,
    registration: Mutex<Registration>,
    online: Arc<AtomicBool>,
    closed: AtomicBool,
    ids: CorrelationIds,
    pending: PendingCalls<(), Response>,
    outbound: mpsc::UnboundedSender<Envelope>,
    context: Arc<RelayContext>,
    tasks: Mutex<Vec<AbortHandle>>,
}

#[derive(Clone)]
pub struct RelaySession {
    inner: Arc<RelayInner>,
}

/// Non-owning handle kept by the directory
#[derive(Clone)]
pub struct WeakRelaySession {
    inner: Weak<RelayInner>,
}

impl WeakRelaySession {
    pub fn upgrade(&self) -> Option<RelaySession> {
        self.inner.upgrade().map(|inner| RelaySession { inner })
    }
}

impl RelaySession {
    pub(crate) fn spawn(conn: Connection, context: Arc<RelayContext>) -> Self {
        let Connection {
            peer,
            reader,
            writer,
        } = conn;
        let (outbound, queue) = mpsc::unbounded_channel();
        let online = Arc::new(AtomicBool::new(true));

        let inner = Arc::new(RelayInner {
            generation: NEXT_GENERATION.fetch_add(1, Ordering::Relaxed),
            transport_peer: peer.clone(),
            registration: Mutex::new(Registration::Unregistered),
            online: Arc::clone(&online),
            closed: AtomicBool::new(false),
            ids: CorrelationIds::odd(),
            pending: PendingCalls::new(),
            outbound,
            context,
            tasks: Mutex::new(Vec::new()),
        });
        inner.context.stats.write().sessions_active += 1;

        let writer = spawn_writer(writer, queue, online, peer.peer_id().to_string());
        let driver = {
            let inner = Arc::clone(&inner);
            tokio::spawn(async move {
                let label = inner.transport_peer.peer_id().to_string();
                drain(FrameReader::new(reader), &label, |envelope| {
                    inner.dispatch(envelope)
                })
                .await;
                inner.finish();
            })
        };
        inner
            .tasks
            .lock()
            .extend([writer.abort_handle(), driver.abort_handle()]);

        debug!(peer = %peer, generation = inner.generation, "relay session opened");
        Self { inner }
    }

    pub fn downgrade(&self) -> WeakRelaySession {
        WeakRelaySession {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Token distinguishing this session from earlier ones of the same peer
    pub fn generation(&self) -> u64 {
        self.inner.generation
    }

    /// Identity the transport attributed to this connection
    pub fn transport_peer(&self) -> &PeerIdentity {
        &self.inner.transport_peer
    }

    pub fn registration(&self) -> Registration {
        self.inner.registration.lock().clone()
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    /// Deliver a request from `caller` to this session's client and wait for
    /// its response.
    ///
    /// The payload and signature are passed through untouched.
    pub async fn request_forward(
        &self,
        caller: &PeerIdentity,
        namespace: String,
        data: Vec<u8>,
        signature: Option<Vec<u8>>,
    ) -> Result<Response, RpcError> {
        let inner = &self.inner;
        if !self.is_online() {
            return Err(RpcError::NotOnline);
        }
        let id = inner.ids.next();
        let call = inner.pending.register(id, ());
        // `finish` may have failed the table before this slot went in
        if inner.closed.load(Ordering::SeqCst) {
            return Err(RpcError::NotOnline);
        }
        let envelope = Envelope::Request(Request {
            id,
            namespace,
            data,
            signature,
            remote: Remote::Identity(caller.to_bytes()),
        });
        inner.send(envelope)?;
        call.wait(inner.context.config.call_timeout).await
    }

    /// Drop the connection and release its directory entry.
    pub fn close(&self) {
        self.inner.online.store(false, Ordering::SeqCst);
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        self.inner.finish();
    }
}

impl RelayInner {
    fn send(&self, envelope: Envelope) -> Result<(), RpcError> {
        self.outbound.send(envelope).map_err(|_| {
            self.online.store(false, Ordering::SeqCst);
            RpcError::NotOnline
        })
    }

    fn reply(&self, envelope: Envelope) {
        if self.send(envelope).is_err() {
            debug!(peer = %self.transport_peer, "connection gone before reply was sent");
        }
    }

    fn registered(&self) -> Option<PeerIdentity> {
        match &*self.registration.lock() {
            Registration::Registered(identity) => Some(identity.clone()),
            Registration::Unregistered => None,
        }
    }

    fn handle(self: &Arc<Self>) -> RelaySession {
        RelaySession {
            inner: Arc::clone(self),
        }
    }

    fn dispatch(self: &Arc<Self>, envelope: Envelope) {
        debug!(
            peer = %self.transport_peer,
            kind = envelope.message_type(),
            id = envelope.id(),
            "inbound envelope"
        );
        match envelope {
            Envelope::IdLookup(msg) if msg.id == REGISTRATION_ID => self.register(msg),
            Envelope::IdLookup(msg) => self.answer_lookup(msg),
            Envelope::Request(request) => self.forward(request),
            Envelope::Response(response) => match self.pending.claim(response.id) {
                Some((_, settler)) => settler.settle(Ok(response)),
                None => debug!(id = response.id, "dropping response for unknown forwarded call"),
            },
        }
    }

    fn register(self: &Arc<Self>, msg: IdLookup) {
        let declared = match msg.remote {
            Some(Remote::Identity(bytes)) => PeerIdentity::from_bytes(&bytes),
            _ => Err(RpcError::InvalidIdentity(
                "registration carries no identity".into(),
            )),
        };
        let identity = match declared {
            Ok(identity) => identity,
            Err(e) => {
                warn!(peer = %self.transport_peer, error = %e, "dropping registration");
                return;
            }
        };
        if identity.peer_id() != self.transport_peer.peer_id() {
            warn!(
                transport = %self.transport_peer,
                declared = %identity,
                "registration does not match connection identity, dropping"
            );
            return;
        }
        if !self.context.directory.register(identity.clone(), &self.handle()) {
            warn!(peer = %identity, "directory full, registration refused");
            return;
        }

        *self.registration.lock() = Registration::Registered(identity.clone());
        self.context.stats.write().registrations += 1;
        info!(peer = %identity, "peer registered");
    }

    fn answer_lookup(&self, msg: IdLookup) {
        if self.registered().is_none() {
            debug!(peer = %self.transport_peer, id = msg.id, "lookup before registration");
            self.reply(Envelope::lookup_failed(msg.id, ErrorCode::Nack));
            return;
        }
        self.context.stats.write().lookups += 1;

        let found = match &msg.remote {
            Some(Remote::PeerId(peer_id)) => self.context.directory.identity(peer_id),
            _ => None,
        };
        let answer = match found {
            Some(identity) => Envelope::lookup_found(msg.id, identity.to_bytes()),
            None => Envelope::lookup_failed(msg.id, ErrorCode::NotFound),
        };
        self.reply(answer);
    }

    fn forward(self: &Arc<Self>, request: Request) {
        let Some(caller) = self.registered() else {
            debug!(peer = %self.transport_peer, id = request.id, "request before registration");
            self.reply(Envelope::Response(Response::error(request.id, ErrorCode::Nack)));
            return;
        };

        let target = match &request.remote {
            Remote::PeerId(peer_id) => Some(peer_id.clone()),
            Remote::Identity(bytes) => PeerIdentity::from_bytes(bytes)
                .ok()
                .map(|identity| identity.peer_id().to_string()),
        };
        let destination = target
            .as_deref()
            .and_then(|peer_id| self.context.directory.session(peer_id));
        let Some(destination) = destination else {
            debug!(caller = %caller, target = ?target, "forwarding target not found");
            self.reply(Envelope::Response(Response::error(
                request.id,
                ErrorCode::NotFound,
            )));
            return;
        };

        // Suspended continuation: the reply on this connection waits on the
        // destination's response without blocking either pipeline.
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let Request {
                id,
                namespace,
                data,
                signature,
                ..
            } = request;
            let response = match destination
                .request_forward(&caller, namespace, data, signature)
                .await
            {
                Ok(response) => {
                    inner.context.stats.write().requests_forwarded += 1;
                    Response { id, ..response }
                }
                Err(e) => {
                    warn!(
                        caller = %caller,
                        target = %destination.transport_peer(),
                        error = %e,
                        "forwarding failed"
                    );
                    inner.context.stats.write().forward_failures += 1;
                    Response::error(id, ErrorCode::Other)
                }
            };
            inner.reply(Envelope::Response(response));
        });
    }

    /// Runs once, when the stream ends or the session is closed.
    fn finish(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.online.store(false, Ordering::SeqCst);
        let abandoned = self.pending.fail_all();
        if abandoned > 0 {
            debug!(peer = %self.transport_peer, calls = abandoned, "failed forwarded calls in flight");
        }
        {
            let mut stats = self.context.stats.write();
            stats.sessions_active = stats.sessions_active.saturating_sub(1);
        }
        if let Some(identity) = self.registered() {
            if self.context.config.purge_on_disconnect
                && self
                    .context
                    .directory
                    .purge(identity.peer_id(), self.generation)
            {
                debug!(peer = %identity, "directory entry purged");
            }
        }
        info!(peer = %self.transport_peer, "relay session closed");
    }
}

// ===== TESTS =====

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityKeys;
    use crate::protocol::decode_envelope;
    use crate::relay::server::{RelayServer, RelayServerConfig};
    use crate::transport::framing::FrameWriter;
    use crate::transport::{BoxedReader, BoxedWriter};
    use std::time::Duration;

    /// Hand-driven client end of a relay connection
    struct RawClient {
        keys: IdentityKeys,
        reader: FrameReader<BoxedReader>,
        writer: FrameWriter<BoxedWriter>,
    }

    impl RawClient {
        fn connect(server: &RelayServer) -> (Self, RelaySession) {
            Self::connect_as(server, IdentityKeys::generate(), None)
        }

        /// `transport` overrides the identity the relay is told about
        fn connect_as(
            server: &RelayServer,
            keys: IdentityKeys,
            transport: Option<PeerIdentity>,
        ) -> (Self, RelaySession) {
            let relay = IdentityKeys::generate().identity();
            let seen_as = transport.unwrap_or_else(|| keys.identity());
            let (client_side, relay_side) = Connection::pair(&seen_as, &relay);
            let session = server.accept(relay_side);
            let client = Self {
                keys,
                reader: FrameReader::new(client_side.reader),
                writer: FrameWriter::new(client_side.writer),
            };
            (client, session)
        }

        async fn send(&mut self, envelope: Envelope) {
            self.writer.write_envelope(&envelope).await.unwrap();
        }

        async fn recv(&mut self) -> Envelope {
            let frame = self.reader.read_frame().await.unwrap().unwrap();
            decode_envelope(&frame).unwrap()
        }

        async fn register(&mut self) {
            let bytes = self.keys.identity().to_bytes();
            self.send(Envelope::registration(bytes)).await;
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_registration_moves_to_registered() {
        let server = RelayServer::new();
        let (mut client, session) = RawClient::connect(&server);
        assert_eq!(session.registration(), Registration::Unregistered);

        client.register().await;
        wait_until(|| session.registration() != Registration::Unregistered).await;

        assert_eq!(
            session.registration(),
            Registration::Registered(client.keys.identity())
        );
        assert!(server.directory().contains(&client.keys.peer_id()));
        assert_eq!(server.get_stats().registrations, 1);
    }

    #[tokio::test]
    async fn test_spoofed_registration_is_dropped() {
        let server = RelayServer::new();
        let victim = IdentityKeys::generate();
        let attacker = IdentityKeys::generate();
        let (mut client, session) =
            RawClient::connect_as(&server, attacker, Some(IdentityKeys::generate().identity()));

        // Declares the victim's identity on a connection attributed to someone else
        client
            .send(Envelope::registration(victim.identity().to_bytes()))
            .await;
        client.register().await;
        // A lookup is answered only after both registrations were processed
        client.send(Envelope::lookup(2, victim.peer_id())).await;

        assert_eq!(
            client.recv().await,
            Envelope::lookup_failed(2, ErrorCode::Nack)
        );
        assert_eq!(session.registration(), Registration::Unregistered);
        assert!(server.directory().is_empty());
    }

    #[tokio::test]
    async fn test_lookup_found_and_not_found() {
        let server = RelayServer::new();
        let (mut alice, _a) = RawClient::connect(&server);
        let (mut bob, _b) = RawClient::connect(&server);
        alice.register().await;
        bob.register().await;
        wait_until(|| server.directory().len() == 2).await;

        alice.send(Envelope::lookup(2, bob.keys.peer_id())).await;
        assert_eq!(
            alice.recv().await,
            Envelope::lookup_found(2, bob.keys.identity().to_bytes())
        );

        alice.send(Envelope::lookup(4, "QmNobody")).await;
        assert_eq!(
            alice.recv().await,
            Envelope::lookup_failed(4, ErrorCode::NotFound)
        );
        assert_eq!(server.get_stats().lookups, 2);
    }

    #[tokio::test]
    async fn test_forward_rewrites_ids_and_keeps_payload() {
        let server = RelayServer::new();
        let (mut alice, _a) = RawClient::connect(&server);
        let (mut bob, _b) = RawClient::connect(&server);
        alice.register().await;
        bob.register().await;
        wait_until(|| server.directory().len() == 2).await;

        alice
            .send(Envelope::Request(Request {
                id: 42,
                namespace: "ns".into(),
                data: vec![1, 2, 3],
                signature: Some(vec![9; 64]),
                remote: Remote::PeerId(bob.keys.peer_id()),
            }))
            .await;

        let forwarded = match bob.recv().await {
            Envelope::Request(r) => r,
            other => panic!("Expected forwarded request, got {:?}", other),
        };
        assert_eq!(forwarded.id % 2, 1);
        assert_eq!(forwarded.namespace, "ns");
        assert_eq!(forwarded.data, vec![1, 2, 3]);
        assert_eq!(forwarded.signature, Some(vec![9; 64]));
        assert_eq!(
            forwarded.remote,
            Remote::Identity(alice.keys.identity().to_bytes())
        );

        bob.send(Envelope::Response(Response::ok(
            forwarded.id,
            vec![7],
            Some(vec![8]),
        )))
        .await;

        assert_eq!(
            alice.recv().await,
            Envelope::Response(Response::ok(42, vec![7], Some(vec![8])))
        );
        assert_eq!(server.get_stats().requests_forwarded, 1);
    }

    #[tokio::test]
    async fn test_forward_to_unknown_peer_is_not_found() {
        let server = RelayServer::new();
        let (mut alice, _a) = RawClient::connect(&server);
        alice.register().await;

        alice
            .send(Envelope::Request(Request {
                id: 2,
                namespace: "ns".into(),
                data: vec![],
                signature: None,
                remote: Remote::PeerId("QmNobody".into()),
            }))
            .await;

        assert_eq!(
            alice.recv().await,
            Envelope::Response(Response::error(2, ErrorCode::NotFound))
        );
    }

    #[tokio::test]
    async fn test_request_before_registration_is_nacked() {
        let server = RelayServer::new();
        let (mut alice, _a) = RawClient::connect(&server);

        alice
            .send(Envelope::Request(Request {
                id: 2,
                namespace: "ns".into(),
                data: vec![],
                signature: None,
                remote: Remote::PeerId("QmAnyone".into()),
            }))
            .await;

        assert_eq!(
            alice.recv().await,
            Envelope::Response(Response::error(2, ErrorCode::Nack))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_destination_reports_other() {
        let server = RelayServer::with_config(RelayServerConfig {
            call_timeout: Duration::from_secs(10),
            ..RelayServerConfig::default()
        });
        let (mut alice, _a) = RawClient::connect(&server);
        let (mut bob, _b) = RawClient::connect(&server);
        alice.register().await;
        bob.register().await;
        // Bob's registration is processed before Alice's request reaches the relay
        bob.send(Envelope::lookup(2, alice.keys.peer_id())).await;
        bob.recv().await;

        alice
            .send(Envelope::Request(Request {
                id: 2,
                namespace: "ns".into(),
                data: vec![],
                signature: None,
                remote: Remote::PeerId(bob.keys.peer_id()),
            }))
            .await;
        // Bob receives the forward and never answers
        bob.recv().await;

        assert_eq!(
            alice.recv().await,
            Envelope::Response(Response::error(2, ErrorCode::Other))
        );
        assert_eq!(server.get_stats().forward_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destination_hangup_reports_other_at_once() {
        let server = RelayServer::new();
        let (mut alice, _a) = RawClient::connect(&server);
        let (mut bob, bob_session) = RawClient::connect(&server);
        alice.register().await;
        bob.register().await;
        bob.send(Envelope::lookup(2, alice.keys.peer_id())).await;
        bob.recv().await;

        alice
            .send(Envelope::Request(Request {
                id: 2,
                namespace: "ns".into(),
                data: vec![],
                signature: None,
                remote: Remote::PeerId(bob.keys.peer_id()),
            }))
            .await;
        assert!(matches!(bob.recv().await, Envelope::Request(_)));

        let started = tokio::time::Instant::now();
        drop(bob);

        assert_eq!(
            alice.recv().await,
            Envelope::Response(Response::error(2, ErrorCode::Other))
        );
        assert!(started.elapsed() < server.config().call_timeout);
        assert!(!bob_session.is_online());
        assert_eq!(server.get_stats().forward_failures, 1);
    }

    #[tokio::test]
    async fn test_disconnect_purges_directory() {
        let server = RelayServer::new();
        let (mut alice, session) = RawClient::connect(&server);
        alice.register().await;
        wait_until(|| server.directory().len() == 1).await;

        drop(alice);
        wait_until(|| !session.is_online()).await;

        assert!(server.directory().is_empty());
        assert_eq!(server.get_stats().sessions_active, 0);
    }

    #[tokio::test]
    async fn test_disconnect_keeps_entry_without_purge() {
        let server = RelayServer::with_config(RelayServerConfig {
            purge_on_disconnect: false,
            ..RelayServerConfig::default()
        });
        let (mut alice, session) = RawClient::connect(&server);
        alice.register().await;
        wait_until(|| server.directory().len() == 1).await;

        let peer_id = alice.keys.peer_id();
        drop(alice);
        wait_until(|| !session.is_online()).await;

        assert!(server.directory().identity(&peer_id).is_some());
        assert!(server.directory().session(&peer_id).is_none());
    }
}
