// Integration test: relay and peers over real TCP sockets
//
// The relay listens on a loopback port; each peer dials it, runs the
// authenticated handshake and registers. Requests then travel
// Alice → relay → Bob → relay → Alice over two sockets.

use rendezvous_core::relay::RelayServer;
use rendezvous_core::transport::{dial, Listener};
use rendezvous_core::{
    handler_fn, ErrorCode, Exchange, ExchangeConfig, HandlerReply, IdentityKeys, NackHandler,
    RpcError,
};
use std::sync::Arc;
use std::time::Duration;

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter("debug")
        .try_init()
        .ok();
}

async fn start_relay() -> (Arc<RelayServer>, String, IdentityKeys) {
    let relay_keys = IdentityKeys::generate();
    let listener = Listener::bind("127.0.0.1:0", Arc::new(relay_keys.clone()))
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let server = Arc::new(RelayServer::new());
    tokio::spawn(Arc::clone(&server).serve(listener));
    (server, addr, relay_keys)
}

async fn wait_for(mut check: impl FnMut() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_request_over_tcp() {
    init_tracing();
    let (relay, addr, relay_keys) = start_relay().await;

    let alice = Exchange::new(
        IdentityKeys::generate(),
        Arc::new(NackHandler),
        ExchangeConfig::default(),
    );
    let bob = Exchange::new(
        IdentityKeys::generate(),
        Arc::new(handler_fn(|namespace, _, payload| async move {
            let mut out = format!("{}:", namespace).into_bytes();
            out.extend(payload);
            Ok(HandlerReply::Result(out))
        })),
        ExchangeConfig::default(),
    );

    let session = alice.dial(&addr).await.unwrap();
    assert_eq!(session.relay(), &relay_keys.identity());
    bob.dial(&addr).await.unwrap();
    wait_for(|| relay.directory().len() == 2).await;

    let bob_id = bob.identity().peer_id().to_string();
    let reply = alice
        .request(bob_id.as_str(), "greet", b"hi".to_vec())
        .await
        .unwrap();
    assert_eq!(reply, b"greet:hi");

    let stats = relay.get_stats();
    assert_eq!(stats.sessions_active, 2);
    assert_eq!(stats.registrations, 2);
    assert_eq!(stats.requests_forwarded, 1);
    println!("✓ Request relayed over TCP");

    relay.stop();
}

#[tokio::test]
async fn test_lookup_over_tcp_after_peer_leaves() {
    init_tracing();
    let (relay, addr, _) = start_relay().await;

    let alice = Exchange::new(
        IdentityKeys::generate(),
        Arc::new(NackHandler),
        ExchangeConfig::default(),
    );
    let bob_keys = IdentityKeys::generate();
    let bob_identity = bob_keys.identity();

    alice.dial(&addr).await.unwrap();
    {
        let bob = Exchange::new(bob_keys, Arc::new(NackHandler), ExchangeConfig::default());
        bob.dial(&addr).await.unwrap();
        wait_for(|| relay.directory().contains(bob_identity.peer_id())).await;

        assert_eq!(
            alice.get_identity(bob_identity.peer_id()).await.unwrap(),
            bob_identity
        );
    }

    // Bob's exchange is gone; the relay purges him once the socket closes
    wait_for(|| !relay.directory().contains(bob_identity.peer_id())).await;
    assert!(matches!(
        alice.request(bob_identity, "echo", vec![]).await,
        Err(RpcError::Remote(ErrorCode::NotFound))
    ));

    relay.stop();
}

#[tokio::test]
async fn test_relay_stop_takes_sessions_offline() {
    init_tracing();
    let (relay, addr, _) = start_relay().await;

    let alice = Exchange::new(
        IdentityKeys::generate(),
        Arc::new(NackHandler),
        ExchangeConfig::default(),
    );
    let session = alice.dial(&addr).await.unwrap();
    wait_for(|| relay.directory().len() == 1).await;

    relay.stop();
    wait_for(|| !session.is_online()).await;

    assert_eq!(alice.session_count(), 0);
    assert!(matches!(
        alice.get_identity("QmAnyone").await,
        Err(RpcError::NoRendezvousPoints)
    ));
}

#[tokio::test]
async fn test_dial_to_non_relay_fails_handshake() {
    init_tracing();
    // A listener that accepts and immediately hangs up
    let socket = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        if let Ok((stream, _)) = socket.accept().await {
            drop(stream);
        }
    });

    let keys = IdentityKeys::generate();
    assert!(matches!(
        dial(&addr, &keys).await,
        Err(RpcError::Handshake(_)) | Err(RpcError::Io(_))
    ));
}
