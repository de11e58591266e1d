use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::Router;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use swapline_core::config::{ConnectionConfig, RetryPolicy};
use swapline_core::transport::mock::MockRtcFactory;
use swapline_core::transport::{
    ConnectionManager, IceCandidate, PeerId, Signaler, SignalingClient, SignalingEvent, TransportError,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// Forwards every text frame to the peer named in its `to` field.
#[derive(Clone, Default)]
struct Relay {
    peers: Arc<Mutex<HashMap<String, (u64, mpsc::UnboundedSender<String>)>>>,
    next_id: Arc<AtomicU64>,
}

impl Relay {
    fn online(&self) -> usize {
        self.peers.lock().len()
    }

    /// Drop the relay side of `peer`'s socket.
    fn kick(&self, peer: &str) {
        self.peers.lock().remove(peer);
    }

    async fn wait_for(&self, count: usize) {
        while self.online() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(relay): State<Relay>,
) -> impl IntoResponse {
    let peer = params.get("peer_id").cloned().unwrap_or_default();
    ws.on_upgrade(move |socket| handle_socket(socket, peer, relay))
}

async fn handle_socket(socket: WebSocket, peer: String, relay: Relay) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let id = relay.next_id.fetch_add(1, Ordering::SeqCst);
    relay.peers.lock().insert(peer.clone(), (id, tx));

    let send_task = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sender.send(WsMessage::Text(text)).await.is_err() {
                return;
            }
        }
        let _ = sender.send(WsMessage::Close(None)).await;
    });

    while let Some(Ok(message)) = receiver.next().await {
        let WsMessage::Text(text) = message else {
            continue;
        };
        let Some(to) = serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(|value| value["to"].as_str().map(str::to_string))
        else {
            continue;
        };
        if let Some((_, target)) = relay.peers.lock().get(&to) {
            let _ = target.send(text);
        }
    }

    let mut peers = relay.peers.lock();
    if peers.get(&peer).is_some_and(|(current, _)| *current == id) {
        peers.remove(&peer);
    }
    drop(peers);
    send_task.abort();
}

async fn spawn_relay() -> (SocketAddr, Relay) {
    let relay = Relay::default();
    let router = Router::new()
        .route("/signal", get(ws_handler))
        .with_state(relay.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("listener bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });
    (addr, relay)
}

fn retry() -> RetryPolicy {
    RetryPolicy::new(5, Duration::from_millis(20))
}

async fn expect_event(events: &mut mpsc::UnboundedReceiver<SignalingEvent>) -> SignalingEvent {
    events.recv().await.expect("signaling event stream ended")
}

#[test_timeout::tokio_timeout_test]
async fn offer_answer_and_candidates_cross_the_relay() {
    let (addr, relay) = spawn_relay().await;
    let url = format!("http://{addr}/signal");
    let alice = SignalingClient::connect(&url, PeerId::new("alice"), retry()).await.unwrap();
    let bob = SignalingClient::connect(&url, PeerId::new("bob"), retry()).await.unwrap();
    relay.wait_for(2).await;

    let mut alice_events = alice.events().unwrap();
    let mut bob_events = bob.events().unwrap();
    assert!(alice.events().is_none(), "event stream is handed out once");
    assert_eq!(expect_event(&mut alice_events).await, SignalingEvent::Connected);
    assert_eq!(expect_event(&mut bob_events).await, SignalingEvent::Connected);
    assert!(alice.is_connected());

    alice.send_offer(&PeerId::new("bob"), "v=0 alice-offer");
    assert_eq!(
        expect_event(&mut bob_events).await,
        SignalingEvent::OfferReceived {
            from: PeerId::new("alice"),
            sdp: "v=0 alice-offer".into(),
        }
    );

    bob.send_answer(&PeerId::new("alice"), "v=0 bob-answer");
    let candidate = IceCandidate::new("candidate:1 1 udp 1 127.0.0.1 9000 typ host", Some("0".into()), Some(0));
    bob.send_ice_candidate(&PeerId::new("alice"), &candidate);

    assert_eq!(
        expect_event(&mut alice_events).await,
        SignalingEvent::AnswerReceived {
            from: PeerId::new("bob"),
            sdp: "v=0 bob-answer".into(),
        }
    );
    assert_eq!(
        expect_event(&mut alice_events).await,
        SignalingEvent::IceCandidateReceived {
            from: PeerId::new("bob"),
            candidate,
        }
    );

    alice.close();
    bob.close();
    assert!(!alice.is_connected());
}

#[test_timeout::tokio_timeout_test]
async fn managers_negotiate_through_the_relay() {
    let (addr, relay) = spawn_relay().await;
    let url = format!("ws://{addr}/signal");

    let alice_factory = MockRtcFactory::new();
    let alice_signaling = SignalingClient::connect(&url, PeerId::new("alice"), retry()).await.unwrap();
    let alice = ConnectionManager::new(ConnectionConfig::default(), alice_signaling.clone(), alice_factory.clone());
    let _alice_router = alice.spawn_signaling_router(alice_signaling.events().unwrap());

    let bob_factory = MockRtcFactory::new();
    let bob_signaling = SignalingClient::connect(&url, PeerId::new("bob"), retry()).await.unwrap();
    let bob = ConnectionManager::new(ConnectionConfig::default(), bob_signaling.clone(), bob_factory.clone());
    let _bob_router = bob.spawn_signaling_router(bob_signaling.events().unwrap());
    relay.wait_for(2).await;

    alice.connect(&PeerId::new("bob")).await.unwrap();

    let answered = loop {
        let answered = alice_factory
            .session(&PeerId::new("bob"))
            .map(|session| session.log().remote)
            .unwrap_or_default();
        if !answered.is_empty() {
            break answered;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };

    assert_eq!(answered.len(), 1);
    assert!(answered[0].sdp.starts_with("v=0 mock-answer alice"));
    let bob_side = bob_factory.session(&PeerId::new("alice")).unwrap().log();
    assert!(bob_side.remote[0].sdp.starts_with("v=0 mock-offer bob"));
    assert_eq!(bob.peers(), vec![PeerId::new("alice")]);
}

#[test_timeout::tokio_timeout_test]
async fn dropped_relay_connection_is_redialled() {
    let (addr, relay) = spawn_relay().await;
    let url = format!("ws://{addr}/signal");
    let client = SignalingClient::connect(&url, PeerId::new("carol"), retry()).await.unwrap();
    let mut events = client.events().unwrap();
    assert_eq!(expect_event(&mut events).await, SignalingEvent::Connected);
    relay.wait_for(1).await;

    relay.kick("carol");

    assert!(matches!(expect_event(&mut events).await, SignalingEvent::Disconnected { .. }));
    assert_eq!(expect_event(&mut events).await, SignalingEvent::Connected);
    relay.wait_for(1).await;
    assert!(client.is_connected());
}

#[test_timeout::tokio_timeout_test]
async fn unreachable_relay_fails_fast() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let result = SignalingClient::connect(&format!("ws://{addr}/signal"), PeerId::new("dave"), retry()).await;
    assert!(matches!(result, Err(TransportError::Signaling(_))));

    let bad_scheme = SignalingClient::connect("ftp://relay.example", PeerId::new("dave"), retry()).await;
    assert!(matches!(bad_scheme, Err(TransportError::Signaling(_))));
}
