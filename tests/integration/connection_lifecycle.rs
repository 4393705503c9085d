// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::future_not_send,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc
)]

//! Connection lifecycle through a real relay: disconnects, reconnects,
//! cancellation cascades and shutdown.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{StreamExt, stream};
use switchyard_peer::client::{EnvelopeStream, RelayPeer};
use switchyard_peer::error::PeerError;
use switchyard_peer::responder;
use switchyard_proto::envelope::{ClientId, MessageEnvelope};
use switchyard_proto::route;
use switchyard_proto::session::{ExchangeItem, Incoming, ResponseStream, Routes};
use switchyard_relay::config::RelayConfig;
use switchyard_relay::server::{self, RelayState};
use tokio::sync::mpsc;

// =============================================================================
// Helpers
// =============================================================================

fn quiet_config() -> RelayConfig {
    RelayConfig {
        status_probe: false,
        ..RelayConfig::default()
    }
}

async fn start_relay(config: &RelayConfig) -> (String, Arc<RelayState>) {
    let state = Arc::new(RelayState::with_config(config));
    let (addr, _handle) = server::start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .unwrap();
    (format!("ws://{addr}/ws"), state)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

async fn connect_with(url: &str, state: &RelayState, id: &str, routes: Routes) -> RelayPeer {
    let peer = RelayPeer::connect(url, ClientId::new(id), routes).await.unwrap();
    let registry = Arc::clone(state.registry());
    let client = ClientId::new(id);
    wait_until(|| {
        registry
            .get(&client)
            .is_some_and(|handle| !handle.is_disposed())
    })
    .await;
    peer
}

async fn connect_echo(url: &str, state: &RelayState, id: &str) -> RelayPeer {
    connect_with(url, state, id, responder::routes(ClientId::new(id), Duration::from_secs(5))).await
}

fn conversation() -> (
    mpsc::UnboundedSender<MessageEnvelope>,
    impl futures_util::Stream<Item = MessageEnvelope> + Send + 'static,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let outbound = stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|e| (e, rx)) });
    (tx, outbound)
}

async fn next_reply(replies: &mut EnvelopeStream) -> MessageEnvelope {
    tokio::time::timeout(Duration::from_secs(2), replies.next())
        .await
        .expect("timed out waiting for a reply")
        .expect("reply stream ended")
        .expect("reply stream failed")
}

async fn assert_silent(replies: &mut EnvelopeStream, window: Duration) {
    if let Ok(item) = tokio::time::timeout(window, replies.next()).await {
        panic!("expected no reply, got {item:?}");
    }
}

/// Signals on drop.
struct DropSignal(mpsc::UnboundedSender<()>);

impl Drop for DropSignal {
    fn drop(&mut self) {
        let _ = self.0.send(());
    }
}

/// A `call` responder that never answers and reports when it is torn down.
fn silent_routes() -> (Routes, mpsc::UnboundedReceiver<()>) {
    let (dropped_tx, dropped_rx) = mpsc::unbounded_channel();
    let routes = Routes::new().route(route::CALL, move |_inbound: Incoming| -> ResponseStream {
        let signal = DropSignal(dropped_tx.clone());
        stream::pending::<ExchangeItem>()
            .map(move |item| {
                let _held = &signal;
                item
            })
            .boxed()
    });
    (routes, dropped_rx)
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn disconnected_peer_becomes_unreachable() {
    let (url, state) = start_relay(&quiet_config()).await;
    let alice = connect_echo(&url, &state, "alice").await;
    let bob = connect_echo(&url, &state, "bob").await;

    bob.close();
    let registry = Arc::clone(state.registry());
    wait_until(|| !registry.contains(&ClientId::new("bob"))).await;

    let (tx, outbound) = conversation();
    let mut replies = alice.group_call(outbound).unwrap();
    tx.send(MessageEnvelope::new("alice", "bob", "still there?")).unwrap();
    assert_silent(&mut replies, Duration::from_millis(300)).await;
    assert!(!alice.is_closed());
}

#[tokio::test]
async fn sender_disconnect_deregisters_it() {
    let (url, state) = start_relay(&quiet_config()).await;
    let alice = connect_echo(&url, &state, "alice").await;
    let bob = connect_echo(&url, &state, "bob").await;

    drop(alice);
    let registry = Arc::clone(state.registry());
    wait_until(|| !registry.contains(&ClientId::new("alice"))).await;

    // Replies to alice now have nowhere to go.
    let mut replies = bob
        .group_call(stream::iter([MessageEnvelope::new("bob", "alice", "hello?")]))
        .unwrap();
    let end = tokio::time::timeout(Duration::from_secs(2), replies.next())
        .await
        .unwrap();
    assert!(end.is_none());
}

#[tokio::test]
async fn reconnect_keeps_newest_connection() {
    let (url, state) = start_relay(&quiet_config()).await;
    let alice = connect_echo(&url, &state, "alice").await;
    let bob_old = connect_echo(&url, &state, "bob").await;
    let registry = Arc::clone(state.registry());
    let old_handle = registry.get(&ClientId::new("bob")).unwrap();

    let _bob_new = RelayPeer::connect(
        &url,
        ClientId::new("bob"),
        responder::routes(ClientId::new("bob"), Duration::from_secs(5)),
    )
    .await
    .unwrap();
    wait_until(|| {
        registry
            .get(&ClientId::new("bob"))
            .is_some_and(|handle| !handle.same_connection(&old_handle))
    })
    .await;

    // The superseded connection closing must not remove its replacement.
    bob_old.close();
    wait_until(|| old_handle.is_disposed()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(registry.contains(&ClientId::new("bob")));

    let (tx, outbound) = conversation();
    let mut replies = alice.group_call(outbound).unwrap();
    tx.send(MessageEnvelope::new("alice", "bob", "which bob?")).unwrap();
    assert_eq!(next_reply(&mut replies).await.sender, ClientId::new("bob"));
}

#[tokio::test]
async fn sender_disconnect_cancels_forwarded_exchange() {
    let (url, state) = start_relay(&quiet_config()).await;
    let alice = connect_echo(&url, &state, "alice").await;
    let (routes, mut torn_down) = silent_routes();
    let _bob = connect_with(&url, &state, "bob", routes).await;

    let (tx, outbound) = conversation();
    let _replies = alice.group_call(outbound).unwrap();
    tx.send(MessageEnvelope::new("alice", "bob", "hold on")).unwrap();

    // Give the relay time to open bob's exchange, then drop alice.
    tokio::time::sleep(Duration::from_millis(100)).await;
    alice.close();

    tokio::time::timeout(Duration::from_secs(2), torn_down.recv())
        .await
        .expect("bob's responder was not cancelled")
        .unwrap();
}

#[tokio::test]
async fn switching_cancels_previous_receiver() {
    let (url, state) = start_relay(&quiet_config()).await;
    let alice = connect_echo(&url, &state, "alice").await;
    let (routes, mut torn_down) = silent_routes();
    let _bob = connect_with(&url, &state, "bob", routes).await;
    let _carol = connect_echo(&url, &state, "carol").await;

    let (tx, outbound) = conversation();
    let mut replies = alice.group_call(outbound).unwrap();
    tx.send(MessageEnvelope::new("alice", "bob", "first")).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    tx.send(MessageEnvelope::new("alice", "carol", "second")).unwrap();

    assert_eq!(next_reply(&mut replies).await.sender, ClientId::new("carol"));
    tokio::time::timeout(Duration::from_secs(2), torn_down.recv())
        .await
        .expect("bob's responder was not cancelled")
        .unwrap();
}

#[tokio::test]
async fn receiver_disconnect_fails_only_its_exchange() {
    let (url, state) = start_relay(&quiet_config()).await;
    let alice = connect_echo(&url, &state, "alice").await;
    let (routes, _torn_down) = silent_routes();
    let bob = connect_with(&url, &state, "bob", routes).await;
    let _carol = connect_echo(&url, &state, "carol").await;

    let (tx, outbound) = conversation();
    let mut replies = alice.group_call(outbound).unwrap();
    tx.send(MessageEnvelope::new("alice", "bob", "first")).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    bob.close();
    let registry = Arc::clone(state.registry());
    wait_until(|| !registry.contains(&ClientId::new("bob"))).await;

    // Alice's channel is unaffected and can reach someone else.
    assert!(!alice.is_closed());
    tx.send(MessageEnvelope::new("alice", "carol", "second")).unwrap();
    assert_eq!(next_reply(&mut replies).await.sender, ClientId::new("carol"));
}

#[tokio::test]
async fn status_probe_does_not_disturb_routing() {
    let (url, state) = start_relay(&RelayConfig::default()).await;
    let alice = connect_with(
        &url,
        &state,
        "alice",
        responder::routes(ClientId::new("alice"), Duration::from_millis(20)),
    )
    .await;
    let _bob = connect_with(
        &url,
        &state,
        "bob",
        responder::routes(ClientId::new("bob"), Duration::from_millis(20)),
    )
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (tx, outbound) = conversation();
    let mut replies = alice.group_call(outbound).unwrap();
    tx.send(MessageEnvelope::new("alice", "bob", "hi")).unwrap();
    assert_eq!(next_reply(&mut replies).await.sender, ClientId::new("bob"));
}

#[tokio::test]
async fn shutdown_closes_every_peer() {
    let (url, state) = start_relay(&quiet_config()).await;
    let alice = connect_echo(&url, &state, "alice").await;
    let bob = connect_echo(&url, &state, "bob").await;

    assert_eq!(state.shutdown(), 2);

    for peer in [&alice, &bob] {
        tokio::time::timeout(Duration::from_secs(2), peer.closed())
            .await
            .expect("peer not closed after relay shutdown");
    }
    assert!(matches!(
        alice.group_call(stream::empty::<MessageEnvelope>()),
        Err(PeerError::ConnectionClosed)
    ));
    let registry = Arc::clone(state.registry());
    wait_until(|| registry.is_empty()).await;
}
