// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::future_not_send,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc
)]

//! End-to-end routing through a real relay over WebSocket.
//!
//! Each test starts an in-process relay on an OS-assigned port and connects
//! peers with [`RelayPeer`]. Receivers run the reference responder unless a
//! test needs a different behaviour.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{StreamExt, stream};
use switchyard_peer::client::{EnvelopeStream, RelayPeer};
use switchyard_peer::responder;
use switchyard_proto::envelope::{ClientId, MessageEnvelope};
use switchyard_proto::route;
use switchyard_proto::session::{ChannelHandler, ExchangeItem, Incoming, ResponseStream, Routes};
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

/// Connects `id` with `routes` and waits until the relay has registered it.
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

/// An outbound envelope stream the test can keep feeding.
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

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn group_call_round_trip() {
    let (url, state) = start_relay(&quiet_config()).await;
    let alice = connect_echo(&url, &state, "alice").await;
    let _bob = connect_echo(&url, &state, "bob").await;

    let (tx, outbound) = conversation();
    let mut replies = alice.group_call(outbound).unwrap();
    tx.send(MessageEnvelope::new("alice", "bob", "hi bob")).unwrap();

    let reply = next_reply(&mut replies).await;
    assert_eq!(reply, MessageEnvelope::new("bob", "alice", "Hello from bob"));
}

#[tokio::test]
async fn personal_call_round_trip() {
    let (url, state) = start_relay(&quiet_config()).await;
    let alice = connect_echo(&url, &state, "alice").await;
    let _bob = connect_echo(&url, &state, "bob").await;

    let mut replies = alice
        .personal_call(stream::iter([MessageEnvelope::new("alice", "bob", "hi")]))
        .unwrap();

    let reply = next_reply(&mut replies).await;
    assert_eq!(reply.sender, ClientId::new("bob"));
    assert_eq!(reply.receiver, ClientId::new("alice"));

    // Request side and forwarded exchange both completed: the channel ends.
    let end = tokio::time::timeout(Duration::from_secs(2), replies.next())
        .await
        .unwrap();
    assert!(end.is_none());
}

#[tokio::test]
async fn unknown_receiver_is_silent_and_channel_stays_usable() {
    let (url, state) = start_relay(&quiet_config()).await;
    let alice = connect_echo(&url, &state, "alice").await;
    let _bob = connect_echo(&url, &state, "bob").await;

    let (tx, outbound) = conversation();
    let mut replies = alice.group_call(outbound).unwrap();

    tx.send(MessageEnvelope::new("alice", "zed", "anyone?")).unwrap();
    assert_silent(&mut replies, Duration::from_millis(300)).await;
    assert!(!alice.is_closed());
    assert!(state.registry().contains(&ClientId::new("alice")));

    tx.send(MessageEnvelope::new("alice", "bob", "hi bob")).unwrap();
    assert_eq!(next_reply(&mut replies).await.sender, ClientId::new("bob"));
}

#[tokio::test]
async fn later_envelopes_switch_receiver() {
    let (url, state) = start_relay(&quiet_config()).await;
    let alice = connect_echo(&url, &state, "alice").await;
    let _bob = connect_echo(&url, &state, "bob").await;
    let _carol = connect_echo(&url, &state, "carol").await;

    let (tx, outbound) = conversation();
    let mut replies = alice.group_call(outbound).unwrap();

    tx.send(MessageEnvelope::new("alice", "bob", "first")).unwrap();
    assert_eq!(next_reply(&mut replies).await.sender, ClientId::new("bob"));

    tx.send(MessageEnvelope::new("alice", "carol", "second")).unwrap();
    assert_eq!(next_reply(&mut replies).await.sender, ClientId::new("carol"));
}

#[tokio::test]
async fn newest_receiver_wins() {
    let (url, state) = start_relay(&quiet_config()).await;
    let alice = connect_echo(&url, &state, "alice").await;

    // Bob answers only after a delay, long after the switch to carol.
    let slow = Routes::new().route(route::CALL, |inbound: Incoming| -> ResponseStream {
        let echo = responder::routes(ClientId::new("bob"), Duration::from_secs(5));
        let handler = echo.get(route::CALL).unwrap();
        handler
            .handle(inbound)
            .then(|item: ExchangeItem| async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                item
            })
            .boxed()
    });
    let _bob = connect_with(&url, &state, "bob", slow).await;
    let _carol = connect_echo(&url, &state, "carol").await;

    let (tx, outbound) = conversation();
    let mut replies = alice.group_call(outbound).unwrap();
    tx.send(MessageEnvelope::new("alice", "bob", "first")).unwrap();
    tx.send(MessageEnvelope::new("alice", "carol", "second")).unwrap();

    assert_eq!(next_reply(&mut replies).await.sender, ClientId::new("carol"));
    assert_silent(&mut replies, Duration::from_millis(600)).await;
}

#[tokio::test]
async fn sender_field_is_forwarded_verbatim_by_default() {
    let (url, state) = start_relay(&quiet_config()).await;
    let alice = connect_echo(&url, &state, "alice").await;
    let _bob = connect_echo(&url, &state, "bob").await;

    let (tx, outbound) = conversation();
    let mut replies = alice.group_call(outbound).unwrap();
    tx.send(MessageEnvelope::new("mallory", "bob", "hi")).unwrap();

    // Bob answers the claimed sender; alice's channel still carries it.
    assert_eq!(next_reply(&mut replies).await.receiver, ClientId::new("mallory"));
}

#[tokio::test]
async fn enforced_sender_is_overwritten() {
    let config = RelayConfig {
        enforce_sender: true,
        ..quiet_config()
    };
    let (url, state) = start_relay(&config).await;
    let alice = connect_echo(&url, &state, "alice").await;
    let _bob = connect_echo(&url, &state, "bob").await;

    let (tx, outbound) = conversation();
    let mut replies = alice.group_call(outbound).unwrap();
    tx.send(MessageEnvelope::new("mallory", "bob", "hi")).unwrap();

    assert_eq!(next_reply(&mut replies).await.receiver, ClientId::new("alice"));
}

#[tokio::test]
async fn concurrent_senders_reach_the_same_receiver() {
    let (url, state) = start_relay(&quiet_config()).await;
    let _bob = connect_echo(&url, &state, "bob").await;
    let mut senders = Vec::new();
    for n in 0..8 {
        senders.push(connect_echo(&url, &state, &format!("peer-{n}")).await);
    }

    let mut tasks = Vec::new();
    for (n, peer) in senders.iter().enumerate() {
        let me = format!("peer-{n}");
        let mut replies = peer
            .group_call(stream::iter([MessageEnvelope::new(me.as_str(), "bob", "hi")]))
            .unwrap();
        tasks.push(tokio::spawn(async move {
            let reply = next_reply(&mut replies).await;
            assert_eq!(reply.receiver, ClientId::new(me));
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
}
