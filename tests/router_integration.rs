//! Integration tests for the routing core: session bring-up over the
//! rendezvous, route hints, TTL-bounded flooding, candidate buffering,
//! and queue timeouts.

mod common;

use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::timeout;

use common::{wait_for_channel, wait_for_identity, wait_until, Net, ScriptedPeer};
use swarmcast::messages::kind;
use swarmcast::{ChannelState, Message};

// =============================================================================
// Session bring-up
// =============================================================================

/// request-peer through the rendezvous ends with an open channel on
/// both sides.
#[tokio::test]
async fn rendezvous_handshake_brings_up_channel() {
    let net = Net::new();
    let a = net.spawn_peer("a", vec![]);
    let b = net.spawn_peer("b", vec![]);
    wait_for_identity(&a, "a").await;
    wait_for_identity(&b, "b").await;

    a.request_peer("b").await.expect("request-peer failed");

    wait_for_channel(&a, "b").await;
    wait_for_channel(&b, "a").await;

    // Candidate arena and channel table never overlap.
    let snapshot = a.snapshot().await;
    assert!(snapshot.pending_candidates.is_empty());
    a.quit().await;
    b.quit().await;
}

/// `to = "-1"` solicits any peer; the rendezvous fans it out.
#[tokio::test]
async fn request_any_peer_connects_to_someone() {
    let net = Net::new();
    let a = net.spawn_peer("a", vec![]);
    let b = net.spawn_peer("b", vec![]);
    wait_for_identity(&a, "a").await;
    wait_for_identity(&b, "b").await;

    a.request_any_peer().await.expect("request-peer failed");

    wait_for_channel(&a, "b").await;
    wait_for_channel(&b, "a").await;
    a.quit().await;
    b.quit().await;
}

// =============================================================================
// Scenario: relay via route hint
// =============================================================================

/// A message for an unknown destination follows its route hint to the
/// neighbor at the head instead of being dropped or flooded.
#[tokio::test]
async fn route_hint_delivers_to_head_neighbor() {
    let net = Net::new();
    let a = net.spawn_peer("a", vec![]);
    let b = net.spawn_peer("b", vec![]);
    wait_for_identity(&a, "a").await;
    wait_for_identity(&b, "b").await;
    a.request_peer("b").await.unwrap();
    wait_for_channel(&a, "b").await;

    let mut message = Message::new("foo", "a", "c", 2, Value::Null);
    message.route = vec!["b".to_string()];
    a.send(message).await.expect("send failed");

    // The copy crossed to b (who parks it, having no route to c
    // either). "foo" is not a handshake kind, so flooding cannot have
    // delivered it; only the route hint can.
    let ok = wait_until(|| {
        let b = b.clone();
        async move {
            b.snapshot()
                .await
                .queued
                .iter()
                .any(|(k, to)| k == "foo" && to == "c")
        }
    })
    .await;
    assert!(ok, "route-hinted message never reached b");

    let a_snapshot = a.snapshot().await;
    assert!(
        !a_snapshot.queued.iter().any(|(k, _)| k == "foo"),
        "sender should not have parked the routed message"
    );
    a.quit().await;
    b.quit().await;
}

// =============================================================================
// Scenario: handshake buffering
// =============================================================================

/// Candidates arriving before their session are buffered, then applied
/// and drained when the offer creates the session.
#[tokio::test]
async fn early_candidates_buffer_until_offer() {
    let net = Net::new();
    let a = net.spawn_peer("a", vec![]);
    wait_for_identity(&a, "a").await;
    let mut z = ScriptedPeer::connect(&net, "z");

    let candidate = z.message(
        kind::ICE_CANDIDATE,
        "z",
        "a",
        3,
        json!({"candidate": "cand-1"}),
    );
    z.send_via_signal(&candidate).await;

    let ok = wait_until(|| {
        let a = a.clone();
        async move {
            a.snapshot()
                .await
                .pending_candidates
                .iter()
                .any(|(remote, count)| remote == "z" && *count == 1)
        }
    })
    .await;
    assert!(ok, "candidate was not buffered");

    let offer = z.message(kind::OFFER, "z", "a", 3, json!({"sdp": "offer:z"}));
    z.send_via_signal(&offer).await;

    // The offer produces an answer back to z...
    let (_, answer) = z.recv_kind(kind::ANSWER).await;
    assert_eq!(answer.from, "a");

    // ...the buffered candidate lands on the new session, and the
    // arena entry is gone.
    let snapshot = a.snapshot().await;
    assert!(snapshot.pending_candidates.is_empty());
    assert!(snapshot.connection("z").is_some());
    assert_eq!(
        net.hub
            .applied_candidates(&"a".to_string(), &"z".to_string()),
        vec!["cand-1"]
    );
    a.quit().await;
}

// =============================================================================
// Scenario: forward with TTL exhaustion
// =============================================================================

/// A relayed request-peer spends its last hop: one copy goes to the
/// one neighbor not already on the trail, stamped ttl 0.
#[tokio::test]
async fn flood_excludes_trail_and_exhausts_ttl() {
    let net = Net::new();
    let a = net.spawn_peer("a", vec![]);
    wait_for_identity(&a, "a").await;

    let mut y = ScriptedPeer::connect(&net, "y");
    let mut z = ScriptedPeer::connect(&net, "z");
    y.request_session("a").await;
    z.request_session("a").await;
    y.complete_session("a").await;
    z.complete_session("a").await;

    let mut request = y.message(kind::REQUEST_PEER, "x", "-1", 1, Value::Null);
    request.forward_by = vec!["y".to_string()];
    y.send_to("a", &request).await;

    let (_, relayed) = z.recv_kind(kind::REQUEST_PEER).await;
    assert_eq!(relayed.ttl, 0);
    assert_eq!(relayed.forward_by, vec!["y".to_string(), "a".to_string()]);
    assert_eq!(relayed.from, "x");

    // The flood never echoes back along the trail.
    assert!(
        !y.sees_kind_within(kind::REQUEST_PEER, Duration::from_millis(300))
            .await,
        "copy leaked back to a relay on the trail"
    );
    a.quit().await;
}

// =============================================================================
// Scenario: queue timeout
// =============================================================================

/// With no route and no rendezvous, a bounded send expires and fires
/// its notifier exactly once.
#[tokio::test]
async fn queue_timeout_fires_notifier() {
    let net = Net::new();
    let a = net.spawn_peer("a", vec![]);
    wait_for_identity(&a, "a").await;

    net.server.disconnect(&"a".to_string());

    let message = Message::new("foo", "a", "q", 2, Value::Null);
    let notify = a
        .send_with_timeout(message, Duration::from_millis(50))
        .await
        .expect("send failed");

    timeout(Duration::from_secs(2), notify)
        .await
        .expect("timeout notifier never fired")
        .expect("notifier dropped without firing");

    // The expired entry is gone from the queue.
    let ok = wait_until(|| {
        let a = a.clone();
        async move { !a.snapshot().await.queued.iter().any(|(k, _)| k == "foo") }
    })
    .await;
    assert!(ok, "expired message still queued");

    // Losing the rendezvous triggered a reconnect attempt.
    let ok = wait_until(|| {
        let net_server = net.server.clone();
        async move { net_server.connected_ids().contains(&"a".to_string()) }
    })
    .await;
    assert!(ok, "rendezvous channel was not replaced");
    a.quit().await;
}

// =============================================================================
// Maintenance
// =============================================================================

/// Idle channels are closed and purged by the maintenance sweep.
#[tokio::test]
async fn idle_channels_are_swept() {
    let net = Net::new();
    let mut config = common::fast_config();
    config.inactivity_timeout = Duration::from_millis(200);
    let a = {
        use std::sync::Arc;
        use swarmcast::peer::PeerBuilder;
        PeerBuilder::new(
            Arc::new(net.hub.factory()),
            Arc::new(net.server.connector("a")),
        )
        .with_config(config)
        .spawn()
    };
    wait_for_identity(&a, "a").await;

    let mut z = ScriptedPeer::connect(&net, "z");
    z.establish_with("a").await;
    assert!(a
        .snapshot()
        .await
        .connection("z")
        .is_some_and(|c| c.state == ChannelState::Open));

    // No traffic: the channel goes idle, gets closed, then purged.
    let ok = wait_until(|| {
        let a = a.clone();
        async move { a.snapshot().await.connection("z").is_none() }
    })
    .await;
    assert!(ok, "idle channel was never purged");
    a.quit().await;
}
