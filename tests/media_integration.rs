//! Integration tests for the media exchange layer: index discovery,
//! chunked part transfer with heavy admission, head-first playback
//! ordering, and end-of-stream.

mod common;

use std::time::Duration;

use common::{wait_for_channel, wait_for_identity, wait_until, Net};
use swarmcast::{
    Cluster, Extension, GossipExtension, MediaExtension, MemorySink, PartStatus, SegmentIndex,
    Weight, SOURCE,
};

fn small_index() -> SegmentIndex {
    SegmentIndex {
        total_size: 16,
        duration: 2.0,
        codec: "video/webm".into(),
        clusters: vec![
            Cluster {
                offset: 4,
                timecode: 0.0,
                // Deliberately wrong digest: verification logs and
                // keeps the part.
                sha256: Some("00".repeat(32)),
            },
            Cluster {
                offset: 10,
                timecode: 1.0,
                sha256: None,
            },
        ],
    }
}

fn media_peer(sink: &MemorySink) -> Vec<Box<dyn Extension>> {
    vec![
        Box::new(GossipExtension::default()),
        Box::new(MediaExtension::new(Box::new(sink.clone()))),
    ]
}

const HEAD: &[u8] = b"HEAD";
const PART0: &[u8] = b"AAAAAA";
const PART1: &[u8] = b"BBBBBB";

/// Seed a peer from the origin side: adopt the index, then feed head
/// and parts as an embedding harness would after range fetches.
async fn seed(peer: &swarmcast::PeerHandle) {
    peer.set_metadata(small_index()).await.expect("set_metadata");
    peer.append_head(HEAD.to_vec()).await.expect("append_head");

    let picks = peer.request_parts(2, 4).await;
    assert_eq!(
        picks,
        vec![(0, SOURCE.to_string()), (1, SOURCE.to_string())],
        "a lone peer downloads everything from the origin"
    );
    peer.append_part("0", PART0.to_vec()).await.expect("part 0");
    peer.append_part("1", PART1.to_vec()).await.expect("part 1");
}

// =============================================================================
// Full exchange: index discovery, heavy upgrade, chunked transfer
// =============================================================================

#[tokio::test]
async fn joiner_streams_the_file_from_a_seeder() {
    let net = Net::new();
    let sink_a = MemorySink::new();
    let sink_b = MemorySink::new();

    let a = net.spawn_peer("a", media_peer(&sink_a));
    wait_for_identity(&a, "a").await;
    seed(&a).await;

    let b = net.spawn_peer("b", media_peer(&sink_b));
    wait_for_identity(&b, "b").await;

    b.request_peer("a").await.expect("request-peer");
    wait_for_channel(&b, "a").await;

    // On connect the seeder advertises its parts and answers the
    // joiner's index request.
    let ok = wait_until(|| {
        let b = b.clone();
        async move {
            let snapshot = b.snapshot().await;
            snapshot.parts.len() == 2
                && snapshot
                    .availability
                    .iter()
                    .any(|(remote, parts)| remote == "a" && parts == &vec![0, 1])
        }
    })
    .await;
    assert!(ok, "joiner never learned index and availability");

    b.append_head(HEAD.to_vec()).await.expect("append_head");

    // chunk_size 4 forces the chunked "p:c:n" form for 6-byte parts.
    let picks = b.request_parts(2, 4).await;
    assert_eq!(picks, vec![(0, "a".to_string()), (1, "a".to_string())]);

    // Bulk transfer is gated on heavy admission; the seeder upgrades,
    // the parked parts flush on the next tick, and playback finishes.
    let ok = wait_until(|| {
        let sink_b = sink_b.clone();
        async move { sink_b.ended() }
    })
    .await;
    assert!(ok, "joiner never reached end of stream");

    let appended = sink_b.appended();
    assert_eq!(&appended[0][..], HEAD, "head must hit playback first");
    assert_eq!(appended.len(), 3);
    let mut bodies: Vec<&[u8]> = appended[1..].iter().map(|b| &b[..]).collect();
    bodies.sort();
    assert_eq!(bodies, vec![PART0, PART1]);

    let b_snapshot = b.snapshot().await;
    assert!(b_snapshot.parts.iter().all(|s| *s == PartStatus::Added));
    assert_eq!(
        b_snapshot.connection("a").expect("channel to a").weight.incoming,
        Weight::Heavy,
        "joiner admitted the seeder's bulk traffic"
    );
    let a_snapshot = a.snapshot().await;
    assert_eq!(
        a_snapshot.connection("b").expect("channel to b").weight.outgoing,
        Weight::Heavy,
        "seeder recorded the admission"
    );

    a.quit().await;
    b.quit().await;
}

// =============================================================================
// Advertisement flows back
// =============================================================================

/// Once the joiner holds parts it advertises them, so the seeder's
/// availability map fills in.
#[tokio::test]
async fn completed_parts_are_advertised_back() {
    let net = Net::new();
    let sink_a = MemorySink::new();
    let sink_b = MemorySink::new();

    let a = net.spawn_peer("a", media_peer(&sink_a));
    wait_for_identity(&a, "a").await;
    seed(&a).await;

    let b = net.spawn_peer("b", media_peer(&sink_b));
    wait_for_identity(&b, "b").await;
    b.request_peer("a").await.expect("request-peer");
    wait_for_channel(&b, "a").await;

    let ok = wait_until(|| {
        let b = b.clone();
        async move {
            let snapshot = b.snapshot().await;
            snapshot.parts.len() == 2 && !snapshot.availability.is_empty()
        }
    })
    .await;
    assert!(ok);

    b.request_parts(2, 1024).await;

    let ok = wait_until(|| {
        let a = a.clone();
        async move {
            a.snapshot()
                .await
                .availability
                .iter()
                .any(|(remote, parts)| remote == "b" && parts == &vec![0, 1])
        }
    })
    .await;
    assert!(ok, "seeder never learned what the joiner holds");

    a.quit().await;
    b.quit().await;
}

// =============================================================================
// Origin fallback bookkeeping
// =============================================================================

/// Picks fall back to the origin sentinel when nobody advertises, and
/// a pick marks the part pending so it cannot be double-requested.
#[tokio::test]
async fn origin_fallback_marks_parts_pending() {
    let net = Net::new();
    let sink = MemorySink::new();
    let a = net.spawn_peer("a", media_peer(&sink));
    wait_for_identity(&a, "a").await;

    a.set_metadata(small_index()).await.unwrap();
    let picks = a.request_parts(1, 1024).await;
    assert_eq!(picks, vec![(0, SOURCE.to_string())]);

    let snapshot = a.snapshot().await;
    assert_eq!(snapshot.parts[0], PartStatus::Pending);
    assert_eq!(snapshot.parts[1], PartStatus::Needed);

    // The next pick skips the pending part.
    let picks = a.request_parts(2, 1024).await;
    assert_eq!(picks, vec![(1, SOURCE.to_string())]);

    // Double delivery of the same part is rejected.
    a.append_part("0", PART0.to_vec()).await.unwrap();
    assert!(a.append_part("0", PART0.to_vec()).await.is_err());

    a.quit().await;
}

// =============================================================================
// Heavy traffic stays parked without admission
// =============================================================================

/// When the receiver has no admission capacity, bulk parts wait in the
/// sender's queue instead of crossing the channel.
#[tokio::test]
async fn bulk_parts_wait_for_admission() {
    let net = Net::new();
    let sink_a = MemorySink::new();
    let sink_b = MemorySink::new();

    let a = net.spawn_peer("a", media_peer(&sink_a));
    wait_for_identity(&a, "a").await;
    seed(&a).await;

    // No gossip on b: its admission cap stays zero and every
    // request-heavy gets noack'd.
    let b = net.spawn_peer(
        "b",
        vec![Box::new(MediaExtension::new(Box::new(sink_b.clone())))],
    );
    wait_for_identity(&b, "b").await;
    b.request_peer("a").await.expect("request-peer");
    wait_for_channel(&b, "a").await;

    let ok = wait_until(|| {
        let b = b.clone();
        async move {
            let snapshot = b.snapshot().await;
            snapshot.parts.len() == 2 && !snapshot.availability.is_empty()
        }
    })
    .await;
    assert!(ok);

    b.request_parts(1, 1024).await;

    // The part reply parks on the seeder, behind the admission gate.
    let ok = wait_until(|| {
        let a = a.clone();
        async move {
            a.snapshot()
                .await
                .queued
                .iter()
                .any(|(k, to)| k == "media:part" && to == "b")
        }
    })
    .await;
    assert!(ok, "bulk part should be parked awaiting admission");

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(
        sink_b.appended().is_empty(),
        "bulk bytes crossed without admission"
    );

    a.quit().await;
    b.quit().await;
}
