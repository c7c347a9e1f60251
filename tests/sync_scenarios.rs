//! End-to-end scenario tests exercised against the public API only, one per
//! scenario in the specification's testable-properties section.

use std::sync::Arc;

use tokio::sync::mpsc;

use weavesync::policy::{AiSanitizationPolicy, CanonMark, PolicyManifest};
use weavesync::protocol::{
    CatchUpRequestPayload, DocUpdatePayload, Payload, PresencePayload, PresenceStatus,
};
use weavesync::storage::InMemory;
use weavesync::sync::server::{ServerConfig, SyncServer};
use weavesync::sync::SinkMessage;

fn manifest() -> PolicyManifest {
    PolicyManifest {
        policy_id: "weave:v1".to_string(),
        ai_sanitization_policy: AiSanitizationPolicy {
            allowed_marks: [CanonMark::Bold, CanonMark::Italic].into_iter().collect(),
            allowed_block_types: ["paragraph".to_string(), "heading".to_string()]
                .into_iter()
                .collect(),
        },
        max_update_size: 1_000_000,
        protocol_features: ["presence".to_string()].into_iter().collect(),
        presence_ttl_ms: 30_000,
    }
}

fn handshake_payload() -> weavesync::protocol::HandshakePayload {
    let client_manifest = manifest();
    weavesync::protocol::HandshakePayload {
        client_manifest_hash: client_manifest.compute_hash(),
        client_manifest: serde_json::to_value(client_manifest).unwrap(),
        capabilities: weavesync::protocol::ClientCapabilities {
            features: vec![],
            max_update_size: 1_000_000,
            supports_binary: false,
            supports_compression: false,
        },
        last_frontier_tag: None,
        token: None,
        user_meta: None,
    }
}

fn doc_update(parent: &str, frontier: &str, data: &[u8]) -> DocUpdatePayload {
    DocUpdatePayload {
        update_data: weavesync::encoding::encode(data),
        is_base64: true,
        frontier_tag: frontier.to_string(),
        parent_frontier_tag: parent.to_string(),
        size_bytes: data.len() as u64,
        origin: None,
    }
}

fn server() -> SyncServer {
    SyncServer::with_defaults(ServerConfig::default(), manifest(), Arc::new(InMemory::new())).unwrap()
}

/// S1 — handshake happy path: identical manifests, no prior frontier, the
/// room gains exactly one client and the ack reports no catch-up needed.
#[tokio::test]
async fn handshake_happy_path_admits_client_without_catch_up() {
    let server = server();
    let (tx, _rx) = mpsc::unbounded_channel();

    let outcome = server
        .handle_handshake("doc-1", "client-a", handshake_payload(), tx)
        .await
        .expect("identical manifests should negotiate successfully");

    assert!(!outcome.ack.needs_catch_up);
    assert_eq!(outcome.ack.server_frontier_tag, "");
    assert_eq!(server.room_count(), 1);
}

/// S2 — a declared manifest hash that doesn't match the manifest itself is
/// rejected before any room state is touched, and is counted under the
/// matching failure-reason label.
#[tokio::test]
async fn handshake_with_mismatched_hash_is_rejected_and_counted() {
    let server = server();
    let (tx, _rx) = mpsc::unbounded_channel();
    let mut payload = handshake_payload();
    payload.client_manifest_hash = "not-the-real-hash".to_string();

    let rejection = server
        .handle_handshake("doc-1", "client-a", payload, tx)
        .await
        .expect_err("hash mismatch must be rejected");

    assert!(matches!(
        rejection.code,
        weavesync::protocol::ErrorCode::ErrPolicyIncompatible
    ));
    assert_eq!(server.room_count(), 0, "a rejected handshake leaves no room behind");
    assert_eq!(
        server.metrics().counter_value(
            weavesync::observability::series::SYNC_HANDSHAKE_FAILURES_TOTAL,
            &weavesync::observability::metrics::label("reason", "client_manifest_hash_mismatch"),
        ),
        1
    );
}

/// S3 — once two clients share a room, an update from one is acked to the
/// sender and broadcast verbatim to the other, and the room's frontier
/// advances.
#[tokio::test]
async fn update_from_one_client_is_broadcast_verbatim_to_the_other() {
    let server = server();
    let (tx_a, mut rx_a) = mpsc::unbounded_channel();
    let (tx_b, mut rx_b) = mpsc::unbounded_channel();

    server
        .handle_handshake("doc-1", "client-a", handshake_payload(), tx_a)
        .await
        .unwrap();
    server
        .handle_handshake("doc-1", "client-b", handshake_payload(), tx_b)
        .await
        .unwrap();

    let update_bytes = b"abc";
    let ack = server
        .handle_doc_update(
            "doc-1",
            "client-a",
            7,
            doc_update("", "v1", update_bytes),
        )
        .await;

    assert!(ack.applied);
    assert_eq!(ack.acked_seq, 7);
    assert_eq!(ack.server_frontier_tag, "v1");

    let forwarded = rx_b
        .try_recv()
        .expect("client-b should receive the broadcast update");
    match forwarded {
        SinkMessage::Frame(envelope) => match envelope.payload {
            Payload::DocUpdate(payload) => {
                assert_eq!(
                    weavesync::encoding::decode(&payload.update_data).unwrap(),
                    update_bytes
                );
                assert_eq!(payload.frontier_tag, "v1");
            }
            other => panic!("expected doc_update broadcast, got {other:?}"),
        },
        SinkMessage::Close(code) => panic!("expected a frame, got a close({code})"),
    }
    assert!(
        rx_a.try_recv().is_err(),
        "the originating client does not receive its own update echoed back"
    );
}

/// S4 — a stale `parentFrontierTag` is rejected as a frontier conflict, and
/// the follow-up `catch_up_request` against the client's last known tag
/// returns an incremental response bringing it up to the current frontier.
#[tokio::test]
async fn stale_update_is_rejected_then_resolved_via_catch_up() {
    let server = server();
    let (tx, _rx) = mpsc::unbounded_channel();
    server
        .handle_handshake("doc-1", "client-a", handshake_payload(), tx)
        .await
        .unwrap();

    // Advance the room from "" to "v1" to "v2".
    server
        .handle_doc_update("doc-1", "client-a", 1, doc_update("", "v1", b"one"))
        .await;
    server
        .handle_doc_update("doc-1", "client-a", 2, doc_update("v1", "v2", b"two"))
        .await;

    // A stale client still believes the frontier is "v1".
    let ack = server
        .handle_doc_update("doc-1", "client-a", 3, doc_update("v1", "v3", b"three"))
        .await;
    assert!(!ack.applied);
    assert_eq!(ack.server_frontier_tag, "v2");
    assert_eq!(
        ack.rejection_reason.as_deref(),
        Some("Frontier conflict - please catch up")
    );

    let response = server
        .handle_catch_up_request(
            "doc-1",
            "client-a",
            CatchUpRequestPayload {
                from_frontier_tag: "v1".to_string(),
                prefer_snapshot: false,
            },
        )
        .await
        .expect("catch-up should find the updates made since v1");
    assert!(!response.is_snapshot);
    assert_eq!(response.frontier_tag, "v2");
}

/// S5 — many rapid presence updates from several clients coalesce into
/// exactly one broadcast per client once flushed, each carrying every
/// client's latest presence.
#[tokio::test]
async fn rapid_presence_updates_coalesce_into_one_broadcast() {
    let server = server();
    let (tx_a, mut rx_a) = mpsc::unbounded_channel();
    let (tx_b, mut rx_b) = mpsc::unbounded_channel();
    let (tx_c, mut rx_c) = mpsc::unbounded_channel();
    server
        .handle_handshake("doc-1", "client-a", handshake_payload(), tx_a)
        .await
        .unwrap();
    server
        .handle_handshake("doc-1", "client-b", handshake_payload(), tx_b)
        .await
        .unwrap();
    server
        .handle_handshake("doc-1", "client-c", handshake_payload(), tx_c)
        .await
        .unwrap();

    for (client_id, rx) in [("client-a", &mut rx_a), ("client-b", &mut rx_b), ("client-c", &mut rx_c)] {
        for i in 0..50 {
            server
                .handle_presence(
                    "doc-1",
                    client_id,
                    PresencePayload {
                        user_meta: serde_json::json!({"cursor": i}),
                        cursor: None,
                        selection: None,
                        status: PresenceStatus::Active,
                        last_activity: chrono::Utc::now().to_rfc3339(),
                    },
                )
                .await;
        }
        assert!(rx.try_recv().is_err(), "no broadcast before the batch is flushed");
    }

    server.flush_presence_broadcast("doc-1").await;

    for rx in [&mut rx_a, &mut rx_b, &mut rx_c] {
        let message = rx.try_recv().expect("exactly one presence_ack per client");
        match message {
            SinkMessage::Frame(envelope) => match envelope.payload {
                Payload::PresenceAck(ack) => assert_eq!(ack.presences.len(), 3),
                other => panic!("expected presence_ack, got {other:?}"),
            },
            SinkMessage::Close(code) => panic!("expected a frame, got a close({code})"),
        }
        assert!(rx.try_recv().is_err(), "only one broadcast, not one per presence update");
    }
}

/// P13 — a client idle past `idleTimeoutMs` is sent an `IDLE_TIMEOUT` error
/// and its transport is instructed to close with code 4000.
#[tokio::test]
async fn idle_client_is_notified_and_closed_with_4000() {
    let mut config = ServerConfig::default();
    config.idle_timeout_ms = 1;
    let server = SyncServer::with_defaults(config, manifest(), Arc::new(InMemory::new())).unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    server
        .handle_handshake("doc-1", "client-a", handshake_payload(), tx)
        .await
        .unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let timed_out = server.sweep_idle_clients().await;
    assert_eq!(timed_out, vec![("doc-1".to_string(), "client-a".to_string())]);
    server.evict_idle_client("doc-1", "client-a").await;

    let error_message = rx.try_recv().expect("idle client receives an error frame");
    match error_message {
        SinkMessage::Frame(envelope) => match envelope.payload {
            Payload::Error(err) => assert_eq!(err.code, weavesync::protocol::ErrorCode::IdleTimeout),
            other => panic!("expected error payload, got {other:?}"),
        },
        SinkMessage::Close(code) => panic!("expected the error frame before the close, got close({code})"),
    }
    let close_message = rx.try_recv().expect("idle client's transport is told to close");
    assert!(matches!(close_message, SinkMessage::Close(4000)));
    assert_eq!(server.room_count(), 0, "the now-empty room is dropped");
}

/// Server shutdown instructs every connected client's transport to close
/// with code 1001 before clearing room state.
#[tokio::test]
async fn shutdown_closes_every_connected_client_with_1001() {
    let server = server();
    let (tx, mut rx) = mpsc::unbounded_channel();
    server
        .handle_handshake("doc-1", "client-a", handshake_payload(), tx)
        .await
        .unwrap();

    server.shutdown().await;

    let message = rx.try_recv().expect("shutdown signals the connected client");
    assert!(matches!(message, SinkMessage::Close(1001)));
    assert_eq!(server.room_count(), 0);
}

/// S6 — a document recovered from a snapshot plus a contiguous update tail
/// ends at the tail's frontier tag, having replayed only the updates after
/// the snapshot.
#[tokio::test]
async fn recovery_replays_snapshot_then_tail_to_the_right_frontier() {
    let storage = InMemory::new();
    storage
        .save_snapshot(weavesync::storage::Snapshot {
            doc_id: "doc-1".to_string(),
            seq: 5,
            data: b"state-at-v5".to_vec(),
            frontier_tag: "v5".to_string(),
            created_at: chrono::Utc::now(),
            size_bytes: 11,
            checksum: weavesync::storage::checksum::fnv1a_hex(b"state-at-v5"),
        })
        .await
        .unwrap();
    for (seq, parent, tag) in [(6u64, "v5", "v6"), (7, "v6", "v7"), (8, "v7", "v8")] {
        storage
            .append_update(weavesync::storage::Update {
                doc_id: "doc-1".to_string(),
                seq,
                data: tag.as_bytes().to_vec(),
                frontier_tag: tag.to_string(),
                parent_frontier_tag: parent.to_string(),
                client_id: "client-a".to_string(),
                timestamp: chrono::Utc::now(),
                size_bytes: tag.len() as u64,
                origin: None,
            })
            .await
            .unwrap();
    }

    let result = weavesync::compaction::recover_doc(
        &storage,
        "doc-1",
        |_doc, _bytes| async { Ok(()) },
        |_doc, bytes| async move { Ok(String::from_utf8(bytes).unwrap()) },
    )
    .await;

    assert!(result.success);
    assert!(result.snapshot_used);
    assert_eq!(result.updates_applied, 3);
    assert_eq!(result.frontier_tag.as_deref(), Some("v8"));
}
