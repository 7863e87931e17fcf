//! End-to-end tests driving the full engine over loopback transports.

use libp2p::PeerId;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::auditor::{self, AuditOutcome};
use super::reconcile;
use super::relay::{self, InvKind};
use super::session::SessionHandle;
use super::PeerSync;
use crate::config::NodeConfig;
use crate::mempool::MemPool;
use crate::network::rpc::methods::Ping;
use crate::network::rpc::{RequestPayload, RpcError, RpcStatus};
use crate::network::rpc::methods::SyncDagRequest;
use crate::peers::SessionState;
use crate::testing::mocks::{random_peer_id, MemChain, MockMemPool, TestNet};
use crate::types::GraphState;

fn test_config() -> NodeConfig {
    let mut config = NodeConfig::default();
    config.sync.retry_delay = Duration::from_millis(50);
    config.sync.stall_interval = Duration::from_secs(30);
    config.sync.update_debounce = Duration::from_millis(10);
    config.relay.block_interval = Duration::from_secs(60);
    config.audit.enabled = false;
    config
}

fn build_node(
    net: &Arc<TestNet>,
    chain: Arc<MemChain>,
    config: NodeConfig,
) -> (Arc<PeerSync>, Arc<MockMemPool>, PeerId) {
    let id = random_peer_id();
    let transport = net.transport(id);
    let mempool = MockMemPool::new();
    let sync = PeerSync::new(config, chain, mempool.clone(), transport);
    sync.start();
    (sync, mempool, id)
}

async fn eventually<F, Fut>(mut check: F, timeout: Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

async fn wait_connected(sync: &Arc<PeerSync>, peer: PeerId) -> bool {
    eventually(
        || async {
            match sync.peers().get(&peer).await {
                Some(record) => record.state().await == SessionState::Connected,
                None => false,
            }
        },
        Duration::from_secs(5),
    )
    .await
}

#[tokio::test]
async fn fresh_equal_nodes_handshake_and_are_current() {
    let net = TestNet::new();
    let (a, _, a_id) = build_node(&net, MemChain::new(), test_config());
    let (b, _, b_id) = build_node(&net, MemChain::new(), test_config());

    assert_eq!(a.chain().best_snapshot().await.total, 1);
    net.connect(a_id, b_id);

    assert!(wait_connected(&a, b_id).await, "a never connected to b");
    assert!(wait_connected(&b, a_id).await, "b never connected to a");

    assert!(a.is_current().await);
    assert!(b.is_current().await);
    assert_eq!(a.sync_peer().await, None);

    let snapshots = a.peers().snapshots().await;
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].state, "connected");
}

#[tokio::test]
async fn behind_node_selects_peer_and_catches_up() {
    let net = TestNet::new();
    let (a, _, a_id) = build_node(&net, MemChain::with_blocks(99), test_config());
    let (b, _, b_id) = build_node(&net, MemChain::with_blocks(9), test_config());

    assert_eq!(a.chain().best_snapshot().await.total, 100);
    assert_eq!(b.chain().best_snapshot().await.total, 10);

    net.connect(b_id, a_id);
    assert!(wait_connected(&b, a_id).await, "handshake failed");

    let caught_up = eventually(
        || async { b.chain().best_snapshot().await.total == 100 },
        Duration::from_secs(10),
    )
    .await;
    assert!(caught_up, "b never caught up to a");

    assert_eq!(
        b.chain().best_snapshot().await,
        a.chain().best_snapshot().await
    );
    assert!(
        eventually(|| async { b.is_current().await }, Duration::from_secs(5)).await,
        "b never became current"
    );
}

#[tokio::test]
async fn foreign_genesis_is_rejected_without_reputation_penalty() {
    let net = TestNet::new();
    let (a, _, a_id) = build_node(&net, MemChain::new(), test_config());
    let (b, _, b_id) = build_node(
        &net,
        MemChain::with_genesis(b"other-network".to_vec()),
        test_config(),
    );

    net.connect(b_id, a_id);

    // Both sides settle back to Disconnected.
    let severed = eventually(
        || async {
            let a_side = match a.peers().get(&b_id).await {
                Some(record) => record.state().await == SessionState::Disconnected,
                None => false,
            };
            let b_side = match b.peers().get(&a_id).await {
                Some(record) => record.state().await == SessionState::Disconnected,
                None => false,
            };
            a_side && b_side
        },
        Duration::from_secs(5),
    )
    .await;
    assert!(severed, "mismatched peers never severed");

    // Consensus-class rejection is not misbehavior.
    let a_record = a.peers().get(&b_id).await.unwrap();
    assert_eq!(a_record.bad_response_count().await, 0);
    let b_record = b.peers().get(&a_id).await.unwrap();
    assert_eq!(b_record.bad_response_count().await, 0);
}

#[tokio::test]
async fn empty_sync_batch_resets_sync_point_and_retries() {
    let net = TestNet::new();
    let (a, _, a_id) = build_node(&net, MemChain::with_blocks(5), test_config());
    let (b, _, b_id) = build_node(&net, MemChain::with_blocks(5), test_config());
    let _ = &a;

    net.connect(b_id, a_id);
    assert!(wait_connected(&b, a_id).await);

    let record = b.peers().get(&a_id).await.unwrap();
    // Pretend reconciliation previously left off mid-chain.
    record
        .set_sync_point(b.chain().best_snapshot().await.hash)
        .await;

    let (_handle, interrupt, progress) = SessionHandle::new(a_id, 42, false);
    let ctx = reconcile::SessionCtx {
        sync: b.clone(),
        peer: record.clone(),
        process_id: 42,
        long_sync: false,
        interrupt,
        progress,
    };

    // Identical chains: the peer has nothing beyond our tip, so the batch
    // comes back empty.
    let result = reconcile::process_round(&ctx, false).await;
    assert_eq!(result.tag, super::session::ProcessTag::TryAgain);
    assert_eq!(record.sync_point().await, b.chain().genesis_hash());
}

#[tokio::test]
async fn inventory_relay_is_idempotent_and_delivers_transactions() {
    let net = TestNet::new();
    let (a, a_pool, a_id) = build_node(&net, MemChain::new(), test_config());
    let (b, b_pool, b_id) = build_node(&net, MemChain::new(), test_config());

    net.connect(a_id, b_id);
    assert!(wait_connected(&a, b_id).await);
    assert!(wait_connected(&b, a_id).await);

    let tx_hash = a_pool.add_local(b"tx-payload", 10);

    let sent = relay::broadcast_inventory(&a, &[(tx_hash, InvKind::Tx)], None).await;
    assert_eq!(sent, 1);

    // The dedup set swallows the second announcement entirely.
    let sent_again = relay::broadcast_inventory(&a, &[(tx_hash, InvKind::Tx)], None).await;
    assert_eq!(sent_again, 0);

    // The announced transaction crosses over and lands in b's pool.
    let delivered = eventually(
        || async { b_pool.have_tx(&tx_hash).await },
        Duration::from_secs(5),
    )
    .await;
    assert!(delivered, "announced transaction never reached b");
    let _ = &b;
}

#[tokio::test]
async fn fee_filter_suppresses_cheap_transactions() {
    let net = TestNet::new();
    let (a, a_pool, a_id) = build_node(&net, MemChain::new(), test_config());
    let (b, _, b_id) = build_node(&net, MemChain::new(), test_config());
    let _ = &b;

    net.connect(a_id, b_id);
    assert!(wait_connected(&a, b_id).await);

    // The peer advertises a fee floor above the transaction's rate.
    let record = a.peers().get(&b_id).await.unwrap();
    record.set_fee_filter(100).await;

    let cheap = a_pool.add_local(b"cheap-tx", 5);
    let sent = relay::broadcast_inventory(&a, &[(cheap, InvKind::Tx)], None).await;
    assert_eq!(sent, 0);

    let pricey = a_pool.add_local(b"pricey-tx", 500);
    let sent = relay::broadcast_inventory(&a, &[(pricey, InvKind::Tx)], None).await;
    assert_eq!(sent, 1);
}

#[tokio::test]
async fn post_handshake_topics_are_gated_for_unknown_peers() {
    let net = TestNet::new();
    let (a, _, a_id) = build_node(&net, MemChain::with_blocks(3), test_config());
    let _ = &a;

    // A transport-level neighbor that never completes a handshake.
    let lurker_id = random_peer_id();
    let lurker_transport = net.transport(lurker_id);
    let lurker = PeerSync::new(
        test_config(),
        MemChain::with_blocks(3),
        MockMemPool::new(),
        lurker_transport,
    );
    net.connect(lurker_id, a_id);
    // Drain our own connect notification; the lurker's engine never runs.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let err = lurker
        .router()
        .send(
            a_id,
            RequestPayload::SyncDag(SyncDagRequest {
                main_locator: vec![lurker.chain().genesis_hash()],
                graph_state: GraphState::default(),
            }),
        )
        .await
        .unwrap_err();
    match err {
        RpcError::Remote { status, .. } => assert_eq!(status, RpcStatus::PeerUnknown),
        other => panic!("expected a remote refusal, got {other}"),
    }
}

#[tokio::test]
async fn ping_sequence_going_backwards_is_a_protocol_error() {
    let net = TestNet::new();
    let (a, _, a_id) = build_node(&net, MemChain::new(), test_config());
    let (b, _, b_id) = build_node(&net, MemChain::new(), test_config());

    net.connect(b_id, a_id);
    assert!(wait_connected(&b, a_id).await);
    assert!(wait_connected(&a, b_id).await);

    // First ping: sequence unknown, triggers a metadata fetch on a's side.
    let reply = b
        .router()
        .send(a_id, RequestPayload::Ping(Ping { seq: 1 }))
        .await
        .unwrap();
    assert!(reply.status.is_success());

    let learned = eventually(
        || async {
            match a.peers().get(&b_id).await {
                Some(record) => record.metadata_seq().await == Some(1),
                None => false,
            }
        },
        Duration::from_secs(5),
    )
    .await;
    assert!(learned, "a never cached b's metadata sequence");

    // A sequence behind the cached one is a protocol violation.
    let err = b
        .router()
        .send(a_id, RequestPayload::Ping(Ping { seq: 0 }))
        .await
        .unwrap_err();
    match err {
        RpcError::Remote { status, .. } => {
            assert_eq!(status, RpcStatus::SequenceMismatch)
        }
        other => panic!("expected sequence mismatch, got {other}"),
    }

    // Protocol-class refusals count against the offender's reputation.
    let record = a.peers().get(&b_id).await.unwrap();
    assert!(record.bad_response_count().await >= 1);
}

#[tokio::test]
async fn audit_divergence_triggers_shutdown_signal() {
    let net = TestNet::new();
    let mut config = test_config();
    config.audit.enabled = true;
    config.audit.confirmations = 5;
    config.audit.sample_floor = 5;
    // Long interval: the round is driven manually.
    config.audit.interval = Duration::from_secs(3600);

    let (a, _, a_id) = build_node(&net, MemChain::with_blocks(30), config.clone());

    // Six compatible peers; four compute a different state root.
    let mut peers = Vec::new();
    for i in 0..6u8 {
        let salt = if i < 4 { i + 1 } else { 0 };
        let chain = if salt == 0 {
            MemChain::with_blocks(30)
        } else {
            MemChain::with_salted_blocks(30, salt)
        };
        let (peer, _, peer_id) = build_node(&net, chain, test_config());
        net.connect(peer_id, a_id);
        peers.push((peer, peer_id));
    }
    for (_, peer_id) in &peers {
        assert!(wait_connected(&a, *peer_id).await, "audit peer not connected");
    }

    match auditor::audit_round(&a).await {
        AuditOutcome::Divergence(ratio) => assert!(ratio < 0.5),
        other => panic!("expected divergence, got {other:?}"),
    }
}

#[tokio::test]
async fn audit_agreement_above_threshold_passes() {
    let net = TestNet::new();
    let mut config = test_config();
    config.audit.enabled = true;
    config.audit.confirmations = 5;
    config.audit.sample_floor = 5;
    config.audit.interval = Duration::from_secs(3600);

    let (a, _, a_id) = build_node(&net, MemChain::with_blocks(30), config);

    // Six compatible peers; only two disagree: 4/6 agreement.
    let mut peers = Vec::new();
    for i in 0..6u8 {
        let salt = if i < 2 { i + 1 } else { 0 };
        let chain = if salt == 0 {
            MemChain::with_blocks(30)
        } else {
            MemChain::with_salted_blocks(30, salt)
        };
        let (peer, _, peer_id) = build_node(&net, chain, test_config());
        net.connect(peer_id, a_id);
        peers.push((peer, peer_id));
    }
    for (_, peer_id) in &peers {
        assert!(wait_connected(&a, *peer_id).await, "audit peer not connected");
    }

    match auditor::audit_round(&a).await {
        AuditOutcome::Agreement(ratio) => assert!(ratio >= 0.5),
        other => panic!("expected agreement, got {other:?}"),
    }
    assert!(!a.is_shutting_down());
}

#[tokio::test]
async fn audit_skips_below_sample_floor() {
    let net = TestNet::new();
    let mut config = test_config();
    config.audit.enabled = true;
    config.audit.confirmations = 5;
    let (a, _, _) = build_node(&net, MemChain::with_blocks(30), config);

    assert_eq!(auditor::audit_round(&a).await, AuditOutcome::Skipped);
}

#[tokio::test]
async fn disconnect_of_sync_peer_clears_selection() {
    let net = TestNet::new();
    let (a, _, a_id) = build_node(&net, MemChain::with_blocks(50), test_config());
    let (b, _, b_id) = build_node(&net, MemChain::with_blocks(5), test_config());
    let _ = &a;

    net.connect(b_id, a_id);
    assert!(wait_connected(&b, a_id).await);

    // Let the session start (and very likely finish), then sever.
    tokio::time::sleep(Duration::from_millis(200)).await;
    net.disconnect(b_id, a_id);

    let cleared = eventually(
        || async {
            let record = b.peers().get(&a_id).await.unwrap();
            record.state().await == SessionState::Disconnected
                && b.sync_peer().await.is_none()
        },
        Duration::from_secs(5),
    )
    .await;
    assert!(cleared, "sync peer selection survived the disconnect");
}

#[test]
fn select_best_only_returns_excelling_peers_and_honors_ties() {
    let local = GraphState {
        total: 10,
        layer: 10,
        main_height: 10,
        main_order: 10,
        tips: vec![],
    };
    let state = |total: u64, order: u64| GraphState {
        total,
        layer: total,
        main_height: total,
        main_order: order,
        tips: vec![],
    };

    // Nobody excels the local view.
    let behind = vec![
        (random_peer_id(), state(9, 9)),
        (random_peer_id(), state(10, 10)),
    ];
    assert_eq!(super::select_best(&behind, &local), None);

    // A single clear winner.
    let winner = random_peer_id();
    let candidates = vec![
        (random_peer_id(), state(11, 11)),
        (winner, state(20, 20)),
        (random_peer_id(), state(12, 12)),
    ];
    assert_eq!(super::select_best(&candidates, &local), Some(winner));

    // Two peers tie at the maximum: selection stays within the tie set and,
    // over enough draws, hits both.
    let tied_a = random_peer_id();
    let tied_b = random_peer_id();
    let tied = vec![
        (tied_a, state(20, 20)),
        (random_peer_id(), state(15, 15)),
        (tied_b, state(20, 20)),
    ];
    let mut seen_a = false;
    let mut seen_b = false;
    for _ in 0..200 {
        match super::select_best(&tied, &local) {
            Some(id) if id == tied_a => seen_a = true,
            Some(id) if id == tied_b => seen_b = true,
            other => panic!("selection left the tie set: {other:?}"),
        }
    }
    assert!(seen_a && seen_b, "random tie-break never alternated");
}
