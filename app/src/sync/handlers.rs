//! Inbound request handlers for every topic.
//!
//! Handlers run concurrently on router tasks. They mutate per-peer state
//! under the peer's own locks and forward sync-relevant observations to the
//! actor; only session-level decisions go through the actor queue.

use futures::future::BoxFuture;
use futures::FutureExt;
use libp2p::PeerId;
use std::sync::Arc;
use tracing::debug;

use super::{PeerSync, SyncEvent};
use crate::metrics;
use crate::network::rpc::methods::{
    BlockDatasRequest, BlockDatasResponse, BlockData, BlockHashesResponse, ChainState, DataItem,
    FeeFilterMsg, FilterAddRequest, FilterLoadRequest, GetBlocksRequest, GetDataResponse,
    GoodbyeReason, InvMessage, MemPoolResponse, MerkleBlockRequest, MerkleBlockResponse,
    NodeRecordMsg, Ping, StateRootRequest, StateRootResponse, SyncDagRequest, SyncDagResponse,
    TxData, TxsRequest, TxsResponse,
};
use crate::network::rpc::{
    Handler, HandlerError, HandlerResponse, RequestPayload, ResponsePayload, RpcStatus,
};
use crate::peers::SessionState;
use crate::types::{Hash256, NodeRecord, ServiceFlags, MAX_TIPS};

pub struct SyncHandlers {
    sync: Arc<PeerSync>,
}

impl SyncHandlers {
    pub fn new(sync: Arc<PeerSync>) -> Self {
        Self { sync }
    }
}

impl Handler for SyncHandlers {
    fn handle(
        &self,
        peer: PeerId,
        request: RequestPayload,
    ) -> BoxFuture<'static, Result<HandlerResponse, HandlerError>> {
        let sync = self.sync.clone();
        async move { dispatch(sync, peer, request).await }.boxed()
    }
}

async fn dispatch(
    sync: Arc<PeerSync>,
    peer: PeerId,
    request: RequestPayload,
) -> Result<HandlerResponse, HandlerError> {
    match request {
        RequestPayload::ChainState(cs) => on_chain_state(sync, peer, cs).await,
        RequestPayload::Goodbye(reason) => on_goodbye(sync, peer, reason).await,
        RequestPayload::Ping(ping) => on_ping(sync, peer, ping).await,
        RequestPayload::MetaData => Ok(HandlerResponse::ok(ResponsePayload::MetaData(
            sync.local_metadata(),
        ))),
        RequestPayload::GetBlocks(req) => on_get_blocks(sync, req).await,
        RequestPayload::BlockDatas(req) => on_block_datas(sync, req).await,
        RequestPayload::SyncDag(req) => on_sync_dag(sync, peer, req).await,
        RequestPayload::Inventory(inv) => on_inventory(sync, peer, inv).await,
        RequestPayload::GraphState(state) => on_graph_state(sync, peer, state).await,
        RequestPayload::NodeRecord(msg) => on_node_record(sync, peer, msg).await,
        RequestPayload::StateRoot(req) => on_state_root(sync, req).await,
        RequestPayload::MerkleBlock(req) => on_merkle_block(sync, peer, req).await,
        RequestPayload::FilterAdd(req) => on_filter_add(sync, peer, req).await,
        RequestPayload::FilterClear => on_filter_clear(sync, peer).await,
        RequestPayload::FilterLoad(req) => on_filter_load(sync, peer, req).await,
        RequestPayload::FeeFilter(msg) => on_fee_filter(sync, peer, msg).await,
        RequestPayload::MemPool => on_mempool(sync).await,
        RequestPayload::GetData(inv) => on_get_data(sync, inv).await,
        RequestPayload::Txs(req) => on_txs(sync, req).await,
    }
}

/// Handshake service half. Completes passive (inbound) handshakes and
/// answers active ones; genesis mismatch is a consensus-class refusal that
/// still carries our chain state.
async fn on_chain_state(
    sync: Arc<PeerSync>,
    peer: PeerId,
    cs: ChainState,
) -> Result<HandlerResponse, HandlerError> {
    let record = sync.peers.fetch_or_create(peer).await;

    if !record
        .note_connect_attempt(
            sync.config.p2p.reconnect_window,
            sync.config.p2p.max_reconnects,
        )
        .await
    {
        return Err(HandlerError::new(
            RpcStatus::ConnectFrequent,
            "reconnecting too frequently",
        ));
    }

    let local = sync.local_chain_state().await;

    if cs.genesis_hash != sync.chain.genesis_hash() {
        debug!(%peer, "peer handshake carries a foreign genesis");
        sync.push_event(SyncEvent::ConsensusMismatch { peer });
        return Ok(HandlerResponse::dag_consensus(ResponsePayload::ChainState(
            local,
        )));
    }

    if sync.validate_chain_state(&cs).is_err() {
        let teardown = sync.clone();
        tokio::spawn(async move {
            teardown
                .send_goodbye(peer, GoodbyeReason::RuleViolation)
                .await;
            teardown.sever(peer).await;
        });
        return Err(HandlerError::new(
            RpcStatus::RuleViolation,
            "incompatible chain state",
        ));
    }

    let freshly_connected = {
        let _guard = record.lock_handshake().await;
        record
            .apply_chain_state(
                cs.protocol_version,
                ServiceFlags(cs.services),
                cs.genesis_hash,
                cs.state_root,
                cs.disable_relay_tx,
                cs.graph_state.clone(),
            )
            .await;
        if record.state().await != SessionState::Connected {
            record.set_state(SessionState::Connected).await;
            metrics::PEERS_CONNECTED.inc();
            true
        } else {
            false
        }
    };

    if freshly_connected {
        sync.on_peer_connected(peer, &cs).await;
    }

    Ok(HandlerResponse::ok(ResponsePayload::ChainState(local)))
}

async fn on_goodbye(
    sync: Arc<PeerSync>,
    peer: PeerId,
    reason: GoodbyeReason,
) -> Result<HandlerResponse, HandlerError> {
    debug!(%peer, ?reason, "peer said goodbye");
    sync.push_event(SyncEvent::Disconnected { peer });
    Ok(HandlerResponse::ok(ResponsePayload::Ack))
}

/// Sequence-validated liveness probe. A sequence ahead of our cached
/// metadata triggers a (debounced) metadata re-fetch; one behind it is a
/// protocol error.
async fn on_ping(
    sync: Arc<PeerSync>,
    peer: PeerId,
    ping: Ping,
) -> Result<HandlerResponse, HandlerError> {
    let record = sync.peers.fetch_or_create(peer).await;

    let refresh = match record.metadata_seq().await {
        Some(known) if ping.seq < known => {
            return Err(HandlerError::new(
                RpcStatus::SequenceMismatch,
                "metadata sequence went backwards",
            ));
        }
        Some(known) => ping.seq > known,
        None => true,
    };

    if refresh
        && record
            .debounce("metadata", sync.config.sync.update_debounce)
            .await
    {
        let sync = sync.clone();
        tokio::spawn(async move {
            if let Ok(reply) = sync.router.send(peer, RequestPayload::MetaData).await {
                if let ResponsePayload::MetaData(meta) = reply.payload {
                    if let Some(record) = sync.peers.get(&peer).await {
                        record.set_metadata_seq(meta.seq).await;
                    }
                }
            }
        });
    }

    Ok(HandlerResponse::ok(ResponsePayload::Pong(Ping {
        seq: sync.local_metadata().seq,
    })))
}

async fn on_get_blocks(
    sync: Arc<PeerSync>,
    req: GetBlocksRequest,
) -> Result<HandlerResponse, HandlerError> {
    if req.locator.len() > MAX_TIPS * 2 {
        return Err(HandlerError::new(RpcStatus::RuleViolation, "oversized locator"));
    }
    let hashes = sync
        .chain
        .locate_blocks(&req.locator, sync.config.sync.batch_size)
        .await;
    Ok(HandlerResponse::ok(ResponsePayload::BlockHashes(
        BlockHashesResponse { hashes },
    )))
}

async fn on_block_datas(
    sync: Arc<PeerSync>,
    req: BlockDatasRequest,
) -> Result<HandlerResponse, HandlerError> {
    if req.hashes.len() > sync.config.sync.batch_size {
        return Err(HandlerError::new(
            RpcStatus::RuleViolation,
            "oversized block batch request",
        ));
    }
    let mut blocks = Vec::with_capacity(req.hashes.len());
    let mut budget = sync.config.p2p.max_message_size;
    for hash in &req.hashes {
        if let Some(data) = sync.chain.get_block(hash).await {
            if data.len() >= budget {
                break;
            }
            budget -= data.len();
            blocks.push(BlockData { data });
        }
    }
    Ok(HandlerResponse::ok(ResponsePayload::BlockDatas(
        BlockDatasResponse { blocks },
    )))
}

/// Service half of the DAG-sync exchange.
async fn on_sync_dag(
    sync: Arc<PeerSync>,
    peer: PeerId,
    req: SyncDagRequest,
) -> Result<HandlerResponse, HandlerError> {
    if req.graph_state.tips.len() > MAX_TIPS {
        return Err(HandlerError::new(
            RpcStatus::RuleViolation,
            "too many tips in graph state",
        ));
    }

    if let Some(record) = sync.peers.get(&peer).await {
        record.update_graph_state(req.graph_state.clone()).await;
    }
    sync.push_event(SyncEvent::DagSyncPush {
        peer,
        state: req.graph_state.clone(),
    });

    let (sync_point, block_hashes) = sync
        .chain
        .next_sync_batch(&req.main_locator, &req.graph_state, sync.config.sync.batch_size)
        .await;
    let graph_state = sync.chain.best_snapshot().await.graph_state();

    Ok(HandlerResponse::ok(ResponsePayload::SyncDag(
        SyncDagResponse {
            graph_state,
            sync_point,
            block_hashes,
        },
    )))
}

async fn on_inventory(
    sync: Arc<PeerSync>,
    peer: PeerId,
    inv: InvMessage,
) -> Result<HandlerResponse, HandlerError> {
    if inv.items.len() > sync.config.relay.max_inv_batch {
        return Err(HandlerError::new(
            RpcStatus::RuleViolation,
            "oversized inventory message",
        ));
    }
    if let Some(record) = sync.peers.get(&peer).await {
        for item in &inv.items {
            // Whatever the peer announced it already has; don't echo it back.
            record
                .mark_broadcast(
                    item.hash,
                    sync.config.sync.dedup_floor,
                    sync.config.sync.dedup_max_age,
                )
                .await;
        }
    }
    sync.push_event(SyncEvent::Inventory {
        peer,
        items: inv.items,
    });
    Ok(HandlerResponse::ok(ResponsePayload::Ack))
}

async fn on_graph_state(
    sync: Arc<PeerSync>,
    peer: PeerId,
    state: crate::types::GraphState,
) -> Result<HandlerResponse, HandlerError> {
    if state.tips.len() > MAX_TIPS {
        return Err(HandlerError::new(
            RpcStatus::RuleViolation,
            "too many tips in graph state",
        ));
    }
    if let Some(record) = sync.peers.get(&peer).await {
        record.update_graph_state(state.clone()).await;
    }
    sync.push_event(SyncEvent::GraphStatePush { peer, state });
    let local = sync.chain.best_snapshot().await.graph_state();
    Ok(HandlerResponse::ok(ResponsePayload::GraphState(local)))
}

async fn on_node_record(
    sync: Arc<PeerSync>,
    peer: PeerId,
    msg: NodeRecordMsg,
) -> Result<HandlerResponse, HandlerError> {
    if let Some(record) = sync.peers.get(&peer).await {
        let updated = record
            .update_node_record(NodeRecord {
                seq: msg.seq,
                payload: msg.payload,
            })
            .await;
        if updated {
            sync.push_event(SyncEvent::NodeRecordSeen { peer, seq: msg.seq });
        }
    }
    Ok(HandlerResponse::ok(ResponsePayload::NodeRecord(
        sync.local_node_record(),
    )))
}

async fn on_state_root(
    sync: Arc<PeerSync>,
    req: StateRootRequest,
) -> Result<HandlerResponse, HandlerError> {
    let root = sync.chain.state_root_at(&req.block).await;
    Ok(HandlerResponse::ok(ResponsePayload::StateRoot(
        StateRootResponse {
            root: root.unwrap_or_default(),
            known: root.is_some(),
        },
    )))
}

async fn on_merkle_block(
    sync: Arc<PeerSync>,
    peer: PeerId,
    req: MerkleBlockRequest,
) -> Result<HandlerResponse, HandlerError> {
    let Some(block) = sync.chain.get_block(&req.block).await else {
        return Err(HandlerError::new(RpcStatus::RuleViolation, "unknown block"));
    };
    let mut matched = Vec::new();
    if let Some(record) = sync.peers.get(&peer).await {
        for tx in sync.chain.block_tx_hashes(&req.block).await {
            if record.filter_matches(tx.as_bytes()).await {
                matched.push(tx);
            }
        }
    }
    Ok(HandlerResponse::ok(ResponsePayload::MerkleBlock(
        MerkleBlockResponse { block, matched },
    )))
}

async fn on_filter_add(
    sync: Arc<PeerSync>,
    peer: PeerId,
    req: FilterAddRequest,
) -> Result<HandlerResponse, HandlerError> {
    if let Some(record) = sync.peers.get(&peer).await {
        record.filter_add(req.element).await;
    }
    Ok(HandlerResponse::ok(ResponsePayload::Ack))
}

async fn on_filter_clear(
    sync: Arc<PeerSync>,
    peer: PeerId,
) -> Result<HandlerResponse, HandlerError> {
    if let Some(record) = sync.peers.get(&peer).await {
        record.filter_clear().await;
    }
    Ok(HandlerResponse::ok(ResponsePayload::Ack))
}

async fn on_filter_load(
    sync: Arc<PeerSync>,
    peer: PeerId,
    req: FilterLoadRequest,
) -> Result<HandlerResponse, HandlerError> {
    if let Some(record) = sync.peers.get(&peer).await {
        record.filter_load(req.elements).await;
    }
    Ok(HandlerResponse::ok(ResponsePayload::Ack))
}

async fn on_fee_filter(
    sync: Arc<PeerSync>,
    peer: PeerId,
    msg: FeeFilterMsg,
) -> Result<HandlerResponse, HandlerError> {
    if let Some(record) = sync.peers.get(&peer).await {
        record.set_fee_filter(msg.min_fee_rate).await;
    }
    Ok(HandlerResponse::ok(ResponsePayload::Ack))
}

async fn on_mempool(sync: Arc<PeerSync>) -> Result<HandlerResponse, HandlerError> {
    let limit = sync.config.p2p.max_message_size / std::mem::size_of::<Hash256>();
    let hashes = sync.mempool.digest(limit).await;
    Ok(HandlerResponse::ok(ResponsePayload::MemPool(
        MemPoolResponse { hashes },
    )))
}

async fn on_get_data(
    sync: Arc<PeerSync>,
    inv: InvMessage,
) -> Result<HandlerResponse, HandlerError> {
    if inv.items.len() > sync.config.sync.batch_size {
        return Err(HandlerError::new(
            RpcStatus::RuleViolation,
            "oversized get-data request",
        ));
    }
    let mut items = Vec::new();
    let mut budget = sync.config.p2p.max_message_size;
    for item in &inv.items {
        let data = if item.is_tx() {
            sync.mempool.get_tx(&item.hash).await
        } else if item.is_block() {
            sync.chain.get_block(&item.hash).await
        } else {
            None
        };
        if let Some(data) = data {
            if data.len() >= budget {
                break;
            }
            budget -= data.len();
            items.push(DataItem {
                kind: item.kind,
                data,
            });
        }
    }
    Ok(HandlerResponse::ok(ResponsePayload::GetData(
        GetDataResponse { items },
    )))
}

async fn on_txs(sync: Arc<PeerSync>, req: TxsRequest) -> Result<HandlerResponse, HandlerError> {
    if req.hashes.len() > sync.config.sync.batch_size {
        return Err(HandlerError::new(
            RpcStatus::RuleViolation,
            "oversized transaction batch request",
        ));
    }
    let mut txs = Vec::new();
    for hash in &req.hashes {
        if let Some(data) = sync.mempool.get_tx(hash).await {
            txs.push(TxData { data });
        }
    }
    Ok(HandlerResponse::ok(ResponsePayload::Txs(TxsResponse {
        txs,
    })))
}
