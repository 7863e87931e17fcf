//! The peer synchronization engine.
//!
//! A single cooperative actor owns all session-level decisions: which peer to
//! sync from, when a session starts, stalls or ends, and how handshakes are
//! sequenced. Everything reaches it as a [`SyncEvent`] through one unbounded
//! queue, giving a total order to peer-selection decisions. High-frequency
//! per-peer field access deliberately stays outside the actor, protected by
//! the per-peer locks in [`crate::peers`].

pub mod auditor;
pub mod handlers;
pub mod reconcile;
pub mod relay;
pub mod session;
#[cfg(test)]
mod tests;

use libp2p::{Multiaddr, PeerId};
use rand::seq::SliceRandom;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::time::interval;
use tracing::{debug, info, trace, warn};

use crate::chain::Chain;
use crate::config::NodeConfig;
use crate::mempool::MemPool;
use crate::metrics;
use crate::network::rpc::methods::{
    ChainState, GoodbyeReason, InvItem, MetaData, NodeRecordMsg, ResponsePayload,
};
use crate::network::rpc::{ProtocolRouter, RequestPayload, RouterConfig};
use crate::network::{Transport, TransportEvent};
use crate::peers::{PeerRegistry, SessionState};
use crate::types::{Direction, GraphState, Hash256, ServiceFlags, PROTOCOL_VERSION};
use relay::InvKind;
use session::{SessionHandle, SessionOutcome};

/// Closed set of events processed by the sync actor, in arrival order.
#[derive(Debug)]
pub enum SyncEvent {
    /// Transport established a connection.
    Connected {
        peer: PeerId,
        address: Multiaddr,
        direction: Direction,
    },
    /// Transport lost a connection, or a peer said goodbye.
    Disconnected { peer: PeerId },
    /// A peer pushed a fresh graph state.
    GraphStatePush { peer: PeerId, state: GraphState },
    /// A peer announced inventory.
    Inventory { peer: PeerId, items: Vec<InvItem> },
    /// A polled peer returned its mempool digest.
    MempoolDigest { peer: PeerId, hashes: Vec<Hash256> },
    /// A peer drove a DAG-sync exchange against us.
    DagSyncPush { peer: PeerId, state: GraphState },
    /// A peer sent a (newer) node record.
    NodeRecordSeen { peer: PeerId, seq: u64 },
    /// A handshake revealed an incompatible chain; say goodbye and sever.
    ConsensusMismatch { peer: PeerId },
    /// Re-evaluate the sync source. `force` tears down a running session.
    PeerUpdate { peer: Option<PeerId>, force: bool },
    /// Newly accepted block to relay outward.
    AnnounceBlock {
        hash: Hash256,
        source: Option<PeerId>,
    },
    /// Newly accepted transaction to relay outward.
    AnnounceTx {
        hash: Hash256,
        source: Option<PeerId>,
    },
    /// A reconciliation session finished.
    SessionEnded {
        process_id: u64,
        outcome: SessionOutcome,
    },
    /// Periodic stall check.
    StallTick,
    Shutdown,
}

struct ActorState {
    session: Option<SessionHandle>,
}

pub struct PeerSync {
    config: NodeConfig,
    chain: Arc<dyn Chain>,
    mempool: Arc<dyn MemPool>,
    transport: Arc<dyn Transport>,
    router: Arc<ProtocolRouter>,
    peers: Arc<PeerRegistry>,
    events_tx: mpsc::UnboundedSender<SyncEvent>,
    events_rx: StdMutex<Option<mpsc::UnboundedReceiver<SyncEvent>>>,
    shutdown_tx: watch::Sender<bool>,
    /// Mirror of the actor's chosen sync source, readable outside the actor
    /// for the current/complete determination.
    current_sync_peer: RwLock<Option<PeerId>>,
    /// Serializes reconciliation sessions.
    process_lock: Arc<Mutex<()>>,
    sessions_active: Arc<AtomicUsize>,
    next_process_id: AtomicU64,
    metadata_seq: AtomicU64,
    local_record: StdMutex<NodeRecordMsg>,
    time_offsets: StdMutex<Vec<i64>>,
    relay_queue: relay::RelayQueue,
}

impl PeerSync {
    pub fn new(
        config: NodeConfig,
        chain: Arc<dyn Chain>,
        mempool: Arc<dyn MemPool>,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        let peers = PeerRegistry::new(
            chain.genesis_hash(),
            config.sync.bad_response_cap,
            config.sync.bad_grace,
        );
        let router = ProtocolRouter::new(
            RouterConfig::from_node(&config),
            transport.clone(),
            peers.clone(),
        );
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        let local_record = NodeRecordMsg {
            seq: 1,
            payload: transport.local_peer().to_bytes(),
        };

        Arc::new(Self {
            config,
            chain,
            mempool,
            transport,
            router,
            peers,
            events_tx,
            events_rx: StdMutex::new(Some(events_rx)),
            shutdown_tx,
            current_sync_peer: RwLock::new(None),
            process_lock: Arc::new(Mutex::new(())),
            sessions_active: Arc::new(AtomicUsize::new(0)),
            next_process_id: AtomicU64::new(0),
            metadata_seq: AtomicU64::new(1),
            local_record: StdMutex::new(local_record),
            time_offsets: StdMutex::new(Vec::new()),
            relay_queue: relay::RelayQueue::default(),
        })
    }

    pub fn peers(&self) -> Arc<PeerRegistry> {
        self.peers.clone()
    }

    pub fn router(&self) -> Arc<ProtocolRouter> {
        self.router.clone()
    }

    pub fn chain(&self) -> Arc<dyn Chain> {
        self.chain.clone()
    }

    pub fn mempool(&self) -> Arc<dyn MemPool> {
        self.mempool.clone()
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub(crate) fn relay_queue(&self) -> &relay::RelayQueue {
        &self.relay_queue
    }

    pub fn push_event(&self, event: SyncEvent) {
        let _ = self.events_tx.send(event);
    }

    pub fn shutdown_listener(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Raise the process-scoped shutdown signal.
    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.push_event(SyncEvent::Shutdown);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Start the actor and all background jobs.
    pub fn start(self: &Arc<Self>) {
        let events_rx = self
            .events_rx
            .lock()
            .expect("poisoned events lock")
            .take()
            .expect("start() called twice");

        // Inbound protocol dispatch.
        let handler = Arc::new(handlers::SyncHandlers::new(self.clone()));
        self.router.spawn_inbound(handler, self.shutdown_listener());

        // Transport connect/disconnect notifications.
        let sync = self.clone();
        let mut transport_events = self.transport.subscribe_events();
        let mut shutdown = self.shutdown_listener();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                    event = transport_events.recv() => match event {
                        Ok(TransportEvent::Connected { peer, address, direction }) => {
                            sync.push_event(SyncEvent::Connected { peer, address, direction });
                        }
                        Ok(TransportEvent::Disconnected { peer }) => {
                            sync.push_event(SyncEvent::Disconnected { peer });
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!("missed {n} transport notifications");
                        }
                        Err(_) => break,
                    }
                }
            }
        });

        // Periodic stall check.
        let sync = self.clone();
        let mut shutdown = self.shutdown_listener();
        let stall_interval = self.config.sync.stall_interval;
        tokio::spawn(async move {
            let mut ticker = interval(stall_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => sync.push_event(SyncEvent::StallTick),
                }
            }
        });

        relay::spawn_rebroadcast(self.clone());
        relay::spawn_mempool_poll(self.clone());
        auditor::spawn_auditor(self.clone());

        // The actor itself.
        let sync = self.clone();
        tokio::spawn(async move {
            sync.run_actor(events_rx).await;
        });
    }

    /// Two-part currency check: the chain must consider itself current AND
    /// no active sync peer may know a better graph than ours.
    pub async fn is_current(&self) -> bool {
        if !self.chain.is_current().await {
            return false;
        }
        let Some(peer) = *self.current_sync_peer.read().await else {
            return true;
        };
        let Some(record) = self.peers.get(&peer).await else {
            return true;
        };
        match record.graph_state().await {
            Some(state) => {
                let local = self.chain.best_snapshot().await.graph_state();
                !state.excels(&local)
            }
            None => true,
        }
    }

    pub async fn sync_peer(&self) -> Option<PeerId> {
        *self.current_sync_peer.read().await
    }

    pub(crate) async fn local_chain_state(&self) -> ChainState {
        let best = self.chain.best_snapshot().await;
        ChainState {
            protocol_version: PROTOCOL_VERSION,
            services: ServiceFlags::NETWORK
                .with(ServiceFlags::CONSENSUS)
                .with(ServiceFlags::RELAY)
                .0,
            timestamp: unix_time(),
            genesis_hash: self.chain.genesis_hash(),
            state_root: best.state_root,
            disable_relay_tx: false,
            graph_state: best.graph_state(),
        }
    }

    pub(crate) fn local_metadata(&self) -> MetaData {
        MetaData {
            seq: self.metadata_seq.load(Ordering::Relaxed),
            services: ServiceFlags::NETWORK
                .with(ServiceFlags::CONSENSUS)
                .with(ServiceFlags::RELAY)
                .0,
        }
    }

    pub(crate) fn local_node_record(&self) -> NodeRecordMsg {
        self.local_record.lock().expect("poisoned record lock").clone()
    }

    /// Replace the local node record, bumping the metadata sequence so peers
    /// notice via ping.
    pub fn set_local_node_record(&self, payload: Vec<u8>) {
        let mut record = self.local_record.lock().expect("poisoned record lock");
        record.seq += 1;
        record.payload = payload;
        self.metadata_seq.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the clock offset a peer advertised during handshake.
    pub(crate) fn add_time_sample(&self, peer_unix_time: u64) {
        let offset = peer_unix_time as i64 - unix_time() as i64;
        let mut offsets = self.time_offsets.lock().expect("poisoned offsets lock");
        offsets.push(offset);
        if offsets.len() > 200 {
            offsets.remove(0);
        }
    }

    /// Median clock offset across handshaken peers.
    pub fn median_time_offset(&self) -> i64 {
        let mut offsets = self
            .time_offsets
            .lock()
            .expect("poisoned offsets lock")
            .clone();
        if offsets.is_empty() {
            return 0;
        }
        offsets.sort_unstable();
        offsets[offsets.len() / 2]
    }

    async fn run_actor(self: Arc<Self>, mut events_rx: mpsc::UnboundedReceiver<SyncEvent>) {
        let mut state = ActorState { session: None };
        while let Some(event) = events_rx.recv().await {
            match event {
                SyncEvent::Connected {
                    peer,
                    address,
                    direction,
                } => {
                    let record = self.peers.add(peer, address, direction).await;
                    let sync = self.clone();
                    tokio::spawn(async move {
                        sync.establish(record, direction).await;
                    });
                }
                SyncEvent::Disconnected { peer } => {
                    let sync = self.clone();
                    tokio::spawn(async move {
                        sync.sever(peer).await;
                    });
                }
                SyncEvent::GraphStatePush { peer, state: gs }
                | SyncEvent::DagSyncPush { peer, state: gs } => {
                    trace!(%peer, total = gs.total, "peer graph state moved");
                    let local = self.chain.best_snapshot().await.graph_state();
                    if gs.excels(&local) {
                        self.evaluate_sync_peer(&mut state, false).await;
                    }
                }
                SyncEvent::Inventory { peer, items } => {
                    self.on_inventory(peer, items).await;
                }
                SyncEvent::MempoolDigest { peer, hashes } => {
                    let mut missing = Vec::new();
                    for hash in hashes {
                        if !self.mempool.have_tx(&hash).await {
                            missing.push(hash);
                        }
                    }
                    if !missing.is_empty() {
                        let sync = self.clone();
                        tokio::spawn(async move {
                            sync.fetch_transactions(peer, missing, true).await;
                        });
                    }
                }
                SyncEvent::NodeRecordSeen { peer, seq } => {
                    debug!(%peer, seq, "stored peer node record");
                }
                SyncEvent::ConsensusMismatch { peer } => {
                    let sync = self.clone();
                    tokio::spawn(async move {
                        sync.send_goodbye(peer, GoodbyeReason::IrrelevantNetwork).await;
                        sync.sever(peer).await;
                    });
                }
                SyncEvent::PeerUpdate { peer, force } => {
                    if let Some(peer) = peer {
                        trace!(%peer, force, "peer update requested");
                    }
                    self.evaluate_sync_peer(&mut state, force).await;
                }
                SyncEvent::AnnounceBlock { hash, source } => {
                    self.relay_queue.enqueue(hash, InvKind::Block);
                    let sync = self.clone();
                    tokio::spawn(async move {
                        relay::broadcast_inventory(&sync, &[(hash, InvKind::Block)], source)
                            .await;
                    });
                }
                SyncEvent::AnnounceTx { hash, source } => {
                    self.relay_queue.enqueue(hash, InvKind::Tx);
                    if self.is_current().await {
                        let sync = self.clone();
                        tokio::spawn(async move {
                            relay::broadcast_inventory(&sync, &[(hash, InvKind::Tx)], source)
                                .await;
                        });
                    }
                }
                SyncEvent::SessionEnded {
                    process_id,
                    outcome,
                } => {
                    self.on_session_ended(&mut state, process_id, outcome).await;
                }
                SyncEvent::StallTick => {
                    self.check_stall(&mut state).await;
                }
                SyncEvent::Shutdown => {
                    if let Some(handle) = &state.session {
                        handle.interrupt();
                    }
                    break;
                }
            }
        }
        info!("sync actor stopped");
    }

    /// Connect-side handshake sequencing. Only outbound connections perform
    /// the active exchange; inbound connections wait for the peer to speak.
    async fn establish(self: &Arc<Self>, record: Arc<crate::peers::PeerRecord>, direction: Direction) {
        let peer = record.id();
        let guard = record.lock_handshake().await;
        if record.state().await == SessionState::Connected {
            // Duplicate notification; nothing to do.
            return;
        }
        record.set_state(SessionState::Connecting).await;

        if direction == Direction::Inbound {
            return;
        }
        drop(guard);

        let local = self.local_chain_state().await;
        let reply = self
            .router
            .send(peer, RequestPayload::ChainState(local))
            .await;

        let guard = record.lock_handshake().await;
        match reply {
            Ok(reply) => {
                let ResponsePayload::ChainState(theirs) = reply.payload else {
                    record.set_state(SessionState::Disconnected).await;
                    return;
                };
                if reply.status.is_dag_consensus() {
                    // The peer recognized us but refused on consensus grounds.
                    debug!(%peer, "peer rejected handshake with a diverging chain view");
                    record.set_state(SessionState::Disconnected).await;
                    drop(guard);
                    self.send_goodbye(peer, GoodbyeReason::IrrelevantNetwork).await;
                    return;
                }
                match self.validate_chain_state(&theirs) {
                    Ok(()) => {
                        record
                            .apply_chain_state(
                                theirs.protocol_version,
                                ServiceFlags(theirs.services),
                                theirs.genesis_hash,
                                theirs.state_root,
                                theirs.disable_relay_tx,
                                theirs.graph_state.clone(),
                            )
                            .await;
                        record.set_state(SessionState::Connected).await;
                        metrics::PEERS_CONNECTED.inc();
                        drop(guard);
                        info!(%peer, total = theirs.graph_state.total, "peer connected");
                        self.on_peer_connected(peer, &theirs).await;
                    }
                    Err(reason) => {
                        record.set_state(SessionState::Disconnected).await;
                        drop(guard);
                        self.send_goodbye(peer, reason).await;
                    }
                }
            }
            Err(err) => {
                debug!(%peer, %err, "handshake failed");
                record.set_state(SessionState::Disconnected).await;
            }
        }
    }

    /// Shared post-handshake side effects.
    pub(crate) async fn on_peer_connected(self: &Arc<Self>, peer: PeerId, theirs: &ChainState) {
        self.add_time_sample(theirs.timestamp);

        // Advertise our fee floor so the peer can pre-filter tx relay.
        let min_fee = self.mempool.min_fee_rate().await;
        if min_fee > 0 {
            let sync = self.clone();
            tokio::spawn(async move {
                let _ = sync
                    .router
                    .send(
                        peer,
                        RequestPayload::FeeFilter(
                            crate::network::rpc::methods::FeeFilterMsg {
                                min_fee_rate: min_fee,
                            },
                        ),
                    )
                    .await;
            });
        }

        if ServiceFlags(theirs.services).has(ServiceFlags::CONSENSUS) {
            self.push_event(SyncEvent::PeerUpdate {
                peer: Some(peer),
                force: false,
            });
        }
    }

    pub(crate) fn validate_chain_state(&self, theirs: &ChainState) -> Result<(), GoodbyeReason> {
        if theirs.protocol_version < crate::types::MIN_PROTOCOL_VERSION {
            return Err(GoodbyeReason::RuleViolation);
        }
        if theirs.graph_state.tips.len() > crate::types::MAX_TIPS {
            return Err(GoodbyeReason::RuleViolation);
        }
        Ok(())
    }

    /// Disconnect transition; notifies the actor if the sync source is gone.
    pub(crate) async fn sever(self: &Arc<Self>, peer: PeerId) {
        let Some(record) = self.peers.get(&peer).await else {
            return;
        };
        {
            let _guard = record.lock_handshake().await;
            match record.state().await {
                SessionState::Disconnected => return,
                SessionState::Connected => metrics::PEERS_CONNECTED.dec(),
                _ => {}
            }
            record.set_state(SessionState::Disconnecting).await;
            record.set_state(SessionState::Disconnected).await;
        }
        info!(%peer, "peer disconnected");
        if *self.current_sync_peer.read().await == Some(peer) {
            self.push_event(SyncEvent::PeerUpdate {
                peer: None,
                force: true,
            });
        }
    }

    pub(crate) async fn send_goodbye(&self, peer: PeerId, reason: GoodbyeReason) {
        debug!(%peer, ?reason, "sending goodbye");
        let _ = self
            .router
            .send(peer, RequestPayload::Goodbye(reason))
            .await;
    }

    async fn on_inventory(self: &Arc<Self>, peer: PeerId, items: Vec<InvItem>) {
        let mut unknown_txs = Vec::new();
        let mut unseen_block = false;
        for item in &items {
            if item.is_block() {
                if !self.chain.have_block(&item.hash).await {
                    unseen_block = true;
                }
            } else if item.is_tx() && !self.mempool.have_tx(&item.hash).await {
                unknown_txs.push(item.hash);
            }
        }

        if unseen_block {
            // An unknown block means the peer's view moved; refresh its graph
            // state (coalesced per peer) before deciding whether to re-sync.
            if let Some(record) = self.peers.get(&peer).await {
                if record
                    .debounce("graph_update", self.config.sync.update_debounce)
                    .await
                {
                    let sync = self.clone();
                    tokio::spawn(async move {
                        sync.refresh_graph_state(peer).await;
                    });
                }
            }
        }

        if !unknown_txs.is_empty() {
            let sync = self.clone();
            tokio::spawn(async move {
                sync.fetch_transactions(peer, unknown_txs, false).await;
            });
        }
    }

    /// Exchange graph states with a peer and feed the result to the actor.
    async fn refresh_graph_state(self: &Arc<Self>, peer: PeerId) {
        let local = self.chain.best_snapshot().await.graph_state();
        match self
            .router
            .send(peer, RequestPayload::GraphState(local))
            .await
        {
            Ok(reply) => {
                if let ResponsePayload::GraphState(theirs) = reply.payload {
                    if let Some(record) = self.peers.get(&peer).await {
                        record.update_graph_state(theirs.clone()).await;
                    }
                    self.push_event(SyncEvent::GraphStatePush {
                        peer,
                        state: theirs,
                    });
                }
            }
            Err(err) => debug!(%peer, %err, "graph state refresh failed"),
        }
    }

    /// Fetch announced or digested transactions and feed them to the pool.
    /// `via_txs` picks the transaction-batch topic over generic get-data.
    async fn fetch_transactions(self: &Arc<Self>, peer: PeerId, hashes: Vec<Hash256>, via_txs: bool) {
        use crate::network::rpc::methods::{InvMessage, TxsRequest};

        let request = if via_txs {
            RequestPayload::Txs(TxsRequest {
                hashes: hashes.clone(),
            })
        } else {
            RequestPayload::GetData(InvMessage {
                items: hashes.iter().copied().map(InvItem::tx).collect(),
            })
        };

        let reply = match self.router.send(peer, request).await {
            Ok(reply) => reply,
            Err(err) => {
                debug!(%peer, %err, "transaction fetch failed");
                return;
            }
        };

        let datas: Vec<Vec<u8>> = match reply.payload {
            ResponsePayload::Txs(txs) => txs.txs.into_iter().map(|t| t.data).collect(),
            ResponsePayload::GetData(items) => {
                items.items.into_iter().map(|i| i.data).collect()
            }
            _ => return,
        };

        for data in datas {
            match self.mempool.submit_tx(&data).await {
                Ok(hash) => {
                    if let Some(record) = self.peers.get(&peer).await {
                        // The sender obviously has it; never echo it back.
                        record
                            .mark_broadcast(
                                hash,
                                self.config.sync.dedup_floor,
                                self.config.sync.dedup_max_age,
                            )
                            .await;
                    }
                    self.push_event(SyncEvent::AnnounceTx {
                        hash,
                        source: Some(peer),
                    });
                }
                Err(crate::mempool::MemPoolError::Duplicate) => {}
                Err(crate::mempool::MemPoolError::Revalidate) => {
                    trace!(%peer, "fetched transaction failed revalidation");
                }
                Err(err) => {
                    debug!(%peer, %err, "peer relayed an invalid transaction");
                    self.peers
                        .increment_bad_response(
                            &peer,
                            crate::network::rpc::RpcStatus::RuleViolation,
                        )
                        .await;
                }
            }
        }
    }

    async fn evaluate_sync_peer(self: &Arc<Self>, state: &mut ActorState, force: bool) {
        let local = self.chain.best_snapshot().await.graph_state();

        let mut candidates = Vec::new();
        for record in self.peers.can_sync(self.transport.as_ref()).await {
            if let Some(gs) = record.graph_state().await {
                candidates.push((record.id(), gs));
            }
        }

        if let Some(handle) = &state.session {
            let keep = !force
                && candidates.iter().any(|(id, gs)| {
                    *id == handle.peer
                        && gs.excels(&local)
                        && !candidates.iter().any(|(_, other)| other.excels(gs))
                });
            if keep {
                return;
            }
            debug!(
                process_id = handle.process_id,
                peer = %handle.peer,
                "interrupting sync session for re-selection"
            );
            handle.interrupt();
            state.session = None;
            *self.current_sync_peer.write().await = None;
        }

        let Some(best) = select_best(&candidates, &local) else {
            trace!("no peer excels the local graph; not syncing");
            return;
        };
        let best_state = candidates
            .iter()
            .find(|(id, _)| *id == best)
            .map(|(_, gs)| gs.clone())
            .unwrap_or_default();
        let Some(record) = self.peers.get(&best).await else {
            return;
        };

        let process_id = self.next_process_id.fetch_add(1, Ordering::Relaxed) + 1;
        let long_sync = best_state.total > local.total + self.config.sync.batch_size as u64;
        let (handle, interrupt_rx, progress) = SessionHandle::new(best, process_id, long_sync);
        *self.current_sync_peer.write().await = Some(best);
        state.session = Some(handle);

        info!(
            process_id,
            peer = %best,
            long_sync,
            peer_total = best_state.total,
            local_total = local.total,
            "starting sync session"
        );

        let ctx = reconcile::SessionCtx {
            sync: self.clone(),
            peer: record,
            process_id,
            long_sync,
            interrupt: interrupt_rx,
            progress,
        };
        tokio::spawn(reconcile::run_session(ctx));
    }

    async fn on_session_ended(
        self: &Arc<Self>,
        state: &mut ActorState,
        process_id: u64,
        outcome: SessionOutcome,
    ) {
        let is_current = match &state.session {
            Some(handle) if handle.process_id == process_id => true,
            _ => false,
        };
        if !is_current {
            return;
        }
        state.session = None;
        *self.current_sync_peer.write().await = None;

        let label = match outcome {
            SessionOutcome::Finished => "finished",
            SessionOutcome::Retry => "retry",
            SessionOutcome::Interrupted => "interrupted",
        };
        metrics::SYNC_SESSIONS.with_label_values(&[label]).inc();
        debug!(process_id, outcome = label, "sync session ended");

        let reschedule = matches!(
            outcome,
            SessionOutcome::Retry | SessionOutcome::Interrupted
        );
        if reschedule && !self.is_shutting_down() {
            let sync = self.clone();
            let delay = self.config.sync.retry_delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                sync.push_event(SyncEvent::PeerUpdate {
                    peer: None,
                    force: false,
                });
            });
        }
    }

    async fn check_stall(self: &Arc<Self>, state: &mut ActorState) {
        let stalled = match &mut state.session {
            Some(handle) => {
                let progress = handle.progress();
                if progress != handle.last_seen.0 {
                    handle.last_seen = (progress, Instant::now());
                    false
                } else {
                    handle.last_seen.1.elapsed() >= self.config.sync.stall_interval
                }
            }
            None => false,
        };
        if stalled {
            warn!("sync session stalled without forward progress; re-selecting peer");
            self.evaluate_sync_peer(state, true).await;
        }
    }
}

/// Best-peer selection: the maximum graph state that excels the local one,
/// chosen uniformly at random among ties so equal peers share the load.
pub(crate) fn select_best(
    candidates: &[(PeerId, GraphState)],
    local: &GraphState,
) -> Option<PeerId> {
    let mut best: Option<&GraphState> = None;
    let mut ties: Vec<PeerId> = Vec::new();
    for (id, gs) in candidates {
        if !gs.excels(local) {
            continue;
        }
        match best {
            None => {
                best = Some(gs);
                ties = vec![*id];
            }
            Some(current) => {
                if gs.excels(current) {
                    best = Some(gs);
                    ties = vec![*id];
                } else if gs.equals(current) {
                    ties.push(*id);
                }
            }
        }
    }
    ties.choose(&mut rand::thread_rng()).copied()
}

pub(crate) fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
