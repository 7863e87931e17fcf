//! Per-connection peer state.
//!
//! Fields are read and written concurrently by inbound handlers, outbound
//! senders and the sync actor, and sit behind a reader/writer lock. Session
//! state transitions are additionally serialized by a dedicated handshake
//! lock so an inbound handshake completing cannot race an asynchronous
//! disconnect notification.

use libp2p::{Multiaddr, PeerId};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{Mutex, MutexGuard, RwLock};

use crate::network::rpc::RpcStatus;
use crate::types::{
    Direction, GraphState, Hash256, NodeRecord, PeerSnapshot, ServiceFlags,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Disconnecting => "disconnecting",
        }
    }
}

/// One recorded protocol or stream failure attributed to the peer.
#[derive(Debug, Clone, Copy)]
pub struct BadResponse {
    pub seq: u64,
    pub at: Instant,
    pub kind: RpcStatus,
}

/// Set-based content filter loaded by the peer over the filter topics.
#[derive(Debug, Default, Clone)]
pub struct ContentFilter {
    elements: HashSet<Vec<u8>>,
}

impl ContentFilter {
    pub fn add(&mut self, element: Vec<u8>) {
        self.elements.insert(element);
    }

    pub fn matches(&self, element: &[u8]) -> bool {
        self.elements.contains(element)
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

/// The peer's advertised view of its own chain. Everything starts out
/// unknown; the genesis hash is seeded with ours so a record created on first
/// contact is well-formed before the handshake fills it in.
#[derive(Debug, Clone)]
struct ChainView {
    protocol_version: Option<u32>,
    services: Option<ServiceFlags>,
    genesis: Hash256,
    state_root: Option<Hash256>,
    graph_state: Option<GraphState>,
    disable_relay_tx: bool,
    metadata_seq: Option<u64>,
}

#[derive(Debug)]
struct Inner {
    address: Option<Multiaddr>,
    direction: Direction,
    state: SessionState,
    connected_since: Option<SystemTime>,
    view: ChainView,
    node_record: Option<NodeRecord>,
    bad_responses: VecDeque<BadResponse>,
    bad_seq: u64,
    debounce: HashMap<&'static str, Instant>,
    broadcast_seen: HashMap<Hash256, Instant>,
    last_send: Option<Instant>,
    last_recv: Option<Instant>,
    bytes_sent: u64,
    bytes_recv: u64,
    sync_point: Hash256,
    fee_filter: u64,
    filter: Option<ContentFilter>,
    reconnects: VecDeque<Instant>,
}

pub struct PeerRecord {
    id: PeerId,
    inner: RwLock<Inner>,
    /// Serializes connect/disconnect transitions, independent of field access.
    handshake: Mutex<()>,
}

impl PeerRecord {
    pub fn new(id: PeerId, genesis: Hash256) -> Self {
        Self {
            id,
            inner: RwLock::new(Inner {
                address: None,
                direction: Direction::Outbound,
                state: SessionState::Disconnected,
                connected_since: None,
                view: ChainView {
                    protocol_version: None,
                    services: None,
                    genesis,
                    state_root: None,
                    graph_state: None,
                    disable_relay_tx: false,
                    metadata_seq: None,
                },
                node_record: None,
                bad_responses: VecDeque::new(),
                bad_seq: 0,
                debounce: HashMap::new(),
                broadcast_seen: HashMap::new(),
                last_send: None,
                last_recv: None,
                bytes_sent: 0,
                bytes_recv: 0,
                sync_point: genesis,
                fee_filter: 0,
                filter: None,
                reconnects: VecDeque::new(),
            }),
            handshake: Mutex::new(()),
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Take the handshake lock. Held across a full connect or disconnect
    /// transition, including the network round-trips it involves.
    pub async fn lock_handshake(&self) -> MutexGuard<'_, ()> {
        self.handshake.lock().await
    }

    pub async fn state(&self) -> SessionState {
        self.inner.read().await.state
    }

    /// Transition the session state. The state and its connected-since
    /// timestamp move together under one write lock.
    pub async fn set_state(&self, state: SessionState) {
        let mut inner = self.inner.write().await;
        inner.state = state;
        match state {
            SessionState::Connected => inner.connected_since = Some(SystemTime::now()),
            SessionState::Disconnected => inner.connected_since = None,
            _ => {}
        }
    }

    pub async fn set_address(&self, address: Multiaddr, direction: Direction) {
        let mut inner = self.inner.write().await;
        inner.address = Some(address);
        inner.direction = direction;
    }

    pub async fn direction(&self) -> Direction {
        self.inner.read().await.direction
    }

    /// Record a connect attempt; false when the peer reconnects faster than
    /// the configured rate allows.
    pub async fn note_connect_attempt(&self, window: Duration, max: u32) -> bool {
        let mut inner = self.inner.write().await;
        let now = Instant::now();
        while let Some(front) = inner.reconnects.front() {
            if now.duration_since(*front) > window {
                inner.reconnects.pop_front();
            } else {
                break;
            }
        }
        inner.reconnects.push_back(now);
        inner.reconnects.len() <= max as usize
    }

    pub async fn apply_chain_state(
        &self,
        version: u32,
        services: ServiceFlags,
        genesis: Hash256,
        state_root: Hash256,
        disable_relay_tx: bool,
        graph_state: GraphState,
    ) {
        let mut inner = self.inner.write().await;
        inner.view.protocol_version = Some(version);
        inner.view.services = Some(services);
        inner.view.genesis = genesis;
        inner.view.state_root = Some(state_root);
        inner.view.disable_relay_tx = disable_relay_tx;
        inner.view.graph_state = Some(graph_state);
    }

    pub async fn update_graph_state(&self, state: GraphState) {
        self.inner.write().await.view.graph_state = Some(state);
    }

    pub async fn graph_state(&self) -> Option<GraphState> {
        self.inner.read().await.view.graph_state.clone()
    }

    pub async fn services(&self) -> Option<ServiceFlags> {
        self.inner.read().await.view.services
    }

    pub async fn protocol_version(&self) -> Option<u32> {
        self.inner.read().await.view.protocol_version
    }

    pub async fn genesis(&self) -> Hash256 {
        self.inner.read().await.view.genesis
    }

    pub async fn relay_disabled(&self) -> bool {
        self.inner.read().await.view.disable_relay_tx
    }

    pub async fn metadata_seq(&self) -> Option<u64> {
        self.inner.read().await.view.metadata_seq
    }

    pub async fn set_metadata_seq(&self, seq: u64) {
        self.inner.write().await.view.metadata_seq = Some(seq);
    }

    pub async fn node_record(&self) -> Option<NodeRecord> {
        self.inner.read().await.node_record.clone()
    }

    /// Store a node record unless we already hold one at least as new.
    pub async fn update_node_record(&self, record: NodeRecord) -> bool {
        let mut inner = self.inner.write().await;
        match &inner.node_record {
            Some(existing) if existing.seq >= record.seq => false,
            _ => {
                inner.node_record = Some(record);
                true
            }
        }
    }

    /// Append a bad response. An error with the same classification as the
    /// latest entry replaces it instead of growing the list; the list never
    /// exceeds `cap`.
    pub async fn push_bad_response(&self, kind: RpcStatus, cap: usize) {
        let mut inner = self.inner.write().await;
        inner.bad_seq += 1;
        let entry = BadResponse {
            seq: inner.bad_seq,
            at: Instant::now(),
            kind,
        };
        match inner.bad_responses.back_mut() {
            Some(last) if last.kind == kind => *last = entry,
            _ => {
                inner.bad_responses.push_back(entry);
                while inner.bad_responses.len() > cap {
                    inner.bad_responses.pop_front();
                }
            }
        }
    }

    /// A peer is bad while its most recent bad response is younger than the
    /// grace window.
    pub async fn is_bad(&self, grace: Duration) -> bool {
        let inner = self.inner.read().await;
        inner
            .bad_responses
            .back()
            .map(|last| last.at.elapsed() < grace)
            .unwrap_or(false)
    }

    pub async fn bad_response_count(&self) -> usize {
        self.inner.read().await.bad_responses.len()
    }

    pub async fn reset_bad(&self) {
        self.inner.write().await.bad_responses.clear();
    }

    /// Coalesce repeated work: true when `name` has not fired within
    /// `interval`, recording a firing.
    pub async fn debounce(&self, name: &'static str, interval: Duration) -> bool {
        let mut inner = self.inner.write().await;
        let now = Instant::now();
        match inner.debounce.get(name) {
            Some(last) if now.duration_since(*last) < interval => false,
            _ => {
                inner.debounce.insert(name, now);
                true
            }
        }
    }

    /// Record an inventory key as relayed to or received from this peer.
    /// Returns false when the key was already present. Entries above the
    /// floor size are pruned once older than `max_age`.
    pub async fn mark_broadcast(
        &self,
        key: Hash256,
        floor: usize,
        max_age: Duration,
    ) -> bool {
        let mut inner = self.inner.write().await;
        let now = Instant::now();
        if inner.broadcast_seen.len() > floor {
            inner
                .broadcast_seen
                .retain(|_, at| now.duration_since(*at) <= max_age);
        }
        inner.broadcast_seen.insert(key, now).is_none()
    }

    pub async fn has_broadcast(&self, key: &Hash256) -> bool {
        self.inner.read().await.broadcast_seen.contains_key(key)
    }

    pub async fn broadcast_len(&self) -> usize {
        self.inner.read().await.broadcast_seen.len()
    }

    pub async fn note_send(&self, bytes: u64) {
        let mut inner = self.inner.write().await;
        inner.last_send = Some(Instant::now());
        inner.bytes_sent = inner.bytes_sent.saturating_add(bytes);
    }

    pub async fn note_recv(&self, bytes: u64) {
        let mut inner = self.inner.write().await;
        inner.last_recv = Some(Instant::now());
        inner.bytes_recv = inner.bytes_recv.saturating_add(bytes);
    }

    pub async fn sync_point(&self) -> Hash256 {
        self.inner.read().await.sync_point
    }

    pub async fn set_sync_point(&self, point: Hash256) {
        self.inner.write().await.sync_point = point;
    }

    pub async fn fee_filter(&self) -> u64 {
        self.inner.read().await.fee_filter
    }

    pub async fn set_fee_filter(&self, rate: u64) {
        self.inner.write().await.fee_filter = rate;
    }

    pub async fn filter_add(&self, element: Vec<u8>) {
        let mut inner = self.inner.write().await;
        inner
            .filter
            .get_or_insert_with(ContentFilter::default)
            .add(element);
    }

    pub async fn filter_load(&self, elements: Vec<Vec<u8>>) {
        let mut filter = ContentFilter::default();
        for element in elements {
            filter.add(element);
        }
        self.inner.write().await.filter = Some(filter);
    }

    pub async fn filter_clear(&self) {
        self.inner.write().await.filter = None;
    }

    /// Apply the peer's content filter: no filter loaded means everything
    /// passes; a loaded filter passes only matching elements.
    pub async fn filter_matches(&self, element: &[u8]) -> bool {
        match &self.inner.read().await.filter {
            Some(filter) => filter.matches(element),
            None => true,
        }
    }

    pub async fn has_filter(&self) -> bool {
        self.inner.read().await.filter.is_some()
    }

    pub async fn snapshot(&self, grace: Duration) -> PeerSnapshot {
        let inner = self.inner.read().await;
        PeerSnapshot {
            id: self.id.to_string(),
            address: inner.address.as_ref().map(|a| a.to_string()),
            direction: inner.direction,
            state: inner.state.as_str().to_string(),
            protocol_version: inner.view.protocol_version,
            services: inner.view.services.map(|s| s.0),
            graph_state: inner.view.graph_state.clone(),
            bad: inner
                .bad_responses
                .back()
                .map(|last| last.at.elapsed() < grace)
                .unwrap_or(false),
            bad_responses: inner.bad_responses.len(),
            bytes_sent: inner.bytes_sent,
            bytes_recv: inner.bytes_recv,
            idle_send_secs: inner.last_send.map(|at| at.elapsed().as_secs()),
            idle_recv_secs: inner.last_recv.map(|at| at.elapsed().as_secs()),
            connected_since: inner.connected_since.and_then(|at| {
                at.duration_since(UNIX_EPOCH).ok().map(|d| d.as_secs())
            }),
            sync_point: inner.sync_point,
            fee_filter: inner.fee_filter,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::random_peer_id;

    fn record() -> PeerRecord {
        PeerRecord::new(random_peer_id(), Hash256::repeat_byte(1))
    }

    #[tokio::test]
    async fn bad_responses_stay_capped() {
        let peer = record();
        for i in 0..10 {
            // Alternate classifications so entries never merge.
            let kind = if i % 2 == 0 {
                RpcStatus::StreamRead
            } else {
                RpcStatus::Message
            };
            peer.push_bad_response(kind, 4).await;
        }
        assert_eq!(peer.bad_response_count().await, 4);
    }

    #[tokio::test]
    async fn identical_classification_merges_into_last_entry() {
        let peer = record();
        peer.push_bad_response(RpcStatus::StreamRead, 100).await;
        peer.push_bad_response(RpcStatus::StreamRead, 100).await;
        peer.push_bad_response(RpcStatus::StreamRead, 100).await;
        assert_eq!(peer.bad_response_count().await, 1);

        peer.push_bad_response(RpcStatus::Message, 100).await;
        assert_eq!(peer.bad_response_count().await, 2);
    }

    #[tokio::test]
    async fn bad_flag_respects_grace_window_and_reset() {
        let peer = record();
        assert!(!peer.is_bad(Duration::from_secs(30)).await);

        peer.push_bad_response(RpcStatus::RuleViolation, 100).await;
        assert!(peer.is_bad(Duration::from_secs(30)).await);
        // A zero-width window has already elapsed.
        assert!(!peer.is_bad(Duration::ZERO).await);

        peer.reset_bad().await;
        assert!(!peer.is_bad(Duration::from_secs(30)).await);
    }

    #[tokio::test]
    async fn connected_since_moves_with_state() {
        let peer = record();
        assert!(peer.snapshot(Duration::from_secs(30)).await.connected_since.is_none());

        peer.set_state(SessionState::Connected).await;
        assert!(peer.snapshot(Duration::from_secs(30)).await.connected_since.is_some());

        peer.set_state(SessionState::Disconnected).await;
        assert!(peer.snapshot(Duration::from_secs(30)).await.connected_since.is_none());
    }

    #[tokio::test]
    async fn debounce_coalesces_within_interval() {
        let peer = record();
        assert!(peer.debounce("update", Duration::from_secs(60)).await);
        assert!(!peer.debounce("update", Duration::from_secs(60)).await);
        // Different task names do not interfere.
        assert!(peer.debounce("mempool", Duration::from_secs(60)).await);
        // A zero interval always fires.
        assert!(peer.debounce("update", Duration::ZERO).await);
    }

    #[tokio::test]
    async fn broadcast_dedup_is_idempotent() {
        let peer = record();
        let key = Hash256::repeat_byte(9);
        assert!(peer.mark_broadcast(key, 100, Duration::from_secs(60)).await);
        assert!(!peer.mark_broadcast(key, 100, Duration::from_secs(60)).await);
        assert!(peer.has_broadcast(&key).await);
    }

    #[tokio::test]
    async fn broadcast_dedup_prunes_old_entries_above_floor() {
        let peer = record();
        for i in 0..8u8 {
            peer.mark_broadcast(Hash256::repeat_byte(i), 4, Duration::ZERO)
                .await;
        }
        // With a zero max age everything above the floor was pruned along
        // the way; the newest insertion is always retained.
        assert!(peer.broadcast_len().await <= 5);
    }

    #[tokio::test]
    async fn reconnect_rate_is_bounded() {
        let peer = record();
        assert!(peer.note_connect_attempt(Duration::from_secs(60), 2).await);
        assert!(peer.note_connect_attempt(Duration::from_secs(60), 2).await);
        assert!(!peer.note_connect_attempt(Duration::from_secs(60), 2).await);
    }

    #[tokio::test]
    async fn node_record_rejects_stale_sequences() {
        let peer = record();
        assert!(
            peer.update_node_record(NodeRecord {
                seq: 5,
                payload: vec![1]
            })
            .await
        );
        assert!(
            !peer
                .update_node_record(NodeRecord {
                    seq: 4,
                    payload: vec![2]
                })
                .await
        );
        assert_eq!(peer.node_record().await.unwrap().seq, 5);
    }

    #[tokio::test]
    async fn content_filter_semantics() {
        let peer = record();
        // No filter loaded: everything matches.
        assert!(peer.filter_matches(b"anything").await);

        peer.filter_load(vec![b"abc".to_vec()]).await;
        assert!(peer.filter_matches(b"abc").await);
        assert!(!peer.filter_matches(b"def").await);

        peer.filter_add(b"def".to_vec()).await;
        assert!(peer.filter_matches(b"def").await);

        peer.filter_clear().await;
        assert!(peer.filter_matches(b"def").await);
    }
}
