//! In-memory Chain/MemPool implementations and a loopback transport hub.
//!
//! Two nodes built over the same [`TestNet`] exchange real protocol traffic
//! through paired duplex streams, which keeps the full router/codec path in
//! play for integration tests and dev mode.

use async_trait::async_trait;
use libp2p::{Multiaddr, PeerId};
use ssz::{Decode, Encode};
use ssz_derive::{Decode, Encode};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::Hasher;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{broadcast, mpsc, Mutex};

use crate::chain::{BlockAccept, Chain, ChainError};
use crate::mempool::{MemPool, MemPoolError};
use crate::network::{
    InboundStream, Substream, Transport, TransportError, TransportEvent,
};
use crate::types::{BestSnapshot, Direction, GraphState, Hash256};

/// Random peer id built as a raw sha2-256 multihash, sidestepping the
/// key-generation features of the identity crate.
pub fn random_peer_id() -> PeerId {
    let digest: [u8; 32] = rand::random();
    let mut encoded = Vec::with_capacity(34);
    encoded.push(0x12);
    encoded.push(32);
    encoded.extend_from_slice(&digest);
    PeerId::from_bytes(&encoded).expect("valid sha2-256 multihash")
}

/// Deterministic content hash for mock data.
pub fn mock_hash(data: &[u8]) -> Hash256 {
    let mut out = [0u8; 32];
    for (i, chunk) in out.chunks_mut(8).enumerate() {
        let mut hasher = DefaultHasher::new();
        hasher.write_u64(i as u64);
        hasher.write(data);
        chunk.copy_from_slice(&hasher.finish().to_le_bytes());
    }
    Hash256::from_slice(&out)
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct MockBlock {
    pub parent: Hash256,
    pub seq: u64,
    pub payload: Vec<u8>,
}

impl MockBlock {
    pub fn hash(&self) -> Hash256 {
        mock_hash(&self.as_ssz_bytes())
    }
}

struct StoredBlock {
    data: Vec<u8>,
    parent: Hash256,
}

struct ChainInner {
    blocks: HashMap<Hash256, StoredBlock>,
    /// Arrival-linearized main chain, genesis first.
    order: Vec<Hash256>,
    orphans: HashMap<Hash256, Vec<u8>>,
    refresh_requested: bool,
}

/// In-memory chain. Instances built with the same parameters produce
/// identical block hashes, so two nodes share a history prefix.
pub struct MemChain {
    genesis: Hash256,
    state_salt: u8,
    current: AtomicBool,
    inner: StdMutex<ChainInner>,
}

impl MemChain {
    pub fn new() -> Arc<Self> {
        Self::custom(Vec::new(), 0)
    }

    /// A chain whose genesis differs from the default network's.
    pub fn with_genesis(genesis_payload: Vec<u8>) -> Arc<Self> {
        Self::custom(genesis_payload, 0)
    }

    /// Same blocks as the default chain, but a diverging state commitment.
    pub fn with_salted_blocks(count: u64, state_salt: u8) -> Arc<Self> {
        let chain = Self::custom(Vec::new(), state_salt);
        chain.extend(count);
        chain
    }

    fn custom(genesis_payload: Vec<u8>, state_salt: u8) -> Arc<Self> {
        let genesis_block = MockBlock {
            parent: Hash256::zero(),
            seq: 0,
            payload: genesis_payload,
        };
        let genesis = genesis_block.hash();
        let mut blocks = HashMap::new();
        blocks.insert(
            genesis,
            StoredBlock {
                data: genesis_block.as_ssz_bytes(),
                parent: Hash256::zero(),
            },
        );
        Arc::new(Self {
            genesis,
            state_salt,
            current: AtomicBool::new(true),
            inner: StdMutex::new(ChainInner {
                blocks,
                order: vec![genesis],
                orphans: HashMap::new(),
                refresh_requested: false,
            }),
        })
    }

    /// Deterministically extend the main chain by `count` blocks.
    pub fn with_blocks(count: u64) -> Arc<Self> {
        let chain = Self::new();
        chain.extend(count);
        chain
    }

    pub fn extend(&self, count: u64) {
        let mut inner = self.inner.lock().expect("poisoned chain lock");
        for _ in 0..count {
            let parent = *inner.order.last().expect("order never empty");
            let seq = inner.order.len() as u64;
            let block = MockBlock {
                parent,
                seq,
                payload: Vec::new(),
            };
            let hash = block.hash();
            inner.blocks.insert(
                hash,
                StoredBlock {
                    data: block.as_ssz_bytes(),
                    parent,
                },
            );
            inner.order.push(hash);
        }
    }

    pub fn set_current(&self, current: bool) {
        self.current.store(current, Ordering::Relaxed);
    }

    pub fn block_at(&self, index: usize) -> Option<Hash256> {
        self.inner
            .lock()
            .expect("poisoned chain lock")
            .order
            .get(index)
            .copied()
    }

    pub fn orphan_count(&self) -> usize {
        self.inner.lock().expect("poisoned chain lock").orphans.len()
    }

    fn promote_orphans(inner: &mut ChainInner) {
        loop {
            let ready: Vec<Hash256> = inner
                .orphans
                .iter()
                .filter_map(|(hash, data)| {
                    MockBlock::from_ssz_bytes(data)
                        .ok()
                        .filter(|block| inner.blocks.contains_key(&block.parent))
                        .map(|_| *hash)
                })
                .collect();
            if ready.is_empty() {
                break;
            }
            for hash in ready {
                let data = inner.orphans.remove(&hash).expect("orphan present");
                let block = MockBlock::from_ssz_bytes(&data).expect("orphan decodes");
                inner.blocks.insert(
                    hash,
                    StoredBlock {
                        data,
                        parent: block.parent,
                    },
                );
                inner.order.push(hash);
            }
        }
    }
}

#[async_trait]
impl Chain for MemChain {
    fn genesis_hash(&self) -> Hash256 {
        self.genesis
    }

    async fn best_snapshot(&self) -> BestSnapshot {
        let inner = self.inner.lock().expect("poisoned chain lock");
        let tip = *inner.order.last().expect("order never empty");
        let total = inner.order.len() as u64;
        let mut root_input = tip.as_bytes().to_vec();
        root_input.push(self.state_salt);
        BestSnapshot {
            hash: tip,
            height: total - 1,
            order: total - 1,
            total,
            layer: total - 1,
            state_root: mock_hash(&root_input),
            tips: vec![tip],
        }
    }

    async fn is_current(&self) -> bool {
        self.current.load(Ordering::Relaxed)
    }

    async fn have_block(&self, hash: &Hash256) -> bool {
        let inner = self.inner.lock().expect("poisoned chain lock");
        inner.blocks.contains_key(hash) || inner.orphans.contains_key(hash)
    }

    async fn get_block(&self, hash: &Hash256) -> Option<Vec<u8>> {
        let inner = self.inner.lock().expect("poisoned chain lock");
        inner
            .blocks
            .get(hash)
            .map(|stored| stored.data.clone())
            .or_else(|| inner.orphans.get(hash).cloned())
    }

    async fn block_tx_hashes(&self, hash: &Hash256) -> Vec<Hash256> {
        let Some(data) = self.get_block(hash).await else {
            return Vec::new();
        };
        let Ok(block) = MockBlock::from_ssz_bytes(&data) else {
            return Vec::new();
        };
        block
            .payload
            .chunks_exact(32)
            .map(Hash256::from_slice)
            .collect()
    }

    async fn locate_blocks(&self, locator: &[Hash256], limit: usize) -> Vec<Hash256> {
        let inner = self.inner.lock().expect("poisoned chain lock");
        let fork = locator
            .iter()
            .filter_map(|hash| inner.order.iter().position(|h| h == hash))
            .max()
            .unwrap_or(0);
        inner
            .order
            .iter()
            .skip(fork + 1)
            .take(limit)
            .copied()
            .collect()
    }

    async fn main_locator(&self, sync_point: &Hash256) -> Vec<Hash256> {
        let inner = self.inner.lock().expect("poisoned chain lock");
        let tip = *inner.order.last().expect("order never empty");
        let mut locator = vec![tip];
        if *sync_point != tip && inner.order.contains(sync_point) {
            locator.push(*sync_point);
        }
        if *locator.last().expect("non-empty") != self.genesis {
            locator.push(self.genesis);
        }
        locator
    }

    async fn orphan_refresh_due(&self) -> bool {
        let inner = self.inner.lock().expect("poisoned chain lock");
        inner.refresh_requested || inner.orphans.len() > 32
    }

    async fn refresh_orphans(&self) {
        let mut inner = self.inner.lock().expect("poisoned chain lock");
        inner.refresh_requested = false;
        Self::promote_orphans(&mut inner);
    }

    async fn orphan_wants(&self) -> Vec<Hash256> {
        let inner = self.inner.lock().expect("poisoned chain lock");
        let mut wants = Vec::new();
        for data in inner.orphans.values() {
            if let Ok(block) = MockBlock::from_ssz_bytes(data) {
                if !inner.blocks.contains_key(&block.parent)
                    && !inner.orphans.contains_key(&block.parent)
                    && !wants.contains(&block.parent)
                {
                    wants.push(block.parent);
                }
            }
        }
        wants
    }

    async fn accept_block(
        &self,
        data: &[u8],
        _from_network: bool,
    ) -> Result<BlockAccept, ChainError> {
        let block = MockBlock::from_ssz_bytes(data)
            .map_err(|_| ChainError::InvalidBlock("undecodable block".into()))?;
        if block.payload.as_slice() == b"invalid" {
            return Err(ChainError::InvalidBlock("poison block".into()));
        }
        let hash = mock_hash(data);

        let mut inner = self.inner.lock().expect("poisoned chain lock");
        if inner.blocks.contains_key(&hash) {
            return Ok(BlockAccept::Duplicate(hash));
        }
        if inner.orphans.contains_key(&hash) {
            return Ok(BlockAccept::Duplicate(hash));
        }
        if inner.blocks.contains_key(&block.parent) {
            inner.blocks.insert(
                hash,
                StoredBlock {
                    data: data.to_vec(),
                    parent: block.parent,
                },
            );
            inner.order.push(hash);
            Self::promote_orphans(&mut inner);
            Ok(BlockAccept::Accepted(hash))
        } else {
            inner.orphans.insert(hash, data.to_vec());
            inner.refresh_requested = true;
            Ok(BlockAccept::Orphan(hash))
        }
    }

    async fn state_root_at(&self, hash: &Hash256) -> Option<Hash256> {
        let inner = self.inner.lock().expect("poisoned chain lock");
        if !inner.blocks.contains_key(hash) {
            return None;
        }
        let mut input = hash.as_bytes().to_vec();
        input.push(self.state_salt);
        Some(mock_hash(&input))
    }

    async fn stable_block(&self, confirmations: u64) -> Option<Hash256> {
        let inner = self.inner.lock().expect("poisoned chain lock");
        let len = inner.order.len() as u64;
        if len <= confirmations {
            return None;
        }
        inner.order.get((len - 1 - confirmations) as usize).copied()
    }

    async fn next_sync_batch(
        &self,
        locator: &[Hash256],
        _their_state: &GraphState,
        limit: usize,
    ) -> (Hash256, Vec<Hash256>) {
        let inner = self.inner.lock().expect("poisoned chain lock");
        let fork = locator
            .iter()
            .filter_map(|hash| inner.order.iter().position(|h| h == hash))
            .max()
            .unwrap_or(0);
        let hashes: Vec<Hash256> = inner
            .order
            .iter()
            .skip(fork + 1)
            .take(limit)
            .copied()
            .collect();
        (inner.order[fork], hashes)
    }
}

struct PoolInner {
    txs: HashMap<Hash256, (Vec<u8>, u64)>,
}

pub struct MockMemPool {
    min_fee: AtomicU64,
    regains: AtomicU64,
    prunes: AtomicU64,
    inner: StdMutex<PoolInner>,
}

impl MockMemPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            min_fee: AtomicU64::new(0),
            regains: AtomicU64::new(0),
            prunes: AtomicU64::new(0),
            inner: StdMutex::new(PoolInner {
                txs: HashMap::new(),
            }),
        })
    }

    /// Insert a transaction as if submitted locally; returns its hash.
    pub fn add_local(&self, data: &[u8], fee_rate: u64) -> Hash256 {
        let hash = mock_hash(data);
        self.inner
            .lock()
            .expect("poisoned pool lock")
            .txs
            .insert(hash, (data.to_vec(), fee_rate));
        hash
    }

    pub fn remove(&self, hash: &Hash256) {
        self.inner.lock().expect("poisoned pool lock").txs.remove(hash);
    }

    pub fn set_min_fee(&self, fee: u64) {
        self.min_fee.store(fee, Ordering::Relaxed);
    }

    pub fn regain_count(&self) -> u64 {
        self.regains.load(Ordering::Relaxed)
    }

    pub fn prune_count(&self) -> u64 {
        self.prunes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl MemPool for MockMemPool {
    async fn have_tx(&self, hash: &Hash256) -> bool {
        self.inner
            .lock()
            .expect("poisoned pool lock")
            .txs
            .contains_key(hash)
    }

    async fn get_tx(&self, hash: &Hash256) -> Option<Vec<u8>> {
        self.inner
            .lock()
            .expect("poisoned pool lock")
            .txs
            .get(hash)
            .map(|(data, _)| data.clone())
    }

    async fn fee_rate(&self, hash: &Hash256) -> Option<u64> {
        self.inner
            .lock()
            .expect("poisoned pool lock")
            .txs
            .get(hash)
            .map(|(_, fee)| *fee)
    }

    async fn submit_tx(&self, data: &[u8]) -> Result<Hash256, MemPoolError> {
        if data == b"bad-tx" {
            return Err(MemPoolError::Rejected("poison transaction".into()));
        }
        if data == b"stale-tx" {
            return Err(MemPoolError::Revalidate);
        }
        let hash = mock_hash(data);
        let mut inner = self.inner.lock().expect("poisoned pool lock");
        if inner.txs.contains_key(&hash) {
            return Err(MemPoolError::Duplicate);
        }
        inner.txs.insert(hash, (data.to_vec(), 1));
        Ok(hash)
    }

    async fn pending_count(&self) -> usize {
        self.inner.lock().expect("poisoned pool lock").txs.len()
    }

    async fn digest(&self, limit: usize) -> Vec<Hash256> {
        self.inner
            .lock()
            .expect("poisoned pool lock")
            .txs
            .keys()
            .take(limit)
            .copied()
            .collect()
    }

    async fn min_fee_rate(&self) -> u64 {
        self.min_fee.load(Ordering::Relaxed)
    }

    async fn prune_expired(&self) {
        self.prunes.fetch_add(1, Ordering::Relaxed);
    }

    async fn regain(&self) {
        self.regains.fetch_add(1, Ordering::Relaxed);
    }
}

struct NodeSlot {
    inbound_tx: mpsc::UnboundedSender<InboundStream>,
    events_tx: broadcast::Sender<TransportEvent>,
}

#[derive(Default)]
struct NetInner {
    slots: HashMap<PeerId, NodeSlot>,
    links: HashSet<(PeerId, PeerId)>,
    reachable: HashSet<PeerId>,
    next_addr: u64,
}

/// Shared hub wiring loopback transports together.
pub struct TestNet {
    inner: StdMutex<NetInner>,
}

impl TestNet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: StdMutex::new(NetInner::default()),
        })
    }

    fn link_key(a: PeerId, b: PeerId) -> (PeerId, PeerId) {
        if a < b {
            (a, b)
        } else {
            (b, a)
        }
    }

    pub fn transport(self: &Arc<Self>, id: PeerId) -> Arc<LoopbackTransport> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(64);
        self.inner.lock().expect("poisoned net lock").slots.insert(
            id,
            NodeSlot {
                inbound_tx,
                events_tx: events_tx.clone(),
            },
        );
        Arc::new(LoopbackTransport {
            net: self.clone(),
            id,
            inbound_rx: Mutex::new(inbound_rx),
            events_tx,
        })
    }

    /// Mark a peer reachable without wiring a full link (registry tests).
    pub fn mark_reachable(&self, id: PeerId) {
        self.inner
            .lock()
            .expect("poisoned net lock")
            .reachable
            .insert(id);
    }

    /// Establish a bidirectional link; `a` is the dialer.
    pub fn connect(&self, a: PeerId, b: PeerId) {
        let mut inner = self.inner.lock().expect("poisoned net lock");
        inner.links.insert(Self::link_key(a, b));
        inner.next_addr += 1;
        let address: Multiaddr = format!("/memory/{}", inner.next_addr)
            .parse()
            .expect("valid memory multiaddr");
        if let Some(slot) = inner.slots.get(&a) {
            let _ = slot.events_tx.send(TransportEvent::Connected {
                peer: b,
                address: address.clone(),
                direction: Direction::Outbound,
            });
        }
        if let Some(slot) = inner.slots.get(&b) {
            let _ = slot.events_tx.send(TransportEvent::Connected {
                peer: a,
                address,
                direction: Direction::Inbound,
            });
        }
    }

    pub fn disconnect(&self, a: PeerId, b: PeerId) {
        let mut inner = self.inner.lock().expect("poisoned net lock");
        inner.links.remove(&Self::link_key(a, b));
        if let Some(slot) = inner.slots.get(&a) {
            let _ = slot.events_tx.send(TransportEvent::Disconnected { peer: b });
        }
        if let Some(slot) = inner.slots.get(&b) {
            let _ = slot.events_tx.send(TransportEvent::Disconnected { peer: a });
        }
    }

    fn linked(&self, a: PeerId, b: PeerId) -> bool {
        self.inner
            .lock()
            .expect("poisoned net lock")
            .links
            .contains(&Self::link_key(a, b))
    }
}

pub struct LoopbackTransport {
    net: Arc<TestNet>,
    id: PeerId,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<InboundStream>>,
    events_tx: broadcast::Sender<TransportEvent>,
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn local_peer(&self) -> PeerId {
        self.id
    }

    async fn is_reachable(&self, peer: &PeerId) -> bool {
        if self.net.linked(self.id, *peer) {
            return true;
        }
        self.net
            .inner
            .lock()
            .expect("poisoned net lock")
            .reachable
            .contains(peer)
    }

    async fn open_stream(
        &self,
        peer: &PeerId,
        protocol: &str,
    ) -> Result<Substream, TransportError> {
        if !self.is_reachable(peer).await {
            return Err(TransportError::NotConnected(*peer));
        }
        let inner = self.net.inner.lock().expect("poisoned net lock");
        let slot = inner
            .slots
            .get(peer)
            .ok_or(TransportError::NotConnected(*peer))?;
        let (near, far) = tokio::io::duplex(1 << 20);
        slot.inbound_tx
            .send(InboundStream {
                peer: self.id,
                protocol: protocol.to_string(),
                io: Box::new(far),
            })
            .map_err(|_| TransportError::StreamRefused("peer went away".into()))?;
        Ok(Box::new(near))
    }

    async fn dial(&self, address: Multiaddr) -> Result<(), TransportError> {
        Err(TransportError::Dial(format!(
            "loopback transport cannot dial {address}"
        )))
    }

    fn subscribe_events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events_tx.subscribe()
    }

    async fn next_inbound(&self) -> Option<InboundStream> {
        self.inbound_rx.lock().await.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn identical_chains_share_hashes() {
        let a = MemChain::with_blocks(10);
        let b = MemChain::with_blocks(10);
        assert_eq!(a.genesis_hash(), b.genesis_hash());
        assert_eq!(a.best_snapshot().await, b.best_snapshot().await);
    }

    #[tokio::test]
    async fn accept_extends_and_orphans() {
        let ahead = MemChain::with_blocks(3);
        let behind = MemChain::with_blocks(1);

        // Block 2's parent (block 1) is known: accepted.
        let block2 = ahead.block_at(2).unwrap();
        let data = ahead.get_block(&block2).await.unwrap();
        assert!(matches!(
            behind.accept_block(&data, true).await.unwrap(),
            BlockAccept::Accepted(_)
        ));

        // Re-submission is a duplicate.
        assert!(matches!(
            behind.accept_block(&data, true).await.unwrap(),
            BlockAccept::Duplicate(_)
        ));

        // A block with an unknown parent goes to the orphan pool, and its
        // missing parent shows up as a want.
        let future = MockBlock {
            parent: Hash256::repeat_byte(0xEE),
            seq: 99,
            payload: Vec::new(),
        };
        assert!(matches!(
            behind
                .accept_block(&future.as_ssz_bytes(), true)
                .await
                .unwrap(),
            BlockAccept::Orphan(_)
        ));
        assert_eq!(behind.orphan_wants().await, vec![future.parent]);
    }

    #[tokio::test]
    async fn orphans_promote_once_parent_arrives() {
        let ahead = MemChain::with_blocks(3);
        let behind = MemChain::with_blocks(1);

        let block3 = ahead.block_at(3).unwrap();
        let data3 = ahead.get_block(&block3).await.unwrap();
        assert!(matches!(
            behind.accept_block(&data3, true).await.unwrap(),
            BlockAccept::Orphan(_)
        ));
        assert_eq!(behind.orphan_count(), 1);

        let block2 = ahead.block_at(2).unwrap();
        let data2 = ahead.get_block(&block2).await.unwrap();
        assert!(matches!(
            behind.accept_block(&data2, true).await.unwrap(),
            BlockAccept::Accepted(_)
        ));
        assert_eq!(behind.orphan_count(), 0);
        assert_eq!(behind.best_snapshot().await.total, 4);
    }

    #[tokio::test]
    async fn next_sync_batch_resumes_from_fork() {
        let chain = MemChain::with_blocks(5);
        let locator = vec![chain.block_at(2).unwrap()];
        let (sync_point, hashes) = chain
            .next_sync_batch(&locator, &GraphState::default(), 100)
            .await;
        assert_eq!(sync_point, chain.block_at(2).unwrap());
        assert_eq!(hashes.len(), 3);
        assert_eq!(hashes[0], chain.block_at(3).unwrap());
    }

    #[tokio::test]
    async fn loopback_streams_carry_bytes() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let net = TestNet::new();
        let a = random_peer_id();
        let b = random_peer_id();
        let ta = net.transport(a);
        let tb = net.transport(b);
        net.connect(a, b);

        let mut stream = ta.open_stream(&b, "/test/1").await.unwrap();
        stream.write_all(b"hello").await.unwrap();
        stream.shutdown().await.unwrap();

        let inbound = tb.next_inbound().await.unwrap();
        assert_eq!(inbound.peer, a);
        assert_eq!(inbound.protocol, "/test/1");
        let mut buf = Vec::new();
        let mut io = inbound.io;
        io.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"hello");
    }
}
