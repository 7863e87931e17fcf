//! Concurrency-safe peer collection.
//!
//! The registry map carries its own lock, separate from the per-peer locks.
//! Records are created lazily on first contact and never removed while the
//! process runs; disconnected peers are only marked as such.

use fnv::FnvHashMap;
use libp2p::{Multiaddr, PeerId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use super::record::{PeerRecord, SessionState};
use crate::metrics;
use crate::network::rpc::RpcStatus;
use crate::network::Transport;
use crate::types::{Direction, Hash256, PeerSnapshot, ServiceFlags};

pub struct PeerRegistry {
    genesis: Hash256,
    bad_response_cap: usize,
    bad_grace: Duration,
    peers: RwLock<FnvHashMap<PeerId, Arc<PeerRecord>>>,
}

impl PeerRegistry {
    pub fn new(genesis: Hash256, bad_response_cap: usize, bad_grace: Duration) -> Arc<Self> {
        Arc::new(Self {
            genesis,
            bad_response_cap,
            bad_grace,
            peers: RwLock::new(FnvHashMap::default()),
        })
    }

    pub fn bad_grace(&self) -> Duration {
        self.bad_grace
    }

    pub async fn get(&self, id: &PeerId) -> Option<Arc<PeerRecord>> {
        self.peers.read().await.get(id).cloned()
    }

    /// Get or lazily create the record for a peer. Safe under concurrent
    /// first contact from both directions: the write lock arbitrates, and
    /// the loser adopts the record the winner inserted.
    pub async fn fetch_or_create(&self, id: PeerId) -> Arc<PeerRecord> {
        if let Some(existing) = self.get(&id).await {
            return existing;
        }
        let mut peers = self.peers.write().await;
        peers
            .entry(id)
            .or_insert_with(|| Arc::new(PeerRecord::new(id, self.genesis)))
            .clone()
    }

    /// Upsert address and direction on first contact.
    pub async fn add(
        &self,
        id: PeerId,
        address: Multiaddr,
        direction: Direction,
    ) -> Arc<PeerRecord> {
        let record = self.fetch_or_create(id).await;
        record.set_address(address, direction).await;
        record
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn all(&self) -> Vec<Arc<PeerRecord>> {
        self.peers.read().await.values().cloned().collect()
    }

    async fn in_state(&self, state: SessionState) -> Vec<Arc<PeerRecord>> {
        let mut out = Vec::new();
        for record in self.all().await {
            if record.state().await == state {
                out.push(record);
            }
        }
        out
    }

    pub async fn connected(&self) -> Vec<Arc<PeerRecord>> {
        self.in_state(SessionState::Connected).await
    }

    pub async fn connecting(&self) -> Vec<Arc<PeerRecord>> {
        self.in_state(SessionState::Connecting).await
    }

    pub async fn disconnecting(&self) -> Vec<Arc<PeerRecord>> {
        self.in_state(SessionState::Disconnecting).await
    }

    pub async fn disconnected(&self) -> Vec<Arc<PeerRecord>> {
        self.in_state(SessionState::Disconnected).await
    }

    pub async fn inbound(&self) -> Vec<Arc<PeerRecord>> {
        let mut out = Vec::new();
        for record in self.all().await {
            if record.direction().await == Direction::Inbound {
                out.push(record);
            }
        }
        out
    }

    /// Peers in an establishing or established session that the transport
    /// can actually reach.
    pub async fn active(&self, transport: &dyn Transport) -> Vec<Arc<PeerRecord>> {
        let mut out = Vec::new();
        for record in self.all().await {
            let state = record.state().await;
            let establishing =
                matches!(state, SessionState::Connected | SessionState::Connecting);
            if establishing
                && transport.is_reachable(&record.id()).await
                && !record.is_bad(self.bad_grace).await
            {
                out.push(record);
            }
        }
        out
    }

    /// Peers eligible as a sync source: active, consensus-capable and in an
    /// established session.
    pub async fn can_sync(&self, transport: &dyn Transport) -> Vec<Arc<PeerRecord>> {
        let mut out = Vec::new();
        for record in self.active(transport).await {
            if record.state().await != SessionState::Connected {
                continue;
            }
            let consensus = record
                .services()
                .await
                .map(|s| s.has(ServiceFlags::CONSENSUS))
                .unwrap_or(false);
            if consensus {
                out.push(record);
            }
        }
        out
    }

    /// Attribute a bad response to a peer, creating the record if this is
    /// somehow the first contact.
    pub async fn increment_bad_response(&self, id: &PeerId, kind: RpcStatus) {
        let record = self.fetch_or_create(*id).await;
        record.push_bad_response(kind, self.bad_response_cap).await;
        metrics::BAD_RESPONSES
            .with_label_values(&[kind.as_str()])
            .inc();
    }

    /// Read-only summaries for management surfaces.
    pub async fn snapshots(&self) -> Vec<PeerSnapshot> {
        let mut out = Vec::new();
        for record in self.all().await {
            out.push(record.snapshot(self.bad_grace).await);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::{random_peer_id, TestNet};

    fn registry() -> Arc<PeerRegistry> {
        PeerRegistry::new(Hash256::repeat_byte(1), 100, Duration::from_secs(30))
    }

    #[tokio::test]
    async fn fetch_or_create_returns_one_record_per_peer() {
        let registry = registry();
        let id = random_peer_id();
        let a = registry.fetch_or_create(id).await;
        let b = registry.fetch_or_create(id).await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn concurrent_first_contact_creates_a_single_record() {
        let registry = registry();
        let id = random_peer_id();
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(
                async move { registry.fetch_or_create(id).await },
            ));
        }
        let mut records = Vec::new();
        for task in tasks {
            records.push(task.await.unwrap());
        }
        assert_eq!(registry.len().await, 1);
        for record in &records[1..] {
            assert!(Arc::ptr_eq(&records[0], record));
        }
    }

    #[tokio::test]
    async fn state_filters_partition_peers() {
        let registry = registry();
        let connected = registry.fetch_or_create(random_peer_id()).await;
        connected.set_state(SessionState::Connected).await;
        let connecting = registry.fetch_or_create(random_peer_id()).await;
        connecting.set_state(SessionState::Connecting).await;
        registry.fetch_or_create(random_peer_id()).await;

        assert_eq!(registry.connected().await.len(), 1);
        assert_eq!(registry.connecting().await.len(), 1);
        assert_eq!(registry.disconnected().await.len(), 1);
        assert_eq!(registry.disconnecting().await.len(), 0);
    }

    #[tokio::test]
    async fn can_sync_requires_capability_reachability_and_reputation() {
        let registry = registry();
        let net = TestNet::new();
        let transport = net.transport(random_peer_id());

        // Connected, consensus-capable, reachable peer.
        let good_id = random_peer_id();
        net.mark_reachable(good_id);
        let good = registry.fetch_or_create(good_id).await;
        good.set_state(SessionState::Connected).await;
        good.apply_chain_state(
            1,
            ServiceFlags::NETWORK.with(ServiceFlags::CONSENSUS),
            Hash256::repeat_byte(1),
            Hash256::zero(),
            false,
            Default::default(),
        )
        .await;

        // Connected but without the consensus capability.
        let plain_id = random_peer_id();
        net.mark_reachable(plain_id);
        let plain = registry.fetch_or_create(plain_id).await;
        plain.set_state(SessionState::Connected).await;
        plain
            .apply_chain_state(
                1,
                ServiceFlags::NETWORK,
                Hash256::repeat_byte(1),
                Hash256::zero(),
                false,
                Default::default(),
            )
            .await;

        // Capable but flagged bad.
        let flagged_id = random_peer_id();
        net.mark_reachable(flagged_id);
        let flagged = registry.fetch_or_create(flagged_id).await;
        flagged.set_state(SessionState::Connected).await;
        flagged
            .apply_chain_state(
                1,
                ServiceFlags::CONSENSUS,
                Hash256::repeat_byte(1),
                Hash256::zero(),
                false,
                Default::default(),
            )
            .await;
        registry
            .increment_bad_response(&flagged_id, RpcStatus::StreamRead)
            .await;

        let eligible = registry.can_sync(transport.as_ref()).await;
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].id(), good_id);

        // Excluded peers come back once their record is cleared.
        flagged.reset_bad().await;
        assert_eq!(registry.can_sync(transport.as_ref()).await.len(), 2);
    }
}
