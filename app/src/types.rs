use serde::{Deserialize, Serialize};
use ssz_derive::{Decode, Encode};

pub use ethereum_types::H256 as Hash256;

/// Protocol version spoken by this node.
pub const PROTOCOL_VERSION: u32 = 1;
/// Oldest protocol version we still accept from a peer.
pub const MIN_PROTOCOL_VERSION: u32 = 1;
/// Upper bound on the number of tips a peer may advertise in one graph state.
pub const MAX_TIPS: usize = 64;

/// Service capability bits advertised during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServiceFlags(pub u64);

impl ServiceFlags {
    /// Serves the block graph.
    pub const NETWORK: ServiceFlags = ServiceFlags(1);
    /// Participates in DAG consensus and may act as a sync source.
    pub const CONSENSUS: ServiceFlags = ServiceFlags(1 << 1);
    /// Relays transactions.
    pub const RELAY: ServiceFlags = ServiceFlags(1 << 2);

    pub fn has(&self, other: ServiceFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn with(self, other: ServiceFlags) -> ServiceFlags {
        ServiceFlags(self.0 | other.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Compact summary of a node's DAG knowledge, exchanged during handshake and
/// sync and used to rank peers against each other.
#[derive(Debug, Clone, PartialEq, Eq, Default, Encode, Decode, Serialize, Deserialize)]
pub struct GraphState {
    /// Total number of blocks known to the node.
    pub total: u64,
    /// Number of DAG layers.
    pub layer: u64,
    /// Height of the main chain.
    pub main_height: u64,
    /// Order of the main-chain tip.
    pub main_order: u64,
    /// Current frontier blocks. Bounded by [`MAX_TIPS`] at the wire boundary.
    pub tips: Vec<Hash256>,
}

impl GraphState {
    /// Whether this state is strictly ahead of `other`: more blocks in total,
    /// or the same total with a higher main-chain order.
    pub fn excels(&self, other: &GraphState) -> bool {
        self.total > other.total || (self.total == other.total && self.main_order > other.main_order)
    }

    /// Whether both states rank the same for peer selection.
    pub fn equals(&self, other: &GraphState) -> bool {
        self.total == other.total && self.main_order == other.main_order
    }
}

/// Local chain view at a point in time, as reported by the chain collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BestSnapshot {
    pub hash: Hash256,
    pub height: u64,
    pub order: u64,
    pub total: u64,
    pub layer: u64,
    pub state_root: Hash256,
    pub tips: Vec<Hash256>,
}

impl BestSnapshot {
    pub fn graph_state(&self) -> GraphState {
        GraphState {
            total: self.total,
            layer: self.layer,
            main_height: self.height,
            main_order: self.order,
            tips: self.tips.clone(),
        }
    }
}

/// Signed node descriptor exchanged over the node-record topic. The payload is
/// opaque to the sync core; only the sequence number is interpreted, so stale
/// records can be rejected without understanding the contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub seq: u64,
    pub payload: Vec<u8>,
}

/// Read-only per-peer summary exported for management surfaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerSnapshot {
    pub id: String,
    pub address: Option<String>,
    pub direction: Direction,
    pub state: String,
    pub protocol_version: Option<u32>,
    pub services: Option<u64>,
    pub graph_state: Option<GraphState>,
    pub bad: bool,
    pub bad_responses: usize,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    /// Seconds since the last message went to this peer.
    pub idle_send_secs: Option<u64>,
    /// Seconds since the last message arrived from this peer.
    pub idle_recv_secs: Option<u64>,
    pub connected_since: Option<u64>,
    pub sync_point: Hash256,
    pub fee_filter: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(total: u64, order: u64) -> GraphState {
        GraphState {
            total,
            layer: total,
            main_height: total,
            main_order: order,
            tips: vec![],
        }
    }

    #[test]
    fn excels_is_irreflexive() {
        let a = state(10, 10);
        assert!(!a.excels(&a));
    }

    #[test]
    fn excels_prefers_total_then_order() {
        let small = state(5, 100);
        let large = state(6, 0);
        assert!(large.excels(&small));
        assert!(!small.excels(&large));

        let low = state(6, 1);
        let high = state(6, 2);
        assert!(high.excels(&low));
        assert!(!low.excels(&high));
    }

    #[test]
    fn equal_states_exclude_excels_in_both_directions() {
        let a = state(7, 3);
        let b = state(7, 3);
        assert!(a.equals(&b));
        assert!(!a.excels(&b));
        assert!(!b.excels(&a));
    }

    #[test]
    fn service_flags_contain_subsets() {
        let flags = ServiceFlags::NETWORK.with(ServiceFlags::CONSENSUS);
        assert!(flags.has(ServiceFlags::NETWORK));
        assert!(flags.has(ServiceFlags::CONSENSUS));
        assert!(!flags.has(ServiceFlags::RELAY));
    }
}
