//! Node configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Logical network name, used to namespace protocol topics so that
    /// separate deployments never exchange sync traffic.
    pub network: String,
    pub p2p: P2pConfig,
    pub sync: SyncConfig,
    pub relay: RelayConfig,
    pub audit: AuditConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct P2pConfig {
    /// Largest encoded message accepted in either direction.
    pub max_message_size: usize,
    /// Deadline for writing an outbound request.
    pub request_timeout: Duration,
    /// Deadline for reading the status byte and response body.
    pub response_timeout: Duration,
    /// Deadline for a single inbound handler invocation.
    pub handle_timeout: Duration,
    /// Window over which reconnect attempts are counted.
    pub reconnect_window: Duration,
    /// Reconnects tolerated per window before the peer is refused.
    pub max_reconnects: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Block hashes requested per reconciliation unit.
    pub batch_size: usize,
    /// Block bodies requested per wire chunk.
    pub fetch_chunk: usize,
    /// Bad responses retained per peer before the oldest is dropped.
    pub bad_response_cap: usize,
    /// A peer stays excluded from selection for this long after its most
    /// recent bad response.
    pub bad_grace: Duration,
    /// A session without forward progress for this long forces re-selection.
    pub stall_interval: Duration,
    /// Delay before re-evaluating the sync peer after a failed session.
    pub retry_delay: Duration,
    /// Concurrent reconciliation sessions tolerated before new ones are
    /// refused. Sessions are additionally serialized by the process lock.
    pub max_sessions: usize,
    /// Broadcast-dedup entries kept per peer before age-based pruning kicks in.
    pub dedup_floor: usize,
    /// Age beyond which dedup entries above the floor are pruned.
    pub dedup_max_age: Duration,
    /// Graph-state refresh requests for one peer are coalesced within this
    /// interval.
    pub update_debounce: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Target block interval of the network; floor for the rebroadcast timer
    /// and cadence of the mempool digest poll.
    pub block_interval: Duration,
    /// Inventory items per announce message.
    pub max_inv_batch: usize,
    /// A peer polled for its mempool digest within this window is skipped.
    pub poll_suppress: Duration,
    /// Pending-backlog size that lengthens the rebroadcast interval by one
    /// block interval.
    pub backlog_unit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    pub enabled: bool,
    /// Minimum responding peers for an audit round to count.
    pub sample_floor: usize,
    /// Agreement ratio below which the node shuts down.
    pub agreement_threshold: f64,
    /// Depth of the audited block below the current tip.
    pub confirmations: u64,
    /// Time between audit rounds.
    pub interval: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            network: "main".to_string(),
            p2p: P2pConfig::default(),
            sync: SyncConfig::default(),
            relay: RelayConfig::default(),
            audit: AuditConfig::default(),
        }
    }
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            max_message_size: 1024 * 1024,
            request_timeout: Duration::from_secs(15),
            response_timeout: Duration::from_secs(45),
            handle_timeout: Duration::from_secs(30),
            reconnect_window: Duration::from_secs(60),
            max_reconnects: 6,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 2000,
            fetch_chunk: 512,
            bad_response_cap: 100,
            bad_grace: Duration::from_secs(30),
            stall_interval: Duration::from_secs(90),
            retry_delay: Duration::from_secs(2),
            max_sessions: 2,
            dedup_floor: 2000,
            dedup_max_age: Duration::from_secs(600),
            update_debounce: Duration::from_secs(5),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            block_interval: Duration::from_secs(30),
            max_inv_batch: 256,
            poll_suppress: Duration::from_secs(120),
            backlog_unit: 256,
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_floor: 5,
            agreement_threshold: 0.5,
            confirmations: 10,
            interval: Duration::from_secs(300),
        }
    }
}

impl NodeConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.network.is_empty() {
            return Err(Error::Config("network name must not be empty".into()));
        }
        if self.p2p.max_message_size == 0 {
            return Err(Error::Config("max_message_size must be non-zero".into()));
        }
        if self.sync.batch_size == 0 || self.sync.fetch_chunk == 0 {
            return Err(Error::Config("sync batch sizes must be non-zero".into()));
        }
        if self.sync.max_sessions == 0 {
            return Err(Error::Config("max_sessions must be non-zero".into()));
        }
        if !(self.audit.agreement_threshold > 0.0 && self.audit.agreement_threshold <= 1.0) {
            return Err(Error::Config(
                "audit agreement_threshold must be within (0, 1]".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(NodeConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_audit_threshold() {
        let mut config = NodeConfig::default();
        config.audit.agreement_threshold = 1.5;
        assert!(config.validate().is_err());
    }
}
