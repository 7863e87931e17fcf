//! Interface to the block storage and validation engine.
//!
//! The chain is an external collaborator: it validates and stores blocks,
//! tracks the orphan pool and answers DAG queries. The sync core only moves
//! data in and out of it and must tolerate concurrent mutation — a block may
//! become known between an orphan check and the fetch that follows it.

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{BestSnapshot, GraphState, Hash256};

/// Outcome of submitting one block, carrying the block's hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockAccept {
    /// Block was validated and connected to the graph.
    Accepted(Hash256),
    /// Parents are not yet known locally; the block went to the orphan pool.
    /// This is not a failure.
    Orphan(Hash256),
    /// Block was already known.
    Duplicate(Hash256),
}

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("unknown block {0}")]
    UnknownBlock(Hash256),
    #[error("invalid block: {0}")]
    InvalidBlock(String),
    #[error("storage failure: {0}")]
    Storage(String),
}

#[async_trait]
pub trait Chain: Send + Sync + 'static {
    fn genesis_hash(&self) -> Hash256;

    /// Best local view of the DAG.
    async fn best_snapshot(&self) -> BestSnapshot;

    /// The chain's own currency heuristic. The engine combines this with its
    /// peer view before declaring the node current.
    async fn is_current(&self) -> bool;

    async fn have_block(&self, hash: &Hash256) -> bool;

    /// Serialized block body, if present in permanent storage or the orphan
    /// pool.
    async fn get_block(&self, hash: &Hash256) -> Option<Vec<u8>>;

    /// Transaction hashes contained in a stored block; empty when unknown.
    async fn block_tx_hashes(&self, hash: &Hash256) -> Vec<Hash256>;

    /// Ordered hashes following the most recent locator entry we recognize,
    /// capped at `limit`.
    async fn locate_blocks(&self, locator: &[Hash256], limit: usize) -> Vec<Hash256>;

    /// Bounded main-chain locator anchored at the given sync point.
    async fn main_locator(&self, sync_point: &Hash256) -> Vec<Hash256>;

    /// Whether the orphan pool wants a refresh: one was requested explicitly
    /// or the pool is saturated.
    async fn orphan_refresh_due(&self) -> bool;

    async fn refresh_orphans(&self);

    /// Missing parents of the current orphan set, i.e. the hashes worth
    /// fetching next.
    async fn orphan_wants(&self) -> Vec<Hash256>;

    /// Submit a block. `from_network` marks data of remote origin so the
    /// chain can apply relay-specific acceptance rules.
    async fn accept_block(&self, data: &[u8], from_network: bool)
        -> Result<BlockAccept, ChainError>;

    /// State commitment the chain computed at the given block, if stored.
    async fn state_root_at(&self, hash: &Hash256) -> Option<Hash256>;

    /// Hash of the block `confirmations` below the current main-chain tip.
    async fn stable_block(&self, confirmations: u64) -> Option<Hash256>;

    /// Service half of the DAG-sync exchange: given the requester's locator
    /// and graph state, pick the next reconciliation unit. Returns the new
    /// sync point followed by at most `limit` block hashes.
    async fn next_sync_batch(
        &self,
        locator: &[Hash256],
        their_state: &GraphState,
        limit: usize,
    ) -> (Hash256, Vec<Hash256>);
}
