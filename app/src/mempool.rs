//! Interface to the transaction memory pool collaborator.

use async_trait::async_trait;
use thiserror::Error;

use crate::types::Hash256;

#[derive(Debug, Error)]
pub enum MemPoolError {
    #[error("transaction rejected: {0}")]
    Rejected(String),
    #[error("transaction failed revalidation")]
    Revalidate,
    #[error("transaction already known")]
    Duplicate,
}

#[async_trait]
pub trait MemPool: Send + Sync + 'static {
    async fn have_tx(&self, hash: &Hash256) -> bool;

    async fn get_tx(&self, hash: &Hash256) -> Option<Vec<u8>>;

    /// Fee rate of a pooled transaction, used by the relay fee filter.
    async fn fee_rate(&self, hash: &Hash256) -> Option<u64>;

    /// Validate and admit a transaction received from the network.
    async fn submit_tx(&self, data: &[u8]) -> Result<Hash256, MemPoolError>;

    async fn pending_count(&self) -> usize;

    /// Hashes of pooled transactions, capped at `limit`; served to peers
    /// polling for a mempool digest.
    async fn digest(&self, limit: usize) -> Vec<Hash256>;

    /// Smallest fee rate the pool currently admits, advertised to peers.
    async fn min_fee_rate(&self) -> u64;

    /// Drop entries that expired while the chain moved.
    async fn prune_expired(&self);

    /// Re-evaluate pool entries after the chain gained a block, readopting
    /// transactions that dropped out of the graph.
    async fn regain(&self);
}
