use thiserror::Error;

use crate::chain::ChainError;
use crate::mempool::MemPoolError;
use crate::network::rpc::RpcError;
use crate::network::TransportError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    MemPool(#[from] MemPoolError),
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("shutting down")]
    ShuttingDown,
}
