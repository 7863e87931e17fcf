//! Transport seam and the request/response protocol layer.
//!
//! Connection establishment, stream multiplexing and address resolution live
//! in an external collaborator behind the [`Transport`] trait; the sync core
//! only opens and answers streams and listens for connect/disconnect
//! notifications.

pub mod rpc;

use async_trait::async_trait;
use libp2p::{Multiaddr, PeerId};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;

use crate::types::Direction;

pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// One negotiated bidirectional byte stream.
pub type Substream = Box<dyn AsyncStream>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer {0} is not connected")]
    NotConnected(PeerId),
    #[error("dial failed: {0}")]
    Dial(String),
    #[error("stream refused: {0}")]
    StreamRefused(String),
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connected {
        peer: PeerId,
        address: Multiaddr,
        direction: Direction,
    },
    Disconnected {
        peer: PeerId,
    },
}

/// An inbound stream a peer opened towards us, tagged with the negotiated
/// protocol name.
pub struct InboundStream {
    pub peer: PeerId,
    pub protocol: String,
    pub io: Substream,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn local_peer(&self) -> PeerId;

    /// Whether the transport currently holds a live connection to the peer.
    async fn is_reachable(&self, peer: &PeerId) -> bool;

    /// Open an outbound stream negotiating the given protocol name.
    async fn open_stream(&self, peer: &PeerId, protocol: &str)
        -> Result<Substream, TransportError>;

    async fn dial(&self, address: Multiaddr) -> Result<(), TransportError>;

    fn subscribe_events(&self) -> broadcast::Receiver<TransportEvent>;

    /// Next stream opened towards us; `None` once the transport shut down.
    async fn next_inbound(&self) -> Option<InboundStream>;
}
