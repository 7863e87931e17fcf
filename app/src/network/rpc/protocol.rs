//! Topic catalog, protocol naming and the wire status/error taxonomy.

use strum::{AsRefStr, Display, EnumIter, EnumString, IntoStaticStr};
use thiserror::Error;

use crate::network::TransportError;

/// The protocol prefix for all sync topics.
pub const PROTOCOL_PREFIX: &str = "/weave/sync/req";

/// Logical request/response (or one-way) exchanges spoken by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, AsRefStr, Display, IntoStaticStr, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum Topic {
    /// Handshake: chain/graph state exchange. Network-stable.
    ChainState,
    /// Reason-coded session teardown. Network-stable.
    Goodbye,
    /// Liveness probe carrying the sender's metadata sequence.
    Ping,
    /// Node metadata (sequence + services).
    MetaData,
    /// Locator-based block hash listing.
    GetBlocks,
    /// Block body batch fetch.
    BlockDatas,
    /// DAG locator sync: next reconciliation unit.
    SyncDag,
    /// Inventory announcement.
    Inventory,
    /// Graph state exchange outside the handshake.
    GraphState,
    /// Signed node descriptor exchange.
    NodeRecord,
    /// State root at a specific block, used by the consistency audit.
    StateRoot,
    /// Filtered block with matched transactions.
    MerkleBlock,
    FilterAdd,
    FilterClear,
    FilterLoad,
    /// Minimum relay fee advertisement.
    FeeFilter,
    /// Mempool digest poll.
    MemPool,
    /// Generic inventory data fetch.
    GetData,
    /// Transaction batch fetch.
    Txs,
}

impl Topic {
    pub fn version_string(&self) -> &'static str {
        "1"
    }

    /// Whether the requester writes a body before closing its write side.
    pub fn has_request_body(&self) -> bool {
        !matches!(self, Topic::MetaData | Topic::MemPool | Topic::FilterClear)
    }

    /// Whether a successful response carries a body. One-way topics are
    /// acknowledged with a bare status byte.
    pub fn has_response_body(&self) -> bool {
        !matches!(
            self,
            Topic::Goodbye
                | Topic::Inventory
                | Topic::FilterAdd
                | Topic::FilterClear
                | Topic::FilterLoad
                | Topic::FeeFilter
        )
    }

    /// Topics a peer may use before completing the handshake.
    pub fn allowed_before_handshake(&self) -> bool {
        matches!(
            self,
            Topic::ChainState | Topic::Goodbye | Topic::Ping | Topic::MetaData
        )
    }

    /// Full protocol name for a logical network. Goodbye and chain-state stay
    /// stable across networks so a mismatched peer can still be told why it
    /// is being rejected.
    pub fn protocol_name(&self, network: &str) -> String {
        match self {
            Topic::ChainState | Topic::Goodbye => {
                format!("{}/{}/{}", PROTOCOL_PREFIX, self.as_ref(), self.version_string())
            }
            _ => format!(
                "{}/{}/{}/{}",
                PROTOCOL_PREFIX,
                network,
                self.as_ref(),
                self.version_string()
            ),
        }
    }

    pub fn from_protocol_name(network: &str, name: &str) -> Option<Topic> {
        use strum::IntoEnumIterator;
        Topic::iter().find(|topic| topic.protocol_name(network) == name)
    }

    /// Largest accepted request body for this topic, before compression.
    pub fn max_request_len(&self, max_message_size: usize) -> usize {
        match self {
            // Hash lists and locators need far less room than block bodies.
            Topic::GetBlocks | Topic::SyncDag | Topic::GetData | Topic::Txs | Topic::Inventory => {
                max_message_size / 4
            }
            Topic::ChainState
            | Topic::GraphState
            | Topic::Goodbye
            | Topic::Ping
            | Topic::StateRoot
            | Topic::MerkleBlock
            | Topic::FeeFilter
            | Topic::BlockDatas => max_message_size / 4,
            Topic::FilterAdd | Topic::FilterLoad | Topic::NodeRecord => max_message_size / 8,
            Topic::MetaData | Topic::MemPool | Topic::FilterClear => 0,
        }
    }

    /// Largest accepted response body for this topic, before compression.
    pub fn max_response_len(&self, max_message_size: usize) -> usize {
        match self {
            // Block bodies and transaction batches may fill a whole message.
            Topic::BlockDatas | Topic::GetData | Topic::Txs | Topic::MerkleBlock => {
                max_message_size
            }
            _ => max_message_size / 4,
        }
    }
}

/// One-byte status code framing every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RpcStatus {
    Success = 0,
    /// Recognized request answered from a diverging DAG view. Soft: the
    /// response payload is still valid.
    DagConsensus = 1,
    StreamWrite = 2,
    StreamRead = 3,
    StreamBase = 4,
    /// Peer spoke a post-handshake topic before completing the handshake.
    PeerUnknown = 5,
    /// Malformed message.
    Message = 6,
    RuleViolation = 7,
    /// Peer reconnected too frequently.
    ConnectFrequent = 8,
    /// Ping/metadata sequence went backwards.
    SequenceMismatch = 9,
    /// Transaction failed revalidation.
    Revalidate = 10,
}

impl RpcStatus {
    pub fn from_u8(value: u8) -> Option<RpcStatus> {
        match value {
            0 => Some(RpcStatus::Success),
            1 => Some(RpcStatus::DagConsensus),
            2 => Some(RpcStatus::StreamWrite),
            3 => Some(RpcStatus::StreamRead),
            4 => Some(RpcStatus::StreamBase),
            5 => Some(RpcStatus::PeerUnknown),
            6 => Some(RpcStatus::Message),
            7 => Some(RpcStatus::RuleViolation),
            8 => Some(RpcStatus::ConnectFrequent),
            9 => Some(RpcStatus::SequenceMismatch),
            10 => Some(RpcStatus::Revalidate),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RpcStatus::Success)
    }

    /// Soft refusal that still carries a valid payload.
    pub fn is_dag_consensus(&self) -> bool {
        matches!(self, RpcStatus::DagConsensus)
    }

    /// Transport-level failure: the stream is reset instead of closed.
    pub fn is_stream_class(&self) -> bool {
        matches!(
            self,
            RpcStatus::StreamWrite | RpcStatus::StreamRead | RpcStatus::StreamBase
        )
    }

    pub fn is_protocol_class(&self) -> bool {
        matches!(
            self,
            RpcStatus::Message | RpcStatus::RuleViolation | RpcStatus::SequenceMismatch
        )
    }

    /// Whether this outcome counts against the peer's reputation.
    /// Consensus divergence and operational refusals do not.
    pub fn penalizes_reputation(&self) -> bool {
        self.is_stream_class() || self.is_protocol_class()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RpcStatus::Success => "success",
            RpcStatus::DagConsensus => "dag_consensus",
            RpcStatus::StreamWrite => "stream_write",
            RpcStatus::StreamRead => "stream_read",
            RpcStatus::StreamBase => "stream_base",
            RpcStatus::PeerUnknown => "peer_unknown",
            RpcStatus::Message => "message",
            RpcStatus::RuleViolation => "rule_violation",
            RpcStatus::ConnectFrequent => "connect_frequent",
            RpcStatus::SequenceMismatch => "sequence_mismatch",
            RpcStatus::Revalidate => "revalidate",
        }
    }
}

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("stream write failed: {0}")]
    StreamWrite(String),
    #[error("stream read failed: {0}")]
    StreamRead(String),
    #[error("stream failed: {0}")]
    StreamBase(String),
    #[error("request phase timed out")]
    RequestTimeout,
    #[error("response phase timed out")]
    ResponseTimeout,
    #[error("invalid data: {0}")]
    InvalidData(String),
    #[error("ssz decoding failed")]
    Codec,
    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),
    #[error("peer answered {status:?}: {reason}")]
    Remote { status: RpcStatus, reason: String },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("internal error: {0}")]
    Internal(&'static str),
}

impl RpcError {
    /// Wire status this local failure maps to. Timeouts classify as stream
    /// errors.
    pub fn status(&self) -> RpcStatus {
        match self {
            RpcError::StreamWrite(_) => RpcStatus::StreamWrite,
            RpcError::StreamRead(_) | RpcError::ResponseTimeout => RpcStatus::StreamRead,
            RpcError::RequestTimeout
            | RpcError::StreamBase(_)
            | RpcError::Transport(_)
            | RpcError::Internal(_) => RpcStatus::StreamBase,
            RpcError::InvalidData(_) | RpcError::Codec | RpcError::UnsupportedProtocol(_) => {
                RpcStatus::Message
            }
            RpcError::Remote { status, .. } => *status,
        }
    }
}

impl From<ssz::DecodeError> for RpcError {
    fn from(_: ssz::DecodeError) -> Self {
        RpcError::Codec
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_topics_are_network_stable() {
        for topic in [Topic::ChainState, Topic::Goodbye] {
            assert_eq!(topic.protocol_name("main"), topic.protocol_name("test"));
        }
        assert_ne!(
            Topic::SyncDag.protocol_name("main"),
            Topic::SyncDag.protocol_name("test")
        );
    }

    #[test]
    fn protocol_names_round_trip() {
        use strum::IntoEnumIterator;
        for topic in Topic::iter() {
            let name = topic.protocol_name("privnet");
            assert_eq!(Topic::from_protocol_name("privnet", &name), Some(topic));
        }
    }

    #[test]
    fn cross_network_topics_do_not_resolve() {
        let name = Topic::SyncDag.protocol_name("main");
        assert_eq!(Topic::from_protocol_name("test", &name), None);
        // ...but the handshake-critical pair still does.
        let goodbye = Topic::Goodbye.protocol_name("main");
        assert_eq!(
            Topic::from_protocol_name("test", &goodbye),
            Some(Topic::Goodbye)
        );
    }

    #[test]
    fn status_codes_round_trip() {
        for code in 0..=10u8 {
            let status = RpcStatus::from_u8(code).unwrap();
            assert_eq!(status as u8, code);
        }
        assert_eq!(RpcStatus::from_u8(200), None);
    }

    #[test]
    fn reputation_policy_by_class() {
        assert!(RpcStatus::StreamRead.penalizes_reputation());
        assert!(RpcStatus::Message.penalizes_reputation());
        assert!(!RpcStatus::DagConsensus.penalizes_reputation());
        assert!(!RpcStatus::ConnectFrequent.penalizes_reputation());
        assert!(!RpcStatus::Success.penalizes_reputation());
    }
}
