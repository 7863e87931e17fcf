//! Request/response shapes for every topic.
//!
//! Each topic maps to a concrete ssz container here; decoding is driven by a
//! compile-time match on the topic, never by runtime type reconstruction.

use ssz::{Decode, Encode};
use ssz_derive::{Decode, Encode};
use ssz_types::{typenum::U256, VariableList};

use super::protocol::{RpcError, Topic};
use crate::types::{GraphState, Hash256};

pub type MaxErrorLen = U256;

/// Structured reason body attached to hard-error responses.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorBody(pub VariableList<u8, MaxErrorLen>);

impl ErrorBody {
    pub fn new(reason: &str) -> Self {
        let mut bytes = reason.as_bytes().to_vec();
        bytes.truncate(256);
        ErrorBody(VariableList::from(bytes))
    }

    pub fn as_string(&self) -> String {
        String::from_utf8_lossy(&self.0).into_owned()
    }
}

impl Encode for ErrorBody {
    fn is_ssz_fixed_len() -> bool {
        <VariableList<u8, MaxErrorLen> as Encode>::is_ssz_fixed_len()
    }

    fn ssz_bytes_len(&self) -> usize {
        self.0.ssz_bytes_len()
    }

    fn ssz_append(&self, buf: &mut Vec<u8>) {
        self.0.ssz_append(buf)
    }
}

impl Decode for ErrorBody {
    fn is_ssz_fixed_len() -> bool {
        <VariableList<u8, MaxErrorLen> as Decode>::is_ssz_fixed_len()
    }

    fn from_ssz_bytes(bytes: &[u8]) -> Result<Self, ssz::DecodeError> {
        Ok(ErrorBody(VariableList::from_ssz_bytes(bytes)?))
    }
}

/// Handshake message: the sender's view of its own chain.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct ChainState {
    pub protocol_version: u32,
    pub services: u64,
    /// Unix time at the sender, contributed to the local time-sample pool.
    pub timestamp: u64,
    pub genesis_hash: Hash256,
    pub state_root: Hash256,
    pub disable_relay_tx: bool,
    pub graph_state: GraphState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoodbyeReason {
    ClientShutdown,
    /// Different genesis or otherwise incompatible network.
    IrrelevantNetwork,
    RuleViolation,
    /// Irreconcilable DAG view.
    DagDiverged,
    TooManyPeers,
    Unknown(u64),
}

impl From<u64> for GoodbyeReason {
    fn from(value: u64) -> Self {
        match value {
            1 => GoodbyeReason::ClientShutdown,
            2 => GoodbyeReason::IrrelevantNetwork,
            3 => GoodbyeReason::RuleViolation,
            4 => GoodbyeReason::DagDiverged,
            5 => GoodbyeReason::TooManyPeers,
            other => GoodbyeReason::Unknown(other),
        }
    }
}

impl From<GoodbyeReason> for u64 {
    fn from(reason: GoodbyeReason) -> u64 {
        match reason {
            GoodbyeReason::ClientShutdown => 1,
            GoodbyeReason::IrrelevantNetwork => 2,
            GoodbyeReason::RuleViolation => 3,
            GoodbyeReason::DagDiverged => 4,
            GoodbyeReason::TooManyPeers => 5,
            GoodbyeReason::Unknown(other) => other,
        }
    }
}

impl Encode for GoodbyeReason {
    fn is_ssz_fixed_len() -> bool {
        <u64 as Encode>::is_ssz_fixed_len()
    }

    fn ssz_fixed_len() -> usize {
        <u64 as Encode>::ssz_fixed_len()
    }

    fn ssz_bytes_len(&self) -> usize {
        u64::from(*self).ssz_bytes_len()
    }

    fn ssz_append(&self, buf: &mut Vec<u8>) {
        u64::from(*self).ssz_append(buf)
    }
}

impl Decode for GoodbyeReason {
    fn is_ssz_fixed_len() -> bool {
        <u64 as Decode>::is_ssz_fixed_len()
    }

    fn ssz_fixed_len() -> usize {
        <u64 as Decode>::ssz_fixed_len()
    }

    fn from_ssz_bytes(bytes: &[u8]) -> Result<Self, ssz::DecodeError> {
        u64::from_ssz_bytes(bytes).map(|v| v.into())
    }
}

/// Liveness probe; `seq` is the sender's current metadata sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct Ping {
    pub seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct MetaData {
    pub seq: u64,
    pub services: u64,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct GetBlocksRequest {
    pub locator: Vec<Hash256>,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct BlockHashesResponse {
    pub hashes: Vec<Hash256>,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct BlockDatasRequest {
    pub hashes: Vec<Hash256>,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct BlockData {
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct BlockDatasResponse {
    pub blocks: Vec<BlockData>,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct SyncDagRequest {
    pub main_locator: Vec<Hash256>,
    pub graph_state: GraphState,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct SyncDagResponse {
    pub graph_state: GraphState,
    pub sync_point: Hash256,
    pub block_hashes: Vec<Hash256>,
}

pub const INV_TYPE_TX: u32 = 1;
pub const INV_TYPE_BLOCK: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct InvItem {
    pub kind: u32,
    pub hash: Hash256,
}

impl InvItem {
    pub fn tx(hash: Hash256) -> Self {
        InvItem {
            kind: INV_TYPE_TX,
            hash,
        }
    }

    pub fn block(hash: Hash256) -> Self {
        InvItem {
            kind: INV_TYPE_BLOCK,
            hash,
        }
    }

    pub fn is_tx(&self) -> bool {
        self.kind == INV_TYPE_TX
    }

    pub fn is_block(&self) -> bool {
        self.kind == INV_TYPE_BLOCK
    }
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct InvMessage {
    pub items: Vec<InvItem>,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct NodeRecordMsg {
    pub seq: u64,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct StateRootRequest {
    pub block: Hash256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct StateRootResponse {
    pub root: Hash256,
    /// False when the block (or its state) is unknown to the responder.
    pub known: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct MerkleBlockRequest {
    pub block: Hash256,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct MerkleBlockResponse {
    pub block: Vec<u8>,
    /// Transactions in the block matching the requester's content filter.
    pub matched: Vec<Hash256>,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct FilterAddRequest {
    pub element: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct FilterLoadRequest {
    pub elements: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct FeeFilterMsg {
    pub min_fee_rate: u64,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct MemPoolResponse {
    pub hashes: Vec<Hash256>,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct DataItem {
    pub kind: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct GetDataResponse {
    pub items: Vec<DataItem>,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct TxsRequest {
    pub hashes: Vec<Hash256>,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct TxData {
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct TxsResponse {
    pub txs: Vec<TxData>,
}

/// A decoded inbound request, or the body of an outbound call.
#[derive(Debug, Clone)]
pub enum RequestPayload {
    ChainState(ChainState),
    Goodbye(GoodbyeReason),
    Ping(Ping),
    MetaData,
    GetBlocks(GetBlocksRequest),
    BlockDatas(BlockDatasRequest),
    SyncDag(SyncDagRequest),
    Inventory(InvMessage),
    GraphState(GraphState),
    NodeRecord(NodeRecordMsg),
    StateRoot(StateRootRequest),
    MerkleBlock(MerkleBlockRequest),
    FilterAdd(FilterAddRequest),
    FilterClear,
    FilterLoad(FilterLoadRequest),
    FeeFilter(FeeFilterMsg),
    MemPool,
    GetData(InvMessage),
    Txs(TxsRequest),
}

impl RequestPayload {
    pub fn topic(&self) -> Topic {
        match self {
            RequestPayload::ChainState(_) => Topic::ChainState,
            RequestPayload::Goodbye(_) => Topic::Goodbye,
            RequestPayload::Ping(_) => Topic::Ping,
            RequestPayload::MetaData => Topic::MetaData,
            RequestPayload::GetBlocks(_) => Topic::GetBlocks,
            RequestPayload::BlockDatas(_) => Topic::BlockDatas,
            RequestPayload::SyncDag(_) => Topic::SyncDag,
            RequestPayload::Inventory(_) => Topic::Inventory,
            RequestPayload::GraphState(_) => Topic::GraphState,
            RequestPayload::NodeRecord(_) => Topic::NodeRecord,
            RequestPayload::StateRoot(_) => Topic::StateRoot,
            RequestPayload::MerkleBlock(_) => Topic::MerkleBlock,
            RequestPayload::FilterAdd(_) => Topic::FilterAdd,
            RequestPayload::FilterClear => Topic::FilterClear,
            RequestPayload::FilterLoad(_) => Topic::FilterLoad,
            RequestPayload::FeeFilter(_) => Topic::FeeFilter,
            RequestPayload::MemPool => Topic::MemPool,
            RequestPayload::GetData(_) => Topic::GetData,
            RequestPayload::Txs(_) => Topic::Txs,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            RequestPayload::ChainState(m) => m.as_ssz_bytes(),
            RequestPayload::Goodbye(m) => m.as_ssz_bytes(),
            RequestPayload::Ping(m) => m.as_ssz_bytes(),
            RequestPayload::MetaData => Vec::new(),
            RequestPayload::GetBlocks(m) => m.as_ssz_bytes(),
            RequestPayload::BlockDatas(m) => m.as_ssz_bytes(),
            RequestPayload::SyncDag(m) => m.as_ssz_bytes(),
            RequestPayload::Inventory(m) => m.as_ssz_bytes(),
            RequestPayload::GraphState(m) => m.as_ssz_bytes(),
            RequestPayload::NodeRecord(m) => m.as_ssz_bytes(),
            RequestPayload::StateRoot(m) => m.as_ssz_bytes(),
            RequestPayload::MerkleBlock(m) => m.as_ssz_bytes(),
            RequestPayload::FilterAdd(m) => m.as_ssz_bytes(),
            RequestPayload::FilterClear => Vec::new(),
            RequestPayload::FilterLoad(m) => m.as_ssz_bytes(),
            RequestPayload::FeeFilter(m) => m.as_ssz_bytes(),
            RequestPayload::MemPool => Vec::new(),
            RequestPayload::GetData(m) => m.as_ssz_bytes(),
            RequestPayload::Txs(m) => m.as_ssz_bytes(),
        }
    }

    /// Compile-time decode table: every topic maps to its concrete shape.
    pub fn decode(topic: Topic, bytes: &[u8]) -> Result<RequestPayload, RpcError> {
        let payload = match topic {
            Topic::ChainState => RequestPayload::ChainState(ChainState::from_ssz_bytes(bytes)?),
            Topic::Goodbye => RequestPayload::Goodbye(GoodbyeReason::from_ssz_bytes(bytes)?),
            Topic::Ping => RequestPayload::Ping(Ping::from_ssz_bytes(bytes)?),
            Topic::MetaData => RequestPayload::MetaData,
            Topic::GetBlocks => {
                RequestPayload::GetBlocks(GetBlocksRequest::from_ssz_bytes(bytes)?)
            }
            Topic::BlockDatas => {
                RequestPayload::BlockDatas(BlockDatasRequest::from_ssz_bytes(bytes)?)
            }
            Topic::SyncDag => RequestPayload::SyncDag(SyncDagRequest::from_ssz_bytes(bytes)?),
            Topic::Inventory => RequestPayload::Inventory(InvMessage::from_ssz_bytes(bytes)?),
            Topic::GraphState => RequestPayload::GraphState(GraphState::from_ssz_bytes(bytes)?),
            Topic::NodeRecord => RequestPayload::NodeRecord(NodeRecordMsg::from_ssz_bytes(bytes)?),
            Topic::StateRoot => RequestPayload::StateRoot(StateRootRequest::from_ssz_bytes(bytes)?),
            Topic::MerkleBlock => {
                RequestPayload::MerkleBlock(MerkleBlockRequest::from_ssz_bytes(bytes)?)
            }
            Topic::FilterAdd => RequestPayload::FilterAdd(FilterAddRequest::from_ssz_bytes(bytes)?),
            Topic::FilterClear => RequestPayload::FilterClear,
            Topic::FilterLoad => {
                RequestPayload::FilterLoad(FilterLoadRequest::from_ssz_bytes(bytes)?)
            }
            Topic::FeeFilter => RequestPayload::FeeFilter(FeeFilterMsg::from_ssz_bytes(bytes)?),
            Topic::MemPool => RequestPayload::MemPool,
            Topic::GetData => RequestPayload::GetData(InvMessage::from_ssz_bytes(bytes)?),
            Topic::Txs => RequestPayload::Txs(TxsRequest::from_ssz_bytes(bytes)?),
        };
        Ok(payload)
    }
}

/// A decoded response, or the body a handler produced.
#[derive(Debug, Clone)]
pub enum ResponsePayload {
    ChainState(ChainState),
    Pong(Ping),
    MetaData(MetaData),
    BlockHashes(BlockHashesResponse),
    BlockDatas(BlockDatasResponse),
    SyncDag(SyncDagResponse),
    GraphState(GraphState),
    NodeRecord(NodeRecordMsg),
    StateRoot(StateRootResponse),
    MerkleBlock(MerkleBlockResponse),
    MemPool(MemPoolResponse),
    GetData(GetDataResponse),
    Txs(TxsResponse),
    /// Bare status acknowledgment for one-way topics.
    Ack,
}

impl ResponsePayload {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            ResponsePayload::ChainState(m) => m.as_ssz_bytes(),
            ResponsePayload::Pong(m) => m.as_ssz_bytes(),
            ResponsePayload::MetaData(m) => m.as_ssz_bytes(),
            ResponsePayload::BlockHashes(m) => m.as_ssz_bytes(),
            ResponsePayload::BlockDatas(m) => m.as_ssz_bytes(),
            ResponsePayload::SyncDag(m) => m.as_ssz_bytes(),
            ResponsePayload::GraphState(m) => m.as_ssz_bytes(),
            ResponsePayload::NodeRecord(m) => m.as_ssz_bytes(),
            ResponsePayload::StateRoot(m) => m.as_ssz_bytes(),
            ResponsePayload::MerkleBlock(m) => m.as_ssz_bytes(),
            ResponsePayload::MemPool(m) => m.as_ssz_bytes(),
            ResponsePayload::GetData(m) => m.as_ssz_bytes(),
            ResponsePayload::Txs(m) => m.as_ssz_bytes(),
            ResponsePayload::Ack => Vec::new(),
        }
    }

    pub fn decode(topic: Topic, bytes: &[u8]) -> Result<ResponsePayload, RpcError> {
        let payload = match topic {
            Topic::ChainState => ResponsePayload::ChainState(ChainState::from_ssz_bytes(bytes)?),
            Topic::Ping => ResponsePayload::Pong(Ping::from_ssz_bytes(bytes)?),
            Topic::MetaData => ResponsePayload::MetaData(MetaData::from_ssz_bytes(bytes)?),
            Topic::GetBlocks => {
                ResponsePayload::BlockHashes(BlockHashesResponse::from_ssz_bytes(bytes)?)
            }
            Topic::BlockDatas => {
                ResponsePayload::BlockDatas(BlockDatasResponse::from_ssz_bytes(bytes)?)
            }
            Topic::SyncDag => ResponsePayload::SyncDag(SyncDagResponse::from_ssz_bytes(bytes)?),
            Topic::GraphState => ResponsePayload::GraphState(GraphState::from_ssz_bytes(bytes)?),
            Topic::NodeRecord => {
                ResponsePayload::NodeRecord(NodeRecordMsg::from_ssz_bytes(bytes)?)
            }
            Topic::StateRoot => {
                ResponsePayload::StateRoot(StateRootResponse::from_ssz_bytes(bytes)?)
            }
            Topic::MerkleBlock => {
                ResponsePayload::MerkleBlock(MerkleBlockResponse::from_ssz_bytes(bytes)?)
            }
            Topic::MemPool => ResponsePayload::MemPool(MemPoolResponse::from_ssz_bytes(bytes)?),
            Topic::GetData => ResponsePayload::GetData(GetDataResponse::from_ssz_bytes(bytes)?),
            Topic::Txs => ResponsePayload::Txs(TxsResponse::from_ssz_bytes(bytes)?),
            Topic::Goodbye
            | Topic::Inventory
            | Topic::FilterAdd
            | Topic::FilterClear
            | Topic::FilterLoad
            | Topic::FeeFilter => ResponsePayload::Ack,
        };
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_state_round_trips() {
        let msg = ChainState {
            protocol_version: 1,
            services: 3,
            timestamp: 1_700_000_000,
            genesis_hash: Hash256::repeat_byte(7),
            state_root: Hash256::repeat_byte(9),
            disable_relay_tx: false,
            graph_state: GraphState {
                total: 42,
                layer: 5,
                main_height: 40,
                main_order: 41,
                tips: vec![Hash256::repeat_byte(1), Hash256::repeat_byte(2)],
            },
        };
        let bytes = msg.as_ssz_bytes();
        assert_eq!(ChainState::from_ssz_bytes(&bytes).unwrap(), msg);
    }

    #[test]
    fn goodbye_reason_encodes_as_u64() {
        let bytes = GoodbyeReason::IrrelevantNetwork.as_ssz_bytes();
        assert_eq!(bytes, 2u64.as_ssz_bytes());
        assert_eq!(
            GoodbyeReason::from_ssz_bytes(&bytes).unwrap(),
            GoodbyeReason::IrrelevantNetwork
        );
        assert_eq!(GoodbyeReason::from(99u64), GoodbyeReason::Unknown(99));
    }

    #[test]
    fn request_decode_follows_topic_table() {
        let req = SyncDagRequest {
            main_locator: vec![Hash256::zero()],
            graph_state: GraphState::default(),
        };
        let bytes = req.as_ssz_bytes();
        match RequestPayload::decode(Topic::SyncDag, &bytes).unwrap() {
            RequestPayload::SyncDag(decoded) => assert_eq!(decoded, req),
            other => panic!("decoded wrong variant: {other:?}"),
        }
        // The same bytes do not decode under an unrelated topic.
        assert!(RequestPayload::decode(Topic::Ping, &bytes).is_err());
    }

    #[test]
    fn bodyless_topics_decode_from_empty() {
        assert!(matches!(
            RequestPayload::decode(Topic::MemPool, &[]).unwrap(),
            RequestPayload::MemPool
        ));
        assert!(matches!(
            ResponsePayload::decode(Topic::Goodbye, &[]).unwrap(),
            ResponsePayload::Ack
        ));
    }
}
