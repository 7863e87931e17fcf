use lazy_static::lazy_static;
use prometheus::{
    register_int_counter_vec_with_registry, register_int_counter_with_registry,
    register_int_gauge_with_registry, IntCounter, IntCounterVec, IntGauge, Registry,
};

// Create a new registry named `weave`
lazy_static! {
    pub static ref WEAVE_REGISTRY: Registry =
        Registry::new_custom(Some("weave".to_string()), None).unwrap();
}

lazy_static! {
    pub static ref BLOCKS_ACCEPTED: IntCounter = register_int_counter_with_registry!(
        "sync_blocks_accepted_total",
        "Total number of blocks accepted from the network",
        WEAVE_REGISTRY
    )
    .unwrap();
    pub static ref SYNC_SESSIONS: IntCounterVec = register_int_counter_vec_with_registry!(
        "sync_sessions_total",
        "Reconciliation sessions labeled by how they ended",
        &["outcome"],
        WEAVE_REGISTRY
    )
    .unwrap();
    pub static ref RPC_FAILURES: IntCounterVec = register_int_counter_vec_with_registry!(
        "rpc_failures_total",
        "Failed outbound protocol calls labeled by topic",
        &["topic"],
        WEAVE_REGISTRY
    )
    .unwrap();
    pub static ref BAD_RESPONSES: IntCounterVec = register_int_counter_vec_with_registry!(
        "peer_bad_responses_total",
        "Bad responses attributed to peers labeled by classification",
        &["kind"],
        WEAVE_REGISTRY
    )
    .unwrap();
    pub static ref INVENTORY_RELAYED: IntCounter = register_int_counter_with_registry!(
        "relay_inventory_sent_total",
        "Inventory items announced to peers",
        WEAVE_REGISTRY
    )
    .unwrap();
    pub static ref AUDIT_ROUNDS: IntCounterVec = register_int_counter_vec_with_registry!(
        "audit_rounds_total",
        "Consistency audit rounds labeled by outcome",
        &["outcome"],
        WEAVE_REGISTRY
    )
    .unwrap();
    pub static ref PEERS_CONNECTED: IntGauge = register_int_gauge_with_registry!(
        "peers_connected",
        "Peers currently in an established session",
        WEAVE_REGISTRY
    )
    .unwrap();
}
