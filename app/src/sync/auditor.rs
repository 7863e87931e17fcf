//! Background data-consistency audit.
//!
//! Periodically compares the locally computed state root at a stable block
//! against a sample of protocol-compatible peers. Broad disagreement is a
//! systemic fault: the node shuts down rather than keep serving a state the
//! network does not recognize.

use futures::future::join_all;
use rand::seq::SliceRandom;
use std::sync::Arc;
use tracing::{debug, error, info};

use super::PeerSync;
use crate::metrics;
use crate::network::rpc::methods::StateRootRequest;
use crate::network::rpc::{RequestPayload, ResponsePayload};
use crate::types::Hash256;

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum AuditOutcome {
    /// Not enough data to judge.
    Skipped,
    /// Agreement at or above the threshold.
    Agreement(f64),
    /// Agreement fell below the threshold.
    Divergence(f64),
}

/// Pure agreement evaluation over the sampled roots.
pub(crate) fn evaluate(
    local: Hash256,
    roots: &[Hash256],
    sample_floor: usize,
    threshold: f64,
) -> AuditOutcome {
    if roots.len() < sample_floor {
        return AuditOutcome::Skipped;
    }
    let agree = roots.iter().filter(|root| **root == local).count();
    let ratio = agree as f64 / roots.len() as f64;
    if ratio < threshold {
        AuditOutcome::Divergence(ratio)
    } else {
        AuditOutcome::Agreement(ratio)
    }
}

pub(crate) fn spawn_auditor(sync: Arc<PeerSync>) {
    if !sync.config.audit.enabled {
        return;
    }
    let mut shutdown = sync.shutdown_listener();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sync.config.audit.interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {}
            }
            if sync.is_shutting_down() {
                break;
            }
            match audit_round(&sync).await {
                AuditOutcome::Skipped => {
                    metrics::AUDIT_ROUNDS.with_label_values(&["skipped"]).inc();
                }
                AuditOutcome::Agreement(ratio) => {
                    metrics::AUDIT_ROUNDS.with_label_values(&["agreement"]).inc();
                    info!(ratio, "state root audit passed");
                }
                AuditOutcome::Divergence(ratio) => {
                    metrics::AUDIT_ROUNDS.with_label_values(&["divergence"]).inc();
                    error!(
                        ratio,
                        threshold = sync.config.audit.agreement_threshold,
                        "state root diverges from the sampled network; shutting down"
                    );
                    sync.trigger_shutdown();
                    break;
                }
            }
        }
    });
}

pub(crate) async fn audit_round(sync: &Arc<PeerSync>) -> AuditOutcome {
    let config = &sync.config.audit;

    let Some(stable) = sync.chain.stable_block(config.confirmations).await else {
        return AuditOutcome::Skipped;
    };
    let Some(local_root) = sync.chain.state_root_at(&stable).await else {
        return AuditOutcome::Skipped;
    };

    // Protocol-compatible sync peers only.
    let mut candidates = Vec::new();
    for record in sync.peers.can_sync(sync.transport.as_ref()).await {
        if record.protocol_version().await.is_some() {
            candidates.push(record);
        }
    }
    if candidates.len() < config.sample_floor {
        debug!(
            peers = candidates.len(),
            floor = config.sample_floor,
            "not enough peers for a state root audit"
        );
        return AuditOutcome::Skipped;
    }

    candidates.shuffle(&mut rand::thread_rng());
    candidates.truncate(config.sample_floor * 2);

    let queries = candidates.iter().map(|record| {
        let sync = sync.clone();
        let peer = record.id();
        async move {
            match sync
                .router
                .send(peer, RequestPayload::StateRoot(StateRootRequest { block: stable }))
                .await
            {
                Ok(reply) => match reply.payload {
                    ResponsePayload::StateRoot(resp) if resp.known => Some(resp.root),
                    _ => None,
                },
                Err(_) => None,
            }
        }
    });

    let roots: Vec<Hash256> = join_all(queries).await.into_iter().flatten().collect();
    evaluate(
        local_root,
        &roots,
        config.sample_floor,
        config.agreement_threshold,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root(byte: u8) -> Hash256 {
        Hash256::repeat_byte(byte)
    }

    #[test]
    fn four_of_six_agreeing_passes() {
        let local = root(1);
        let roots = vec![root(1), root(1), root(1), root(1), root(2), root(2)];
        match evaluate(local, &roots, 5, 0.5) {
            AuditOutcome::Agreement(ratio) => assert!((ratio - 4.0 / 6.0).abs() < 1e-9),
            other => panic!("expected agreement, got {other:?}"),
        }
    }

    #[test]
    fn two_of_six_agreeing_diverges() {
        let local = root(1);
        let roots = vec![root(1), root(1), root(2), root(2), root(3), root(3)];
        match evaluate(local, &roots, 5, 0.5) {
            AuditOutcome::Divergence(ratio) => assert!((ratio - 2.0 / 6.0).abs() < 1e-9),
            other => panic!("expected divergence, got {other:?}"),
        }
    }

    #[test]
    fn below_sample_floor_is_skipped() {
        let local = root(1);
        let roots = vec![root(2), root(2), root(2)];
        assert_eq!(evaluate(local, &roots, 5, 0.5), AuditOutcome::Skipped);
    }

    #[test]
    fn exact_threshold_does_not_shut_down() {
        let local = root(1);
        let roots = vec![root(1), root(1), root(1), root(2), root(2), root(2)];
        assert!(matches!(
            evaluate(local, &roots, 5, 0.5),
            AuditOutcome::Agreement(_)
        ));
    }
}
