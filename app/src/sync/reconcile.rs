//! The DAG reconciliation loop.
//!
//! One session runs against one sync peer at a time, on a background task
//! kicked off by the actor. Every loop boundary is a cancellation checkpoint;
//! an in-flight call still runs to its own timeout but its result is
//! discarded once the session is interrupted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, trace};

use super::session::{ProcessResult, ProcessTag, SessionOutcome};
use super::{PeerSync, SyncEvent};
use crate::chain::BlockAccept;
use crate::metrics;
use crate::network::rpc::methods::{BlockDatasRequest, GetBlocksRequest, SyncDagRequest};
use crate::network::rpc::{RequestPayload, ResponsePayload, RpcStatus};
use crate::peers::{PeerRecord, SessionState};
use crate::types::Hash256;

pub(crate) struct SessionCtx {
    pub sync: Arc<PeerSync>,
    pub peer: Arc<PeerRecord>,
    pub process_id: u64,
    pub long_sync: bool,
    pub interrupt: watch::Receiver<bool>,
    pub progress: Arc<AtomicU64>,
}

fn interrupted(ctx: &SessionCtx) -> bool {
    *ctx.interrupt.borrow() || ctx.sync.is_shutting_down()
}

pub(crate) async fn run_session(ctx: SessionCtx) {
    let sync = ctx.sync.clone();

    if sync.sessions_active.fetch_add(1, Ordering::SeqCst) >= sync.config.sync.max_sessions {
        sync.sessions_active.fetch_sub(1, Ordering::SeqCst);
        debug!(
            process_id = ctx.process_id,
            "session limit reached; refusing to start"
        );
        sync.push_event(SyncEvent::SessionEnded {
            process_id: ctx.process_id,
            outcome: SessionOutcome::Interrupted,
        });
        return;
    }

    // One reconciliation at a time across the whole process.
    let _process_guard = sync.process_lock.clone().lock_owned().await;

    let mut force_refresh = false;
    let outcome = loop {
        if interrupted(&ctx) {
            break SessionOutcome::Interrupted;
        }

        let result = process_round(&ctx, force_refresh).await;
        force_refresh = result.orphan;
        trace!(
            process_id = ctx.process_id,
            tag = ?result.tag,
            added = result.added,
            orphan = result.orphan,
            "reconciliation step"
        );

        match result.tag {
            ProcessTag::Nothing => break SessionOutcome::Finished,
            ProcessTag::TryAgain => break SessionOutcome::Retry,
            ProcessTag::Continue => {
                if !still_best(&ctx).await {
                    debug!(
                        process_id = ctx.process_id,
                        "sync peer no longer the global best; ending session"
                    );
                    break SessionOutcome::Retry;
                }
            }
        }
    };

    sync.sessions_active.fetch_sub(1, Ordering::SeqCst);
    sync.push_event(SyncEvent::SessionEnded {
        process_id: ctx.process_id,
        outcome,
    });
}

/// Whether the session's peer is still connected and no eligible peer knows
/// a strictly better graph.
async fn still_best(ctx: &SessionCtx) -> bool {
    if ctx.peer.state().await != SessionState::Connected {
        return false;
    }
    let Some(ours) = ctx.peer.graph_state().await else {
        return false;
    };
    for other in ctx
        .sync
        .peers
        .can_sync(ctx.sync.transport.as_ref())
        .await
    {
        if other.id() == ctx.peer.id() {
            continue;
        }
        if let Some(gs) = other.graph_state().await {
            if gs.excels(&ours) {
                return false;
            }
        }
    }
    true
}

/// One reconciliation step: resolve orphans first, otherwise drive the
/// DAG-sync handshake for the next batch.
pub(crate) async fn process_round(ctx: &SessionCtx, force_refresh: bool) -> ProcessResult {
    let sync = &ctx.sync;
    let chain = sync.chain.clone();

    if force_refresh || chain.orphan_refresh_due().await {
        chain.refresh_orphans().await;
    }

    let wants = chain.orphan_wants().await;
    if !wants.is_empty() {
        let hashes = if wants.len() == 1 {
            wants
        } else {
            // Several gaps: ask for an ordered hash list first so bodies
            // arrive parent-before-child.
            let locator = chain.main_locator(&ctx.peer.sync_point().await).await;
            match sync
                .router
                .send(ctx.peer.id(), RequestPayload::GetBlocks(GetBlocksRequest { locator }))
                .await
            {
                Ok(reply) => match reply.payload {
                    ResponsePayload::BlockHashes(mut resp) if !resp.hashes.is_empty() => {
                        resp.hashes.truncate(sync.config.sync.batch_size);
                        resp.hashes
                    }
                    _ => wants,
                },
                Err(_) => wants,
            }
        };
        return fetch_blocks(ctx, &hashes).await;
    }

    let locator = chain.main_locator(&ctx.peer.sync_point().await).await;
    let local_state = chain.best_snapshot().await.graph_state();
    let reply = sync
        .router
        .send(
            ctx.peer.id(),
            RequestPayload::SyncDag(SyncDagRequest {
                main_locator: locator,
                graph_state: local_state,
            }),
        )
        .await;

    match reply {
        Ok(reply) => {
            let ResponsePayload::SyncDag(resp) = reply.payload else {
                return ProcessResult::try_again();
            };
            ctx.peer.update_graph_state(resp.graph_state).await;
            if resp.block_hashes.is_empty() {
                // A peer that never advances us must not quietly stall the
                // session: restart the walk from genesis on the next pass.
                debug!(
                    process_id = ctx.process_id,
                    "empty sync batch; resetting sync point to genesis"
                );
                ctx.peer.set_sync_point(chain.genesis_hash()).await;
                return ProcessResult::try_again();
            }
            ctx.peer.set_sync_point(resp.sync_point).await;
            fetch_blocks(ctx, &resp.block_hashes).await
        }
        Err(err) => {
            debug!(process_id = ctx.process_id, %err, "dag sync exchange failed");
            ProcessResult::try_again()
        }
    }
}

/// Fetch block bodies in chunks bounded by the transport message size and
/// hand them to the chain. Known blocks are served locally and skipped on the
/// wire. A failed first chunk is retried once from the same offset; any later
/// failure abandons the remainder.
pub(crate) async fn fetch_blocks(ctx: &SessionCtx, hashes: &[Hash256]) -> ProcessResult {
    let sync = &ctx.sync;
    let chain = sync.chain.clone();

    let mut needed = Vec::with_capacity(hashes.len());
    for hash in hashes {
        if !chain.have_block(hash).await {
            needed.push(*hash);
        }
    }

    let chunk_size = sync.config.sync.fetch_chunk.max(1);
    let mut added = 0u64;
    let mut orphan = false;
    let mut offset = 0usize;
    let mut retried_first = false;

    while offset < needed.len() {
        if interrupted(ctx) {
            break;
        }

        let end = (offset + chunk_size).min(needed.len());
        let chunk = &needed[offset..end];
        let reply = sync
            .router
            .send(
                ctx.peer.id(),
                RequestPayload::BlockDatas(BlockDatasRequest {
                    hashes: chunk.to_vec(),
                }),
            )
            .await;

        let resp = match reply {
            Ok(reply) => match reply.payload {
                ResponsePayload::BlockDatas(resp) => resp,
                _ => break,
            },
            Err(err) => {
                if offset == 0 && !retried_first {
                    retried_first = true;
                    debug!(process_id = ctx.process_id, %err, "retrying first block chunk");
                    continue;
                }
                debug!(
                    process_id = ctx.process_id,
                    %err,
                    offset,
                    "block fetch failed; treating remainder as unavailable"
                );
                break;
            }
        };

        for block in resp.blocks {
            match chain.accept_block(&block.data, true).await {
                Ok(BlockAccept::Accepted(hash)) => {
                    added += 1;
                    ctx.progress.fetch_add(1, Ordering::Relaxed);
                    metrics::BLOCKS_ACCEPTED.inc();
                    sync.mempool.regain().await;
                    sync.mempool.prune_expired().await;
                    // During a long catch-up the batch itself is old news;
                    // announcing every block would just flood the relay.
                    if !ctx.long_sync {
                        sync.push_event(SyncEvent::AnnounceBlock {
                            hash,
                            source: Some(ctx.peer.id()),
                        });
                    }
                }
                Ok(BlockAccept::Orphan(_)) => orphan = true,
                Ok(BlockAccept::Duplicate(_)) => {}
                Err(err) => {
                    debug!(process_id = ctx.process_id, %err, "peer served an invalid block");
                    sync.peers
                        .increment_bad_response(&ctx.peer.id(), RpcStatus::RuleViolation)
                        .await;
                }
            }
        }
        offset = end;
    }

    ProcessResult::advanced(added, orphan)
}
