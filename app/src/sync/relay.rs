//! Inventory relay and the rebroadcast/mempool-poll scheduler.

use libp2p::PeerId;
use rand::seq::SliceRandom;
use smallvec::SmallVec;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tracing::{debug, trace};

use super::{PeerSync, SyncEvent};
use crate::metrics;
use crate::network::rpc::methods::{InvItem, InvMessage};
use crate::network::rpc::{RequestPayload, ResponsePayload};
use crate::types::{Hash256, ServiceFlags};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvKind {
    Tx,
    Block,
}

impl InvKind {
    fn item(self, hash: Hash256) -> InvItem {
        match self {
            InvKind::Tx => InvItem::tx(hash),
            InvKind::Block => InvItem::block(hash),
        }
    }
}

/// Inventory awaiting (re)announcement, shared between the actor and the
/// rebroadcast scheduler.
#[derive(Default)]
pub(crate) struct RelayQueue {
    pending: StdMutex<HashMap<Hash256, InvKind>>,
}

impl RelayQueue {
    pub fn enqueue(&self, hash: Hash256, kind: InvKind) {
        self.pending
            .lock()
            .expect("poisoned relay lock")
            .insert(hash, kind);
    }

    pub fn remove(&self, hash: &Hash256) {
        self.pending.lock().expect("poisoned relay lock").remove(hash);
    }

    pub fn snapshot(&self) -> Vec<(Hash256, InvKind)> {
        self.pending
            .lock()
            .expect("poisoned relay lock")
            .iter()
            .map(|(h, k)| (*h, *k))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().expect("poisoned relay lock").len()
    }
}

/// Announce inventory to every connected, capability-qualified peer, after
/// the per-peer relay filters. Returns how many items actually went out.
pub(crate) async fn broadcast_inventory(
    sync: &Arc<PeerSync>,
    items: &[(Hash256, InvKind)],
    exclude: Option<PeerId>,
) -> usize {
    let mut sent = 0usize;

    for record in sync.peers.connected().await {
        if Some(record.id()) == exclude {
            continue;
        }
        let qualified = record
            .services()
            .await
            .map(|s| s.has(ServiceFlags::NETWORK))
            .unwrap_or(false);
        if !qualified {
            continue;
        }

        let mut outgoing: SmallVec<[InvItem; 32]> = SmallVec::new();
        for (hash, kind) in items {
            match kind {
                InvKind::Tx => {
                    if record.relay_disabled().await {
                        continue;
                    }
                    if record.has_broadcast(hash).await {
                        continue;
                    }
                    // A transaction that left the pool since is not relayed.
                    let Some(fee) = sync.mempool.fee_rate(hash).await else {
                        continue;
                    };
                    if fee < record.fee_filter().await {
                        continue;
                    }
                    if record.has_filter().await && !record.filter_matches(hash.as_bytes()).await
                    {
                        continue;
                    }
                }
                InvKind::Block => {
                    if record.has_broadcast(hash).await {
                        continue;
                    }
                }
            }
            record
                .mark_broadcast(
                    *hash,
                    sync.config.sync.dedup_floor,
                    sync.config.sync.dedup_max_age,
                )
                .await;
            outgoing.push(kind.item(*hash));
        }

        if outgoing.is_empty() {
            continue;
        }
        sent += outgoing.len();
        metrics::INVENTORY_RELAYED.inc_by(outgoing.len() as u64);

        for chunk in outgoing.chunks(sync.config.relay.max_inv_batch) {
            let message = InvMessage {
                items: chunk.to_vec(),
            };
            let sync = sync.clone();
            let peer = record.id();
            tokio::spawn(async move {
                if let Err(err) = sync
                    .router
                    .send(peer, RequestPayload::Inventory(message))
                    .await
                {
                    trace!(%peer, %err, "inventory announce failed");
                }
            });
        }
    }

    sent
}

/// Periodic batch announcer. Transactions that left the pool are dropped,
/// transaction announcements are suppressed while the node is not current,
/// and the resend interval stretches with the backlog, floored at one block
/// interval.
pub(crate) fn spawn_rebroadcast(sync: Arc<PeerSync>) {
    let mut shutdown = sync.shutdown_listener();
    tokio::spawn(async move {
        let mut delay = sync.config.relay.block_interval;
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(delay) => {}
            }
            if sync.is_shutting_down() {
                break;
            }

            let queue = sync.relay_queue();
            for (hash, kind) in queue.snapshot() {
                if kind == InvKind::Tx && !sync.mempool.have_tx(&hash).await {
                    queue.remove(&hash);
                }
            }

            let current = sync.is_current().await;
            let batch: Vec<(Hash256, InvKind)> = queue
                .snapshot()
                .into_iter()
                .filter(|(_, kind)| *kind == InvKind::Block || current)
                .collect();

            if !batch.is_empty() {
                let sent = broadcast_inventory(&sync, &batch, None).await;
                let pool = sync.mempool.pending_count().await;
                debug!(
                    items = batch.len(),
                    sent,
                    pool,
                    "rebroadcast tick"
                );
                // Blocks are announced once; transactions stay until mined.
                for (hash, kind) in &batch {
                    if *kind == InvKind::Block {
                        queue.remove(hash);
                    }
                }
            }

            let backlog = queue.len();
            let factor = 1 + backlog / sync.config.relay.backlog_unit.max(1);
            delay = sync.config.relay.block_interval * factor as u32;
        }
    });
}

/// Poll one randomly chosen eligible peer for its mempool digest at
/// block-interval cadence, skipping recently polled peers.
pub(crate) fn spawn_mempool_poll(sync: Arc<PeerSync>) {
    let mut shutdown = sync.shutdown_listener();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sync.config.relay.block_interval);
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

            let candidates = sync.peers.can_sync(sync.transport.as_ref()).await;
            let Some(record) = candidates.choose(&mut rand::thread_rng()) else {
                continue;
            };
            if !record
                .debounce("mempool_poll", sync.config.relay.poll_suppress)
                .await
            {
                continue;
            }

            let peer = record.id();
            match sync.router.send(peer, RequestPayload::MemPool).await {
                Ok(reply) => {
                    if let ResponsePayload::MemPool(digest) = reply.payload {
                        trace!(%peer, count = digest.hashes.len(), "mempool digest received");
                        sync.push_event(SyncEvent::MempoolDigest {
                            peer,
                            hashes: digest.hashes,
                        });
                    }
                }
                Err(err) => trace!(%peer, %err, "mempool poll failed"),
            }
        }
    });
}
