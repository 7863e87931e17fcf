//! Ephemeral reconciliation session state.

use libp2p::PeerId;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;

/// Outcome of one reconciliation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessTag {
    /// The peer had nothing new; the session is done.
    Nothing,
    /// Forward progress was made; run another step.
    Continue,
    /// The step failed or reset; end the session and re-select after a delay.
    TryAgain,
}

/// Result of one reconciliation step, consumed immediately by the driving
/// loop.
#[derive(Debug, Clone, Copy)]
pub struct ProcessResult {
    pub tag: ProcessTag,
    /// Whether any submitted block landed in the orphan pool, prompting an
    /// orphan-cache refresh on the next step.
    pub orphan: bool,
    /// Newly accepted blocks.
    pub added: u64,
}

impl ProcessResult {
    pub fn nothing() -> Self {
        Self {
            tag: ProcessTag::Nothing,
            orphan: false,
            added: 0,
        }
    }

    pub fn try_again() -> Self {
        Self {
            tag: ProcessTag::TryAgain,
            orphan: false,
            added: 0,
        }
    }

    pub fn advanced(added: u64, orphan: bool) -> Self {
        Self {
            tag: if added > 0 || orphan {
                ProcessTag::Continue
            } else {
                ProcessTag::Nothing
            },
            orphan,
            added,
        }
    }
}

/// How a session ended, reported back to the actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Ran out of work; the peer had nothing further.
    Finished,
    /// Ended early; peer re-selection should be retried after a delay.
    Retry,
    /// Interrupted by re-selection or shutdown.
    Interrupted,
}

/// Actor-side handle to the running reconciliation session.
pub struct SessionHandle {
    pub peer: PeerId,
    /// Monotonically increasing id for log correlation.
    pub process_id: u64,
    /// Set when the peer is ahead by more than one reconciliation batch.
    pub long_sync: bool,
    interrupt: watch::Sender<bool>,
    progress: Arc<AtomicU64>,
    /// Progress value and time of the last stall check.
    pub last_seen: (u64, Instant),
}

impl SessionHandle {
    pub fn new(
        peer: PeerId,
        process_id: u64,
        long_sync: bool,
    ) -> (Self, watch::Receiver<bool>, Arc<AtomicU64>) {
        let (interrupt, interrupt_rx) = watch::channel(false);
        let progress = Arc::new(AtomicU64::new(0));
        (
            Self {
                peer,
                process_id,
                long_sync,
                interrupt,
                progress: progress.clone(),
                last_seen: (0, Instant::now()),
            },
            interrupt_rx,
            progress,
        )
    }

    /// Raise the cooperative cancellation signal. The loop honors it at the
    /// next checkpoint; in-flight calls run to their own timeout.
    pub fn interrupt(&self) {
        let _ = self.interrupt.send(true);
    }

    pub fn progress(&self) -> u64 {
        self.progress.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::random_peer_id;

    #[test]
    fn advanced_maps_progress_to_continue() {
        assert_eq!(ProcessResult::advanced(3, false).tag, ProcessTag::Continue);
        assert_eq!(ProcessResult::advanced(0, true).tag, ProcessTag::Continue);
        assert_eq!(ProcessResult::advanced(0, false).tag, ProcessTag::Nothing);
    }

    #[test]
    fn interrupt_reaches_the_receiver() {
        let (handle, rx, _) = SessionHandle::new(random_peer_id(), 7, false);
        assert!(!*rx.borrow());
        handle.interrupt();
        assert!(*rx.borrow());
    }
}
