//! Cooperative cancellation (§4.G, component G).
//!
//! Wraps `tokio_util::sync::CancellationToken`, plus a "force" latch so a
//! second interrupt signal can escalate from "finish the current batch,
//! then stop" to "stop now".

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

/// Cancellation handle shared by the publisher loop and its caller.
///
/// The first cancellation request lets the in-flight batch finish
/// (cancellation is checked only between batches); a second request
/// before the loop observes the first sets the force latch, which the
/// publisher checks mid-batch-wait to abandon a pending governor sleep
/// immediately.
#[derive(Clone)]
pub struct CancelSignal {
    token: CancellationToken,
    force: Arc<AtomicBool>,
}

impl CancelSignal {
    /// Creates a fresh, uncancelled signal.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            force: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Requests cancellation at the next batch boundary.
    pub fn cancel(&self) {
        if self.token.is_cancelled() {
            self.force.store(true, Ordering::SeqCst);
        }
        self.token.cancel();
    }

    /// `true` once [`CancelSignal::cancel`] has been called at least once.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// `true` once cancellation has been requested twice, signaling the
    /// caller should abandon any in-progress wait immediately rather than
    /// letting the current batch finish.
    pub fn is_forced(&self) -> bool {
        self.force.load(Ordering::SeqCst)
    }

    /// Resolves once cancellation has been requested. Useful for racing
    /// against a governor-imposed sleep with `tokio::select!`.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}
