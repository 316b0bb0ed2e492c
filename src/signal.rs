//! One-shot handoff between a caller and the engine worker.
//!
//! A [`Signal`] carries a single boolean predicate. `notify` raises it and wakes
//! every waiter, `wait` blocks until it is raised or the timeout expires, and
//! `reset` lowers it without waking anyone. The engine uses it as a
//! single-producer/single-consumer handoff: `start_execution` notifies, the
//! worker is the only waiter while powerdown is suspended.

use std::time::Duration;
use tokio::sync::watch;

/// Timeout-bounded wait/notify flag backed by a `watch` channel.
#[derive(Debug)]
pub struct Signal {
    tx: watch::Sender<bool>,
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

impl Signal {
    /// Create a lowered signal.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Raise the signal and wake all waiters.
    pub fn notify(&self) {
        self.tx.send_replace(true);
    }

    /// Lower the signal. Waiters are not woken.
    pub fn reset(&self) {
        self.tx.send_if_modified(|signalled| {
            *signalled = false;
            false
        });
    }

    /// Current value of the flag.
    pub fn is_signalled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the signal is raised or `timeout` elapses.
    ///
    /// Returns the flag as observed when the wait ends.
    pub async fn wait(&self, timeout: Duration) -> bool {
        let mut rx = self.tx.subscribe();
        let raised = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|signalled| *signalled)).await,
            Ok(Ok(_))
        );
        raised || self.is_signalled()
    }
}
