//! One-shot lifecycle signals.

use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// An edge-triggered, single-shot signal.
///
/// A session raises each of its lifecycle signals (`ready`, `established`,
/// `completed`, `done`) exactly once; every waiter past or future observes
/// the edge. Firing an already-fired signal is a no-op.
#[derive(Debug, Default)]
pub struct Signal {
    fired: AtomicBool,
    notify: Notify,
}

impl Signal {
    /// Creates an unfired signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the signal, waking every waiter. Returns whether this call
    /// was the one that fired it.
    pub fn fire(&self) -> bool {
        if self.fired.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.notify.notify_waiters();
        true
    }

    /// Whether the signal has been raised.
    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Resolves once the signal has been raised; immediately if it already
    /// was.
    pub async fn fired(&self) {
        loop {
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();
            if self.is_fired() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn fire_is_single_shot() {
        let signal = Signal::new();
        assert!(!signal.is_fired());
        assert!(signal.fire());
        assert!(!signal.fire());
        assert!(signal.is_fired());
    }

    #[tokio::test]
    async fn waiters_past_and_future_observe_the_edge() {
        let signal = Arc::new(Signal::new());

        let early = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.fired().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!early.is_finished());

        signal.fire();
        early.await.unwrap();

        // A waiter arriving after the edge resolves immediately.
        signal.fired().await;
    }
}
