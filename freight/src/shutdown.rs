//! Shutdown coordination for the agent's tasks.
//!
//! Freight runs a handful of long-lived tasks -- the UDP listener, the
//! scrape poller, the report loop -- and all of them must stop when the
//! process is told to. Everything that participates in controlled shutdown
//! holds a clone of [`Shutdown`]; the binary fires the signal once and every
//! clone observes it.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tokio::sync::Notify;
use tracing::debug;

#[derive(Debug, Clone, Default)]
/// A one-shot, many-receiver shutdown signal.
///
/// The signal is a latched flag: once [`Shutdown::signal`] fires, every
/// pending and future [`Shutdown::recv`] completes, on this clone and every
/// other.
pub struct Shutdown {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    signaled: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    /// Create the root `Shutdown` instance. Tasks receive clones of it.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the signal. Completes immediately if it has already fired.
    pub async fn recv(&self) {
        // Register for the wakeup before reading the flag: checked the
        // other way around, a signal landing between the two is lost and
        // this task sleeps forever.
        loop {
            let notified = self.inner.notify.notified();
            if self.inner.signaled.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }

    /// Whether the signal has fired, without waiting.
    pub fn try_recv(&self) -> bool {
        self.inner.signaled.load(Ordering::Acquire)
    }

    /// Fire the signal through this and every cloned instance.
    pub fn signal(&self) {
        self.inner.signaled.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
        debug!("shutdown signaled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recv_completes_after_signal() {
        let shutdown = Shutdown::new();
        let watcher = shutdown.clone();

        let handle = tokio::spawn(async move {
            watcher.recv().await;
        });

        shutdown.signal();
        handle.await.expect("watcher task");
    }

    #[tokio::test]
    async fn try_recv_observes_signal_exactly_when_sent() {
        let shutdown = Shutdown::new();
        let watcher = shutdown.clone();

        assert!(!watcher.try_recv());
        shutdown.signal();
        assert!(watcher.try_recv());
        assert!(watcher.try_recv());
    }

    #[tokio::test]
    async fn clones_made_after_signal_still_observe_it() {
        let shutdown = Shutdown::new();
        shutdown.signal();

        let late = shutdown.clone();
        late.recv().await;
    }

    #[tokio::test]
    async fn many_watchers_all_wake() {
        let shutdown = Shutdown::new();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let watcher = shutdown.clone();
            handles.push(tokio::spawn(async move {
                watcher.recv().await;
            }));
        }

        shutdown.signal();
        for handle in handles {
            handle.await.expect("watcher task");
        }
    }
}
