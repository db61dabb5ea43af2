//! Cross-thread dispatch onto the reactor.
//!
//! The dispatcher is a bounded-latency channel: any thread may push a
//! callable, and the reactor loop drains them one per turn, in FIFO order
//! per producer. A callable dispatched from within another callable is
//! observed on a later turn, never recursively.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::Notify;
use tracing::error;

/// A unit of work crossing onto the reactor thread.
///
/// Callables must not panic; any failure belongs in the reply they produce.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Thread-safe queue of callables bound for the reactor thread.
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<Job>,
    wake: Arc<Notify>,
    depth: Arc<AtomicUsize>,
}

impl Dispatcher {
    /// Creates the dispatcher and the receiver end the reactor loop drains.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Job>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = Self {
            tx,
            wake: Arc::new(Notify::new()),
            depth: Arc::new(AtomicUsize::new(0)),
        };
        (dispatcher, rx)
    }

    /// Enqueues `f` for execution on the reactor thread and wakes the loop.
    ///
    /// Work dispatched from one thread runs in the order that thread
    /// enqueued it. Work from distinct threads interleaves arbitrarily.
    pub fn dispatch(&self, f: impl FnOnce() + Send + 'static) {
        let depth = Arc::clone(&self.depth);
        depth.fetch_add(1, Ordering::SeqCst);

        let job: Job = Box::new(move || {
            if catch_unwind(AssertUnwindSafe(f)).is_err() {
                error!("dispatched callable panicked; reactor loop continues");
            }
            depth.fetch_sub(1, Ordering::SeqCst);
        });

        if self.tx.send(job).is_err() {
            // Loop already torn down; the callable is dropped.
            self.depth.fetch_sub(1, Ordering::SeqCst);
        }
        self.wake.notify_one();
    }

    /// Signals the loop that new work may exist, without enqueueing any.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// The wake handle the reactor loop selects on.
    pub(crate) fn wake_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    /// Number of callables enqueued but not yet completed.
    pub fn pending(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn dispatch_is_fifo_per_producer() {
        let (dispatcher, mut rx) = Dispatcher::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..10 {
            let order = Arc::clone(&order);
            dispatcher.dispatch(move || order.lock().unwrap().push(i));
        }

        while let Ok(job) = rx.try_recv() {
            job();
        }

        assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn pending_tracks_unfinished_work() {
        let (dispatcher, mut rx) = Dispatcher::new();
        dispatcher.dispatch(|| {});
        dispatcher.dispatch(|| {});
        assert_eq!(dispatcher.pending(), 2);

        rx.try_recv().unwrap()();
        assert_eq!(dispatcher.pending(), 1);

        rx.try_recv().unwrap()();
        assert_eq!(dispatcher.pending(), 0);
    }

    #[tokio::test]
    async fn panicking_callable_is_contained() {
        let (dispatcher, mut rx) = Dispatcher::new();
        dispatcher.dispatch(|| panic!("boom"));
        rx.try_recv().unwrap()();
        assert_eq!(dispatcher.pending(), 0);
    }

    #[tokio::test]
    async fn dispatch_after_teardown_is_dropped() {
        let (dispatcher, rx) = Dispatcher::new();
        drop(rx);
        dispatcher.dispatch(|| {});
        assert_eq!(dispatcher.pending(), 0);
    }
}
