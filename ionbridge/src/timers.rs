//! User-facing timers and the core's private housekeeping sweeps.
//!
//! `set_timeout`/`set_immediate`/`set_interval` hand back ids usable from
//! any thread; callbacks run on the reactor thread. Intervals drift when the
//! loop is busy — ticks are never replayed to catch up.
//!
//! The service also owns three periodic sweeps started with the reactor
//! (restart-if-present, so pause/resume cycles keep their periodicity):
//! descriptor reclaim, the shared-buffer ledger, and queued-response expiry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::buffers::SharedBufferLedger;
use crate::config::LedgerSettings;
use crate::fs::FsService;
use crate::id::{rand64, Id};
use crate::reactor::Dispatcher;
use crate::response::{ResponseStore, SWEEP_INTERVAL};

/// Period of the descriptor cleanup ledger.
pub const DESCRIPTOR_SWEEP_INTERVAL: Duration = Duration::from_millis(1024);

/// Resolution of the shared-buffer ledger sweep.
pub const BUFFER_SWEEP_RESOLUTION: Duration = Duration::from_millis(8);

/// Timer flavors. Ids are namespaced per kind: clearing a timeout with an
/// interval's id reports `false`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Timeout,
    Immediate,
    Interval,
}

struct TimerEntry {
    kind: TimerKind,
    abort: Option<AbortHandle>,
}

/// One-shot, immediate, and periodic timers keyed by id.
pub struct TimerService {
    dispatcher: Dispatcher,
    entries: Arc<Mutex<HashMap<Id, TimerEntry>>>,
    housekeeping: Arc<Mutex<Vec<AbortHandle>>>,
}

impl TimerService {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher,
            entries: Arc::new(Mutex::new(HashMap::new())),
            housekeeping: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Fires `cb` once, approximately `ms` milliseconds from now.
    pub fn set_timeout(&self, ms: u64, cb: impl FnOnce() + Send + 'static) -> Id {
        self.schedule_once(TimerKind::Timeout, Duration::from_millis(ms), cb)
    }

    /// Fires `cb` on the next reactor turn.
    pub fn set_immediate(&self, cb: impl FnOnce() + Send + 'static) -> Id {
        self.schedule_once(TimerKind::Immediate, Duration::ZERO, cb)
    }

    /// Fires `cb` at approximately `ms` millisecond intervals until cleared.
    pub fn set_interval(&self, ms: u64, cb: impl Fn() + Send + 'static) -> Id {
        let id = rand64();
        let period = Duration::from_millis(ms);
        self.entries.lock().unwrap().insert(
            id,
            TimerEntry {
                kind: TimerKind::Interval,
                abort: None,
            },
        );

        let entries = Arc::clone(&self.entries);
        self.dispatcher.dispatch(move || {
            if !entries.lock().unwrap().contains_key(&id) {
                return;
            }

            let tick_entries = Arc::clone(&entries);
            let handle = tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                // The first tick of tokio's interval completes immediately.
                interval.tick().await;
                loop {
                    interval.tick().await;
                    if !tick_entries.lock().unwrap().contains_key(&id) {
                        break;
                    }
                    cb();
                }
            })
            .abort_handle();

            attach(&entries, id, handle);
        });
        id
    }

    pub fn clear_timeout(&self, id: Id) -> bool {
        self.clear(id, TimerKind::Timeout)
    }

    pub fn clear_immediate(&self, id: Id) -> bool {
        self.clear(id, TimerKind::Immediate)
    }

    pub fn clear_interval(&self, id: Id) -> bool {
        self.clear(id, TimerKind::Interval)
    }

    /// Number of live timer entries.
    pub fn active(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Starts the housekeeping sweeps. Restart-if-present: calling again
    /// (e.g. after a resume) replaces any prior set of sweepers.
    pub fn start_housekeeping(
        &self,
        fs: Arc<FsService>,
        buffers: Arc<SharedBufferLedger>,
        store: Arc<ResponseStore>,
        settings: LedgerSettings,
    ) {
        self.stop_housekeeping();

        let handles = Arc::clone(&self.housekeeping);
        self.dispatcher.dispatch(move || {
            let descriptor_sweep = spawn_periodic(DESCRIPTOR_SWEEP_INTERVAL, move || {
                let reclaimed = fs.reclaim_stale(settings.descriptor_stale_after);
                if reclaimed > 0 {
                    debug!(reclaimed, "descriptor cleanup ledger closed stale handles");
                }
            });
            let buffer_sweep = spawn_periodic(BUFFER_SWEEP_RESOLUTION, move || {
                buffers.sweep(BUFFER_SWEEP_RESOLUTION);
            });
            let response_sweep = spawn_periodic(SWEEP_INTERVAL, move || {
                store.expire();
            });

            *handles.lock().unwrap() =
                vec![descriptor_sweep, buffer_sweep, response_sweep];
            debug!("housekeeping sweeps started");
        });
    }

    /// Stops the housekeeping sweeps. Idempotent.
    pub fn stop_housekeeping(&self) {
        let mut handles = self.housekeeping.lock().unwrap();
        for handle in handles.drain(..) {
            handle.abort();
        }
    }

    fn schedule_once(
        &self,
        kind: TimerKind,
        delay: Duration,
        cb: impl FnOnce() + Send + 'static,
    ) -> Id {
        let id = rand64();
        self.entries
            .lock()
            .unwrap()
            .insert(id, TimerEntry { kind, abort: None });

        let entries = Arc::clone(&self.entries);
        self.dispatcher.dispatch(move || {
            if !entries.lock().unwrap().contains_key(&id) {
                return;
            }

            let fire_entries = Arc::clone(&entries);
            let handle = tokio::spawn(async move {
                if delay > Duration::ZERO {
                    tokio::time::sleep(delay).await;
                }
                // Exactly-once: whoever removes the entry owns the firing.
                if fire_entries.lock().unwrap().remove(&id).is_some() {
                    cb();
                }
            })
            .abort_handle();

            attach(&entries, id, handle);
        });
        id
    }

    fn clear(&self, id: Id, kind: TimerKind) -> bool {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(&id) {
            Some(entry) if entry.kind == kind => {
                if let Some(entry) = entries.remove(&id) {
                    if let Some(abort) = entry.abort {
                        abort.abort();
                    }
                }
                true
            }
            _ => false,
        }
    }
}

fn attach(entries: &Mutex<HashMap<Id, TimerEntry>>, id: Id, handle: AbortHandle) {
    match entries.lock().unwrap().get_mut(&id) {
        Some(entry) => entry.abort = Some(handle),
        // Cleared between scheduling and spawn.
        None => handle.abort(),
    }
}

fn spawn_periodic(period: Duration, tick: impl Fn() + Send + 'static) -> AbortHandle {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;
        loop {
            interval.tick().await;
            tick();
        }
    })
    .abort_handle()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoopSettings;
    use crate::reactor::Reactor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    fn running_reactor() -> Reactor {
        let reactor = Reactor::new(LoopSettings::default());
        reactor.start().unwrap();
        reactor
    }

    fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    #[test]
    fn timeout_fires_once() {
        let reactor = running_reactor();
        let timers = TimerService::new(reactor.dispatcher());
        let hits = Arc::new(AtomicUsize::new(0));

        let hits_clone = Arc::clone(&hits);
        timers.set_timeout(50, move || {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert!(wait_until(Duration::from_secs(2), || {
            hits.load(Ordering::SeqCst) == 1
        }));
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(timers.active(), 0, "fired timers leave the table");
        reactor.stop();
    }

    #[test]
    fn cleared_timeout_never_fires() {
        let reactor = running_reactor();
        let timers = TimerService::new(reactor.dispatcher());
        let hits = Arc::new(AtomicUsize::new(0));

        let hits_clone = Arc::clone(&hits);
        let id = timers.set_timeout(50, move || {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert!(timers.clear_timeout(id));
        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(!timers.clear_timeout(id), "second clear reports unknown");
        reactor.stop();
    }

    #[test]
    fn immediate_runs_soon() {
        let reactor = running_reactor();
        let timers = TimerService::new(reactor.dispatcher());
        let hits = Arc::new(AtomicUsize::new(0));

        let hits_clone = Arc::clone(&hits);
        timers.set_immediate(move || {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert!(wait_until(Duration::from_secs(1), || {
            hits.load(Ordering::SeqCst) == 1
        }));
        reactor.stop();
    }

    #[test]
    fn interval_ticks_until_cleared() {
        let reactor = running_reactor();
        let timers = TimerService::new(reactor.dispatcher());
        let hits = Arc::new(AtomicUsize::new(0));

        let hits_clone = Arc::clone(&hits);
        let id = timers.set_interval(20, move || {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert!(wait_until(Duration::from_secs(2), || {
            hits.load(Ordering::SeqCst) >= 3
        }));

        assert!(timers.clear_interval(id));
        let frozen = hits.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(120));
        // One tick may have been mid-flight at clear time; none after.
        assert!(hits.load(Ordering::SeqCst) <= frozen + 1);
        reactor.stop();
    }

    #[test]
    fn clear_is_namespaced_by_kind() {
        let reactor = running_reactor();
        let timers = TimerService::new(reactor.dispatcher());

        let id = timers.set_interval(1000, || {});
        assert!(!timers.clear_timeout(id));
        assert!(!timers.clear_immediate(id));
        assert!(timers.clear_interval(id));
        reactor.stop();
    }

    #[test]
    fn clear_unknown_id_reports_false() {
        let reactor = running_reactor();
        let timers = TimerService::new(reactor.dispatcher());
        assert!(!timers.clear_timeout(12345));
        assert!(!timers.clear_interval(12345));
        reactor.stop();
    }
}
