//! The single asynchronous I/O loop driving the core.
//!
//! The reactor owns a current-thread tokio runtime; every socket, file
//! operation, timer, and resource-table mutation happens on the thread that
//! drives it. Other threads reach the reactor only through the
//! [`Dispatcher`].
//!
//! Two drive policies exist:
//!
//! - **Dedicated thread** (the default): `start()` spawns a named loop
//!   thread that polls until stopped or paused.
//! - **Host-driven**: when `LoopSettings::dedicated_thread` is false the
//!   embedder interleaves I/O with its own UI main loop by calling
//!   [`Reactor::step`] — one call is one non-blocking loop turn, bounded by
//!   `max_wait`.
//!
//! Pausing parks the loop but keeps the runtime — and every pending task and
//! handle — intact, so `resume()` continues exactly where the loop left off.

pub mod dispatcher;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tokio::runtime::{Builder, Runtime};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::LoopSettings;

pub use dispatcher::{Dispatcher, Job};

/// Upper bound on a single poll turn's sleep, so externally posted work is
/// picked up promptly even when no I/O is in flight.
pub const EVENT_LOOP_POLL_TIMEOUT: Duration = Duration::from_millis(256);

/// Errors from reactor run-state transitions.
#[derive(Debug, Error)]
pub enum ReactorError {
    #[error("reactor is already running")]
    AlreadyRunning,

    #[error("reactor is paused or shutting down")]
    Suspended,

    #[error("reactor has been stopped")]
    Stopped,

    #[error("reactor is host-driven; drive it with step()")]
    HostDriven,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Idle,
    Running,
    Paused,
    Stopped,
}

struct Inner {
    state: RunState,
    shutting_down: bool,
    session: CancellationToken,
    thread: Option<thread::JoinHandle<()>>,
}

/// The event loop. One instance per [`crate::lifecycle::Core`].
pub struct Reactor {
    settings: LoopSettings,
    dispatcher: Dispatcher,
    rx: Arc<tokio::sync::Mutex<UnboundedReceiver<Job>>>,
    runtime: std::sync::Mutex<Option<Arc<Runtime>>>,
    inner: std::sync::Mutex<Inner>,
}

impl Reactor {
    /// Creates a reactor. The loop is not constructed until [`init`].
    ///
    /// [`init`]: Reactor::init
    pub fn new(settings: LoopSettings) -> Self {
        let (dispatcher, rx) = Dispatcher::new();
        Self {
            settings,
            dispatcher,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            runtime: std::sync::Mutex::new(None),
            inner: std::sync::Mutex::new(Inner {
                state: RunState::Idle,
                shutting_down: false,
                session: CancellationToken::new(),
                thread: None,
            }),
        }
    }

    /// Constructs the loop. Idempotent.
    pub fn init(&self) {
        let mut runtime = self.runtime.lock().unwrap();
        if runtime.is_none() {
            let rt = Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("reactor runtime construction cannot fail");
            *runtime = Some(Arc::new(rt));
            debug!("reactor loop initialized");
        }
    }

    /// Starts polling.
    ///
    /// Fails if the loop is already running, paused, or the process is
    /// shutting down. In host-driven mode this only flips the running flag;
    /// the embedder drives turns via [`step`].
    ///
    /// [`step`]: Reactor::step
    pub fn start(&self) -> Result<(), ReactorError> {
        self.init();

        let mut inner = self.inner.lock().unwrap();
        if inner.shutting_down {
            return Err(ReactorError::Suspended);
        }
        match inner.state {
            RunState::Running => return Err(ReactorError::AlreadyRunning),
            RunState::Paused => return Err(ReactorError::Suspended),
            RunState::Idle | RunState::Stopped => {}
        }

        inner.session = CancellationToken::new();
        inner.state = RunState::Running;

        if self.settings.dedicated_thread {
            inner.thread = Some(self.spawn_poll_thread(inner.session.clone()));
        }

        info!(
            dedicated_thread = self.settings.dedicated_thread,
            "reactor started"
        );
        Ok(())
    }

    /// Stops the loop and closes it.
    ///
    /// Outstanding operations are cancelled by dropping the runtime, which
    /// closes every handle it owns. A stopped reactor can be started again;
    /// [`start`] rebuilds the loop.
    ///
    /// [`start`]: Reactor::start
    pub fn stop(&self) {
        let thread = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state == RunState::Stopped {
                return;
            }
            inner.session.cancel();
            inner.state = RunState::Stopped;
            inner.thread.take()
        };

        if let Some(handle) = thread {
            if handle.join().is_err() {
                warn!("reactor poll thread panicked during stop");
            }
        }

        // Dropping the runtime tears down every task and I/O handle.
        *self.runtime.lock().unwrap() = None;
        info!("reactor stopped");
    }

    /// Pauses the loop after draining the dispatch queue.
    ///
    /// The runtime is retained so [`resume`] continues pending work. Must
    /// not be called from the reactor thread itself.
    ///
    /// [`resume`]: Reactor::resume
    pub fn pause(&self) {
        let thread = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != RunState::Running {
                return;
            }

            // Dispatched-but-unrun work must be observed before parking.
            // Host-driven loops have no thread to drain for; the embedder
            // steps until idle before pausing.
            while self.settings.dedicated_thread
                && self.dispatcher.pending() > 0
                && !inner.session.is_cancelled()
            {
                drop(inner);
                thread::sleep(Duration::from_millis(1));
                inner = self.inner.lock().unwrap();
            }

            inner.session.cancel();
            inner.state = RunState::Paused;
            inner.thread.take()
        };

        if let Some(handle) = thread {
            if handle.join().is_err() {
                warn!("reactor poll thread panicked during pause");
            }
        }
        info!("reactor paused");
    }

    /// Restarts polling after [`pause`].
    ///
    /// [`pause`]: Reactor::pause
    pub fn resume(&self) -> Result<(), ReactorError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            RunState::Paused => {}
            RunState::Running => return Err(ReactorError::AlreadyRunning),
            RunState::Stopped => return Err(ReactorError::Stopped),
            RunState::Idle => return Err(ReactorError::Suspended),
        }

        inner.session = CancellationToken::new();
        inner.state = RunState::Running;
        if self.settings.dedicated_thread {
            inner.thread = Some(self.spawn_poll_thread(inner.session.clone()));
        }
        info!("reactor resumed");
        Ok(())
    }

    /// Thread-safe signal that new dispatched work exists.
    pub fn wake(&self) {
        self.dispatcher.wake();
    }

    /// Enqueues `f` onto the reactor thread.
    pub fn dispatch(&self, f: impl FnOnce() + Send + 'static) {
        self.dispatcher.dispatch(f);
    }

    /// The dispatcher handle, cloneable for services.
    pub fn dispatcher(&self) -> Dispatcher {
        self.dispatcher.clone()
    }

    /// Whether the loop is currently polling (or steppable).
    pub fn is_running(&self) -> bool {
        self.inner.lock().unwrap().state == RunState::Running
    }

    /// Marks the process as shutting down, causing [`start`] to fail.
    ///
    /// [`start`]: Reactor::start
    pub(crate) fn mark_shutting_down(&self, value: bool) {
        self.inner.lock().unwrap().shutting_down = value;
    }

    /// Drives one host-driven loop turn: drains dispatched work, polls I/O
    /// and timers, and returns after at most `max_wait`.
    ///
    /// Returns `false` once the reactor is no longer running, letting the
    /// embedder detach its loop source. Only meaningful when
    /// `dedicated_thread` is false.
    pub fn step(&self, max_wait: Duration) -> bool {
        let (session, runtime) = {
            let inner = self.inner.lock().unwrap();
            if inner.state != RunState::Running {
                return false;
            }
            let runtime = self.runtime.lock().unwrap().clone();
            match runtime {
                Some(rt) => (inner.session.clone(), rt),
                None => return false,
            }
        };

        let rx = Arc::clone(&self.rx);
        let wake = self.dispatcher.wake_handle();

        runtime.block_on(async move {
            let mut rx = rx.lock().await;
            let deadline = tokio::time::sleep(max_wait);
            tokio::pin!(deadline);

            loop {
                tokio::select! {
                    biased;

                    _ = session.cancelled() => break,

                    job = rx.recv() => match job {
                        Some(job) => job(),
                        None => break,
                    },

                    _ = wake.notified() => {}

                    _ = &mut deadline => break,
                }
            }
        });

        self.is_running()
    }

    fn spawn_poll_thread(&self, session: CancellationToken) -> thread::JoinHandle<()> {
        let runtime = self
            .runtime
            .lock()
            .unwrap()
            .clone()
            .expect("start() initializes the runtime");
        let rx = Arc::clone(&self.rx);
        let wake = self.dispatcher.wake_handle();
        let poll_timeout = self.settings.poll_timeout;

        thread::Builder::new()
            .name("ionbridge-reactor".to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    let mut rx = rx.lock().await;
                    loop {
                        tokio::select! {
                            biased;

                            _ = session.cancelled() => break,

                            job = rx.recv() => match job {
                                Some(job) => job(),
                                None => break,
                            },

                            _ = wake.notified() => {}

                            // Bounded sleep so flag changes are noticed even
                            // with no I/O in flight.
                            _ = tokio::time::sleep(poll_timeout) => {}
                        }
                    }
                });
                debug!("reactor poll thread exiting");
            })
            .expect("failed to spawn reactor thread")
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.stop();
    }
}
