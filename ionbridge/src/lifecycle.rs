//! Lifecycle controller: owns every subsystem and orchestrates init, pause,
//! resume, and shutdown.
//!
//! State machine: `Initial → Running ↔ Paused → ShuttingDown → Terminated`,
//! with idempotent transitions. Optional collaborators — network-status
//! polling, the conduit server, the notification bridge, and the
//! child-process supervisor — live outside this crate and register through
//! the [`Subsystem`] trait; the controller only sequences them.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use thiserror::Error;
use tracing::info;

use crate::buffers::SharedBufferLedger;
use crate::config::CoreOptions;
use crate::fs::FsService;
use crate::ipc::reply::ReplyFn;
use crate::ipc::{routes, Router};
use crate::net::dns::DnsService;
use crate::net::tcp::TcpService;
use crate::net::udp::UdpService;
use crate::net::SocketTable;
use crate::reactor::{Reactor, ReactorError};
use crate::response::ResponseStore;
use crate::timers::TimerService;

/// The controller's finite states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Initial,
    Running,
    Paused,
    ShuttingDown,
    Terminated,
}

/// Errors from lifecycle transitions.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("cannot start from {0:?}")]
    NotStartable(LifecycleState),

    #[error(transparent)]
    Reactor(#[from] ReactorError),
}

/// An externally owned collaborator sequenced by the controller.
pub trait Subsystem: Send + Sync {
    fn start(&self);
    fn stop(&self);
    /// Final teardown; defaults to [`stop`](Subsystem::stop).
    fn shutdown(&self) {
        self.stop();
    }
}

#[derive(Default)]
struct Subsystems {
    network_status: Option<Arc<dyn Subsystem>>,
    conduit: Option<Arc<dyn Subsystem>>,
    notifications: Option<Arc<dyn Subsystem>>,
    child_process: Option<Arc<dyn Subsystem>>,
}

/// The runtime core: reactor, services, stores, router, and the lifecycle
/// state machine tying them together.
pub struct Core {
    options: CoreOptions,
    reactor: Arc<Reactor>,
    timers: Arc<TimerService>,
    fs: Arc<FsService>,
    tcp: Arc<TcpService>,
    udp: Arc<UdpService>,
    dns: Arc<DnsService>,
    responses: Arc<ResponseStore>,
    buffers: Arc<SharedBufferLedger>,
    router: Arc<Router>,
    state: Mutex<LifecycleState>,
    subsystems: Mutex<Subsystems>,
}

impl Core {
    /// Builds the core and maps the default route table.
    pub fn new(options: CoreOptions) -> Arc<Self> {
        let reactor = Arc::new(Reactor::new(options.event_loop.clone()));
        let dispatcher = reactor.dispatcher();

        let responses = Arc::new(ResponseStore::new(options.ledgers.response_ttl));
        let buffers = Arc::new(SharedBufferLedger::new());
        let sockets: Arc<SocketTable> = Arc::new(SocketTable::new());
        let buffer_ttl = options.ledgers.buffer_ttl;

        let core = Arc::new(Self {
            timers: Arc::new(TimerService::new(dispatcher.clone())),
            fs: Arc::new(FsService::new(
                dispatcher.clone(),
                Arc::clone(&responses),
                Arc::clone(&buffers),
                buffer_ttl,
            )),
            tcp: Arc::new(TcpService::new(
                dispatcher.clone(),
                Arc::clone(&sockets),
                Arc::clone(&responses),
                Arc::clone(&buffers),
                buffer_ttl,
            )),
            udp: Arc::new(UdpService::new(
                dispatcher.clone(),
                Arc::clone(&sockets),
                Arc::clone(&responses),
                Arc::clone(&buffers),
                buffer_ttl,
            )),
            dns: Arc::new(DnsService::new(dispatcher.clone())),
            router: Arc::new(Router::new(dispatcher)),
            responses,
            buffers,
            reactor,
            options,
            state: Mutex::new(LifecycleState::Initial),
            subsystems: Mutex::new(Subsystems::default()),
        });

        routes::map_routes(&core);
        core
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock().unwrap()
    }

    pub fn options(&self) -> &CoreOptions {
        &self.options
    }

    pub fn reactor(&self) -> &Arc<Reactor> {
        &self.reactor
    }

    pub fn router(&self) -> Arc<Router> {
        Arc::clone(&self.router)
    }

    pub fn timers(&self) -> &Arc<TimerService> {
        &self.timers
    }

    pub fn fs(&self) -> &Arc<FsService> {
        &self.fs
    }

    pub fn tcp(&self) -> &Arc<TcpService> {
        &self.tcp
    }

    pub fn udp(&self) -> &Arc<UdpService> {
        &self.udp
    }

    pub fn dns(&self) -> &Arc<DnsService> {
        &self.dns
    }

    pub fn responses(&self) -> &Arc<ResponseStore> {
        &self.responses
    }

    pub fn buffers(&self) -> &Arc<SharedBufferLedger> {
        &self.buffers
    }

    /// Shorthand for `router().invoke(...)`.
    pub fn invoke(&self, uri: &str, body: Option<Bytes>, cb: ReplyFn) -> bool {
        self.router.invoke(uri, body, cb)
    }

    pub fn register_network_status(&self, subsystem: Arc<dyn Subsystem>) {
        self.subsystems.lock().unwrap().network_status = Some(subsystem);
    }

    pub fn register_conduit(&self, subsystem: Arc<dyn Subsystem>) {
        self.subsystems.lock().unwrap().conduit = Some(subsystem);
    }

    pub fn register_notifications(&self, subsystem: Arc<dyn Subsystem>) {
        self.subsystems.lock().unwrap().notifications = Some(subsystem);
    }

    pub fn register_child_process(&self, subsystem: Arc<dyn Subsystem>) {
        self.subsystems.lock().unwrap().child_process = Some(subsystem);
    }

    /// `Initial → Running`: starts the reactor, housekeeping sweeps, and
    /// feature-gated subsystems. Idempotent while already running.
    pub fn start(&self) -> Result<(), LifecycleError> {
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                LifecycleState::Initial => *state = LifecycleState::Running,
                LifecycleState::Running => return Ok(()),
                other => return Err(LifecycleError::NotStartable(other)),
            }
        }

        self.reactor.start()?;
        self.timers.start_housekeeping(
            Arc::clone(&self.fs),
            Arc::clone(&self.buffers),
            Arc::clone(&self.responses),
            self.options.ledgers.clone(),
        );

        let features = &self.options.features;
        if features.use_network_status {
            self.with_subsystem(|s| s.network_status.clone(), |s| s.start());
        }
        if features.use_conduit {
            self.with_subsystem(|s| s.conduit.clone(), |s| s.start());
        }
        if features.use_notifications {
            self.with_subsystem(|s| s.notifications.clone(), |s| s.start());
        }

        info!("core running");
        Ok(())
    }

    /// `Running → Paused`: quiesces UDP recv, network-status polling, the
    /// conduit server, and notifications — in that order — then parks the
    /// reactor. Idempotent.
    pub fn pause(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if *state != LifecycleState::Running {
                return;
            }
            *state = LifecycleState::Paused;
        }

        self.quiesce();
        self.reactor.pause();
        info!("core paused");
    }

    /// `Paused → Running`: restarts the reactor, then reverses the pause
    /// order. Idempotent.
    pub fn resume(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if *state != LifecycleState::Paused {
                return;
            }
            *state = LifecycleState::Running;
        }

        // The runtime kept every pending task; restart polling first so the
        // subsystems come back onto a live loop.
        let _ = self.reactor.resume();

        let features = &self.options.features;
        if features.use_notifications {
            self.with_subsystem(|s| s.notifications.clone(), |s| s.start());
        }
        if features.use_conduit {
            self.with_subsystem(|s| s.conduit.clone(), |s| s.start());
        }
        if features.use_network_status {
            self.with_subsystem(|s| s.network_status.clone(), |s| s.start());
        }
        if features.use_udp {
            self.udp.resume_all_sockets();
        }

        info!("core resumed");
    }

    /// `→ ShuttingDown → Terminated`: quiesces if needed, tears down the
    /// child-process supervisor (non-iOS), then stops the reactor and drops
    /// pending responses. Idempotent.
    pub fn shutdown(&self) {
        let prior = {
            let mut state = self.state.lock().unwrap();
            match *state {
                LifecycleState::ShuttingDown | LifecycleState::Terminated => return,
                prior => {
                    *state = LifecycleState::ShuttingDown;
                    prior
                }
            }
        };

        self.reactor.mark_shutting_down(true);

        if prior == LifecycleState::Running {
            self.quiesce();
            self.reactor.pause();
        }

        if !cfg!(target_os = "ios") {
            self.with_subsystem(|s| s.child_process.clone(), |s| s.shutdown());
        }

        self.timers.stop_housekeeping();
        self.reactor.stop();
        self.responses.remove_all();

        *self.state.lock().unwrap() = LifecycleState::Terminated;
        info!("core terminated");
    }

    fn quiesce(&self) {
        let features = &self.options.features;
        if features.use_udp {
            self.udp.pause_all_sockets();
        }
        if features.use_network_status {
            self.with_subsystem(|s| s.network_status.clone(), |s| s.stop());
        }
        if features.use_conduit {
            self.with_subsystem(|s| s.conduit.clone(), |s| s.stop());
        }
        if features.use_notifications {
            self.with_subsystem(|s| s.notifications.clone(), |s| s.stop());
        }
    }

    fn with_subsystem(
        &self,
        pick: impl FnOnce(&Subsystems) -> Option<Arc<dyn Subsystem>>,
        act: impl FnOnce(&dyn Subsystem),
    ) {
        // Clone out under the lock; never call user code while holding it.
        let subsystem = pick(&self.subsystems.lock().unwrap());
        if let Some(subsystem) = subsystem {
            act(subsystem.as_ref());
        }
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingSubsystem {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Subsystem for RecordingSubsystem {
        fn start(&self) {
            self.log.lock().unwrap().push(format!("{}:start", self.name));
        }
        fn stop(&self) {
            self.log.lock().unwrap().push(format!("{}:stop", self.name));
        }
    }

    fn record(name: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Arc<dyn Subsystem> {
        Arc::new(RecordingSubsystem {
            name,
            log: Arc::clone(log),
        })
    }

    #[test]
    fn start_transitions_initial_to_running() {
        let core = Core::new(CoreOptions::default());
        assert_eq!(core.state(), LifecycleState::Initial);

        core.start().unwrap();
        assert_eq!(core.state(), LifecycleState::Running);

        // Idempotent.
        core.start().unwrap();
        assert_eq!(core.state(), LifecycleState::Running);

        core.shutdown();
        assert_eq!(core.state(), LifecycleState::Terminated);
    }

    #[test]
    fn pause_resume_round_trip() {
        let core = Core::new(CoreOptions::default());
        core.start().unwrap();

        core.pause();
        assert_eq!(core.state(), LifecycleState::Paused);
        core.pause();
        assert_eq!(core.state(), LifecycleState::Paused);

        core.resume();
        assert_eq!(core.state(), LifecycleState::Running);
        core.resume();
        assert_eq!(core.state(), LifecycleState::Running);

        core.shutdown();
    }

    #[test]
    fn subsystem_order_on_pause_and_resume() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let core = Core::new(CoreOptions::default());
        core.register_network_status(record("network-status", &log));
        core.register_conduit(record("conduit", &log));
        core.register_notifications(record("notifications", &log));

        core.start().unwrap();
        log.lock().unwrap().clear();

        core.pause();
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "network-status:stop",
                "conduit:stop",
                "notifications:stop"
            ]
        );

        log.lock().unwrap().clear();
        core.resume();
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "notifications:start",
                "conduit:start",
                "network-status:start"
            ]
        );

        core.shutdown();
    }

    #[test]
    fn disabled_features_skip_subsystems() {
        let mut options = CoreOptions::default();
        options.features.use_conduit = false;

        let log = Arc::new(Mutex::new(Vec::new()));
        let core = Core::new(options);
        core.register_conduit(record("conduit", &log));

        core.start().unwrap();
        core.pause();
        core.resume();
        core.shutdown();

        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn shutdown_is_idempotent_and_terminal() {
        let core = Core::new(CoreOptions::default());
        core.start().unwrap();

        core.shutdown();
        assert_eq!(core.state(), LifecycleState::Terminated);
        core.shutdown();
        assert_eq!(core.state(), LifecycleState::Terminated);

        assert!(core.start().is_err());
    }

    #[test]
    fn shutdown_from_paused_is_allowed() {
        let core = Core::new(CoreOptions::default());
        core.start().unwrap();
        core.pause();
        core.shutdown();
        assert_eq!(core.state(), LifecycleState::Terminated);
    }

    #[test]
    fn child_process_supervisor_shuts_down() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let core = Core::new(CoreOptions::default());
        core.register_child_process(record("child-process", &log));

        core.start().unwrap();
        core.shutdown();

        assert_eq!(*log.lock().unwrap(), vec!["child-process:stop"]);
    }
}
