// Supervisor: the state machine around one winws instance
//
// All state lives in `Supervisor` and is only touched from the control loop.
// Spawning, confirming, terminating and drift detection run in
// spawn_blocking workers that report back over a channel, so the loop never
// waits on the OS.

mod state;
mod worker;

pub use state::{State, Status, SupervisorEvent};
pub use worker::StartOrigin;

use crate::backends::process::{ProcessTable, SpawnedChild};
use crate::catalog::Catalog;
use crate::config::{SettingsStore, SupervisorTimings};
use crate::drift::DriftDetector;
use crate::error::SupervisorError;
use crate::launch::{ResourceLayout, materialize};
use crate::monitor::ProcessMonitor;
use crate::plan::LaunchPlanBuilder;
use chrono::Local;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use worker::{StartOutcome, WorkerEvent};

const EVENT_CAPACITY: usize = 64;
const COMMAND_CAPACITY: usize = 32;

/// Bookkeeping for the one start worker allowed in flight
struct StartTicket {
    id: String,
    origin: StartOrigin,
    abandon: Arc<AtomicBool>,
}

/// Requests accepted by the control loop
#[derive(Debug)]
pub enum Command {
    Start {
        id: String,
        reply: oneshot::Sender<Result<(), SupervisorError>>,
    },
    Stop {
        reply: oneshot::Sender<Result<(), SupervisorError>>,
    },
    Status {
        reply: oneshot::Sender<Status>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

pub struct Supervisor {
    monitor: ProcessMonitor,
    catalog: Catalog,
    layout: ResourceLayout,
    builder: LaunchPlanBuilder,
    settings: Box<dyn SettingsStore>,
    timings: SupervisorTimings,

    status: Status,
    /// Last strategy that reached Running or was detected; used for restarts
    last_known_id: Option<String>,

    /// Set by an explicit stop; blocks auto-restart until the next explicit start
    user_stopped: bool,
    /// Guard so only one automatic restart is ever pending
    restart_in_flight: bool,
    restart_timer: Option<JoinHandle<()>>,

    start_ticket: Option<StartTicket>,
    /// Stop requested while Starting; applied when the start worker reports
    stop_pending: bool,
    stop_in_flight: bool,
    poll_in_flight: bool,
    /// Bumped whenever a worker takes ownership of the process, outdating running polls
    poll_epoch: u64,
    detect_in_flight: bool,
    owned_child: Option<SpawnedChild>,

    /// Strategy to start on the first poll if nothing is running
    pending_autostart: Option<String>,

    worker_tx: mpsc::UnboundedSender<WorkerEvent>,
    worker_rx: mpsc::UnboundedReceiver<WorkerEvent>,
    events: broadcast::Sender<SupervisorEvent>,
}

impl Supervisor {
    pub fn new(
        table: Arc<dyn ProcessTable>,
        layout: ResourceLayout,
        settings: Box<dyn SettingsStore>,
    ) -> Self {
        let (worker_tx, worker_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            monitor: ProcessMonitor::new(table),
            catalog: Catalog::new(&layout),
            layout,
            builder: LaunchPlanBuilder::new(),
            settings,
            timings: SupervisorTimings::default(),
            status: Status::default(),
            last_known_id: None,
            user_stopped: false,
            restart_in_flight: false,
            restart_timer: None,
            start_ticket: None,
            stop_pending: false,
            stop_in_flight: false,
            poll_in_flight: false,
            poll_epoch: 0,
            detect_in_flight: false,
            owned_child: None,
            pending_autostart: None,
            worker_tx,
            worker_rx,
            events,
        }
    }

    pub fn with_timings(mut self, timings: SupervisorTimings) -> Self {
        self.timings = timings;
        self
    }

    /// Start `id` on the first poll unless winws is already running
    pub fn with_autostart(mut self, id: Option<String>) -> Self {
        self.pending_autostart = id.filter(|id| !id.is_empty());
        self
    }

    pub fn status(&self) -> &Status {
        &self.status
    }

    pub fn settings(&self) -> &dyn SettingsStore {
        self.settings.as_ref()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SupervisorEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn publish(&self) {
        self.emit(SupervisorEvent::StatusChanged(self.status.clone()));
    }

    fn transition(&mut self, state: State) {
        if self.status.state != state {
            log::info!("Supervisor: {} -> {}", self.status.state, state);
        }
        self.status.state = state;
    }

    fn executable_name(&self) -> String {
        self.layout.executable_name.clone()
    }

    // ---- commands ----------------------------------------------------------

    /// Explicit start from the user
    pub fn start(&mut self, id: &str) -> Result<(), SupervisorError> {
        self.begin_start(id, StartOrigin::User)?;
        self.user_stopped = false;
        self.cancel_restart();
        Ok(())
    }

    fn begin_start(&mut self, id: &str, origin: StartOrigin) -> Result<(), SupervisorError> {
        if self.start_ticket.is_some() {
            return Err(SupervisorError::Busy("start"));
        }
        if self.stop_in_flight {
            return Err(SupervisorError::Busy("stop"));
        }
        if self.status.state != State::Stopped {
            return Err(SupervisorError::InvalidTransition {
                action: "start",
                state: self.status.state,
            });
        }

        let spec = match self.prepare_launch(id) {
            Ok(spec) => spec,
            Err(error) => {
                log::warn!("Refusing to start '{}': {}", id, error);
                self.status.attempted_strategy_id = Some(id.to_string());
                self.emit(SupervisorEvent::StartRejected {
                    id: id.to_string(),
                    error: error.clone(),
                });
                return Err(error);
            }
        };

        self.transition(State::Starting);
        self.status.clear_instance();
        self.status.attempted_strategy_id = Some(id.to_string());
        self.status.launch_timestamp = Some(Local::now());
        self.publish();

        self.poll_epoch += 1;
        let abandon = Arc::new(AtomicBool::new(false));
        self.start_ticket = Some(StartTicket {
            id: id.to_string(),
            origin,
            abandon: abandon.clone(),
        });

        log::info!("Starting strategy '{}' ({:?})", id, origin);
        let monitor = self.monitor.clone();
        let companions = self.settings.current().auto_restart_apps.clone();
        let timings = self.timings;
        let tx = self.worker_tx.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || {
            let outcome = worker::run_start(&monitor, &spec, &companions, &timings, &abandon);
            let _ = tx.send(WorkerEvent::StartFinished {
                id,
                origin,
                outcome,
            });
        });
        Ok(())
    }

    /// Resolve, build and materialize; every failure here is a config error
    fn prepare_launch(&self, id: &str) -> Result<crate::launch::LaunchSpec, SupervisorError> {
        let def = self.catalog.resolve(id)?;

        let game_filter = def.use_game_filter && self.settings.current().game_filter_enabled;
        let plan = self.builder.build(&def.rules, game_filter);
        let spec = materialize(&def, &plan, &self.layout);
        if spec.is_trivial() {
            return Err(SupervisorError::Config(format!(
                "strategy '{}' produces no filter arguments",
                id
            )));
        }
        Ok(spec)
    }

    /// Explicit stop from the user
    ///
    /// Works from Running and ExternallyRunning. During Starting the pending
    /// confirmation is abandoned and whatever was spawned gets terminated.
    /// From Stopped it only cancels a pending automatic restart.
    pub fn stop(&mut self) -> Result<(), SupervisorError> {
        match self.status.state {
            State::Stopped if self.restart_in_flight && self.start_ticket.is_none() => {
                self.user_stopped = true;
                self.cancel_restart();
                log::info!("Cancelled pending automatic restart");
                return Ok(());
            }
            State::Stopped => {
                return Err(SupervisorError::InvalidTransition {
                    action: "stop",
                    state: State::Stopped,
                });
            }
            State::Stopping => return Err(SupervisorError::Busy("stop")),
            State::Starting | State::Running | State::ExternallyRunning => {}
        }

        self.user_stopped = true;
        self.cancel_restart();
        self.transition(State::Stopping);
        self.publish();

        match &self.start_ticket {
            Some(ticket) => {
                log::info!("Abandoning start of '{}'", ticket.id);
                ticket.abandon.store(true, Ordering::SeqCst);
                self.stop_pending = true;
            }
            None => self.dispatch_stop(),
        }
        Ok(())
    }

    fn dispatch_stop(&mut self) {
        self.stop_in_flight = true;
        self.poll_epoch += 1;

        let monitor = self.monitor.clone();
        let name = self.executable_name();
        let grace = self.timings.termination_grace;
        let child = self.owned_child.take();
        let tx = self.worker_tx.clone();
        tokio::task::spawn_blocking(move || {
            let result = worker::run_stop(&monitor, &name, grace, child);
            let _ = tx.send(WorkerEvent::StopFinished(result));
        });
    }

    /// Kick off one liveness check unless another worker owns the process right now
    pub fn poll(&mut self) {
        if self.poll_in_flight || self.start_ticket.is_some() || self.stop_in_flight {
            log::trace!("Skipping liveness poll, work in flight");
            return;
        }
        self.poll_in_flight = true;

        let epoch = self.poll_epoch;
        let monitor = self.monitor.clone();
        let name = self.executable_name();
        let tx = self.worker_tx.clone();
        tokio::task::spawn_blocking(move || {
            let found = monitor.find_first(&name);
            let _ = tx.send(WorkerEvent::Polled { epoch, found });
        });
    }

    fn dispatch_detect(&mut self, argv: Vec<String>) {
        self.detect_in_flight = true;

        let detector = DriftDetector::new(
            self.catalog.clone(),
            self.layout.clone(),
            self.builder.clone(),
            self.settings.current().game_filter_enabled,
        );
        let tx = self.worker_tx.clone();
        tokio::task::spawn_blocking(move || {
            let found = detector.detect(&argv);
            let _ = tx.send(WorkerEvent::Detected(found));
        });
    }

    // ---- restart policy ----------------------------------------------------

    /// Schedule one automatic restart of the last known strategy
    ///
    /// Returns false when policy forbids it or one is already pending.
    fn schedule_restart(&mut self) -> bool {
        if !self.settings.current().auto_restart_enabled {
            return false;
        }
        if self.user_stopped {
            log::debug!("Not restarting, stopped by user");
            return false;
        }
        if self.restart_in_flight {
            log::debug!("Restart already in flight");
            return false;
        }
        let Some(id) = self.last_known_id.clone() else {
            return false;
        };

        self.restart_in_flight = true;
        log::info!(
            "Restarting '{}' in {:?}",
            id,
            self.timings.restart_settle
        );

        let delay = self.timings.restart_settle;
        let tx = self.worker_tx.clone();
        self.restart_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(WorkerEvent::RestartDue { id });
        }));
        true
    }

    fn cancel_restart(&mut self) {
        if let Some(timer) = self.restart_timer.take() {
            timer.abort();
        }
        self.restart_in_flight = false;
    }

    fn on_unexpected_exit(&mut self) {
        log::warn!(
            "winws exited unexpectedly (was {})",
            self.status.strategy_id.as_deref().unwrap_or("unknown strategy")
        );
        if let Some(mut child) = self.owned_child.take() {
            child.reap();
        }
        self.transition(State::Stopped);
        self.status.clear_instance();
        self.publish();
        self.schedule_restart();
    }

    // ---- worker completions ------------------------------------------------

    fn handle_worker_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::StartFinished {
                id,
                origin,
                outcome,
            } => self.on_start_finished(id, origin, outcome),
            WorkerEvent::StopFinished(result) => self.on_stop_finished(result),
            WorkerEvent::Polled { epoch, found } => {
                self.poll_in_flight = false;
                if epoch != self.poll_epoch {
                    log::trace!("Dropping stale liveness poll");
                    return;
                }
                self.on_polled(found);
            }
            WorkerEvent::Detected(found) => {
                self.detect_in_flight = false;
                if self.status.state != State::ExternallyRunning {
                    return;
                }
                if let Some(found) = found {
                    self.last_known_id = Some(found.id.clone());
                    self.status.strategy_id = Some(found.id);
                    self.status.match_confidence = Some(found.confidence);
                    self.publish();
                }
            }
            WorkerEvent::RestartDue { id } => self.on_restart_due(id),
        }
    }

    fn on_start_finished(&mut self, id: String, origin: StartOrigin, outcome: StartOutcome) {
        self.start_ticket = None;
        if origin == StartOrigin::AutoRestart {
            self.restart_in_flight = false;
        }

        if self.stop_pending {
            self.stop_pending = false;
            match outcome {
                StartOutcome::Confirmed { child, .. } => self.owned_child = Some(child),
                StartOutcome::Abandoned { child } => self.owned_child = child,
                StartOutcome::Failed { .. } => {}
            }
            self.dispatch_stop();
            return;
        }

        match outcome {
            StartOutcome::Confirmed { pid, child } => {
                self.owned_child = Some(child);
                self.last_known_id = Some(id.clone());
                self.transition(State::Running);
                self.status.strategy_id = Some(id.clone());
                self.status.session_owned = true;
                self.status.launch_timestamp = None;
                self.status.match_confidence = None;
                log::info!("Strategy '{}' running as pid {}", id, pid);

                if let Err(e) = self.settings.record_last_strategy(&id) {
                    log::warn!("Failed to record last strategy: {:#}", e);
                }
                self.publish();
            }
            StartOutcome::Failed { reason } => {
                let error = SupervisorError::Launch {
                    id: id.clone(),
                    reason,
                };
                log::warn!("{}", error);
                self.transition(State::Stopped);
                self.status.clear_instance();
                self.emit(SupervisorEvent::LaunchFailed { id, error });
                self.publish();
            }
            StartOutcome::Abandoned { child } => {
                // Only reachable through stop_pending, handled above
                self.owned_child = child;
                self.dispatch_stop();
            }
        }
    }

    fn on_stop_finished(&mut self, result: Result<(), SupervisorError>) {
        self.stop_in_flight = false;
        if let Err(error) = result {
            log::error!("Stop incomplete: {}", error);
            self.emit(SupervisorEvent::TerminationFailed(error));
        }
        self.transition(State::Stopped);
        self.status.clear_instance();
        self.publish();
    }

    fn on_polled(&mut self, found: Option<crate::backends::process::ProcessEntry>) {
        // A worker started since the poll was dispatched; its view wins
        if self.start_ticket.is_some() || self.stop_in_flight {
            return;
        }
        let autostart = self.pending_autostart.take();

        match (self.status.state, found) {
            (State::Stopped, Some(entry)) => {
                log::info!("Found running {} (pid {})", entry.name, entry.pid);
                self.transition(State::ExternallyRunning);
                self.status.clear_instance();
                self.publish();
                self.dispatch_detect(entry.argv);
            }
            (State::Stopped, None) => {
                if let Some(id) = autostart {
                    if let Err(e) = self.begin_start(&id, StartOrigin::User) {
                        log::warn!("Autostart of '{}' failed: {}", id, e);
                    }
                }
            }
            (state, None) if state.is_active() => self.on_unexpected_exit(),
            _ => {}
        }
    }

    fn on_restart_due(&mut self, id: String) {
        self.restart_timer = None;
        if !self.restart_in_flight {
            return;
        }
        let allowed = !self.user_stopped
            && self.settings.current().auto_restart_enabled
            && self.status.state == State::Stopped;
        if !allowed {
            log::debug!("Dropping restart of '{}'", id);
            self.restart_in_flight = false;
            return;
        }

        log::info!("Auto-restarting strategy '{}'", id);
        if let Err(e) = self.begin_start(&id, StartOrigin::AutoRestart) {
            log::warn!("Auto-restart of '{}' failed: {}", id, e);
            self.restart_in_flight = false;
        }
    }

    // ---- driving -----------------------------------------------------------

    /// Wait for the next worker or timer message and apply it
    pub async fn process_next_event(&mut self) -> bool {
        match self.worker_rx.recv().await {
            Some(event) => {
                self.handle_worker_event(event);
                true
            }
            None => false,
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start { id, reply } => {
                let _ = reply.send(self.start(&id));
            }
            Command::Stop { reply } => {
                let _ = reply.send(self.stop());
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status.clone());
            }
            // Handled by the loop, which has to await the shutdown
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    /// Stop everything we are responsible for before exiting
    ///
    /// With `close_on_exit` the running instance is terminated and this
    /// returns once the supervisor has settled in Stopped.
    pub async fn shutdown(&mut self) {
        self.cancel_restart();
        self.pending_autostart = None;

        if !self.settings.current().close_on_exit {
            log::info!("Leaving winws running on exit");
            return;
        }

        loop {
            let idle = self.start_ticket.is_none() && !self.stop_in_flight;
            match self.status.state {
                State::Stopped if idle => break,
                State::Starting | State::Running | State::ExternallyRunning => {
                    if let Err(e) = self.stop() {
                        log::warn!("Stop during shutdown failed: {}", e);
                    }
                }
                _ => {}
            }
            if !self.process_next_event().await {
                break;
            }
        }
        log::info!("Supervisor shut down");
    }

    /// Control loop: commands, worker completions and the liveness ticker
    pub async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let mut ticker = tokio::time::interval(self.timings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some(event) = self.worker_rx.recv() => self.handle_worker_event(event),
                _ = ticker.tick() => self.poll(),
            }
        }
    }

    /// Move the supervisor onto its own task
    pub fn spawn(self) -> (SupervisorHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
        let handle = SupervisorHandle {
            commands: tx,
            events: self.events.clone(),
        };
        let task = tokio::spawn(self.run(rx));
        (handle, task)
    }
}

/// Cloneable front door to a spawned supervisor
#[derive(Clone)]
pub struct SupervisorHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<SupervisorEvent>,
}

impl SupervisorHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SupervisorError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| SupervisorError::Closed)?;
        rx.await.map_err(|_| SupervisorError::Closed)
    }

    pub async fn start(&self, id: &str) -> Result<(), SupervisorError> {
        let id = id.to_string();
        self.request(|reply| Command::Start { id, reply }).await?
    }

    pub async fn stop(&self) -> Result<(), SupervisorError> {
        self.request(|reply| Command::Stop { reply }).await?
    }

    pub async fn status(&self) -> Result<Status, SupervisorError> {
        self.request(|reply| Command::Status { reply }).await
    }

    pub async fn shutdown(&self) -> Result<(), SupervisorError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }
}
