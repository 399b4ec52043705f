// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Control loop.
//!
//! Single owner of the mutable bits that a front end pokes at: the current
//! status snapshot, the running update, and the process attached to it.
//! Front ends talk to the loop through a [`ControlHandle`]. Long work runs
//! on blocking worker threads, which hand their results back through a
//! channel, so the loop itself never blocks on Git or on the installer.

use crate::{
    config::UpdaterConfig,
    orchestrator::{Orchestrator, ProcessSlot, Refresher, UpdateOutcome, UpdateRequest},
    process::{Launcher, ProcessSpawner},
    repo::status::{RefreshTicket, RepoStatus},
    runner::{CommandRunner, SystemRunner},
    sink::UpdateSink,
};

use parking_lot::Mutex;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::mpsc,
    task,
    time::{self, Instant, Interval, MissedTickBehavior},
};
use tracing::{debug, info, instrument, warn};

/// Upper bound on waiting for a running update once shutdown is requested.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Requests accepted by control loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Refresh,
    Update(UpdateRequest),
    SendInput(String),
    Interrupt,
    Reconfigure(Box<UpdaterConfig>),
    Shutdown,
}

/// Notable things the control loop wants its front end to know about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    /// A refresh produced the new current status.
    Status(RepoStatus),

    /// An update cycle finished.
    Finished(UpdateOutcome),

    /// Update was refused because another one is still running.
    Busy,
}

/// Cloneable sender side of control loop.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    tx: mpsc::UnboundedSender<ControlCommand>,
}

impl ControlHandle {
    /// Queue command for control loop.
    ///
    /// # Errors
    ///
    /// - Return [`ControlError::Closed`] if control loop already exited.
    pub fn send(&self, command: ControlCommand) -> Result<()> {
        self.tx.send(command).map_err(|_| ControlError::Closed)
    }

    /// Request status refresh.
    pub fn refresh(&self) -> Result<()> {
        self.send(ControlCommand::Refresh)
    }

    /// Request update cycle.
    pub fn update(&self, request: UpdateRequest) -> Result<()> {
        self.send(ControlCommand::Update(request))
    }

    /// Type text into running process.
    pub fn send_input(&self, text: impl Into<String>) -> Result<()> {
        self.send(ControlCommand::SendInput(text.into()))
    }

    /// Interrupt running process.
    pub fn interrupt(&self) -> Result<()> {
        self.send(ControlCommand::Interrupt)
    }

    /// Replace configuration.
    pub fn reconfigure(&self, config: UpdaterConfig) -> Result<()> {
        self.send(ControlCommand::Reconfigure(Box::new(config)))
    }

    /// Ask control loop to wind down.
    pub fn shutdown(&self) -> Result<()> {
        self.send(ControlCommand::Shutdown)
    }
}

enum Done {
    Refreshed(RefreshTicket, RepoStatus),
    Updated(UpdateOutcome),
    Crashed(String),
}

/// Control loop state.
pub struct Controller<R = SystemRunner, L = ProcessSpawner>
where
    R: CommandRunner,
    L: Launcher,
{
    orchestrator: Arc<Mutex<Orchestrator<R, L>>>,
    refresher: Refresher<R>,
    slot: ProcessSlot,
    sink: Arc<dyn UpdateSink>,
    refresh_every: Option<Duration>,
    updating: bool,
    rx: mpsc::UnboundedReceiver<ControlCommand>,
    events: mpsc::UnboundedSender<ControlEvent>,
    done_tx: mpsc::UnboundedSender<Done>,
    done_rx: mpsc::UnboundedReceiver<Done>,
}

impl<R, L> Controller<R, L>
where
    R: CommandRunner + Clone + 'static,
    L: Launcher + 'static,
{
    /// Construct new control loop around `orchestrator`.
    ///
    /// Returns the loop, a handle to drive it, and the receiving end of its
    /// events.
    pub fn new(
        orchestrator: Orchestrator<R, L>,
        sink: Arc<dyn UpdateSink>,
    ) -> (Self, ControlHandle, mpsc::UnboundedReceiver<ControlEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = mpsc::unbounded_channel();

        let controller = Self {
            refresher: orchestrator.refresher(),
            slot: orchestrator.slot(),
            refresh_every: refresh_period(orchestrator.config()),
            orchestrator: Arc::new(Mutex::new(orchestrator)),
            sink,
            updating: false,
            rx,
            events,
            done_tx,
            done_rx,
        };

        (controller, ControlHandle { tx }, events_rx)
    }

    /// Slot of process attached to running update.
    pub fn slot(&self) -> ProcessSlot {
        self.slot.clone()
    }

    /// Drive control loop until shutdown is requested, or every handle is
    /// dropped.
    ///
    /// # Errors
    ///
    /// - Return [`ControlError::ShutdownTimedOut`] if a running update did
    ///   not wind down within [`SHUTDOWN_TIMEOUT`] after being interrupted.
    #[instrument(skip(self), level = "debug")]
    pub async fn run(mut self) -> Result<()> {
        let mut timer = self.refresh_every.map(ticker);
        info!("control loop started");

        loop {
            tokio::select! {
                command = self.rx.recv() => match command {
                    Some(ControlCommand::Shutdown) | None => break,
                    Some(command) => {
                        if let Some(period) = self.handle(command) {
                            timer = period.map(ticker);
                        }
                    }
                },
                Some(done) = self.done_rx.recv() => self.apply(done),
                _ = tick(&mut timer) => {
                    debug!("periodic refresh");
                    self.refresh();
                }
            }
        }

        self.shutdown().await
    }

    // Returns new refresh period if it changed.
    fn handle(&mut self, command: ControlCommand) -> Option<Option<Duration>> {
        match command {
            ControlCommand::Refresh => self.refresh(),
            ControlCommand::Update(request) => self.update(request),
            ControlCommand::SendInput(text) => self.send_input(&text),
            ControlCommand::Interrupt => self.interrupt(),
            ControlCommand::Reconfigure(config) => return self.reconfigure(*config),
            ControlCommand::Shutdown => {}
        }

        None
    }

    fn refresh(&self) {
        let ticket = self.refresher.board().begin();
        let refresher = self.refresher.clone();
        let done = self.done_tx.clone();
        task::spawn_blocking(move || {
            let status = refresher.check();
            let _ = done.send(Done::Refreshed(ticket, status));
        });
    }

    fn update(&mut self, request: UpdateRequest) {
        if self.updating {
            self.sink.append("[update] An update is already running.\n");
            let _ = self.events.send(ControlEvent::Busy);
            return;
        }

        self.updating = true;
        let orchestrator = self.orchestrator.clone();
        let worker = task::spawn_blocking(move || orchestrator.lock().run(request));
        let done = self.done_tx.clone();
        tokio::spawn(async move {
            let result = match worker.await {
                Ok(outcome) => Done::Updated(outcome),
                Err(error) => Done::Crashed(error.to_string()),
            };
            let _ = done.send(result);
        });
    }

    fn send_input(&self, text: &str) {
        let Some(input) = self.slot.current() else {
            self.sink.append("[send] No running process.\n");
            return;
        };

        match input.write_input(text) {
            Ok(()) => self.sink.append(&format!("[sent] {text:?}\n")),
            Err(error) => {
                warn!("cannot send input: {error}");
                self.sink.append(&format!("[send error] {error}\n"));
            }
        }
    }

    fn interrupt(&self) {
        let Some(input) = self.slot.current() else {
            self.sink.append("[signal] No running process.\n");
            return;
        };

        match input.send_interrupt() {
            Ok(()) => self.sink.append("[signal] SIGINT sent\n"),
            Err(error) => {
                warn!("cannot interrupt: {error}");
                self.sink.append(&format!("[signal error] {error}\n"));
            }
        }
    }

    fn reconfigure(&mut self, config: UpdaterConfig) -> Option<Option<Duration>> {
        if self.updating {
            self.sink
                .append("[config] Cannot reconfigure while an update is running.\n");
            return None;
        }

        let period = refresh_period(&config);
        let mut orchestrator = self.orchestrator.lock();
        orchestrator.reconfigure(config);
        self.refresher = orchestrator.refresher();
        drop(orchestrator);

        if period == self.refresh_every {
            return None;
        }

        self.refresh_every = period;
        Some(period)
    }

    fn apply(&mut self, done: Done) {
        match done {
            Done::Refreshed(ticket, status) => {
                if self.refresher.board().publish(ticket, status.clone()) {
                    let _ = self.events.send(ControlEvent::Status(status));
                }
            }
            Done::Updated(outcome) => {
                self.updating = false;
                info!("update finished: {}", outcome.title);
                let _ = self.events.send(ControlEvent::Finished(outcome));
                self.refresh();
            }
            Done::Crashed(error) => {
                self.updating = false;
                warn!("update worker crashed: {error}");
                self.sink.append(&format!("[update error] {error}\n"));
            }
        }
    }

    async fn shutdown(mut self) -> Result<()> {
        if !self.updating {
            info!("control loop stopped");
            return Ok(());
        }

        info!("waiting for running update to stop");
        self.interrupt();
        let deadline = Instant::now() + SHUTDOWN_TIMEOUT;
        while self.updating {
            match time::timeout_at(deadline, self.done_rx.recv()).await {
                Ok(Some(done)) => self.apply(done),
                Ok(None) => break,
                Err(_) => return Err(ControlError::ShutdownTimedOut(SHUTDOWN_TIMEOUT)),
            }
        }

        info!("control loop stopped");
        Ok(())
    }
}

fn refresh_period(config: &UpdaterConfig) -> Option<Duration> {
    match config.auto_refresh_seconds {
        0 => None,
        seconds => Some(Duration::from_secs(seconds)),
    }
}

fn ticker(period: Duration) -> Interval {
    // INVARIANT: First tick fires one period from now, not immediately.
    let mut interval = time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Control loop error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControlError {
    /// Control loop is no longer running.
    #[error("control loop is no longer running")]
    Closed,

    /// Running update ignored shutdown.
    #[error("running update did not stop within {0:?}")]
    ShutdownTimedOut(Duration),
}

/// Friendly result alias :3
pub type Result<T, E = ControlError> = std::result::Result<T, E>;
