// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Interactive installer processes.
//!
//! The installer of the configuration repository is an arbitrary shell
//! script that may prompt for input, and that only colors its output when it
//! believes it is talking to a terminal. This module launches it through a
//! chain of interpreter fallbacks, either under a pseudo-terminal or with
//! plain pipes, and exposes one uniform [`InteractiveProcess`] interface for
//! both.
//!
//! # Fallback Chain
//!
//! The script is first executed directly. If the kernel refuses the binary
//! format, the script is handed to each configured interpreter in turn. Any
//! other launch failure ends the chain early, because it will not get better
//! by trying a different interpreter.
//!
//! # Scripted Input
//!
//! Right after launch a background [`Feeder`] types the configured inputs
//! into the process, pausing between items so prompts get a chance to
//! render, and finishes with an optional trailing sentinel line.

pub mod lines;
pub mod pipe;
pub mod pty;

use crate::{config::UpdaterConfig, process::{pipe::PipeProcess, pty::PtyProcess}};

use nix::{
    errno::Errno,
    sys::signal::{killpg, Signal},
    unistd::Pid,
};
use parking_lot::Mutex;
use std::{
    ffi::OsString,
    fmt::{Debug, Formatter, Result as FmtResult},
    io::{self, Write},
    os::unix::process::{CommandExt, ExitStatusExt},
    path::{Path, PathBuf},
    process::{Command, ExitStatus},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use tracing::{debug, info, instrument, warn};

/// Delay before first scripted input.
pub const FEED_LEAD_IN: Duration = Duration::from_millis(200);

/// Delay before a lone sentinel input.
pub const SENTINEL_LEAD_IN: Duration = Duration::from_millis(300);

/// Delay between scripted inputs.
pub const FEED_GAP: Duration = Duration::from_millis(250);

/// Upper bound on waiting for feeder to wind down.
pub const FEEDER_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

const FEED_TICK: Duration = Duration::from_millis(25);

/// Callback receiving operator-facing log text.
pub type LogFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Uniform handle over a running interactive process.
pub trait InteractiveProcess: Send {
    /// Read next line of output including its newline, or `None` once the
    /// process closed its output.
    fn read_line(&mut self) -> Result<Option<Vec<u8>>>;

    /// Thread-safe handle for writing input and delivering signals.
    fn input(&self) -> ProcessInput;

    /// Wait for process to exit, releasing its descriptors.
    fn wait(&mut self) -> Result<i32>;
}

impl<P> InteractiveProcess for Box<P>
where
    P: InteractiveProcess + ?Sized,
{
    fn read_line(&mut self) -> Result<Option<Vec<u8>>> {
        (**self).read_line()
    }

    fn input(&self) -> ProcessInput {
        (**self).input()
    }

    fn wait(&mut self) -> Result<i32> {
        (**self).wait()
    }
}

struct InputState {
    writer: Option<Box<dyn Write + Send>>,
    pgid: Option<u32>,
}

/// Thread-safe input side of an [`InteractiveProcess`].
///
/// Cloning yields another handle to the same process. Once the process is
/// waited on, every handle is closed, and further writes or signals fail
/// instead of targeting a dead process.
#[derive(Clone)]
pub struct ProcessInput {
    state: Arc<Mutex<InputState>>,
}

impl ProcessInput {
    /// Construct new input handle.
    ///
    /// The `pgid` is the process group that interrupts are delivered to.
    pub fn new(writer: impl Write + Send + 'static, pgid: Option<u32>) -> Self {
        Self {
            state: Arc::new(Mutex::new(InputState {
                writer: Some(Box::new(writer)),
                pgid,
            })),
        }
    }

    /// Write text to process input.
    ///
    /// # Errors
    ///
    /// - Return [`ProcessError::Closed`] if process already exited.
    /// - Return [`ProcessError::Io`] if write failed.
    pub fn write_input(&self, text: &str) -> Result<()> {
        let mut state = self.state.lock();
        let writer = state.writer.as_mut().ok_or(ProcessError::Closed)?;
        writer.write_all(text.as_bytes())?;
        writer.flush()?;

        Ok(())
    }

    /// Deliver interrupt signal to process group.
    ///
    /// # Errors
    ///
    /// - Return [`ProcessError::Closed`] if process already exited.
    /// - Return [`ProcessError::Signal`] if signal could not be delivered.
    pub fn send_interrupt(&self) -> Result<()> {
        let state = self.state.lock();
        let pgid = state.pgid.ok_or(ProcessError::Closed)?;
        killpg(Pid::from_raw(pgid as i32), Signal::SIGINT).map_err(ProcessError::Signal)
    }

    /// Check if process can still take input.
    pub fn is_open(&self) -> bool {
        self.state.lock().writer.is_some()
    }

    /// Drop writer and forget process group.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.writer = None;
        state.pgid = None;
    }
}

impl Debug for ProcessInput {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        let state = self.state.lock();
        fmt.debug_struct("ProcessInput")
            .field("open", &state.writer.is_some())
            .field("pgid", &state.pgid)
            .finish()
    }
}

/// What to launch, and how to seed it.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    /// Working directory, i.e., the repository.
    pub cwd: PathBuf,

    /// Script path relative to working directory.
    pub script: PathBuf,

    /// Arguments passed after the script.
    pub args: Vec<String>,

    /// Scripted inputs fed right after launch.
    pub auto_inputs: Vec<String>,

    /// Trailing sentinel input.
    pub final_input: Option<String>,

    /// Skip direct execution, and go straight to the interpreters.
    pub interpreted_only: bool,
}

/// Layer of indirection for launching interactive processes.
pub trait Launcher: Send + Sync {
    /// Launch process, or `None` if every fallback failed to start.
    fn launch(&self, request: &LaunchRequest, log: LogFn) -> Option<Box<dyn InteractiveProcess>>;

    /// Pick up new settings. Launchers without settings ignore this.
    fn reconfigure(&mut self, _config: &UpdaterConfig) {}
}

impl<L> Launcher for Arc<L>
where
    L: Launcher + ?Sized,
{
    fn launch(&self, request: &LaunchRequest, log: LogFn) -> Option<Box<dyn InteractiveProcess>> {
        (**self).launch(request, log)
    }
}

/// Launch scripts through interpreter fallbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpawner {
    use_pty: bool,
    force_color: bool,
    interpreters: Vec<String>,
}

impl Default for ProcessSpawner {
    fn default() -> Self {
        Self {
            use_pty: true,
            force_color: true,
            interpreters: vec!["fish".into(), "sh".into()],
        }
    }
}

impl ProcessSpawner {
    /// Construct new process spawner.
    pub fn new(use_pty: bool, force_color: bool, interpreters: Vec<String>) -> Self {
        Self {
            use_pty,
            force_color,
            interpreters,
        }
    }

    /// Construct process spawner from updater configuration.
    pub fn from_config(config: &UpdaterConfig) -> Self {
        Self::new(
            config.use_pty,
            config.force_color_env,
            config.installer.interpreters.clone(),
        )
    }

    /// Candidate command vectors, in the order they are attempted.
    pub fn candidates(&self, script: &Path, args: &[String]) -> Vec<Vec<OsString>> {
        let script = relative_script(script);
        let mut direct = vec![script.clone().into_os_string()];
        direct.extend(args.iter().map(OsString::from));

        let mut candidates = vec![direct];
        for interpreter in &self.interpreters {
            let mut argv = vec![OsString::from(interpreter), script.clone().into_os_string()];
            argv.extend(args.iter().map(OsString::from));
            candidates.push(argv);
        }

        candidates
    }

    /// Build command for candidate, with environment prepared.
    pub fn command(&self, argv: &[OsString], cwd: &Path) -> Option<Command> {
        let (program, args) = argv.split_first()?;
        let mut command = Command::new(program);
        command.args(args).current_dir(cwd).process_group(0);
        if self.force_color {
            force_color_env(&mut command);
        }

        Some(command)
    }

    /// Launch script, walking the fallback chain until one candidate starts.
    ///
    /// Returns `None` only if no candidate could be started.
    #[instrument(skip(self, log), level = "debug")]
    pub fn spawn(&self, request: &LaunchRequest, log: LogFn) -> Option<Box<dyn InteractiveProcess>> {
        let mut use_pty = self.use_pty;
        let candidates = self.candidates(&request.script, &request.args);

        let skip = usize::from(request.interpreted_only);

        for (idx, argv) in candidates.iter().enumerate().skip(skip) {
            let line = display_argv(argv);
            let Some(command) = self.command(argv, &request.cwd) else {
                continue;
            };

            let result = if use_pty {
                match PtyProcess::spawn(command) {
                    Ok(process) => {
                        log(&format!("[spawn/pty] {line}\n"));
                        Ok(Box::new(process) as Box<dyn InteractiveProcess>)
                    }
                    Err(ProcessError::Pty(error)) => {
                        warn!("pty allocation failed: {error}");
                        log(&format!("[pty-warn] failed to open pty: {error}; fallback no-pty\n"));
                        use_pty = false;
                        self.spawn_piped(argv, &request.cwd, &line, &log)
                    }
                    Err(error) => Err(error),
                }
            } else {
                self.spawn_piped(argv, &request.cwd, &line, &log)
            };

            match result {
                Ok(process) => {
                    info!("installer started: {line}");
                    let feeder = Feeder::start(
                        process.input(),
                        request.auto_inputs.clone(),
                        request.final_input.clone(),
                        log.clone(),
                    );
                    return Some(Box::new(Spawned {
                        process,
                        feeder: Some(feeder),
                    }));
                }
                Err(ProcessError::Spawn(error)) => match fallback_for(&error, idx > 0) {
                    Fallback::Next => {
                        warn!("cannot launch {line}: {error}");
                        log(&format!("[warn] {error} with {line}; trying fallback...\n"));
                    }
                    Fallback::Abort => {
                        warn!("cannot launch {line}: {error}");
                        log(&format!("[error] {error}\n"));
                        return None;
                    }
                },
                Err(error) => {
                    log(&format!("[error] {error}\n"));
                    return None;
                }
            }
        }

        log("[error] All setup execution fallbacks failed.\n");
        None
    }

    fn spawn_piped(
        &self,
        argv: &[OsString],
        cwd: &Path,
        line: &str,
        log: &LogFn,
    ) -> Result<Box<dyn InteractiveProcess>> {
        let command = self.command(argv, cwd).ok_or(ProcessError::Closed)?;
        let process = PipeProcess::spawn(command)?;
        log(&format!("[spawn] {line}\n"));
        Ok(Box::new(process))
    }
}

impl Launcher for ProcessSpawner {
    fn launch(&self, request: &LaunchRequest, log: LogFn) -> Option<Box<dyn InteractiveProcess>> {
        self.spawn(request, log)
    }

    fn reconfigure(&mut self, config: &UpdaterConfig) {
        *self = Self::from_config(config);
    }
}

/// Next step after a candidate failed to launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fallback {
    Next,
    Abort,
}

/// Decide whether a launch failure moves on to the next candidate.
///
/// Exec format errors always move on. A missing interpreter moves on too,
/// since the next interpreter may well be installed.
pub fn fallback_for(error: &io::Error, via_interpreter: bool) -> Fallback {
    if error.raw_os_error() == Some(Errno::ENOEXEC as i32) {
        return Fallback::Next;
    }

    if via_interpreter && error.kind() == io::ErrorKind::NotFound {
        return Fallback::Next;
    }

    Fallback::Abort
}

/// Force color-friendly environment onto command.
pub fn force_color_env(command: &mut Command) {
    command
        .env("TERM", "xterm-256color")
        .env("FORCE_COLOR", "1")
        .env("CLICOLOR", "1")
        .env("CLICOLOR_FORCE", "1")
        .env_remove("NO_COLOR");
}

fn relative_script(script: &Path) -> PathBuf {
    if script.is_absolute() || script.starts_with(".") {
        script.to_path_buf()
    } else {
        Path::new(".").join(script)
    }
}

fn display_argv(argv: &[OsString]) -> String {
    argv.iter()
        .map(|arg| arg.to_string_lossy())
        .collect::<Vec<_>>()
        .join(" ")
}

pub(crate) fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => 1,
    }
}

/// Background typist of scripted input.
///
/// Stopped and joined with a bounded wait when dropped.
#[derive(Debug)]
pub struct Feeder {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Feeder {
    /// Start feeding `items` followed by `sentinel` into process input.
    pub fn start(
        input: ProcessInput,
        items: Vec<String>,
        sentinel: Option<String>,
        log: LogFn,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = thread::spawn(move || feed(input, items, sentinel, log, flag));

        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Signal feeder to stop, and wait at most `timeout` for it.
    ///
    /// Returns false if feeder was still running once timeout elapsed.
    pub fn stop(&mut self, timeout: Duration) -> bool {
        self.stop.store(true, Ordering::SeqCst);
        let Some(handle) = self.handle.take() else {
            return true;
        };

        let deadline = Instant::now() + timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                warn!("feeder did not stop within {timeout:?}");
                return false;
            }
            thread::sleep(FEED_TICK);
        }

        let _ = handle.join();
        true
    }
}

impl Drop for Feeder {
    fn drop(&mut self) {
        self.stop(FEEDER_JOIN_TIMEOUT);
    }
}

fn feed(
    input: ProcessInput,
    items: Vec<String>,
    sentinel: Option<String>,
    log: LogFn,
    stop: Arc<AtomicBool>,
) {
    let lead_in = if items.is_empty() {
        SENTINEL_LEAD_IN
    } else {
        FEED_LEAD_IN
    };
    if !pause(lead_in, &stop) {
        return;
    }

    for (idx, item) in items.iter().enumerate() {
        if idx > 0 && !pause(FEED_GAP, &stop) {
            return;
        }

        if let Err(error) = input.write_input(item) {
            warn!("auto input failed: {error}");
            log(&format!("[auto-input-error] {error}\n"));
            return;
        }
        log(&format!("[auto-input] {item:?}\n"));
    }

    let Some(sentinel) = sentinel else {
        return;
    };

    if !items.is_empty() && !pause(FEED_GAP, &stop) {
        return;
    }

    match input.write_input(&sentinel) {
        Ok(()) => log(&format!("[auto-input] {sentinel:?}\n")),
        Err(error) => {
            warn!("sentinel input failed: {error}");
            log(&format!("[auto-input-error] {error}\n"));
        }
    }
}

// Sleep in small ticks, bailing out early if asked to stop.
fn pause(duration: Duration, stop: &AtomicBool) -> bool {
    let deadline = Instant::now() + duration;
    while Instant::now() < deadline {
        if stop.load(Ordering::SeqCst) {
            debug!("feeder stopped early");
            return false;
        }
        thread::sleep(FEED_TICK.min(deadline.saturating_duration_since(Instant::now())));
    }

    !stop.load(Ordering::SeqCst)
}

/// Launched process bundled with its feeder.
struct Spawned {
    process: Box<dyn InteractiveProcess>,
    feeder: Option<Feeder>,
}

impl InteractiveProcess for Spawned {
    fn read_line(&mut self) -> Result<Option<Vec<u8>>> {
        self.process.read_line()
    }

    fn input(&self) -> ProcessInput {
        self.process.input()
    }

    fn wait(&mut self) -> Result<i32> {
        if let Some(mut feeder) = self.feeder.take() {
            feeder.stop(FEEDER_JOIN_TIMEOUT);
        }
        self.process.wait()
    }
}

/// Process error types.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// Pseudo-terminal could not be allocated.
    #[error("failed to open pseudo-terminal")]
    Pty(#[source] Errno),

    /// Command could not be started.
    #[error(transparent)]
    Spawn(io::Error),

    /// Process already exited.
    #[error("process is no longer running")]
    Closed,

    /// Signal could not be delivered.
    #[error("failed to deliver signal")]
    Signal(#[source] Errno),

    /// Reading or writing process streams failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Friendly result alias :3
pub type Result<T, E = ProcessError> = std::result::Result<T, E>;

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;

    /// Scripted stand-in for a real process.
    pub(crate) struct FakeProcess {
        pub(crate) lines: VecDeque<Vec<u8>>,
        pub(crate) code: i32,
        pub(crate) input: ProcessInput,
    }

    impl FakeProcess {
        pub(crate) fn new(output: &str, code: i32) -> Self {
            Self {
                lines: output
                    .split_inclusive('\n')
                    .map(|line| line.as_bytes().to_vec())
                    .collect(),
                code,
                input: ProcessInput::new(io::sink(), None),
            }
        }
    }

    impl InteractiveProcess for FakeProcess {
        fn read_line(&mut self) -> Result<Option<Vec<u8>>> {
            Ok(self.lines.pop_front())
        }

        fn input(&self) -> ProcessInput {
            self.input.clone()
        }

        fn wait(&mut self) -> Result<i32> {
            self.input.close();
            Ok(self.code)
        }
    }

    /// Launcher that hands out canned processes, keyed by script arguments.
    #[derive(Default)]
    pub(crate) struct FakeLauncher {
        outcomes: Mutex<VecDeque<(String, i32)>>,
        launched: Mutex<Vec<LaunchRequest>>,
    }

    impl FakeLauncher {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        /// Queue output and exit code of next launched process.
        pub(crate) fn then(self, output: &str, code: i32) -> Self {
            self.outcomes.lock().push_back((output.to_string(), code));
            self
        }

        pub(crate) fn launched(&self) -> Vec<LaunchRequest> {
            self.launched.lock().clone()
        }
    }

    impl Launcher for FakeLauncher {
        fn launch(&self, request: &LaunchRequest, _log: LogFn) -> Option<Box<dyn InteractiveProcess>> {
            self.launched.lock().push(request.clone());
            let (output, code) = self.outcomes.lock().pop_front()?;
            Some(Box::new(FakeProcess::new(&output, code)))
        }
    }
}
