// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Update orchestration.
//!
//! One update cycle walks a fixed sequence of states:
//!
//! ```text
//! Idle -> Refreshing -> PlanningInstall -> ResolvingConflicts -> Stashing
//!      -> Pulling -> RestoringStash -> BackingUpTweaks -> Installing
//!      -> RestoringTweaks -> Notifying -> Idle
//! ```
//!
//! Every step reports to an [`UpdateSink`], and every operator decision goes
//! through it too. Nothing in here raises across the cycle boundary. A cycle
//! always ends in an [`UpdateOutcome`], and every cycle that got past
//! refreshing leaves a [`HistoryEntry`] behind.
//!
//! # Safety Choices
//!
//! Local modifications are stashed before pulling, and the stash is popped
//! only if the pull went through. A failed pull leaves the stash in place
//! for manual recovery. Interrupted merges or rebases are only aborted with
//! operator consent.

pub mod plan;

use crate::{
    ansi::AnsiDecoder,
    config::UpdaterConfig,
    orchestrator::plan::{plan, upstream_changed_under, InstallMode, InstallPlan},
    path::{detect_repo_path, scratch_dir},
    process::{InteractiveProcess, LaunchRequest, Launcher, LogFn, ProcessInput, ProcessSpawner},
    repo::{
        conflict::{ConflictError, ConflictResolver},
        status::{RepoStatus, StatusBoard, StatusChecker},
        Git,
    },
    runner::{CommandOutput, CommandRunner, SystemRunner},
    sink::UpdateSink,
    tweaks::TweaksManager,
};

use chrono::Local;
use parking_lot::Mutex;
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{debug, info, instrument, warn};

/// Timestamp layout of history entries.
pub const HISTORY_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Where an update cycle currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateState {
    Idle,
    Refreshing,
    PlanningInstall,
    ResolvingConflicts,
    Stashing,
    Pulling,
    RestoringStash,
    BackingUpTweaks,
    Installing,
    RestoringTweaks,
    Notifying,
}

impl UpdateState {
    /// Short busy hint shown while in this state.
    pub fn hint(&self) -> &'static str {
        match self {
            Self::Idle => "",
            Self::Refreshing => "Checking for updates...",
            Self::PlanningInstall => "Planning install...",
            Self::ResolvingConflicts => "Checking for conflicts...",
            Self::Stashing => "Stashing local changes...",
            Self::Pulling => "Pulling...",
            Self::RestoringStash => "Restoring stash...",
            Self::BackingUpTweaks => "Backing up tweaks...",
            Self::Installing => "Installing...",
            Self::RestoringTweaks => "Restoring tweaks...",
            Self::Notifying => "Finishing...",
        }
    }
}

/// What the operator asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateRequest {
    /// Pull upstream changes, then install.
    Update,

    /// Re-run files-only install without touching the repository.
    ReinstallFiles,
}

/// Structured record of a finished update cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub timestamp: String,
    pub title: String,
    pub detail: String,
}

impl HistoryEntry {
    /// Construct new history entry stamped with local time.
    pub fn new(title: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            timestamp: Local::now().format(HISTORY_TIME_FORMAT).to_string(),
            title: title.into(),
            detail: detail.into(),
        }
    }
}

impl Display for HistoryEntry {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        writeln!(fmt, "[{}] {}", self.timestamp, self.title)?;
        if !self.detail.is_empty() {
            writeln!(fmt, "{}", self.detail.trim_end())?;
        }
        Ok(())
    }
}

/// Result of one update cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub request: UpdateRequest,
    pub success: bool,
    pub title: String,

    /// Why the cycle did not succeed.
    pub error: Option<UpdateError>,

    /// Exit code of last installer run, if installer ran at all.
    pub installer_code: Option<i32>,

    /// States visited, in order.
    pub trail: Vec<UpdateState>,
}

/// Input side of the process currently attached to a cycle.
///
/// Occupied while an installer or post script runs, and vacated the moment
/// it exits, so input and signals never reach a dead process.
#[derive(Debug, Default, Clone)]
pub struct ProcessSlot(Arc<Mutex<Option<ProcessInput>>>);

impl ProcessSlot {
    /// Construct new empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Input handle of running process.
    pub fn current(&self) -> Option<ProcessInput> {
        self.0.lock().clone()
    }

    /// Check if a process is attached.
    pub fn is_occupied(&self) -> bool {
        self.0.lock().is_some()
    }

    fn occupy(&self, input: ProcessInput) {
        *self.0.lock() = Some(input);
    }

    fn vacate(&self) {
        self.0.lock().take();
    }
}

/// Status refresh half of the orchestrator.
///
/// Cheap to clone, and safe to run on any worker while an update cycle is
/// in flight elsewhere.
#[derive(Debug, Clone)]
pub struct Refresher<R = SystemRunner>
where
    R: CommandRunner,
{
    checker: StatusChecker<R>,
    board: Arc<StatusBoard>,
    repo: PathBuf,
}

impl<R> Refresher<R>
where
    R: CommandRunner,
{
    /// Board that refresh results are published to.
    pub fn board(&self) -> &Arc<StatusBoard> {
        &self.board
    }

    /// Compute fresh snapshot without publishing it.
    pub fn check(&self) -> RepoStatus {
        self.checker.check(&self.repo)
    }

    /// Compute fresh snapshot, and publish it unless a newer refresh won.
    pub fn refresh(&self) -> RepoStatus {
        let ticket = self.board.begin();
        let status = self.check();
        self.board.publish(ticket, status.clone());
        status
    }
}

#[derive(Debug, Default)]
struct Report {
    detail: String,
    installer_code: Option<i32>,
}

/// Drive update cycles.
pub struct Orchestrator<R = SystemRunner, L = ProcessSpawner>
where
    R: CommandRunner,
    L: Launcher,
{
    config: UpdaterConfig,
    runner: R,
    git: Git<R>,
    resolver: ConflictResolver<R>,
    launcher: L,
    sink: Arc<dyn UpdateSink>,
    board: Arc<StatusBoard>,
    slot: ProcessSlot,
    state: UpdateState,
    trail: Vec<UpdateState>,
    history: Vec<HistoryEntry>,
}

impl Orchestrator {
    /// Construct orchestrator that talks to real Git and real processes.
    pub fn from_config(config: UpdaterConfig, sink: Arc<dyn UpdateSink>) -> Self {
        let launcher = ProcessSpawner::from_config(&config);
        Self::new(config, SystemRunner, launcher, sink)
    }
}

impl<R, L> Orchestrator<R, L>
where
    R: CommandRunner + Clone,
    L: Launcher,
{
    /// Construct new orchestrator.
    pub fn new(config: UpdaterConfig, runner: R, launcher: L, sink: Arc<dyn UpdateSink>) -> Self {
        Self {
            config,
            git: Git::new(runner.clone()),
            resolver: ConflictResolver::new(Git::new(runner.clone())),
            runner,
            launcher,
            sink,
            board: Arc::new(StatusBoard::new()),
            slot: ProcessSlot::new(),
            state: UpdateState::Idle,
            trail: Vec::new(),
            history: Vec::new(),
        }
    }

    /// Replace active configuration.
    pub fn reconfigure(&mut self, config: UpdaterConfig) {
        self.launcher.reconfigure(&config);
        self.config = config;
        info!("configuration replaced");
    }

    /// Active configuration.
    pub fn config(&self) -> &UpdaterConfig {
        &self.config
    }

    /// Current state.
    pub fn state(&self) -> UpdateState {
        self.state
    }

    /// Finished cycles, oldest first.
    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    /// Slot of process attached to running cycle.
    pub fn slot(&self) -> ProcessSlot {
        self.slot.clone()
    }

    /// Board holding current status snapshot.
    pub fn board(&self) -> Arc<StatusBoard> {
        self.board.clone()
    }

    /// Repository path in effect.
    ///
    /// Falls back to the default clone location if configured path is
    /// empty or missing.
    pub fn repo_path(&self) -> PathBuf {
        let configured = self.config.repo_path.as_path();
        detect_repo_path(configured).unwrap_or_else(|| configured.to_path_buf())
    }

    /// Status refresher bound to current configuration.
    pub fn refresher(&self) -> Refresher<R> {
        Refresher {
            checker: StatusChecker::new(Git::new(self.runner.clone())),
            board: self.board.clone(),
            repo: self.repo_path(),
        }
    }

    /// Refresh status, publishing result to board.
    pub fn refresh(&self) -> RepoStatus {
        self.refresher().refresh()
    }

    /// Run one full update cycle.
    #[instrument(skip(self), level = "debug")]
    pub fn run(&mut self, request: UpdateRequest) -> UpdateOutcome {
        self.trail.clear();
        self.sink.ensure_visible();
        let repo = self.repo_path();

        let status = match request {
            UpdateRequest::Update => {
                self.enter(UpdateState::Refreshing);
                let status = self.refresh();
                if !status.ok {
                    let error = status.error.clone().unwrap_or_default();
                    self.say(&format!("[update] {}: {error}\n", status.headline()));
                    return self.finish_early(request, status.headline(), Some(UpdateError::Repository(error)));
                }

                if let Some(error) = &status.fetch_error {
                    self.say(&format!("[git] fetch warning: {}\n", error.trim()));
                }

                if !status.has_updates() {
                    self.say("Already up to date.\n");
                    return self.finish_early(request, "Already up to date".into(), None);
                }

                Some(status)
            }
            UpdateRequest::ReinstallFiles => {
                if !repo.is_dir() {
                    let error = "Repository path not found".to_string();
                    self.say(&format!("[update] {error}: {}\n", repo.display()));
                    return self.finish_early(request, error.clone(), Some(UpdateError::Repository(error)));
                }

                None
            }
        };

        let mut report = Report::default();
        let result = self.cycle(&repo, status.as_ref(), &mut report);
        self.finish(request, result, report)
    }

    fn cycle(&mut self, repo: &Path, status: Option<&RepoStatus>, report: &mut Report) -> Result<()> {
        self.enter(UpdateState::PlanningInstall);
        let Some(status) = status else {
            self.say("\n=== INSTALLER START (FILES-ONLY) ===\n");
            let plan = InstallPlan::new(InstallMode::FilesOnly);
            return self.install_keeping_tweaks(repo, &plan, report);
        };

        let plan = plan(
            self.config.installer_mode,
            &self.git,
            repo,
            status.upstream.as_deref(),
            &self.config.installer.sensitive_paths,
            |question| self.sink.confirm(question),
            &mut |line: &str| self.say(line),
        );
        info!("install plan: {}", plan.mode);

        if self.config.keep_tweaks {
            if let Some(upstream) = status.upstream.as_deref() {
                let changed = upstream_changed_under(&self.git, repo, upstream, &self.config.tweaks_mirror);
                if !changed.is_empty() {
                    self.say(&format!("[keep-tweaks] Upstream-changed tweak files: {}\n", changed.len()));
                }
            }
        }

        self.enter(UpdateState::ResolvingConflicts);
        self.resolve_conflicts(repo)?;

        self.enter(UpdateState::Stashing);
        let stashed = status.dirty > 0 && self.stash(repo);

        self.enter(UpdateState::Pulling);
        self.say("$ git pull --rebase --autostash --stat\n");
        let pull = self.git.pull(repo);
        self.say_output(&pull);
        self.say(&format!("[exit {}]\n", pull.code));
        report.detail = pull_detail(&pull);
        if !pull.success() {
            if stashed {
                self.say("[git] Pull failed; stash left in place for manual recovery.\n");
            }
            return Err(UpdateError::Pull(pull.code));
        }

        self.enter(UpdateState::RestoringStash);
        if stashed {
            self.say("Restoring stash...\n");
            let pop = self.git.stash_pop(repo);
            if !pop.success() {
                warn!("stash pop failed: {}", pop.stderr.trim());
                self.say(&format!("[git error] stash pop: {}\n", pop.stderr.trim()));
            }
        }

        self.install_keeping_tweaks(repo, &plan, report)
    }

    fn resolve_conflicts(&self, repo: &Path) -> Result<()> {
        let state = self.resolver.detect(repo);
        if state.is_clean() {
            return Ok(());
        }

        if !self.sink.confirm(&state.to_string()) {
            return Err(UpdateError::Canceled);
        }

        self.resolver.resolve(repo, &state, &mut |line: &str| self.say(line))?;
        Ok(())
    }

    fn stash(&self, repo: &Path) -> bool {
        self.say("Stashing local changes...\n");
        let output = self.git.stash_push(repo);
        if !output.success() {
            warn!("stash push failed: {}", output.stderr.trim());
            self.say(&format!("[git error] stash push: {}\n", output.stderr.trim()));
            return false;
        }

        // INVARIANT: Nothing to pop unless something was actually stashed.
        !output.stdout.contains("No local changes to save")
    }

    fn install_keeping_tweaks(&mut self, repo: &Path, plan: &InstallPlan, report: &mut Report) -> Result<()> {
        let mut tweaks = self.config.keep_tweaks.then(|| {
            TweaksManager::new(
                self.config.tweaks_dir.as_path(),
                scratch_dir(),
                self.config.tweaks_bulk_threshold,
            )
        });

        self.enter(UpdateState::BackingUpTweaks);
        if let Some(tweaks) = tweaks.as_mut() {
            match tweaks.backup() {
                Ok(Some(backup)) => {
                    self.say(&format!("[keep-tweaks] Backed up tweaks to {}\n", backup.archive.display()))
                }
                Ok(None) => self.say(&format!(
                    "[keep-tweaks] No tweaks directory at {}; nothing to back up.\n",
                    tweaks.target().display()
                )),
                Err(error) => {
                    warn!("tweaks backup failed: {error}");
                    self.say(&format!("[keep-tweaks] Backup failed: {error}\n"));
                }
            }
        }

        self.enter(UpdateState::Installing);
        let installed = self.install(repo, plan, report);

        // INVARIANT: Restore is safe after a failed install too.
        self.enter(UpdateState::RestoringTweaks);
        if let Some(tweaks) = tweaks.as_mut() {
            match tweaks.restore(&self.sink) {
                Ok(Some(summary)) => {
                    for failure in &summary.failures {
                        self.say(&format!("[keep-tweaks restore error] {failure}\n"));
                    }
                    self.say(&format!("{summary}\n"));
                }
                Ok(None) => debug!("no tweaks backup to restore"),
                Err(error) => {
                    warn!("tweaks restore failed: {error}");
                    self.say(&format!("[keep-tweaks error] {error}\n"));
                }
            }
        }

        installed
    }

    fn install(&self, repo: &Path, plan: &InstallPlan, report: &mut Report) -> Result<()> {
        let script = repo.join(&self.config.installer.script);
        if !is_executable(&script) {
            self.say(&format!("No executable installer found at {}.\n", script.display()));
            return Err(UpdateError::NoInstaller);
        }

        self.say("Running installer...\n");
        let mut code = self.run_plan(repo, plan)?;
        if code != 0 {
            if let Some(escalated) = plan.escalation() {
                self.say(&format!("[fallback] Retrying with '{}'...\n", escalated.mode.arg()));
                code = self.run_plan(repo, &escalated)?;
            }
        }

        report.installer_code = Some(code);
        if !report.detail.is_empty() && !report.detail.ends_with('\n') {
            report.detail.push('\n');
        }
        report.detail.push_str(&format!("Installer exit code: {code}"));

        match code {
            0 => Ok(()),
            code => Err(UpdateError::Installer(code)),
        }
    }

    fn run_plan(&self, repo: &Path, plan: &InstallPlan) -> Result<i32> {
        let mut code = 0;
        for args in &plan.commands {
            code = self.run_installer(repo, args)?;
            if code != 0 {
                break;
            }
        }

        Ok(code)
    }

    fn run_installer(&self, repo: &Path, args: &[String]) -> Result<i32> {
        let installer = &self.config.installer;
        let request = LaunchRequest {
            cwd: repo.to_path_buf(),
            script: installer.script.clone(),
            args: args.to_vec(),
            auto_inputs: installer.auto_inputs.clone(),
            final_input: installer.final_input().map(str::to_string),
            interpreted_only: false,
        };

        let Some(process) = self.launcher.launch(&request, self.log_fn()) else {
            self.say("No executable installer found.\n");
            return Err(UpdateError::NoInstaller);
        };

        let code = self.stream(process, "installer");
        self.say(&format!("[installer exit {code}]\n"));
        Ok(code)
    }

    fn run_post_script(&self) {
        let Some(configured) = self.config.post_script_path.as_ref() else {
            return;
        };

        // INVARIANT: Relative post script paths are relative to the repository.
        let repo = self.repo_path();
        let path = repo.join(configured.as_path());

        self.say("\n=== POST-INSTALL SCRIPT ===\n");
        if !path.exists() {
            self.say(&format!("[post-script error] path does not exist: {}\n", path.display()));
            return;
        }

        if path.is_dir() {
            self.say(&format!("[post-script error] path is a directory: {}\n", path.display()));
            return;
        }

        let interpreted_only = !is_executable(&path);
        if interpreted_only {
            self.say("[post-script] script not executable; running via interpreter\n");
        }

        let request = LaunchRequest {
            cwd: path
                .parent()
                .filter(|parent| !parent.as_os_str().is_empty())
                .map_or(repo, Path::to_path_buf),
            script: path.clone(),
            interpreted_only,
            ..Default::default()
        };
        let Some(process) = self.launcher.launch(&request, self.log_fn()) else {
            self.say(&format!("[post-script error] could not start {}\n", path.display()));
            return;
        };

        let code = self.stream(process, "post-script");
        self.say(&format!("[post-script exit {code}]\n"));
        if self.config.send_notifications {
            let body = match code {
                0 => "Exit code 0 (success)".to_string(),
                code => format!("Exit code {code} (errors)"),
            };
            self.sink.notify("Post script finished", &body);
        }
    }

    // Pump process output through decoder into sink until it exits.
    fn stream(&self, mut process: Box<dyn InteractiveProcess>, label: &str) -> i32 {
        self.slot.occupy(process.input());
        let mut decoder = AnsiDecoder::new();

        loop {
            match process.read_line() {
                Ok(Some(line)) => {
                    debug!("{label}: {}", String::from_utf8_lossy(&line).trim_end());
                    self.sink.append_spans(&decoder.feed(&line));
                }
                Ok(None) => break,
                Err(error) => {
                    warn!("{label} output failed: {error}");
                    self.say(&format!("[{label} error] {error}\n"));
                    break;
                }
            }
        }
        self.sink.append_spans(&decoder.finish());

        let code = process.wait().unwrap_or_else(|error| {
            warn!("{label} wait failed: {error}");
            self.say(&format!("[{label} error] {error}\n"));
            1
        });
        self.slot.vacate();

        code
    }

    fn finish(&mut self, request: UpdateRequest, result: Result<()>, report: Report) -> UpdateOutcome {
        self.enter(UpdateState::Notifying);
        let success = result.is_ok();
        let title = if success { "Update complete" } else { "Update failed" };

        let mut detail = report.detail;
        if let Err(error) = &result {
            self.say(&format!("[update] {error}\n"));
            if !detail.is_empty() && !detail.ends_with('\n') {
                detail.push('\n');
            }
            detail.push_str(&error.to_string());
        }

        info!("{title}");
        self.history.push(HistoryEntry::new(title, detail));
        if self.config.send_notifications {
            let body = if success { "Update succeeded." } else { "Update failed." };
            self.sink.notify(title, body);
        }

        if success {
            self.run_post_script();
        }

        self.enter(UpdateState::Idle);
        UpdateOutcome {
            request,
            success,
            title: title.into(),
            error: result.err(),
            installer_code: report.installer_code,
            trail: self.trail.clone(),
        }
    }

    fn finish_early(&mut self, request: UpdateRequest, title: String, error: Option<UpdateError>) -> UpdateOutcome {
        self.enter(UpdateState::Idle);
        UpdateOutcome {
            request,
            success: error.is_none(),
            title,
            error,
            installer_code: None,
            trail: self.trail.clone(),
        }
    }

    fn enter(&mut self, state: UpdateState) {
        debug!("{:?} -> {state:?}", self.state);
        self.state = state;
        self.trail.push(state);
        match state {
            UpdateState::Idle => self.sink.set_busy(false, state.hint()),
            state => self.sink.set_busy(true, state.hint()),
        }
    }

    fn log_fn(&self) -> LogFn {
        let sink = self.sink.clone();
        Arc::new(move |text: &str| {
            debug!("{}", text.trim_end());
            sink.append(text);
        })
    }

    fn say(&self, text: &str) {
        debug!("{}", text.trim_end());
        self.sink.append(text);
    }

    fn say_output(&self, output: &CommandOutput) {
        for text in [&output.stdout, &output.stderr] {
            if text.is_empty() {
                continue;
            }

            self.say(text);
            if !text.ends_with('\n') {
                self.say("\n");
            }
        }
    }
}

fn pull_detail(output: &CommandOutput) -> String {
    let mut detail = output.stdout.clone();
    if !output.stderr.is_empty() {
        detail.push('\n');
        detail.push_str(&output.stderr);
    }
    detail
}

fn is_executable(path: &Path) -> bool {
    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Reasons an update cycle did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpdateError {
    /// Repository could not be inspected.
    #[error("repository error: {0}")]
    Repository(String),

    /// Operator declined to abort interrupted operations.
    #[error("Aborted due to unresolved merge/rebase or user cancel.")]
    Canceled,

    /// Interrupted operations could not be cleaned up.
    #[error(transparent)]
    Conflict(#[from] ConflictError),

    /// Pull exited with non-zero code.
    #[error("git pull failed with exit code {0}")]
    Pull(i32),

    /// Installer script missing, or no fallback could start it.
    #[error("No executable installer found")]
    NoInstaller,

    /// Installer exited with non-zero code, after any escalation.
    #[error("installer exited with code {0}")]
    Installer(i32),
}

/// Friendly result alias :3
type Result<T, E = UpdateError> = std::result::Result<T, E>;
