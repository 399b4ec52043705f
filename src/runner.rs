// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Finite external command execution.
//!
//! Run a command to completion with a timeout, and capture what it wrote to
//! stdout and stderr. Failures never escape as errors. Anything that goes
//! wrong, e.g., the binary is missing, the process hangs, the OS refuses to
//! spawn it, is folded into a [`CommandOutput`] with exit code 1 and the
//! reason in stderr. Callers treat a failed command as data.

use nix::{
    sys::signal::{killpg, Signal},
    unistd::Pid,
};
use std::{
    io::Read,
    os::unix::process::CommandExt,
    path::Path,
    process::{Command, Stdio},
    sync::{mpsc, Arc},
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, instrument, warn};

/// Timeout for quick status queries.
pub const STATUS_TIMEOUT: Duration = Duration::from_secs(15);

/// Timeout for long-running repository mutations like pull.
pub const LONG_TIMEOUT: Duration = Duration::from_secs(300);

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How long output may keep trickling in once the command itself is gone.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Captured result of a finished command.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code of process, or 1 if it never ran to completion.
    pub code: i32,

    /// Everything written to stdout.
    pub stdout: String,

    /// Everything written to stderr, or the reason the command failed.
    pub stderr: String,
}

impl CommandOutput {
    /// Construct output of a command that exited successfully.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Construct output of a command that failed with given code.
    pub fn fail(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Check if command exited with zero.
    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// Non-empty lines of stdout, trimmed.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
    }
}

/// Layer of indirection for running finite external commands.
pub trait CommandRunner: Send + Sync {
    /// Run `argv` in `cwd`, killing it once `timeout` elapses.
    fn run(&self, argv: &[&str], cwd: &Path, timeout: Duration) -> CommandOutput;
}

impl<R> CommandRunner for Arc<R>
where
    R: CommandRunner + ?Sized,
{
    fn run(&self, argv: &[&str], cwd: &Path, timeout: Duration) -> CommandOutput {
        (**self).run(argv, cwd, timeout)
    }
}

/// Command runner backed by real OS processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    #[instrument(skip(self, cwd, timeout), level = "debug")]
    fn run(&self, argv: &[&str], cwd: &Path, timeout: Duration) -> CommandOutput {
        let Some((program, args)) = argv.split_first() else {
            return CommandOutput::fail(1, "empty command");
        };

        // INVARIANT: Command leads its own process group, so a timeout can
        // take down helpers it spawned along with it.
        let mut child = match Command::new(program)
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()
        {
            Ok(child) => child,
            Err(error) => {
                warn!("failed to spawn {program:?}: {error}");
                return CommandOutput::fail(1, error.to_string());
            }
        };

        // INVARIANT: Drain both pipes concurrently so a chatty child never
        // blocks on a full pipe while we wait on it.
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let deadline = Instant::now() + timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break Ok(status),
                Ok(None) if Instant::now() >= deadline => {
                    kill_group(child.id());
                    let _ = child.kill();
                    let _ = child.wait();
                    break Err(format!(
                        "command {:?} timed out after {}s",
                        argv.join(" "),
                        timeout.as_secs_f32()
                    ));
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(error) => {
                    kill_group(child.id());
                    let _ = child.kill();
                    break Err(error.to_string());
                }
            }
        };

        // INVARIANT: Stray writers holding our pipes open never stall us past
        // the deadline plus a short grace period.
        let drain_deadline = deadline.max(Instant::now()) + DRAIN_GRACE;
        let stdout = stdout
            .map(|rx| collect_drain(rx, drain_deadline))
            .unwrap_or_default();
        let stderr = stderr
            .map(|rx| collect_drain(rx, drain_deadline))
            .unwrap_or_default();

        match status {
            Ok(status) => {
                let output = CommandOutput {
                    // INVARIANT: Death by signal has no code, report it as plain failure.
                    code: status.code().unwrap_or(1),
                    stdout,
                    stderr,
                };
                debug!("{:?} exited with {}", argv.join(" "), output.code);
                output
            }
            Err(message) => {
                warn!("{message}");
                CommandOutput::fail(1, message)
            }
        }
    }
}

fn drain(mut pipe: impl Read + Send + 'static) -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut bytes = Vec::new();
        let _ = pipe.read_to_end(&mut bytes);
        let _ = tx.send(String::from_utf8_lossy(&bytes).into_owned());
    });
    rx
}

// Output collected by drain thread, or nothing if it is still blocked once
// `deadline` passes. A blocked thread is left behind to finish on its own.
fn collect_drain(rx: mpsc::Receiver<String>, deadline: Instant) -> String {
    let wait = deadline.saturating_duration_since(Instant::now());
    rx.recv_timeout(wait).unwrap_or_else(|_| {
        warn!("output still held open by a stray process, giving up on it");
        String::new()
    })
}

fn kill_group(pgid: u32) {
    if let Err(error) = killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
        debug!("cannot kill process group {pgid}: {error}");
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::{HashMap, VecDeque};

    type Effect = Box<dyn Fn() + Send + Sync>;

    /// Command runner that replays canned outputs keyed by command line.
    ///
    /// Queued outputs for the same command are consumed in order, with the
    /// last one repeating forever. Unknown commands succeed with no output.
    #[derive(Default)]
    pub(crate) struct ScriptedRunner {
        responses: Mutex<HashMap<String, VecDeque<CommandOutput>>>,
        effects: Mutex<HashMap<String, Effect>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedRunner {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn on(self, command: &str, output: CommandOutput) -> Self {
            self.responses
                .lock()
                .entry(command.to_string())
                .or_default()
                .push_back(output);
            self
        }

        pub(crate) fn with_effect(
            self,
            command: &str,
            effect: impl Fn() + Send + Sync + 'static,
        ) -> Self {
            self.effects
                .lock()
                .insert(command.to_string(), Box::new(effect));
            self
        }

        pub(crate) fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        pub(crate) fn called(&self, prefix: &str) -> bool {
            self.calls.lock().iter().any(|call| call.starts_with(prefix))
        }
    }

    impl CommandRunner for ScriptedRunner {
        fn run(&self, argv: &[&str], _cwd: &Path, _timeout: Duration) -> CommandOutput {
            let key = argv.join(" ");
            self.calls.lock().push(key.clone());
            if let Some(effect) = self.effects.lock().get(&key) {
                effect();
            }

            let mut responses = self.responses.lock();
            match responses.get_mut(&key) {
                Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or_default(),
                Some(queue) => queue.front().cloned().unwrap_or_default(),
                None => CommandOutput::default(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn capture_stdout_of_finished_command() {
        let output = SystemRunner.run(&["echo", "hello"], Path::new("."), STATUS_TIMEOUT);
        assert!(output.success());
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[test]
    fn report_non_zero_exit_code() {
        let output = SystemRunner.run(
            &["sh", "-c", "echo oops >&2; exit 3"],
            Path::new("."),
            STATUS_TIMEOUT,
        );
        assert_eq!(output.code, 3);
        assert_eq!(output.stderr.trim(), "oops");
    }

    #[test]
    fn spawn_failure_becomes_data() {
        let output = SystemRunner.run(
            &["definitely-not-a-real-binary-updots"],
            Path::new("."),
            STATUS_TIMEOUT,
        );
        assert_eq!(output.code, 1);
        assert_eq!(output.stdout, "");
        assert!(!output.stderr.is_empty());
    }

    #[test]
    fn empty_command_fails() {
        let output = SystemRunner.run(&[], Path::new("."), STATUS_TIMEOUT);
        assert_eq!(output, CommandOutput::fail(1, "empty command"));
    }

    #[test]
    fn kill_command_after_timeout() {
        let start = Instant::now();
        let output = SystemRunner.run(&["sleep", "5"], Path::new("."), Duration::from_millis(100));
        assert_eq!(output.code, 1);
        assert!(output.stderr.contains("timed out"));
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn timeout_kills_background_children_too() {
        let start = Instant::now();
        let output = SystemRunner.run(
            &["sh", "-c", "sleep 30 & sleep 30"],
            Path::new("."),
            Duration::from_millis(200),
        );
        assert_eq!(output.code, 1);
        assert!(output.stderr.contains("timed out"));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn detached_writer_does_not_stall_finished_command() {
        let start = Instant::now();
        let output = SystemRunner.run(
            &["sh", "-c", "echo done; (sleep 30 &)"],
            Path::new("."),
            Duration::from_millis(200),
        );
        assert!(output.success());
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn run_in_working_directory() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let output = SystemRunner.run(&["pwd"], dir.path(), STATUS_TIMEOUT);
        let expect = dir.path().canonicalize()?;
        assert_eq!(std::path::PathBuf::from(output.stdout.trim()).canonicalize()?, expect);

        Ok(())
    }

    #[test]
    fn lines_skip_blank_output() {
        let output = CommandOutput::ok(" a.txt \n\n b.txt\n  \n");
        assert_eq!(output.lines().collect::<Vec<_>>(), vec!["a.txt", "b.txt"]);
    }
}
