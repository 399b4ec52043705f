// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Repository status snapshots.
//!
//! A [`RepoStatus`] is computed fresh on every refresh and never mutated
//! afterwards. The [`StatusBoard`] holds the one snapshot that is "current",
//! and only accepts a new snapshot if it came from a refresh that started
//! after the one that produced the snapshot already on display.

use crate::{
    repo::{has_git_metadata, Git},
    runner::{CommandRunner, SystemRunner},
};

use parking_lot::Mutex;
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};
use tracing::{debug, instrument, warn};

/// Immutable snapshot of repository state.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RepoStatus {
    /// Repository could be inspected at all.
    pub ok: bool,

    /// Path that was inspected.
    pub repo_path: PathBuf,

    /// Current branch.
    pub branch: Option<String>,

    /// Upstream tracking reference.
    pub upstream: Option<String>,

    /// Commits reachable from upstream but not from HEAD.
    pub behind: u32,

    /// Commits reachable from HEAD but not from upstream.
    pub ahead: u32,

    /// Number of modified or untracked paths.
    pub dirty: u32,

    /// Fetch failure message. Non-fatal.
    pub fetch_error: Option<String>,

    /// Reason repository could not be inspected.
    pub error: Option<String>,
}

impl RepoStatus {
    /// Snapshot of a repository that could not be inspected.
    pub fn failed(repo_path: impl Into<PathBuf>, error: impl Into<String>) -> Self {
        Self {
            ok: false,
            repo_path: repo_path.into(),
            error: Some(error.into()),
            ..Default::default()
        }
    }

    /// Upstream has commits that local branch lacks.
    pub fn has_updates(&self) -> bool {
        self.ok && self.behind > 0
    }

    /// One line banner headline.
    pub fn headline(&self) -> String {
        if !self.ok {
            return "Repository error".into();
        }

        if let Some(error) = &self.fetch_error {
            return format!("Fetch warning: {}", error.trim());
        }

        if self.has_updates() {
            format!("Updates available: {} new commit(s) to pull", self.behind)
        } else {
            "Up to date".into()
        }
    }
}

impl Display for RepoStatus {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        writeln!(fmt, "{}", self.headline())?;
        if !self.ok {
            return writeln!(
                fmt,
                "{}",
                self.error.as_deref().unwrap_or("Unknown error")
            );
        }

        writeln!(fmt, "Repo: {}", self.repo_path.display())?;
        writeln!(fmt, "Branch: {}", self.branch.as_deref().unwrap_or("(unknown)"))?;
        writeln!(
            fmt,
            "Upstream: {}",
            self.upstream.as_deref().unwrap_or("(no upstream)")
        )?;

        if self.dirty > 0 {
            writeln!(fmt, "Status: {} file(s) changed locally", self.dirty)?;
        } else {
            writeln!(fmt, "Status: Working tree clean")?;
        }

        let ahead = match self.ahead {
            0 => "not ahead".to_string(),
            count => format!("{count} ahead"),
        };
        let behind = match self.behind {
            0 => "not behind".to_string(),
            count => format!("{count} behind"),
        };
        writeln!(fmt, "Sync: {ahead}, {behind}")
    }
}

/// Compute [`RepoStatus`] snapshots.
#[derive(Debug, Default, Clone)]
pub struct StatusChecker<R = SystemRunner>
where
    R: CommandRunner,
{
    git: Git<R>,
}

impl<R> StatusChecker<R>
where
    R: CommandRunner,
{
    /// Construct new status checker.
    pub fn new(git: Git<R>) -> Self {
        Self { git }
    }

    /// Inspect repository at `path`.
    ///
    /// Only path problems produce a snapshot with `ok` unset. Every git
    /// failure past that point degrades into neutral values.
    #[instrument(skip(self), level = "debug")]
    pub fn check(&self, path: &Path) -> RepoStatus {
        if !path.is_dir() {
            return RepoStatus::failed(path, "Repository path not found");
        }

        if !has_git_metadata(path) {
            return RepoStatus::failed(path, "Not a git repository");
        }

        let fetch = self.git.fetch(path);
        let fetch_error = if fetch.success() {
            None
        } else {
            warn!("fetch failed for {}: {}", path.display(), fetch.stderr.trim());
            Some(fetch_error_message(&fetch.stderr))
        };

        let branch = self.git.branch(path);
        let upstream = self.git.upstream(path, branch.as_deref());
        let (behind, ahead) = match &upstream {
            Some(upstream) => (
                self.git.count_commits(path, &format!("HEAD..{upstream}")),
                self.git.count_commits(path, &format!("{upstream}..HEAD")),
            ),
            None => (0, 0),
        };
        let dirty = self.git.dirty_count(path);

        let status = RepoStatus {
            ok: true,
            repo_path: path.to_path_buf(),
            branch,
            upstream,
            behind,
            ahead,
            dirty,
            fetch_error,
            error: None,
        };
        debug!("{status:?}");

        status
    }
}

fn fetch_error_message(stderr: &str) -> String {
    match stderr.trim() {
        "" => "git fetch failed".into(),
        message => message.into(),
    }
}

/// Ticket handed out when a refresh starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RefreshTicket(u64);

/// Holder of the current [`RepoStatus`].
///
/// Refreshes are never queued. Each refresh takes a ticket through
/// [`StatusBoard::begin`], and publishes its result with that ticket. A
/// result is applied only if its ticket is newer than the ticket of the
/// snapshot already applied, so a slow refresh cannot clobber a fast one
/// that started later.
#[derive(Debug, Default)]
pub struct StatusBoard {
    issued: AtomicU64,
    current: Mutex<Option<(RefreshTicket, RepoStatus)>>,
}

impl StatusBoard {
    /// Construct new empty status board.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new refresh.
    pub fn begin(&self) -> RefreshTicket {
        RefreshTicket(self.issued.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Publish result of refresh. Returns false if result was stale.
    pub fn publish(&self, ticket: RefreshTicket, status: RepoStatus) -> bool {
        let mut current = self.current.lock();
        match current.as_ref() {
            Some((applied, _)) if *applied >= ticket => {
                debug!("dropping stale status from refresh {ticket:?}");
                false
            }
            _ => {
                *current = Some((ticket, status));
                true
            }
        }
    }

    /// Most recently applied snapshot.
    pub fn current(&self) -> Option<RepoStatus> {
        self.current.lock().as_ref().map(|(_, status)| status.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{testing::ScriptedRunner, CommandOutput};
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use simple_test_case::test_case;
    use std::sync::Arc;

    fn fake_repo() -> anyhow::Result<tempfile::TempDir> {
        let dir = tempfile::tempdir()?;
        std::fs::create_dir(dir.path().join(".git"))?;
        Ok(dir)
    }

    #[test_case(true, 0, 0, false; "clean and synced")]
    #[test_case(true, 0, 7, false; "only ahead")]
    #[test_case(true, 2, 0, true; "behind")]
    #[test_case(true, 3, 4, true; "diverged")]
    #[test_case(false, 5, 0, false; "broken repository")]
    #[test]
    fn has_updates_needs_ok_and_behind(ok: bool, behind: u32, ahead: u32, expect: bool) {
        use pretty_assertions::assert_eq;

        let status = RepoStatus {
            ok,
            behind,
            ahead,
            ..Default::default()
        };
        assert_eq!(status.has_updates(), expect);
        assert_eq!(status.has_updates(), status.ok && status.behind > 0);
    }

    #[test]
    fn missing_path_fails_fast() {
        let runner = Arc::new(ScriptedRunner::new());
        let checker = StatusChecker::new(Git::new(runner.clone()));
        let status = checker.check(Path::new("/definitely/not/here"));

        assert!(!status.ok);
        assert_eq!(status.error.as_deref(), Some("Repository path not found"));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn plain_directory_is_not_repository() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let checker = StatusChecker::new(Git::new(ScriptedRunner::new()));
        let status = checker.check(dir.path());

        assert!(!status.ok);
        assert_eq!(status.error.as_deref(), Some("Not a git repository"));

        Ok(())
    }

    #[test]
    fn fetch_failure_is_not_fatal() -> anyhow::Result<()> {
        let dir = fake_repo()?;
        let runner = ScriptedRunner::new()
            .on("git fetch --all --prune", CommandOutput::fail(128, "could not resolve host\n"))
            .on("git rev-parse --abbrev-ref HEAD", CommandOutput::ok("main\n"))
            .on(
                "git rev-parse --abbrev-ref --symbolic-full-name @{u}",
                CommandOutput::ok("origin/main\n"),
            )
            .on("git rev-list --count HEAD..origin/main", CommandOutput::ok("2\n"))
            .on("git rev-list --count origin/main..HEAD", CommandOutput::ok("1\n"))
            .on("git status --porcelain", CommandOutput::ok(" M hypr.conf\n"));
        let status = StatusChecker::new(Git::new(runner)).check(dir.path());

        let expect = RepoStatus {
            ok: true,
            repo_path: dir.path().to_path_buf(),
            branch: Some("main".into()),
            upstream: Some("origin/main".into()),
            behind: 2,
            ahead: 1,
            dirty: 1,
            fetch_error: Some("could not resolve host".into()),
            error: None,
        };
        assert_eq!(status, expect);
        assert!(status.has_updates());

        Ok(())
    }

    #[test]
    fn no_branch_means_no_counts() -> anyhow::Result<()> {
        let dir = fake_repo()?;
        let runner = Arc::new(
            ScriptedRunner::new()
                .on("git rev-parse --abbrev-ref HEAD", CommandOutput::fail(128, "bad HEAD"))
                .on(
                    "git rev-parse --abbrev-ref --symbolic-full-name @{u}",
                    CommandOutput::fail(128, "no upstream"),
                ),
        );
        let status = StatusChecker::new(Git::new(runner.clone())).check(dir.path());

        assert!(status.ok);
        assert_eq!(status.branch, None);
        assert_eq!(status.upstream, None);
        assert_eq!((status.behind, status.ahead), (0, 0));
        assert!(!runner.called("git rev-list"));

        Ok(())
    }

    #[test]
    fn display_status_banner() {
        let status = RepoStatus {
            ok: true,
            repo_path: PathBuf::from("/home/blah/dots"),
            branch: Some("main".into()),
            upstream: None,
            behind: 2,
            ahead: 0,
            dirty: 3,
            fetch_error: None,
            error: None,
        };
        let expect = indoc! {"
            Updates available: 2 new commit(s) to pull
            Repo: /home/blah/dots
            Branch: main
            Upstream: (no upstream)
            Status: 3 file(s) changed locally
            Sync: not ahead, 2 behind
        "};
        assert_eq!(status.to_string(), expect);

        let broken = RepoStatus::failed("/nope", "Repository path not found");
        assert_eq!(
            broken.to_string(),
            "Repository error\nRepository path not found\n"
        );
    }

    #[test]
    fn stale_refresh_is_ignored() {
        let board = StatusBoard::new();
        let slow = board.begin();
        let fast = board.begin();

        let fresh = RepoStatus {
            ok: true,
            behind: 1,
            ..Default::default()
        };
        assert!(board.publish(fast, fresh.clone()));
        assert!(!board.publish(slow, RepoStatus::failed("/x", "late")));
        assert_eq!(board.current(), Some(fresh));

        let newer = board.begin();
        assert!(board.publish(newer, RepoStatus::default()));
        assert_eq!(board.current(), Some(RepoStatus::default()));
    }
}
