// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Repository access through the Git binary.
//!
//! The updater never implements version control itself. Every query and
//! mutation is a call to an installed `git` binary made through a
//! [`CommandRunner`], so a failing call comes back as data instead of an
//! error. Query helpers built on top of that collapse failures into neutral
//! values, e.g., zero commits, no branch, no paths.
//!
//! # Why Shell Out?
//!
//! The Git CLI refuses to clobber uncommitted work during pull, stash, and
//! abort operations unless explicitly forced, and it honours every bit of
//! user configuration (credentials helpers, hooks, autostash). Reimplementing
//! those protections on top of a library binding buys nothing here.

pub mod conflict;
pub mod status;

use crate::runner::{CommandOutput, CommandRunner, SystemRunner, LONG_TIMEOUT, STATUS_TIMEOUT};

use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::debug;

/// Stash message used for automatic stashes.
pub const STASH_TAG: &str = "updots-auto";

/// Check if path carries repository metadata.
///
/// A regular clone has a `.git` directory, while linked worktrees carry a
/// `.git` file pointing elsewhere. Both count.
pub fn has_git_metadata(path: &Path) -> bool {
    let dotgit = path.join(".git");
    dotgit.is_dir() || dotgit.is_file()
}

/// Thin wrapper that speaks Git through a command runner.
#[derive(Debug, Default, Clone)]
pub struct Git<R = SystemRunner>
where
    R: CommandRunner,
{
    runner: R,
}

impl<R> Git<R>
where
    R: CommandRunner,
{
    /// Construct new Git wrapper.
    pub fn new(runner: R) -> Self {
        Self { runner }
    }

    /// Run `git <args>` inside repository with status query timeout.
    pub fn call(&self, repo: &Path, args: &[&str]) -> CommandOutput {
        self.call_with_timeout(repo, args, STATUS_TIMEOUT)
    }

    /// Run `git <args>` inside repository with custom timeout.
    pub fn call_with_timeout(&self, repo: &Path, args: &[&str], timeout: Duration) -> CommandOutput {
        let mut argv = Vec::with_capacity(args.len() + 1);
        argv.push("git");
        argv.extend_from_slice(args);
        self.runner.run(&argv, repo, timeout)
    }

    /// Fetch all remotes, pruning stale remote-tracking refs.
    pub fn fetch(&self, repo: &Path) -> CommandOutput {
        self.call_with_timeout(repo, &["fetch", "--all", "--prune"], LONG_TIMEOUT)
    }

    /// Current branch name, or `None` if it cannot be determined.
    pub fn branch(&self, repo: &Path) -> Option<String> {
        let output = self.call(repo, &["rev-parse", "--abbrev-ref", "HEAD"]);
        let branch = output.stdout.trim();
        if output.success() && !branch.is_empty() {
            Some(branch.to_string())
        } else {
            None
        }
    }

    /// Upstream of current branch.
    ///
    /// Resolves the configured tracking reference first. If no tracking
    /// reference exists but branch is known, then assume `origin/<branch>`.
    pub fn upstream(&self, repo: &Path, branch: Option<&str>) -> Option<String> {
        let output = self.call(
            repo,
            &["rev-parse", "--abbrev-ref", "--symbolic-full-name", "@{u}"],
        );
        let upstream = output.stdout.trim();
        if output.success() && !upstream.is_empty() {
            return Some(upstream.to_string());
        }

        branch.map(|branch| format!("origin/{branch}"))
    }

    /// Count commits in a revision range. Any failure counts as zero.
    pub fn count_commits(&self, repo: &Path, range: &str) -> u32 {
        let output = self.call(repo, &["rev-list", "--count", range]);
        if !output.success() {
            debug!("cannot count commits in {range}: {}", output.stderr.trim());
            return 0;
        }

        output.stdout.trim().parse().unwrap_or(0)
    }

    /// Number of modified or untracked paths in working tree.
    pub fn dirty_count(&self, repo: &Path) -> u32 {
        let output = self.call(repo, &["status", "--porcelain"]);
        if !output.success() {
            return 0;
        }

        output.lines().count() as u32
    }

    /// Paths with unresolved merge conflicts.
    pub fn unmerged_paths(&self, repo: &Path) -> Vec<String> {
        let output = self.call(repo, &["diff", "--name-only", "--diff-filter=U"]);
        if !output.success() {
            return Vec::new();
        }

        output.lines().map(str::to_string).collect()
    }

    /// Check if a pseudo reference like `MERGE_HEAD` currently exists.
    pub fn ref_exists(&self, repo: &Path, name: &str) -> bool {
        self.call(repo, &["rev-parse", "-q", "--verify", name])
            .success()
    }

    /// Location of `name` inside repository's Git directory.
    ///
    /// Asks Git through `rev-parse --git-path`, so linked worktrees and
    /// submodules whose `.git` is a file resolve to their real Git directory.
    /// Falls back to `<repo>/.git/<name>` if Git gives no answer.
    pub fn git_path(&self, repo: &Path, name: &str) -> PathBuf {
        let output = self.call(repo, &["rev-parse", "--git-path", name]);
        let resolved = output.stdout.trim();
        if output.success() && !resolved.is_empty() {
            // INVARIANT: Relative answers are relative to the repository root.
            return repo.join(resolved);
        }

        debug!("cannot resolve git path {name}: {}", output.stderr.trim());
        repo.join(".git").join(name)
    }

    /// Paths under `pathspec` that differ across revision range.
    pub fn changed_paths(&self, repo: &Path, range: &str, pathspec: &str) -> Vec<String> {
        let output = self.call(repo, &["diff", "--name-only", range, "--", pathspec]);
        if !output.success() {
            return Vec::new();
        }

        output.lines().map(str::to_string).collect()
    }

    /// Paths under `pathspec` with local modifications.
    pub fn local_changes(&self, repo: &Path, pathspec: &str) -> Vec<String> {
        let output = self.call(repo, &["status", "--porcelain", "--", pathspec]);
        if !output.success() {
            return Vec::new();
        }

        output.lines().map(str::to_string).collect()
    }

    /// Stash local modifications, including untracked files.
    pub fn stash_push(&self, repo: &Path) -> CommandOutput {
        self.call_with_timeout(
            repo,
            &["stash", "push", "--include-untracked", "-m", STASH_TAG],
            LONG_TIMEOUT,
        )
    }

    /// Restore most recent stash.
    pub fn stash_pop(&self, repo: &Path) -> CommandOutput {
        self.call_with_timeout(repo, &["stash", "pop"], LONG_TIMEOUT)
    }

    /// Rebase local branch onto its upstream.
    pub fn pull(&self, repo: &Path) -> CommandOutput {
        self.call_with_timeout(
            repo,
            &["pull", "--rebase", "--autostash", "--stat"],
            LONG_TIMEOUT,
        )
    }
}
