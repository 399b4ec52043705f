// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Conflict detection and recovery.
//!
//! An interrupted merge, rebase, or cherry-pick blocks any further pull. The
//! resolver can tell which of those are in progress, and abort them. It
//! never decides on its own to abort. The caller must get the operator's
//! consent before calling [`ConflictResolver::resolve`].

use crate::{
    repo::Git,
    runner::{CommandRunner, SystemRunner},
};

use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    path::Path,
};
use tracing::{info, instrument, warn};

/// Interrupted operation that can be aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Merge,
    Rebase,
    CherryPick,
}

impl Operation {
    /// Git subcommand name of operation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Merge => "merge",
            Self::Rebase => "rebase",
            Self::CherryPick => "cherry-pick",
        }
    }
}

impl Display for Operation {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(self.as_str())
    }
}

/// Computed conflict state of a repository.
///
/// Recompute through [`ConflictResolver::detect`] after every abort attempt.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConflictState {
    pub unmerged_paths: Vec<String>,
    pub merge_in_progress: bool,
    pub rebase_in_progress: bool,
    pub cherry_pick_in_progress: bool,
}

impl ConflictState {
    /// Nothing blocks a pull.
    pub fn is_clean(&self) -> bool {
        self.unmerged_paths.is_empty() && self.in_progress().is_empty()
    }

    /// Interrupted operations, in the order they get aborted.
    pub fn in_progress(&self) -> Vec<Operation> {
        let mut ops = Vec::new();
        if self.merge_in_progress {
            ops.push(Operation::Merge);
        }
        if self.rebase_in_progress {
            ops.push(Operation::Rebase);
        }
        if self.cherry_pick_in_progress {
            ops.push(Operation::CherryPick);
        }
        ops
    }
}

impl Display for ConflictState {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        writeln!(fmt, "Unresolved merge/rebase detected.")?;
        if !self.unmerged_paths.is_empty() {
            writeln!(fmt, "Unmerged files: {}", self.unmerged_paths.len())?;
        }
        for op in self.in_progress() {
            writeln!(fmt, "A {op} is in progress.")?;
        }
        write!(fmt, "Abort the in-progress operation(s) and continue?")
    }
}

/// Detect and abort interrupted operations.
#[derive(Debug, Default, Clone)]
pub struct ConflictResolver<R = SystemRunner>
where
    R: CommandRunner,
{
    git: Git<R>,
}

impl<R> ConflictResolver<R>
where
    R: CommandRunner,
{
    /// Construct new conflict resolver.
    pub fn new(git: Git<R>) -> Self {
        Self { git }
    }

    /// Compute conflict state of repository.
    #[instrument(skip(self), level = "debug")]
    pub fn detect(&self, path: &Path) -> ConflictState {
        ConflictState {
            unmerged_paths: self.git.unmerged_paths(path),
            merge_in_progress: self.git.ref_exists(path, "MERGE_HEAD"),
            cherry_pick_in_progress: self.git.ref_exists(path, "CHERRY_PICK_HEAD"),
            rebase_in_progress: ["rebase-apply", "rebase-merge"]
                .iter()
                .any(|dir| self.git.git_path(path, dir).is_dir()),
        }
    }

    /// Abort every interrupted operation in `state`.
    ///
    /// Each abort is attempted even if an earlier one failed. Every step is
    /// reported through `log`.
    ///
    /// # Errors
    ///
    /// - Return [`ConflictError::AbortFailed`] if any abort command failed.
    /// - Return [`ConflictError::StillUnmerged`] if unmerged paths remain
    ///   after all aborts.
    #[instrument(skip(self, state, log), level = "debug")]
    pub fn resolve(
        &self,
        path: &Path,
        state: &ConflictState,
        log: &mut dyn FnMut(&str),
    ) -> Result<()> {
        let mut failed = Vec::new();
        for op in state.in_progress() {
            log(&format!("[git] {op} --abort\n"));
            let output = self.git.call(path, &[op.as_str(), "--abort"]);
            if !output.success() {
                warn!("{op} --abort failed: {}", output.stderr.trim());
                log(&format!("[git error] {op} --abort: {}\n", output.stderr.trim()));
                failed.push(op);
            }
        }

        let unmerged = self.git.unmerged_paths(path);
        if !unmerged.is_empty() {
            log("[git] Unmerged files still present after abort; canceling update.\n");
            return Err(ConflictError::StillUnmerged(unmerged));
        }

        if !failed.is_empty() {
            return Err(ConflictError::AbortFailed(failed));
        }

        info!("conflicts resolved in {}", path.display());
        Ok(())
    }
}

/// Conflict resolution error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConflictError {
    /// Abort command failed for listed operations.
    #[error("failed to abort: {}", join_ops(.0))]
    AbortFailed(Vec<Operation>),

    /// Paths are still unmerged after aborting.
    #[error("unmerged files remain after abort: {}", .0.join(", "))]
    StillUnmerged(Vec<String>),
}

fn join_ops(ops: &[Operation]) -> String {
    ops.iter()
        .map(Operation::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Friendly result alias :3
type Result<T, E = ConflictError> = std::result::Result<T, E>;
