// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Installer planning.
//!
//! Decide once per update cycle whether the installer should do a full
//! install, or only lay down configuration files. In auto mode the operator
//! is asked, but only when incoming changes touch a path that hints at new
//! packages or dependencies.

use crate::{
    config::InstallerMode,
    repo::Git,
    runner::CommandRunner,
};

use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    path::Path,
};
use tracing::{debug, instrument};

/// Kind of install a plan performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallMode {
    /// Packages, services, and files.
    Full,

    /// Configuration files only.
    FilesOnly,
}

impl InstallMode {
    /// Installer argument selecting this mode.
    pub fn arg(&self) -> &'static str {
        match self {
            Self::Full => "install",
            Self::FilesOnly => "install-files",
        }
    }
}

impl Display for InstallMode {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Full => fmt.write_str("full"),
            Self::FilesOnly => fmt.write_str("files-only"),
        }
    }
}

/// Ordered installer invocations of one update cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallPlan {
    pub mode: InstallMode,

    /// Argument vectors handed to the installer script, in order.
    pub commands: Vec<Vec<String>>,
}

impl InstallPlan {
    /// Construct plan running installer once in `mode`.
    pub fn new(mode: InstallMode) -> Self {
        Self {
            mode,
            commands: vec![vec![mode.arg().to_string()]],
        }
    }

    /// Plan to retry with if this one fails.
    ///
    /// Only a files-only plan escalates, and only to a full install.
    pub fn escalation(&self) -> Option<Self> {
        match self.mode {
            InstallMode::FilesOnly => Some(Self::new(InstallMode::Full)),
            InstallMode::Full => None,
        }
    }
}

/// Question asked when auto mode finds package-related changes.
pub fn full_install_question(paths: &[String]) -> String {
    format!(
        "Package-related changes detected\n\
         Incoming changes found in {}.\n\
         Run FULL installation?\n\
         Yes = full (./setup install). No = minimal (./setup install-files).",
        paths.join("/")
    )
}

/// Build install plan for configured mode.
///
/// The `log` callback receives the same mode line the operator sees. For
/// auto mode `confirm` is consulted at most once, and only if
/// [`sensitive_changes`] found anything.
#[instrument(skip(git, sensitive, confirm, log), level = "debug")]
pub fn plan<R>(
    mode: InstallerMode,
    git: &Git<R>,
    repo: &Path,
    upstream: Option<&str>,
    sensitive: &[String],
    confirm: impl FnOnce(&str) -> bool,
    log: &mut dyn FnMut(&str),
) -> InstallPlan
where
    R: CommandRunner,
{
    match mode {
        InstallerMode::Full => {
            log("Installer mode: full install.\n");
            InstallPlan::new(InstallMode::Full)
        }
        InstallerMode::FilesOnly => {
            log("Installer mode: files-only.\n");
            InstallPlan::new(InstallMode::FilesOnly)
        }
        InstallerMode::Auto => {
            log("Installer mode: auto (pending decision).\n");
            let changed = sensitive_changes(git, repo, upstream, sensitive);
            if changed.is_empty() {
                debug!("no sensitive changes, going files-only");
                return InstallPlan::new(InstallMode::FilesOnly);
            }

            if confirm(&full_install_question(sensitive)) {
                log("Auto mode: full install chosen.\n");
                InstallPlan::new(InstallMode::Full)
            } else {
                log("Auto mode: files-only install chosen.\n");
                InstallPlan::new(InstallMode::FilesOnly)
            }
        }
    }
}

/// Paths under `sensitive` that incoming changes touch.
///
/// Compares HEAD against upstream when upstream is known. Otherwise falls
/// back to local modifications under the same paths. Stops at the first
/// sensitive path that has changes.
pub fn sensitive_changes<R>(
    git: &Git<R>,
    repo: &Path,
    upstream: Option<&str>,
    sensitive: &[String],
) -> Vec<String>
where
    R: CommandRunner,
{
    for path in sensitive {
        let changed = match upstream {
            Some(upstream) => git.changed_paths(repo, &format!("HEAD..{upstream}"), path),
            None => git.local_changes(repo, path),
        };

        if !changed.is_empty() {
            debug!("sensitive path {path} has {} change(s)", changed.len());
            return changed;
        }
    }

    Vec::new()
}

/// Files under repository `mirror` directory that changed upstream, relative
/// to that directory.
pub fn upstream_changed_under<R>(git: &Git<R>, repo: &Path, upstream: &str, mirror: &str) -> Vec<String>
where
    R: CommandRunner,
{
    let prefix = format!("{}/", mirror.trim_end_matches('/'));
    git.changed_paths(repo, &format!("HEAD..{upstream}"), mirror)
        .into_iter()
        .filter_map(|path| path.strip_prefix(&prefix).map(str::to_string))
        .filter(|path| !path.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{testing::ScriptedRunner, CommandOutput};
    use pretty_assertions::assert_eq;
    use simple_test_case::test_case;
    use std::sync::Arc;

    fn sensitive() -> Vec<String> {
        vec!["sdata".into(), "dist-arch".into()]
    }

    #[test_case(InstallerMode::Full, InstallMode::Full; "full")]
    #[test_case(InstallerMode::FilesOnly, InstallMode::FilesOnly; "files only")]
    #[test]
    fn fixed_modes_never_ask(mode: InstallerMode, expect: InstallMode) {
        use pretty_assertions::assert_eq;

        let runner = Arc::new(ScriptedRunner::new());
        let git = Git::new(runner.clone());
        let mut log = Vec::new();

        let result = plan(
            mode,
            &git,
            Path::new("."),
            Some("origin/main"),
            &sensitive(),
            |_| panic!("fixed mode asked a question"),
            &mut |line: &str| log.push(line.to_string()),
        );

        assert_eq!(result.mode, expect);
        assert_eq!(result.commands, vec![vec![expect.arg().to_string()]]);
        assert!(runner.calls().is_empty());
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn auto_mode_asks_only_on_sensitive_change() {
        let runner = ScriptedRunner::new().on(
            "git diff --name-only HEAD..origin/main -- dist-arch",
            CommandOutput::ok("dist-arch/PKGBUILD\n"),
        );
        let git = Git::new(runner);
        let mut asked = Vec::new();

        let result = plan(
            InstallerMode::Auto,
            &git,
            Path::new("."),
            Some("origin/main"),
            &sensitive(),
            |question| {
                asked.push(question.to_string());
                true
            },
            &mut |_: &str| {},
        );

        assert_eq!(result.mode, InstallMode::Full);
        assert_eq!(asked.len(), 1);
        assert!(asked[0].starts_with("Package-related changes detected"));
        assert!(asked[0].contains("sdata/dist-arch"));
    }

    #[test]
    fn auto_mode_without_changes_is_files_only() {
        let git = Git::new(ScriptedRunner::new());
        let result = plan(
            InstallerMode::Auto,
            &git,
            Path::new("."),
            Some("origin/main"),
            &sensitive(),
            |_| panic!("asked without sensitive changes"),
            &mut |_: &str| {},
        );

        assert_eq!(result, InstallPlan::new(InstallMode::FilesOnly));
    }

    #[test]
    fn unknown_upstream_checks_local_changes() {
        let runner = Arc::new(ScriptedRunner::new().on(
            "git status --porcelain -- sdata",
            CommandOutput::ok(" M sdata/deps.txt\n"),
        ));
        let git = Git::new(runner.clone());

        let changed = sensitive_changes(&git, Path::new("."), None, &sensitive());

        assert_eq!(changed, vec!["M sdata/deps.txt".to_string()]);
        assert!(!runner.called("git diff"));
    }

    #[test]
    fn only_files_only_plan_escalates() {
        let files = InstallPlan::new(InstallMode::FilesOnly);
        assert_eq!(files.escalation(), Some(InstallPlan::new(InstallMode::Full)));
        assert_eq!(InstallPlan::new(InstallMode::Full).escalation(), None);
    }

    #[test]
    fn upstream_changes_are_made_relative_to_mirror() {
        let runner = ScriptedRunner::new().on(
            "git diff --name-only HEAD..origin/main -- dots/.config/quickshell/ii",
            CommandOutput::ok(indoc::indoc! {"
                dots/.config/quickshell/ii/shell.qml
                dots/.config/quickshell/ii/modules/bar.qml
            "}),
        );
        let git = Git::new(runner);

        let changed = upstream_changed_under(
            &git,
            Path::new("."),
            "origin/main",
            "dots/.config/quickshell/ii",
        );

        assert_eq!(
            changed,
            vec!["shell.qml".to_string(), "modules/bar.qml".to_string()]
        );
    }
}
