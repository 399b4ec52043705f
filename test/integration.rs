// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use crate::{RepoFixture, RepoKind};

use anyhow::Result;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use updots::{
    config::{ConfigPath, InstallerMode, InstallerSettings, UpdaterConfig},
    orchestrator::{Orchestrator, UpdateRequest, UpdateState},
    process::ProcessSpawner,
    repo::{conflict::ConflictResolver, status::StatusChecker, Git},
    runner::SystemRunner,
    sink::MemorySink,
};

fn upstream_and_clone() -> Result<(tempfile::TempDir, RepoFixture, RepoFixture)> {
    let root = tempfile::tempdir()?;
    let upstream = RepoFixture::new(root.path().join("upstream"), RepoKind::Normal)?;
    upstream.stage_and_commit("README.md", "dots\n")?;
    upstream.stage_and_commit_script("setup", "#!/bin/sh\necho \"installing $1\"\n")?;
    let local = RepoFixture::clone_from(upstream.path(), root.path().join("local"))?;

    Ok((root, upstream, local))
}

#[test]
fn status_counts_commits_behind_upstream() -> Result<()> {
    let (_root, upstream, local) = upstream_and_clone()?;
    upstream.stage_and_commit("a.conf", "a = 1\n")?;
    upstream.stage_and_commit("b.conf", "b = 1\n")?;

    let status = StatusChecker::new(Git::new(SystemRunner)).check(local.path());

    assert!(status.ok);
    assert_eq!(status.branch.as_deref(), Some("main"));
    assert_eq!(status.upstream.as_deref(), Some("origin/main"));
    assert_eq!((status.behind, status.ahead, status.dirty), (2, 0, 0));
    assert_eq!(status.fetch_error, None);
    assert!(status.has_updates());

    Ok(())
}

#[test]
fn status_counts_local_changes() -> Result<()> {
    let (_root, _upstream, local) = upstream_and_clone()?;
    std::fs::write(local.path().join("README.md"), "edited\n")?;
    std::fs::write(local.path().join("notes.txt"), "untracked\n")?;

    let status = StatusChecker::new(Git::new(SystemRunner)).check(local.path());

    assert_eq!(status.dirty, 2);
    assert_eq!(status.behind, 0);
    assert_eq!(status.headline(), "Up to date");

    Ok(())
}

#[test]
fn bare_repository_is_not_a_clone() -> Result<()> {
    let root = tempfile::tempdir()?;
    let bare = RepoFixture::new(root.path().join("bare.git"), RepoKind::Bare)?;

    let status = StatusChecker::new(Git::new(SystemRunner)).check(bare.path());

    assert!(!status.ok);
    assert_eq!(status.error.as_deref(), Some("Not a git repository"));

    Ok(())
}

#[test]
fn conflict_resolver_aborts_interrupted_merge() -> Result<()> {
    let (_root, upstream, local) = upstream_and_clone()?;
    upstream.stage_and_commit("README.md", "upstream edit\n")?;
    local.stage_and_commit("README.md", "local edit\n")?;

    let git = Git::new(SystemRunner);
    assert!(git.fetch(local.path()).success());
    assert!(!git.call(local.path(), &["merge", "origin/main"]).success());

    let resolver = ConflictResolver::new(Git::new(SystemRunner));
    let state = resolver.detect(local.path());
    assert!(state.merge_in_progress);
    assert_eq!(state.unmerged_paths, vec!["README.md".to_string()]);

    let mut log = String::new();
    resolver.resolve(local.path(), &state, &mut |line: &str| log.push_str(line))?;

    assert!(resolver.detect(local.path()).is_clean());
    assert!(log.contains("merge --abort"));

    Ok(())
}

#[test]
fn git_path_follows_linked_worktree() -> Result<()> {
    let (root, _upstream, local) = upstream_and_clone()?;
    let linked = root.path().join("linked");
    let git = Git::new(SystemRunner);
    let linked_arg = linked.to_string_lossy();
    assert!(git
        .call(local.path(), &["worktree", "add", "-b", "side", &linked_arg])
        .success());
    assert!(linked.join(".git").is_file());

    let rebase_dir = git.git_path(&linked, "rebase-merge");
    let admin = local.path().join(".git").join("worktrees").join("linked");
    assert_eq!(
        rebase_dir.parent().map(|dir| dir.canonicalize()).transpose()?,
        Some(admin.canonicalize()?)
    );

    std::fs::create_dir(&rebase_dir)?;
    let state = ConflictResolver::new(Git::new(SystemRunner)).detect(&linked);
    assert!(state.rebase_in_progress);

    Ok(())
}

#[test]
fn update_pulls_then_runs_installer() -> Result<()> {
    let (_root, upstream, local) = upstream_and_clone()?;
    upstream.stage_and_commit("a.conf", "a = 2\n")?;

    let config = UpdaterConfig {
        repo_path: ConfigPath::new(local.path()),
        installer_mode: InstallerMode::FilesOnly,
        use_pty: false,
        send_notifications: false,
        installer: InstallerSettings {
            final_input: String::new(),
            ..Default::default()
        },
        ..Default::default()
    };
    let launcher = ProcessSpawner::from_config(&config);
    let sink = Arc::new(MemorySink::new(0));
    let mut orchestrator = Orchestrator::new(config, SystemRunner, launcher, sink.clone());

    let outcome = orchestrator.run(UpdateRequest::Update);

    assert!(outcome.success, "{}", sink.log());
    assert_eq!(outcome.installer_code, Some(0));
    assert!(outcome.trail.contains(&UpdateState::Pulling));
    assert!(!outcome.trail.contains(&UpdateState::Stashing));
    assert_eq!(local.head()?, upstream.head()?);

    let log = sink.log();
    assert!(log.contains("installing install-files"));
    assert!(log.contains("[installer exit 0]"));
    assert_eq!(orchestrator.history().len(), 1);
    assert_eq!(orchestrator.refresh().behind, 0);

    Ok(())
}
