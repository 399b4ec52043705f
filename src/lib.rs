// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Keep a dotfiles clone in sync with its upstream.
//!
//! Updots pulls new commits into a local clone of a configuration repository,
//! and then drives the repository's own installer script to apply them. That
//! installer is a third-party shell script that may prompt, print colors, and
//! overwrite files the user tweaked by hand. So updots will:
//!
//! 1. Check the clone against its upstream without touching it.
//! 2. Notice an interrupted merge or rebase, and offer to abort it.
//! 3. Stash local edits, pull with rebase, and pop the stash again.
//! 4. Run the installer under a pseudo-terminal, decoding its ANSI output and
//!    feeding it scripted answers.
//! 5. Snapshot the tweaks directory before install, and offer a diff-driven
//!    restore afterwards.
//!
//! # Collaborators
//!
//! The library never draws or asks anything by itself. Everything operator
//! facing goes through [`sink::UpdateSink`]. The `updots` binary provides a
//! terminal implementation of it.
//!
//! # Threading
//!
//! Every component is synchronous and blocking. The [`control`] module puts
//! them behind a tokio control loop that keeps blocking work off of the
//! thread that accepts commands.

pub mod ansi;
pub mod config;
pub mod control;
pub mod orchestrator;
pub mod path;
pub mod process;
pub mod repo;
pub mod runner;
pub mod sink;
pub mod tweaks;
