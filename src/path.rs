// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Path resolution utilities.
//!
//! Locate the updater's configuration file, the dotfiles repository clone,
//! and the scratch space used for tweak archives.

use std::path::{Path, PathBuf};

/// Home directory that anchors the fallback repository location.
///
/// The directory itself is not checked for existence.
///
/// # Errors
///
/// - Return [`NoWayHome`] if home directory path cannot be determined.
pub fn home_dir() -> Result<PathBuf> {
    dirs::home_dir().ok_or(NoWayHome)
}

/// Determine default absolute path to updater configuration file.
///
/// Uses XDG Base Directory path `$XDG_CONFIG_HOME/updots/config.toml`. Does
/// not check if the path returned actually exists.
///
/// # Errors
///
/// - Return [`NoWayHome`] if home directory path cannot be determined.
///
/// # See Also
///
/// - [XDG Base Directory](https://wiki.archlinux.org/title/XDG_Base_Directory)
pub fn default_config_path() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|path| path.join("updots").join("config.toml"))
        .ok_or(NoWayHome)
}

/// Default location of the configuration repository clone.
///
/// # Errors
///
/// - Return [`NoWayHome`] if home directory path cannot be determined.
pub fn fallback_repo_path() -> Result<PathBuf> {
    home_dir().map(|path| path.join(".cache").join("dots-hyprland"))
}

/// Determine repository path to operate on.
///
/// Use configured path if it is an existing directory. Otherwise, fall back
/// to [`fallback_repo_path`] if that exists. Returns `None` when neither
/// works out, which callers should surface as a missing repository.
pub fn detect_repo_path(configured: &Path) -> Option<PathBuf> {
    if !configured.as_os_str().is_empty() && configured.is_dir() {
        return Some(configured.to_path_buf());
    }

    fallback_repo_path().ok().filter(|path| path.is_dir())
}

/// Scratch directory for short-lived archives.
pub fn scratch_dir() -> PathBuf {
    std::env::temp_dir()
}

/// Neither a home nor a configuration directory could be found for the
/// current user, so default updater paths are unknown.
#[derive(Clone, Debug, thiserror::Error)]
#[error("cannot locate home or config directory for default updater paths")]
pub struct NoWayHome;

/// Friendly result alias :3
pub type Result<T, E = NoWayHome> = std::result::Result<T, E>;
