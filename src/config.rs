// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration layout.
//!
//! Specify the layout of the updater configuration file to simplify the
//! process of serialization and deserialization. File I/O is left to the
//! caller to figure out.
//!
//! # General Layout
//!
//! The configuration is a flat table of settings followed by an
//! `[installer]` table that describes how the installer script of the
//! repository should be invoked. Every key is optional. Missing keys take
//! their default value, so an empty file is a valid configuration.
//!
//! All path-valued keys are shell expanded after parsing, thus `~` and
//! environment variables may be used freely.

use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    path::{Path, PathBuf},
    str::FromStr,
};

/// Updater configuration layout.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpdaterConfig {
    /// Path to local clone of the configuration repository.
    pub repo_path: ConfigPath,

    /// Seconds between periodic status refreshes. Zero disables the timer.
    pub auto_refresh_seconds: u64,

    /// How the installer should be invoked after a pull.
    pub installer_mode: InstallerMode,

    /// Run installer under a pseudo-terminal.
    pub use_pty: bool,

    /// Force color-friendly environment variables onto the installer.
    pub force_color_env: bool,

    /// Invoke notifier once an update cycle finishes.
    pub send_notifications: bool,

    /// Console trim limit for sinks that keep a scrollback. Zero means unlimited.
    pub log_max_lines: usize,

    /// Optional script to execute after a successful update.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_script_path: Option<ConfigPath>,

    /// Snapshot the tweaks directory before install, and offer restore after.
    pub keep_tweaks: bool,

    /// Directory holding user tweaks that the installer may overwrite.
    pub tweaks_dir: ConfigPath,

    /// Archived file count above which one bulk restore decision is offered.
    pub tweaks_bulk_threshold: usize,

    /// Repository directory that mirrors the tweaks directory.
    pub tweaks_mirror: String,

    /// Installer invocation settings.
    pub installer: InstallerSettings,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            repo_path: ConfigPath::default(),
            auto_refresh_seconds: 60,
            installer_mode: InstallerMode::default(),
            use_pty: true,
            force_color_env: true,
            send_notifications: true,
            log_max_lines: 5000,
            post_script_path: None,
            keep_tweaks: false,
            tweaks_dir: ConfigPath::new("~/.config/quickshell/ii"),
            tweaks_bulk_threshold: 200,
            tweaks_mirror: "dots/.config/quickshell/ii".into(),
            installer: InstallerSettings::default(),
        }
    }
}

impl UpdaterConfig {
    /// Perform shell expansion on every path-valued setting.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::ShellExpansion`] if a variable cannot be
    ///   resolved.
    pub fn expand(mut self) -> Result<Self> {
        self.repo_path = self.repo_path.expand()?;
        self.tweaks_dir = self.tweaks_dir.expand()?;
        self.post_script_path = match self.post_script_path {
            Some(path) if !path.is_empty() => Some(path.expand()?),
            _ => None,
        };

        Ok(self)
    }

    /// Absolute path to the installer script inside the repository.
    pub fn installer_path(&self) -> PathBuf {
        self.repo_path.as_path().join(&self.installer.script)
    }
}

impl FromStr for UpdaterConfig {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let config: UpdaterConfig = toml::de::from_str(data).map_err(ConfigError::Deserialize)?;

        // INVARIANT: Path-valued settings are always shell expanded.
        config.expand()
    }
}

impl Display for UpdaterConfig {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string_pretty(self)
                .map_err(ConfigError::Serialize)?
                .as_str(),
        )
    }
}

/// Installer selection policy.
#[derive(Default, Debug, PartialEq, Eq, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstallerMode {
    /// Ask for a full install only when upstream touches sensitive paths.
    #[default]
    Auto,

    /// Always run full install.
    Full,

    /// Always run the files-only install.
    FilesOnly,
}

impl Display for InstallerMode {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Auto => fmt.write_str("auto"),
            Self::Full => fmt.write_str("full"),
            Self::FilesOnly => fmt.write_str("files-only"),
        }
    }
}

/// Installer invocation settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct InstallerSettings {
    /// Installer script path relative to repository.
    pub script: PathBuf,

    /// Shell interpreters to fall back on, in priority order.
    pub interpreters: Vec<String>,

    /// Scripted inputs fed to the installer once it starts.
    pub auto_inputs: Vec<String>,

    /// Trailing input written after the scripted inputs. Empty disables it.
    pub final_input: String,

    /// Repository paths whose upstream changes warrant a full install.
    pub sensitive_paths: Vec<String>,
}

impl Default for InstallerSettings {
    fn default() -> Self {
        Self {
            script: PathBuf::from("setup"),
            interpreters: vec!["fish".into(), "sh".into()],
            auto_inputs: Vec::new(),
            final_input: "yesforall\n".into(),
            sensitive_paths: vec!["sdata".into(), "dist-arch".into()],
        }
    }
}

impl InstallerSettings {
    /// Trailing sentinel input, if enabled.
    pub fn final_input(&self) -> Option<&str> {
        if self.final_input.is_empty() {
            None
        } else {
            Some(self.final_input.as_str())
        }
    }
}

/// Path-valued setting that goes through shell expansion.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct ConfigPath(PathBuf);

impl ConfigPath {
    /// Construct new configuration path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    /// Treat configuration path as [`Path`] slice.
    pub fn as_path(&self) -> &Path {
        self.0.as_path()
    }

    /// Check if path was left blank.
    pub fn is_empty(&self) -> bool {
        self.0.as_os_str().is_empty()
    }

    fn expand(self) -> Result<Self> {
        if self.is_empty() {
            return Ok(self);
        }

        Ok(Self::new(
            shellexpand::full(self.to_string().as_str())
                .map_err(ConfigError::ShellExpansion)?
                .into_owned(),
        ))
    }
}

impl Display for ConfigPath {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(self.as_path().to_string_lossy().as_ref())
    }
}

/// Configuration error types.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to deserialize configuration.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Failed to serialize configuration.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    /// Failed to perform shell expansion on configuration.
    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<std::env::VarError>),
}

impl From<ConfigError> for FmtError {
    fn from(_: ConfigError) -> Self {
        FmtError
    }
}

/// Friendly result alias :3
type Result<T, E = ConfigError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;

    #[sealed_test(env = [("DOTS", "/home/blah/dots"), ("TWEAKS", "/home/blah/ii")])]
    fn deserialize_updater_config() -> anyhow::Result<()> {
        let result: UpdaterConfig = r#"
            repo_path = "$DOTS"
            auto_refresh_seconds = 120
            installer_mode = "files-only"
            use_pty = false
            keep_tweaks = true
            tweaks_dir = "$TWEAKS"
            tweaks_mirror = "dots/ii"

            [installer]
            script = "install.sh"
            interpreters = ["bash"]
            final_input = ""
            sensitive_paths = ["pkgs"]
        "#
        .parse()?;

        let expect = UpdaterConfig {
            repo_path: ConfigPath::new("/home/blah/dots"),
            auto_refresh_seconds: 120,
            installer_mode: InstallerMode::FilesOnly,
            use_pty: false,
            keep_tweaks: true,
            tweaks_dir: ConfigPath::new("/home/blah/ii"),
            tweaks_mirror: "dots/ii".into(),
            installer: InstallerSettings {
                script: PathBuf::from("install.sh"),
                interpreters: vec!["bash".into()],
                auto_inputs: Vec::new(),
                final_input: String::new(),
                sensitive_paths: vec!["pkgs".into()],
            },
            ..UpdaterConfig::default()
        };

        assert_eq!(result, expect);
        assert_eq!(result.installer.final_input(), None);
        assert_eq!(result.installer_path(), PathBuf::from("/home/blah/dots/install.sh"));

        Ok(())
    }

    #[sealed_test(env = [("HOME", "/home/blah")])]
    fn empty_config_takes_defaults() -> anyhow::Result<()> {
        let result: UpdaterConfig = "".parse()?;

        assert_eq!(result.repo_path, ConfigPath::default());
        assert_eq!(result.installer_mode, InstallerMode::Auto);
        assert_eq!(result.auto_refresh_seconds, 60);
        assert_eq!(result.tweaks_dir, ConfigPath::new("/home/blah/.config/quickshell/ii"));
        assert_eq!(result.installer.final_input(), Some("yesforall\n"));
        assert_eq!(result.post_script_path, None);

        Ok(())
    }

    #[test]
    fn blank_post_script_is_dropped() -> anyhow::Result<()> {
        let result: UpdaterConfig = r#"post_script_path = """#.parse()?;
        assert_eq!(result.post_script_path, None);

        Ok(())
    }

    #[test]
    fn reject_unknown_installer_mode() {
        let result = "installer_mode = \"sometimes\"".parse::<UpdaterConfig>();
        assert!(matches!(result, Err(ConfigError::Deserialize(_))));
    }

    #[test]
    fn serialize_updater_config() -> anyhow::Result<()> {
        let config = UpdaterConfig {
            repo_path: ConfigPath::new("/home/blah/dots"),
            installer_mode: InstallerMode::Full,
            tweaks_dir: ConfigPath::new("/home/blah/ii"),
            post_script_path: Some(ConfigPath::new("/home/blah/post.sh")),
            ..UpdaterConfig::default()
        };
        let text = config.to_string();

        assert!(text.contains("installer_mode = \"full\""));
        assert!(text.contains("[installer]"));
        assert_eq!(text.parse::<UpdaterConfig>()?, config);

        Ok(())
    }
}
