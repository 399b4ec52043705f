// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Tweak preservation.
//!
//! The installer happily overwrites files that the user tuned by hand. To
//! keep those tweaks around, the tweaks directory is snapshotted into a
//! compressed archive right before the installer runs. Afterwards, every
//! archived file is compared against whatever the installer left behind,
//! and the user decides file by file which version survives.
//!
//! Restoring is a sequence of independent file operations, not a
//! transaction. A failure on one file is counted and reported, and the
//! remaining files are still processed.

use crate::sink::FileDecision;

use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use similar::TextDiff;
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    fs::{self, File},
    io,
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

/// Prefix of archive names and extraction directories.
pub const ARCHIVE_PREFIX: &str = "updots-tweaks-";

/// Suffix of the rollback copy saved before a restore overwrites a file.
pub const ROLLBACK_SUFFIX: &str = ".tweaks.bak";

/// Maximum number of diff lines handed to the decision prompt.
pub const DIFF_PREVIEW_LINES: usize = 200;

/// Decision maker consulted while restoring tweaks.
pub trait RestorePrompt {
    /// Ask once whether every differing file should be restored without
    /// further questions.
    fn bulk_restore(&self, files: usize) -> bool;

    /// Ask which version of a differing file to keep. Returning `None`
    /// means no decision could be made, and the file is skipped.
    fn decide(&self, path: &Path, diff: &str) -> Option<FileDecision>;
}

/// Handle to a snapshot archive of the tweaks directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TweaksBackup {
    /// Path to compressed archive.
    pub archive: PathBuf,

    /// Number of files archived.
    pub files: usize,
}

/// Tally of a restore pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RestoreSummary {
    pub restored: usize,
    pub kept: usize,
    pub skipped: usize,

    /// Per-file failures, already counted as skipped.
    pub failures: Vec<String>,
}

impl Display for RestoreSummary {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        write!(
            fmt,
            "[keep-tweaks] Restored {}, kept {}, skipped {}.",
            self.restored, self.kept, self.skipped
        )
    }
}

/// Snapshot and restore the tweaks directory.
#[derive(Debug, Clone)]
pub struct TweaksManager {
    target: PathBuf,
    scratch: PathBuf,
    bulk_threshold: usize,
    backup: Option<TweaksBackup>,
}

impl TweaksManager {
    /// Construct new tweaks manager.
    ///
    /// Archives and extraction directories are placed in `scratch`.
    pub fn new(target: impl Into<PathBuf>, scratch: impl Into<PathBuf>, bulk_threshold: usize) -> Self {
        Self {
            target: target.into(),
            scratch: scratch.into(),
            bulk_threshold,
            backup: None,
        }
    }

    /// Directory being preserved.
    pub fn target(&self) -> &Path {
        self.target.as_path()
    }

    /// Backup taken in this cycle, if any.
    pub fn current_backup(&self) -> Option<&TweaksBackup> {
        self.backup.as_ref()
    }

    /// Archive full contents of tweaks directory.
    ///
    /// Does nothing if the directory does not exist, or a backup was
    /// already taken in this cycle. In the latter case the existing backup
    /// is returned.
    ///
    /// # Errors
    ///
    /// - Return [`TweaksError::Walk`] if directory could not be traversed.
    /// - Return [`TweaksError::Archive`] if archive could not be written.
    #[instrument(skip(self), level = "debug")]
    pub fn backup(&mut self) -> Result<Option<TweaksBackup>> {
        if let Some(backup) = &self.backup {
            return Ok(Some(backup.clone()));
        }

        if !self.target.is_dir() {
            debug!("no tweaks directory at {}", self.target.display());
            return Ok(None);
        }

        let prefix = format!("{ARCHIVE_PREFIX}{}-", chrono::Utc::now().timestamp());
        let (archive, files) = stage_archive(&self.scratch, &prefix, |file, archive| {
            write_archive(&self.target, file, archive)
        })?;
        info!("archived {files} tweak file(s) to {}", archive.display());

        let backup = TweaksBackup { archive, files };
        self.backup = Some(backup.clone());
        Ok(Some(backup))
    }

    /// Walk archived files, and restore the ones the prompt asks for.
    ///
    /// Returns `None` if no backup was taken in this cycle. The backup is
    /// consumed either way, and its archive removed.
    ///
    /// # Errors
    ///
    /// - Return [`TweaksError::Extract`] if archive could not be unpacked.
    /// - Return [`TweaksError::Walk`] if extracted files could not be listed.
    #[instrument(skip(self, prompt), level = "debug")]
    pub fn restore(&mut self, prompt: &dyn RestorePrompt) -> Result<Option<RestoreSummary>> {
        let Some(backup) = self.backup.take() else {
            return Ok(None);
        };

        let result = self.restore_from(&backup, prompt);
        remove_archive(&backup.archive);
        result.map(Some)
    }

    /// Drop backup of this cycle without restoring anything.
    pub fn discard(&mut self) {
        if let Some(backup) = self.backup.take() {
            remove_archive(&backup.archive);
        }
    }

    fn restore_from(&self, backup: &TweaksBackup, prompt: &dyn RestorePrompt) -> Result<RestoreSummary> {
        let workdir = tempfile::Builder::new()
            .prefix(ARCHIVE_PREFIX)
            .tempdir_in(&self.scratch)
            .map_err(|source| TweaksError::Extract {
                path: backup.archive.clone(),
                source,
            })?;
        extract_archive(&backup.archive, workdir.path())?;

        let mut archived = Vec::new();
        for entry in WalkDir::new(workdir.path()).sort_by_file_name() {
            let entry = entry?;
            if entry.file_type().is_file() {
                let relative = entry
                    .path()
                    .strip_prefix(workdir.path())
                    .unwrap_or(entry.path())
                    .to_path_buf();
                archived.push((relative, entry.into_path()));
            }
        }

        let mut summary = RestoreSummary::default();
        if archived.is_empty() {
            return Ok(summary);
        }

        let bulk = archived.len() > self.bulk_threshold && prompt.bulk_restore(archived.len());
        for (relative, archived_path) in &archived {
            let current_path = self.target.join(relative);
            let old = match fs::read(archived_path) {
                Ok(bytes) => bytes,
                Err(error) => {
                    summary.skipped += 1;
                    summary.failures.push(format!("{}: {error}", relative.display()));
                    continue;
                }
            };

            let current = match fs::read(&current_path) {
                Ok(bytes) => Some(bytes),
                Err(error) if error.kind() == io::ErrorKind::NotFound => None,
                Err(error) => {
                    summary.skipped += 1;
                    summary.failures.push(format!("{}: {error}", relative.display()));
                    continue;
                }
            };

            if current.as_deref() == Some(old.as_slice()) {
                summary.kept += 1;
                continue;
            }

            let decision = if bulk {
                Some(FileDecision::Restore)
            } else {
                let diff = diff_preview(current.as_deref().unwrap_or_default(), &old);
                prompt.decide(relative, &diff)
            };

            match decision {
                Some(FileDecision::Restore) => {
                    match restore_file(archived_path, &current_path, current.is_some()) {
                        Ok(()) => summary.restored += 1,
                        Err(error) => {
                            warn!("cannot restore {}: {error}", relative.display());
                            summary.skipped += 1;
                            summary.failures.push(format!("{}: {error}", relative.display()));
                        }
                    }
                }
                Some(FileDecision::KeepNew) => summary.kept += 1,
                None => summary.skipped += 1,
            }
        }

        info!("{summary}");
        Ok(summary)
    }
}

/// Unified diff from the installed file to the archived one, cut down to
/// [`DIFF_PREVIEW_LINES`] lines.
pub fn diff_preview(current: &[u8], archived: &[u8]) -> String {
    let current = String::from_utf8_lossy(current);
    let archived = String::from_utf8_lossy(archived);
    let diff = TextDiff::from_lines(current.as_ref(), archived.as_ref());
    let text = diff
        .unified_diff()
        .context_radius(3)
        .header("updated", "backup")
        .to_string();

    let preview = text
        .lines()
        .take(DIFF_PREVIEW_LINES)
        .collect::<Vec<_>>()
        .join("\n");

    if preview.is_empty() {
        "Files differ".into()
    } else {
        preview
    }
}

/// Create a fresh archive file in `scratch`, and fill it through `write`.
///
/// The file is created exclusively under an unpredictable name. It is only
/// kept if `write` succeeds, otherwise it is removed again.
fn stage_archive<F>(scratch: &Path, prefix: &str, write: F) -> Result<(PathBuf, usize)>
where
    F: FnOnce(&mut File, &Path) -> Result<usize>,
{
    let mut staged = tempfile::Builder::new()
        .prefix(prefix)
        .suffix(".tar.gz")
        .tempfile_in(scratch)
        .map_err(|source| TweaksError::Archive {
            path: scratch.to_path_buf(),
            source,
        })?;
    let path = staged.path().to_path_buf();
    let files = write(staged.as_file_mut(), &path)?;

    let (_, archive) = staged.keep().map_err(|error| TweaksError::Archive {
        path,
        source: error.error,
    })?;

    Ok((archive, files))
}

fn write_archive(source: &Path, file: &mut File, archive: &Path) -> Result<usize> {
    let archive_error = |source: io::Error| TweaksError::Archive {
        path: archive.to_path_buf(),
        source,
    };

    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));

    let mut files = 0;
    for entry in WalkDir::new(source).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let relative = entry.path().strip_prefix(source).unwrap_or(entry.path());
        builder
            .append_path_with_name(entry.path(), relative)
            .map_err(archive_error)?;
        files += 1;
    }

    builder
        .into_inner()
        .and_then(|encoder| encoder.finish())
        .map_err(archive_error)?;

    Ok(files)
}

fn extract_archive(archive: &Path, destination: &Path) -> Result<()> {
    let extract_error = |source: io::Error| TweaksError::Extract {
        path: archive.to_path_buf(),
        source,
    };

    let file = File::open(archive).map_err(extract_error)?;
    tar::Archive::new(GzDecoder::new(file))
        .unpack(destination)
        .map_err(extract_error)
}

fn restore_file(archived: &Path, current: &Path, exists: bool) -> io::Result<()> {
    if exists {
        let mut rollback = current.as_os_str().to_owned();
        rollback.push(ROLLBACK_SUFFIX);
        if let Err(error) = fs::copy(current, PathBuf::from(rollback)) {
            warn!("cannot save rollback copy of {}: {error}", current.display());
        }
    }

    if let Some(parent) = current.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(archived, current)?;

    Ok(())
}

fn remove_archive(archive: &Path) {
    if let Err(error) = fs::remove_file(archive) {
        debug!("cannot remove {}: {error}", archive.display());
    }
}

/// Tweak preservation error types.
#[derive(Debug, thiserror::Error)]
pub enum TweaksError {
    /// Failed to write snapshot archive.
    #[error("failed to write tweaks archive {path:?}")]
    Archive {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to unpack snapshot archive.
    #[error("failed to extract tweaks archive {path:?}")]
    Extract {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to traverse directory.
    #[error(transparent)]
    Walk(#[from] walkdir::Error),
}

/// Friendly result alias :3
pub type Result<T, E = TweaksError> = std::result::Result<T, E>;
