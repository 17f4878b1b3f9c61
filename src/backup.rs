// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Safety snapshots of local files.
//!
//! Before a deploy overwrites existing local files, their current content is
//! copied into a timestamped backup directory. Only the newest
//! [`MAX_BACKUPS`] snapshots are kept.

use crate::sync::atomic::write_atomic;

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument, warn};

/// Number of snapshots kept by rotation.
pub const MAX_BACKUPS: usize = 5;

const MANIFEST_NAME: &str = "manifest.json";

/// One snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct BackupRecord {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub note: String,
    pub files: Vec<BackupFile>,
}

/// One copied file of a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct BackupFile {
    /// Where the file lived, and is restored to.
    pub original: PathBuf,

    /// Copy relative to snapshot directory.
    pub stored: PathBuf,
}

/// Creates, lists, and restores snapshots under a directory.
#[derive(Debug, Clone)]
pub struct BackupManager {
    root: PathBuf,
}

impl BackupManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Snapshot every existing regular file of paths.
    ///
    /// Return `None` when none of the paths exist, nothing is created then.
    ///
    /// # Errors
    ///
    /// - Return [`BackupError::Copy`] if a file cannot be copied.
    /// - Return [`BackupError::Write`] if snapshot directory or manifest
    ///   cannot be written.
    #[instrument(skip(self, paths), level = "debug")]
    pub fn create(&self, paths: &[PathBuf], note: &str) -> Result<Option<BackupRecord>> {
        let existing: Vec<&PathBuf> = paths.iter().filter(|path| path.is_file()).collect();
        if existing.is_empty() {
            debug!("nothing to back up");
            return Ok(None);
        }

        let id = self.unique_id(note);
        let dir = self.root.join(&id);
        let record = self.fill(&dir, &id, note, &existing).inspect_err(|_| {
            let _ = fs::remove_dir_all(&dir);
        })?;

        info!("backed up {} files into {id:?}", record.files.len());
        self.rotate()?;

        Ok(Some(record))
    }

    /// All snapshots, newest first.
    ///
    /// Directories without a readable manifest are skipped.
    ///
    /// # Errors
    ///
    /// - Return [`BackupError::Read`] if backup directory cannot be read.
    pub fn list(&self) -> Result<Vec<BackupRecord>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(BackupError::Read {
                    source,
                    path: self.root.clone(),
                })
            }
        };

        let mut records = Vec::new();
        for entry in entries.flatten() {
            let manifest = entry.path().join(MANIFEST_NAME);
            match read_manifest(&manifest) {
                Ok(record) => records.push(record),
                Err(error) => warn!("skip backup {:?}: {error}", entry.path().display()),
            }
        }
        records.sort_by(|a, b| (b.created_at, &b.id).cmp(&(a.created_at, &a.id)));

        Ok(records)
    }

    /// Copy every file of snapshot back to where it came from.
    ///
    /// # Errors
    ///
    /// - Return [`BackupError::NotFound`] if no snapshot has id.
    /// - Return [`BackupError::Read`] if a stored copy cannot be read.
    /// - Return [`BackupError::Write`] if a file cannot be restored.
    #[instrument(skip(self), level = "debug")]
    pub fn restore(&self, id: &str) -> Result<Vec<PathBuf>> {
        let dir = self.root.join(id);
        if id.is_empty() || id.contains(['/', '\\']) || !dir.is_dir() {
            return Err(BackupError::NotFound(id.into()));
        }

        let record = read_manifest(dir.join(MANIFEST_NAME))?;
        let mut restored = Vec::new();
        for file in record.files {
            let stored = dir.join(&file.stored);
            let data = fs::read(&stored).map_err(|source| BackupError::Read {
                source,
                path: stored.clone(),
            })?;
            write_atomic(&file.original, &data).map_err(|source| BackupError::Write {
                source,
                path: file.original.clone(),
            })?;
            restored.push(file.original);
        }

        info!("restored {} files from {id:?}", restored.len());
        Ok(restored)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn unique_id(&self, note: &str) -> String {
        let note: String = note
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { '_' })
            .collect();
        let base = format!("{}_{note}", Local::now().format("%Y%m%d_%H%M%S"));

        let mut id = base.clone();
        let mut counter = 1;
        while self.root.join(&id).exists() {
            counter += 1;
            id = format!("{base}_{counter}");
        }

        id
    }

    fn fill(&self, dir: &Path, id: &str, note: &str, paths: &[&PathBuf]) -> Result<BackupRecord> {
        let files_dir = dir.join("files");
        fs::create_dir_all(&files_dir).map_err(|source| BackupError::Write {
            source,
            path: files_dir.clone(),
        })?;

        let mut record = BackupRecord {
            id: id.into(),
            created_at: Utc::now(),
            note: note.into(),
            files: Vec::new(),
        };

        for (index, path) in paths.iter().enumerate() {
            let stored = PathBuf::from("files").join(index.to_string());
            fs::copy(path, dir.join(&stored)).map_err(|source| BackupError::Copy {
                source,
                path: path.to_path_buf(),
            })?;
            record.files.push(BackupFile {
                original: path.to_path_buf(),
                stored,
            });
        }

        let manifest = dir.join(MANIFEST_NAME);
        let data = serde_json::to_vec_pretty(&record)?;
        write_atomic(&manifest, &data).map_err(|source| BackupError::Write {
            source,
            path: manifest,
        })?;

        Ok(record)
    }

    fn rotate(&self) -> Result<()> {
        for stale in self.list()?.into_iter().skip(MAX_BACKUPS) {
            let dir = self.root.join(&stale.id);
            debug!("rotate out backup {:?}", stale.id);
            fs::remove_dir_all(&dir).map_err(|source| BackupError::Write { source, path: dir })?;
        }

        Ok(())
    }
}

fn read_manifest(path: impl AsRef<Path>) -> Result<BackupRecord> {
    let path = path.as_ref();
    let data = fs::read(path).map_err(|source| BackupError::Read {
        source,
        path: path.to_path_buf(),
    })?;

    serde_json::from_slice(&data).map_err(|source| BackupError::Corrupt {
        source,
        path: path.to_path_buf(),
    })
}

/// Backup error types.
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("backup {0:?} not found")]
    NotFound(String),

    #[error("failed to back up {:?}", path.display())]
    Copy {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    #[error("failed to read {:?}", path.display())]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    #[error("failed to write {:?}", path.display())]
    Write {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    #[error("backup manifest {:?} is corrupt", path.display())]
    Corrupt {
        #[source]
        source: serde_json::Error,
        path: PathBuf,
    },

    #[error(transparent)]
    Serialize(#[from] serde_json::Error),
}

/// Friendly result alias :3
type Result<T, E = BackupError> = std::result::Result<T, E>;
