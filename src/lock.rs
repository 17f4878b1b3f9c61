// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Process-wide operation lock.
//!
//! Only one dotswitch invocation may operate on a data directory at a time.
//! The lock is an exclusive advisory lock on a marker file. Acquisition never
//! blocks: a second invocation fails right away instead of waiting.

use fs2::FileExt;
use std::{
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
};
use tracing::debug;

/// Held operation lock.
///
/// Released when dropped. The operating system also releases it when the
/// process dies, so an interrupted run never leaves a stale lock behind.
#[derive(Debug)]
pub struct OperationLock {
    file: File,
    path: PathBuf,
}

impl OperationLock {
    /// Acquire lock at path without blocking.
    ///
    /// # Errors
    ///
    /// - Return [`LockError::Locked`] if another holder owns the lock.
    /// - Return [`LockError::Open`] if the marker file cannot be opened.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| LockError::Open {
                source,
                path: path.clone(),
            })?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|source| LockError::Open {
                source,
                path: path.clone(),
            })?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                debug!("acquired operation lock {:?}", path.display());
                Ok(Self { file, path })
            }
            Err(error) if error.kind() == fs2::lock_contended_error().kind() => {
                Err(LockError::Locked { path })
            }
            Err(source) => Err(LockError::Open { source, path }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for OperationLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        debug!("released operation lock {:?}", self.path.display());
    }
}

/// Operation lock error types.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// Lock is held by another invocation.
    #[error("{:?} is locked, is another dotswitch process running?", path.display())]
    Locked { path: PathBuf },

    #[error("failed to open lock file {:?}", path.display())]
    Open {
        #[source]
        source: io::Error,
        path: PathBuf,
    },
}

/// Friendly result alias :3
type Result<T, E = LockError> = std::result::Result<T, E>;
