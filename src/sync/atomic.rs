// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Atomic file writes.
//!
//! Content is written to a hidden temporary sibling, flushed, and renamed over
//! the destination. The destination is either fully replaced or left exactly
//! as it was, so an interrupted run never exposes a half-written file.

use std::{
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

/// Write content atomically to path.
///
/// Creates missing parent directories. Permissions of an existing
/// destination are carried over to the replacement.
///
/// # Errors
///
/// - Return [`io::Error`] if any step fails. The temporary file is removed on
///   failure.
pub fn write_atomic(path: impl AsRef<Path>, content: &[u8]) -> io::Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let temp_path = temp_sibling(path)?;
    let result = write_then_rename(path, &temp_path, content);
    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }

    result
}

fn write_then_rename(path: &Path, temp_path: &Path, content: &[u8]) -> io::Result<()> {
    let mut temp_file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(temp_path)?;
    temp_file.write_all(content)?;
    temp_file.sync_all()?;

    // INVARIANT: Keep mode of file being replaced, e.g., 0600 ssh configs.
    if let Ok(metadata) = fs::metadata(path) {
        if metadata.is_file() {
            temp_file.set_permissions(metadata.permissions())?;
        }
    }
    drop(temp_file);

    fs::rename(temp_path, path)
}

fn temp_sibling(path: &Path) -> io::Result<PathBuf> {
    let name = path.file_name().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{:?} has no file name", path.display()),
        )
    })?;

    Ok(path.with_file_name(format!(
        ".{}.{}.dotswitch-tmp",
        name.to_string_lossy(),
        std::process::id()
    )))
}
