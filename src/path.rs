// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Path resolution utilities.
//!
//! Determine relevent path information for external files that need to be
//! interacted with, or managed in some way.

use std::{
    ffi::OsStr,
    path::{Component, Path, PathBuf},
};

/// Determine absolute path to user's home directory.
///
/// Does not check if the path returned actually exists.
///
/// # Errors
///
/// - Return [`NoWayHome`] if home directory path cannot be determined.
pub fn home_dir() -> Result<PathBuf> {
    dirs::home_dir().ok_or(NoWayHome)
}

/// Determine default absolute path to the dotswitch data directory.
///
/// Uses XDG Base Directory path `$XDG_DATA_HOME/dotswitch` as the default
/// absolute path. Does not check if the path returned actually exists.
///
/// # Errors
///
/// - Return [`NoWayHome`] if home directory path cannot be determined.
///
/// # See Also
///
/// - [XDG Base Directory](https://wiki.archlinux.org/title/XDG_Base_Directory)
pub fn default_data_dir() -> Result<PathBuf> {
    dirs::data_dir()
        .map(|path| path.join("dotswitch"))
        .ok_or(NoWayHome)
}

/// Stable identity of a local file.
///
/// Canonicalizes the path when it exists. When it does not exist yet, the
/// parent directory is canonicalized instead and the file name appended, so a
/// file keeps the same identity before and after it is first deployed.
pub fn file_identity(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }

    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => parent
            .canonicalize()
            .map(|parent| parent.join(name))
            .unwrap_or_else(|_| path.to_path_buf()),
        _ => path.to_path_buf(),
    }
}

/// Check that path is relative and never climbs out of its base directory.
pub fn is_contained_relative(path: impl AsRef<Path>) -> bool {
    let mut components = path.as_ref().components().peekable();
    if components.peek().is_none() {
        return false;
    }

    components.all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
}

/// Append `.old` to the file name of a path.
pub fn with_old_suffix(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    let mut name = path
        .file_name()
        .map(OsStr::to_os_string)
        .unwrap_or_default();
    name.push(".old");
    path.with_file_name(name)
}

// Thanks from:
//
// https://github.com/rust-lang/git2-rs/blob/5bc3baa9694a94db2ca9cc256b5bce8a215f9013/
// src/util.rs#L85
#[cfg(unix)]
pub(crate) fn bytes_to_path(bytes: &[u8]) -> PathBuf {
    use std::os::unix::prelude::*;
    Path::new(OsStr::from_bytes(bytes)).to_path_buf()
}
#[cfg(windows)]
pub(crate) fn bytes_to_path(bytes: &[u8]) -> PathBuf {
    PathBuf::from(String::from_utf8_lossy(bytes).into_owned())
}

/// No way to determine user's home directory.
///
/// # See Also
///
/// - [`dirs::home_dir`](https://docs.rs/dirs/latest/dirs/fn.home_dir.html)
#[derive(Clone, Debug, thiserror::Error)]
#[error("cannot determine absolute path to user's home directory")]
pub struct NoWayHome;

/// Friendly result alias :3
pub type Result<T, E = NoWayHome> = std::result::Result<T, E>;
