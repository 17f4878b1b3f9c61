// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Merge conflict classification and resolution.
//!
//! A pull that cannot merge cleanly leaves conflicted paths in the index. Each
//! one is classified from which of its three stages exist, then resolved by
//! keeping one side or by editing the file by hand. A resolution only counts
//! once the file is free of conflict markers.

use crate::{
    hook::{open_editor, HookError},
    sync::atomic::write_atomic,
    vcs::{ConflictSide, ConflictedPath, VcsError, VersionControl},
};

use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    fs, io,
    path::{Path, PathBuf},
};
use tracing::{info, instrument};

/// Shape of a conflict, from stage presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    BothModified,
    BothAdded,
    DeletedByLocal,
    DeletedByRemote,
}

impl ConflictKind {
    /// Classify conflicted path, `None` for stage combinations no merge produces.
    pub fn classify(path: &ConflictedPath) -> Option<Self> {
        match (path.ancestor, path.local, path.remote) {
            (true, true, true) => Some(Self::BothModified),
            (false, true, true) => Some(Self::BothAdded),
            (true, false, true) => Some(Self::DeletedByLocal),
            (true, true, false) => Some(Self::DeletedByRemote),
            _ => None,
        }
    }
}

impl Display for ConflictKind {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        let label = match self {
            Self::BothModified => "both modified",
            Self::BothAdded => "both added",
            Self::DeletedByLocal => "deleted locally",
            Self::DeletedByRemote => "deleted remotely",
        };
        fmt.write_str(label)
    }
}

/// Classified conflicted path, relative to the working tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub path: PathBuf,
    pub kind: ConflictKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    KeepLocal,
    KeepRemote,
    Edit { editor: String },
}

/// Resolves conflicts left in a repository.
#[derive(Debug)]
pub struct ConflictResolver<'vcs, V>
where
    V: VersionControl,
{
    vcs: &'vcs V,
}

impl<'vcs, V> ConflictResolver<'vcs, V>
where
    V: VersionControl,
{
    pub fn new(vcs: &'vcs V) -> Self {
        Self { vcs }
    }

    /// Classified conflicts of repository.
    ///
    /// # Errors
    ///
    /// - Return [`ConflictError::Vcs`] if conflicts cannot be listed.
    /// - Return [`ConflictError::Unclassifiable`] for an impossible stage set.
    pub fn conflicts(&self) -> Result<Vec<Conflict>> {
        self.vcs
            .conflicted_paths()?
            .into_iter()
            .map(|path| match ConflictKind::classify(&path) {
                Some(kind) => Ok(Conflict {
                    path: path.path,
                    kind,
                }),
                None => Err(ConflictError::Unclassifiable(path.path)),
            })
            .collect()
    }

    /// Apply resolution to one conflict and mark it resolved.
    ///
    /// Keeping a side that deleted the file deletes it.
    ///
    /// # Errors
    ///
    /// - Return [`ConflictError::ResidualMarkers`] if file still has markers,
    ///   the conflict stays unresolved then.
    /// - Return [`ConflictError::Hook`] if editor fails.
    /// - Return [`ConflictError::Vcs`] if index cannot be updated.
    #[instrument(skip(self, conflict), fields(path = ?conflict.path), level = "debug")]
    pub fn resolve(&self, conflict: &Conflict, resolution: &Resolution) -> Result<()> {
        let full = self.vcs.work_dir().join(&conflict.path);
        match resolution {
            Resolution::KeepLocal => self.take_side(&full, &conflict.path, ConflictSide::Local)?,
            Resolution::KeepRemote => self.take_side(&full, &conflict.path, ConflictSide::Remote)?,
            Resolution::Edit { editor } => open_editor(editor, &full)?,
        }

        if full.exists() {
            let data = fs::read(&full).map_err(|source| ConflictError::Read {
                source,
                path: full.clone(),
            })?;
            let lines = find_conflict_markers(&data);
            if !lines.is_empty() {
                return Err(ConflictError::ResidualMarkers {
                    path: conflict.path.clone(),
                    lines,
                });
            }
        }

        self.vcs.mark_resolved(&conflict.path)?;
        info!("resolved {:?} ({})", conflict.path.display(), conflict.kind);

        Ok(())
    }

    fn take_side(&self, full: &Path, relative: &Path, side: ConflictSide) -> Result<()> {
        match self.vcs.conflict_side(relative, side)? {
            Some(data) => write_atomic(full, &data).map_err(|source| ConflictError::Write {
                source,
                path: full.to_path_buf(),
            }),
            None => match fs::remove_file(full) {
                Ok(()) => Ok(()),
                Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(source) => Err(ConflictError::Write {
                    source,
                    path: full.to_path_buf(),
                }),
            },
        }
    }
}

/// 1-based line numbers that start with a conflict marker.
pub fn find_conflict_markers(content: &[u8]) -> Vec<usize> {
    content
        .split(|byte| *byte == b'\n')
        .enumerate()
        .filter(|(_, line)| is_marker(line))
        .map(|(index, _)| index + 1)
        .collect()
}

fn is_marker(line: &[u8]) -> bool {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    line.starts_with(b"<<<<<<<") || line.starts_with(b">>>>>>>") || line == b"======="
}

#[derive(Debug, thiserror::Error)]
pub enum ConflictError {
    #[error("{:?} still has conflict markers on lines {lines:?}", path.display())]
    ResidualMarkers { path: PathBuf, lines: Vec<usize> },

    #[error("cannot classify conflict of {:?}", .0.display())]
    Unclassifiable(PathBuf),

    #[error("failed to read {:?}", path.display())]
    Read {
        #[source]
        source: io::Error,
        path: PathBuf,
    },

    #[error("failed to write {:?}", path.display())]
    Write {
        #[source]
        source: io::Error,
        path: PathBuf,
    },

    #[error(transparent)]
    Hook(#[from] HookError),

    #[error(transparent)]
    Vcs(#[from] VcsError),
}

/// Friendly result alias :3
type Result<T, E = ConflictError> = std::result::Result<T, E>;
