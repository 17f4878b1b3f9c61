// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Change detection between local files and their repository mirror.
//!
//! A section either tracks a single file or a whole directory. Comparing a
//! section yields one [`ChangeRecord`] per file pair, lazily, recomputed from
//! scratch on every call. Equality always reads both files in full, because
//! checkouts reset timestamps without touching content.

pub mod filter;

use crate::{config::TrackedSection, diff::filter::SectionFilter};

use ignore::{Walk, WalkBuilder};
use similar::{ChangeTag, TextDiff};
use std::{
    collections::{BTreeSet, VecDeque},
    fs,
    io,
    path::{Path, PathBuf},
};

/// Classification of one file pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    /// Exists locally only.
    New,

    /// Exists on both sides with different bytes.
    Modified,

    /// Exists in repository only.
    Deleted,

    /// Byte-for-byte equal on both sides.
    Identical,
}

/// Inserted and deleted line counts of a modified text file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LineDelta {
    pub inserted: usize,
    pub deleted: usize,
}

/// Comparison result for one file pair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeRecord {
    pub kind: ChangeKind,
    pub local_path: PathBuf,
    pub repo_path: PathBuf,
    pub line_delta: Option<LineDelta>,
}

impl ChangeRecord {
    /// Check if repository copy needs to be written or removed on save.
    pub fn needs_save(&self) -> bool {
        !matches!(self.kind, ChangeKind::Identical)
    }
}

/// Compares sections against repository mirror.
#[derive(Clone, Debug)]
pub struct ChangeDetector {
    repo_root: PathBuf,
}

impl ChangeDetector {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
        }
    }

    /// Absolute repository location of a section.
    pub fn repo_location(&self, section: &TrackedSection) -> PathBuf {
        self.repo_root.join(&section.repo_path)
    }

    /// Compare section against its repository mirror.
    ///
    /// # Errors
    ///
    /// - Return [`DiffError::Filter`] if section filter rules do not compile.
    pub fn compare(&self, section: &TrackedSection) -> Result<Changes> {
        let filter = SectionFilter::new(&section.local_path, &section.include, &section.exclude)
            .map_err(|source| DiffError::Filter {
                section: section.name.clone(),
                source,
            })?;
        let local = section.local_path.clone();
        let repo = self.repo_location(section);

        // INVARIANT: Directory section if either side is a directory.
        let state = if local.is_dir() || (!local.exists() && repo.is_dir()) {
            ChangesState::LocalWalk(walker(&local))
        } else {
            let mut single = VecDeque::new();
            single.push_back((local.clone(), repo.clone()));
            ChangesState::Single(single)
        };

        Ok(Changes {
            local,
            repo,
            filter,
            seen: BTreeSet::new(),
            state,
        })
    }
}

/// Lazy sequence of change records of one section.
pub struct Changes {
    local: PathBuf,
    repo: PathBuf,
    filter: SectionFilter,
    seen: BTreeSet<PathBuf>,
    state: ChangesState,
}

enum ChangesState {
    Single(VecDeque<(PathBuf, PathBuf)>),
    LocalWalk(Option<Walk>),
    RepoWalk(Option<Walk>),
    Finished,
}

impl Iterator for Changes {
    type Item = Result<ChangeRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match &mut self.state {
                ChangesState::Single(pairs) => match pairs.pop_front() {
                    Some((local, repo)) => {
                        if let Some(record) = classify(local, repo).transpose() {
                            return Some(record);
                        }
                    }
                    None => self.state = ChangesState::Finished,
                },
                ChangesState::LocalWalk(walk) => match next_file(walk, &self.local) {
                    Some(Ok(relative)) => {
                        if !self.filter.allows(&relative) {
                            continue;
                        }
                        self.seen.insert(relative.clone());
                        let local = self.local.join(&relative);
                        let repo = self.repo.join(&relative);
                        if let Some(record) = classify(local, repo).transpose() {
                            return Some(record);
                        }
                    }
                    Some(Err(error)) => return Some(Err(error)),
                    None => self.state = ChangesState::RepoWalk(walker(&self.repo)),
                },
                ChangesState::RepoWalk(walk) => match next_file(walk, &self.repo) {
                    Some(Ok(relative)) => {
                        if self.seen.contains(&relative) || !self.filter.allows(&relative) {
                            continue;
                        }
                        return Some(Ok(ChangeRecord {
                            kind: ChangeKind::Deleted,
                            local_path: self.local.join(&relative),
                            repo_path: self.repo.join(&relative),
                            line_delta: None,
                        }));
                    }
                    Some(Err(error)) => return Some(Err(error)),
                    None => self.state = ChangesState::Finished,
                },
                ChangesState::Finished => return None,
            }
        }
    }
}

fn walker(root: &Path) -> Option<Walk> {
    if !root.is_dir() {
        return None;
    }

    // INVARIANT: Track every file, hidden or ignored alike.
    Some(
        WalkBuilder::new(root)
            .standard_filters(false)
            .follow_links(false)
            .sort_by_file_name(|a, b| a.cmp(b))
            .build(),
    )
}

fn next_file(walk: &mut Option<Walk>, root: &Path) -> Option<Result<PathBuf>> {
    let walk = walk.as_mut()?;
    for entry in walk.by_ref() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(source) => {
                return Some(Err(DiffError::Walk {
                    source,
                    root: root.to_path_buf(),
                }))
            }
        };

        if !entry.file_type().is_some_and(|kind| kind.is_file()) {
            continue;
        }

        if let Ok(relative) = entry.path().strip_prefix(root) {
            return Some(Ok(relative.to_path_buf()));
        }
    }

    None
}

fn classify(local: PathBuf, repo: PathBuf) -> Result<Option<ChangeRecord>> {
    let local_data = read_optional(&local)?;
    let repo_data = read_optional(&repo)?;

    let (kind, line_delta) = match (&local_data, &repo_data) {
        (None, None) => return Ok(None),
        (Some(_), None) => (ChangeKind::New, None),
        (None, Some(_)) => (ChangeKind::Deleted, None),
        (Some(local_data), Some(repo_data)) if local_data == repo_data => {
            (ChangeKind::Identical, None)
        }
        (Some(local_data), Some(repo_data)) => {
            (ChangeKind::Modified, line_delta(repo_data, local_data))
        }
    };

    Ok(Some(ChangeRecord {
        kind,
        local_path: local,
        repo_path: repo,
        line_delta,
    }))
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    if !path.is_file() {
        return Ok(None);
    }

    match fs::read(path) {
        Ok(data) => Ok(Some(data)),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(DiffError::Read {
            source,
            path: path.to_path_buf(),
        }),
    }
}

/// Count changed lines between two text contents.
///
/// Return `None` if either side is not valid UTF-8.
pub fn line_delta(old: &[u8], new: &[u8]) -> Option<LineDelta> {
    let old = std::str::from_utf8(old).ok()?;
    let new = std::str::from_utf8(new).ok()?;

    let mut delta = LineDelta::default();
    for change in TextDiff::from_lines(old, new).iter_all_changes() {
        match change.tag() {
            ChangeTag::Insert => delta.inserted += 1,
            ChangeTag::Delete => delta.deleted += 1,
            ChangeTag::Equal => {}
        }
    }

    Some(delta)
}

/// Change detection error types.
#[derive(Debug, thiserror::Error)]
pub enum DiffError {
    #[error("failed to read {:?}", path.display())]
    Read {
        #[source]
        source: io::Error,
        path: PathBuf,
    },

    #[error("failed to walk {:?}", root.display())]
    Walk {
        #[source]
        source: ignore::Error,
        root: PathBuf,
    },

    #[error("section {section:?} has invalid filter rule")]
    Filter {
        section: String,
        #[source]
        source: ignore::Error,
    },
}

impl DiffError {
    /// Path the failure is about.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Read { path, .. } => Some(path),
            Self::Walk { root, .. } => Some(root),
            Self::Filter { .. } => None,
        }
    }
}

/// Friendly result alias :3
type Result<T, E = DiffError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    struct Fixture {
        _dir: tempfile::TempDir,
        home: PathBuf,
        repo: PathBuf,
    }

    impl Fixture {
        fn new() -> anyhow::Result<Self> {
            let dir = tempfile::tempdir()?;
            let home = dir.path().join("home");
            let repo = dir.path().join("repo");
            fs::create_dir_all(&home)?;
            fs::create_dir_all(&repo)?;
            Ok(Self {
                _dir: dir,
                home,
                repo,
            })
        }

        fn section(&self, local: &str, repo: &str) -> TrackedSection {
            TrackedSection {
                name: repo.into(),
                local_path: self.home.join(local),
                repo_path: repo.into(),
                redaction_enabled: true,
                ..Default::default()
            }
        }

        fn kinds(&self, section: &TrackedSection) -> anyhow::Result<Vec<(PathBuf, ChangeKind)>> {
            let detector = ChangeDetector::new(&self.repo);
            let mut kinds = Vec::new();
            for record in detector.compare(section)? {
                let record = record?;
                let relative = record.repo_path.strip_prefix(&self.repo)?.to_path_buf();
                kinds.push((relative, record.kind));
            }
            Ok(kinds)
        }
    }

    #[test]
    fn file_section_classification() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        let section = fixture.section(".bashrc", "bashrc");
        assert_eq!(fixture.kinds(&section)?, vec![]);

        fs::write(fixture.home.join(".bashrc"), "alias ll='ls -l'\n")?;
        assert_eq!(
            fixture.kinds(&section)?,
            vec![("bashrc".into(), ChangeKind::New)]
        );

        fs::write(fixture.repo.join("bashrc"), "alias ll='ls -l'\n")?;
        assert_eq!(
            fixture.kinds(&section)?,
            vec![("bashrc".into(), ChangeKind::Identical)]
        );

        fs::write(fixture.repo.join("bashrc"), "alias ll='ls -l'\r\n")?;
        assert_eq!(
            fixture.kinds(&section)?,
            vec![("bashrc".into(), ChangeKind::Modified)]
        );

        fs::remove_file(fixture.home.join(".bashrc"))?;
        assert_eq!(
            fixture.kinds(&section)?,
            vec![("bashrc".into(), ChangeKind::Deleted)]
        );

        Ok(())
    }

    #[test]
    fn directory_section_detects_every_kind() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        let local = fixture.home.join(".config/nvim");
        let repo = fixture.repo.join("nvim");
        fs::create_dir_all(local.join("lua"))?;
        fs::create_dir_all(repo.join("lua"))?;

        fs::write(local.join("init.lua"), "same")?;
        fs::write(repo.join("init.lua"), "same")?;
        fs::write(local.join("lua/plugins.lua"), "new\nlines\n")?;
        fs::write(repo.join("lua/plugins.lua"), "old\nlines\n")?;
        fs::write(local.join(".hidden"), "fresh")?;
        fs::write(repo.join("lua/removed.lua"), "gone")?;

        let section = fixture.section(".config/nvim", "nvim");
        assert_eq!(
            fixture.kinds(&section)?,
            vec![
                ("nvim/.hidden".into(), ChangeKind::New),
                ("nvim/init.lua".into(), ChangeKind::Identical),
                ("nvim/lua/plugins.lua".into(), ChangeKind::Modified),
                ("nvim/lua/removed.lua".into(), ChangeKind::Deleted),
            ]
        );

        Ok(())
    }

    #[test]
    fn directory_section_respects_filters() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        let local = fixture.home.join(".config/app");
        fs::create_dir_all(local.join("cache"))?;
        fs::write(local.join("app.conf"), "conf")?;
        fs::write(local.join("cache/blob"), "blob")?;

        let mut section = fixture.section(".config/app", "app");
        section.exclude = vec!["cache/".into()];
        assert_eq!(
            fixture.kinds(&section)?,
            vec![("app/app.conf".into(), ChangeKind::New)]
        );

        Ok(())
    }

    #[test]
    fn compare_is_restartable() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        fs::write(fixture.home.join(".vimrc"), "set nu")?;
        let section = fixture.section(".vimrc", "vimrc");
        let detector = ChangeDetector::new(&fixture.repo);

        let first: Vec<_> = detector.compare(&section)?.collect::<Result<_>>()?;
        fs::write(fixture.repo.join("vimrc"), "set nu")?;
        let second: Vec<_> = detector.compare(&section)?.collect::<Result<_>>()?;

        assert_eq!(first[0].kind, ChangeKind::New);
        assert_eq!(second[0].kind, ChangeKind::Identical);
        Ok(())
    }

    #[test]
    fn modified_text_reports_line_delta() {
        let delta = line_delta(b"a\nb\nc\n", b"a\nB\nc\nd\n");
        assert_eq!(
            delta,
            Some(LineDelta {
                inserted: 2,
                deleted: 1
            })
        );
        assert_eq!(line_delta(b"\xff\xfe", b"text"), None);
    }
}
