// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Version control collaborator.
//!
//! Every profile is one branch of a single repository. The engine never talks
//! to git directly, it only sees the [`VersionControl`] trait. [`Git2Vcs`] is
//! the libgit2 implementation used by the binary.
//!
//! # Dirty Trees
//!
//! Leaving a branch with uncommitted changes would silently carry them into
//! another profile. Thus [`VersionControl::checkout`] refuses to run on a
//! dirty working tree, and so does [`VersionControl::pull`].

pub mod remote;

use crate::{path::bytes_to_path, vcs::remote::Transfer};

use git2::{
    build::{CheckoutBuilder, RepoBuilder},
    BranchType, Commit, ErrorCode, FetchOptions, IndexAddOption, IndexEntry, PushOptions,
    Repository, RepositoryInitOptions, Signature, StatusOptions,
};
use indicatif::ProgressBar;
use std::{
    cell::RefCell,
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument, warn};

/// Name of the remote every profile branch is pushed to and pulled from.
pub const REMOTE_NAME: &str = "origin";

/// Layer of indirection for version control access.
pub trait VersionControl {
    /// Root of working tree.
    fn work_dir(&self) -> &Path;

    /// Name of currently checked out branch.
    fn current_branch(&self) -> Result<String>;

    fn branch_exists(&self, name: &str) -> Result<bool>;

    /// Names of every profile branch, local or only on remote, sorted.
    fn branches(&self) -> Result<Vec<String>>;

    /// Delete local branch.
    ///
    /// Without force, only branches fully merged into the current one go.
    fn delete_branch(&self, name: &str, force: bool) -> Result<()>;

    /// Check out branch, creating it from current commit if allowed.
    fn checkout(&self, name: &str, create_if_missing: bool) -> Result<Checkout>;

    /// Stage everything and commit it.
    ///
    /// Return `None` when there was nothing to commit. Completes an in
    /// progress merge if there is one.
    fn commit(&self, message: &str) -> Result<Option<String>>;

    fn is_dirty(&self) -> Result<bool>;

    /// Put working tree paths back to their state at HEAD.
    ///
    /// Paths absent from HEAD are removed.
    fn restore(&self, paths: &[PathBuf]) -> Result<()>;

    /// Paths left conflicted by last merge.
    fn conflicted_paths(&self) -> Result<Vec<ConflictedPath>>;

    /// Content of one side of a conflicted path, `None` if that side deleted it.
    fn conflict_side(&self, path: &Path, side: ConflictSide) -> Result<Option<Vec<u8>>>;

    /// Record working tree state of path as its resolution.
    fn mark_resolved(&self, path: &Path) -> Result<()>;

    /// Content of path at tip of branch, `None` if it does not exist there.
    fn read_file_at(&self, branch: &str, path: &Path) -> Result<Option<Vec<u8>>>;

    /// Push current branch to remote.
    fn push(&self) -> Result<()>;

    /// Fetch current branch from remote and merge it.
    fn pull(&self) -> Result<RemoteOutcome>;
}

/// How a checkout reached its branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkout {
    Existing,
    Created,
}

/// Result of pulling from remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteOutcome {
    UpToDate,
    FastForward,
    Merged,
    Conflict(Vec<ConflictedPath>),
}

/// Which stages a conflicted path has in the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictedPath {
    pub path: PathBuf,
    pub ancestor: bool,
    pub local: bool,
    pub remote: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictSide {
    Ancestor,
    Local,
    Remote,
}

/// Version control through libgit2.
pub struct Git2Vcs {
    repository: Repository,
    work_dir: PathBuf,
    bar: ProgressBar,
}

impl Git2Vcs {
    /// Initialize new repository at path with unborn initial branch.
    ///
    /// # Errors
    ///
    /// - Return [`VcsError::Git2`] if libgit2 operations fail.
    #[instrument(skip(path), level = "debug")]
    pub fn init(path: impl AsRef<Path>, branch: &str) -> Result<Self> {
        info!("initialize repository at {:?}", path.as_ref().display());
        let mut opts = RepositoryInitOptions::new();
        opts.initial_head(branch);
        let repository = Repository::init_opts(path.as_ref(), &opts)?;
        Self::from_repository(repository)
    }

    /// Open existing repository.
    ///
    /// # Errors
    ///
    /// - Return [`VcsError::Git2`] if libgit2 operations fail.
    /// - Return [`VcsError::Bare`] if repository has no working tree.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        debug!("open repository at {:?}", path.as_ref().display());
        Self::from_repository(Repository::open(path.as_ref())?)
    }

    /// Clone remote repository with progress displayed through bar.
    ///
    /// If credentials are required, the user is prompted for them and the
    /// progress bar is suspended meanwhile.
    ///
    /// # Errors
    ///
    /// - Return [`VcsError::Git2`] if libgit2 operations fail.
    /// - Return [`VcsError::IndicatifStyleTemplate`] if bar cannot be styled.
    #[instrument(skip(url, path, bar), level = "debug")]
    pub fn clone(url: impl AsRef<str>, path: impl AsRef<Path>, bar: ProgressBar) -> Result<Self> {
        info!("clone {} into {:?}", url.as_ref(), path.as_ref().display());
        let transfer = Transfer::new(bar.clone(), url.as_ref())?;
        let mut fo = FetchOptions::new();
        fo.remote_callbacks(transfer.callbacks());
        let repository = RepoBuilder::new()
            .fetch_options(fo)
            .clone(url.as_ref(), path.as_ref())?;
        transfer.finish();

        let mut vcs = Self::from_repository(repository)?;
        vcs.bar = bar;
        Ok(vcs)
    }

    /// Use bar to display progress of later pushes and pulls.
    pub fn with_progress(mut self, bar: ProgressBar) -> Self {
        self.bar = bar;
        self
    }

    /// Point remote at url, creating it if needed.
    ///
    /// # Errors
    ///
    /// - Return [`VcsError::Git2`] if libgit2 operations fail.
    pub fn set_remote(&self, url: &str) -> Result<()> {
        match self.repository.find_remote(REMOTE_NAME) {
            Ok(_) => self.repository.remote_set_url(REMOTE_NAME, url)?,
            Err(error) if error.code() == ErrorCode::NotFound => {
                self.repository.remote(REMOTE_NAME, url)?;
            }
            Err(error) => return Err(error.into()),
        }

        Ok(())
    }

    fn from_repository(repository: Repository) -> Result<Self> {
        let work_dir = repository.workdir().ok_or(VcsError::Bare)?.to_path_buf();
        Ok(Self {
            repository,
            work_dir,
            bar: ProgressBar::hidden(),
        })
    }

    fn head_commit(&self) -> Result<Option<Commit<'_>>> {
        match self.repository.head() {
            Ok(head) => Ok(Some(head.peel_to_commit()?)),
            Err(error) if matches!(error.code(), ErrorCode::UnbornBranch | ErrorCode::NotFound) => {
                Ok(None)
            }
            Err(error) => Err(error.into()),
        }
    }

    fn branch_commit(&self, name: &str) -> Result<Option<Commit<'_>>> {
        let local = self.repository.find_branch(name, BranchType::Local);
        let branch = match local {
            Ok(branch) => branch,
            Err(error) if error.code() == ErrorCode::NotFound => {
                match self
                    .repository
                    .find_branch(&format!("{REMOTE_NAME}/{name}"), BranchType::Remote)
                {
                    Ok(branch) => branch,
                    Err(error) if error.code() == ErrorCode::NotFound => return Ok(None),
                    Err(error) => return Err(error.into()),
                }
            }
            Err(error) => return Err(error.into()),
        };

        Ok(Some(branch.get().peel_to_commit()?))
    }

    fn signature(&self) -> Result<Signature<'static>> {
        match self.repository.signature() {
            Ok(signature) => Ok(signature),
            Err(_) => Ok(Signature::now("dotswitch", "dotswitch@localhost")?),
        }
    }

    fn conflict_entries(&self, path: &Path) -> Result<Option<[Option<IndexEntry>; 3]>> {
        let index = self.repository.index()?;
        for conflict in index.conflicts()? {
            let conflict = conflict?;
            let matches = [&conflict.ancestor, &conflict.our, &conflict.their]
                .into_iter()
                .flatten()
                .any(|entry| bytes_to_path(&entry.path) == path);
            if matches {
                return Ok(Some([conflict.ancestor, conflict.our, conflict.their]));
            }
        }

        Ok(None)
    }

    fn fetch(&self, branch: &str) -> Result<()> {
        let mut remote = self.find_remote()?;
        let url = remote.url().unwrap_or(REMOTE_NAME).to_string();
        let transfer = Transfer::new(self.bar.clone(), &url)?;
        let mut fo = FetchOptions::new();
        fo.remote_callbacks(transfer.callbacks());
        let refspec = format!("+refs/heads/{branch}:refs/remotes/{REMOTE_NAME}/{branch}");
        remote.fetch(&[refspec], Some(&mut fo), None)?;
        drop(fo);
        transfer.finish();

        Ok(())
    }

    fn find_remote(&self) -> Result<git2::Remote<'_>> {
        self.repository
            .find_remote(REMOTE_NAME)
            .map_err(|error| match error.code() {
                ErrorCode::NotFound => VcsError::NoRemote(REMOTE_NAME.into()),
                _ => error.into(),
            })
    }
}

impl std::fmt::Debug for Git2Vcs {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("Git2Vcs")
            .field("work_dir", &self.work_dir)
            .finish()
    }
}

impl VersionControl for Git2Vcs {
    fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    fn current_branch(&self) -> Result<String> {
        // INVARIANT: Read HEAD symbolically so unborn branches still have a name.
        let head = self.repository.find_reference("HEAD")?;
        head.symbolic_target()
            .and_then(|target| target.strip_prefix("refs/heads/"))
            .map(ToString::to_string)
            .ok_or(VcsError::DetachedHead)
    }

    fn branch_exists(&self, name: &str) -> Result<bool> {
        Ok(self.branch_commit(name)?.is_some())
    }

    fn branches(&self) -> Result<Vec<String>> {
        let mut names = vec![self.current_branch()?];
        for branch in self.repository.branches(None)? {
            let (branch, kind) = branch?;
            let Some(name) = branch.name()? else {
                continue;
            };

            let name = match kind {
                BranchType::Local => name,
                BranchType::Remote => match name.strip_prefix(&format!("{REMOTE_NAME}/")) {
                    Some("HEAD") | None => continue,
                    Some(name) => name,
                },
            };
            names.push(name.to_string());
        }

        names.sort();
        names.dedup();
        Ok(names)
    }

    #[instrument(skip(self), level = "debug")]
    fn delete_branch(&self, name: &str, force: bool) -> Result<()> {
        if self.current_branch()? == name {
            return Err(VcsError::ActiveBranch(name.into()));
        }

        let mut branch = match self.repository.find_branch(name, BranchType::Local) {
            Ok(branch) => branch,
            Err(error) if error.code() == ErrorCode::NotFound => {
                return Err(VcsError::BranchNotFound(name.into()))
            }
            Err(error) => return Err(error.into()),
        };

        if !force {
            let tip = branch.get().peel_to_commit()?.id();
            let merged = match self.head_commit()? {
                Some(head) => head.id() == tip || self.repository.graph_descendant_of(head.id(), tip)?,
                None => false,
            };
            if !merged {
                return Err(VcsError::NotMerged(name.into()));
            }
        }

        branch.delete()?;
        info!("deleted branch {name:?}");
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    fn checkout(&self, name: &str, create_if_missing: bool) -> Result<Checkout> {
        let current = self.current_branch()?;
        if current == name {
            return Ok(Checkout::Existing);
        }

        if self.is_dirty()? {
            return Err(VcsError::DirtyWorkTree { branch: current });
        }

        let refname = format!("refs/heads/{name}");
        let has_local = self.repository.find_branch(name, BranchType::Local).is_ok();
        let (commit, kind) = match self.branch_commit(name)? {
            Some(commit) => (Some(commit), Checkout::Existing),
            None if create_if_missing => (self.head_commit()?, Checkout::Created),
            None => return Err(VcsError::BranchNotFound(name.into())),
        };

        if let Some(commit) = &commit {
            if !has_local {
                let mut branch = self.repository.branch(name, commit, false)?;
                if kind == Checkout::Existing {
                    branch.set_upstream(Some(&format!("{REMOTE_NAME}/{name}")))?;
                }
            }

            let mut builder = CheckoutBuilder::new();
            builder.safe();
            self.repository
                .checkout_tree(commit.as_object(), Some(&mut builder))?;
        }

        // INVARIANT: Without any commit the new branch stays unborn until first commit.
        self.repository.set_head(&refname)?;
        info!("checked out {name:?} ({kind:?})");

        Ok(kind)
    }

    #[instrument(skip(self), level = "debug")]
    fn commit(&self, message: &str) -> Result<Option<String>> {
        let mut index = self.repository.index()?;
        if index.has_conflicts() {
            return Err(VcsError::Unresolved);
        }

        index.add_all(["*"], IndexAddOption::DEFAULT, None)?;
        index.update_all(["*"], None)?;
        index.write()?;
        let tree = self.repository.find_tree(index.write_tree()?)?;

        let head = self.head_commit()?;
        let merge_head = match self.repository.find_reference("MERGE_HEAD") {
            Ok(reference) => Some(reference.peel_to_commit()?),
            Err(error) if error.code() == ErrorCode::NotFound => None,
            Err(error) => return Err(error.into()),
        };

        let unchanged = match &head {
            Some(head) => head.tree_id() == tree.id(),
            None => tree.is_empty(),
        };
        if unchanged && merge_head.is_none() {
            debug!("nothing to commit");
            return Ok(None);
        }

        let parents: Vec<&Commit<'_>> = head.iter().chain(merge_head.iter()).collect();
        let signature = self.signature()?;
        let oid = self.repository.commit(
            Some("HEAD"),
            &signature,
            &signature,
            message,
            &tree,
            &parents,
        )?;

        if merge_head.is_some() {
            self.repository.cleanup_state()?;
        }

        info!("commit {oid}: {message}");
        Ok(Some(oid.to_string()))
    }

    fn is_dirty(&self) -> Result<bool> {
        let mut opts = StatusOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(true)
            .include_ignored(false);
        let statuses = self.repository.statuses(Some(&mut opts))?;

        Ok(statuses
            .iter()
            .any(|entry| !entry.status().is_ignored() && entry.status() != git2::Status::CURRENT))
    }

    #[instrument(skip(self, paths), level = "debug")]
    fn restore(&self, paths: &[PathBuf]) -> Result<()> {
        let tree = self.head_commit()?.map(|commit| commit.tree()).transpose()?;
        let mut builder = CheckoutBuilder::new();
        builder.force();
        let mut tracked = 0;

        for path in paths {
            let relative = path.strip_prefix(&self.work_dir).unwrap_or(path);
            let in_head = match &tree {
                Some(tree) => match tree.get_path(relative) {
                    Ok(_) => true,
                    Err(error) if error.code() == ErrorCode::NotFound => false,
                    Err(error) => return Err(error.into()),
                },
                None => false,
            };

            if in_head {
                builder.path(relative);
                tracked += 1;
                continue;
            }

            let absolute = self.work_dir.join(relative);
            match std::fs::remove_file(&absolute) {
                Ok(()) => debug!("removed {:?}, absent from HEAD", absolute.display()),
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => return Err(VcsError::Restore { source, path: absolute }),
            }
        }

        if tracked > 0 {
            self.repository.checkout_head(Some(&mut builder))?;
        }

        info!("restored {} paths from HEAD", paths.len());
        Ok(())
    }

    fn conflicted_paths(&self) -> Result<Vec<ConflictedPath>> {
        let index = self.repository.index()?;
        let mut paths = Vec::new();
        for conflict in index.conflicts()? {
            let conflict = conflict?;
            let Some(entry) = [&conflict.ancestor, &conflict.our, &conflict.their]
                .into_iter()
                .flatten()
                .next()
            else {
                continue;
            };

            paths.push(ConflictedPath {
                path: bytes_to_path(&entry.path),
                ancestor: conflict.ancestor.is_some(),
                local: conflict.our.is_some(),
                remote: conflict.their.is_some(),
            });
        }

        Ok(paths)
    }

    fn conflict_side(&self, path: &Path, side: ConflictSide) -> Result<Option<Vec<u8>>> {
        let Some([ancestor, local, remote]) = self.conflict_entries(path)? else {
            return Ok(None);
        };

        let entry = match side {
            ConflictSide::Ancestor => ancestor,
            ConflictSide::Local => local,
            ConflictSide::Remote => remote,
        };

        match entry {
            Some(entry) => Ok(Some(self.repository.find_blob(entry.id)?.content().to_vec())),
            None => Ok(None),
        }
    }

    fn mark_resolved(&self, path: &Path) -> Result<()> {
        let mut index = self.repository.index()?;
        if self.work_dir.join(path).exists() {
            index.add_path(path)?;
        } else {
            index.remove_path(path)?;
        }
        index.write()?;

        debug!("marked {:?} resolved", path.display());
        Ok(())
    }

    fn read_file_at(&self, branch: &str, path: &Path) -> Result<Option<Vec<u8>>> {
        let Some(commit) = self.branch_commit(branch)? else {
            return Ok(None);
        };

        let entry = match commit.tree()?.get_path(path) {
            Ok(entry) => entry,
            Err(error) if error.code() == ErrorCode::NotFound => return Ok(None),
            Err(error) => return Err(error.into()),
        };

        let object = entry.to_object(&self.repository)?;
        Ok(object.as_blob().map(|blob| blob.content().to_vec()))
    }

    #[instrument(skip(self), level = "debug")]
    fn push(&self) -> Result<()> {
        let branch = self.current_branch()?;
        let mut remote = self.find_remote()?;
        let url = remote.url().unwrap_or(REMOTE_NAME).to_string();

        let rejection: RefCell<Option<String>> = RefCell::new(None);
        let transfer = Transfer::new(self.bar.clone(), &url)?;
        let mut rc = transfer.callbacks();
        rc.push_update_reference(|_, status| {
            if let Some(status) = status {
                *rejection.borrow_mut() = Some(status.to_string());
            }
            Ok(())
        });

        let mut po = PushOptions::new();
        po.remote_callbacks(rc);
        let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");
        remote.push(&[refspec], Some(&mut po))?;
        drop(po);
        transfer.finish();

        if let Some(reason) = rejection.into_inner() {
            return Err(VcsError::PushRejected { branch, reason });
        }

        info!("pushed {branch:?} to {url}");
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    fn pull(&self) -> Result<RemoteOutcome> {
        let branch = self.current_branch()?;
        if self.is_dirty()? {
            return Err(VcsError::DirtyWorkTree { branch });
        }

        self.fetch(&branch)?;
        let remote_ref = match self
            .repository
            .find_reference(&format!("refs/remotes/{REMOTE_NAME}/{branch}"))
        {
            Ok(reference) => reference,
            Err(error) if error.code() == ErrorCode::NotFound => {
                warn!("remote has no branch {branch:?}");
                return Ok(RemoteOutcome::UpToDate);
            }
            Err(error) => return Err(error.into()),
        };

        let incoming = self.repository.reference_to_annotated_commit(&remote_ref)?;
        let (analysis, _) = self.repository.merge_analysis(&[&incoming])?;
        let refname = format!("refs/heads/{branch}");

        if analysis.is_up_to_date() {
            return Ok(RemoteOutcome::UpToDate);
        }

        if analysis.is_unborn() || analysis.is_fast_forward() {
            match self.repository.find_reference(&refname) {
                Ok(mut reference) => {
                    reference.set_target(incoming.id(), "fast-forward")?;
                }
                Err(error) if error.code() == ErrorCode::NotFound => {
                    self.repository
                        .reference(&refname, incoming.id(), true, "fast-forward")?;
                }
                Err(error) => return Err(error.into()),
            }
            self.repository.set_head(&refname)?;

            // INVARIANT: Tree was clean before the pull, forcing cannot lose work.
            self.repository
                .checkout_head(Some(CheckoutBuilder::new().force()))?;
            info!("fast-forwarded {branch:?}");
            return Ok(RemoteOutcome::FastForward);
        }

        self.repository.merge(&[&incoming], None, None)?;
        if self.repository.index()?.has_conflicts() {
            let conflicts = self.conflicted_paths()?;
            warn!("merge of {branch:?} left {} conflicts", conflicts.len());
            return Ok(RemoteOutcome::Conflict(conflicts));
        }

        self.commit(&format!("Merge remote-tracking branch '{REMOTE_NAME}/{branch}'"))?;
        Ok(RemoteOutcome::Merged)
    }
}

/// Version control error types.
#[derive(Debug, thiserror::Error)]
pub enum VcsError {
    /// Working tree has uncommitted changes.
    #[error("working tree of {branch:?} has uncommitted changes")]
    DirtyWorkTree { branch: String },

    #[error("branch {0:?} does not exist")]
    BranchNotFound(String),

    #[error("branch {0:?} is checked out, switch to another profile first")]
    ActiveBranch(String),

    #[error("branch {0:?} is not fully merged")]
    NotMerged(String),

    #[error("failed to restore {:?} from HEAD", path.display())]
    Restore {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    #[error("HEAD does not point at a branch")]
    DetachedHead,

    #[error("repository has no remote named {0:?}")]
    NoRemote(String),

    #[error("push of {branch:?} rejected: {reason}")]
    PushRejected { branch: String, reason: String },

    /// Index still holds conflict entries.
    #[error("index has unresolved conflicts")]
    Unresolved,

    #[error("repository has no working tree")]
    Bare,

    /// Style template cannot be set for progress bars.
    #[error(transparent)]
    IndicatifStyleTemplate(#[from] indicatif::style::TemplateError),

    /// Operations from libgit2 fail.
    #[error(transparent)]
    Git2(#[from] git2::Error),
}

/// Friendly result alias :3
type Result<T, E = VcsError> = std::result::Result<T, E>;
