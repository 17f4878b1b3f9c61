// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

mod integration;

use dotswitch::{
    backup::BackupManager,
    config::CONFIG_FILE_NAME,
    hook::{HookError, HookRunner, HookStage},
    lock::OperationLock,
    scan::{policy::SecretPolicy, SecretScanner},
    switch::{BranchSwitchEngine, Session},
    sync::template::VariableStore,
    vault::{RedactionVault, VaultKey},
    vcs::{Checkout, ConflictSide, ConflictedPath, Git2Vcs, RemoteOutcome, VcsError, VersionControl},
};

use anyhow::Result;
use chrono::TimeDelta;
use git2::{Repository, RepositoryInitOptions};
use std::{
    cell::{Cell, RefCell},
    fs,
    path::{Path, PathBuf},
    process::Command,
};
use tempfile::TempDir;

/// Set identity on repository at path.
///
/// # Invariants
///
/// - Git complains about missing name and email in CI/CD environments.
pub(crate) fn configure_identity(path: impl AsRef<Path>) -> Result<()> {
    let repo = Repository::open(path.as_ref())?;
    let mut config = repo.config()?;
    config.set_str("user.name", "John Doe")?;
    config.set_str("user.email", "john@doe.com")?;

    Ok(())
}

/// Bare repository standing in for a remote.
pub(crate) fn bare_remote(path: impl AsRef<Path>) -> Result<String> {
    let mut opts = RepositoryInitOptions::new();
    opts.initial_head("main");
    opts.bare(true);
    Repository::init_opts(path.as_ref(), &opts)?;

    Ok(path.as_ref().to_string_lossy().into_owned())
}

/// Version control that can be told to fail checkouts.
pub(crate) struct FlakyVcs {
    pub(crate) git: Git2Vcs,
    pub(crate) fail_checkout: Cell<bool>,
}

impl VersionControl for FlakyVcs {
    fn work_dir(&self) -> &Path {
        self.git.work_dir()
    }

    fn current_branch(&self) -> Result<String, VcsError> {
        self.git.current_branch()
    }

    fn branch_exists(&self, name: &str) -> Result<bool, VcsError> {
        self.git.branch_exists(name)
    }

    fn branches(&self) -> Result<Vec<String>, VcsError> {
        self.git.branches()
    }

    fn delete_branch(&self, name: &str, force: bool) -> Result<(), VcsError> {
        self.git.delete_branch(name, force)
    }

    fn checkout(&self, name: &str, create_if_missing: bool) -> Result<Checkout, VcsError> {
        if self.fail_checkout.get() {
            return Err(VcsError::BranchNotFound(name.into()));
        }

        self.git.checkout(name, create_if_missing)
    }

    fn commit(&self, message: &str) -> Result<Option<String>, VcsError> {
        self.git.commit(message)
    }

    fn is_dirty(&self) -> Result<bool, VcsError> {
        self.git.is_dirty()
    }

    fn restore(&self, paths: &[PathBuf]) -> Result<(), VcsError> {
        self.git.restore(paths)
    }

    fn conflicted_paths(&self) -> Result<Vec<ConflictedPath>, VcsError> {
        self.git.conflicted_paths()
    }

    fn conflict_side(&self, path: &Path, side: ConflictSide) -> Result<Option<Vec<u8>>, VcsError> {
        self.git.conflict_side(path, side)
    }

    fn mark_resolved(&self, path: &Path) -> Result<(), VcsError> {
        self.git.mark_resolved(path)
    }

    fn read_file_at(&self, branch: &str, path: &Path) -> Result<Option<Vec<u8>>, VcsError> {
        self.git.read_file_at(branch, path)
    }

    fn push(&self) -> Result<(), VcsError> {
        self.git.push()
    }

    fn pull(&self) -> Result<RemoteOutcome, VcsError> {
        self.git.pull()
    }
}

/// Hook runner that records every call, and fails the stage it is told to.
#[derive(Default)]
pub(crate) struct RecordingHooks {
    pub(crate) calls: RefCell<Vec<(HookStage, String, String)>>,
    pub(crate) fail: Option<HookStage>,
}

impl HookRunner for RecordingHooks {
    fn run(&self, stage: HookStage, section: &str, command: &str) -> Result<(), HookError> {
        self.calls
            .borrow_mut()
            .push((stage, section.into(), command.into()));

        if self.fail == Some(stage) {
            let status = Command::new("sh").arg("-c").arg("exit 1").status().map_err(|source| {
                HookError::Spawn {
                    source,
                    program: "sh".into(),
                }
            })?;
            return Err(HookError::Failed {
                stage,
                section: section.into(),
                status,
            });
        }

        Ok(())
    }
}

/// Profile repository, fake home directory, and everything an engine needs.
pub(crate) struct Workspace {
    pub(crate) dir: TempDir,
    pub(crate) vcs: FlakyVcs,
    pub(crate) scanner: SecretScanner,
    pub(crate) policy: SecretPolicy,
    pub(crate) vault: RedactionVault,
    pub(crate) vault_max_age: Option<TimeDelta>,
    pub(crate) variables: VariableStore,
    pub(crate) hooks: RecordingHooks,
    pub(crate) backups: BackupManager,
    pub(crate) lock: OperationLock,
}

impl Workspace {
    pub(crate) fn new() -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let repo_dir = dir.path().join("repo");
        let git = Git2Vcs::init(&repo_dir, "main")?;
        configure_identity(&repo_dir)?;
        fs::create_dir_all(dir.path().join("home"))?;

        let vault = RedactionVault::open(dir.path().join("vault.json"), VaultKey::generate())?;
        let lock = OperationLock::acquire(dir.path().join("dotswitch.lock"))?;
        let backups = BackupManager::new(dir.path().join("backups"));

        Ok(Self {
            vcs: FlakyVcs {
                git,
                fail_checkout: Cell::new(false),
            },
            scanner: SecretScanner::new(),
            policy: SecretPolicy::default(),
            vault,
            vault_max_age: None,
            variables: VariableStore::default(),
            hooks: RecordingHooks::default(),
            backups,
            lock,
            dir,
        })
    }

    pub(crate) fn home(&self) -> PathBuf {
        self.dir.path().join("home")
    }

    pub(crate) fn repo(&self) -> &Path {
        self.vcs.work_dir()
    }

    /// Write profile configuration, `{home}` is replaced with home directory.
    pub(crate) fn configure(&self, config: &str) -> Result<()> {
        let config = config.replace("{home}", &self.home().to_string_lossy());
        fs::write(self.repo().join(CONFIG_FILE_NAME), config)?;
        self.vcs.commit("configure profile")?;

        Ok(())
    }

    pub(crate) fn write_home(&self, name: &str, content: &str) -> Result<PathBuf> {
        let path = self.home().join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, content)?;

        Ok(path)
    }

    pub(crate) fn read_home(&self, name: &str) -> Result<String> {
        Ok(fs::read_to_string(self.home().join(name))?)
    }

    pub(crate) fn engine(&mut self) -> BranchSwitchEngine<'_, FlakyVcs> {
        BranchSwitchEngine::new(
            &self.lock,
            &self.vcs,
            Session {
                scanner: &self.scanner,
                policy: &self.policy,
                vault: &mut self.vault,
                variables: &self.variables,
                hooks: &self.hooks,
                backups: Some(&self.backups),
                vault_max_age: self.vault_max_age,
            },
        )
    }
}
