// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Profile switching.
//!
//! Switching profiles is a small state machine:
//!
//! ```text
//! Idle -> Saving -> Switching -> Deploying -> Done
//!           |           |            |
//!           v           v            v
//!     Failed(Saving) Failed(Switching) Failed(Deploying)
//! ```
//!
//! __Saving__ stores local changes of the current profile and commits them.
//! __Switching__ checks out the target branch, creating it if needed.
//! __Deploying__ writes the target profile's files onto local paths.
//!
//! A failure stops the machine in the phase it happened in. Nothing after that
//! phase runs, so a failed save never switches branches and a failed switch
//! never deploys. Every error names its phase and the files touched so far.
//! A save that fails halfway puts the repository files it wrote back to their
//! committed state, and the vault back to where it was.
//!
//! Plain saves and deploys walk the same machine, skipping phases they do not
//! need.

use crate::{
    backup::{BackupError, BackupManager, BackupRecord},
    config::{ConfigError, DeployStrategy, ProfileConfig, CONFIG_FILE_NAME},
    hook::{HookError, HookRunner, HookStage},
    lock::OperationLock,
    scan::{policy::SecretPolicy, SecretFinding, SecretScanner},
    sync::{
        template::VariableStore, DeployOutcome, DeployPlan, FileSyncEngine, SavePlan, SaveReport,
        SyncContext, SyncError, SyncWarning,
    },
    vault::{PruneRule, RedactionVault, VaultCheckpoint},
    vcs::{Checkout, VcsError, VersionControl},
};

use chrono::TimeDelta;
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    mem,
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument, warn};

/// Phase a run can fail in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Saving,
    Switching,
    Deploying,
}

impl Display for Phase {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Saving => fmt.write_str("saving"),
            Self::Switching => fmt.write_str("switching"),
            Self::Deploying => fmt.write_str("deploying"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchState {
    Idle,
    Saving,
    Switching,
    Deploying,
    Done,
    Failed(Phase),
}

impl SwitchState {
    /// Check whether machine may move from this state to next.
    pub fn can_transition_to(self, next: Self) -> bool {
        use SwitchState::*;

        matches!(
            (self, next),
            (Idle, Saving | Switching | Deploying | Done | Failed(_))
                | (Saving, Switching | Done | Failed(Phase::Saving))
                | (Switching, Deploying | Failed(Phase::Switching))
                | (Deploying, Done | Failed(Phase::Deploying))
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed(_))
    }
}

/// Explicit context an engine operates with.
pub struct Session<'a> {
    pub scanner: &'a SecretScanner,
    pub policy: &'a SecretPolicy,
    pub vault: &'a mut RedactionVault,
    pub variables: &'a VariableStore,
    pub hooks: &'a dyn HookRunner,

    /// Where to snapshot overwritten files, `None` disables snapshots.
    pub backups: Option<&'a BackupManager>,

    /// Prune vault entries of the saved profile no save confirmed for this long.
    pub vault_max_age: Option<TimeDelta>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitchOptions {
    pub dry_run: bool,

    /// Continue past files that failed to save.
    pub force: bool,
    pub backup: bool,
    pub strict: bool,
}

impl Default for SwitchOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            force: false,
            backup: true,
            strict: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeployOptions {
    /// Use this strategy for every section instead of their own.
    pub strategy: Option<DeployStrategy>,
    pub dry_run: bool,
    pub backup: bool,
}

impl Default for DeployOptions {
    fn default() -> Self {
        Self {
            strategy: None,
            dry_run: false,
            backup: true,
        }
    }
}

/// What a dry run found.
#[derive(Debug, Default)]
pub struct DryRun {
    /// Repository paths a save would write or remove.
    pub pending_saves: Vec<PathBuf>,
    pub findings: Vec<SecretFinding>,
    pub creates_branch: bool,

    /// Sections of the target profile.
    pub sections: Vec<String>,

    /// Local paths a deploy would write, known only for the current profile.
    pub pending_deploys: Vec<PathBuf>,
}

/// Everything a finished run did.
#[derive(Debug, Default)]
pub struct SwitchReport {
    pub from: String,
    pub to: String,
    pub history: Vec<SwitchState>,
    pub saved: Vec<SaveReport>,

    /// Save failures tolerated through `force`.
    pub save_failures: Vec<SyncError>,
    pub commit: Option<String>,
    pub pruned: usize,
    pub checkout: Option<Checkout>,
    pub deployed: Vec<DeployOutcome>,
    pub backup: Option<BackupRecord>,
    pub hook_failures: Vec<HookError>,
    pub dry_run: Option<DryRun>,
}

impl SwitchReport {
    /// Check whether run did nothing at all.
    pub fn is_noop(&self) -> bool {
        self.history == [SwitchState::Idle, SwitchState::Done] && self.dry_run.is_none()
    }

    /// Per-file deploy failures.
    pub fn deploy_failures(&self) -> impl Iterator<Item = &SyncError> {
        self.deployed.iter().flat_map(|outcome| outcome.failures.iter())
    }

    /// Process exit code of a finished run.
    ///
    /// Single files that failed to save or deploy make it a filesystem
    /// failure even though the run itself went through.
    pub fn exit_code(&self) -> i32 {
        if self.save_failures.is_empty() && self.deploy_failures().next().is_none() {
            0
        } else {
            6
        }
    }

    pub fn warnings(&self) -> impl Iterator<Item = &SyncWarning> {
        self.saved
            .iter()
            .flat_map(|report| report.warnings.iter())
            .chain(self.deployed.iter().flat_map(|outcome| outcome.warnings.iter()))
    }
}

/// Drives the save, switch, deploy machine.
pub struct BranchSwitchEngine<'a, V>
where
    V: VersionControl,
{
    lock: &'a OperationLock,
    vcs: &'a V,
    session: Session<'a>,
}

impl<'a, V> BranchSwitchEngine<'a, V>
where
    V: VersionControl,
{
    /// Construct engine, holding the operation lock proves exclusive access.
    pub fn new(lock: &'a OperationLock, vcs: &'a V, session: Session<'a>) -> Self {
        Self { lock, vcs, session }
    }

    /// Save current profile, switch to target, and deploy it.
    ///
    /// Switching to the active profile does nothing.
    ///
    /// # Errors
    ///
    /// - Return [`SwitchError`] naming the failed phase and touched files.
    #[instrument(skip(self, opts), level = "debug")]
    pub fn switch(&mut self, to: &str, opts: &SwitchOptions) -> Result<SwitchReport> {
        debug!("switch under lock {:?}", self.lock.path().display());
        let mut run = Run::new();
        let from = self
            .vcs
            .current_branch()
            .map_err(|error| run.fail(Phase::Saving, error.into()))?;
        let mut report = SwitchReport {
            from: from.clone(),
            to: to.into(),
            ..Default::default()
        };

        if from == to {
            info!("already on profile {to:?}");
            return run.finish(report);
        }

        if opts.dry_run {
            let preview = self
                .preview_switch(&from, to)
                .map_err(|cause| run.fail(Phase::Saving, cause))?;
            report.dry_run = Some(preview);
            return run.finish(report);
        }

        info!("switch from {from:?} to {to:?}");
        run.advance(SwitchState::Saving)?;
        let message = format!("Auto-save from '{from}' before switch to '{to}'");
        self.save_phase(&from, &message, opts.strict, opts.force, &mut run, &mut report)?;

        run.advance(SwitchState::Switching)?;
        let checkout = self
            .vcs
            .checkout(to, true)
            .map_err(|error| run.fail(Phase::Switching, error.into()))?;
        report.checkout = Some(checkout);

        // INVARIANT: New branch holds the redacted content of the old one.
        if checkout == Checkout::Created {
            let vault = &mut *self.session.vault;
            match vault.copy_profile(&from, to) {
                Ok(copied) => debug!("{to:?} starts with {copied} vault entries"),
                Err(error) => warn!("vault entries not carried to {to:?}: {error}"),
            }
            if let Err(error) = vault.persist() {
                warn!("vault not persisted: {error}");
            }
        }

        run.advance(SwitchState::Deploying)?;
        self.deploy_phase(to, None, opts.backup, &mut run, &mut report)?;

        run.finish(report)
    }

    /// Save current profile and commit it.
    ///
    /// # Errors
    ///
    /// - Return [`SwitchError`] in [`Phase::Saving`] on any failure.
    #[instrument(skip(self), level = "debug")]
    pub fn save(&mut self, strict: bool) -> Result<SwitchReport> {
        let mut run = Run::new();
        let profile = self
            .vcs
            .current_branch()
            .map_err(|error| run.fail(Phase::Saving, error.into()))?;
        let mut report = SwitchReport {
            from: profile.clone(),
            to: profile.clone(),
            ..Default::default()
        };

        run.advance(SwitchState::Saving)?;
        let message = format!("Save profile '{profile}'");
        self.save_phase(&profile, &message, strict, false, &mut run, &mut report)?;

        run.finish(report)
    }

    /// Deploy profile without saving anything first.
    ///
    /// Checks out profile first if it is not the active one.
    ///
    /// # Errors
    ///
    /// - Return [`SwitchError`] naming the failed phase and touched files.
    #[instrument(skip(self, opts), level = "debug")]
    pub fn deploy(&mut self, profile: &str, opts: &DeployOptions) -> Result<SwitchReport> {
        let mut run = Run::new();
        let current = self
            .vcs
            .current_branch()
            .map_err(|error| run.fail(Phase::Switching, error.into()))?;
        let mut report = SwitchReport {
            from: current.clone(),
            to: profile.into(),
            ..Default::default()
        };

        if opts.dry_run {
            let preview = self
                .preview_deploy(&current, profile, opts.strategy)
                .map_err(|cause| run.fail(Phase::Deploying, cause))?;
            report.dry_run = Some(preview);
            return run.finish(report);
        }

        if current != profile {
            run.advance(SwitchState::Switching)?;
            let checkout = self
                .vcs
                .checkout(profile, false)
                .map_err(|error| run.fail(Phase::Switching, error.into()))?;
            report.checkout = Some(checkout);
        }

        run.advance(SwitchState::Deploying)?;
        self.deploy_phase(profile, opts.strategy, opts.backup, &mut run, &mut report)?;

        run.finish(report)
    }

    fn save_phase(
        &mut self,
        profile: &str,
        message: &str,
        strict: bool,
        force: bool,
        run: &mut Run,
        report: &mut SwitchReport,
    ) -> Result<()> {
        let config = ProfileConfig::load(self.vcs.work_dir())
            .map_err(|error| run.fail(Phase::Saving, error.into()))?;

        let checkpoint = self.session.vault.checkpoint();
        let mut engine = FileSyncEngine::new(SyncContext {
            repo_root: self.vcs.work_dir(),
            profile,
            scanner: self.session.scanner,
            policy: self.session.policy,
            vault: &mut *self.session.vault,
            variables: self.session.variables,
        });
        let mut plans: Vec<SavePlan> = config
            .sections
            .iter()
            .map(|section| engine.plan_save(section))
            .collect();

        // INVARIANT: Unreadable files abort before a single write happens.
        if !force {
            let failures: Vec<SyncError> = plans
                .iter_mut()
                .flat_map(|plan| mem::take(&mut plan.failures))
                .collect();
            if !failures.is_empty() {
                return Err(run.fail(Phase::Saving, FailureCause::Filesystem(failures)));
            }
        }

        // INVARIANT: Strict mode aborts before a single write happens.
        if strict {
            let blocking: Vec<SecretFinding> = plans
                .iter()
                .flat_map(SavePlan::blocking_findings)
                .cloned()
                .collect();
            if !blocking.is_empty() {
                for finding in &blocking {
                    warn!("blocked by {finding}");
                }
                return Err(run.fail(Phase::Saving, FailureCause::SecretsDetected(blocking)));
            }
        }

        let mut failures = Vec::new();
        for plan in plans {
            let mut saved = engine.apply_save(plan);
            run.touched.extend(saved.touched().cloned());
            failures.append(&mut saved.failures);
            report.saved.push(saved);
        }
        drop(engine);

        if !failures.is_empty() {
            if !force {
                self.roll_back_save(checkpoint, run);
                return Err(run.fail(Phase::Saving, FailureCause::Filesystem(failures)));
            }
            warn!("continue past {} files that failed to save", failures.len());
            report.save_failures = failures;
        }

        let vault = &mut *self.session.vault;
        let roots = config.local_roots();
        report.pruned += vault.prune(PruneRule::Orphaned {
            profile,
            roots: &roots,
        });
        if let Some(age) = self.session.vault_max_age {
            report.pruned += vault.prune(PruneRule::Stale { profile, age });
        }
        if let Err(error) = vault.persist() {
            warn!("vault not persisted: {error}");
        }

        report.commit = self
            .vcs
            .commit(message)
            .map_err(|error| run.fail(Phase::Saving, error.into()))?;

        Ok(())
    }

    fn roll_back_save(&mut self, checkpoint: VaultCheckpoint, run: &mut Run) {
        let vault = &mut *self.session.vault;
        vault.rollback(checkpoint);
        if let Err(error) = vault.persist() {
            warn!("vault not rolled back: {error}");
        }

        match self.vcs.restore(&run.touched) {
            Ok(()) => {
                info!("rolled back {} repository files", run.touched.len());
                run.touched.clear();
            }
            Err(error) => warn!("repository files not rolled back: {error}"),
        }
    }

    fn deploy_phase(
        &mut self,
        profile: &str,
        strategy: Option<DeployStrategy>,
        backup: bool,
        run: &mut Run,
        report: &mut SwitchReport,
    ) -> Result<()> {
        let config = ProfileConfig::load(self.vcs.work_dir())
            .map_err(|error| run.fail(Phase::Deploying, error.into()))?;
        let hooks = self.session.hooks;
        let backups = self.session.backups;

        let mut engine = FileSyncEngine::new(SyncContext {
            repo_root: self.vcs.work_dir(),
            profile,
            scanner: self.session.scanner,
            policy: self.session.policy,
            vault: &mut *self.session.vault,
            variables: self.session.variables,
        });
        let plans: Vec<DeployPlan> = config
            .sections
            .iter()
            .map(|section| engine.plan_deploy(section, strategy.unwrap_or(section.deploy_strategy)))
            .collect();

        if let Some(backups) = backups.filter(|_| backup) {
            let overwritten: Vec<PathBuf> = plans
                .iter()
                .flat_map(DeployPlan::overwritten)
                .map(Path::to_path_buf)
                .collect();
            report.backup = backups
                .create(&overwritten, &format!("deploy {profile}"))
                .map_err(|error| run.fail(Phase::Deploying, error.into()))?;
        }

        for plan in plans {
            let section = plan.section.clone();
            if let Some(command) = plan.hooks.pre_deploy.as_deref().filter(|_| !plan.writes.is_empty()) {
                if let Err(error) = hooks.run(HookStage::PreDeploy, &section, command) {
                    warn!("{error}, skip section {section:?}");
                    report.hook_failures.push(error);
                    continue;
                }
            }

            let outcome = engine.apply_deploy(plan);
            run.touched.extend(outcome.written.iter().cloned());
            let post = outcome
                .hooks
                .as_ref()
                .and_then(|section_hooks| section_hooks.post_deploy.as_deref());
            if let Some(command) = post {
                if let Err(error) = hooks.run(HookStage::PostDeploy, &section, command) {
                    warn!("{error}");
                    report.hook_failures.push(error);
                }
            }
            report.deployed.push(outcome);
        }

        Ok(())
    }

    fn preview_switch(&mut self, from: &str, target: &str) -> Result<DryRun, FailureCause> {
        let config = ProfileConfig::load(self.vcs.work_dir())?;
        let engine = FileSyncEngine::new(SyncContext {
            repo_root: self.vcs.work_dir(),
            profile: from,
            scanner: self.session.scanner,
            policy: self.session.policy,
            vault: &mut *self.session.vault,
            variables: self.session.variables,
        });

        let mut preview = DryRun::default();
        for section in &config.sections {
            let plan = engine.plan_save(section);
            preview
                .pending_saves
                .extend(plan.pending_paths().into_iter().map(Path::to_path_buf));
            preview.findings.extend(plan.findings);
        }
        drop(engine);

        preview.creates_branch = !self.vcs.branch_exists(target)?;
        let source = if preview.creates_branch { from } else { target };
        preview.sections = self.sections_at(source)?;

        Ok(preview)
    }

    fn preview_deploy(
        &mut self,
        current: &str,
        profile: &str,
        strategy: Option<DeployStrategy>,
    ) -> Result<DryRun, FailureCause> {
        let mut preview = DryRun::default();
        if current != profile {
            if !self.vcs.branch_exists(profile)? {
                return Err(VcsError::BranchNotFound(profile.into()).into());
            }
            preview.sections = self.sections_at(profile)?;
            return Ok(preview);
        }

        let config = ProfileConfig::load(self.vcs.work_dir())?;
        let engine = FileSyncEngine::new(SyncContext {
            repo_root: self.vcs.work_dir(),
            profile,
            scanner: self.session.scanner,
            policy: self.session.policy,
            vault: &mut *self.session.vault,
            variables: self.session.variables,
        });
        for section in &config.sections {
            let plan = engine.plan_deploy(section, strategy.unwrap_or(section.deploy_strategy));
            preview.sections.push(section.name.clone());
            preview
                .pending_deploys
                .extend(plan.writes.into_iter().map(|write| write.local));
        }

        Ok(preview)
    }

    fn sections_at(&self, branch: &str) -> Result<Vec<String>, FailureCause> {
        let Some(data) = self.vcs.read_file_at(branch, Path::new(CONFIG_FILE_NAME))? else {
            return Ok(Vec::new());
        };

        let config: ProfileConfig = String::from_utf8_lossy(&data).parse()?;
        Ok(config.sections.into_iter().map(|section| section.name).collect())
    }
}

/// Bookkeeping of one walk through the machine.
#[derive(Debug)]
struct Run {
    state: SwitchState,
    history: Vec<SwitchState>,
    touched: Vec<PathBuf>,
}

impl Run {
    fn new() -> Self {
        Self {
            state: SwitchState::Idle,
            history: vec![SwitchState::Idle],
            touched: Vec::new(),
        }
    }

    fn advance(&mut self, next: SwitchState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            let phase = self.phase();
            return Err(self.fail(
                phase,
                FailureCause::Transition {
                    from: self.state,
                    to: next,
                },
            ));
        }

        debug!("{:?} -> {next:?}", self.state);
        self.state = next;
        self.history.push(next);
        Ok(())
    }

    fn finish(mut self, mut report: SwitchReport) -> Result<SwitchReport> {
        self.advance(SwitchState::Done)?;
        report.history = self.history;
        Ok(report)
    }

    fn fail(&mut self, phase: Phase, cause: FailureCause) -> SwitchError {
        warn!("{phase} failed: {cause}");
        self.state = SwitchState::Failed(phase);
        self.history.push(self.state);
        SwitchError {
            phase,
            cause,
            touched: mem::take(&mut self.touched),
            history: self.history.clone(),
        }
    }

    fn phase(&self) -> Phase {
        match self.state {
            SwitchState::Switching => Phase::Switching,
            SwitchState::Deploying => Phase::Deploying,
            SwitchState::Failed(phase) => phase,
            _ => Phase::Saving,
        }
    }
}

/// Failed run.
#[derive(Debug, thiserror::Error)]
#[error("{phase} phase failed after touching {} files", touched.len())]
pub struct SwitchError {
    pub phase: Phase,

    #[source]
    pub cause: FailureCause,

    /// Files written or removed before the failure.
    pub touched: Vec<PathBuf>,
    pub history: Vec<SwitchState>,
}

impl SwitchError {
    /// Process exit code for failure class.
    pub fn exit_code(&self) -> i32 {
        match &self.cause {
            FailureCause::Vcs(_) => 5,
            FailureCause::Filesystem(_) | FailureCause::Backup(_) => 6,
            FailureCause::Config(_) => 7,
            FailureCause::SecretsDetected(_) => 10,
            FailureCause::Transition { .. } => 1,
        }
    }
}

/// Why a run failed.
#[derive(Debug, thiserror::Error)]
pub enum FailureCause {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Strict mode found high or critical secrets.
    #[error("{} secrets of high or critical severity found", .0.len())]
    SecretsDetected(Vec<SecretFinding>),

    #[error(transparent)]
    Vcs(#[from] VcsError),

    #[error("{} files failed to sync", .0.len())]
    Filesystem(Vec<SyncError>),

    #[error(transparent)]
    Backup(#[from] BackupError),

    #[error("invalid transition from {from:?} to {to:?}")]
    Transition { from: SwitchState, to: SwitchState },
}

/// Friendly result alias :3
type Result<T, E = SwitchError> = std::result::Result<T, E>;
