// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use dotswitch::{
    backup::{BackupError, BackupManager},
    config::{ConfigError, DeployStrategy, Inherits, ProfileConfig, ProfileDefinition, SectionEntry},
    conflict::{Conflict, ConflictError, ConflictResolver, Resolution},
    diff::{ChangeDetector, ChangeKind},
    hook::{default_editor, ShellHookRunner},
    lock::{LockError, OperationLock},
    path::{file_identity, home_dir},
    scan::{
        is_binary,
        policy::{line_at, Decision, PolicyError, SecretPolicy},
        SecretFinding, SecretScanner,
    },
    store::{Settings, Store, StoreError},
    switch::{BranchSwitchEngine, DeployOptions, Session, SwitchError, SwitchOptions, SwitchReport},
    sync::{template::VariableStore, FileSyncEngine, SyncContext, SyncError},
    vault::{PruneRule, RedactionVault, VaultKey},
    vcs::{Git2Vcs, RemoteOutcome, VcsError, VersionControl},
};

use anyhow::{Context as _, Result};
use chrono::TimeDelta;
use clap::{Args, Parser, Subcommand};
use indicatif::ProgressBar;
use inquire::{Confirm, Select};
use std::{
    fs,
    path::{Path, PathBuf},
    process::exit,
};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "dotswitch [options] <dotswitch-command>",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    fn run(self) -> Result<()> {
        match self.command {
            Command::Init(opts) => run_init(opts),
            Command::Add(opts) => run_add(opts),
            Command::Status => run_status(),
            Command::Save(opts) => run_save(opts),
            Command::Switch(opts) => run_switch(opts),
            Command::Deploy(opts) => run_deploy(opts),
            Command::Audit(opts) => run_audit(opts),
            Command::Sync => run_sync(),
            Command::Resolve(opts) => run_resolve(opts),
            Command::Revert(opts) => run_revert(opts),
            Command::Branch(command) => run_branch(command),
            Command::Secret(command) => run_secret(command),
            Command::Var(command) => run_var(command),
            Command::Vault(command) => run_vault(command),
            Command::Backup(command) => run_backup(command),
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Initialize profile repository, or clone it from remote.
    #[command(override_usage = "dotswitch init [options]")]
    Init(InitOptions),

    /// Track local file or directory in current profile.
    #[command(override_usage = "dotswitch add [options] <path>")]
    Add(AddOptions),

    /// Show what a save of current profile would do.
    #[command(override_usage = "dotswitch status")]
    Status,

    /// Save local files into current profile and commit them.
    #[command(override_usage = "dotswitch save [options]")]
    Save(SaveOptions),

    /// Save current profile, switch to another, and deploy it.
    #[command(override_usage = "dotswitch switch [options] <profile>")]
    Switch(SwitchArgs),

    /// Deploy files of profile onto local paths without saving first.
    #[command(override_usage = "dotswitch deploy [options] <profile>")]
    Deploy(DeployArgs),

    /// Scan tracked local files for secrets.
    #[command(override_usage = "dotswitch audit [options]")]
    Audit(AuditOptions),

    /// Pull current profile from remote and push it back.
    #[command(override_usage = "dotswitch sync")]
    Sync,

    /// Resolve conflicts left by sync.
    #[command(override_usage = "dotswitch resolve [options] [<path>]...")]
    Resolve(ResolveOptions),

    /// Put local file back to what current profile holds.
    #[command(override_usage = "dotswitch revert [options] <path>")]
    Revert(RevertOptions),

    /// List or delete profiles.
    #[command(subcommand)]
    Branch(BranchCommand),

    /// Allow or protect single secret findings.
    #[command(subcommand)]
    Secret(SecretCommand),

    /// Manage template variable values.
    #[command(subcommand)]
    Var(VarCommand),

    /// Manage redaction vault.
    #[command(subcommand)]
    Vault(VaultCommand),

    /// Manage safety snapshots of deployed files.
    #[command(subcommand)]
    Backup(BackupCommand),
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct InitOptions {
    /// URL of remote to clone profiles from.
    #[arg(short, long, value_name = "url")]
    pub remote: Option<String>,

    /// Initial profile to use.
    #[arg(short, long, value_name = "branch")]
    pub branch: Option<String>,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct AddOptions {
    /// Local file or directory to track.
    #[arg(required = true, value_name = "path")]
    pub path: PathBuf,

    /// Section name, defaults to file name without leading dot.
    #[arg(short, long, value_name = "name")]
    pub name: Option<String>,

    /// Location inside repository.
    #[arg(short, long, value_name = "repo_path")]
    pub repo_path: Option<PathBuf>,

    /// Do not scan or redact secrets of section.
    #[arg(long)]
    pub no_secrets_filter: bool,

    /// Deploy strategy: replace, rename_old, or ignore.
    #[arg(short, long, value_name = "strategy")]
    pub strategy: Option<String>,

    /// Template to take unset policy from, may be repeated.
    #[arg(short, long, value_name = "template")]
    pub inherits: Vec<String>,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct SaveOptions {
    /// Abort on high or critical secrets instead of redacting them.
    #[arg(long)]
    pub strict: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct SwitchArgs {
    /// Profile to switch to, created from current one if missing.
    #[arg(required = true, value_name = "profile")]
    pub profile: String,

    /// Only report what would happen.
    #[arg(long)]
    pub dry_run: bool,

    /// Continue past files that failed to save.
    #[arg(short, long)]
    pub force: bool,

    /// Do not snapshot local files before overwriting them.
    #[arg(long)]
    pub no_backup: bool,

    /// Abort on high or critical secrets instead of redacting them.
    #[arg(long)]
    pub strict: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct DeployArgs {
    /// Profile to deploy.
    #[arg(required = true, value_name = "profile")]
    pub profile: String,

    /// Deploy strategy for every section: replace, rename_old, or ignore.
    #[arg(short, long, value_name = "strategy")]
    pub strategy: Option<String>,

    /// Only report what would happen.
    #[arg(long)]
    pub dry_run: bool,

    /// Do not snapshot local files before overwriting them.
    #[arg(long)]
    pub no_backup: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct AuditOptions {
    /// Fail if high or critical secrets are found.
    #[arg(long)]
    pub strict: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct ResolveOptions {
    /// Conflicted paths to resolve, every conflict if omitted.
    #[arg(value_name = "path")]
    pub paths: Vec<PathBuf>,

    #[command(flatten)]
    pub side: ResolveSide,
}

#[derive(Args, Clone, Debug)]
#[group(multiple = false)]
struct ResolveSide {
    /// Keep content of local profile.
    #[arg(long)]
    pub local: bool,

    /// Keep content of remote profile.
    #[arg(long)]
    pub remote: bool,

    /// Edit conflicted files by hand.
    #[arg(long)]
    pub edit: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct RevertOptions {
    /// Tracked local file or directory to revert.
    #[arg(required = true, value_name = "path")]
    pub path: PathBuf,

    /// Do not ask for confirmation.
    #[arg(short, long)]
    pub force: bool,

    /// Do not snapshot local file before overwriting it.
    #[arg(long)]
    pub no_backup: bool,
}

#[derive(Debug, Clone, Subcommand)]
enum BranchCommand {
    /// List local and remote profiles.
    #[command(override_usage = "dotswitch branch list")]
    List,

    /// Delete local profile.
    #[command(override_usage = "dotswitch branch delete [options] <name>")]
    Delete {
        #[arg(value_name = "name")]
        name: String,

        /// Delete even if profile was never merged, without asking.
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Debug, Clone, Subcommand)]
enum SecretCommand {
    /// Commit finding on line of file as is from now on.
    #[command(override_usage = "dotswitch secret allow [options] <file> <line>")]
    Allow(SecretTarget),

    /// Always redact finding on line of file, even if allowed.
    #[command(override_usage = "dotswitch secret protect [options] <file> <line>")]
    Protect(SecretTarget),

    /// Drop every decision about file.
    #[command(override_usage = "dotswitch secret forget <file>")]
    Forget {
        #[arg(value_name = "file")]
        file: PathBuf,
    },

    /// List standing decisions.
    #[command(override_usage = "dotswitch secret list")]
    List,
}

#[derive(Args, Clone, Debug)]
struct SecretTarget {
    /// Local file holding finding.
    #[arg(value_name = "file")]
    pub file: PathBuf,

    /// Line number of finding, starting at 1.
    #[arg(value_name = "line")]
    pub line: usize,

    /// Pattern name of finding, every pattern matching the line if omitted.
    #[arg(short, long, value_name = "name")]
    pub pattern: Option<String>,
}

#[derive(Debug, Clone, Subcommand)]
enum VarCommand {
    /// Set value of template variable.
    #[command(override_usage = "dotswitch var set <name> <value>")]
    Set {
        #[arg(value_name = "name")]
        name: String,
        #[arg(value_name = "value")]
        value: String,
    },

    /// Remove value of template variable.
    #[command(override_usage = "dotswitch var unset <name>")]
    Unset {
        #[arg(value_name = "name")]
        name: String,
    },

    /// List template variables.
    #[command(override_usage = "dotswitch var list")]
    List,
}

#[derive(Debug, Clone, Subcommand)]
enum VaultCommand {
    /// Remove orphaned and expired vault entries.
    #[command(override_usage = "dotswitch vault prune [options]")]
    Prune {
        /// Also remove entries older than this many days.
        #[arg(long, value_name = "days")]
        max_age_days: Option<u32>,
    },

    /// Show vault location and size.
    #[command(override_usage = "dotswitch vault status")]
    Status,
}

#[derive(Debug, Clone, Subcommand)]
enum BackupCommand {
    /// List snapshots, newest first.
    #[command(override_usage = "dotswitch backup list")]
    List,

    /// Copy files of snapshot back to where they came from.
    #[command(override_usage = "dotswitch backup restore <id>")]
    Restore {
        #[arg(value_name = "id")]
        id: String,
    },
}

/// Failures only the command line reports.
#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("no profile repository at {:?}, run `dotswitch init` first", .0.display())]
    NotInitialized(PathBuf),

    #[error("profile repository already exists at {:?}", .0.display())]
    AlreadyInitialized(PathBuf),

    #[error("cannot derive section name from {:?}, use --name", .0.display())]
    NoSectionName(PathBuf),

    #[error("{0} conflicts remain unresolved, run `dotswitch resolve`")]
    Unresolved(usize),

    #[error("audit found {0} secrets of high or critical severity")]
    AuditFailed(usize),

    #[error("{0} files could not be saved or deployed")]
    Incomplete(usize),

    #[error("{:?} is not tracked by any section", .0.display())]
    Untracked(PathBuf),

    #[error("line {line} of {:?} does not exist", path.display())]
    NoSuchLine { path: PathBuf, line: usize },

    #[error("no secret pattern matches line {line} of {:?}, use --pattern", path.display())]
    NoFinding { path: PathBuf, line: usize },

    #[error("operation aborted")]
    Aborted,
}

/// Everything a command needs, opened under the operation lock.
struct Context {
    store: Store,
    settings: Settings,
    lock: OperationLock,
}

impl Context {
    fn open() -> Result<Self> {
        let store = Store::locate()?;
        store.ensure()?;
        let lock = OperationLock::acquire(store.lock_path())?;
        let settings = store.settings()?;

        Ok(Self {
            store,
            settings,
            lock,
        })
    }

    fn vcs(&self) -> Result<Git2Vcs> {
        if !self.store.is_initialized() {
            return Err(CliError::NotInitialized(self.store.repo_dir()).into());
        }

        Ok(Git2Vcs::open(self.store.repo_dir())?.with_progress(ProgressBar::new(0)))
    }

    fn vault(&self) -> Result<RedactionVault> {
        let key = VaultKey::load_or_generate(self.store.vault_key_path())?;
        Ok(RedactionVault::open(self.store.vault_path(), key)?)
    }

    fn variables(&self) -> Result<VariableStore> {
        Ok(VariableStore::load(self.store.variables_path())?)
    }

    fn scanner(&self) -> Result<SecretScanner> {
        Ok(self.settings.scanner()?)
    }

    fn policy(&self) -> Result<SecretPolicy> {
        Ok(SecretPolicy::load(self.store.secret_policy_path())?)
    }

    fn vault_max_age(&self) -> Option<TimeDelta> {
        self.settings
            .vault_max_age_days
            .and_then(|days| TimeDelta::try_days(i64::from(days)))
    }
}

fn main() {
    let layer = fmt::layer().compact().with_target(false).without_time();
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    if let Err(error) = Cli::parse().run() {
        error!("{error:?}");
        exit(exit_code(&error));
    }

    exit(0)
}

/// Map failure class to process exit code.
fn exit_code(error: &anyhow::Error) -> i32 {
    for cause in error.chain() {
        if let Some(error) = cause.downcast_ref::<SwitchError>() {
            return error.exit_code();
        }

        if let Some(error) = cause.downcast_ref::<CliError>() {
            return match error {
                CliError::Unresolved(_) => 12,
                CliError::AuditFailed(_) => 50,
                CliError::Incomplete(_) => 6,
                _ => 1,
            };
        }

        if let Some(error) = cause.downcast_ref::<ConflictError>() {
            return match error {
                ConflictError::ResidualMarkers { .. } | ConflictError::Unclassifiable(_) => 12,
                ConflictError::Vcs(_) => 5,
                ConflictError::Read { .. } | ConflictError::Write { .. } => 6,
                ConflictError::Hook(_) => 1,
            };
        }

        if let Some(error) = cause.downcast_ref::<LockError>() {
            return match error {
                LockError::Locked { .. } => 11,
                LockError::Open { .. } => 6,
            };
        }

        if cause.is::<VcsError>() {
            return 5;
        }

        if cause.is::<ConfigError>() {
            return 7;
        }

        if cause.is::<SyncError>()
            || cause.is::<BackupError>()
            || cause.is::<StoreError>()
            || cause.is::<PolicyError>()
            || cause.is::<std::io::Error>()
        {
            return 6;
        }
    }

    1
}

fn run_init(opts: InitOptions) -> Result<()> {
    let ctx = Context::open()?;
    let repo_dir = ctx.store.repo_dir();
    if ctx.store.is_initialized() {
        return Err(CliError::AlreadyInitialized(repo_dir).into());
    }

    if let Some(url) = opts.remote {
        let vcs = Git2Vcs::clone(&url, &repo_dir, ProgressBar::new(0))?;
        if let Some(branch) = opts.branch {
            vcs.checkout(&branch, true)?;
        }
        info!("cloned profiles, active profile is {:?}", vcs.current_branch()?);
        return Ok(());
    }

    let branch = opts.branch.unwrap_or_else(|| "main".into());
    let vcs = Git2Vcs::init(&repo_dir, &branch)?;
    ProfileDefinition::default().save(vcs.work_dir())?;
    vcs.commit(&format!("Initialize profile '{branch}'"))?;
    info!("initialized profile {branch:?} at {:?}", repo_dir.display());

    Ok(())
}

fn run_add(opts: AddOptions) -> Result<()> {
    let ctx = Context::open()?;
    let vcs = ctx.vcs()?;

    let name = match opts.name {
        Some(name) => name,
        None => opts
            .path
            .file_name()
            .map(|name| name.to_string_lossy().trim_start_matches('.').to_string())
            .filter(|name| !name.is_empty())
            .ok_or_else(|| CliError::NoSectionName(opts.path.clone()))?,
    };

    let local_path = portable_path(&opts.path)?;
    let mut entry = SectionEntry::new(&local_path);
    entry.repo_path = opts.repo_path;
    entry.secrets_filter = opts.no_secrets_filter.then_some(false);
    entry.update_strategy = opts
        .strategy
        .as_deref()
        .map(str::parse::<DeployStrategy>)
        .transpose()?;
    entry.inherits = (!opts.inherits.is_empty()).then_some(Inherits::Many(opts.inherits));

    let mut definition = ProfileDefinition::load(vcs.work_dir())?;
    definition.add_section(&name, entry)?;

    // INVARIANT: Never write a definition that fails validation.
    let config = definition.resolve()?;
    if let Some(section) = config.section(&name) {
        if !section.local_path.exists() {
            warn!("{:?} does not exist yet", section.local_path.display());
        }
    }
    definition.save(vcs.work_dir())?;
    info!("track {:?} as section {name:?}, run `dotswitch save` to store it", local_path.display());

    Ok(())
}

/// Rewrite paths under home directory relative to `~`, so profiles stay
/// portable across machines.
fn portable_path(path: &Path) -> Result<PathBuf> {
    if path.starts_with("~") {
        return Ok(path.to_path_buf());
    }

    let absolute = absolute_path(path)?;
    let home = home_dir()?;
    Ok(match absolute.strip_prefix(&home) {
        Ok(rest) => Path::new("~").join(rest),
        Err(_) => absolute,
    })
}

fn absolute_path(path: &Path) -> Result<PathBuf> {
    if let Ok(rest) = path.strip_prefix("~") {
        return Ok(home_dir()?.join(rest));
    }

    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }

    Ok(std::env::current_dir()
        .context("failed to determine current directory")?
        .join(path))
}

fn run_status() -> Result<()> {
    let ctx = Context::open()?;
    let vcs = ctx.vcs()?;
    let profile = vcs.current_branch()?;
    let config = ProfileConfig::load(vcs.work_dir())?;
    let scanner = ctx.scanner()?;
    let policy = ctx.policy()?;
    let variables = ctx.variables()?;
    let mut vault = ctx.vault()?;

    info!("active profile {profile:?}");
    if vcs.is_dirty()? {
        warn!("repository has uncommitted changes");
    }

    let engine = FileSyncEngine::new(SyncContext {
        repo_root: vcs.work_dir(),
        profile: &profile,
        scanner: &scanner,
        policy: &policy,
        vault: &mut vault,
        variables: &variables,
    });

    let mut pending = 0;
    for section in &config.sections {
        let plan = engine.plan_save(section);
        for record in plan.records.iter().filter(|record| record.needs_save()) {
            pending += 1;
            match record.line_delta {
                Some(delta) => info!(
                    "{}: {:?} {:?} (+{} -{})",
                    section.name,
                    record.kind,
                    record.local_path.display(),
                    delta.inserted,
                    delta.deleted
                ),
                None => info!("{}: {:?} {:?}", section.name, record.kind, record.local_path.display()),
            }
        }

        for finding in &plan.findings {
            warn!("{}: {finding}", section.name);
        }

        for failure in &plan.failures {
            warn!("{}: {failure}", section.name);
        }
    }

    if pending == 0 {
        info!("nothing to save");
    }

    Ok(())
}

fn run_save(opts: SaveOptions) -> Result<()> {
    let ctx = Context::open()?;
    let vcs = ctx.vcs()?;
    let scanner = ctx.scanner()?;
    let policy = ctx.policy()?;
    let variables = ctx.variables()?;
    let mut vault = ctx.vault()?;
    let hooks = ShellHookRunner::default().in_dir(home_dir()?);

    let mut engine = BranchSwitchEngine::new(
        &ctx.lock,
        &vcs,
        Session {
            scanner: &scanner,
            policy: &policy,
            vault: &mut vault,
            variables: &variables,
            hooks: &hooks,
            backups: None,
            vault_max_age: ctx.vault_max_age(),
        },
    );
    let report = engine.save(opts.strict || ctx.settings.strict_mode)?;
    log_report(&report);

    match &report.commit {
        Some(commit) => info!("saved profile {:?} as {commit}", report.from),
        None => info!("profile {:?} is up to date", report.from),
    }

    ensure_complete(&report)
}

fn run_switch(opts: SwitchArgs) -> Result<()> {
    let ctx = Context::open()?;
    let vcs = ctx.vcs()?;
    let scanner = ctx.scanner()?;
    let policy = ctx.policy()?;
    let variables = ctx.variables()?;
    let mut vault = ctx.vault()?;
    let hooks = ShellHookRunner::default().in_dir(home_dir()?);
    let backups = BackupManager::new(ctx.store.backups_dir());

    let mut engine = BranchSwitchEngine::new(
        &ctx.lock,
        &vcs,
        Session {
            scanner: &scanner,
            policy: &policy,
            vault: &mut vault,
            variables: &variables,
            hooks: &hooks,
            backups: Some(&backups),
            vault_max_age: ctx.vault_max_age(),
        },
    );
    let report = engine.switch(
        &opts.profile,
        &SwitchOptions {
            dry_run: opts.dry_run,
            force: opts.force,
            backup: !opts.no_backup,
            strict: opts.strict || ctx.settings.strict_mode,
        },
    )?;

    if report.is_noop() {
        info!("already on profile {:?}", report.to);
        return Ok(());
    }

    log_report(&report);
    if report.dry_run.is_none() {
        info!("switched from {:?} to {:?}", report.from, report.to);
    }

    ensure_complete(&report)
}

fn run_deploy(opts: DeployArgs) -> Result<()> {
    let ctx = Context::open()?;
    let vcs = ctx.vcs()?;
    let scanner = ctx.scanner()?;
    let policy = ctx.policy()?;
    let variables = ctx.variables()?;
    let mut vault = ctx.vault()?;
    let hooks = ShellHookRunner::default().in_dir(home_dir()?);
    let backups = BackupManager::new(ctx.store.backups_dir());
    let strategy = opts
        .strategy
        .as_deref()
        .map(str::parse::<DeployStrategy>)
        .transpose()?;

    let mut engine = BranchSwitchEngine::new(
        &ctx.lock,
        &vcs,
        Session {
            scanner: &scanner,
            policy: &policy,
            vault: &mut vault,
            variables: &variables,
            hooks: &hooks,
            backups: Some(&backups),
            vault_max_age: None,
        },
    );
    let report = engine.deploy(
        &opts.profile,
        &DeployOptions {
            strategy,
            dry_run: opts.dry_run,
            backup: !opts.no_backup,
        },
    )?;
    log_report(&report);

    ensure_complete(&report)
}

/// Fail with filesystem exit code if single files were left behind.
fn ensure_complete(report: &SwitchReport) -> Result<()> {
    if report.exit_code() == 0 {
        return Ok(());
    }

    let count = report.save_failures.len() + report.deploy_failures().count();
    Err(CliError::Incomplete(count).into())
}

fn log_report(report: &SwitchReport) {
    if let Some(preview) = &report.dry_run {
        info!("dry run, nothing was changed");
        for path in &preview.pending_saves {
            info!("would save {:?}", path.display());
        }
        for finding in &preview.findings {
            warn!("would redact {finding}");
        }
        if preview.creates_branch {
            info!("would create profile {:?}", report.to);
        }
        for section in &preview.sections {
            info!("would deploy section {section:?}");
        }
        for path in &preview.pending_deploys {
            info!("would write {:?}", path.display());
        }
        return;
    }

    for saved in &report.saved {
        if !saved.written.is_empty() || !saved.removed.is_empty() {
            info!(
                "{}: saved {} files, removed {}, redacted {}",
                saved.section,
                saved.written.len(),
                saved.removed.len(),
                saved.redacted
            );
        }
    }

    for failure in &report.save_failures {
        warn!("not saved: {failure}");
    }

    if report.pruned > 0 {
        info!("pruned {} vault entries", report.pruned);
    }

    if let Some(backup) = &report.backup {
        info!("backed up {} files as {:?}", backup.files.len(), backup.id);
    }

    for outcome in &report.deployed {
        if !outcome.written.is_empty() {
            info!(
                "{}: deployed {} files ({}), restored {} secrets",
                outcome.section,
                outcome.written.len(),
                outcome.strategy,
                outcome.restored
            );
        }
        for preserved in &outcome.preserved {
            info!("{}: kept old copy at {:?}", outcome.section, preserved.display());
        }
        if outcome.skipped > 0 {
            info!("{}: left {} files untouched", outcome.section, outcome.skipped);
        }
    }

    for failure in report.deploy_failures() {
        warn!("not deployed: {failure}");
    }

    for failure in &report.hook_failures {
        warn!("{failure}");
    }

    for warning in report.warnings() {
        warn!("{warning}");
    }
}

fn run_audit(opts: AuditOptions) -> Result<()> {
    let ctx = Context::open()?;
    let vcs = ctx.vcs()?;
    let config = ProfileConfig::load(vcs.work_dir())?;
    let scanner = ctx.scanner()?;
    let policy = ctx.policy()?;
    let detector = ChangeDetector::new(vcs.work_dir());

    let mut findings: Vec<SecretFinding> = Vec::new();
    for section in &config.sections {
        for record in detector.compare(section)? {
            let record = match record {
                Ok(record) => record,
                Err(error) => {
                    warn!("{}: {error}", section.name);
                    continue;
                }
            };
            if record.kind == ChangeKind::Deleted {
                continue;
            }

            let content = match fs::read(&record.local_path) {
                Ok(content) => content,
                Err(error) => {
                    warn!("skip {:?}: {error}", record.local_path.display());
                    continue;
                }
            };
            if is_binary(&content) {
                continue;
            }

            let identity = file_identity(&record.local_path);
            for finding in policy.apply(&identity, &content, scanner.scan(&content)) {
                let finding = finding.with_path(&record.local_path);
                warn!("{}: {finding}", section.name);
                findings.push(finding);
            }
        }
    }

    let blocking = findings.iter().filter(|finding| finding.is_blocking()).count();
    info!("found {} secrets, {blocking} of high or critical severity", findings.len());
    if opts.strict && blocking > 0 {
        return Err(CliError::AuditFailed(blocking).into());
    }

    Ok(())
}

fn run_sync() -> Result<()> {
    let ctx = Context::open()?;
    let vcs = ctx.vcs()?;
    let profile = vcs.current_branch()?;

    if let Some(commit) = vcs.commit(&format!("Sync profile '{profile}'"))? {
        info!("committed pending changes as {commit}");
    }

    match vcs.pull()? {
        RemoteOutcome::UpToDate => info!("profile {profile:?} is up to date with remote"),
        RemoteOutcome::FastForward => info!("fast forwarded profile {profile:?}"),
        RemoteOutcome::Merged => info!("merged remote changes into profile {profile:?}"),
        RemoteOutcome::Conflict(paths) => {
            for path in &paths {
                warn!("conflict in {:?}", path.path.display());
            }
            return Err(CliError::Unresolved(paths.len()).into());
        }
    }

    vcs.push()?;
    info!("pushed profile {profile:?}");

    Ok(())
}

fn run_resolve(opts: ResolveOptions) -> Result<()> {
    let ctx = Context::open()?;
    let vcs = ctx.vcs()?;
    let resolver = ConflictResolver::new(&vcs);

    let conflicts: Vec<Conflict> = resolver
        .conflicts()?
        .into_iter()
        .filter(|conflict| opts.paths.is_empty() || opts.paths.contains(&conflict.path))
        .collect();
    if conflicts.is_empty() {
        info!("nothing to resolve");
    }

    for conflict in &conflicts {
        let resolution = match choose_resolution(&opts.side, conflict)? {
            Some(resolution) => resolution,
            None => {
                info!("leave {:?} unresolved", conflict.path.display());
                continue;
            }
        };

        match resolver.resolve(conflict, &resolution) {
            Ok(()) => info!("resolved {:?}", conflict.path.display()),
            Err(error @ ConflictError::ResidualMarkers { .. }) => warn!("{error}"),
            Err(error) => return Err(error.into()),
        }
    }

    let remaining = resolver.conflicts()?.len();
    if remaining > 0 {
        return Err(CliError::Unresolved(remaining).into());
    }

    let profile = vcs.current_branch()?;
    if let Some(commit) = vcs.commit(&format!("Resolve conflicts of '{profile}'"))? {
        info!("committed resolution as {commit}, run `dotswitch sync` to push it");
    }

    Ok(())
}

/// Resolution from flags, or asked interactively when no flag was given.
fn choose_resolution(side: &ResolveSide, conflict: &Conflict) -> Result<Option<Resolution>> {
    if side.local {
        return Ok(Some(Resolution::KeepLocal));
    }
    if side.remote {
        return Ok(Some(Resolution::KeepRemote));
    }
    if side.edit {
        return Ok(Some(Resolution::Edit {
            editor: default_editor(),
        }));
    }

    let choices = vec!["keep local", "keep remote", "edit", "skip"];
    let prompt = format!("{} ({})", conflict.path.display(), conflict.kind);
    let choice = Select::new(&prompt, choices).prompt()?;
    Ok(match choice {
        "keep local" => Some(Resolution::KeepLocal),
        "keep remote" => Some(Resolution::KeepRemote),
        "edit" => Some(Resolution::Edit {
            editor: default_editor(),
        }),
        _ => None,
    })
}

fn run_revert(opts: RevertOptions) -> Result<()> {
    let ctx = Context::open()?;
    let vcs = ctx.vcs()?;
    let profile = vcs.current_branch()?;
    let config = ProfileConfig::load(vcs.work_dir())?;
    let path = absolute_path(&opts.path)?;
    let section = config
        .sections
        .iter()
        .find(|section| path.starts_with(&section.local_path))
        .ok_or_else(|| CliError::Untracked(path.clone()))?;

    if !opts.force {
        let prompt = format!("Discard local changes to {:?}?", path.display());
        if !Confirm::new(&prompt).with_default(false).prompt()? {
            return Err(CliError::Aborted.into());
        }
    }

    let scanner = ctx.scanner()?;
    let policy = ctx.policy()?;
    let variables = ctx.variables()?;
    let mut vault = ctx.vault()?;
    let mut engine = FileSyncEngine::new(SyncContext {
        repo_root: vcs.work_dir(),
        profile: &profile,
        scanner: &scanner,
        policy: &policy,
        vault: &mut vault,
        variables: &variables,
    });

    if !opts.no_backup {
        let overwritten: Vec<PathBuf> = engine
            .plan_deploy(section, DeployStrategy::Replace)
            .writes
            .iter()
            .filter(|write| write.existed && write.local.starts_with(&path))
            .map(|write| write.local.clone())
            .collect();
        let backups = BackupManager::new(ctx.store.backups_dir());
        if let Some(record) = backups.create(&overwritten, &format!("revert {}", section.name))? {
            info!("backed up {} files as {:?}", record.files.len(), record.id);
        }
    }

    let outcome = engine.revert(section, &path);
    for written in &outcome.written {
        info!("reverted {:?}", written.display());
    }
    for warning in &outcome.warnings {
        warn!("{warning}");
    }
    for failure in &outcome.failures {
        warn!("not reverted: {failure}");
    }

    if !outcome.failures.is_empty() {
        return Err(CliError::Incomplete(outcome.failures.len()).into());
    }

    if outcome.written.is_empty() {
        info!("{:?} already matches profile {profile:?}", path.display());
    }

    Ok(())
}

fn run_branch(command: BranchCommand) -> Result<()> {
    let ctx = Context::open()?;
    let vcs = ctx.vcs()?;
    let current = vcs.current_branch()?;

    match command {
        BranchCommand::List => {
            for branch in vcs.branches()? {
                let marker = if branch == current { '*' } else { ' ' };
                info!("{marker} {branch}");
            }
        }
        BranchCommand::Delete { name, force } => {
            if !force {
                let prompt = format!("Delete profile {name:?}?");
                if !Confirm::new(&prompt).with_default(false).prompt()? {
                    return Err(CliError::Aborted.into());
                }
            }

            match vcs.delete_branch(&name, force) {
                Ok(()) => {}
                Err(VcsError::NotMerged(_)) => {
                    let prompt = format!("Profile {name:?} was never merged, delete anyway?");
                    if !Confirm::new(&prompt).with_default(false).prompt()? {
                        return Err(CliError::Aborted.into());
                    }
                    vcs.delete_branch(&name, true)?;
                }
                Err(error) => return Err(error.into()),
            }

            let mut vault = ctx.vault()?;
            let forgotten = vault.forget_profile(&name);
            if forgotten > 0 {
                vault.persist()?;
            }
            info!("deleted profile {name:?}, dropped {forgotten} vault entries");
        }
    }

    Ok(())
}

fn run_secret(command: SecretCommand) -> Result<()> {
    let ctx = Context::open()?;
    let mut policy = ctx.policy()?;

    match command {
        SecretCommand::Allow(target) => decide(&ctx, &mut policy, Decision::Allow, &target)?,
        SecretCommand::Protect(target) => decide(&ctx, &mut policy, Decision::Protect, &target)?,
        SecretCommand::Forget { file } => {
            let identity = file_identity(absolute_path(&file)?);
            let forgotten = policy.forget(&identity);
            policy.persist()?;
            info!("dropped {forgotten} decisions about {:?}", identity.display());
        }
        SecretCommand::List => {
            if policy.entries().is_empty() {
                info!("no standing decisions");
            }
            for entry in policy.entries() {
                info!(
                    "{}  {:?}  {}  {}",
                    entry.decision,
                    entry.file_path.display(),
                    entry.pattern_name,
                    entry.added_at.to_rfc3339()
                );
            }
        }
    }

    Ok(())
}

/// Record decision for every finding on target line.
fn decide(ctx: &Context, policy: &mut SecretPolicy, decision: Decision, target: &SecretTarget) -> Result<()> {
    let path = absolute_path(&target.file)?;
    let content = fs::read(&path).with_context(|| format!("failed to read {:?}", path.display()))?;
    let line = line_at(&content, target.line).ok_or_else(|| CliError::NoSuchLine {
        path: path.clone(),
        line: target.line,
    })?;

    let patterns: Vec<String> = match &target.pattern {
        Some(pattern) => vec![pattern.clone()],
        None => ctx
            .scanner()?
            .scan(line)
            .into_iter()
            .map(|finding| finding.pattern_name)
            .collect(),
    };
    if patterns.is_empty() {
        return Err(CliError::NoFinding {
            path,
            line: target.line,
        }
        .into());
    }

    let identity = file_identity(&path);
    let added = patterns
        .iter()
        .filter(|pattern| policy.add(decision, &identity, line, pattern))
        .count();
    policy.persist()?;
    info!("{decision} {added} findings on line {} of {:?}", target.line, path.display());

    Ok(())
}

fn run_var(command: VarCommand) -> Result<()> {
    let ctx = Context::open()?;
    let mut variables = ctx.variables()?;

    match command {
        VarCommand::Set { name, value } => {
            variables.set(&name, value);
            variables.persist()?;
            info!("set {name:?}");
        }
        VarCommand::Unset { name } => {
            if variables.unset(&name).is_none() {
                warn!("{name:?} has no value");
                return Ok(());
            }
            variables.persist()?;
            info!("unset {name:?}");
        }
        VarCommand::List => {
            for (name, value) in variables.iter() {
                info!("{name}={value}");
            }
        }
    }

    Ok(())
}

fn run_vault(command: VaultCommand) -> Result<()> {
    let ctx = Context::open()?;
    let mut vault = ctx.vault()?;

    match command {
        VaultCommand::Prune { max_age_days } => {
            let vcs = ctx.vcs()?;
            let profile = vcs.current_branch()?;
            let config = ProfileConfig::load(vcs.work_dir())?;
            let roots = config.local_roots();

            let mut pruned = vault.prune(PruneRule::Orphaned {
                profile: &profile,
                roots: &roots,
            });
            let age = max_age_days
                .and_then(|days| TimeDelta::try_days(i64::from(days)))
                .or_else(|| ctx.vault_max_age());
            if let Some(age) = age {
                pruned += vault.prune(PruneRule::OlderThan(age));
            }

            vault.persist()?;
            info!("pruned {pruned} vault entries, {} left", vault.len());
        }
        VaultCommand::Status => {
            info!("vault at {:?} holds {} entries", vault.path().display(), vault.len());
        }
    }

    Ok(())
}

fn run_backup(command: BackupCommand) -> Result<()> {
    let ctx = Context::open()?;
    let backups = BackupManager::new(ctx.store.backups_dir());

    match command {
        BackupCommand::List => {
            let records = backups.list()?;
            if records.is_empty() {
                info!("no backups");
            }
            for record in records {
                info!(
                    "{}  {}  {} files  {}",
                    record.id,
                    record.created_at.to_rfc3339(),
                    record.files.len(),
                    record.note
                );
            }
        }
        BackupCommand::Restore { id } => {
            for path in backups.restore(&id)? {
                info!("restored {:?}", path.display());
            }
        }
    }

    Ok(())
}
