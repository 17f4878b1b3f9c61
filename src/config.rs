// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Profile configuration layout.
//!
//! Every profile branch carries a `dotswitch.toml` file at the top-level of
//! the repository. This file lists the __sections__ of the profile: each
//! section maps one local path (file or directory) to a location inside the
//! repository, together with the policy used to save and deploy it.
//!
//! # General Layout
//!
//! ```toml
//! [defaults]
//! secrets_filter = true
//! update_strategy = "replace"
//!
//! [templates.shell]
//! update_strategy = "rename_old"
//! post_deploy = "echo deployed"
//!
//! [bashrc]
//! local_path = "~/.bashrc"
//! repo_path = "shell/bashrc"
//! inherits = "shell"
//! template_vars = "EMAIL, HOST"
//! ```
//!
//! Tables under `templates` hold shared policy that sections pull in through
//! `inherits`, either one name or a list. Settings of the section itself win,
//! then templates from last listed to first, then `defaults`.
//!
//! The raw document is modeled by [`ProfileDefinition`], which serializes and
//! deserializes losslessly. Resolving a definition into a [`ProfileConfig`]
//! performs shell expansion, applies templates and defaults, and validates the
//! mapping as a whole. Configuration is parsed fresh on every invocation.

use crate::{
    diff::filter::SectionFilter,
    path::is_contained_relative,
    sync::atomic::write_atomic,
};

use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    fs::read_to_string,
    path::{Component, Path, PathBuf},
    str::FromStr,
};
use tracing::{debug, instrument, warn};

/// Name of profile configuration file at the top-level of the repository.
pub const CONFIG_FILE_NAME: &str = "dotswitch.toml";

/// Raw profile configuration document.
///
/// Keeps the exact shape of the configuration file. Use
/// [`ProfileDefinition::resolve`] to obtain validated sections.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct ProfileDefinition {
    /// Default policy inherited by every section.
    #[serde(default)]
    pub defaults: Defaults,

    /// Named policy bundles sections can inherit.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub templates: BTreeMap<String, SectionTemplate>,

    /// Section entries keyed by section name.
    #[serde(flatten)]
    pub sections: BTreeMap<String, SectionEntry>,
}

impl ProfileDefinition {
    /// Add new section entry.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::DuplicateSection`] if section name is taken.
    pub fn add_section(&mut self, name: impl Into<String>, entry: SectionEntry) -> Result<()> {
        let name = name.into();
        if name == "defaults" || name == "templates" || self.sections.contains_key(&name) {
            return Err(ConfigError::DuplicateSection(name));
        }

        self.sections.insert(name, entry);
        Ok(())
    }

    /// Read definition from repository top-level.
    ///
    /// A missing configuration file yields an empty definition, because a
    /// freshly created profile has nothing tracked yet.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::Read`] if file exists but cannot be read.
    /// - Return [`ConfigError::Deserialize`] if file content is invalid.
    pub fn load(repo_root: impl AsRef<Path>) -> Result<Self> {
        let path = repo_root.as_ref().join(CONFIG_FILE_NAME);
        if !path.exists() {
            warn!("no {CONFIG_FILE_NAME} in {:?}, profile tracks nothing", repo_root.as_ref().display());
            return Ok(Self::default());
        }

        read_to_string(&path)
            .map_err(|source| ConfigError::Read { source, path })?
            .parse()
    }

    /// Write definition to repository top-level.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::Serialize`] if definition cannot be rendered.
    /// - Return [`ConfigError::Write`] if file cannot be written.
    pub fn save(&self, repo_root: impl AsRef<Path>) -> Result<()> {
        let path = repo_root.as_ref().join(CONFIG_FILE_NAME);
        let content = toml::ser::to_string_pretty(self)?;
        write_atomic(&path, content.as_bytes()).map_err(|source| ConfigError::Write { source, path })
    }

    /// Resolve raw definition into validated profile configuration.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::ShellExpansion`] if a local path cannot be
    ///   expanded.
    /// - Return [`ConfigError::RelativeLocalPath`] if a local path is not
    ///   absolute after expansion.
    /// - Return [`ConfigError::InvalidRepoPath`] or
    ///   [`ConfigError::ReservedRepoPath`] for unusable repository paths.
    /// - Return [`ConfigError::DuplicateRepoPath`] or
    ///   [`ConfigError::NestedRepoPath`] for ambiguous mappings.
    /// - Return [`ConfigError::Pattern`] for invalid include/exclude rules.
    /// - Return [`ConfigError::UnknownTemplate`] if a section inherits a
    ///   template that does not exist.
    #[instrument(skip(self), level = "debug")]
    pub fn resolve(&self) -> Result<ProfileConfig> {
        let mut sections = Vec::with_capacity(self.sections.len());
        for (name, entry) in &self.sections {
            let entry = self.inherit(name, entry)?;
            sections.push(resolve_section(name, &entry, &self.defaults)?);
        }

        // INVARIANT: Repository paths are unique and never nested in each other.
        for (index, first) in sections.iter().enumerate() {
            for second in &sections[index + 1..] {
                if first.repo_path == second.repo_path {
                    return Err(ConfigError::DuplicateRepoPath {
                        path: first.repo_path.clone(),
                        first: first.name.clone(),
                        second: second.name.clone(),
                    });
                }

                if first.repo_path.starts_with(&second.repo_path)
                    || second.repo_path.starts_with(&first.repo_path)
                {
                    return Err(ConfigError::NestedRepoPath {
                        first: first.name.clone(),
                        second: second.name.clone(),
                    });
                }
            }
        }

        debug!("resolved {} sections", sections.len());
        Ok(ProfileConfig {
            defaults: self.defaults.clone(),
            sections,
        })
    }

    /// Copy of entry with unset fields taken from its templates.
    fn inherit(&self, name: &str, entry: &SectionEntry) -> Result<SectionEntry> {
        let mut merged = entry.clone();
        let names = entry.inherits.as_ref().map(Inherits::names).unwrap_or_default();
        for template in names.iter().rev() {
            let found = self.templates.get(template).ok_or_else(|| ConfigError::UnknownTemplate {
                section: name.to_string(),
                template: template.clone(),
            })?;
            found.fill(&mut merged);
        }

        Ok(merged)
    }
}

impl FromStr for ProfileDefinition {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        toml::de::from_str(data).map_err(ConfigError::Deserialize)
    }
}

impl Display for ProfileDefinition {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string_pretty(self)
                .map_err(ConfigError::Serialize)?
                .as_str(),
        )
    }
}

/// Default policy for sections that do not override it.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Defaults {
    /// Scan and redact secrets on save.
    #[serde(default = "enabled")]
    pub secrets_filter: bool,

    /// How deployed files treat existing destinations.
    #[serde(default)]
    pub update_strategy: DeployStrategy,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            secrets_filter: true,
            update_strategy: DeployStrategy::default(),
        }
    }
}

fn enabled() -> bool {
    true
}

/// Raw section entry.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SectionEntry {
    /// Local file or directory, before shell expansion.
    pub local_path: PathBuf,

    /// Location inside repository.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_path: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secrets_filter: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_strategy: Option<DeployStrategy>,

    /// Template variable names used by section content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_vars: Option<TemplateVars>,

    /// Shell command to run before section is deployed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_deploy: Option<String>,

    /// Shell command to run after section is deployed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_deploy: Option<String>,

    /// Gitignore style rules selecting tracked files of a directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include: Option<Vec<String>>,

    /// Gitignore style rules excluding files of a directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude: Option<Vec<String>>,

    /// Templates to take unset policy from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inherits: Option<Inherits>,
}

impl SectionEntry {
    /// Construct new entry for local path with inherited policy.
    pub fn new(local_path: impl Into<PathBuf>) -> Self {
        Self {
            local_path: local_path.into(),
            ..Default::default()
        }
    }
}

/// Shared section policy, everything but the paths.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SectionTemplate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secrets_filter: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_strategy: Option<DeployStrategy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_vars: Option<TemplateVars>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_deploy: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_deploy: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude: Option<Vec<String>>,
}

impl SectionTemplate {
    fn fill(&self, entry: &mut SectionEntry) {
        fill(&mut entry.secrets_filter, &self.secrets_filter);
        fill(&mut entry.update_strategy, &self.update_strategy);
        fill(&mut entry.template_vars, &self.template_vars);
        fill(&mut entry.pre_deploy, &self.pre_deploy);
        fill(&mut entry.post_deploy, &self.post_deploy);
        fill(&mut entry.include, &self.include);
        fill(&mut entry.exclude, &self.exclude);
    }
}

fn fill<T: Clone>(field: &mut Option<T>, from: &Option<T>) {
    if field.is_none() {
        field.clone_from(from);
    }
}

/// Template names a section inherits, one name or a list.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Inherits {
    One(String),
    Many(Vec<String>),
}

impl Inherits {
    pub fn names(&self) -> Vec<String> {
        match self {
            Self::One(name) => vec![name.clone()],
            Self::Many(names) => names.clone(),
        }
    }
}

/// Template variable listing.
///
/// Accepts either a comma separated string or an array of names.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum TemplateVars {
    Listing(Vec<String>),
    Csv(String),
}

impl TemplateVars {
    /// Ordered variable names without blanks or duplicates.
    pub fn names(&self) -> Vec<String> {
        let raw: Vec<&str> = match self {
            Self::Listing(names) => names.iter().map(String::as_str).collect(),
            Self::Csv(names) => names.split(',').collect(),
        };

        let mut names: Vec<String> = Vec::new();
        for name in raw.into_iter().map(str::trim).filter(|name| !name.is_empty()) {
            if !names.iter().any(|seen| seen == name) {
                names.push(name.to_string());
            }
        }

        names
    }
}

/// Strategy used to deploy a section onto existing local files.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum DeployStrategy {
    /// Overwrite destination.
    #[default]
    #[serde(rename = "replace")]
    Replace,

    /// Move destination aside to `<path>.old` before writing.
    #[serde(rename = "rename_old", alias = "preserve_old")]
    PreserveOld,

    /// Leave destination untouched.
    #[serde(rename = "ignore", alias = "skip")]
    Skip,
}

impl FromStr for DeployStrategy {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        match data {
            "replace" => Ok(Self::Replace),
            "rename_old" | "preserve_old" | "preserveOld" | "preserve-old" => Ok(Self::PreserveOld),
            "ignore" | "skip" => Ok(Self::Skip),
            _ => Err(ConfigError::UnknownStrategy(data.to_string())),
        }
    }
}

impl Display for DeployStrategy {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Replace => fmt.write_str("replace"),
            Self::PreserveOld => fmt.write_str("rename_old"),
            Self::Skip => fmt.write_str("ignore"),
        }
    }
}

/// Validated profile configuration.
#[derive(Default, Debug, PartialEq, Eq, Clone)]
pub struct ProfileConfig {
    pub defaults: Defaults,
    pub sections: Vec<TrackedSection>,
}

impl ProfileConfig {
    /// Load and resolve configuration from repository top-level.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError`] if reading, parsing, or validation fails.
    pub fn load(repo_root: impl AsRef<Path>) -> Result<Self> {
        ProfileDefinition::load(repo_root)?.resolve()
    }

    /// Find section by name.
    pub fn section(&self, name: impl AsRef<str>) -> Option<&TrackedSection> {
        self.sections.iter().find(|section| section.name == name.as_ref())
    }

    /// Local paths of every section.
    pub fn local_roots(&self) -> Vec<PathBuf> {
        self.sections
            .iter()
            .map(|section| section.local_path.clone())
            .collect()
    }
}

impl FromStr for ProfileConfig {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        data.parse::<ProfileDefinition>()?.resolve()
    }
}

/// One tracked local path and its policy.
#[derive(Default, Debug, PartialEq, Eq, Clone)]
pub struct TrackedSection {
    pub name: String,
    pub local_path: PathBuf,
    pub repo_path: PathBuf,
    pub redaction_enabled: bool,
    pub deploy_strategy: DeployStrategy,
    pub template_variables: Vec<String>,
    pub hooks: Hooks,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl TrackedSection {
    /// Build include/exclude filter for section.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::Pattern`] if a rule is invalid.
    pub fn filter(&self) -> Result<SectionFilter> {
        SectionFilter::new(&self.local_path, &self.include, &self.exclude).map_err(|source| {
            ConfigError::Pattern {
                section: self.name.clone(),
                source,
            }
        })
    }
}

/// Deploy hooks of a section.
#[derive(Default, Debug, PartialEq, Eq, Clone)]
pub struct Hooks {
    pub pre_deploy: Option<String>,
    pub post_deploy: Option<String>,
}

impl Hooks {
    pub fn is_empty(&self) -> bool {
        self.pre_deploy.is_none() && self.post_deploy.is_none()
    }
}

fn resolve_section(name: &str, entry: &SectionEntry, defaults: &Defaults) -> Result<TrackedSection> {
    // INVARIANT: Perform shell expansion on local path field.
    let local_path = PathBuf::from(
        shellexpand::full(entry.local_path.to_string_lossy().as_ref())
            .map_err(|source| ConfigError::ShellExpansion {
                section: name.to_string(),
                source,
            })?
            .into_owned(),
    );
    if !local_path.is_absolute() {
        return Err(ConfigError::RelativeLocalPath {
            section: name.to_string(),
            path: local_path,
        });
    }

    let repo_path = match &entry.repo_path {
        Some(path) => path.clone(),
        None => local_path.file_name().map(PathBuf::from).unwrap_or_default(),
    };
    if !is_contained_relative(&repo_path) {
        return Err(ConfigError::InvalidRepoPath {
            section: name.to_string(),
            path: repo_path,
        });
    }

    // INVARIANT: Normalize away `./` components.
    let repo_path: PathBuf = repo_path
        .components()
        .filter(|component| matches!(component, Component::Normal(_)))
        .collect();
    if repo_path.as_os_str().is_empty()
        || repo_path.starts_with(".git")
        || repo_path == Path::new(CONFIG_FILE_NAME)
    {
        return Err(ConfigError::ReservedRepoPath {
            section: name.to_string(),
            path: repo_path,
        });
    }

    let section = TrackedSection {
        name: name.to_string(),
        local_path,
        repo_path,
        redaction_enabled: entry.secrets_filter.unwrap_or(defaults.secrets_filter),
        deploy_strategy: entry.update_strategy.unwrap_or(defaults.update_strategy),
        template_variables: entry
            .template_vars
            .as_ref()
            .map(TemplateVars::names)
            .unwrap_or_default(),
        hooks: Hooks {
            pre_deploy: entry.pre_deploy.clone(),
            post_deploy: entry.post_deploy.clone(),
        },
        include: entry.include.clone().unwrap_or_default(),
        exclude: entry.exclude.clone().unwrap_or_default(),
    };

    // INVARIANT: Filter rules must compile at load time.
    section.filter()?;

    Ok(section)
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to deserialize configuration.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Failed to serialize configuration.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    /// Failed to perform shell expansion on local path of section.
    #[error("failed to expand local path of section {section:?}")]
    ShellExpansion {
        section: String,
        #[source]
        source: shellexpand::LookupError<std::env::VarError>,
    },

    #[error("failed to read configuration at {:?}", path.display())]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    #[error("failed to write configuration at {:?}", path.display())]
    Write {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Local path is not absolute after expansion.
    #[error("section {section:?} has relative local path {:?}", path.display())]
    RelativeLocalPath { section: String, path: PathBuf },

    /// Repository path is absolute, empty, or climbs out of repository.
    #[error("section {section:?} has invalid repo path {:?}", path.display())]
    InvalidRepoPath { section: String, path: PathBuf },

    /// Repository path collides with repository internals.
    #[error("section {section:?} uses reserved repo path {:?}", path.display())]
    ReservedRepoPath { section: String, path: PathBuf },

    /// Two sections map to same repository path.
    #[error("sections {first:?} and {second:?} both map to repo path {:?}", path.display())]
    DuplicateRepoPath {
        path: PathBuf,
        first: String,
        second: String,
    },

    /// One section repository path lives inside another.
    #[error("sections {first:?} and {second:?} have nested repo paths")]
    NestedRepoPath { first: String, second: String },

    /// Include or exclude rule does not compile.
    #[error("section {section:?} has invalid filter rule")]
    Pattern {
        section: String,
        #[source]
        source: ignore::Error,
    },

    #[error("unknown update strategy {0:?}, expected replace, rename_old, or ignore")]
    UnknownStrategy(String),

    #[error("section {0:?} already exists")]
    DuplicateSection(String),

    #[error("section {section:?} inherits unknown template {template:?}")]
    UnknownTemplate { section: String, template: String },
}

impl From<ConfigError> for FmtError {
    fn from(_: ConfigError) -> Self {
        FmtError
    }
}

/// Friendly result alias :3
type Result<T, E = ConfigError> = std::result::Result<T, E>;
