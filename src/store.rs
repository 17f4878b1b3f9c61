// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Data directory management.
//!
//! Everything dotswitch keeps outside of the user's tracked files lives in one
//! __data directory__, `$XDG_DATA_HOME/dotswitch` by default. Setting
//! `DOTSWITCH_DIR` points it somewhere else.
//!
//! # Data Directory Layout
//!
//! ```text
//! dotswitch/
//! ├── repo/             profile repository, one branch per profile
//! ├── settings.toml     store wide settings
//! ├── vault.json        encrypted redaction vault
//! ├── vault.key         vault key, never leaves this directory
//! ├── variables.json    template variable values
//! ├── secret-policy.json allowed and protected findings
//! ├── backups/          safety snapshots
//! └── dotswitch.lock    operation lock
//! ```
//!
//! The vault, its key, and the variables deliberately live next to the
//! repository rather than inside it, so nothing secret is ever committed.

use crate::{
    path::{default_data_dir, NoWayHome},
    scan::{CustomPattern, ScanError, SecretScanner},
    sync::atomic::write_atomic,
};

use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::debug;

/// Environment variable overriding data directory location.
pub const DATA_DIR_ENV: &str = "DOTSWITCH_DIR";

/// Layout of the data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Store {
    root: PathBuf,
}

impl Store {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Locate data directory from environment, or default XDG location.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::NoWayHome`] if home directory is unknown.
    pub fn locate() -> Result<Self> {
        match std::env::var_os(DATA_DIR_ENV) {
            Some(root) if !root.is_empty() => Ok(Self::new(root)),
            _ => Ok(Self::new(default_data_dir()?)),
        }
    }

    /// Create data directory if missing.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::Write`] if directory cannot be created.
    pub fn ensure(&self) -> Result<()> {
        fs::create_dir_all(&self.root).map_err(|source| StoreError::Write {
            source,
            path: self.root.clone(),
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.root, fs::Permissions::from_mode(0o700)).map_err(
                |source| StoreError::Write {
                    source,
                    path: self.root.clone(),
                },
            )?;
        }

        Ok(())
    }

    /// Check whether a profile repository was set up.
    pub fn is_initialized(&self) -> bool {
        self.repo_dir().join(".git").exists()
    }

    /// Load settings, missing file yields defaults.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::Read`] if settings file cannot be read.
    /// - Return [`StoreError::Settings`] if settings file is invalid.
    pub fn settings(&self) -> Result<Settings> {
        let path = self.settings_path();
        let data = match fs::read_to_string(&path) {
            Ok(data) => data,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                debug!("no settings at {:?}, use defaults", path.display());
                return Ok(Settings::default());
            }
            Err(source) => return Err(StoreError::Read { source, path }),
        };

        toml::from_str(&data).map_err(|source| StoreError::Settings { source, path })
    }

    /// Write settings.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::Write`] if settings file cannot be written.
    pub fn save_settings(&self, settings: &Settings) -> Result<()> {
        let path = self.settings_path();
        write_atomic(&path, settings.to_string().as_bytes())
            .map_err(|source| StoreError::Write { source, path })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn repo_dir(&self) -> PathBuf {
        self.root.join("repo")
    }

    pub fn settings_path(&self) -> PathBuf {
        self.root.join("settings.toml")
    }

    pub fn vault_path(&self) -> PathBuf {
        self.root.join("vault.json")
    }

    pub fn vault_key_path(&self) -> PathBuf {
        self.root.join("vault.key")
    }

    pub fn variables_path(&self) -> PathBuf {
        self.root.join("variables.json")
    }

    pub fn secret_policy_path(&self) -> PathBuf {
        self.root.join("secret-policy.json")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.root.join("backups")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join("dotswitch.lock")
    }
}

/// Store wide settings.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Abort saves on high severity findings instead of redacting them.
    #[serde(default)]
    pub strict_mode: bool,

    /// Age after which vault entries are pruned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vault_max_age_days: Option<u32>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secret_patterns: Vec<CustomPattern>,
}

impl Settings {
    /// Build scanner with built-in and custom patterns.
    ///
    /// # Errors
    ///
    /// - Return [`ScanError::PatternCompilation`] if a custom pattern is invalid.
    pub fn scanner(&self) -> Result<SecretScanner, ScanError> {
        SecretScanner::with_custom(&self.secret_patterns)
    }
}

impl FromStr for Settings {
    type Err = toml::de::Error;

    fn from_str(data: &str) -> std::result::Result<Self, Self::Err> {
        toml::from_str(data)
    }
}

impl Display for Settings {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        let data = toml::to_string(self).map_err(|_| std::fmt::Error)?;
        fmt.write_str(&data)
    }
}

/// Data directory error types.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    NoWayHome(#[from] NoWayHome),

    #[error("failed to read {:?}", path.display())]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    #[error("failed to write {:?}", path.display())]
    Write {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    #[error("invalid settings at {:?}", path.display())]
    Settings {
        #[source]
        source: toml::de::Error,
        path: PathBuf,
    },
}

/// Friendly result alias :3
type Result<T, E = StoreError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::Severity;
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;

    #[sealed_test(env = [("DOTSWITCH_DIR", "/tmp/dotswitch-data")])]
    fn locate_honors_environment() -> anyhow::Result<()> {
        let store = Store::locate()?;
        assert_eq!(store.root(), Path::new("/tmp/dotswitch-data"));
        assert_eq!(store.lock_path(), PathBuf::from("/tmp/dotswitch-data/dotswitch.lock"));

        Ok(())
    }

    #[test]
    fn settings_parse_custom_patterns() -> anyhow::Result<()> {
        let settings: Settings = indoc! {r#"
            strict_mode = true
            vault_max_age_days = 30

            [[secret_patterns]]
            name = "Internal Token"
            regex = "itk_[a-z0-9]{16}"
            severity = "high"
        "#}
        .parse()?;

        assert!(settings.strict_mode);
        assert_eq!(settings.vault_max_age_days, Some(30));
        assert_eq!(settings.secret_patterns[0].severity, Severity::High);

        let scanner = settings.scanner()?;
        let findings = scanner.scan(b"token itk_0123456789abcdef\n");
        assert!(findings.iter().any(|finding| finding.pattern_name == "Internal Token"));

        Ok(())
    }

    #[test]
    fn missing_settings_are_default() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = Store::new(dir.path());
        assert_eq!(store.settings()?, Settings::default());

        let settings = Settings {
            strict_mode: true,
            ..Default::default()
        };
        store.save_settings(&settings)?;
        assert_eq!(store.settings()?, settings);

        Ok(())
    }

    #[test]
    fn unknown_settings_rejected() {
        assert!("strict = true".parse::<Settings>().is_err());
    }
}
