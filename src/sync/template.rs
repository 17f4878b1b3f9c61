// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Template variables.
//!
//! Sections may declare variable names in `template_vars`. On deploy, every
//! `{{NAME}}` or `{{NAME:default}}` placeholder of a declared name is replaced
//! from the [`VariableStore`]. Placeholders of undeclared names are never
//! touched.
//!
//! Saving goes the other way. Lines of the local file that still equal the
//! rendering of a repository line are saved as that repository line, so
//! placeholders survive a deploy and save cycle and machine specific values
//! never reach the repository.

use crate::sync::atomic::write_atomic;

use regex::{Captures, Regex};
use similar::{capture_diff_slices, Algorithm, DiffOp};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::LazyLock,
};

static PLACEHOLDER: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*(?::([^}]*))?\}\}").ok()
});

/// Persistent store of template variable values.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VariableStore {
    path: Option<PathBuf>,
    values: BTreeMap<String, String>,
}

impl VariableStore {
    /// Load store from JSON document, missing document yields empty store.
    ///
    /// # Errors
    ///
    /// - Return [`TemplateError::Read`] if document cannot be read.
    /// - Return [`TemplateError::Parse`] if document is not a string map.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let values = if path.exists() {
            let data = fs::read(&path).map_err(|source| TemplateError::Read {
                source,
                path: path.clone(),
            })?;
            serde_json::from_slice(&data).map_err(|source| TemplateError::Parse {
                source,
                path: path.clone(),
            })?
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path: Some(path),
            values,
        })
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn unset(&mut self, name: &str) -> Option<String> {
        self.values.remove(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    /// Write store back to where it was loaded from.
    ///
    /// # Errors
    ///
    /// - Return [`TemplateError::Write`] if document cannot be written.
    pub fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let data = serde_json::to_vec_pretty(&self.values)?;
        write_atomic(path, &data).map_err(|source| TemplateError::Write {
            source,
            path: path.clone(),
        })
    }
}

impl<K, V> FromIterator<(K, V)> for VariableStore
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            path: None,
            values: iter
                .into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
        }
    }
}

/// Result of substituting placeholders.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Substitution {
    pub content: String,

    /// Declared names left as literal placeholders.
    pub unresolved: Vec<String>,
}

/// Substitute placeholders of declared names.
pub fn substitute(content: &str, declared: &[String], variables: &VariableStore) -> Substitution {
    let mut unresolved: Vec<String> = Vec::new();
    let Some(placeholder) = PLACEHOLDER.as_ref() else {
        return Substitution {
            content: content.to_string(),
            unresolved,
        };
    };

    let content = placeholder
        .replace_all(content, |captures: &Captures<'_>| {
            let literal = captures[0].to_string();
            let name = &captures[1];
            if !declared.iter().any(|declared| declared == name) {
                return literal;
            }

            match (variables.get(name), captures.get(2)) {
                (Some(value), _) => value.to_string(),
                (None, Some(default)) => default.as_str().trim().to_string(),
                (None, None) => {
                    if !unresolved.iter().any(|seen| seen == name) {
                        unresolved.push(name.to_string());
                    }
                    literal
                }
            }
        })
        .into_owned();

    Substitution {
        content,
        unresolved,
    }
}

/// Carry placeholders of template over into rendered content.
///
/// Lines of `rendered` equal to the rendering of a `template` line become that
/// template line again. Every other line is kept as the user wrote it.
pub fn restore_placeholders(
    template: &str,
    rendered: &str,
    declared: &[String],
    variables: &VariableStore,
) -> String {
    let template: Vec<&str> = template.split_inclusive('\n').collect();
    let expected: Vec<String> = template
        .iter()
        .map(|line| substitute(line, declared, variables).content)
        .collect();
    let expected: Vec<&str> = expected.iter().map(String::as_str).collect();
    let local: Vec<&str> = rendered.split_inclusive('\n').collect();

    let mut output = String::with_capacity(rendered.len());
    for op in capture_diff_slices(Algorithm::Myers, &expected, &local) {
        let lines = match op {
            DiffOp::Equal { old_index, len, .. } => &template[old_index..old_index + len],
            DiffOp::Delete { .. } => continue,
            DiffOp::Insert {
                new_index, new_len, ..
            }
            | DiffOp::Replace {
                new_index, new_len, ..
            } => &local[new_index..new_index + new_len],
        };
        lines.iter().for_each(|line| output.push_str(line));
    }

    output
}

/// Template variable error types.
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("failed to read variables at {:?}", path.display())]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    #[error("failed to write variables at {:?}", path.display())]
    Write {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    #[error("variables at {:?} are not a string map", path.display())]
    Parse {
        #[source]
        source: serde_json::Error,
        path: PathBuf,
    },

    #[error(transparent)]
    Serialize(#[from] serde_json::Error),
}

impl TemplateError {
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Read { path, .. } | Self::Write { path, .. } | Self::Parse { path, .. } => {
                Some(path)
            }
            Self::Serialize(_) => None,
        }
    }
}

/// Friendly result alias :3
type Result<T, E = TemplateError> = std::result::Result<T, E>;
