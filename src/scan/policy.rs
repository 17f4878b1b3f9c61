// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Standing decisions about single findings.
//!
//! Not every finding is a secret. Users can __allow__ a finding, which keeps
//! it out of redaction and strict mode from then on, or __protect__ one, which
//! keeps it redacted even if it was also allowed. Entries identify a finding
//! by local file, pattern name, and the SHA-256 of the line it sits on. The
//! line itself is never stored, so editing the line drops the decision.

use crate::{scan::SecretFinding, sync::atomic::write_atomic};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, info};

/// Which list an entry belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Commit finding as is.
    Allow,

    /// Always redact finding.
    Protect,
}

impl Display for Decision {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Allow => fmt.write_str("allow"),
            Self::Protect => fmt.write_str("protect"),
        }
    }
}

/// One standing decision.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct PolicyEntry {
    pub decision: Decision,
    pub file_path: PathBuf,
    pub pattern_name: String,
    pub line_hash: String,
    pub added_at: DateTime<Utc>,
}

impl PolicyEntry {
    fn matches(&self, file: &Path, line_hash: &str, pattern_name: &str) -> bool {
        self.file_path == file && self.line_hash == line_hash && self.pattern_name == pattern_name
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct PolicyDocument {
    #[serde(default)]
    entries: Vec<PolicyEntry>,
}

/// Allow and protect lists, kept in the data directory.
#[derive(Debug, Default)]
pub struct SecretPolicy {
    path: Option<PathBuf>,
    document: PolicyDocument,
}

impl SecretPolicy {
    /// Load policy document, missing document yields empty policy.
    ///
    /// # Errors
    ///
    /// - Return [`PolicyError::Read`] if document cannot be read.
    /// - Return [`PolicyError::Parse`] if document is invalid.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let document = match fs::read(&path) {
            Ok(data) => serde_json::from_slice(&data).map_err(|source| PolicyError::Parse {
                source,
                path: path.clone(),
            })?,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                debug!("no secret policy at {:?}", path.display());
                PolicyDocument::default()
            }
            Err(source) => return Err(PolicyError::Read { source, path }),
        };

        Ok(Self {
            path: Some(path),
            document,
        })
    }

    /// Record decision for finding on given line of file.
    ///
    /// Return `false` if the same decision already exists.
    pub fn add(&mut self, decision: Decision, file: &Path, line: &[u8], pattern_name: &str) -> bool {
        let hash = line_hash(line);
        let exists = self.document.entries.iter().any(|entry| {
            entry.decision == decision && entry.matches(file, &hash, pattern_name)
        });
        if exists {
            return false;
        }

        info!("{decision} {pattern_name:?} in {:?}", file.display());
        self.document.entries.push(PolicyEntry {
            decision,
            file_path: file.to_path_buf(),
            pattern_name: pattern_name.into(),
            line_hash: hash,
            added_at: Utc::now(),
        });
        true
    }

    /// Drop every decision about a file, return how many went.
    pub fn forget(&mut self, file: &Path) -> usize {
        let before = self.document.entries.len();
        self.document.entries.retain(|entry| entry.file_path != file);
        before - self.document.entries.len()
    }

    pub fn entries(&self) -> &[PolicyEntry] {
        &self.document.entries
    }

    /// Check whether finding on line of file may be committed unredacted.
    ///
    /// Protection wins over allowance.
    pub fn is_allowed(&self, file: &Path, line: &[u8], pattern_name: &str) -> bool {
        let hash = line_hash(line);
        let mut allowed = false;
        for entry in self
            .document
            .entries
            .iter()
            .filter(|entry| entry.matches(file, &hash, pattern_name))
        {
            match entry.decision {
                Decision::Protect => return false,
                Decision::Allow => allowed = true,
            }
        }

        allowed
    }

    /// Drop allowed findings of content read from file.
    pub fn apply(&self, file: &Path, content: &[u8], findings: Vec<SecretFinding>) -> Vec<SecretFinding> {
        if self.document.entries.is_empty() {
            return findings;
        }

        findings
            .into_iter()
            .filter(|finding| {
                let line = line_at(content, finding.line_number).unwrap_or_default();
                let allowed = self.is_allowed(file, line, &finding.pattern_name);
                if allowed {
                    debug!("allowed {finding}");
                }
                !allowed
            })
            .collect()
    }

    /// Write policy back to where it was loaded from.
    ///
    /// # Errors
    ///
    /// - Return [`PolicyError::Write`] if document cannot be written.
    pub fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let data = serde_json::to_vec_pretty(&self.document)?;
        write_atomic(path, &data).map_err(|source| PolicyError::Write {
            source,
            path: path.clone(),
        })
    }
}

/// Line of content by 1-based number, without its line ending.
pub fn line_at(content: &[u8], line_number: usize) -> Option<&[u8]> {
    let line = content.split(|byte| *byte == b'\n').nth(line_number.checked_sub(1)?)?;
    Some(line.strip_suffix(b"\r").unwrap_or(line))
}

fn line_hash(line: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(line);
    format!("{:x}", hasher.finalize())
}

/// Secret policy error types.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("failed to read secret policy {:?}", path.display())]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    #[error("failed to parse secret policy {:?}", path.display())]
    Parse {
        #[source]
        source: serde_json::Error,
        path: PathBuf,
    },

    #[error("failed to write secret policy {:?}", path.display())]
    Write {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    #[error(transparent)]
    Serialize(#[from] serde_json::Error),
}

/// Friendly result alias :3
type Result<T, E = PolicyError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::SecretScanner;
    use pretty_assertions::assert_eq;
    use simple_test_case::test_case;

    #[test_case(b"a\nb\r\nc".as_slice(), 2, Some(b"b".as_slice()); "crlf stripped")]
    #[test_case(b"a\nb\nc".as_slice(), 3, Some(b"c".as_slice()); "last line")]
    #[test_case(b"a\n".as_slice(), 0, None; "zero is no line")]
    #[test_case(b"a\n".as_slice(), 3, None; "past end")]
    #[test]
    fn pick_line_by_number(content: &[u8], number: usize, expect: Option<&[u8]>) {
        pretty_assertions::assert_eq!(line_at(content, number), expect);
    }

    #[test]
    fn allowed_finding_is_dropped_unless_protected() {
        let file = Path::new("/home/blah/.npmrc");
        let content = b"registry=https://npm.example\npassword=not-a-secret\npassword=hunter2\n";
        let findings = SecretScanner::new().scan(content);
        assert_eq!(findings.len(), 2);

        let mut policy = SecretPolicy::default();
        assert!(policy.add(Decision::Allow, file, b"password=not-a-secret", "Password Assignment"));
        assert!(!policy.add(Decision::Allow, file, b"password=not-a-secret", "Password Assignment"));

        let kept = policy.apply(file, content, findings.clone());
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].line_number, 3);

        // Other file, same line, not allowed.
        assert_eq!(policy.apply(Path::new("/home/blah/.pgpass"), content, findings.clone()).len(), 2);

        policy.add(Decision::Protect, file, b"password=not-a-secret", "Password Assignment");
        assert_eq!(policy.apply(file, content, findings).len(), 2);
    }

    #[test]
    fn policy_survives_reload_without_storing_line() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("secret-policy.json");
        let file = Path::new("/home/blah/.netrc");

        let mut policy = SecretPolicy::load(&path)?;
        policy.add(Decision::Allow, file, b"password=hunter2", "Password Assignment");
        policy.persist()?;
        assert!(!fs::read_to_string(&path)?.contains("hunter2"));

        let mut policy = SecretPolicy::load(&path)?;
        assert!(policy.is_allowed(file, b"password=hunter2", "Password Assignment"));
        assert!(!policy.is_allowed(file, b"password=hunter3", "Password Assignment"));
        assert_eq!(policy.forget(file), 1);
        assert!(policy.entries().is_empty());

        Ok(())
    }
}
