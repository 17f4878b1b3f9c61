// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Encrypted store of redacted spans.
//!
//! Every span replaced during a save is sealed here with AES-256-GCM, keyed by
//! profile, canonical local path, and the offset of the marker in the
//! redacted file. A later deploy of the same profile unseals the span and
//! splices it back into the local copy only.
//!
//! The store is a JSON document kept in the data directory, never inside the
//! repository. The key lives next to it in its own `0600` file, is loaded once
//! per process, and is handed to [`RedactionVault::open`] explicitly. Losing
//! the key loses the secrets, but never the redacted repository content.

use crate::{path::file_identity, sync::atomic::write_atomic};

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt::{Debug, Formatter, Result as FmtResult},
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument};

const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;
const VAULT_VERSION: u8 = 1;

/// Process-wide vault key.
#[derive(Clone, PartialEq, Eq)]
pub struct VaultKey([u8; KEY_SIZE]);

impl VaultKey {
    /// Generate fresh random key.
    pub fn generate() -> Self {
        let key = Aes256Gcm::generate_key(OsRng);
        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(key.as_slice());
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Load key from file, or generate and store a new one if missing.
    ///
    /// # Errors
    ///
    /// - Return [`VaultError::Read`] or [`VaultError::Write`] on I/O failure.
    /// - Return [`VaultError::MalformedKey`] if key file content is invalid.
    #[instrument(skip(path), level = "debug")]
    pub fn load_or_generate(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!("generate new vault key at {:?}", path.display());
            let key = Self::generate();
            write_private(path, STANDARD.encode(key.0).as_bytes())?;
            return Ok(key);
        }

        let encoded = fs::read_to_string(path).map_err(|source| VaultError::Read {
            source,
            path: path.to_path_buf(),
        })?;
        let decoded = STANDARD
            .decode(encoded.trim())
            .map_err(|_| VaultError::MalformedKey(path.to_path_buf()))?;
        let bytes: [u8; KEY_SIZE] = decoded
            .try_into()
            .map_err(|_| VaultError::MalformedKey(path.to_path_buf()))?;

        Ok(Self(bytes))
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0))
    }
}

impl Debug for VaultKey {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str("VaultKey(..)")
    }
}

/// Stable identity of one redacted span.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
pub struct VaultIdentity {
    /// Profile the span was saved from.
    pub profile: String,

    /// Canonical absolute path of local file.
    pub path: PathBuf,

    /// Offset of redaction marker in redacted content.
    pub offset: usize,
}

impl VaultIdentity {
    pub fn new(profile: impl Into<String>, path: impl Into<PathBuf>, offset: usize) -> Self {
        Self {
            profile: profile.into(),
            path: path.into(),
            offset,
        }
    }

    // INVARIANT: Ciphertext is bound to its identity, moving an entry breaks it.
    fn associated_data(&self) -> Vec<u8> {
        format!(
            "{}\0{}\0{}",
            self.profile,
            self.path.to_string_lossy(),
            self.offset
        )
        .into_bytes()
    }
}

/// Decrypted vault entry.
#[derive(Clone, PartialEq, Eq)]
pub struct Unsealed {
    pub original: Vec<u8>,
    pub redacted: Vec<u8>,
}

impl Debug for Unsealed {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.debug_struct("Unsealed")
            .field("original", &format_args!("<{} bytes>", self.original.len()))
            .field("redacted", &String::from_utf8_lossy(&self.redacted))
            .finish()
    }
}

/// Rule selecting vault entries to garbage collect.
#[derive(Clone, Copy, Debug)]
pub enum PruneRule<'a> {
    /// Entries of any profile sealed longer ago than given age.
    OlderThan(TimeDelta),

    /// Entries of one profile not confirmed by a save for longer than age.
    Stale { profile: &'a str, age: TimeDelta },

    /// Exactly these identities.
    Identities(&'a [VaultIdentity]),

    /// Entries of profile whose file is no longer under any tracked root.
    Orphaned {
        profile: &'a str,
        roots: &'a [PathBuf],
    },
}

#[derive(Clone, Debug, Deserialize, Serialize)]
struct VaultEntry {
    #[serde(flatten)]
    identity: VaultIdentity,
    nonce: String,
    ciphertext: String,
    redacted: String,
    sealed_at: DateTime<Utc>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct VaultDocument {
    version: u8,
    entries: Vec<VaultEntry>,
}

/// State of a vault to return to.
#[derive(Clone, Debug)]
pub struct VaultCheckpoint(BTreeMap<VaultIdentity, VaultEntry>);

/// Encrypted store of redacted spans.
#[derive(Debug)]
pub struct RedactionVault {
    path: PathBuf,
    key: VaultKey,
    entries: BTreeMap<VaultIdentity, VaultEntry>,
    dirty: bool,
}

impl RedactionVault {
    /// Open vault document at path with key.
    ///
    /// A missing document yields an empty vault.
    ///
    /// # Errors
    ///
    /// - Return [`VaultError::Read`] if document cannot be read.
    /// - Return [`VaultError::Corrupt`] if document cannot be parsed.
    #[instrument(skip(path, key), level = "debug")]
    pub fn open(path: impl Into<PathBuf>, key: VaultKey) -> Result<Self> {
        let path = path.into();
        let mut vault = Self {
            path,
            key,
            entries: BTreeMap::new(),
            dirty: false,
        };
        if !vault.path.exists() {
            debug!("no vault at {:?}, start empty", vault.path.display());
            return Ok(vault);
        }

        let data = fs::read(&vault.path).map_err(|source| VaultError::Read {
            source,
            path: vault.path.clone(),
        })?;
        let document: VaultDocument =
            serde_json::from_slice(&data).map_err(|source| VaultError::Corrupt {
                source,
                path: vault.path.clone(),
            })?;
        vault.entries = document
            .entries
            .into_iter()
            .map(|entry| (entry.identity.clone(), entry))
            .collect();

        Ok(vault)
    }

    /// Encrypt original span and store it under identity.
    ///
    /// Replaces any previous entry for the same identity.
    ///
    /// # Errors
    ///
    /// - Return [`VaultError::Encrypt`] if encryption fails.
    pub fn seal(&mut self, identity: VaultIdentity, original: &[u8], redacted: &[u8]) -> Result<()> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let aad = identity.associated_data();
        let ciphertext = self
            .key
            .cipher()
            .encrypt(&nonce, Payload { msg: original, aad: &aad })
            .map_err(|_| VaultError::Encrypt {
                path: identity.path.clone(),
                offset: identity.offset,
            })?;

        let entry = VaultEntry {
            identity: identity.clone(),
            nonce: STANDARD.encode(nonce),
            ciphertext: STANDARD.encode(ciphertext),
            redacted: STANDARD.encode(redacted),
            sealed_at: Utc::now(),
        };
        self.entries.insert(identity, entry);
        self.dirty = true;

        Ok(())
    }

    /// Decrypt span stored under identity.
    ///
    /// Return `None` when nothing was ever redacted there.
    ///
    /// # Errors
    ///
    /// - Return [`VaultError::Decrypt`] if entry is damaged or key is wrong.
    pub fn unseal(&self, identity: &VaultIdentity) -> Result<Option<Unsealed>> {
        let Some(entry) = self.entries.get(identity) else {
            return Ok(None);
        };

        let damaged = || VaultError::Decrypt {
            path: identity.path.clone(),
            offset: identity.offset,
        };
        let nonce = STANDARD.decode(&entry.nonce).map_err(|_| damaged())?;
        let ciphertext = STANDARD.decode(&entry.ciphertext).map_err(|_| damaged())?;
        let redacted = STANDARD.decode(&entry.redacted).map_err(|_| damaged())?;

        // INVARIANT: Check nonce length before building one, it panics otherwise.
        if nonce.len() != NONCE_SIZE {
            return Err(damaged());
        }

        let aad = identity.associated_data();
        let original = self
            .key
            .cipher()
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| damaged())?;

        Ok(Some(Unsealed { original, redacted }))
    }

    /// Identities stored for a local file of a profile, by ascending offset.
    pub fn entries_for(&self, profile: &str, path: &Path) -> Vec<VaultIdentity> {
        self.entries
            .keys()
            .filter(|identity| identity.profile == profile && identity.path == path)
            .cloned()
            .collect()
    }

    /// Drop every entry of a local file of a profile.
    ///
    /// Used before resealing a file, since marker offsets shift whenever the
    /// file changes.
    pub fn forget_file(&mut self, profile: &str, path: &Path) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|identity, _| !(identity.profile == profile && identity.path == path));
        let removed = before - self.entries.len();
        self.dirty |= removed > 0;
        removed
    }

    /// Remember current entries.
    pub fn checkpoint(&self) -> VaultCheckpoint {
        VaultCheckpoint(self.entries.clone())
    }

    /// Return to entries remembered by checkpoint.
    pub fn rollback(&mut self, checkpoint: VaultCheckpoint) {
        self.entries = checkpoint.0;
        self.dirty = true;
    }

    /// Mark every entry of a local file as confirmed by a save just now.
    ///
    /// Age based pruning only removes entries no save has confirmed lately.
    pub fn touch(&mut self, profile: &str, path: &Path) -> usize {
        let now = Utc::now();
        let mut touched = 0;
        for (identity, entry) in &mut self.entries {
            if identity.profile == profile && identity.path == path {
                entry.sealed_at = now;
                touched += 1;
            }
        }
        self.dirty |= touched > 0;
        touched
    }

    /// Give profile `to` a copy of every entry of profile `from`.
    ///
    /// A branch created from another starts with the same redacted content,
    /// so it needs the same spans to restore. Previous entries of `to` are
    /// dropped first.
    ///
    /// # Errors
    ///
    /// - Return [`VaultError::Decrypt`] if an entry of `from` is damaged.
    /// - Return [`VaultError::Encrypt`] if resealing fails.
    #[instrument(skip(self), level = "debug")]
    pub fn copy_profile(&mut self, from: &str, to: &str) -> Result<usize> {
        if from == to {
            return Ok(0);
        }

        self.forget_profile(to);
        let sources: Vec<VaultIdentity> = self
            .entries
            .keys()
            .filter(|identity| identity.profile == from)
            .cloned()
            .collect();

        for source in &sources {
            // INVARIANT: Profile is part of associated data, so copies are resealed.
            if let Some(unsealed) = self.unseal(source)? {
                let target = VaultIdentity::new(to, source.path.clone(), source.offset);
                self.seal(target, &unsealed.original, &unsealed.redacted)?;
            }
        }

        debug!("copied {} vault entries from {from:?} to {to:?}", sources.len());
        Ok(sources.len())
    }

    /// Drop every entry of a profile.
    pub fn forget_profile(&mut self, profile: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|identity, _| identity.profile != profile);
        let removed = before - self.entries.len();
        self.dirty |= removed > 0;
        removed
    }

    /// Garbage collect entries matching rule.
    ///
    /// Return number of removed entries.
    #[instrument(skip(self), level = "debug")]
    pub fn prune(&mut self, rule: PruneRule<'_>) -> usize {
        let before = self.entries.len();
        match rule {
            PruneRule::OlderThan(age) => {
                let cutoff = Utc::now() - age;
                self.entries.retain(|_, entry| entry.sealed_at >= cutoff);
            }
            PruneRule::Stale { profile, age } => {
                let cutoff = Utc::now() - age;
                self.entries.retain(|identity, entry| {
                    identity.profile != profile || entry.sealed_at >= cutoff
                });
            }
            PruneRule::Identities(identities) => {
                self.entries
                    .retain(|identity, _| !identities.contains(identity));
            }
            PruneRule::Orphaned { profile, roots } => {
                let roots: Vec<PathBuf> = roots.iter().map(file_identity).collect();
                self.entries.retain(|identity, _| {
                    identity.profile != profile
                        || roots.iter().any(|root| identity.path.starts_with(root))
                });
            }
        }

        let removed = before - self.entries.len();
        if removed > 0 {
            info!("pruned {removed} vault entries");
            self.dirty = true;
        }
        removed
    }

    /// Write vault document to disk if anything changed.
    ///
    /// # Errors
    ///
    /// - Return [`VaultError::Write`] if document cannot be written.
    pub fn persist(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }

        let document = VaultDocument {
            version: VAULT_VERSION,
            entries: self.entries.values().cloned().collect(),
        };
        let data = serde_json::to_vec_pretty(&document)?;
        write_private(&self.path, &data)?;
        self.dirty = false;
        debug!("persisted {} vault entries", self.entries.len());

        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn write_private(path: &Path, data: &[u8]) -> Result<()> {
    let failed = |source| VaultError::Write {
        source,
        path: path.to_path_buf(),
    };
    write_atomic(path, data).map_err(failed)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(failed)?;
    }

    Ok(())
}

/// Vault error types.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("failed to read vault file {:?}", path.display())]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    #[error("failed to write vault file {:?}", path.display())]
    Write {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Vault document is not valid JSON of expected shape.
    #[error("vault at {:?} is corrupt", path.display())]
    Corrupt {
        #[source]
        source: serde_json::Error,
        path: PathBuf,
    },

    #[error(transparent)]
    Serialize(#[from] serde_json::Error),

    #[error("vault key at {:?} is malformed", .0.display())]
    MalformedKey(PathBuf),

    #[error("failed to encrypt span at offset {offset} of {:?}", path.display())]
    Encrypt { path: PathBuf, offset: usize },

    /// Entry is damaged or was sealed with another key.
    #[error("failed to decrypt span at offset {offset} of {:?}", path.display())]
    Decrypt { path: PathBuf, offset: usize },
}

/// Friendly result alias :3
type Result<T, E = VaultError> = std::result::Result<T, E>;
