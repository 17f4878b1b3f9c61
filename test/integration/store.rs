// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use crate::Workspace;

use dotswitch::{
    lock::{LockError, OperationLock},
    store::{Settings, Store},
    vault::{RedactionVault, VaultIdentity, VaultKey},
};

use anyhow::Result;
use indoc::indoc;
use pretty_assertions::assert_eq;
use sealed_test::prelude::*;

#[sealed_test(env = [("DOTSWITCH_DIR", "/tmp/dotswitch-sealed")])]
fn store_from_environment_holds_lock_file() -> Result<()> {
    let store = Store::locate()?;
    store.ensure()?;
    assert!(!store.is_initialized());

    let guard = OperationLock::acquire(store.lock_path())?;
    assert!(matches!(
        OperationLock::acquire(store.lock_path()),
        Err(LockError::Locked { .. })
    ));
    drop(guard);
    assert!(OperationLock::acquire(store.lock_path()).is_ok());

    Ok(())
}

#[test]
fn running_engine_blocks_second_invocation() -> Result<()> {
    let ws = Workspace::new()?;
    let result = OperationLock::acquire(ws.dir.path().join("dotswitch.lock"));
    assert!(matches!(result, Err(LockError::Locked { .. })));

    Ok(())
}

#[test]
fn vault_survives_reopen_with_persisted_key() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Store::new(dir.path());
    store.ensure()?;
    let identity = VaultIdentity::new("work", "/home/blah/.netrc", 9);

    let key = VaultKey::load_or_generate(store.vault_key_path())?;
    let mut vault = RedactionVault::open(store.vault_path(), key)?;
    vault.seal(identity.clone(), b"hunter2", b"***REDACTED***")?;
    vault.persist()?;

    let key = VaultKey::load_or_generate(store.vault_key_path())?;
    let vault = RedactionVault::open(store.vault_path(), key)?;
    let unsealed = vault
        .unseal(&identity)?
        .ok_or_else(|| anyhow::anyhow!("entry expected"))?;
    assert_eq!(unsealed.original, b"hunter2".to_vec());

    // Another key cannot read it.
    let vault = RedactionVault::open(store.vault_path(), VaultKey::generate())?;
    assert!(vault.unseal(&identity).is_err());

    Ok(())
}

#[test]
fn custom_patterns_from_settings_reach_scanner() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Store::new(dir.path());
    store.ensure()?;

    let settings: Settings = indoc! {r#"
        [[secret_patterns]]
        name = "Company Token"
        regex = "cmp_[0-9a-f]{12}"
        severity = "critical"
    "#}
    .parse()?;
    store.save_settings(&settings)?;

    let scanner = store.settings()?.scanner()?;
    let findings = scanner.scan(b"token = cmp_0123456789ab\n");
    assert!(findings
        .iter()
        .any(|finding| finding.pattern_name == "Company Token" && finding.is_blocking()));

    Ok(())
}
