// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use crate::{bare_remote, configure_identity};

use dotswitch::{
    conflict::{ConflictError, ConflictKind, ConflictResolver, Resolution},
    vcs::{Git2Vcs, RemoteOutcome, VersionControl},
};

use anyhow::Result;
use indicatif::ProgressBar;
use pretty_assertions::assert_eq;
use std::{fs, path::Path};
use tempfile::TempDir;

/// Two clones of one remote, both on `main`.
struct Peers {
    _dir: TempDir,
    alice: Git2Vcs,
    bob: Git2Vcs,
}

impl Peers {
    fn new() -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let url = bare_remote(dir.path().join("remote.git"))?;

        let alice = Git2Vcs::init(dir.path().join("alice"), "main")?;
        configure_identity(alice.work_dir())?;
        alice.set_remote(&url)?;
        fs::write(alice.work_dir().join("bashrc"), "base\n")?;
        alice.commit("add bashrc")?;
        alice.push()?;

        let bob = Git2Vcs::clone(&url, dir.path().join("bob"), ProgressBar::hidden())?;
        configure_identity(bob.work_dir())?;

        Ok(Self {
            _dir: dir,
            alice,
            bob,
        })
    }

    /// Let both peers change bashrc, bob pushes first.
    fn diverge(&self) -> Result<()> {
        fs::write(self.bob.work_dir().join("bashrc"), "bob\n")?;
        self.bob.commit("bob edits bashrc")?;
        self.bob.push()?;

        fs::write(self.alice.work_dir().join("bashrc"), "alice\n")?;
        self.alice.commit("alice edits bashrc")?;

        Ok(())
    }
}

#[test]
fn pull_fast_forwards_behind_peer() -> Result<()> {
    let peers = Peers::new()?;
    assert_eq!(peers.bob.current_branch()?, "main");
    assert_eq!(fs::read_to_string(peers.bob.work_dir().join("bashrc"))?, "base\n");

    fs::write(peers.alice.work_dir().join("vimrc"), "set nu\n")?;
    peers.alice.commit("add vimrc")?;
    peers.alice.push()?;

    assert_eq!(peers.bob.pull()?, RemoteOutcome::FastForward);
    assert_eq!(fs::read_to_string(peers.bob.work_dir().join("vimrc"))?, "set nu\n");
    assert_eq!(peers.bob.pull()?, RemoteOutcome::UpToDate);

    Ok(())
}

#[test]
fn diverged_push_is_refused() -> Result<()> {
    let peers = Peers::new()?;
    peers.diverge()?;
    assert!(peers.alice.push().is_err());

    Ok(())
}

#[test]
fn conflicting_pull_resolves_to_remote_side() -> Result<()> {
    let peers = Peers::new()?;
    peers.diverge()?;

    let conflicts = match peers.alice.pull()? {
        RemoteOutcome::Conflict(conflicts) => conflicts,
        outcome => anyhow::bail!("expected conflict, got {outcome:?}"),
    };
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].path, Path::new("bashrc"));

    let resolver = ConflictResolver::new(&peers.alice);
    let found = resolver.conflicts()?;
    assert_eq!(found[0].kind, ConflictKind::BothModified);

    resolver.resolve(&found[0], &Resolution::KeepRemote)?;
    assert!(resolver.conflicts()?.is_empty());
    assert_eq!(fs::read_to_string(peers.alice.work_dir().join("bashrc"))?, "bob\n");

    assert!(peers.alice.commit("resolve bashrc")?.is_some());
    peers.alice.push()?;
    assert_eq!(peers.bob.pull()?, RemoteOutcome::FastForward);

    Ok(())
}

#[test]
fn resolution_with_markers_left_is_refused() -> Result<()> {
    let peers = Peers::new()?;
    peers.diverge()?;
    assert!(matches!(peers.alice.pull()?, RemoteOutcome::Conflict(_)));

    let resolver = ConflictResolver::new(&peers.alice);
    let found = resolver.conflicts()?;

    // Editor that leaves file as merge wrote it.
    let edit = Resolution::Edit {
        editor: "true".into(),
    };
    let result = resolver.resolve(&found[0], &edit);
    assert!(matches!(result, Err(ConflictError::ResidualMarkers { .. })));
    assert_eq!(resolver.conflicts()?.len(), 1);

    // Committing with conflicts left is refused as well.
    assert!(peers.alice.commit("too early").is_err());

    Ok(())
}
