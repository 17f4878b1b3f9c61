// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Dotfile profiles backed by Git branches.
//!
//! A __profile__ is a branch of the profile repository. Each profile carries a
//! `dotswitch.toml` mapping __sections__ of local files to locations inside the
//! repository. Switching profiles saves the local files of the current profile
//! into its branch, checks out the target branch, and deploys its files back
//! onto the local paths.
//!
//! Secrets never reach the repository in the clear. On save, tracked content
//! is scanned, matching spans are replaced with a fixed marker, and the
//! original bytes are sealed in an encrypted vault kept outside of the
//! repository. Deploying restores them.
//!
//! # See Also
//!
//! 1. [`switch::BranchSwitchEngine`]
//! 2. [`sync::FileSyncEngine`]
//! 3. [`vcs::VersionControl`]

pub mod backup;
pub mod config;
pub mod conflict;
pub mod diff;
pub mod hook;
pub mod lock;
pub mod path;
pub mod scan;
pub mod store;
pub mod switch;
pub mod sync;
pub mod vault;
pub mod vcs;
