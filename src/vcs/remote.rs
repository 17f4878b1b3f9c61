// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Remote transfers with credential prompts and a progress bar.

use auth_git2::{GitAuthenticator, Prompter};
use git2::{Config, RemoteCallbacks};
use indicatif::{ProgressBar, ProgressStyle};
use inquire::{Password, Text};
use std::{path::Path, time};
use tracing::{info, instrument};

/// State shared by every callback of one remote transfer.
pub(crate) struct Transfer {
    bar: ProgressBar,
    authenticator: GitAuthenticator,
    config: Config,
}

impl Transfer {
    /// Style progress bar and build authenticator for remote at url.
    pub(crate) fn new(bar: ProgressBar, url: &str) -> super::Result<Self> {
        let style = ProgressStyle::with_template(
            "{elapsed_precise:.green}  {msg:<50}  [{wide_bar:.yellow/blue}]",
        )?
        .progress_chars("-Cco.");
        bar.set_style(style);
        bar.set_message(url.to_string());
        if !bar.is_hidden() {
            bar.enable_steady_tick(time::Duration::from_millis(100));
        }

        let prompter = IndicatifPrompter::new(bar.clone());
        let authenticator = GitAuthenticator::default().set_prompter(prompter);
        let config = Config::open_default()?;

        Ok(Self {
            bar,
            authenticator,
            config,
        })
    }

    /// Callbacks for credentials and transfer progress.
    pub(crate) fn callbacks(&self) -> RemoteCallbacks<'_> {
        let mut throttle = time::Instant::now();
        let bar = self.bar.clone();
        let push_bar = self.bar.clone();

        let mut rc = RemoteCallbacks::new();
        rc.credentials(self.authenticator.credentials(&self.config));
        rc.transfer_progress(move |progress| {
            if throttle.elapsed() > time::Duration::from_millis(10) {
                throttle = time::Instant::now();
                bar.set_length(progress.total_objects() as u64);
                bar.set_position(progress.received_objects() as u64);
            }
            true
        });
        rc.push_transfer_progress(move |current, total, _bytes| {
            push_bar.set_length(total as u64);
            push_bar.set_position(current as u64);
        });

        rc
    }

    pub(crate) fn finish(self) {
        self.bar.finish_and_clear();
    }
}

/// Git2 authentication prompter for progress bar.
#[derive(Debug, Clone)]
pub struct IndicatifPrompter {
    bar: ProgressBar,
}

impl IndicatifPrompter {
    pub fn new(bar: ProgressBar) -> Self {
        Self { bar }
    }
}

impl Prompter for IndicatifPrompter {
    #[instrument(skip(self, url, _config), level = "debug")]
    fn prompt_username_password(&mut self, url: &str, _config: &Config) -> Option<(String, String)> {
        info!("authentication required at {url}");
        self.bar.suspend(|| {
            let username = Text::new("username").prompt().ok()?;
            let password = Password::new("password")
                .without_confirmation()
                .prompt()
                .ok()?;
            Some((username, password))
        })
    }

    #[instrument(skip(self, username, url, _config), level = "debug")]
    fn prompt_password(&mut self, username: &str, url: &str, _config: &Config) -> Option<String> {
        info!("authentication required at {url} for user {username}");
        self.bar.suspend(|| {
            Password::new("password")
                .without_confirmation()
                .prompt()
                .ok()
        })
    }

    #[instrument(skip(self, ssh_key_path, _config), level = "debug")]
    fn prompt_ssh_key_passphrase(&mut self, ssh_key_path: &Path, _config: &Config) -> Option<String> {
        info!("authentication required with ssh key at {}", ssh_key_path.display());
        self.bar.suspend(|| {
            Password::new("passphrase")
                .without_confirmation()
                .prompt()
                .ok()
        })
    }
}
