// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! External commands: deploy hooks and the conflict editor.

use std::{
    ffi::{OsStr, OsString},
    fmt::{Display, Formatter, Result as FmtResult},
    path::{Path, PathBuf},
    process::{Command, ExitStatus},
};
use tracing::{info, instrument};

/// When a hook runs relative to writing a section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookStage {
    PreDeploy,
    PostDeploy,
}

impl Display for HookStage {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::PreDeploy => fmt.write_str("pre_deploy"),
            Self::PostDeploy => fmt.write_str("post_deploy"),
        }
    }
}

/// Layer of indirection for running section hooks.
pub trait HookRunner {
    fn run(&self, stage: HookStage, section: &str, command: &str) -> Result<()>;
}

/// Run hooks through a POSIX shell.
#[derive(Debug, Clone)]
pub struct ShellHookRunner {
    shell: OsString,
    cwd: Option<PathBuf>,
}

impl ShellHookRunner {
    pub fn new(shell: impl Into<OsString>) -> Self {
        Self {
            shell: shell.into(),
            cwd: None,
        }
    }

    /// Run hooks from directory.
    pub fn in_dir(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

impl Default for ShellHookRunner {
    fn default() -> Self {
        Self::new("sh")
    }
}

impl HookRunner for ShellHookRunner {
    #[instrument(skip(self, command), level = "debug")]
    fn run(&self, stage: HookStage, section: &str, command: &str) -> Result<()> {
        info!("run {stage} hook of {section:?}: {command}");
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c").arg(command);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }

        let status = syscall_interactive(&mut cmd)?;
        if !status.success() {
            return Err(HookError::Failed {
                stage,
                section: section.into(),
                status,
            });
        }

        Ok(())
    }
}

/// Open path in user's editor and wait for it to exit.
///
/// Editor command may carry its own arguments, e.g., `code --wait`.
///
/// # Errors
///
/// - Return [`HookError::Spawn`] if shell cannot be started.
/// - Return [`HookError::Editor`] if editor exits unsuccessfully.
#[instrument(skip(editor, path), level = "debug")]
pub fn open_editor(editor: &str, path: impl AsRef<Path>) -> Result<()> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(format!("{editor} \"$1\""))
        .arg("sh")
        .arg(path.as_ref());

    let status = syscall_interactive(&mut cmd)?;
    if !status.success() {
        return Err(HookError::Editor {
            editor: editor.into(),
            status,
        });
    }

    Ok(())
}

/// Determine editor from `$VISUAL`, then `$EDITOR`, then `vi`.
pub fn default_editor() -> String {
    ["VISUAL", "EDITOR"]
        .into_iter()
        .filter_map(std::env::var_os)
        .map(|editor| editor.to_string_lossy().into_owned())
        .find(|editor| !editor.trim().is_empty())
        .unwrap_or_else(|| "vi".into())
}

fn syscall_interactive(cmd: &mut Command) -> Result<ExitStatus> {
    let program: &OsStr = cmd.get_program();
    let program = program.to_os_string();
    cmd.spawn()
        .and_then(|mut child| child.wait())
        .map_err(|source| HookError::Spawn { source, program })
}

#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("failed to run {:?}", program)]
    Spawn {
        #[source]
        source: std::io::Error,
        program: OsString,
    },

    #[error("{stage} hook of {section:?} failed with {status}")]
    Failed {
        stage: HookStage,
        section: String,
        status: ExitStatus,
    },

    #[error("editor {editor:?} failed with {status}")]
    Editor { editor: String, status: ExitStatus },
}

/// Friendly result alias :3
type Result<T, E = HookError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;

    #[test]
    fn shell_hook_runs_in_directory() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let runner = ShellHookRunner::default().in_dir(dir.path());
        runner.run(HookStage::PostDeploy, "bashrc", "echo done > marker")?;
        assert_eq!(std::fs::read_to_string(dir.path().join("marker"))?, "done\n");

        Ok(())
    }

    #[test]
    fn failing_hook_reports_stage() {
        let runner = ShellHookRunner::default();
        let result = runner.run(HookStage::PreDeploy, "vimrc", "exit 3");
        assert!(matches!(
            result,
            Err(HookError::Failed { stage: HookStage::PreDeploy, ref section, .. }) if section == "vimrc"
        ));
    }

    #[test]
    fn editor_receives_path() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("file with spaces");
        open_editor("touch", &path)?;
        assert!(path.exists());
        assert!(open_editor("false", &path).is_err());

        Ok(())
    }

    #[sealed_test(env = [("VISUAL", ""), ("EDITOR", "nano")])]
    fn editor_falls_back_through_environment() {
        assert_eq!(default_editor(), "nano");
    }
}
