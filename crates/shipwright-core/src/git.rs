use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

/// Captured result of a finished subprocess.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecResult {
    /// The command line as run, for diagnostics.
    pub command: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// The version-control primitives the checkout manager needs.
///
/// Implementations return `Err` only when the tool cannot be run at all; a command that runs
/// and fails comes back as an `ExecResult` with a non-zero exit code.
#[async_trait]
pub trait VersionControl: Send + Sync {
    async fn clone_repo(&self, url: &str, dest: &Path) -> Result<ExecResult>;

    async fn fetch(&self, dir: &Path) -> Result<ExecResult>;

    async fn checkout(&self, dir: &Path, target: &str) -> Result<ExecResult>;

    async fn rev_parse(&self, dir: &Path, refname: &str) -> Result<ExecResult>;
}

/// `VersionControl` backed by the `git` executable.
pub struct Git {
    pub git_bin: String,
}

impl Git {
    pub fn new(git_bin: impl Into<String>) -> Self {
        Self {
            git_bin: git_bin.into(),
        }
    }

    pub async fn exec(&self, dir: Option<&Path>, args: &[&str]) -> Result<ExecResult> {
        let mut cmd = Command::new(&self.git_bin);
        if let Some(dir) = dir {
            cmd.arg("-C").arg(dir);
        }
        cmd.args(args);
        // Never block on a credential prompt inside the worker.
        cmd.env("GIT_TERMINAL_PROMPT", "0");
        cmd.kill_on_drop(true);

        let command = match dir {
            Some(dir) => format!("{} -C {} {}", self.git_bin, dir.display(), args.join(" ")),
            None => format!("{} {}", self.git_bin, args.join(" ")),
        };
        debug!("exec: {command}");

        let output = cmd
            .output()
            .await
            .with_context(|| format!("failed to spawn {command}"))?;

        Ok(ExecResult {
            command,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(1),
        })
    }

    pub async fn available(&self) -> bool {
        self.exec(None, &["--version"])
            .await
            .map(|r| r.success())
            .unwrap_or(false)
    }
}

#[async_trait]
impl VersionControl for Git {
    async fn clone_repo(&self, url: &str, dest: &Path) -> Result<ExecResult> {
        let dest = dest.to_string_lossy();
        self.exec(None, &["clone", "--quiet", url, &dest]).await
    }

    async fn fetch(&self, dir: &Path) -> Result<ExecResult> {
        self.exec(Some(dir), &["fetch", "--quiet", "--prune", "origin"])
            .await
    }

    async fn checkout(&self, dir: &Path, target: &str) -> Result<ExecResult> {
        self.exec(Some(dir), &["checkout", "--quiet", "--force", "--detach", target])
            .await
    }

    async fn rev_parse(&self, dir: &Path, refname: &str) -> Result<ExecResult> {
        self.exec(Some(dir), &["rev-parse", "--verify", refname])
            .await
    }
}
