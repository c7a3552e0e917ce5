//! Container toolchain seam.
//!
//! The build and run drivers only see [`ContainerToolchain`]. [`DockerCli`] implements it by
//! shelling out to the `docker` client, using the classic builder so that the build output
//! ends with the `Successfully built <id>` marker.

use std::{path::Path, process::Stdio, time::Duration};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::git::ExecResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BuildOptions {
    /// Remove intermediate containers, even after a failed step.
    pub remove_intermediate: bool,
    /// Do not reuse cached layers.
    pub no_cache: bool,
}

#[async_trait]
pub trait ContainerToolchain: Send + Sync {
    /// Build an image rooted at `context`, returning the textual output in order.
    /// `Err` means the toolchain could not be invoked; a failed build is reported in the output.
    async fn build(&self, context: &Path, opts: BuildOptions) -> Result<Vec<String>>;

    /// Create a container from `image`. `Ok(None)` when no container id came back.
    async fn create(&self, image: &str) -> Result<Option<String>>;

    async fn start(&self, container: &str) -> Result<()>;

    /// Wait for the container to exit and return its exit code.
    async fn wait(&self, container: &str) -> Result<i64>;

    /// Ask the container to stop, killing it after `grace`.
    async fn stop(&self, container: &str, grace: Duration) -> Result<()>;

    async fn kill(&self, container: &str) -> Result<()>;

    /// Force-remove the container.
    async fn remove(&self, container: &str) -> Result<()>;
}

/// `ContainerToolchain` backed by the `docker` executable.
pub struct DockerCli {
    pub docker_bin: String,
}

impl DockerCli {
    pub fn new(docker_bin: impl Into<String>) -> Self {
        Self {
            docker_bin: docker_bin.into(),
        }
    }

    pub async fn available(&self) -> bool {
        Command::new(&self.docker_bin)
            .arg("version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    async fn exec(&self, args: &[&str]) -> Result<ExecResult> {
        let command = format!("{} {}", self.docker_bin, args.join(" "));
        debug!("exec: {command}");

        let output = Command::new(&self.docker_bin)
            .args(args)
            // The classic builder prints the `Successfully built` marker; BuildKit does not.
            .env("DOCKER_BUILDKIT", "0")
            .stdin(Stdio::null())
            .kill_on_drop(true)
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

    async fn exec_checked(&self, args: &[&str]) -> Result<ExecResult> {
        let result = self.exec(args).await?;
        if !result.success() {
            return Err(anyhow!(
                "`{}` exited with {}: {}",
                result.command,
                result.exit_code,
                result.stderr.trim()
            ));
        }
        Ok(result)
    }
}

#[async_trait]
impl ContainerToolchain for DockerCli {
    async fn build(&self, context: &Path, opts: BuildOptions) -> Result<Vec<String>> {
        let context = context.to_string_lossy();
        let mut args = vec!["build"];
        if opts.remove_intermediate {
            args.extend(["--rm", "--force-rm"]);
        }
        if opts.no_cache {
            args.push("--no-cache");
        }
        args.push(context.as_ref());

        let result = self.exec(&args).await?;
        if build_never_started(&result) {
            return Err(anyhow!(
                "`{}` exited with {} before any build step: {}",
                result.command,
                result.exit_code,
                result.stderr.trim()
            ));
        }
        let mut lines: Vec<String> = result.stdout.lines().map(str::to_string).collect();
        if !result.success() {
            // The failing step's message is at the end of stderr.
            lines.extend(result.stderr.lines().map(str::to_string));
        } else if !result.stderr.trim().is_empty() {
            debug!("docker build stderr:\n{}", result.stderr);
        }
        Ok(lines)
    }

    async fn create(&self, image: &str) -> Result<Option<String>> {
        let result = self.exec(&["create", image]).await?;
        if !result.success() {
            warn!("docker create {image} failed: {}", result.stderr.trim());
            return Ok(None);
        }
        let id = result.stdout.trim();
        Ok((!id.is_empty()).then(|| id.to_string()))
    }

    async fn start(&self, container: &str) -> Result<()> {
        self.exec_checked(&["start", container]).await?;
        Ok(())
    }

    async fn wait(&self, container: &str) -> Result<i64> {
        let result = self.exec_checked(&["wait", container]).await?;
        let code = result.stdout.trim();
        code.parse()
            .with_context(|| format!("unexpected `docker wait` output: {code:?}"))
    }

    async fn stop(&self, container: &str, grace: Duration) -> Result<()> {
        let grace = stop_timeout_secs(grace).to_string();
        self.exec_checked(&["stop", "--time", &grace, container])
            .await?;
        Ok(())
    }

    async fn kill(&self, container: &str) -> Result<()> {
        self.exec_checked(&["kill", container]).await?;
        Ok(())
    }

    async fn remove(&self, container: &str) -> Result<()> {
        self.exec_checked(&["rm", "--force", container]).await?;
        Ok(())
    }
}

/// A failed `docker build` that printed no step never reached the daemon's builder: the daemon
/// is unreachable, the context is unreadable, or the client itself failed.
fn build_never_started(result: &ExecResult) -> bool {
    if result.success() {
        return false;
    }
    result.stderr.contains("Cannot connect to the Docker daemon")
        || !result.stdout.lines().any(|l| l.trim_start().starts_with("Step "))
}

/// `docker stop --time` takes whole seconds; round up so a sub-second grace is not zero.
fn stop_timeout_secs(grace: Duration) -> u64 {
    grace.as_secs() + u64::from(grace.subsec_nanos() > 0)
}
