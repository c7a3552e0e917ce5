use std::{sync::Arc, time::Duration};

use tracing::{error, info, warn};

use crate::{
    toolchain::ContainerToolchain,
    types::{short_id, RunOutcome, RunResult},
};

pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(30);

/// Runs a built image to completion, bounded by a timeout, and always removes the container.
pub struct RunDriver {
    toolchain: Arc<dyn ContainerToolchain>,
    timeout: Duration,
    grace: Duration,
}

impl RunDriver {
    pub fn new(toolchain: Arc<dyn ContainerToolchain>) -> Self {
        Self {
            toolchain,
            timeout: DEFAULT_RUN_TIMEOUT,
            grace: DEFAULT_STOP_GRACE,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn run(&self, image_id: &str) -> RunResult {
        info!(image = %short_id(image_id), "creating container");
        let container = match self.toolchain.create(image_id).await {
            Ok(Some(id)) => id,
            Ok(None) => return creation_failed(None),
            Err(e) => return creation_failed(Some(e)),
        };
        let short = short_id(&container).to_string();

        let result = self.start_and_wait(&container, &short).await;

        // Timed-out containers were already force-removed in `terminate`.
        if result.outcome != RunOutcome::Timeout {
            if let Err(e) = self.toolchain.remove(&container).await {
                warn!(container = %short, "failed to remove container: {e:#}");
            }
        }
        result
    }

    async fn start_and_wait(&self, container: &str, short: &str) -> RunResult {
        info!(container = %short, "starting container");
        if let Err(e) = self.toolchain.start(container).await {
            error!(container = %short, "failed to start container: {e:#}");
            return RunResult {
                outcome: RunOutcome::InfraError,
                exit_code: None,
                container_id: Some(container.to_string()),
                message: format!("Error starting container `{short}`"),
            };
        }

        info!(container = %short, timeout_s = self.timeout.as_secs(), "waiting for container to exit");
        let exit_code = match tokio::time::timeout(self.timeout, self.toolchain.wait(container)).await
        {
            Ok(Ok(code)) => code,
            Ok(Err(e)) => {
                error!(container = %short, "failed waiting for container: {e:#}");
                return RunResult {
                    outcome: RunOutcome::InfraError,
                    exit_code: None,
                    container_id: Some(container.to_string()),
                    message: format!("Error waiting for container `{short}`"),
                };
            }
            Err(_elapsed) => {
                warn!(container = %short, timeout_s = self.timeout.as_secs(), "container timed out");
                self.terminate(container, short).await;
                return RunResult {
                    outcome: RunOutcome::Timeout,
                    exit_code: None,
                    container_id: Some(container.to_string()),
                    message: format!(
                        "Container `{short}` timed out after {} and was killed",
                        format_duration(self.timeout)
                    ),
                };
            }
        };

        if exit_code != 0 {
            let message = format!("Container `{short}` returned a non-zero exit code `{exit_code}`");
            error!("{message}");
            return RunResult {
                outcome: RunOutcome::NonZeroExit,
                exit_code: Some(exit_code),
                container_id: Some(container.to_string()),
                message,
            };
        }

        let message = format!("Container `{short}` exited successfully");
        info!("{message}");
        RunResult {
            outcome: RunOutcome::Success,
            exit_code: Some(0),
            container_id: Some(container.to_string()),
            message,
        }
    }

    /// Stop with grace, fall back to kill, then force-remove. Every step is best-effort.
    async fn terminate(&self, container: &str, short: &str) {
        if let Err(e) = self.toolchain.stop(container, self.grace).await {
            warn!(container = %short, "stop failed, killing: {e:#}");
            if let Err(e) = self.toolchain.kill(container).await {
                warn!(container = %short, "kill failed: {e:#}");
            }
        }
        if let Err(e) = self.toolchain.remove(container).await {
            warn!(container = %short, "failed to remove container: {e:#}");
        }
    }
}

fn creation_failed(cause: Option<anyhow::Error>) -> RunResult {
    match cause {
        Some(e) => error!("Error creating container: {e:#}"),
        None => error!("Error creating container: no container id returned"),
    }
    RunResult {
        outcome: RunOutcome::InfraError,
        exit_code: None,
        container_id: None,
        message: "Error creating container".to_string(),
    }
}

/// `90s` → `1m30s`, `1800s` → `30m`.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    let mut out = String::new();
    if h > 0 {
        out.push_str(&format!("{h}h"));
    }
    if m > 0 {
        out.push_str(&format!("{m}m"));
    }
    if s > 0 || out.is_empty() {
        out.push_str(&format!("{s}s"));
    }
    out
}
