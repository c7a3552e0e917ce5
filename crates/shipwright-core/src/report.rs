//! Outcome text and best-effort delivery.
//!
//! Formatting is pure; delivery goes through a [`Notifier`] with a timeout and never fails the
//! caller. Raw command output stays in the logs and never reaches a message.

use std::{sync::Arc, time::Duration};

use tracing::{debug, warn};

use crate::{
    error::CheckoutError,
    notify::Notifier,
    repo::RepoRef,
    types::{short_commit, short_id, Task, TaskOutcome},
};

pub const DEFAULT_COMMAND_PREFIX: &str = "!docker";

/// Help text for the chat trigger `prefix`.
pub fn usage(prefix: &str) -> String {
    format!(
        "usage: {prefix} <command> [<args>]

Available commands:
   build <repository> [<commit>] [--run]   checkout and build an image (owner/name or a git URL)
   build_url <repository url>              alias of build
   run <image id>                          create and run a container
   help                                    show this help"
    )
}

/// Notice sent when a build task is picked up.
pub fn format_start(repo: &RepoRef, commit: Option<&str>) -> String {
    format!("{} Starting build", context(repo, commit))
}

/// The terminal message for a task. `prefix` is the chat trigger shown in usage text.
pub fn format_outcome(task: &Task, outcome: &TaskOutcome, prefix: &str) -> String {
    match outcome {
        TaskOutcome::Usage => usage(prefix),

        TaskOutcome::CheckoutFailed {
            repo,
            commit,
            error,
        } => {
            let reason = match error {
                CheckoutError::Infra(_) => "checkout failed due to an internal error".to_string(),
                other => other.to_string(),
            };
            format!("{} {reason}", context(repo, commit.as_deref()))
        }

        TaskOutcome::Built {
            repo,
            commit,
            build,
            run,
        } => {
            let ctx = context(repo, Some(commit));
            match (&build.image_id, run) {
                (None, _) => format!(
                    "{ctx} build success marker not found in build output: `{}`",
                    build.message
                ),
                (Some(image), None) => format!("{ctx} Successfully built `{image}`"),
                (Some(image), Some(run)) => format!(
                    "{ctx} Successfully built `{image}`; {}",
                    run.message
                ),
            }
        }

        TaskOutcome::Ran { image, run } => format!("[{}] {}", short_id(image), run.message),

        TaskOutcome::Infra { context, .. } => {
            format!("[{context}] {} failed due to an internal error", task.action)
        }
    }
}

fn context(repo: &RepoRef, commit: Option<&str>) -> String {
    match commit {
        Some(c) if !c.is_empty() => format!("[{} ({})]", repo.name, short_commit(c)),
        _ => format!("[{}]", repo.name),
    }
}

/// Hands formatted text to the notifier. Never returns an error.
pub struct Reporter {
    notifier: Arc<dyn Notifier>,
    timeout: Duration,
}

impl Reporter {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self {
            notifier,
            timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Deliver `text` to `channel`; returns whether delivery succeeded. Failures are logged.
    pub async fn deliver(&self, channel: &str, text: &str) -> bool {
        debug!(channel = %channel, "SEND {text}");
        match tokio::time::timeout(self.timeout, self.notifier.notify(channel, text)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(channel = %channel, "notification failed: {e:#}");
                false
            }
            Err(_) => {
                warn!(channel = %channel, timeout_s = self.timeout.as_secs(), "notification timed out");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Action;

    #[test]
    fn usage_names_the_configured_prefix() {
        let task = Task::new("alice", "#ops", Action::Help, vec![]);
        let text = format_outcome(&task, &TaskOutcome::Usage, "!ci");
        assert!(text.starts_with("usage: !ci <command>"));
        assert!(!text.contains("!docker"));
    }
}
