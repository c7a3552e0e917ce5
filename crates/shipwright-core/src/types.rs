use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{error::CheckoutError, repo::RepoRef};

// ── Task ─────────────────────────────────────────────────────────────────

/// What a task asks the worker to do. Resolved once when the task is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Help,
    Build,
    Run,
}

impl Action {
    /// Parse a chat action word. `build_url` is accepted as an alias of `build`.
    pub fn parse(word: &str) -> Option<Self> {
        match word.trim().to_ascii_lowercase().as_str() {
            "help" => Some(Self::Help),
            "build" | "build_url" => Some(Self::Build),
            "run" => Some(Self::Run),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Help => "help",
            Self::Build => "build",
            Self::Run => "run",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of requested work. Immutable once enqueued.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Assigned by the orchestrator on submit; 0 until then.
    pub id: u64,
    pub requester: String,
    /// Notification channel the outcome is reported to.
    pub channel: String,
    pub action: Action,
    pub arguments: Vec<String>,
    /// Run the built image once the build succeeds.
    pub run_after_build: bool,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        requester: impl Into<String>,
        channel: impl Into<String>,
        action: Action,
        arguments: Vec<String>,
    ) -> Self {
        Self {
            id: 0,
            requester: requester.into(),
            channel: channel.into(),
            action,
            arguments,
            run_after_build: false,
            created_at: Utc::now(),
        }
    }

    pub fn with_run_after_build(mut self, run: bool) -> Self {
        self.run_after_build = run;
        self
    }
}

// ── Build / run results ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildOutcome {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildResult {
    pub outcome: BuildOutcome,
    pub image_id: Option<String>,
    /// On success the marker line; on failure the last line of build output.
    pub message: String,
}

impl BuildResult {
    pub fn success(image_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            outcome: BuildOutcome::Success,
            image_id: Some(image_id.into()),
            message: message.into(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            outcome: BuildOutcome::Failure,
            image_id: None,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == BuildOutcome::Success
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    NonZeroExit,
    Timeout,
    InfraError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    pub outcome: RunOutcome,
    pub exit_code: Option<i64>,
    pub container_id: Option<String>,
    pub message: String,
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        self.outcome == RunOutcome::Success
    }

    /// First 10 characters of the container id, as shown to users.
    pub fn short_container_id(&self) -> &str {
        self.container_id.as_deref().map(short_id).unwrap_or("")
    }
}

pub fn short_id(id: &str) -> &str {
    truncate_chars(id.strip_prefix("sha256:").unwrap_or(id), 10)
}

pub fn short_commit(commit: &str) -> &str {
    truncate_chars(commit, 7)
}

fn truncate_chars(s: &str, n: usize) -> &str {
    match s.char_indices().nth(n) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

// ── Terminal classification of a task ────────────────────────────────────

/// What happened to a task, handed to the reporter once processing ends.
#[derive(Debug)]
pub enum TaskOutcome {
    /// Malformed input; the usage text is the whole result.
    Usage,
    CheckoutFailed {
        repo: RepoRef,
        commit: Option<String>,
        error: CheckoutError,
    },
    Built {
        repo: RepoRef,
        commit: String,
        build: BuildResult,
        run: Option<RunResult>,
    },
    Ran {
        image: String,
        run: RunResult,
    },
    /// Toolchain unreachable or another unexpected failure.
    Infra {
        context: String,
        message: String,
    },
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        match self {
            Self::Built { build, run, .. } => {
                build.is_success() && run.as_ref().map(RunResult::is_success).unwrap_or(true)
            }
            Self::Ran { run, .. } => run.is_success(),
            Self::Usage | Self::CheckoutFailed { .. } | Self::Infra { .. } => false,
        }
    }
}

// ── Worker observability ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Processing { task_id: u64 },
    Stopped,
}

/// Lifecycle event broadcast by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    /// "queued" | "started" | "reported" | "dropped"
    pub kind: String,
    pub task_id: u64,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl TaskEvent {
    pub fn new(kind: &str, task_id: u64, message: impl Into<String>) -> Self {
        Self {
            kind: kind.to_string(),
            task_id,
            message: message.into(),
            at: Utc::now(),
        }
    }
}
