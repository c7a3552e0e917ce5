//! Typed failures surfaced to requesters.
//!
//! Plumbing errors elsewhere in the crate are `anyhow::Error`; the types here exist because the
//! worker has to tell these cases apart when classifying a task's outcome.

use std::fmt;

use thiserror::Error;

/// The version-control step that failed, named the way users see it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcsStep {
    Clone,
    Fetch,
    Checkout,
    RevParse,
}

impl VcsStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Clone => "git clone",
            Self::Fetch => "git fetch",
            Self::Checkout => "git checkout",
            Self::RevParse => "git rev-parse",
        }
    }
}

impl fmt::Display for VcsStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum CheckoutError {
    /// A git subprocess exited non-zero. `output` is for diagnostic logs only.
    #[error("`{step}` returned a non-zero error code ({exit_code})")]
    CommandFailed {
        step: VcsStep,
        command: String,
        exit_code: i32,
        output: String,
    },

    /// HEAD after checkout is not the commit that was asked for.
    #[error("`{step}` did not fetch/checkout the expected commit")]
    IntegrityMismatch {
        step: VcsStep,
        expected: String,
        actual: String,
    },

    /// git could not be started, or the working directory could not be created.
    #[error("checkout infrastructure error: {0:#}")]
    Infra(#[from] anyhow::Error),
}

impl CheckoutError {
    pub fn is_integrity(&self) -> bool {
        matches!(self, Self::IntegrityMismatch { .. })
    }
}

/// Malformed task input. Recovered by replying with the usage text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UsageError {
    #[error("missing argument: {0}")]
    MissingArgument(&'static str),

    #[error("not a repository identifier: {0}")]
    BadIdentifier(String),

    #[error("unexpected argument: {0}")]
    UnexpectedArgument(String),
}
