//! Repository identifiers and build arguments.
//!
//! Accepted identifiers:
//! - `owner/name` shorthand, expanded to `git+ssh://<host>/owner/name.git`;
//! - a full URL with scheme `git`, `git+ssh`, `ssh`, `http` or `https`, or the
//!   `git@host:path` form, ending in `.git` with an optional trailing slash.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::UsageError;

static URL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:(?:git|git\+ssh|ssh|https?)://|git@[\w.\-]+:(?://)?)[\w.@:/\-~]+\.git/?$")
        .expect("repository URL pattern is valid")
});

static SHORTHAND_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([\w.\-]+)/([\w.\-]+)$").expect("repository shorthand pattern is valid")
});

static HEX_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9a-fA-F]{7,40}$").expect("hex pattern is valid"));

/// A validated repository: where to clone it from and how to name it in reports.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoRef {
    /// Clone URL, trailing slash removed. Also the key of the checkout map.
    pub url: String,
    /// Short human name, usually `owner/name`.
    pub name: String,
}

impl RepoRef {
    pub fn parse(identifier: &str, default_host: &str) -> Result<Self, UsageError> {
        let identifier = identifier.trim();

        if let Some(caps) = SHORTHAND_REGEX.captures(identifier) {
            let owner = &caps[1];
            let name = caps[2].strip_suffix(".git").unwrap_or(&caps[2]);
            if is_dot_segment(owner) || name.is_empty() || is_dot_segment(name) {
                return Err(UsageError::BadIdentifier(identifier.to_string()));
            }
            return Ok(Self {
                url: format!("git+ssh://{default_host}/{owner}/{name}.git"),
                name: format!("{owner}/{name}"),
            });
        }

        if URL_REGEX.is_match(identifier) {
            let url = identifier.trim_end_matches('/').to_string();
            let name = display_name(&url);
            return Ok(Self { url, name });
        }

        Err(UsageError::BadIdentifier(identifier.to_string()))
    }

    /// The repository key used by the checkout manager.
    pub fn key(&self) -> &str {
        &self.url
    }
}

fn is_dot_segment(s: &str) -> bool {
    s == "." || s == ".."
}

/// `git@github.com:org/repo.git` → `org/repo`; falls back to the URL itself.
fn display_name(url: &str) -> String {
    let path = url.strip_suffix(".git").unwrap_or(url);
    let path = path.rsplit_once("://").map(|(_, rest)| rest).unwrap_or(path);
    let segments: Vec<&str> = path
        .split(['/', ':'])
        .filter(|s| !s.is_empty())
        .collect();
    match segments.as_slice() {
        [.., owner, name] if segments.len() >= 3 => format!("{owner}/{name}"),
        [_, name] => name.to_string(),
        _ => url.to_string(),
    }
}

/// Whether a commit target is a (possibly abbreviated) hex object id.
pub fn is_commit_sha(target: &str) -> bool {
    HEX_REGEX.is_match(target)
}

/// Parsed arguments of a `build` task: `<identifier> [<commit-or-branch>] [--run]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    pub repo: RepoRef,
    pub commit: Option<String>,
    pub run: bool,
}

impl BuildRequest {
    pub fn parse(arguments: &[String], default_host: &str) -> Result<Self, UsageError> {
        let mut run = false;
        let mut positional = Vec::new();
        for arg in arguments {
            match arg.as_str() {
                "--run" => run = true,
                // Neither an identifier nor a git ref starts with these.
                other if other.starts_with(['-', '+']) => {
                    return Err(UsageError::UnexpectedArgument(other.to_string()))
                }
                other => positional.push(other),
            }
        }

        let mut positional = positional.into_iter();
        let identifier = positional
            .next()
            .ok_or(UsageError::MissingArgument("repository"))?;
        let repo = RepoRef::parse(identifier, default_host)?;
        let commit = positional.next().map(str::to_string);
        if let Some(extra) = positional.next() {
            return Err(UsageError::UnexpectedArgument(extra.to_string()));
        }

        Ok(Self { repo, commit, run })
    }
}
