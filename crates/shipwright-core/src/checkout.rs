//! Per-repository working directories: clone on first use, fetch + checkout afterwards, and
//! verify HEAD before handing the directory to the build.
//!
//! The manager is owned by the worker and only ever touched from it, so it takes `&mut self`
//! and carries no locks.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use tempfile::TempDir;
use tracing::{debug, error, info, warn};

use crate::{
    error::{CheckoutError, VcsStep},
    git::{ExecResult, VersionControl},
    repo::{is_commit_sha, RepoRef},
    types::short_commit,
};

/// Local checkout of one repository. The directory is removed when the state is dropped.
pub struct RepositoryState {
    pub repository_key: String,
    dir: TempDir,
    pub last_known_commit: Option<String>,
}

impl RepositoryState {
    pub fn working_directory(&self) -> &Path {
        self.dir.path()
    }
}

/// A verified checkout ready to build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkout {
    pub path: PathBuf,
    /// Full commit id HEAD resolved to after checkout.
    pub commit: String,
}

pub struct CheckoutManager {
    vcs: Arc<dyn VersionControl>,
    workspace_root: PathBuf,
    repos: HashMap<String, RepositoryState>,
}

impl CheckoutManager {
    pub fn new(vcs: Arc<dyn VersionControl>, workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            vcs,
            workspace_root: workspace_root.into(),
            repos: HashMap::new(),
        }
    }

    pub fn state(&self, repository_key: &str) -> Option<&RepositoryState> {
        self.repos.get(repository_key)
    }

    pub fn tracked(&self) -> usize {
        self.repos.len()
    }

    /// Clone or refresh `repo`, check out `target` (or the remote default branch head) and
    /// verify HEAD. Never returns a directory at a commit other than the one resolved.
    pub async fn prepare(
        &mut self,
        repo: &RepoRef,
        target: Option<&str>,
    ) -> Result<Checkout, CheckoutError> {
        let key = repo.key().to_string();

        let has_checkout = self
            .repos
            .get(&key)
            .map(|state| state.working_directory().join(".git").is_dir());
        let reusable = match has_checkout {
            Some(true) => true,
            Some(false) => {
                warn!(
                    repo = %repo.name,
                    "working directory is gone or not a git checkout, cloning again"
                );
                self.discard(&key);
                false
            }
            None => false,
        };

        if reusable {
            let path = self.path_of(&key)?;
            info!(repo = %repo.name, dir = %path.display(), "refreshing working directory");
            let result = self.vcs.fetch(&path).await?;
            ensure_success(VcsStep::Fetch, result)?;
        } else {
            let state = self.clone_fresh(repo).await?;
            self.repos.insert(key.clone(), state);
        }

        let path = self.path_of(&key)?;
        match self.checkout_verified(&path, target).await {
            Ok(commit) => {
                info!(repo = %repo.name, commit = %short_commit(&commit), "checkout verified");
                if let Some(state) = self.repos.get_mut(&key) {
                    state.last_known_commit = Some(commit.clone());
                }
                Ok(Checkout { path, commit })
            }
            Err(e) => {
                error!(repo = %repo.name, "{e}");
                if e.is_integrity() {
                    // HEAD and the requested commit disagree; the checkout can't be trusted.
                    self.discard(&key);
                }
                Err(e)
            }
        }
    }

    /// Remove every tracked working directory. Failures are logged only.
    pub fn cleanup(&mut self) {
        for (key, state) in self.repos.drain() {
            let dir = state.working_directory().display().to_string();
            match state.dir.close() {
                Ok(()) => info!(repo = %key, "removed working directory {dir}"),
                Err(e) => warn!(repo = %key, "failed to remove working directory {dir}: {e}"),
            }
        }
    }

    async fn clone_fresh(&self, repo: &RepoRef) -> Result<RepositoryState, CheckoutError> {
        std::fs::create_dir_all(&self.workspace_root).with_context(|| {
            format!(
                "failed to create workspace root {}",
                self.workspace_root.display()
            )
        })?;
        let dir = tempfile::Builder::new()
            .prefix("shipwright-")
            .tempdir_in(&self.workspace_root)
            .context("failed to create working directory")?;

        info!(repo = %repo.name, dir = %dir.path().display(), "cloning {}", repo.url);
        // On failure `dir` is dropped here and the partial clone goes with it.
        let result = self.vcs.clone_repo(&repo.url, dir.path()).await?;
        ensure_success(VcsStep::Clone, result)?;

        Ok(RepositoryState {
            repository_key: repo.key().to_string(),
            dir,
            last_known_commit: None,
        })
    }

    async fn checkout_verified(
        &self,
        path: &Path,
        target: Option<&str>,
    ) -> Result<String, CheckoutError> {
        let target = match target {
            None => self.resolve(path, "origin/HEAD").await?,
            Some(sha) if is_commit_sha(sha) => sha.to_ascii_lowercase(),
            Some(branch) => self.resolve(path, &format!("origin/{branch}")).await?,
        };

        let result = self.vcs.checkout(path, &target).await?;
        ensure_success(VcsStep::Checkout, result)?;

        let head = self.resolve(path, "HEAD").await?;
        if !commit_matches(&target, &head) {
            return Err(CheckoutError::IntegrityMismatch {
                step: VcsStep::Checkout,
                expected: target,
                actual: head,
            });
        }
        Ok(head)
    }

    async fn resolve(&self, path: &Path, refname: &str) -> Result<String, CheckoutError> {
        let result = self.vcs.rev_parse(path, refname).await?;
        let result = ensure_success(VcsStep::RevParse, result)?;
        Ok(result.stdout.trim().to_ascii_lowercase())
    }

    fn path_of(&self, key: &str) -> Result<PathBuf, CheckoutError> {
        self.repos
            .get(key)
            .map(|s| s.working_directory().to_path_buf())
            .ok_or_else(|| CheckoutError::Infra(anyhow::anyhow!("no working directory for {key}")))
    }

    fn discard(&mut self, key: &str) {
        if let Some(state) = self.repos.remove(key) {
            let dir = state.working_directory().display().to_string();
            if let Err(e) = state.dir.close() {
                warn!(repo = %key, "failed to remove working directory {dir}: {e}");
            }
        }
    }
}

impl Drop for CheckoutManager {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn ensure_success(step: VcsStep, result: ExecResult) -> Result<ExecResult, CheckoutError> {
    if result.success() {
        return Ok(result);
    }
    debug!(
        step = %step,
        "`{}` failed\nstdout:\n{}\nstderr:\n{}",
        result.command,
        result.stdout,
        result.stderr
    );
    Err(CheckoutError::CommandFailed {
        step,
        command: result.command.clone(),
        exit_code: result.exit_code,
        output: result.combined_output(),
    })
}

/// Full ids must match exactly; an abbreviated hex target matches by prefix.
fn commit_matches(expected: &str, actual: &str) -> bool {
    if actual.is_empty() {
        return false;
    }
    if expected.len() < actual.len() && is_commit_sha(expected) {
        actual.starts_with(expected)
    } else {
        expected == actual
    }
}
