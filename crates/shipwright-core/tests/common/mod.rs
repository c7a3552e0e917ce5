#![allow(dead_code)]

use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use shipwright_core::{
    build::BuildDriver,
    checkout::CheckoutManager,
    git::{ExecResult, VersionControl},
    notify::Notifier,
    report::Reporter,
    run::RunDriver,
    toolchain::{BuildOptions, ContainerToolchain},
    worker::Worker,
};
use tokio::sync::Notify;

pub type CallLog = Arc<Mutex<Vec<String>>>;

pub const DEFAULT_HEAD: &str = "1111111111111111111111111111111111111111";

fn ok(command: String, stdout: &str) -> ExecResult {
    ExecResult {
        command,
        stdout: stdout.to_string(),
        stderr: String::new(),
        exit_code: 0,
    }
}

fn failed(command: String, code: i32, stderr: &str) -> ExecResult {
    ExecResult {
        command,
        stdout: String::new(),
        stderr: stderr.to_string(),
        exit_code: code,
    }
}

// ── git ──────────────────────────────────────────────────────────────────────

/// In-memory git: clone creates `.git`, checkout moves HEAD, rev-parse answers from a table.
pub struct FakeGit {
    pub log: CallLog,
    /// `origin/<branch>` → commit.
    pub remote: Mutex<HashMap<String, String>>,
    head: Mutex<String>,
    /// Forces HEAD to this value regardless of what was checked out.
    pub head_override: Mutex<Option<String>>,
    pub fail_fetch: Mutex<bool>,
    pub fail_clone: Mutex<bool>,
}

impl FakeGit {
    pub fn new(log: CallLog) -> Self {
        let remote = HashMap::from([
            ("origin/HEAD".to_string(), DEFAULT_HEAD.to_string()),
            (
                "origin/main".to_string(),
                "2222222222222222222222222222222222222222".to_string(),
            ),
        ]);
        Self {
            log,
            remote: Mutex::new(remote),
            head: Mutex::new(String::new()),
            head_override: Mutex::new(None),
            fail_fetch: Mutex::new(false),
            fail_clone: Mutex::new(false),
        }
    }

    fn record(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }
}

/// A hex target checks out as itself padded to a full object id.
fn full_commit(target: &str) -> String {
    if target.len() < 40 && target.chars().all(|c| c.is_ascii_hexdigit()) {
        format!("{target:0<40}")
    } else {
        target.to_string()
    }
}

#[async_trait]
impl VersionControl for FakeGit {
    async fn clone_repo(&self, url: &str, dest: &Path) -> Result<ExecResult> {
        self.record(format!("clone {url}"));
        if *self.fail_clone.lock().unwrap() {
            return Ok(failed(format!("git clone {url}"), 128, "fatal: repository not found"));
        }
        std::fs::create_dir_all(dest.join(".git"))?;
        Ok(ok(format!("git clone {url}"), ""))
    }

    async fn fetch(&self, _dir: &Path) -> Result<ExecResult> {
        self.record("fetch".to_string());
        if *self.fail_fetch.lock().unwrap() {
            return Ok(failed("git fetch".into(), 1, "fatal: unable to access remote"));
        }
        Ok(ok("git fetch".into(), ""))
    }

    async fn checkout(&self, _dir: &Path, target: &str) -> Result<ExecResult> {
        self.record(format!("checkout {target}"));
        *self.head.lock().unwrap() = full_commit(target);
        Ok(ok(format!("git checkout {target}"), ""))
    }

    async fn rev_parse(&self, _dir: &Path, refname: &str) -> Result<ExecResult> {
        self.record(format!("rev-parse {refname}"));
        let command = format!("git rev-parse {refname}");
        if refname == "HEAD" {
            let head = match self.head_override.lock().unwrap().clone() {
                Some(h) => h,
                None => self.head.lock().unwrap().clone(),
            };
            return Ok(ok(command, &format!("{head}\n")));
        }
        match self.remote.lock().unwrap().get(refname) {
            Some(commit) => Ok(ok(command, &format!("{commit}\n"))),
            None => Ok(failed(command, 128, "fatal: Needed a single revision")),
        }
    }
}

// ── container toolchain ─────────────────────────────────────────────────────

pub const CONTAINER_ID: &str = "c0ffee00112233445566778899aabbccddeeff";

pub struct FakeDocker {
    pub log: CallLog,
    pub build_output: Mutex<Vec<String>>,
    pub build_error: Mutex<bool>,
    pub create_none: Mutex<bool>,
    pub exit_code: Mutex<i64>,
    /// `wait` never returns.
    pub hang: Mutex<bool>,
    /// When set, `wait` blocks until notified.
    pub gate: Mutex<Option<Arc<Notify>>>,
    pub stop_fails: Mutex<bool>,
}

impl FakeDocker {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            build_output: Mutex::new(vec![
                "Step 1/2 : FROM scratch".to_string(),
                "Step 2/2 : CMD [\"true\"]".to_string(),
                "Successfully built 1a2b3c4d".to_string(),
            ]),
            build_error: Mutex::new(false),
            create_none: Mutex::new(false),
            exit_code: Mutex::new(0),
            hang: Mutex::new(false),
            gate: Mutex::new(None),
            stop_fails: Mutex::new(false),
        }
    }

    fn record(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }
}

#[async_trait]
impl ContainerToolchain for FakeDocker {
    async fn build(&self, _context: &Path, opts: BuildOptions) -> Result<Vec<String>> {
        self.record(format!("build rm={}", opts.remove_intermediate));
        if *self.build_error.lock().unwrap() {
            return Err(anyhow!("Cannot connect to the Docker daemon"));
        }
        Ok(self.build_output.lock().unwrap().clone())
    }

    async fn create(&self, image: &str) -> Result<Option<String>> {
        self.record(format!("create {image}"));
        if *self.create_none.lock().unwrap() {
            return Ok(None);
        }
        Ok(Some(CONTAINER_ID.to_string()))
    }

    async fn start(&self, container: &str) -> Result<()> {
        self.record(format!("start {}", &container[..10]));
        Ok(())
    }

    async fn wait(&self, container: &str) -> Result<i64> {
        self.record(format!("wait {}", &container[..10]));
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let hang = *self.hang.lock().unwrap();
        if hang {
            std::future::pending::<()>().await;
        }
        Ok(*self.exit_code.lock().unwrap())
    }

    async fn stop(&self, container: &str, grace: Duration) -> Result<()> {
        self.record(format!("stop {} {}s", &container[..10], grace.as_secs()));
        if *self.stop_fails.lock().unwrap() {
            return Err(anyhow!("stop failed"));
        }
        Ok(())
    }

    async fn kill(&self, container: &str) -> Result<()> {
        self.record(format!("kill {}", &container[..10]));
        Ok(())
    }

    async fn remove(&self, container: &str) -> Result<()> {
        self.record(format!("remove {}", &container[..10]));
        Ok(())
    }
}

// ── notifier ────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<(String, String)>>,
    pub fail: Mutex<bool>,
    /// Panic when a message starts with this text.
    pub panic_on: Mutex<Option<String>>,
    /// Also record `notify <text>` into a log shared with other fakes.
    pub shared_log: Mutex<Option<CallLog>>,
}

impl RecordingNotifier {
    pub fn texts(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|(_, t)| t.clone()).collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, channel: &str, text: &str) -> Result<()> {
        if let Some(log) = self.shared_log.lock().unwrap().as_ref() {
            log.lock().unwrap().push(format!("notify {text}"));
        }
        let panic_on = self.panic_on.lock().unwrap().clone();
        if let Some(prefix) = panic_on {
            if text.starts_with(&prefix) {
                panic!("notifier blew up on {prefix:?}");
            }
        }
        self.sent
            .lock()
            .unwrap()
            .push((channel.to_string(), text.to_string()));
        if *self.fail.lock().unwrap() {
            return Err(anyhow!("chat service unavailable"));
        }
        Ok(())
    }
}

// ── harness ─────────────────────────────────────────────────────────────────

pub struct Harness {
    pub git_log: CallLog,
    pub docker_log: CallLog,
    pub git: Arc<FakeGit>,
    pub docker: Arc<FakeDocker>,
    pub notifier: Arc<RecordingNotifier>,
    pub workspace: tempfile::TempDir,
}

impl Harness {
    pub fn new() -> Self {
        let git_log = CallLog::default();
        let docker_log = CallLog::default();
        Self {
            git: Arc::new(FakeGit::new(git_log.clone())),
            docker: Arc::new(FakeDocker::new(docker_log.clone())),
            git_log,
            docker_log,
            notifier: Arc::new(RecordingNotifier::default()),
            workspace: tempfile::tempdir().unwrap(),
        }
    }

    pub fn checkout_manager(&self) -> CheckoutManager {
        CheckoutManager::new(self.git.clone(), self.workspace.path())
    }

    pub fn worker(&self) -> Worker {
        Worker::new(
            self.checkout_manager(),
            BuildDriver::new(self.docker.clone()),
            RunDriver::new(self.docker.clone()),
            Reporter::new(self.notifier.clone()),
        )
    }

    pub fn git_calls(&self) -> Vec<String> {
        self.git_log.lock().unwrap().clone()
    }

    pub fn docker_calls(&self) -> Vec<String> {
        self.docker_log.lock().unwrap().clone()
    }
}
