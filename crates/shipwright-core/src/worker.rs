//! The task queue and its single worker.
//!
//! Producers call [`Orchestrator::submit`] from any task and return immediately. One spawned
//! worker drains the queue in FIFO order and runs each task to completion (checkout, build,
//! optional run, report) before taking the next, so checkouts and the container daemon are
//! never used concurrently. Stop requests are honoured only between tasks.

use std::{
    any::Any,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

use anyhow::{anyhow, Result};
use futures::FutureExt;
use serde::Serialize;
use tokio::{
    sync::{broadcast, mpsc, watch, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    build::BuildDriver,
    checkout::CheckoutManager,
    repo::BuildRequest,
    report::{format_outcome, format_start, Reporter, DEFAULT_COMMAND_PREFIX},
    run::RunDriver,
    types::{Action, Task, TaskEvent, TaskOutcome, WorkerState},
};

/// Everything the worker needs to process one task. Owned by the worker task only.
pub struct Worker {
    checkout: CheckoutManager,
    builder: BuildDriver,
    runner: RunDriver,
    reporter: Reporter,
    default_host: String,
    command_prefix: String,
}

impl Worker {
    pub fn new(
        checkout: CheckoutManager,
        builder: BuildDriver,
        runner: RunDriver,
        reporter: Reporter,
    ) -> Self {
        Self {
            checkout,
            builder,
            runner,
            reporter,
            default_host: "github.com".to_string(),
            command_prefix: DEFAULT_COMMAND_PREFIX.to_string(),
        }
    }

    pub fn with_default_host(mut self, host: impl Into<String>) -> Self {
        self.default_host = host.into();
        self
    }

    pub fn with_command_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.command_prefix = prefix.into();
        self
    }

    /// Process a task and report its outcome. Never fails: every error ends up in the report.
    pub async fn handle(&mut self, task: &Task) -> TaskOutcome {
        let outcome = self.process(task).await;
        let text = format_outcome(task, &outcome, &self.command_prefix);
        if outcome.is_success() {
            info!(task_id = task.id, "{text}");
        }
        if !self.reporter.deliver(&task.channel, &text).await {
            warn!(task_id = task.id, "outcome could not be delivered to {}", task.channel);
        }
        outcome
    }

    /// Run a task without reporting its final outcome.
    pub async fn process(&mut self, task: &Task) -> TaskOutcome {
        info!(
            task_id = task.id,
            requester = %task.requester,
            action = %task.action,
            args = ?task.arguments,
            "processing task"
        );
        match task.action {
            Action::Help => TaskOutcome::Usage,
            Action::Build => self.handle_build(task).await,
            Action::Run => self.handle_run(task).await,
        }
    }

    async fn handle_build(&mut self, task: &Task) -> TaskOutcome {
        let request = match BuildRequest::parse(&task.arguments, &self.default_host) {
            Ok(r) => r,
            Err(e) => {
                info!(task_id = task.id, "usage: {e}");
                return TaskOutcome::Usage;
            }
        };
        let BuildRequest { repo, commit, run } = request;

        self.reporter
            .deliver(&task.channel, &format_start(&repo, commit.as_deref()))
            .await;

        let checkout = match self.checkout.prepare(&repo, commit.as_deref()).await {
            Ok(c) => c,
            Err(error) => {
                return TaskOutcome::CheckoutFailed {
                    repo,
                    commit,
                    error,
                }
            }
        };

        let build = match self.builder.build(&checkout.path).await {
            Ok(b) => b,
            Err(e) => {
                error!(task_id = task.id, repo = %repo.name, "build could not be started: {e:#}");
                return TaskOutcome::Infra {
                    context: repo.name.clone(),
                    message: format!("{e:#}"),
                };
            }
        };

        let run = match &build.image_id {
            Some(image) if run || task.run_after_build => Some(self.runner.run(image).await),
            _ => None,
        };

        TaskOutcome::Built {
            repo,
            commit: checkout.commit,
            build,
            run,
        }
    }

    /// Best-effort internal-error report for a task whose processing panicked.
    async fn report_panic(&self, task: &Task) {
        let outcome = TaskOutcome::Infra {
            context: task
                .arguments
                .first()
                .cloned()
                .unwrap_or_else(|| task.action.to_string()),
            message: "task processing panicked".to_string(),
        };
        let text = format_outcome(task, &outcome, &self.command_prefix);
        let delivered = AssertUnwindSafe(self.reporter.deliver(&task.channel, &text))
            .catch_unwind()
            .await;
        if !matches!(delivered, Ok(true)) {
            warn!(task_id = task.id, "internal error could not be delivered to {}", task.channel);
        }
    }

    async fn handle_run(&mut self, task: &Task) -> TaskOutcome {
        let image = match task.arguments.as_slice() {
            [image] if !image.trim().is_empty() => image.trim().to_string(),
            _ => {
                info!(task_id = task.id, "usage: run takes exactly one image id");
                return TaskOutcome::Usage;
            }
        };
        let run = self.runner.run(&image).await;
        TaskOutcome::Ran { image, run }
    }
}

/// Point-in-time view of the queue for status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStatus {
    pub worker: WorkerState,
    pub queued: usize,
    pub processed: u64,
}

/// Handle to the running worker. Construct once with [`Orchestrator::start`].
pub struct Orchestrator {
    tx: mpsc::UnboundedSender<Task>,
    cancel: CancellationToken,
    state_rx: watch::Receiver<WorkerState>,
    pub event_tx: broadcast::Sender<TaskEvent>,
    next_id: AtomicU64,
    queued: Arc<AtomicUsize>,
    processed: Arc<AtomicU64>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Spawn the worker on the current tokio runtime.
    pub fn start(worker: Worker) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(WorkerState::Idle);
        let (event_tx, _) = broadcast::channel(256);
        let cancel = CancellationToken::new();
        let queued = Arc::new(AtomicUsize::new(0));
        let processed = Arc::new(AtomicU64::new(0));

        let worker_loop = WorkerLoop {
            worker,
            rx,
            cancel: cancel.clone(),
            state_tx,
            event_tx: event_tx.clone(),
            queued: Arc::clone(&queued),
            processed: Arc::clone(&processed),
        };
        let handle = tokio::spawn(worker_loop.run());
        info!("worker started");

        Self {
            tx,
            cancel,
            state_rx,
            event_tx,
            next_id: AtomicU64::new(1),
            queued,
            processed,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Enqueue a task and return its id. Never waits on build work.
    pub fn submit(&self, mut task: Task) -> Result<u64> {
        if self.cancel.is_cancelled() {
            return Err(anyhow!("orchestrator is stopped"));
        }
        task.id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let id = task.id;
        let summary = format!("{} {}", task.action, task.arguments.join(" "));

        self.queued.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(task).is_err() {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            return Err(anyhow!("worker is not running"));
        }
        info!(task_id = id, "queued: {}", summary.trim_end());
        let _ = self.event_tx.send(TaskEvent::new("queued", id, summary.trim_end()));
        Ok(id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.event_tx.subscribe()
    }

    pub fn state(&self) -> watch::Receiver<WorkerState> {
        self.state_rx.clone()
    }

    pub fn status(&self) -> OrchestratorStatus {
        OrchestratorStatus {
            worker: *self.state_rx.borrow(),
            queued: self.queued.load(Ordering::SeqCst),
            processed: self.processed.load(Ordering::SeqCst),
        }
    }

    /// Request a stop and wait for the worker to finish its in-flight task.
    /// Tasks still queued are dropped; working directories are removed.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("worker task ended abnormally: {e}");
            }
        }
    }
}

struct WorkerLoop {
    worker: Worker,
    rx: mpsc::UnboundedReceiver<Task>,
    cancel: CancellationToken,
    state_tx: watch::Sender<WorkerState>,
    event_tx: broadcast::Sender<TaskEvent>,
    queued: Arc<AtomicUsize>,
    processed: Arc<AtomicU64>,
}

impl WorkerLoop {
    async fn run(mut self) {
        loop {
            let _ = self.state_tx.send(WorkerState::Idle);
            let task = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                task = self.rx.recv() => match task {
                    Some(t) => t,
                    None => break,
                },
            };
            self.queued.fetch_sub(1, Ordering::SeqCst);

            let _ = self
                .state_tx
                .send(WorkerState::Processing { task_id: task.id });
            let _ = self.event_tx.send(TaskEvent::new("started", task.id, task.action.as_str()));

            // A panicking collaborator fails this task only; the loop keeps serving the queue.
            let handled = AssertUnwindSafe(self.worker.handle(&task))
                .catch_unwind()
                .await;
            let success = match handled {
                Ok(outcome) => outcome.is_success(),
                Err(payload) => {
                    error!(task_id = task.id, "task panicked: {}", panic_message(&*payload));
                    self.worker.report_panic(&task).await;
                    false
                }
            };

            self.processed.fetch_add(1, Ordering::SeqCst);
            let kind = if success { "success" } else { "failure" };
            let _ = self.event_tx.send(TaskEvent::new("reported", task.id, kind));
        }

        self.rx.close();
        while let Ok(task) = self.rx.try_recv() {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            warn!(task_id = task.id, "worker stopping, dropping queued task");
            let _ = self.event_tx.send(TaskEvent::new("dropped", task.id, task.action.as_str()));
        }

        let _ = self.state_tx.send(WorkerState::Stopped);
        info!("worker stopped");
        // Dropping the worker removes every tracked working directory.
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}
