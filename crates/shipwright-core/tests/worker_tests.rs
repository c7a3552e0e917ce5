mod common;

use std::{sync::Arc, time::Duration};

use common::Harness;
use shipwright_core::{
    report::usage,
    types::{Action, Task, TaskEvent, TaskOutcome, WorkerState},
    worker::Orchestrator,
};
use tokio::sync::{broadcast, Notify};

fn build(args: &[&str]) -> Task {
    Task::new(
        "alice",
        "#builder",
        Action::Build,
        args.iter().map(|a| a.to_string()).collect(),
    )
}

fn run(image: &str) -> Task {
    Task::new("alice", "#builder", Action::Run, vec![image.to_string()])
}

/// Collect events until `n` of `kind` have been seen.
async fn wait_for_events(rx: &mut broadcast::Receiver<TaskEvent>, kind: &str, n: usize) -> Vec<TaskEvent> {
    let mut seen = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), async {
        while seen.len() < n {
            let evt = rx.recv().await.unwrap();
            if evt.kind == kind {
                seen.push(evt);
            }
        }
    })
    .await
    .unwrap();
    seen
}

// ── worker ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn build_of_shorthand_at_commit_end_to_end() {
    let h = Harness::new();
    let mut worker = h.worker();

    let outcome = worker.handle(&build(&["org/repo", "abcdef01"])).await;

    assert!(outcome.is_success());
    assert_eq!(h.git_calls()[0], "clone git+ssh://github.com/org/repo.git");
    assert_eq!(
        h.notifier.texts(),
        vec![
            "[org/repo (abcdef0)] Starting build",
            "[org/repo (abcdef0)] Successfully built `1a2b3c4d`",
        ]
    );
    // No run without --run.
    assert!(!h.docker_calls().iter().any(|c| c.starts_with("create")));
}

#[tokio::test]
async fn build_with_run_flag_runs_the_image() {
    let h = Harness::new();
    let mut worker = h.worker();

    let outcome = worker.handle(&build(&["org/repo", "--run"])).await;

    match &outcome {
        TaskOutcome::Built { run: Some(run), .. } => assert!(run.is_success()),
        other => panic!("unexpected outcome: {other:?}"),
    }
    let last = h.notifier.texts().pop().unwrap();
    assert_eq!(
        last,
        "[org/repo (1111111)] Successfully built `1a2b3c4d`; Container `c0ffee0011` exited successfully"
    );
}

#[tokio::test]
async fn run_after_build_is_honoured_for_push_tasks() {
    let h = Harness::new();
    let mut worker = h.worker();

    worker
        .handle(&build(&["org/repo"]).with_run_after_build(true))
        .await;

    assert!(h.docker_calls().contains(&"create 1a2b3c4d".to_string()));
}

#[tokio::test]
async fn malformed_identifier_never_touches_the_toolchains() {
    let h = Harness::new();
    let mut worker = h.worker();

    let outcome = worker.handle(&build(&["not a repo!"])).await;

    assert!(matches!(outcome, TaskOutcome::Usage));
    assert!(h.git_calls().is_empty());
    assert!(h.docker_calls().is_empty());
    assert_eq!(h.notifier.texts(), vec![usage("!docker")]);
}

#[tokio::test]
async fn missing_repository_is_usage() {
    let h = Harness::new();
    let mut worker = h.worker();

    assert!(matches!(worker.handle(&build(&[])).await, TaskOutcome::Usage));
    assert!(matches!(
        worker.handle(&Task::new("a", "#c", Action::Run, vec![])).await,
        TaskOutcome::Usage
    ));
}

#[tokio::test]
async fn failed_build_reports_last_line() {
    let h = Harness::new();
    *h.docker.build_output.lock().unwrap() = vec![
        "Step 1/2 : FROM alpine".to_string(),
        "Error: something failed".to_string(),
    ];
    let mut worker = h.worker();

    let outcome = worker.handle(&build(&["org/repo"])).await;

    assert!(!outcome.is_success());
    assert_eq!(
        h.notifier.texts().pop().unwrap(),
        "[org/repo (1111111)] build success marker not found in build output: `Error: something failed`"
    );
}

#[tokio::test]
async fn checkout_failure_is_reported_without_command_output() {
    let h = Harness::new();
    *h.git.fail_clone.lock().unwrap() = true;
    let mut worker = h.worker();

    let outcome = worker.handle(&build(&["org/repo"])).await;

    assert!(matches!(outcome, TaskOutcome::CheckoutFailed { .. }));
    let text = h.notifier.texts().pop().unwrap();
    assert_eq!(text, "[org/repo] `git clone` returned a non-zero error code (128)");
    assert!(h.docker_calls().is_empty());
}

#[tokio::test]
async fn unreachable_toolchain_is_an_internal_error() {
    let h = Harness::new();
    *h.docker.build_error.lock().unwrap() = true;
    let mut worker = h.worker();

    let outcome = worker.handle(&build(&["org/repo"])).await;

    assert!(matches!(outcome, TaskOutcome::Infra { .. }));
    assert_eq!(
        h.notifier.texts().pop().unwrap(),
        "[org/repo] build failed due to an internal error"
    );
}

#[tokio::test]
async fn run_action_reports_exit_code() {
    let h = Harness::new();
    *h.docker.exit_code.lock().unwrap() = 2;
    let mut worker = h.worker();

    let outcome = worker.handle(&run("sha256:deadbeefcafe0000")).await;

    assert!(!outcome.is_success());
    assert_eq!(
        h.notifier.texts(),
        vec!["[deadbeefca] Container `c0ffee0011` returned a non-zero exit code `2`"]
    );
}

// ── orchestrator ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn tasks_are_processed_in_submission_order() {
    let h = Harness::new();
    let orch = Orchestrator::start(h.worker());
    let mut events = orch.subscribe();

    let ids: Vec<u64> = (0..5)
        .map(|i| orch.submit(run(&format!("image{i}"))).unwrap())
        .collect();
    let started = wait_for_events(&mut events, "started", 5).await;

    assert_eq!(started.iter().map(|e| e.task_id).collect::<Vec<_>>(), ids);
    orch.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_producers_keep_their_own_order() {
    let h = Harness::new();
    let orch = Arc::new(Orchestrator::start(h.worker()));
    let mut events = orch.subscribe();

    let producers: Vec<_> = (0..4)
        .map(|p| {
            let orch = Arc::clone(&orch);
            tokio::spawn(async move {
                (0..5)
                    .map(|i| orch.submit(run(&format!("p{p}-{i}"))).unwrap())
                    .collect::<Vec<u64>>()
            })
        })
        .collect();
    let mut per_producer = Vec::new();
    for p in producers {
        per_producer.push(p.await.unwrap());
    }

    let reported = wait_for_events(&mut events, "reported", 20).await;
    let order: Vec<u64> = reported.iter().map(|e| e.task_id).collect();
    for ids in per_producer {
        let positions: Vec<usize> = ids
            .iter()
            .map(|id| order.iter().position(|o| o == id).unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "{positions:?}");
    }
    assert_eq!(orch.status().processed, 20);
    orch.stop().await;
}

#[tokio::test]
async fn notifier_failure_does_not_stop_the_worker() {
    let h = Harness::new();
    *h.notifier.fail.lock().unwrap() = true;
    let orch = Orchestrator::start(h.worker());
    let mut events = orch.subscribe();

    orch.submit(Task::new("a", "#c", Action::Help, vec![])).unwrap();
    orch.submit(build(&["org/repo"])).unwrap();
    let reported = wait_for_events(&mut events, "reported", 2).await;

    assert_eq!(reported[1].message, "success");
    assert_eq!(orch.status().processed, 2);
    orch.stop().await;
}

#[tokio::test]
async fn stop_finishes_in_flight_task_and_drops_the_rest() {
    let h = Harness::new();
    let gate = Arc::new(Notify::new());
    *h.docker.gate.lock().unwrap() = Some(Arc::clone(&gate));
    let orch = Arc::new(Orchestrator::start(h.worker()));
    let mut events = orch.subscribe();
    let mut state = orch.state();

    let first = orch.submit(run("image0")).unwrap();
    orch.submit(run("image1")).unwrap();
    orch.submit(run("image2")).unwrap();
    state
        .wait_for(|s| *s == WorkerState::Processing { task_id: first })
        .await
        .unwrap();

    let stopper = tokio::spawn({
        let orch = Arc::clone(&orch);
        async move { orch.stop().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    gate.notify_one();
    stopper.await.unwrap();

    assert_eq!(orch.status().processed, 1);
    assert_eq!(orch.status().queued, 0);
    assert_eq!(orch.status().worker, WorkerState::Stopped);
    let dropped = wait_for_events(&mut events, "dropped", 2).await;
    assert_eq!(dropped.len(), 2);
    assert!(orch.submit(run("late")).is_err());
}

#[tokio::test]
async fn stop_removes_working_directories() {
    let h = Harness::new();
    let orch = Orchestrator::start(h.worker());
    let mut events = orch.subscribe();

    orch.submit(build(&["org/repo"])).unwrap();
    wait_for_events(&mut events, "reported", 1).await;
    assert_eq!(std::fs::read_dir(h.workspace.path()).unwrap().count(), 1);

    orch.stop().await;

    assert_eq!(std::fs::read_dir(h.workspace.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn panicking_collaborator_fails_one_task_and_the_worker_carries_on() {
    let h = Harness::new();
    *h.notifier.panic_on.lock().unwrap() = Some("usage:".to_string());
    let orch = Orchestrator::start(h.worker());
    let mut events = orch.subscribe();

    orch.submit(Task::new("a", "#c", Action::Help, vec![])).unwrap();
    let second = orch.submit(run("image1")).unwrap();
    let reported = wait_for_events(&mut events, "reported", 2).await;

    assert_eq!(reported[0].message, "failure");
    assert_eq!(reported[1].task_id, second);
    assert_eq!(reported[1].message, "success");
    assert_eq!(
        h.notifier.texts(),
        vec![
            "[help] help failed due to an internal error",
            "[image1] Container `c0ffee0011` exited successfully",
        ]
    );
    let mut state = orch.state();
    state.wait_for(|s| *s == WorkerState::Idle).await.unwrap();
    assert_eq!(orch.status().processed, 2);
    orch.stop().await;
}

#[tokio::test]
async fn next_task_starts_only_after_the_previous_report() {
    let h = Harness::new();
    // One log for toolchain calls and notifications, in the order they happen.
    *h.notifier.shared_log.lock().unwrap() = Some(h.docker_log.clone());
    let orch = Orchestrator::start(h.worker());
    let mut events = orch.subscribe();

    for i in 0..3 {
        orch.submit(run(&format!("image{i}"))).unwrap();
    }
    wait_for_events(&mut events, "reported", 3).await;

    let milestones: Vec<String> = h
        .docker_calls()
        .into_iter()
        .filter(|c| c.starts_with("create") || c.starts_with("notify"))
        .collect();
    assert_eq!(
        milestones,
        vec![
            "create image0",
            "notify [image0] Container `c0ffee0011` exited successfully",
            "create image1",
            "notify [image1] Container `c0ffee0011` exited successfully",
            "create image2",
            "notify [image2] Container `c0ffee0011` exited successfully",
        ]
    );
    orch.stop().await;
}
