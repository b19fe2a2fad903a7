//! Executor behaviour across whole trees: short-circuiting, partial
//! failure, retry, abort, timeout and resumption.
//!
//! Everything runs in-process against `MemoryJobStore`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use stratus_jobs::*;

static TRACING_INIT: Once = Once::new();

fn init_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init()
            .ok();
    });
}

// ── Handlers ──────────────────────────────────────────────────────

fn counting(counter: Arc<AtomicU32>) -> Arc<dyn JobHandler> {
    handler_fn(move |_ctx: JobContext| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(HandlerOutput::empty().log("done"))
        }
    })
}

/// Fails with `err` for the first `failures` calls, then succeeds.
fn flaky(counter: Arc<AtomicU32>, failures: u32, err: fn(String) -> JobError) -> Arc<dyn JobHandler> {
    handler_fn(move |_ctx: JobContext| {
        let counter = counter.clone();
        async move {
            let call = counter.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= failures {
                Err(err(format!("call {call}")))
            } else {
                Ok(HandlerOutput::empty())
            }
        }
    })
}

fn boom() -> Arc<dyn JobHandler> {
    handler_fn(|ctx: JobContext| async move {
        Err(JobError::Handler(format!("{} exploded", ctx.job_id)))
    })
}

fn sleepy(delay: Duration) -> Arc<dyn JobHandler> {
    handler_fn(move |_ctx: JobContext| async move {
        tokio::time::sleep(delay).await;
        Ok(HandlerOutput::empty().log("woke up"))
    })
}

/// Sleeps in small steps, stopping at the first checkpoint after abort.
fn cooperative() -> Arc<dyn JobHandler> {
    handler_fn(|ctx: JobContext| async move {
        for _ in 0..500 {
            ctx.checkpoint()?;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(HandlerOutput::empty())
    })
}

// ── Fixtures ──────────────────────────────────────────────────────

fn fast_options() -> ExecutorOptions {
    ExecutorOptions {
        remote_retry_limit: 3,
        retry_backoff: Duration::from_millis(1),
        default_timeout: None,
    }
}

fn executor(handlers: HandlerRegistry) -> Executor {
    init_tracing();
    Executor::new(Arc::new(MemoryJobStore::new()), handlers).with_options(fast_options())
}

fn build(spec: JobSpec) -> JobTree {
    JobTree::build("test", BTreeMap::new(), spec)
}

fn child(tree: &JobTree, index: usize) -> JobId {
    tree.root().children[index].clone()
}

async fn wait_for_state(exec: &Executor, tree_id: &str, job: &str, state: JobState) {
    for _ in 0..500 {
        let tree = exec.tree(tree_id).await.unwrap();
        if tree.state_of(job) == Some(state) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("job {job} never reached {state}");
}

// ── Sequential / parallel semantics ───────────────────────────────

#[tokio::test]
async fn sequential_failure_leaves_later_siblings_new() {
    let later = Arc::new(AtomicU32::new(0));
    let exec = executor(
        HandlerRegistry::new()
            .with("ok", counting(Arc::new(AtomicU32::new(0))))
            .with("boom", boom())
            .with("later", counting(later.clone())),
    );
    let tree = build(JobSpec::new("group").sequential(vec![
        JobSpec::new("ok"),
        JobSpec::new("boom"),
        JobSpec::new("later"),
        JobSpec::new("later"),
    ]));
    let tree_id = tree.id().to_string();
    let (ok, failed, third, fourth) = (child(&tree, 0), child(&tree, 1), child(&tree, 2), child(&tree, 3));

    let outcome = exec.run(tree).await.unwrap();

    assert_eq!(outcome.state, JobState::Failed);
    let tree = exec.tree(&tree_id).await.unwrap();
    assert_eq!(tree.state_of(&ok), Some(JobState::Success));
    assert_eq!(tree.state_of(&failed), Some(JobState::Failed));
    assert_eq!(tree.state_of(&third), Some(JobState::New));
    assert_eq!(tree.state_of(&fourth), Some(JobState::New));
    assert_eq!(later.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn optional_sequential_failure_does_not_short_circuit() {
    let later = Arc::new(AtomicU32::new(0));
    let exec = executor(
        HandlerRegistry::new()
            .with("boom", boom())
            .with("later", counting(later.clone())),
    );
    let tree = build(JobSpec::new("group").sequential(vec![
        JobSpec::new("boom").optional(),
        JobSpec::new("later"),
    ]));
    let tree_id = tree.id().to_string();

    let outcome = exec.run(tree).await.unwrap();

    assert!(outcome.is_success());
    assert_eq!(later.load(Ordering::SeqCst), 1);
    let tree = exec.tree(&tree_id).await.unwrap();
    assert!(tree.root().logs.iter().any(|l| l.starts_with("optional child")));
}

#[tokio::test]
async fn parallel_failure_lets_running_siblings_finish() {
    let exec = executor(
        HandlerRegistry::new()
            .with("boom", boom())
            .with("slow", sleepy(Duration::from_millis(100))),
    );
    let tree = build(JobSpec::new("group").parallel(vec![
        JobSpec::new("boom"),
        JobSpec::new("slow"),
        JobSpec::new("slow"),
    ]));
    let tree_id = tree.id().to_string();
    let failed = child(&tree, 0);

    let outcome = exec.run(tree).await.unwrap();

    assert_eq!(outcome.state, JobState::Failed);
    let failure = outcome.failure.unwrap();
    assert_eq!(failure.kind, FailureKind::ChildFailed);
    assert_eq!(failure.failed_jobs, vec![failed]);

    let tree = exec.tree(&tree_id).await.unwrap();
    for slow in [child(&tree, 1), child(&tree, 2)] {
        let job = tree.job(&slow).unwrap();
        assert_eq!(job.state, JobState::Success);
        assert!(job.logs.contains(&"woke up".to_string()));
    }
}

#[tokio::test]
async fn root_failure_names_every_root_cause_leaf() {
    let exec = executor(
        HandlerRegistry::new()
            .with("ok", counting(Arc::new(AtomicU32::new(0))))
            .with("boom", boom()),
    );
    let tree = build(JobSpec::new("outer").parallel(vec![
        JobSpec::new("inner").parallel(vec![
            JobSpec::new("boom"),
            JobSpec::new("ok"),
            JobSpec::new("boom"),
        ]),
        JobSpec::new("boom"),
        JobSpec::new("boom").optional(),
    ]));
    let inner = tree.job(&child(&tree, 0)).unwrap().children.clone();
    let expected = vec![inner[0].clone(), inner[2].clone(), child(&tree, 1)];

    let outcome = exec.run(tree).await.unwrap();

    let failure = outcome.failure.unwrap();
    assert_eq!(failure.failed_jobs, expected);
}

#[tokio::test]
async fn root_never_succeeds_with_failed_required_descendant() {
    let exec = executor(
        HandlerRegistry::new()
            .with("ok", counting(Arc::new(AtomicU32::new(0))))
            .with("boom", boom()),
    );
    let tree = build(JobSpec::new("outer").sequential(vec![
        JobSpec::new("ok"),
        JobSpec::new("inner").parallel(vec![JobSpec::new("ok"), JobSpec::new("boom")]),
    ]));
    let tree_id = tree.id().to_string();

    let outcome = exec.run(tree).await.unwrap();

    assert_eq!(outcome.state, JobState::Failed);
    let tree = exec.tree(&tree_id).await.unwrap();
    assert_eq!(tree.failed_leaves().len(), 1);
}

// ── Retry bounds and error kinds ──────────────────────────────────

#[tokio::test]
async fn transient_remote_failures_are_retried_up_to_the_bound() {
    let calls = Arc::new(AtomicU32::new(0));
    let exec = executor(HandlerRegistry::new().with(
        "remote",
        flaky(calls.clone(), 2, JobError::RemoteComm),
    ));
    let tree = build(JobSpec::new("remote"));
    let tree_id = tree.id().to_string();

    let outcome = exec.run(tree).await.unwrap();

    assert!(outcome.is_success());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let tree = exec.tree(&tree_id).await.unwrap();
    let root = tree.root();
    assert_eq!(root.attempts, 3);
    assert!(root.logs.contains(&"attempt 3/3".to_string()));
    assert_eq!(
        root.logs.iter().filter(|l| l.contains("retrying")).count(),
        2
    );
}

#[tokio::test]
async fn remote_failures_beyond_the_bound_fail_the_job() {
    let calls = Arc::new(AtomicU32::new(0));
    let exec = executor(HandlerRegistry::new().with(
        "remote",
        flaky(calls.clone(), 10, JobError::RemoteComm),
    ));

    let outcome = exec.run(build(JobSpec::new("remote"))).await.unwrap();

    assert_eq!(outcome.state, JobState::Failed);
    assert_eq!(outcome.failure.unwrap().kind, FailureKind::RemoteComm);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn handler_errors_are_never_retried() {
    let calls = Arc::new(AtomicU32::new(0));
    let exec = executor(
        HandlerRegistry::new().with("logic", flaky(calls.clone(), 1, JobError::Handler)),
    )
    .with_options(ExecutorOptions {
        remote_retry_limit: 5,
        ..fast_options()
    });

    let outcome = exec.run(build(JobSpec::new("logic"))).await.unwrap();

    assert_eq!(outcome.state, JobState::Failed);
    assert_eq!(outcome.failure.unwrap().kind, FailureKind::Handler);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn timeout_forces_failure() {
    let exec = executor(HandlerRegistry::new().with("slow", sleepy(Duration::from_secs(10))));
    let tree = build(JobSpec::new("slow").timeout(Duration::from_millis(50)));

    let outcome = exec.run(tree).await.unwrap();

    assert_eq!(outcome.state, JobState::Failed);
    let failure = outcome.failure.unwrap();
    assert_eq!(failure.kind, FailureKind::Timeout);
    assert!(failure.message.contains("timed out"));
}

#[tokio::test]
async fn default_timeout_applies_to_jobs_without_one() {
    let exec = executor(HandlerRegistry::new().with("slow", sleepy(Duration::from_secs(10))))
        .with_options(ExecutorOptions {
            default_timeout: Some(Duration::from_millis(50)),
            ..fast_options()
        });

    let outcome = exec.run(build(JobSpec::new("slow"))).await.unwrap();

    assert_eq!(outcome.failure.unwrap().kind, FailureKind::Timeout);
}

// ── Retry and resumption ──────────────────────────────────────────

#[tokio::test]
async fn retry_resets_only_the_failed_leaf() {
    let ok_calls = Arc::new(AtomicU32::new(0));
    let flaky_calls = Arc::new(AtomicU32::new(0));
    let exec = executor(
        HandlerRegistry::new()
            .with("ok", counting(ok_calls.clone()))
            .with("flaky", flaky(flaky_calls.clone(), 1, JobError::Handler)),
    );
    let tree = build(JobSpec::new("group").parallel(vec![
        JobSpec::new("ok"),
        JobSpec::new("flaky"),
    ]));
    let tree_id = tree.id().to_string();
    let (ok, failed) = (child(&tree, 0), child(&tree, 1));

    let first = exec.run(tree).await.unwrap();
    assert_eq!(first.state, JobState::Failed);
    let before = exec.tree(&tree_id).await.unwrap().job(&ok).unwrap().clone();

    exec.retry(&tree_id, &failed).await.unwrap();

    let reset = exec.tree(&tree_id).await.unwrap();
    assert_eq!(reset.state_of(&failed), Some(JobState::Ready));
    assert_eq!(reset.job(&ok).unwrap(), &before);

    let second = exec.resume(&tree_id).await.unwrap();

    assert!(second.is_success());
    assert_eq!(ok_calls.load(Ordering::SeqCst), 1);
    assert_eq!(flaky_calls.load(Ordering::SeqCst), 2);
    let done = exec.tree(&tree_id).await.unwrap();
    assert_eq!(done.job(&ok).unwrap().logs, before.logs);
    assert_eq!(done.job(&ok).unwrap().state, JobState::Success);
}

#[tokio::test]
async fn resume_redispatches_interrupted_jobs_and_skips_finished_ones() {
    let done_calls = Arc::new(AtomicU32::new(0));
    let cut_calls = Arc::new(AtomicU32::new(0));
    let exec = executor(
        HandlerRegistry::new()
            .with("done", counting(done_calls.clone()))
            .with("cut", counting(cut_calls.clone())),
    );
    let tree = build(JobSpec::new("group").parallel(vec![
        JobSpec::new("done"),
        JobSpec::new("cut"),
    ]));
    let tree_id = tree.id().to_string();
    let (done, cut) = (child(&tree, 0), child(&tree, 1));

    // State as a crashed controller would have left it.
    let store = exec.store();
    store.save_tree(&tree).unwrap();
    store.update_job_state(tree.root_id(), JobState::Running).unwrap();
    store.update_job_state(&done, JobState::Success).unwrap();
    store.update_job_state(&cut, JobState::Running).unwrap();

    let outcome = exec.resume(&tree_id).await.unwrap();

    assert!(outcome.is_success());
    assert_eq!(done_calls.load(Ordering::SeqCst), 0);
    assert_eq!(cut_calls.load(Ordering::SeqCst), 1);
    let tree = exec.tree(&tree_id).await.unwrap();
    assert!(
        tree.job(&cut)
            .unwrap()
            .logs
            .contains(&"resuming interrupted job".to_string())
    );
}

#[tokio::test]
async fn recover_resumes_only_unfinished_trees() {
    let calls = Arc::new(AtomicU32::new(0));
    let exec = executor(HandlerRegistry::new().with("ok", counting(calls.clone())));

    let finished = build(JobSpec::new("ok"));
    exec.run(finished).await.unwrap();
    for _ in 0..2 {
        exec.store().save_tree(&build(JobSpec::new("ok"))).unwrap();
    }

    let outcomes = exec.recover().await.unwrap();

    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(TreeOutcome::is_success));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

// ── Abort ─────────────────────────────────────────────────────────

#[tokio::test]
async fn abort_on_running_parallel_tree_spares_finished_jobs() {
    let exec = executor(
        HandlerRegistry::new()
            .with("fast", counting(Arc::new(AtomicU32::new(0))))
            .with("slow", cooperative()),
    );
    let tree = build(JobSpec::new("group").parallel(vec![
        JobSpec::new("fast"),
        JobSpec::new("slow"),
        JobSpec::new("slow"),
    ]));
    let tree_id = tree.id().to_string();
    let root = tree.root_id().to_string();
    let (fast, slow_a, slow_b) = (child(&tree, 0), child(&tree, 1), child(&tree, 2));

    let handle = exec.spawn(tree).await.unwrap();
    wait_for_state(&exec, &tree_id, &fast, JobState::Success).await;
    wait_for_state(&exec, &tree_id, &slow_a, JobState::Running).await;
    let fast_before = exec.tree(&tree_id).await.unwrap().job(&fast).unwrap().clone();

    let marked = exec.abort(&tree_id, &root).await.unwrap();
    assert!(!marked.contains(&fast));

    let outcome = handle.await.unwrap().unwrap();

    assert_eq!(outcome.state, JobState::Aborted);
    let tree = exec.tree(&tree_id).await.unwrap();
    assert_eq!(tree.job(&fast).unwrap(), &fast_before);
    assert_eq!(tree.state_of(&slow_a), Some(JobState::Aborted));
    assert_eq!(tree.state_of(&slow_b), Some(JobState::Aborted));

    // The persisted copy agrees with the live one.
    let stored = exec.store().load_tree(&tree_id).unwrap();
    assert_eq!(stored.state(), JobState::Aborted);
    assert_eq!(stored.state_of(&fast), Some(JobState::Success));
}

#[tokio::test]
async fn retry_refuses_a_leaf_under_a_settled_ancestor() {
    let exec = executor(
        HandlerRegistry::new()
            .with("ok", counting(Arc::new(AtomicU32::new(0))))
            .with("flaky", flaky(Arc::new(AtomicU32::new(0)), 1, JobError::Handler)),
    );
    let tree = build(JobSpec::new("group").sequential(vec![
        JobSpec::new("ok"),
        JobSpec::new("flaky").optional(),
    ]));
    let tree_id = tree.id().to_string();
    let (root, optional) = (tree.root_id().to_string(), child(&tree, 1));

    let outcome = exec.run(tree).await.unwrap();
    assert!(outcome.is_success());

    let err = exec.retry(&tree_id, &optional).await.unwrap_err();
    match err {
        ExecError::SettledAncestor { job, ancestor, state } => {
            assert_eq!(job, optional);
            assert_eq!(ancestor, root);
            assert_eq!(state, JobState::Success);
        }
        other => panic!("unexpected error: {other}"),
    }
    let stored = exec.tree(&tree_id).await.unwrap();
    assert_eq!(stored.state_of(&optional), Some(JobState::Failed));
    assert_eq!(stored.state(), JobState::Success);
}

#[tokio::test]
async fn retry_refuses_a_leaf_under_an_aborted_root() {
    let exec = executor(
        HandlerRegistry::new()
            .with("boom", boom())
            .with("slow", cooperative()),
    );
    let tree = build(JobSpec::new("group").parallel(vec![
        JobSpec::new("boom"),
        JobSpec::new("slow"),
    ]));
    let tree_id = tree.id().to_string();
    let (root, failed) = (tree.root_id().to_string(), child(&tree, 0));

    let handle = exec.spawn(tree).await.unwrap();
    wait_for_state(&exec, &tree_id, &failed, JobState::Failed).await;
    exec.abort(&tree_id, &root).await.unwrap();
    let outcome = handle.await.unwrap().unwrap();
    assert_eq!(outcome.state, JobState::Aborted);

    assert!(matches!(
        exec.retry(&tree_id, &failed).await,
        Err(ExecError::SettledAncestor { state: JobState::Aborted, .. })
    ));
    let stored = exec.tree(&tree_id).await.unwrap();
    assert_eq!(stored.state_of(&failed), Some(JobState::Failed));
}

#[tokio::test]
async fn running_tree_cannot_be_started_twice_or_retried() {
    let exec = executor(HandlerRegistry::new().with("slow", cooperative()));
    let tree = build(JobSpec::new("slow"));
    let tree_id = tree.id().to_string();
    let root = tree.root_id().to_string();
    let duplicate = tree.clone();

    let handle = exec.spawn(tree).await.unwrap();

    assert!(matches!(
        exec.run(duplicate).await,
        Err(ExecError::AlreadyRunning(_))
    ));
    assert!(matches!(
        exec.retry(&tree_id, &root).await,
        Err(ExecError::AlreadyRunning(_))
    ));

    exec.abort(&tree_id, &root).await.unwrap();
    let outcome = handle.await.unwrap().unwrap();
    assert_eq!(outcome.state, JobState::Aborted);
}
