//! End-to-end engine behavior against the in-memory store.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use jobforge_core::{JobError, JobId, JobResult, JobState, NewJob, QueueConfig, TimePeriod, UniquenessConfig};
use jobforge_infra::jobs::{JobContext, JobOutcome};
use jobforge_infra::{Engine, EngineConfig, InMemoryJobStore, JobRegistry, JobStore, StaleJobPolicy};

fn config() -> EngineConfig {
    EngineConfig::default()
        .with_worker_id("it-worker")
        .with_idle_interval(Duration::from_millis(5))
        .with_shutdown_poll_interval(Duration::from_millis(5))
}

fn engine_with(registry: JobRegistry, config: EngineConfig) -> (Arc<InMemoryJobStore>, Engine) {
    jobforge_observability::init_with_filter("warn", jobforge_observability::LogFormat::Pretty);
    let store = InMemoryJobStore::arc();
    let engine = Engine::new(store.clone(), Arc::new(registry), config).unwrap();
    (store, engine)
}

async fn wait_for(engine: &Engine, id: JobId, state: JobState) -> jobforge_core::JobRecord {
    for _ in 0..400 {
        let job = engine.get_job(id).await.unwrap();
        if job.state == state {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("job {id} never reached {state}");
}

#[tokio::test]
async fn enqueued_job_runs_to_completion() {
    let registry = JobRegistry::new().with_handler("add", |ctx: JobContext| async move {
        let a: i64 = ctx.arg(0)?;
        let b: i64 = ctx.arg(1)?;
        anyhow::Ok(JobOutcome::from(json!(a + b)))
    });
    let (_store, engine) = engine_with(registry, config());

    let job = engine
        .enqueue(NewJob::new("add").args([json!(2), json!(3)]))
        .await
        .unwrap();
    let handle = engine.start();
    let done = wait_for(&engine, job.id, JobState::Completed).await;
    handle.shutdown().await;

    assert_eq!(done.result, Some(json!(5)));
    assert_eq!(done.attempt, 1);
    assert!(done.completed_at.is_some());
    assert_eq!(engine.executor_stats().jobs_completed, 1);
}

#[tokio::test]
async fn single_attempt_failure_is_terminal() {
    let registry = JobRegistry::new().with_handler("boom", |_ctx: JobContext| async move {
        Err::<JobOutcome, _>(anyhow::anyhow!("boom"))
    });
    let (_store, engine) = engine_with(registry, config());

    let job = engine.enqueue(NewJob::new("boom").max_attempts(1)).await.unwrap();
    let handle = engine.start();
    let failed = wait_for(&engine, job.id, JobState::Failed).await;
    handle.shutdown().await;

    assert_eq!(failed.errors.len(), 1);
    assert_eq!(failed.errors[0].message, "boom");
    assert_eq!(failed.errors[0].attempt, 1);
    assert_eq!(failed.errors[0].attempt_by.as_deref(), Some("it-worker"));
    assert!(failed.attempt <= failed.max_attempts);
}

#[tokio::test]
async fn handler_can_fail_permanently_before_max_attempts() {
    let registry = JobRegistry::new().with_handler("reject", |_ctx: JobContext| async move {
        anyhow::Ok(JobOutcome::from(JobResult::failed("invalid payload")))
    });
    let (_store, engine) = engine_with(registry, config());

    let job = engine.enqueue(NewJob::new("reject").max_attempts(5)).await.unwrap();
    let handle = engine.start();
    let failed = wait_for(&engine, job.id, JobState::Failed).await;
    handle.shutdown().await;

    assert_eq!(failed.attempt, 1);
    assert_eq!(failed.errors[0].message, "invalid payload");
}

#[tokio::test]
async fn retries_until_success() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let registry = JobRegistry::new().with_handler("flaky", move |_ctx: JobContext| {
        let counter = counter.clone();
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(anyhow::anyhow!("first try fails"));
            }
            anyhow::Ok(JobOutcome::done())
        }
    });
    let (_store, engine) = engine_with(registry, config());

    let job = engine
        .enqueue(
            NewJob::new("flaky")
                .max_attempts(3)
                .backoff(jobforge_core::BackoffStrategy::Fixed)
                .retry_delay(Duration::from_millis(10)),
        )
        .await
        .unwrap();
    let handle = engine.start();
    let done = wait_for(&engine, job.id, JobState::Completed).await;
    handle.shutdown().await;

    assert_eq!(done.attempt, 2);
    assert_eq!(done.errors.len(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn duplicate_alive_job_is_rejected_until_the_first_finishes() {
    let registry = JobRegistry::new().with_handler("sync", |_ctx: JobContext| async move {
        anyhow::Ok(JobOutcome::done())
    });
    let (_store, engine) = engine_with(registry, config());
    let job = || NewJob::new("sync").arg(json!({"account": 7})).unique(UniquenessConfig::alive(true));

    let first = engine.enqueue(job()).await.unwrap();
    assert!(matches!(
        engine.enqueue(job()).await.unwrap_err(),
        JobError::DuplicateJob { .. }
    ));

    // Different args hash differently.
    engine
        .enqueue(NewJob::new("sync").arg(json!({"account": 8})).unique(UniquenessConfig::alive(true)))
        .await
        .unwrap();

    let handle = engine.start();
    wait_for(&engine, first.id, JobState::Completed).await;
    handle.shutdown().await;

    engine.enqueue(job()).await.unwrap();
}

#[tokio::test]
async fn fixed_window_rejects_within_the_window() {
    let (_store, engine) = engine_with(JobRegistry::new(), config());
    let at = Utc::now() + chrono::Duration::days(1);
    let job = || {
        NewJob::new("digest")
            .available_at(at)
            .unique(UniquenessConfig::fixed_window(TimePeriod::Day, false))
    };

    engine.enqueue(job()).await.unwrap();
    assert!(matches!(
        engine.enqueue(job()).await.unwrap_err(),
        JobError::DuplicateJob { .. }
    ));
}

#[tokio::test]
async fn global_concurrency_of_one_runs_jobs_one_at_a_time() {
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (a, p) = (active.clone(), peak.clone());
    let registry = JobRegistry::new().with_handler("work", move |_ctx: JobContext| {
        let (active, peak) = (a.clone(), p.clone());
        async move {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            active.fetch_sub(1, Ordering::SeqCst);
            anyhow::Ok(JobOutcome::done())
        }
    });
    let (_store, engine) = engine_with(registry, config().with_max_concurrent_jobs(1));

    let first = engine.enqueue(NewJob::new("work").queue("alpha")).await.unwrap();
    let second = engine.enqueue(NewJob::new("work").queue("beta")).await.unwrap();

    let handle = engine.start();
    for _ in 0..400 {
        assert!(engine.executor().active_count() <= 1);
        let counts = engine.counts(None).await.unwrap();
        if counts.completed == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    handle.shutdown().await;

    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert_eq!(engine.get_job(first.id).await.unwrap().state, JobState::Completed);
    assert_eq!(engine.get_job(second.id).await.unwrap().state, JobState::Completed);
}

#[tokio::test]
async fn canceling_a_running_job_aborts_it() {
    let registry = JobRegistry::new().with_handler("forever", |_ctx: JobContext| async move {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        anyhow::Ok(JobOutcome::done())
    });
    let (_store, engine) = engine_with(registry, config());

    let job = engine.enqueue(NewJob::new("forever")).await.unwrap();
    let handle = engine.start();
    wait_for(&engine, job.id, JobState::Running).await;

    let canceled = engine.cancel_job(job.id).await.unwrap();
    assert_eq!(canceled.state, JobState::Canceled);

    handle.shutdown().await;
    let job = engine.get_job(job.id).await.unwrap();
    assert_eq!(job.state, JobState::Canceled);
    assert!(job.errors.is_empty());
    assert!(job.completed_at.is_none() && job.failed_at.is_none());
    assert_eq!(engine.executor_stats().jobs_aborted, 1);
}

#[tokio::test]
async fn paused_queue_is_not_dispatched() {
    let registry = JobRegistry::new().with_handler("x", |_ctx: JobContext| async move {
        anyhow::Ok(JobOutcome::done())
    });
    let (_store, engine) = engine_with(registry, config());

    engine.pause_queue("held").await.unwrap();
    let held = engine.enqueue(NewJob::new("x").queue("held")).await.unwrap();
    let free = engine.enqueue(NewJob::new("x").queue("free")).await.unwrap();

    let handle = engine.start();
    wait_for(&engine, free.id, JobState::Completed).await;
    assert_eq!(engine.get_job(held.id).await.unwrap().state, JobState::Waiting);

    engine.resume_queue("held").await.unwrap();
    wait_for(&engine, held.id, JobState::Completed).await;
    handle.shutdown().await;
}

#[tokio::test]
async fn declared_queue_concurrency_is_applied() {
    let (_store, engine) = engine_with(
        JobRegistry::new(),
        config().with_queue(QueueConfig::new("reports").with_concurrency(2).with_priority(3)),
    );

    engine.enqueue(NewJob::new("x").queue("reports")).await.unwrap();
    let queues = engine.list_queues().await.unwrap();
    assert_eq!(queues[0].concurrency, 2);
    assert_eq!(queues[0].priority, 3);
}

#[tokio::test]
async fn snooze_gives_back_the_attempt() {
    let registry = JobRegistry::new().with_handler("later", |_ctx: JobContext| async move {
        anyhow::Ok(JobOutcome::from(JobResult::snooze(Duration::from_secs(60))))
    });
    let (_store, engine) = engine_with(registry, config());

    let job = engine.enqueue(NewJob::new("later").max_attempts(1)).await.unwrap();
    let handle = engine.start();
    for _ in 0..400 {
        if engine.executor_stats().jobs_snoozed == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    handle.shutdown().await;

    let snoozed = engine.get_job(job.id).await.unwrap();
    assert_eq!(snoozed.state, JobState::Waiting);
    assert_eq!(snoozed.attempt, 0);
    assert!(snoozed.available_at.is_some_and(|at| at > Utc::now()));

    // Admin snooze of a waiting job with no attempts keeps attempt at 0.
    let again = engine.snooze_job(job.id, Duration::from_secs(1)).await.unwrap();
    assert_eq!(again.attempt, 0);
}

#[tokio::test]
async fn rerun_grants_an_extra_attempt_to_exhausted_jobs() {
    let registry = JobRegistry::new().with_handler("boom", |_ctx: JobContext| async move {
        Err::<JobOutcome, _>(anyhow::anyhow!("boom"))
    });
    let (_store, engine) = engine_with(registry, config());

    let job = engine.enqueue(NewJob::new("boom").max_attempts(1)).await.unwrap();
    let handle = engine.start();
    wait_for(&engine, job.id, JobState::Failed).await;
    handle.shutdown().await;

    let rerun = engine.rerun_job(job.id).await.unwrap();
    assert_eq!(rerun.state, JobState::Waiting);
    assert_eq!(rerun.max_attempts, 2);
    assert!(rerun.failed_at.is_none());
}

#[tokio::test]
async fn maintenance_recovers_stale_jobs_and_cleans_up() {
    let (store, engine) = engine_with(
        JobRegistry::new(),
        config()
            .with_stale_policy(StaleJobPolicy {
                max_stale: Duration::from_secs(60),
                max_claimed: Duration::from_secs(10),
            })
            .with_cleanup_after(Duration::from_secs(24 * 60 * 60)),
    );

    let job = engine.enqueue(NewJob::new("x")).await.unwrap();
    let mut claimed = store
        .claim("default", 1, &jobforge_core::WorkerId::new("crashed"))
        .await
        .unwrap()
        .remove(0);
    claimed.claimed_at = Some(Utc::now() - chrono::Duration::minutes(1));
    store.update(&claimed).await.unwrap();

    let report = engine.release_stale().await.unwrap();
    assert_eq!(report.released, 1);
    assert_eq!(engine.get_job(job.id).await.unwrap().state, JobState::Waiting);

    let mut old = engine.enqueue(NewJob::new("y")).await.unwrap();
    old.state = JobState::Completed;
    old.completed_at = Some(Utc::now() - chrono::Duration::days(2));
    store.update(&old).await.unwrap();

    assert_eq!(engine.cleanup_finished().await.unwrap(), 1);
    assert_eq!(engine.counts(None).await.unwrap().total(), 1);
}
