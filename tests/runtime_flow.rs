//! End-to-end flows through the supervised runtime: enqueue, execute,
//! retry, snooze, pause, and cancel against a live node.

#[allow(dead_code)]
mod helpers;

use figment::Figment;
use figment::providers::Serialized;
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use stoker::client::Client;
use stoker::config::Config;
use stoker::data::jobs;
use stoker::job::{Job, JobBuilder, JobState};
use stoker::runtime::QueueRuntime;
use stoker::runtime::notifier::IDENT_ANY;
use stoker::status::ServiceStatusRegistry;
use stoker::telemetry::TelemetryRegistry;
use stoker::worker::{Outcome, Worker, WorkerRegistry, WorkerResult};

struct EchoWorker;

#[async_trait::async_trait]
impl Worker for EchoWorker {
    async fn process(&self, job: &Job) -> WorkerResult {
        Ok(Outcome::Record(job.args.clone()))
    }
}

/// Fails every attempt, with no backoff so retries restage immediately.
struct AlwaysFailing;

#[async_trait::async_trait]
impl Worker for AlwaysFailing {
    async fn process(&self, _job: &Job) -> WorkerResult {
        Err(anyhow::anyhow!("always fails"))
    }

    fn backoff(&self, _job: &Job) -> Option<Duration> {
        Some(Duration::ZERO)
    }
}

/// Snoozes on the first run, completes on the second.
struct SnoozeOnce {
    runs: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl Worker for SnoozeOnce {
    async fn process(&self, _job: &Job) -> WorkerResult {
        if self.runs.fetch_add(1, Ordering::SeqCst) == 0 {
            Ok(Outcome::Snooze(0))
        } else {
            Ok(Outcome::Complete)
        }
    }
}

/// Runs until cancelled (or a generous cap, to keep tests bounded).
struct WaitsForCancel;

#[async_trait::async_trait]
impl Worker for WaitsForCancel {
    async fn process(&self, job: &Job) -> WorkerResult {
        for _ in 0..200 {
            if job.cancelled() {
                return Ok(Outcome::Cancel("observed cancellation".to_owned()));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        Ok(Outcome::Complete)
    }
}

fn test_config() -> Config {
    Figment::new()
        .merge(Serialized::defaults(json!({
            "database_url": "postgres://unused-in-tests",
            "name": "stoker",
            "node": "test-node",
            "queues": {"default": 5},
            "stager": {"interval": "100ms"},
            "refresher": {"interval": "200ms", "max_age": "5s"},
            "pruner": {"interval": "60s"},
            "leadership": {"interval": "200ms"},
        })))
        .extract()
        .expect("test config should deserialize")
}

async fn start_node(pool: &PgPool, registry: WorkerRegistry) -> QueueRuntime {
    let mut runtime = QueueRuntime::new(
        test_config(),
        pool.clone(),
        registry,
        TelemetryRegistry::new(),
        ServiceStatusRegistry::new(),
    );

    runtime.start().await.expect("runtime should start");

    // Give the runtime a moment to settle its loops and start listening.
    tokio::time::sleep(Duration::from_millis(300)).await;

    runtime
}

async fn stop_node(mut runtime: QueueRuntime) {
    tokio::time::timeout(Duration::from_secs(8), runtime.shutdown())
        .await
        .expect("shutdown should finish within the timeout")
        .expect("node should shut down cleanly");
}

/// Poll until the job reaches the expected state or the timeout elapses.
async fn wait_for_state(pool: &PgPool, id: i64, expected: JobState, timeout: Duration) -> Job {
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        let job = jobs::fetch_job(id, pool)
            .await
            .expect("fetch_job failed")
            .expect("job should exist");

        if job.state == expected {
            return job;
        }

        assert!(
            tokio::time::Instant::now() < deadline,
            "job {id} stuck in {:?}, expected {expected:?}",
            job.state
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[sqlx::test]
async fn enqueued_job_runs_to_completion(pool: PgPool) {
    let registry = WorkerRegistry::new();
    registry.register("Echo", EchoWorker);
    let node = start_node(&pool, registry).await;

    let client = Client::new(pool.clone());
    let job = client
        .enqueue(JobBuilder::new("Echo").args(json!({"x": 1})))
        .await
        .unwrap();

    let done = wait_for_state(&pool, job.id, JobState::Completed, Duration::from_secs(2)).await;

    assert_eq!(done.attempt, 1);
    assert_eq!(done.attempted_by, vec!["stoker.test-node"]);
    assert!(done.completed_at.unwrap() > done.inserted_at);
    assert_eq!(done.recorded(), Some(&json!({"x": 1})));

    stop_node(node).await;
}

#[sqlx::test]
async fn failing_job_retries_then_discards(pool: PgPool) {
    let registry = WorkerRegistry::new();
    registry.register("AlwaysFailing", AlwaysFailing);
    let node = start_node(&pool, registry).await;

    let client = Client::new(pool.clone());
    let job = client
        .enqueue(JobBuilder::new("AlwaysFailing").max_attempts(2))
        .await
        .unwrap();

    let done = wait_for_state(&pool, job.id, JobState::Discarded, Duration::from_secs(5)).await;

    assert_eq!(done.attempt, 2);
    assert_eq!(done.errors.0.len(), 2);
    assert!(done.discarded_at.is_some());

    stop_node(node).await;
}

#[sqlx::test]
async fn snoozed_job_runs_again_and_completes(pool: PgPool) {
    let runs = Arc::new(AtomicUsize::new(0));
    let registry = WorkerRegistry::new();
    registry.register("SnoozeOnce", SnoozeOnce { runs: runs.clone() });
    let node = start_node(&pool, registry).await;

    let client = Client::new(pool.clone());
    let job = client.enqueue(JobBuilder::new("SnoozeOnce")).await.unwrap();

    let done = wait_for_state(&pool, job.id, JobState::Completed, Duration::from_secs(5)).await;

    assert_eq!(runs.load(Ordering::SeqCst), 2);
    // The snooze added an extra allowed attempt instead of consuming one.
    assert_eq!(done.max_attempts, 21);
    assert!(done.errors.0.is_empty());

    stop_node(node).await;
}

#[sqlx::test]
async fn paused_queue_does_not_fetch(pool: PgPool) {
    let registry = WorkerRegistry::new();
    registry.register("Echo", EchoWorker);
    let node = start_node(&pool, registry).await;

    let client = Client::new(pool.clone());
    client.pause_queue("default", IDENT_ANY).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let job = client.enqueue(JobBuilder::new("Echo")).await.unwrap();

    // The job must sit untouched while the producer is paused.
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(helpers::job_state(&pool, job.id).await, "available");

    client.resume_queue("default", IDENT_ANY).await.unwrap();
    wait_for_state(&pool, job.id, JobState::Completed, Duration::from_secs(3)).await;

    stop_node(node).await;
}

#[sqlx::test]
async fn executing_job_can_be_cancelled(pool: PgPool) {
    let registry = WorkerRegistry::new();
    registry.register("WaitsForCancel", WaitsForCancel);
    let node = start_node(&pool, registry).await;

    let client = Client::new(pool.clone());
    let job = client.enqueue(JobBuilder::new("WaitsForCancel")).await.unwrap();

    wait_for_state(&pool, job.id, JobState::Executing, Duration::from_secs(2)).await;

    assert!(client.cancel_job(job.id).await.unwrap());
    let done = wait_for_state(&pool, job.id, JobState::Cancelled, Duration::from_secs(3)).await;

    assert!(done.cancelled_at.is_some());
    assert!(!done.errors.0.is_empty());

    stop_node(node).await;
}

#[sqlx::test]
async fn shutdown_waits_for_in_flight_jobs_and_deletes_producers(pool: PgPool) {
    let registry = WorkerRegistry::new();
    registry.register("Echo", EchoWorker);
    let node = start_node(&pool, registry).await;

    let client = Client::new(pool.clone());
    let job = client.enqueue(JobBuilder::new("Echo")).await.unwrap();
    wait_for_state(&pool, job.id, JobState::Completed, Duration::from_secs(2)).await;

    stop_node(node).await;

    let (producers,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM stoker_producers")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(producers, 0, "producer rows should be deleted on shutdown");
}
