//! Single-job execution: resolve the worker, run it under a cancellation
//! watch, and apply exactly one terminal transition.

use crate::backoff::jittery_clamped;
use crate::data::jobs;
use crate::error::Result;
use crate::job::{ErrorRecord, Job, JobState};
use crate::telemetry::{JobEvent, JobEventKind, TelemetryRegistry};
use crate::worker::{Outcome, WorkerRegistry};
use chrono::Utc;
use futures::FutureExt;
use sqlx::PgPool;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Runs one job to completion and reports what happened.
#[derive(Clone)]
pub struct Executor {
    pool: PgPool,
    registry: WorkerRegistry,
    telemetry: TelemetryRegistry,
    errors_with_traceback: bool,
}

impl Executor {
    pub fn new(
        pool: PgPool,
        registry: WorkerRegistry,
        telemetry: TelemetryRegistry,
        errors_with_traceback: bool,
    ) -> Self {
        Self {
            pool,
            registry,
            telemetry,
            errors_with_traceback,
        }
    }

    /// Execute a fetched job and apply its terminal transition.
    ///
    /// Worker failures never propagate: errors and panics alike are
    /// classified into retry/discard transitions. Only infrastructure
    /// failures (the terminal query itself) surface as `Err`.
    pub async fn execute(&self, job: Job) -> Result<JobState> {
        let queue_time = queue_time(&job);

        let Some(worker) = self.registry.resolve(&job.worker) else {
            let reason = crate::error::Error::UnknownWorker(job.worker.clone()).to_string();
            jobs::discard_job(job.id, &reason, &self.pool).await?;
            warn!(job_id = job.id, worker = %job.worker, "discarded job for unknown worker");

            self.emit(JobEventKind::Exception, &job, Some(JobState::Discarded), Duration::ZERO, queue_time, Some(reason));
            return Ok(JobState::Discarded);
        };

        self.emit(JobEventKind::Start, &job, None, Duration::ZERO, queue_time, None);

        let started = Instant::now();

        let outcome = tokio::select! {
            result = AssertUnwindSafe(worker.process(&job)).catch_unwind() => match result {
                Ok(result) => result,
                Err(panic) => Err(anyhow::anyhow!("worker panicked: {}", panic_message(&panic))),
            },
            _ = job.cancellation().cancelled() => Ok(Outcome::Cancel("job cancelled".to_owned())),
        };

        let duration = started.elapsed();

        let state = match outcome {
            Ok(Outcome::Complete) => {
                jobs::complete_job(job.id, None, &self.pool).await?;
                self.emit(JobEventKind::Stop, &job, Some(JobState::Completed), duration, queue_time, None);
                JobState::Completed
            }
            Ok(Outcome::Record(value)) => {
                jobs::complete_job(job.id, Some(&value), &self.pool).await?;
                self.emit(JobEventKind::Stop, &job, Some(JobState::Completed), duration, queue_time, None);
                JobState::Completed
            }
            Ok(Outcome::Snooze(seconds)) => {
                jobs::snooze_job(job.id, seconds, &self.pool).await?;
                debug!(job_id = job.id, seconds, "job snoozed");
                self.emit(JobEventKind::Stop, &job, Some(JobState::Scheduled), duration, queue_time, None);
                JobState::Scheduled
            }
            Ok(Outcome::Cancel(reason)) => {
                jobs::cancel_job(job.id, &reason, &self.pool).await?;
                debug!(job_id = job.id, reason, "job cancelled");
                self.emit(JobEventKind::Stop, &job, Some(JobState::Cancelled), duration, queue_time, None);
                JobState::Cancelled
            }
            Err(error) => {
                let backoff = worker
                    .backoff(&job)
                    .unwrap_or_else(|| jittery_clamped(job.attempt));

                let record = ErrorRecord {
                    attempt: job.attempt,
                    at: Utc::now(),
                    error: error.to_string(),
                    traceback: self
                        .errors_with_traceback
                        .then(|| format!("{error:?}")),
                };

                // A job cancelled out from under us mid-run is already
                // terminal; report the state it actually landed in.
                let state = jobs::error_job(job.id, &record, backoff, &self.pool)
                    .await?
                    .unwrap_or(JobState::Cancelled);

                warn!(
                    job_id = job.id,
                    worker = %job.worker,
                    attempt = job.attempt,
                    state = %state,
                    error = %record.error,
                    "job attempt failed"
                );

                self.emit(JobEventKind::Exception, &job, Some(state), duration, queue_time, Some(record.error));
                state
            }
        };

        Ok(state)
    }

    fn emit(
        &self,
        kind: JobEventKind,
        job: &Job,
        state: Option<JobState>,
        duration: Duration,
        queue_time: Duration,
        error: Option<String>,
    ) {
        self.telemetry.emit(&JobEvent {
            kind,
            job: job.clone(),
            state,
            duration,
            queue_time,
            error,
        });
    }
}

/// Time spent between becoming runnable and being attempted.
fn queue_time(job: &Job) -> Duration {
    job.attempted_at
        .map(|attempted| (attempted - job.scheduled_at).to_std().unwrap_or_default())
        .unwrap_or_default()
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}
