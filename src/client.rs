//! Enqueue-side API.
//!
//! A [`Client`] only needs the connection pool; it can live in a web
//! handler, a CLI, or next to a running [`crate::runtime::QueueRuntime`].

use crate::data::jobs;
use crate::error::Result;
use crate::job::{Job, JobBuilder};
use crate::runtime::notifier::{self, Channel, InsertPayload, SignalAction, SignalPayload};
use sqlx::PgPool;
use std::collections::BTreeSet;
use tracing::{debug, trace};

#[derive(Clone)]
pub struct Client {
    pool: PgPool,
}

impl Client {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Validate and insert one job, waking producers for its queue.
    ///
    /// When the job carries a uniqueness spec and collides with an existing
    /// non-terminal job, the existing job is returned and nothing is
    /// inserted.
    pub async fn enqueue(&self, builder: JobBuilder) -> Result<Job> {
        let new = builder.build()?;
        let job = jobs::insert_job(&new, &self.pool).await?;

        debug!(job_id = job.id, queue = %job.queue, worker = %job.worker, "job enqueued");
        self.notify_queues([job.queue.clone()]).await;

        Ok(job)
    }

    /// Insert many jobs at once.
    ///
    /// Jobs without uniqueness go through a single batch statement; unique
    /// jobs are collapsed individually. Returned order groups batch inserts
    /// before unique ones.
    pub async fn enqueue_many(&self, builders: Vec<JobBuilder>) -> Result<Vec<Job>> {
        let mut plain = Vec::new();
        let mut unique = Vec::new();

        for builder in builders {
            let new = builder.build()?;
            if new.uniq_key().is_some() {
                unique.push(new);
            } else {
                plain.push(new);
            }
        }

        let mut inserted = jobs::insert_jobs(&plain, &self.pool).await?;
        for new in &unique {
            inserted.push(jobs::insert_job(new, &self.pool).await?);
        }

        debug!(count = inserted.len(), "jobs enqueued");

        let queues: BTreeSet<String> = inserted.iter().map(|job| job.queue.clone()).collect();
        self.notify_queues(queues).await;

        Ok(inserted)
    }

    /// Cancel a non-terminal job.
    ///
    /// If the job is currently executing somewhere, a cancel signal asks
    /// the owning producer to trip its cancellation token; the worker still
    /// decides when to stop.
    pub async fn cancel_job(&self, id: i64) -> Result<bool> {
        let Some(job) = jobs::fetch_job(id, &self.pool).await? else {
            return Ok(false);
        };

        let cancelled = jobs::cancel_job(id, "cancelled by client", &self.pool).await?;

        if cancelled {
            debug!(job_id = id, queue = %job.queue, "job cancelled");
            self.signal(SignalPayload {
                queue: job.queue,
                ident: notifier::IDENT_ANY.to_owned(),
                action: SignalAction::Cancel,
                job_id: Some(id),
            })
            .await;
        }

        Ok(cancelled)
    }

    /// Ask producers for a queue to stop fetching. `ident` is either
    /// [`notifier::IDENT_ANY`] or a concrete `"{name}.{node}"`.
    pub async fn pause_queue(&self, queue: &str, ident: &str) -> Result<()> {
        self.signal(SignalPayload {
            queue: queue.to_owned(),
            ident: ident.to_owned(),
            action: SignalAction::Pause,
            job_id: None,
        })
        .await;

        Ok(())
    }

    pub async fn resume_queue(&self, queue: &str, ident: &str) -> Result<()> {
        self.signal(SignalPayload {
            queue: queue.to_owned(),
            ident: ident.to_owned(),
            action: SignalAction::Resume,
            job_id: None,
        })
        .await;

        Ok(())
    }

    /// Notification delivery is best-effort; producers poll on a bounded
    /// timer regardless.
    async fn notify_queues(&self, queues: impl IntoIterator<Item = String>) {
        for queue in queues {
            let payload = InsertPayload { queue };
            if let Err(error) = notifier::notify(&self.pool, Channel::Insert, &payload).await {
                trace!(error = ?error, "insert notification failed");
            }
        }
    }

    async fn signal(&self, payload: SignalPayload) {
        if let Err(error) = notifier::notify(&self.pool, Channel::Signal, &payload).await {
            trace!(error = ?error, "signal notification failed");
        }
    }
}
