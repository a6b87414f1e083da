//! Leader-only cron emission.
//!
//! The loop sleeps to the next minute boundary and enqueues a job for every
//! entry whose expression matches that minute. Entries carry period-60
//! uniqueness, so a leader handover inside a minute cannot double-fire.

use crate::cron::Expression;
use crate::data::jobs;
use crate::error::Result;
use crate::job::JobBuilder;
use crate::runtime::leader::Leadership;
use crate::runtime::notifier::{Channel, InsertPayload, Notifier};
use crate::unique::Unique;
use chrono::{DateTime, Timelike, Utc};
use serde_json::Value;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time;
use tracing::{debug, warn};

/// One configured cron entry, parsed and validated.
#[derive(Debug, Clone)]
pub struct CronEntry {
    pub expression: Expression,
    pub worker: String,
    pub queue: String,
    pub args: Value,
    pub priority: i32,
}

pub struct Scheduler {
    pool: PgPool,
    entries: Vec<CronEntry>,
    leadership: Leadership,
    notifier: Arc<Notifier>,
}

impl Scheduler {
    pub fn new(
        pool: PgPool,
        entries: Vec<CronEntry>,
        leadership: Leadership,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            pool,
            entries,
            leadership,
            notifier,
        }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        debug!(entries = self.entries.len(), "cron scheduler started");

        loop {
            let wait = time_to_next_minute(Utc::now());

            tokio::select! {
                _ = time::sleep(wait) => {}
                _ = shutdown_rx.recv() => break,
            }

            if !self.leadership.is_leader() {
                continue;
            }

            if let Err(error) = self.emit_due(Utc::now()).await {
                warn!(error = ?error, "cron emission failed");
            }
        }

        debug!("cron scheduler stopped");
    }

    async fn emit_due(&self, now: DateTime<Utc>) -> Result<()> {
        for entry in &self.entries {
            if !entry.expression.is_now(now) {
                continue;
            }

            let new = JobBuilder::new(&entry.worker)
                .queue(&entry.queue)
                .args(entry.args.clone())
                .priority(entry.priority)
                .unique(Unique::within_period(60))
                .build()?;

            let job = jobs::insert_job(&new, &self.pool).await?;
            debug!(
                job_id = job.id,
                worker = %entry.worker,
                queue = %entry.queue,
                "cron job enqueued"
            );

            let payload = InsertPayload {
                queue: entry.queue.clone(),
            };
            if let Err(error) = self.notifier.notify(Channel::Insert, &payload).await {
                debug!(error = ?error, "cron insert notification failed");
            }
        }

        Ok(())
    }
}

/// Time remaining until the next minute boundary, always in `(0, 60s]`.
fn time_to_next_minute(now: DateTime<Utc>) -> Duration {
    let elapsed_micros = u64::from(now.second()) * 1_000_000
        + u64::from(now.nanosecond().min(999_999_999) / 1_000);

    Duration::from_micros(60_000_000 - elapsed_micros.min(59_999_999))
}
