//! The job entity: one queued unit of work.

use crate::error::{Error, Result};
use crate::unique::Unique;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Lifecycle state of a job.
///
/// `completed`, `discarded` and `cancelled` are terminal; everything else is
/// a point on the path toward execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "stoker_job_state", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Available,
    Scheduled,
    Executing,
    Retryable,
    Completed,
    Discarded,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Discarded | JobState::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Available => "available",
            JobState::Scheduled => "scheduled",
            JobState::Executing => "executing",
            JobState::Retryable => "retryable",
            JobState::Completed => "completed",
            JobState::Discarded => "discarded",
            JobState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded failure (or cancellation reason) for a job attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub attempt: i32,
    pub at: DateTime<Utc>,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

/// A job row as stored in `stoker_jobs`.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Job {
    pub id: i64,
    pub state: JobState,
    pub queue: String,
    pub worker: String,
    pub args: Value,
    pub meta: Value,
    pub tags: Vec<String>,
    pub errors: sqlx::types::Json<Vec<ErrorRecord>>,
    pub attempted_by: Vec<String>,
    pub attempt: i32,
    pub max_attempts: i32,
    pub priority: i32,
    pub inserted_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    pub attempted_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub discarded_at: Option<DateTime<Utc>>,

    /// Cooperative cancellation handle, armed while the job is executing.
    /// Workers may poll [`Job::cancelled`] at safe points and bail out with
    /// [`crate::worker::Outcome::Cancel`].
    #[sqlx(skip)]
    #[serde(skip)]
    pub(crate) cancellation: CancellationToken,
}

impl Job {
    /// Whether cooperative cancellation has been requested for this run.
    pub fn cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub(crate) fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// The value stored by a `Record` outcome on a prior run, if any.
    pub fn recorded(&self) -> Option<&Value> {
        self.meta.get("recorded")
    }

    /// The deduplication key, when the job was inserted with uniqueness.
    pub fn uniq_key(&self) -> Option<&str> {
        self.meta.get("uniq_key").and_then(Value::as_str)
    }
}

/// A validated job ready for insertion.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub worker: String,
    pub queue: String,
    pub args: Value,
    pub meta: Value,
    pub tags: Vec<String>,
    pub priority: i32,
    pub max_attempts: i32,
    pub state: JobState,
    pub scheduled_at: DateTime<Utc>,
}

impl NewJob {
    pub fn uniq_key(&self) -> Option<&str> {
        self.meta.get("uniq_key").and_then(Value::as_str)
    }
}

/// Builder for enqueueable jobs.
///
/// Validation happens in [`JobBuilder::build`]; invalid values are rejected
/// before any row is written.
#[derive(Debug, Clone)]
pub struct JobBuilder {
    worker: String,
    queue: String,
    args: Value,
    meta: Map<String, Value>,
    tags: Vec<String>,
    priority: i32,
    max_attempts: i32,
    scheduled_at: Option<DateTime<Utc>>,
    schedule_in: Option<Duration>,
    unique: Option<Unique>,
}

impl JobBuilder {
    pub fn new(worker: impl Into<String>) -> Self {
        Self {
            worker: worker.into(),
            queue: "default".to_owned(),
            args: Value::Object(Map::new()),
            meta: Map::new(),
            tags: Vec::new(),
            priority: 0,
            max_attempts: 20,
            scheduled_at: None,
            schedule_in: None,
            unique: None,
        }
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn args(mut self, args: Value) -> Self {
        self.args = args;
        self
    }

    pub fn meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.meta.insert(key.into(), value);
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    /// Schedule relative to now. Overrides [`JobBuilder::scheduled_at`].
    pub fn schedule_in(mut self, delay: Duration) -> Self {
        self.schedule_in = Some(delay);
        self
    }

    pub fn unique(mut self, unique: Unique) -> Self {
        self.unique = Some(unique);
        self
    }

    /// Validate and normalize into an insertable job.
    pub fn build(self) -> Result<NewJob> {
        let worker = self.worker.trim();
        if worker.is_empty() {
            return Err(Error::InvalidJob("worker must be a non-empty string".into()));
        }

        let queue = self.queue.trim();
        if queue.is_empty() {
            return Err(Error::InvalidJob("queue must be a non-empty string".into()));
        }

        if self.max_attempts < 1 {
            return Err(Error::InvalidJob(format!(
                "max_attempts must be positive, got {}",
                self.max_attempts
            )));
        }

        if !(0..=9).contains(&self.priority) {
            return Err(Error::InvalidJob(format!(
                "priority must be between 0 and 9, got {}",
                self.priority
            )));
        }

        let now = Utc::now();
        let scheduled_at = match self.schedule_in {
            Some(delay) => now + chrono::Duration::from_std(delay).unwrap_or_default(),
            None => self.scheduled_at.unwrap_or(now),
        };

        let state = if scheduled_at <= now {
            JobState::Available
        } else {
            JobState::Scheduled
        };

        let mut meta = self.meta;
        if let Some(unique) = &self.unique {
            crate::unique::apply(&mut meta, worker, queue, &self.args, scheduled_at, unique);
        }

        Ok(NewJob {
            worker: worker.to_owned(),
            queue: queue.to_owned(),
            args: self.args,
            meta: Value::Object(meta),
            tags: normalize_tags(self.tags),
            priority: self.priority,
            max_attempts: self.max_attempts,
            state,
            scheduled_at,
        })
    }
}

/// Trim, lowercase, drop empties, deduplicate, and sort.
fn normalize_tags(tags: Vec<String>) -> Vec<String> {
    let mut tags: Vec<String> = tags
        .into_iter()
        .map(|tag| tag.trim().to_lowercase())
        .filter(|tag| !tag.is_empty())
        .collect();

    tags.sort();
    tags.dedup();
    tags
}
