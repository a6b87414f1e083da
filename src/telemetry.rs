//! Observer hooks for job execution events.
//!
//! Handlers are attached under a name and receive every event whose kind
//! they subscribed to. The registry is shared between the runtime and any
//! embedding application.

use crate::job::{Job, JobState};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

/// Kinds of events the executor emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobEventKind {
    Start,
    Stop,
    Exception,
}

/// A single execution event.
#[derive(Debug, Clone)]
pub struct JobEvent {
    pub kind: JobEventKind,
    pub job: Job,
    /// Terminal (or re-scheduled) state; absent on `Start`.
    pub state: Option<JobState>,
    /// Wall-clock execution time; zero on `Start`.
    pub duration: Duration,
    /// Time between becoming runnable and being attempted.
    pub queue_time: Duration,
    /// Error description; present only on `Exception`.
    pub error: Option<String>,
}

type Handler = Arc<dyn Fn(&JobEvent) + Send + Sync>;

struct Attachment {
    events: Vec<JobEventKind>,
    handler: Handler,
}

/// Named attach-table for telemetry handlers.
#[derive(Clone, Default)]
pub struct TelemetryRegistry {
    attachments: Arc<DashMap<String, Attachment>>,
}

impl TelemetryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a handler for the given event kinds, replacing any handler
    /// previously attached under the same name.
    pub fn attach<F>(&self, name: impl Into<String>, events: &[JobEventKind], handler: F)
    where
        F: Fn(&JobEvent) + Send + Sync + 'static,
    {
        self.attachments.insert(
            name.into(),
            Attachment {
                events: events.to_vec(),
                handler: Arc::new(handler),
            },
        );
    }

    pub fn detach(&self, name: &str) {
        self.attachments.remove(name);
    }

    pub(crate) fn emit(&self, event: &JobEvent) {
        for entry in self.attachments.iter() {
            if entry.value().events.contains(&event.kind) {
                (entry.value().handler)(event);
            }
        }
    }
}

impl std::fmt::Debug for TelemetryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self.attachments.iter().map(|e| e.key().clone()).collect();
        f.debug_struct("TelemetryRegistry")
            .field("attachments", &names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobBuilder;
    use std::sync::Mutex;

    fn test_job() -> Job {
        let new = JobBuilder::new("Echo").build().unwrap();

        Job {
            id: 1,
            state: JobState::Executing,
            queue: new.queue,
            worker: new.worker,
            args: new.args,
            meta: new.meta,
            tags: new.tags,
            errors: sqlx::types::Json(Vec::new()),
            attempted_by: Vec::new(),
            attempt: 1,
            max_attempts: new.max_attempts,
            priority: new.priority,
            inserted_at: chrono::Utc::now(),
            scheduled_at: new.scheduled_at,
            attempted_at: None,
            completed_at: None,
            cancelled_at: None,
            discarded_at: None,
            cancellation: Default::default(),
        }
    }

    fn event(kind: JobEventKind) -> JobEvent {
        JobEvent {
            kind,
            job: test_job(),
            state: Some(JobState::Completed),
            duration: Duration::from_millis(5),
            queue_time: Duration::from_millis(1),
            error: None,
        }
    }

    #[test]
    fn dispatches_only_subscribed_kinds() {
        let registry = TelemetryRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        registry.attach("test", &[JobEventKind::Stop], move |event| {
            sink.lock().unwrap().push(event.kind);
        });

        registry.emit(&event(JobEventKind::Start));
        registry.emit(&event(JobEventKind::Stop));
        registry.emit(&event(JobEventKind::Exception));

        assert_eq!(*seen.lock().unwrap(), vec![JobEventKind::Stop]);
    }

    #[test]
    fn detach_removes_handler() {
        let registry = TelemetryRegistry::new();
        let seen = Arc::new(Mutex::new(0));

        let sink = seen.clone();
        registry.attach("test", &[JobEventKind::Stop], move |_| {
            *sink.lock().unwrap() += 1;
        });

        registry.emit(&event(JobEventKind::Stop));
        registry.detach("test");
        registry.emit(&event(JobEventKind::Stop));

        assert_eq!(*seen.lock().unwrap(), 1);
    }
}
