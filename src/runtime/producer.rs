//! The per-queue pull loop.
//!
//! Each producer owns one row in `stoker_producers` and a bounded set of
//! in-flight executor tasks. It wakes on a notification, a 1 second poll
//! timer (which also bounds worst-case shutdown latency), or completion of
//! one of its own tasks, and fetches at most `limit - running` jobs.

use crate::data::{jobs, producers};
use crate::runtime::executor::Executor;
use crate::runtime::notifier::{SignalAction, SignalPayload};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinSet;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Upper bound on waiting between fetch checks.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Minimum spacing between consecutive fetches, so a burst of notifications
/// coalesces into a single query.
const DEBOUNCE_INTERVAL: Duration = Duration::from_millis(5);

pub struct Producer {
    pool: PgPool,
    executor: Arc<Executor>,
    uuid: uuid::Uuid,
    ident: String,
    queue: String,
    limit: usize,
    paused: bool,
    wakeup: Arc<Notify>,
    signal_rx: broadcast::Receiver<SignalPayload>,
    running: JoinSet<i64>,
    cancellations: HashMap<i64, CancellationToken>,
    last_fetch: Option<Instant>,
}

impl Producer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: PgPool,
        executor: Arc<Executor>,
        uuid: uuid::Uuid,
        ident: String,
        queue: String,
        limit: usize,
        paused: bool,
        wakeup: Arc<Notify>,
        signal_rx: broadcast::Receiver<SignalPayload>,
    ) -> Self {
        Self {
            pool,
            executor,
            uuid,
            ident,
            queue,
            limit,
            paused,
            wakeup,
            signal_rx,
            running: JoinSet::new(),
            cancellations: HashMap::new(),
            last_fetch: None,
        }
    }

    /// Run until shutdown, then drain in-flight jobs and delete the row.
    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            queue = %self.queue,
            ident = %self.ident,
            limit = self.limit,
            "producer started"
        );

        loop {
            tokio::select! {
                _ = self.wakeup.notified() => {}
                _ = time::sleep(POLL_INTERVAL) => {}
                Some(finished) = self.running.join_next(), if !self.running.is_empty() => {
                    self.reap(finished);
                    // Freed capacity; re-check demand on the next pass.
                    self.wakeup.notify_one();
                    continue;
                }
                signal = self.signal_rx.recv() => {
                    self.handle_signal(signal).await;
                    continue;
                }
                _ = shutdown_rx.recv() => break,
            }

            if self.paused {
                continue;
            }

            let demand = self.limit.saturating_sub(self.running.len());
            if demand == 0 {
                continue;
            }

            self.debounce().await;
            self.fetch_and_spawn(demand).await;
        }

        self.drain().await;

        if let Err(error) = producers::delete_producer(self.uuid, &self.pool).await {
            warn!(queue = %self.queue, error = ?error, "failed to delete producer row");
        }

        info!(queue = %self.queue, "producer stopped");
    }

    async fn fetch_and_spawn(&mut self, demand: usize) {
        let fetched = jobs::fetch_jobs(&self.queue, &self.ident, demand as i64, &self.pool).await;
        self.last_fetch = Some(Instant::now());

        let fetched = match fetched {
            Ok(fetched) => fetched,
            Err(error) => {
                warn!(queue = %self.queue, error = ?error, "failed to fetch jobs");
                return;
            }
        };

        if fetched.is_empty() {
            trace!(queue = %self.queue, "no jobs available");
            return;
        }

        debug!(queue = %self.queue, count = fetched.len(), "fetched jobs");

        for mut job in fetched {
            let token = CancellationToken::new();
            job.cancellation = token.clone();
            self.cancellations.insert(job.id, token);

            let executor = self.executor.clone();
            self.running.spawn(async move {
                let id = job.id;
                if let Err(error) = executor.execute(job).await {
                    error!(job_id = id, error = ?error, "executor failed to record job transition");
                }
                id
            });
        }
    }

    fn reap(&mut self, finished: Result<i64, tokio::task::JoinError>) {
        match finished {
            Ok(id) => {
                self.cancellations.remove(&id);
            }
            Err(error) => error!(queue = %self.queue, error = ?error, "executor task panicked"),
        }
    }

    async fn handle_signal(&mut self, signal: Result<SignalPayload, broadcast::error::RecvError>) {
        let signal = match signal {
            Ok(signal) => signal,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(queue = %self.queue, missed, "producer lagged behind signals");
                return;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };

        if !signal.matches(&self.queue, &self.ident) {
            return;
        }

        match signal.action {
            SignalAction::Pause => {
                if !self.paused {
                    self.paused = true;
                    self.persist_paused(true).await;
                    info!(queue = %self.queue, "producer paused");
                }
            }
            SignalAction::Resume => {
                if self.paused {
                    self.paused = false;
                    self.persist_paused(false).await;
                    self.wakeup.notify_one();
                    info!(queue = %self.queue, "producer resumed");
                }
            }
            SignalAction::Cancel => {
                if let Some(token) = signal.job_id.and_then(|id| self.cancellations.get(&id)) {
                    token.cancel();
                    debug!(queue = %self.queue, job_id = signal.job_id, "cancellation requested");
                }
            }
        }
    }

    async fn persist_paused(&self, paused: bool) {
        if let Err(error) = producers::set_paused(self.uuid, paused, &self.pool).await {
            warn!(queue = %self.queue, error = ?error, "failed to persist paused flag");
        }
    }

    async fn debounce(&self) {
        if let Some(last) = self.last_fetch {
            let since = last.elapsed();
            if since < DEBOUNCE_INTERVAL {
                time::sleep(DEBOUNCE_INTERVAL - since).await;
            }
        }
    }

    /// Await every in-flight executor so jobs finish or record an error
    /// cleanly before the producer row disappears.
    async fn drain(&mut self) {
        if self.running.is_empty() {
            return;
        }

        debug!(queue = %self.queue, in_flight = self.running.len(), "draining producer");

        while let Some(finished) = self.running.join_next().await {
            self.reap(finished);
        }
    }
}
