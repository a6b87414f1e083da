//! Promotes due `scheduled`/`retryable` jobs and wakes producers.
//!
//! Every node runs a stager; staging is idempotent under `SKIP LOCKED`, so
//! overlap between nodes is harmless.

use crate::config::StagerConfig;
use crate::data::jobs;
use crate::error::Result;
use crate::runtime::notifier::{Channel, InsertPayload, Notifier};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Notify, broadcast};
use tokio::time;
use tracing::{debug, trace, warn};

pub struct Stager {
    pool: PgPool,
    config: StagerConfig,
    wakeups: Arc<HashMap<String, Arc<Notify>>>,
    notifier: Arc<Notifier>,
}

impl Stager {
    pub fn new(
        pool: PgPool,
        config: StagerConfig,
        wakeups: Arc<HashMap<String, Arc<Notify>>>,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            pool,
            config,
            wakeups,
            notifier,
        }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        debug!(
            interval = ?self.config.interval,
            limit = self.config.limit,
            "stager started"
        );

        loop {
            tokio::select! {
                _ = time::sleep(self.config.interval) => {}
                _ = shutdown_rx.recv() => break,
            }

            if let Err(error) = self.stage().await {
                warn!(error = ?error, "staging pass failed");
            }
        }

        debug!("stager stopped");
    }

    async fn stage(&self) -> Result<()> {
        let staged = jobs::stage_jobs(self.config.limit, &self.pool).await?;

        if !staged.is_empty() {
            debug!(queues = ?staged, "staged jobs");
        }

        // Wake local producers for every queue with runnable work, staged
        // this pass or not; the wakeup is an event, so bursts collapse.
        let available = jobs::check_available_queues(&self.pool).await?;
        for queue in &available {
            if let Some(wakeup) = self.wakeups.get(queue) {
                trace!(queue, "waking producer");
                wakeup.notify_one();
            }
        }

        // Peers learn about freshly staged queues through the insert
        // channel; their own stagers cover anything we miss.
        for queue in staged {
            let payload = InsertPayload { queue };
            if let Err(error) = self.notifier.notify(Channel::Insert, &payload).await {
                trace!(error = ?error, "peer notification failed");
            }
        }

        Ok(())
    }
}
