//! Leader-only retention of terminal jobs.

use crate::config::PrunerConfig;
use crate::data::jobs;
use crate::runtime::leader::Leadership;
use sqlx::PgPool;
use tokio::sync::broadcast;
use tokio::time;
use tracing::{debug, info, warn};

pub struct Pruner {
    pool: PgPool,
    config: PrunerConfig,
    leadership: Leadership,
}

impl Pruner {
    pub fn new(pool: PgPool, config: PrunerConfig, leadership: Leadership) -> Self {
        Self {
            pool,
            config,
            leadership,
        }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        debug!(
            interval = ?self.config.interval,
            max_age = ?self.config.max_age,
            limit = self.config.limit,
            "pruner started"
        );

        loop {
            tokio::select! {
                _ = time::sleep(self.config.interval) => {}
                _ = shutdown_rx.recv() => break,
            }

            if !self.leadership.is_leader() {
                continue;
            }

            // Deletes are bounded per pass; a backlog larger than the limit
            // drains across successive passes.
            match jobs::prune(self.config.max_age, self.config.limit, &self.pool).await {
                Ok(0) => {}
                Ok(pruned) => info!(count = pruned, "pruned terminal jobs"),
                Err(error) => warn!(error = ?error, "pruning pass failed"),
            }
        }

        debug!("pruner stopped");
    }
}
