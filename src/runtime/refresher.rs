//! Producer liveness: heartbeat this node's rows, and as leader reap stale
//! rows and rescue the jobs they stranded.

use crate::config::RefresherConfig;
use crate::data::{jobs, producers};
use crate::error::{Error, Result};
use crate::runtime::leader::Leadership;
use sqlx::PgPool;
use tokio::sync::broadcast;
use tokio::time;
use tracing::{debug, warn};
use uuid::Uuid;

pub struct Refresher {
    pool: PgPool,
    config: RefresherConfig,
    uuids: Vec<Uuid>,
    leadership: Leadership,
}

impl Refresher {
    pub fn new(
        pool: PgPool,
        config: RefresherConfig,
        uuids: Vec<Uuid>,
        leadership: Leadership,
    ) -> Result<Self> {
        if config.interval.is_zero() {
            return Err(Error::InvalidConfig("refresher interval must be positive".into()));
        }

        if config.max_age.is_zero() {
            return Err(Error::InvalidConfig("refresher max_age must be positive".into()));
        }

        Ok(Self {
            pool,
            config,
            uuids,
            leadership,
        })
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        debug!(
            interval = ?self.config.interval,
            max_age = ?self.config.max_age,
            producers = self.uuids.len(),
            "refresher started"
        );

        loop {
            tokio::select! {
                _ = time::sleep(self.config.interval) => {}
                _ = shutdown_rx.recv() => break,
            }

            self.refresh().await;

            if self.leadership.is_leader() {
                self.cleanup().await;
            }
        }

        debug!("refresher stopped");
    }

    /// Heartbeat every producer row owned by this node.
    async fn refresh(&self) {
        if self.uuids.is_empty() {
            return;
        }

        match producers::heartbeat(&self.uuids, &self.pool).await {
            Ok(refreshed) => {
                if refreshed < self.uuids.len() as u64 {
                    warn!(
                        expected = self.uuids.len(),
                        refreshed, "some producer rows were missing at heartbeat"
                    );
                }
            }
            Err(error) => warn!(error = ?error, "producer heartbeat failed"),
        }
    }

    /// Reap rows past max age, then rescue any jobs still attributed to
    /// producers that no longer exist.
    async fn cleanup(&self) {
        match producers::delete_expired(self.config.max_age, &self.pool).await {
            Ok(reaped) if reaped.is_empty() => {}
            Ok(reaped) => warn!(count = reaped.len(), uuids = ?reaped, "reaped expired producers"),
            Err(error) => {
                warn!(error = ?error, "failed to reap expired producers");
                return;
            }
        }

        match jobs::rescue_orphans(&self.pool).await {
            Ok(0) => {}
            Ok(rescued) => warn!(count = rescued, "rescued orphaned jobs"),
            Err(error) => warn!(error = ?error, "orphan rescue failed"),
        }
    }
}
