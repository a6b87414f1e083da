//! Single-writer election over a Postgres advisory lock.
//!
//! The lock is session-scoped and held on a dedicated pool connection, so
//! losing the connection releases leadership automatically on the server
//! side. Non-leaders keep running everything that is not leader-gated.

use crate::config::LeadershipConfig;
use crate::runtime::notifier::{Channel, Notifier};
use serde_json::json;
use sha2::{Digest, Sha256};
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::time;
use tracing::{debug, info, warn};

/// Read-side handle on the election outcome.
#[derive(Debug, Clone)]
pub struct Leadership {
    rx: watch::Receiver<bool>,
}

impl Leadership {
    pub fn is_leader(&self) -> bool {
        *self.rx.borrow()
    }

    /// A handle that is never leader, for tests and disabled clusters.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    /// A handle that is always leader, for single-node tests.
    pub fn always() -> Self {
        let (_tx, rx) = watch::channel(true);
        Self { rx }
    }
}

/// Stable advisory lock key for an instance name.
fn advisory_key(name: &str) -> i64 {
    let digest = Sha256::digest(format!("stoker_leadership:{name}"));
    i64::from_be_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
}

pub struct Leader {
    pool: PgPool,
    config: LeadershipConfig,
    key: i64,
    name: String,
    node: String,
    tx: watch::Sender<bool>,
    notifier: Arc<Notifier>,
}

impl Leader {
    pub fn new(
        pool: PgPool,
        config: LeadershipConfig,
        name: &str,
        node: &str,
        notifier: Arc<Notifier>,
    ) -> (Self, Leadership) {
        let (tx, rx) = watch::channel(false);

        let leader = Self {
            pool,
            config,
            key: advisory_key(name),
            name: name.to_owned(),
            node: node.to_owned(),
            tx,
            notifier,
        };

        (leader, Leadership { rx })
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        if !self.config.enabled {
            debug!("leadership disabled");
            let _ = shutdown_rx.recv().await;
            return;
        }

        let mut conn: Option<PoolConnection<Postgres>> = None;

        loop {
            self.tick(&mut conn).await;

            tokio::select! {
                _ = time::sleep(self.config.interval) => {}
                _ = shutdown_rx.recv() => break,
            }
        }

        if *self.tx.borrow()
            && let Some(mut held) = conn.take()
        {
            let released = sqlx::query("SELECT pg_advisory_unlock($1)")
                .bind(self.key)
                .execute(&mut *held)
                .await;

            if let Err(error) = released {
                warn!(error = ?error, "failed to release leadership lock");
            }
        }

        self.transition(false).await;
        debug!("leader loop stopped");
    }

    async fn tick(&self, conn: &mut Option<PoolConnection<Postgres>>) {
        if *self.tx.borrow() {
            self.verify(conn).await;
        } else {
            self.acquire(conn).await;
        }
    }

    /// The lock rides on the session, so leadership holds exactly as long
    /// as the connection stays healthy.
    async fn verify(&self, conn: &mut Option<PoolConnection<Postgres>>) {
        let alive = match conn.as_mut() {
            Some(held) => sqlx::query("SELECT 1").execute(&mut **held).await.is_ok(),
            None => false,
        };

        if !alive {
            *conn = None;
            warn!("leadership lost");
            self.transition(false).await;
        }
    }

    async fn acquire(&self, conn: &mut Option<PoolConnection<Postgres>>) {
        if conn.is_none() {
            match self.pool.acquire().await {
                Ok(acquired) => *conn = Some(acquired),
                Err(error) => {
                    warn!(error = ?error, "leader could not acquire a connection");
                    return;
                }
            }
        }

        let Some(held) = conn.as_mut() else { return };

        let locked = sqlx::query_scalar::<_, bool>("SELECT pg_try_advisory_lock($1)")
            .bind(self.key)
            .fetch_one(&mut **held)
            .await;

        match locked {
            Ok(true) => {
                info!(name = %self.name, node = %self.node, "elected leader");
                self.transition(true).await;
            }
            Ok(false) => {}
            Err(error) => {
                *conn = None;
                warn!(error = ?error, "leadership probe failed");
            }
        }
    }

    async fn transition(&self, is_leader: bool) {
        let changed = *self.tx.borrow() != is_leader;
        let _ = self.tx.send(is_leader);

        if changed {
            let payload = json!({
                "name": self.name,
                "node": self.node,
                "leader": is_leader,
            });

            if let Err(error) = self.notifier.notify(Channel::Leader, &payload).await {
                debug!(error = ?error, "leader notification failed");
            }
        }
    }
}
