//! Producer table operations.
//!
//! Each running per-queue consumer owns exactly one row here for its
//! lifetime. Rows double as liveness records: the refresher heartbeats
//! `updated_at`, and the leader reaps rows past their max age.

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::time::Duration;
use uuid::Uuid;

/// Mutable producer bookkeeping stored as jsonb.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProducerMeta {
    pub local_limit: usize,
    #[serde(default)]
    pub paused: bool,
}

/// A producer row as stored in `stoker_producers`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Producer {
    pub uuid: Uuid,
    pub name: String,
    pub node: String,
    pub queue: String,
    pub meta: sqlx::types::Json<ProducerMeta>,
    pub inserted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Producer {
    /// Routing identity, matched against signal payloads.
    pub fn ident(&self) -> String {
        format!("{}.{}", self.name, self.node)
    }
}

pub async fn insert_producer(
    uuid: Uuid,
    name: &str,
    node: &str,
    queue: &str,
    meta: &ProducerMeta,
    pool: &PgPool,
) -> Result<Producer> {
    let producer = sqlx::query_as::<_, Producer>(
        "INSERT INTO stoker_producers (uuid, name, node, queue, meta) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING *",
    )
    .bind(uuid)
    .bind(name)
    .bind(node)
    .bind(queue)
    .bind(sqlx::types::Json(meta))
    .fetch_one(pool)
    .await?;

    Ok(producer)
}

/// Persist the paused flag so a pause survives producer restarts.
pub async fn set_paused(uuid: Uuid, paused: bool, pool: &PgPool) -> Result<()> {
    sqlx::query(
        "UPDATE stoker_producers \
         SET meta = jsonb_set(meta, '{paused}', to_jsonb($2::boolean)), \
             updated_at = now() \
         WHERE uuid = $1",
    )
    .bind(uuid)
    .bind(paused)
    .execute(pool)
    .await?;

    Ok(())
}

/// Refresh the heartbeat timestamp for this node's producers.
pub async fn heartbeat(uuids: &[Uuid], pool: &PgPool) -> Result<u64> {
    let result = sqlx::query("UPDATE stoker_producers SET updated_at = now() WHERE uuid = ANY($1)")
        .bind(uuids)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}

pub async fn delete_producer(uuid: Uuid, pool: &PgPool) -> Result<()> {
    sqlx::query("DELETE FROM stoker_producers WHERE uuid = $1")
        .bind(uuid)
        .execute(pool)
        .await?;

    Ok(())
}

/// Reap producer rows whose heartbeat is older than `max_age`.
///
/// Returns the reaped uuids so callers can log which producers went stale.
pub async fn delete_expired(max_age: Duration, pool: &PgPool) -> Result<Vec<Uuid>> {
    let reaped = sqlx::query_scalar(
        "DELETE FROM stoker_producers \
         WHERE updated_at < now() - make_interval(secs => $1::double precision) \
         RETURNING uuid",
    )
    .bind(max_age.as_secs_f64())
    .fetch_all(pool)
    .await?;

    Ok(reaped)
}
