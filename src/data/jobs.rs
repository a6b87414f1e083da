//! Job table operations.
//!
//! These are the only statements that touch `stoker_jobs`. Each operation is
//! a single atomic statement (or one short transaction), and `fetch_jobs` is
//! the only path that moves a job into `executing`.

use crate::error::Result;
use crate::job::{ErrorRecord, Job, JobState, NewJob};
use serde_json::Value;
use sqlx::{PgExecutor, PgPool};
use std::collections::BTreeSet;
use std::time::Duration;

/// Insert a single job, applying uniqueness collapse when the job carries a
/// `uniq_key`.
///
/// When a non-terminal job with the same key already exists, no row is
/// written and the existing job is returned instead.
pub async fn insert_job(new: &NewJob, pool: &PgPool) -> Result<Job> {
    let Some(key) = new.uniq_key().map(str::to_owned) else {
        return insert_row(new, pool).await;
    };

    let mut tx = pool.begin().await?;

    // Serialize concurrent inserts of the same key for the duration of the
    // transaction, so two racing enqueues cannot both miss the existence
    // check and write duplicate rows.
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind(&key)
        .execute(&mut *tx)
        .await?;

    let existing = sqlx::query_as::<_, Job>(
        "SELECT * FROM stoker_jobs \
         WHERE meta ->> 'uniq_key' = $1 \
         AND state IN ('available', 'scheduled', 'executing', 'retryable') \
         ORDER BY id \
         LIMIT 1",
    )
    .bind(&key)
    .fetch_optional(&mut *tx)
    .await?;

    let job = match existing {
        Some(job) => job,
        None => insert_row(new, &mut *tx).await?,
    };

    tx.commit().await?;

    Ok(job)
}

async fn insert_row<'e>(new: &NewJob, executor: impl PgExecutor<'e>) -> Result<Job> {
    let job = sqlx::query_as::<_, Job>(
        "INSERT INTO stoker_jobs \
             (state, queue, worker, args, meta, tags, priority, max_attempts, scheduled_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
         RETURNING *",
    )
    .bind(new.state)
    .bind(&new.queue)
    .bind(&new.worker)
    .bind(&new.args)
    .bind(&new.meta)
    .bind(&new.tags)
    .bind(new.priority)
    .bind(new.max_attempts)
    .bind(new.scheduled_at)
    .fetch_one(executor)
    .await?;

    Ok(job)
}

/// Batch insert jobs using UNNEST for a single round-trip.
///
/// Uniqueness is not consulted here; callers route jobs carrying a
/// `uniq_key` through [`insert_job`] instead.
pub async fn insert_jobs(news: &[NewJob], pool: &PgPool) -> Result<Vec<Job>> {
    if news.is_empty() {
        return Ok(Vec::new());
    }

    let mut states: Vec<String> = Vec::with_capacity(news.len());
    let mut queues: Vec<&str> = Vec::with_capacity(news.len());
    let mut workers: Vec<&str> = Vec::with_capacity(news.len());
    let mut args: Vec<Value> = Vec::with_capacity(news.len());
    let mut metas: Vec<Value> = Vec::with_capacity(news.len());
    let mut tags: Vec<Value> = Vec::with_capacity(news.len());
    let mut priorities: Vec<i32> = Vec::with_capacity(news.len());
    let mut max_attempts: Vec<i32> = Vec::with_capacity(news.len());
    let mut scheduled_ats: Vec<chrono::DateTime<chrono::Utc>> = Vec::with_capacity(news.len());

    for new in news {
        states.push(new.state.to_string());
        queues.push(&new.queue);
        workers.push(&new.worker);
        args.push(new.args.clone());
        metas.push(new.meta.clone());
        tags.push(Value::from(new.tags.clone()));
        priorities.push(new.priority);
        max_attempts.push(new.max_attempts);
        scheduled_ats.push(new.scheduled_at);
    }

    let inserted = sqlx::query_as::<_, Job>(
        "INSERT INTO stoker_jobs \
             (state, queue, worker, args, meta, tags, priority, max_attempts, scheduled_at) \
         SELECT v.state::stoker_job_state, v.queue, v.worker, v.args, v.meta, \
                ARRAY(SELECT jsonb_array_elements_text(v.tags)), \
                v.priority, v.max_attempts, v.scheduled_at \
         FROM UNNEST($1::text[], $2::text[], $3::text[], $4::jsonb[], $5::jsonb[], \
                     $6::jsonb[], $7::int[], $8::int[], $9::timestamptz[]) \
             AS v(state, queue, worker, args, meta, tags, priority, max_attempts, scheduled_at) \
         RETURNING *",
    )
    .bind(&states)
    .bind(&queues)
    .bind(&workers)
    .bind(&args)
    .bind(&metas)
    .bind(&tags)
    .bind(&priorities)
    .bind(&max_attempts)
    .bind(&scheduled_ats)
    .fetch_all(pool)
    .await?;

    Ok(inserted)
}

/// Fetch a job by id.
pub async fn fetch_job(id: i64, pool: &PgPool) -> Result<Option<Job>> {
    let job = sqlx::query_as::<_, Job>("SELECT * FROM stoker_jobs WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?;

    Ok(job)
}

/// Promote due `scheduled` and `retryable` jobs to `available`, bounded by
/// `limit`. Returns the distinct queues that gained runnable jobs.
///
/// Idempotent on a stable clock: a second call promotes nothing new.
pub async fn stage_jobs(limit: i64, pool: &PgPool) -> Result<Vec<String>> {
    let queues: Vec<String> = sqlx::query_scalar(
        "UPDATE stoker_jobs j \
         SET state = 'available' \
         FROM ( \
             SELECT id FROM stoker_jobs \
             WHERE state IN ('scheduled', 'retryable') AND scheduled_at <= now() \
             ORDER BY scheduled_at ASC, id ASC \
             LIMIT $1 \
             FOR UPDATE SKIP LOCKED \
         ) due \
         WHERE j.id = due.id \
         RETURNING j.queue",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    let distinct: BTreeSet<String> = queues.into_iter().collect();

    Ok(distinct.into_iter().collect())
}

/// Queues that currently hold at least one `available` job.
pub async fn check_available_queues(pool: &PgPool) -> Result<Vec<String>> {
    let queues = sqlx::query_scalar(
        "SELECT DISTINCT queue FROM stoker_jobs WHERE state = 'available'",
    )
    .fetch_all(pool)
    .await?;

    Ok(queues)
}

/// Atomically claim up to `demand` available jobs for a queue.
///
/// Jobs are taken in `(priority, scheduled_at, id)` order; `FOR UPDATE SKIP
/// LOCKED` guarantees concurrent fetchers on any number of nodes receive
/// disjoint rows. Each claimed job moves to `executing` with its attempt
/// incremented and the producer ident appended to `attempted_by`.
pub async fn fetch_jobs(queue: &str, ident: &str, demand: i64, pool: &PgPool) -> Result<Vec<Job>> {
    let jobs = sqlx::query_as::<_, Job>(
        "UPDATE stoker_jobs j \
         SET state = 'executing', \
             attempt = j.attempt + 1, \
             attempted_at = now(), \
             attempted_by = array_append(j.attempted_by, $2) \
         FROM ( \
             SELECT id FROM stoker_jobs \
             WHERE state = 'available' AND queue = $1 \
             ORDER BY priority ASC, scheduled_at ASC, id ASC \
             LIMIT $3 \
             FOR UPDATE SKIP LOCKED \
         ) ready \
         WHERE j.id = ready.id \
         RETURNING j.*",
    )
    .bind(queue)
    .bind(ident)
    .bind(demand)
    .fetch_all(pool)
    .await?;

    Ok(jobs)
}

/// Mark an executing job completed, optionally storing a recorded value in
/// `meta.recorded`.
pub async fn complete_job(id: i64, recorded: Option<&Value>, pool: &PgPool) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE stoker_jobs \
         SET state = 'completed', \
             completed_at = now(), \
             meta = CASE WHEN $2::jsonb IS NULL THEN meta \
                         ELSE jsonb_set(meta, '{recorded}', $2::jsonb) END \
         WHERE id = $1 AND state = 'executing'",
    )
    .bind(id)
    .bind(recorded)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Record a failed attempt.
///
/// Moves the job to `retryable` with `scheduled_at = now() + backoff`, or to
/// `discarded` when attempts are exhausted. Returns the resulting state, or
/// `None` if the job was no longer executing (e.g. cancelled externally).
pub async fn error_job(
    id: i64,
    record: &ErrorRecord,
    backoff: Duration,
    pool: &PgPool,
) -> Result<Option<JobState>> {
    let state = sqlx::query_scalar::<_, JobState>(
        "UPDATE stoker_jobs \
         SET state = CASE WHEN attempt >= max_attempts THEN 'discarded' \
                          ELSE 'retryable' END::stoker_job_state, \
             errors = errors || $2::jsonb, \
             scheduled_at = CASE WHEN attempt >= max_attempts THEN scheduled_at \
                                 ELSE now() + make_interval(secs => $3::double precision) END, \
             discarded_at = CASE WHEN attempt >= max_attempts THEN now() \
                                 ELSE discarded_at END \
         WHERE id = $1 AND state = 'executing' \
         RETURNING state",
    )
    .bind(id)
    .bind(serde_json::to_value(record)?)
    .bind(backoff.as_secs_f64())
    .fetch_optional(pool)
    .await?;

    Ok(state)
}

/// Push an executing job back to `scheduled`, `seconds` into the future.
///
/// `max_attempts` is incremented so a snooze never consumes an attempt.
pub async fn snooze_job(id: i64, seconds: u64, pool: &PgPool) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE stoker_jobs \
         SET state = 'scheduled', \
             scheduled_at = now() + make_interval(secs => $2::double precision), \
             max_attempts = max_attempts + 1 \
         WHERE id = $1 AND state = 'executing'",
    )
    .bind(id)
    .bind(seconds as f64)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Cancel any non-terminal job, recording the reason in `errors`.
///
/// Serves both worker-directed cancels and external cancellation requests.
pub async fn cancel_job(id: i64, reason: &str, pool: &PgPool) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE stoker_jobs \
         SET state = 'cancelled', \
             cancelled_at = now(), \
             errors = errors || jsonb_build_array(jsonb_build_object( \
                 'attempt', attempt, 'at', now(), 'error', $2::text)) \
         WHERE id = $1 AND state NOT IN ('completed', 'discarded', 'cancelled')",
    )
    .bind(id)
    .bind(reason)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Discard an executing job outright, recording a descriptive error.
///
/// Used when dispatch fails before the worker runs (unknown worker name).
pub async fn discard_job(id: i64, reason: &str, pool: &PgPool) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE stoker_jobs \
         SET state = 'discarded', \
             discarded_at = now(), \
             errors = errors || jsonb_build_array(jsonb_build_object( \
                 'attempt', attempt, 'at', now(), 'error', $2::text)) \
         WHERE id = $1 AND state = 'executing'",
    )
    .bind(id)
    .bind(reason)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Rescue executing jobs whose producer row no longer exists.
///
/// Orphans with attempts remaining return to `available`; exhausted orphans
/// are discarded. Returns the number of jobs transitioned.
pub async fn rescue_orphans(pool: &PgPool) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE stoker_jobs j \
         SET state = CASE WHEN j.attempt < j.max_attempts THEN 'available' \
                          ELSE 'discarded' END::stoker_job_state, \
             discarded_at = CASE WHEN j.attempt < j.max_attempts THEN j.discarded_at \
                                 ELSE now() END \
         WHERE j.state = 'executing' \
           AND NOT EXISTS ( \
               SELECT 1 FROM stoker_producers p \
               WHERE p.queue = j.queue \
                 AND p.name || '.' || p.node = j.attempted_by[array_upper(j.attempted_by, 1)] \
           )",
    )
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Rescue executing jobs last attempted by the given producer ident.
///
/// Called once at startup to recover jobs stranded by a previous unclean
/// shutdown of this node, before any producer starts fetching.
pub async fn force_rescue_node(ident: &str, pool: &PgPool) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE stoker_jobs \
         SET state = CASE WHEN attempt < max_attempts THEN 'available' \
                          ELSE 'discarded' END::stoker_job_state, \
             discarded_at = CASE WHEN attempt < max_attempts THEN discarded_at \
                                 ELSE now() END \
         WHERE state = 'executing' \
           AND attempted_by[array_upper(attempted_by, 1)] = $1",
    )
    .bind(ident)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Delete terminal jobs whose terminal timestamp is older than `max_age`,
/// bounded by `limit` to keep lock times short.
pub async fn prune(max_age: Duration, limit: i64, pool: &PgPool) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM stoker_jobs \
         WHERE id IN ( \
             SELECT id FROM stoker_jobs \
             WHERE (state = 'completed' \
                    AND completed_at < now() - make_interval(secs => $1::double precision)) \
                OR (state = 'cancelled' \
                    AND cancelled_at < now() - make_interval(secs => $1::double precision)) \
                OR (state = 'discarded' \
                    AND discarded_at < now() - make_interval(secs => $1::double precision)) \
             LIMIT $2 \
         )",
    )
    .bind(max_age.as_secs_f64())
    .bind(limit)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}
