use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

/// Insert a job row directly via SQL, returning the generated ID.
///
/// `scheduled_offset_secs` shifts `scheduled_at` relative to now (negative
/// values are in the past).
pub async fn insert_job(
    pool: &PgPool,
    state: &str,
    queue: &str,
    worker: &str,
    args: Value,
    priority: i32,
    scheduled_offset_secs: i64,
) -> i64 {
    insert_job_with_attempts(
        pool,
        state,
        queue,
        worker,
        args,
        priority,
        scheduled_offset_secs,
        0,
        20,
    )
    .await
}

#[allow(clippy::too_many_arguments)]
pub async fn insert_job_with_attempts(
    pool: &PgPool,
    state: &str,
    queue: &str,
    worker: &str,
    args: Value,
    priority: i32,
    scheduled_offset_secs: i64,
    attempt: i32,
    max_attempts: i32,
) -> i64 {
    let (id,): (i64,) = sqlx::query_as(
        "INSERT INTO stoker_jobs \
             (state, queue, worker, args, priority, scheduled_at, attempt, max_attempts) \
         VALUES ($1::stoker_job_state, $2, $3, $4, $5, \
                 now() + make_interval(secs => $6::double precision), $7, $8) \
         RETURNING id",
    )
    .bind(state)
    .bind(queue)
    .bind(worker)
    .bind(args)
    .bind(priority)
    .bind(scheduled_offset_secs as f64)
    .bind(attempt)
    .bind(max_attempts)
    .fetch_one(pool)
    .await
    .expect("insert_job failed");

    id
}

/// Insert a producer row, returning its uuid.
pub async fn insert_producer(pool: &PgPool, name: &str, node: &str, queue: &str) -> Uuid {
    let uuid = Uuid::new_v4();

    sqlx::query(
        "INSERT INTO stoker_producers (uuid, name, node, queue, meta) \
         VALUES ($1, $2, $3, $4, '{\"local_limit\": 10, \"paused\": false}'::jsonb)",
    )
    .bind(uuid)
    .bind(name)
    .bind(node)
    .bind(queue)
    .execute(pool)
    .await
    .expect("insert_producer failed");

    uuid
}

/// Fetch a job's state column as text.
pub async fn job_state(pool: &PgPool, id: i64) -> String {
    let (state,): (String,) = sqlx::query_as("SELECT state::text FROM stoker_jobs WHERE id = $1")
        .bind(id)
        .fetch_one(pool)
        .await
        .expect("job not found");

    state
}

/// Count all job rows.
pub async fn job_count(pool: &PgPool) -> i64 {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM stoker_jobs")
        .fetch_one(pool)
        .await
        .expect("count failed");

    count
}
