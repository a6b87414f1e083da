#[allow(dead_code)]
mod helpers;

use sqlx::PgPool;
use std::time::Duration;
use stoker::data::producers::{self, ProducerMeta};
use uuid::Uuid;

#[sqlx::test]
async fn insert_returns_row_with_ident(pool: PgPool) {
    let uuid = Uuid::new_v4();
    let meta = ProducerMeta {
        local_limit: 10,
        paused: false,
    };

    let producer = producers::insert_producer(uuid, "stoker", "node-a", "default", &meta, &pool)
        .await
        .unwrap();

    assert_eq!(producer.uuid, uuid);
    assert_eq!(producer.queue, "default");
    assert_eq!(producer.ident(), "stoker.node-a");
    assert_eq!(producer.meta.local_limit, 10);
    assert!(!producer.meta.paused);
}

#[sqlx::test]
async fn heartbeat_touches_only_named_rows(pool: PgPool) {
    let mine = helpers::insert_producer(&pool, "stoker", "node-a", "default").await;
    let other = helpers::insert_producer(&pool, "stoker", "node-b", "default").await;

    // Age both rows so a heartbeat moves the timestamp forward measurably.
    sqlx::query("UPDATE stoker_producers SET updated_at = now() - INTERVAL '1 hour'")
        .execute(&pool)
        .await
        .unwrap();

    let refreshed = producers::heartbeat(&[mine], &pool).await.unwrap();
    assert_eq!(refreshed, 1);

    let (mine_age,): (f64,) = sqlx::query_as(
        "SELECT EXTRACT(EPOCH FROM now() - updated_at)::float8 \
         FROM stoker_producers WHERE uuid = $1",
    )
    .bind(mine)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert!(mine_age < 5.0, "heartbeat should refresh updated_at");

    let (other_age,): (f64,) = sqlx::query_as(
        "SELECT EXTRACT(EPOCH FROM now() - updated_at)::float8 \
         FROM stoker_producers WHERE uuid = $1",
    )
    .bind(other)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert!(other_age > 3000.0, "other rows should be untouched");
}

#[sqlx::test]
async fn set_paused_updates_meta(pool: PgPool) {
    let uuid = helpers::insert_producer(&pool, "stoker", "node-a", "default").await;

    producers::set_paused(uuid, true, &pool).await.unwrap();

    let (paused,): (bool,) =
        sqlx::query_as("SELECT (meta ->> 'paused')::boolean FROM stoker_producers WHERE uuid = $1")
            .bind(uuid)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert!(paused);
}

#[sqlx::test]
async fn delete_expired_reaps_only_stale_rows(pool: PgPool) {
    let live = helpers::insert_producer(&pool, "stoker", "node-a", "default").await;
    let stale = helpers::insert_producer(&pool, "stoker", "node-dead", "default").await;

    sqlx::query(
        "UPDATE stoker_producers SET updated_at = now() - INTERVAL '70 seconds' WHERE uuid = $1",
    )
    .bind(stale)
    .execute(&pool)
    .await
    .unwrap();

    let reaped = producers::delete_expired(Duration::from_secs(60), &pool)
        .await
        .unwrap();

    assert_eq!(reaped, vec![stale]);

    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM stoker_producers WHERE uuid = $1")
        .bind(live)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 1);
}

#[sqlx::test]
async fn delete_producer_removes_row(pool: PgPool) {
    let uuid = helpers::insert_producer(&pool, "stoker", "node-a", "default").await;

    producers::delete_producer(uuid, &pool).await.unwrap();

    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM stoker_producers")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 0);
}
