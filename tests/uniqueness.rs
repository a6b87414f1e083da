#[allow(dead_code)]
mod helpers;

use serde_json::json;
use sqlx::PgPool;
use stoker::client::Client;
use stoker::data::jobs;
use stoker::job::JobBuilder;
use stoker::unique::{Unique, UniqueField};

fn unique_echo(args: serde_json::Value) -> JobBuilder {
    JobBuilder::new("Echo").args(args).unique(Unique::default())
}

#[sqlx::test]
async fn duplicate_insert_collapses_to_existing_job(pool: PgPool) {
    let client = Client::new(pool.clone());

    let first = client.enqueue(unique_echo(json!({"id": 1}))).await.unwrap();
    let second = client.enqueue(unique_echo(json!({"id": 1}))).await.unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(helpers::job_count(&pool).await, 1);
}

#[sqlx::test]
async fn different_args_insert_separately(pool: PgPool) {
    let client = Client::new(pool.clone());

    let first = client.enqueue(unique_echo(json!({"id": 1}))).await.unwrap();
    let second = client.enqueue(unique_echo(json!({"id": 2}))).await.unwrap();

    assert_ne!(first.id, second.id);
    assert_eq!(helpers::job_count(&pool).await, 2);
}

#[sqlx::test]
async fn terminal_jobs_do_not_block_reinsertion(pool: PgPool) {
    let client = Client::new(pool.clone());

    let first = client.enqueue(unique_echo(json!({"id": 1}))).await.unwrap();

    // Run the first job to completion, then enqueue an identical one.
    jobs::fetch_jobs("default", "stoker.test", 1, &pool).await.unwrap();
    jobs::complete_job(first.id, None, &pool).await.unwrap();

    let second = client.enqueue(unique_echo(json!({"id": 1}))).await.unwrap();

    assert_ne!(first.id, second.id);
    assert_eq!(helpers::job_count(&pool).await, 2);
}

#[sqlx::test]
async fn executing_jobs_still_collapse(pool: PgPool) {
    let client = Client::new(pool.clone());

    let first = client.enqueue(unique_echo(json!({"id": 1}))).await.unwrap();
    jobs::fetch_jobs("default", "stoker.test", 1, &pool).await.unwrap();

    let second = client.enqueue(unique_echo(json!({"id": 1}))).await.unwrap();

    assert_eq!(first.id, second.id);
}

#[sqlx::test]
async fn keys_scoped_uniqueness_ignores_other_args(pool: PgPool) {
    let client = Client::new(pool.clone());
    let unique = Unique {
        fields: vec![UniqueField::Worker, UniqueField::Args],
        keys: vec!["id".to_owned()],
        ..Unique::default()
    };

    let first = client
        .enqueue(
            JobBuilder::new("Echo")
                .args(json!({"id": 7, "name": "foo"}))
                .unique(unique.clone()),
        )
        .await
        .unwrap();
    let second = client
        .enqueue(
            JobBuilder::new("Echo")
                .args(json!({"id": 7, "name": "bar"}))
                .unique(unique),
        )
        .await
        .unwrap();

    assert_eq!(first.id, second.id);
}

#[sqlx::test]
async fn period_uniqueness_prevents_double_emission(pool: PgPool) {
    let client = Client::new(pool.clone());

    // Same shape the cron scheduler uses: a leader handover inside the
    // minute would re-enqueue an identical job and must collapse.
    let tick = || {
        JobBuilder::new("Tick")
            .queue("cron")
            .unique(Unique::within_period(60))
    };

    let first = client.enqueue(tick()).await.unwrap();
    let second = client.enqueue(tick()).await.unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(helpers::job_count(&pool).await, 1);
}

#[sqlx::test]
async fn enqueue_many_batches_and_collapses(pool: PgPool) {
    let client = Client::new(pool.clone());

    // Seed a unique job the batch should collapse against.
    let seeded = client.enqueue(unique_echo(json!({"id": 1}))).await.unwrap();

    let inserted = client
        .enqueue_many(vec![
            JobBuilder::new("Echo").args(json!({"n": 1})),
            JobBuilder::new("Echo").args(json!({"n": 2})).queue("mailers"),
            unique_echo(json!({"id": 1})),
        ])
        .await
        .unwrap();

    assert_eq!(inserted.len(), 3);
    assert!(inserted.iter().any(|job| job.id == seeded.id));
    // Two plain rows plus the seeded unique row.
    assert_eq!(helpers::job_count(&pool).await, 3);
}
