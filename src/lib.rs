//! Stoker: a persistent, distributed background job processor backed by
//! PostgreSQL.
//!
//! Jobs are rows; the database is the single source of truth. Nodes
//! coordinate through row locks (`FOR UPDATE SKIP LOCKED`), an advisory
//! lock for leader election, and `LISTEN`/`NOTIFY` for wakeups — no broker.
//!
//! Embedding sketch:
//!
//! ```rust,ignore
//! let registry = WorkerRegistry::new();
//! registry.register("Echo", EchoWorker);
//!
//! let client = Client::new(pool.clone());
//! client.enqueue(JobBuilder::new("Echo").args(json!({"x": 1}))).await?;
//!
//! // QueueRuntime (via App and its supervisor) drains the queues.
//! ```

pub mod app;
pub mod backoff;
pub mod cli;
pub mod client;
pub mod config;
pub mod cron;
pub mod data;
pub mod error;
pub mod job;
pub mod logging;
pub mod runtime;
pub mod status;
pub mod supervisor;
pub mod telemetry;
pub mod unique;
pub mod worker;

pub use client::Client;
pub use error::{Error, Result};
pub use job::{Job, JobBuilder, JobState};
pub use runtime::QueueRuntime;
pub use unique::Unique;
pub use worker::{Outcome, Worker, WorkerRegistry};
