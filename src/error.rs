use thiserror::Error;

/// Errors surfaced by the queue library.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    /// A job failed validation before insertion.
    #[error("invalid job: {0}")]
    InvalidJob(String),

    /// Configuration rejected at construction time.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A cron expression failed to parse.
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),

    /// A job named a worker that was never registered.
    #[error("no worker registered for \"{0}\"")]
    UnknownWorker(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
