use chrono::{DateTime, Utc};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("connectivity error: {0}")]
    Connectivity(String),

    #[error(
        "migration lock '{lock_name}' is held by {holder} (pid {pid}) since {}",
        .locked_at.to_rfc3339()
    )]
    LockContention {
        lock_name: String,
        holder: String,
        pid: u32,
        locked_at: DateTime<Utc>,
    },

    #[error("migration {version} failed: {message} (statement: {statement})")]
    MigrationExecution {
        version: String,
        statement: String,
        message: String,
    },

    #[error("integrity error: {0}")]
    Integrity(String),

    #[error("confirmation aborted: {0}")]
    ConfirmationAborted(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
