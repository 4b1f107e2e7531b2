use std::time::Duration;

use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised by a broker adapter.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("failed to connect to {broker}: {error}")]
    Connect {
        broker: &'static str,
        #[source]
        error: BoxError,
    },
    #[error("transient consume error: {0}")]
    Transient(#[source] BoxError),
    #[error("consumer stream closed: {0}")]
    Closed(String),
    #[error("failed to commit positions: {0}")]
    Commit(#[source] BoxError),
    #[error("failed to reject positions: {0}")]
    Reject(#[source] BoxError),
    #[error("connectivity check failed: {0}")]
    Unreachable(#[source] BoxError),
    #[error("failed to close consumer: {0}")]
    Close(#[source] BoxError),
}

impl SourceError {
    /// A fatal error ends ingestion. Everything else is retried by the next poll.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SourceError::Closed(_))
    }
}

/// Errors raised by the counter store.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("store did not answer within {0:?}")]
    Timeout(Duration),
    #[error("store rejected the write: {0}")]
    Rejected(String),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}
