use std::time::Duration;

use async_trait::async_trait;

use crate::commit::CommitSet;
use crate::error::SourceError;
use crate::message::{MessageUnit, Position};

/// Outcome of a single poll.
#[derive(Debug)]
pub enum Fetched {
    Unit(MessageUnit),
    /// Nothing arrived before the poll timeout. Not an error.
    Timeout,
}

/// The consume side of a broker.
#[async_trait]
pub trait Source: Send + Sync {
    /// Human readable broker name, used in logs and health diagnostics.
    fn name(&self) -> &'static str;

    /// Waits at most `timeout` for the next message.
    async fn fetch(&self, timeout: Duration) -> Result<Fetched, SourceError>;

    /// Durably advances the broker-side positions in `commits`.
    async fn commit(&self, commits: &CommitSet) -> Result<(), SourceError>;

    /// Hands positions back to the broker for redelivery after a failed flush.
    /// Offset-addressed brokers redeliver anything uncommitted on their own.
    async fn reject(&self, _positions: &[Position]) -> Result<(), SourceError> {
        Ok(())
    }

    /// Cheap connectivity probe for the health endpoint.
    async fn ping(&self) -> Result<(), SourceError>;

    async fn close(&self) -> Result<(), SourceError>;
}
