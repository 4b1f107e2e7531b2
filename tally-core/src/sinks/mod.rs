
use async_trait::async_trait;

use crate::aggregate::CountAggregate;
use crate::error::SinkError;

/// The counter store.
#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &'static str;

    /// Applies every per-country increment and the total increment of one
    /// batch as a single write. Either all of it lands or the call errors.
    async fn apply_batch(&self, aggregate: &CountAggregate) -> Result<(), SinkError>;

    async fn ping(&self) -> Result<(), SinkError>;

    async fn close(&self) -> Result<(), SinkError>;
}

pub mod redis;
