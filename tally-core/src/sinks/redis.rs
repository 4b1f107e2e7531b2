use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::aggregate::CountAggregate;
use crate::config::{redis_url, RedisConfig};
use crate::error::SinkError;
use crate::sinks::Sink;

/// Redis (or Valkey) counter store.
///
/// Country counts live in a hash, the grand total in a plain integer key.
/// A multiplexed connection is shared by every worker.
pub struct RedisSink {
    connection: MultiplexedConnection,
    config: RedisConfig,
}

impl RedisSink {
    pub async fn connect(addr: &str, config: RedisConfig) -> Result<Self, SinkError> {
        let url = redis_url(addr);
        info!("connecting to redis at {}...", url);

        let client = redis::Client::open(url)?;
        let connection =
            with_timeout(config.timeout.0, client.get_multiplexed_tokio_connection()).await?;

        let sink = RedisSink { connection, config };
        sink.ping().await?;
        info!("connected to redis");

        Ok(sink)
    }
}

/// Every increment of a batch, wrapped in MULTI/EXEC and sent in one round trip.
pub fn batch_pipeline(config: &RedisConfig, aggregate: &CountAggregate) -> redis::Pipeline {
    let mut counts: Vec<_> = aggregate.counts().iter().collect();
    counts.sort();

    let mut pipe = redis::pipe();
    pipe.atomic();
    for (country, increment) in counts {
        pipe.hincr(&config.country_hash, country, *increment)
            .ignore();
    }
    pipe.incr(&config.total_key, aggregate.total()).ignore();
    pipe
}

async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T, SinkError>
where
    F: Future<Output = redis::RedisResult<T>>,
{
    match timeout(limit, fut).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(SinkError::Timeout(limit)),
    }
}

#[async_trait]
impl Sink for RedisSink {
    fn name(&self) -> &'static str {
        "Redis"
    }

    async fn apply_batch(&self, aggregate: &CountAggregate) -> Result<(), SinkError> {
        let pipe = batch_pipeline(&self.config, aggregate);
        let mut conn = self.connection.clone();

        with_timeout(self.config.timeout.0, pipe.query_async::<_, ()>(&mut conn)).await?;

        debug!(
            countries = aggregate.counts().len(),
            total = aggregate.total(),
            "applied batch to redis"
        );
        Ok(())
    }

    async fn ping(&self) -> Result<(), SinkError> {
        let mut conn = self.connection.clone();
        with_timeout(
            self.config.timeout.0,
            redis::cmd("PING").query_async::<_, ()>(&mut conn),
        )
        .await
    }

    async fn close(&self) -> Result<(), SinkError> {
        // The multiplexed connection shuts down once its last clone is dropped.
        info!("closing redis connection");
        Ok(())
    }
}
