use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties, Consumer};
use tally_core::commit::CommitSet;
use tally_core::error::SourceError;
use tally_core::message::{MessageUnit, Position};
use tally_core::source::{Fetched, Source};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::RabbitConfig;

const CONSUMER_TAG: &str = "weather-tally";

/// A manual-ack consumer on one durable queue.
pub struct RabbitSource {
    connection: Connection,
    channel: Channel,
    consumer: Mutex<Consumer>,
    queue: String,
}

impl RabbitSource {
    pub async fn connect(config: &RabbitConfig) -> Result<Self, SourceError> {
        let connection = Connection::connect(&config.url, ConnectionProperties::default())
            .await
            .map_err(connect_error)?;
        let channel = connection.create_channel().await.map_err(connect_error)?;

        channel
            .basic_qos(config.prefetch, BasicQosOptions::default())
            .await
            .map_err(connect_error)?;

        let queue = channel
            .queue_declare(
                &config.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(connect_error)?;
        info!(
            queue = %config.queue,
            messages = queue.message_count(),
            consumers = queue.consumer_count(),
            "declared queue"
        );

        let consumer = channel
            .basic_consume(
                &config.queue,
                CONSUMER_TAG,
                BasicConsumeOptions {
                    no_ack: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(connect_error)?;

        Ok(Self {
            connection,
            channel,
            consumer: Mutex::new(consumer),
            queue: config.queue.clone(),
        })
    }
}

fn connect_error(e: lapin::Error) -> SourceError {
    SourceError::Connect {
        broker: "RabbitMQ",
        error: Box::new(e),
    }
}

/// Delivery tags of `queue` in a commit set. Offsets never apply here.
pub fn acked_tags<'a>(queue: &str, commits: &'a CommitSet) -> &'a [u64] {
    commits
        .tags()
        .get(queue)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

/// Delivery tags of `queue` among rejected positions.
pub fn rejected_tags(queue: &str, positions: &[Position]) -> Vec<u64> {
    positions
        .iter()
        .filter_map(|position| match position {
            Position::Tag { queue: q, tag } if q == queue => Some(*tag),
            _ => None,
        })
        .collect()
}

#[async_trait]
impl Source for RabbitSource {
    fn name(&self) -> &'static str {
        "RabbitMQ"
    }

    async fn fetch(&self, timeout: Duration) -> Result<Fetched, SourceError> {
        let mut consumer = self.consumer.lock().await;
        let delivery = match tokio::time::timeout(timeout, consumer.next()).await {
            Err(_) => return Ok(Fetched::Timeout),
            Ok(None) => {
                return Err(SourceError::Closed(format!(
                    "delivery stream of {} ended",
                    self.queue
                )))
            }
            Ok(Some(Err(e))) => return Err(SourceError::Transient(Box::new(e))),
            Ok(Some(Ok(delivery))) => delivery,
        };

        Ok(Fetched::Unit(MessageUnit::tagged(
            &self.queue,
            delivery.delivery_tag,
            delivery.data,
        )))
    }

    async fn commit(&self, commits: &CommitSet) -> Result<(), SourceError> {
        // One ack per tag. A multiple-ack would also cover tags still held by
        // other workers.
        let tags = acked_tags(&self.queue, commits);
        for tag in tags {
            self.channel
                .basic_ack(*tag, BasicAckOptions { multiple: false })
                .await
                .map_err(|e| SourceError::Commit(Box::new(e)))?;
        }
        debug!(queue = %self.queue, count = tags.len(), "acknowledged deliveries");
        Ok(())
    }

    async fn reject(&self, positions: &[Position]) -> Result<(), SourceError> {
        let tags = rejected_tags(&self.queue, positions);
        for tag in &tags {
            self.channel
                .basic_nack(
                    *tag,
                    BasicNackOptions {
                        multiple: false,
                        requeue: true,
                    },
                )
                .await
                .map_err(|e| SourceError::Reject(Box::new(e)))?;
        }
        if !tags.is_empty() {
            warn!(queue = %self.queue, count = tags.len(), "requeued deliveries");
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), SourceError> {
        if !self.connection.status().connected() {
            return Err(SourceError::Unreachable("connection is not open".into()));
        }
        if !self.channel.status().connected() {
            return Err(SourceError::Unreachable("channel is not open".into()));
        }

        // A channel round trip proves the broker still answers.
        let probe = self
            .connection
            .create_channel()
            .await
            .map_err(|e| SourceError::Unreachable(Box::new(e)))?;
        probe
            .close(200, "health check")
            .await
            .map_err(|e| SourceError::Unreachable(Box::new(e)))?;
        Ok(())
    }

    async fn close(&self) -> Result<(), SourceError> {
        if self.channel.status().connected() {
            self.channel
                .close(200, "consumer shutting down")
                .await
                .map_err(|e| SourceError::Close(Box::new(e)))?;
        }
        if self.connection.status().connected() {
            self.connection
                .close(200, "consumer shutting down")
                .await
                .map_err(|e| SourceError::Close(Box::new(e)))?;
        }
        info!(queue = %self.queue, "closed RabbitMQ connection");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acks_only_tags_of_the_queue() {
        let units = vec![
            MessageUnit::tagged("weather-tweets", 3, Vec::new()),
            MessageUnit::tagged("weather-tweets", 1, Vec::new()),
            MessageUnit::tagged("other", 2, Vec::new()),
            MessageUnit::offset("weather-tweets", 0, 9, Vec::new()),
        ];
        let commits = CommitSet::for_batch(&units);

        assert_eq!(acked_tags("weather-tweets", &commits), &[1, 3]);
        assert!(acked_tags("missing", &commits).is_empty());
    }

    #[test]
    fn rejects_only_tags_of_the_queue() {
        let positions: Vec<Position> = vec![
            MessageUnit::tagged("weather-tweets", 7, Vec::new()),
            MessageUnit::tagged("other", 8, Vec::new()),
            MessageUnit::offset("weather-tweets", 0, 9, Vec::new()),
        ]
        .iter()
        .map(|unit| unit.position().clone())
        .collect();

        assert_eq!(rejected_tags("weather-tweets", &positions), vec![7]);
    }
}
