use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::{ClientConfig, Message, Offset, TopicPartitionList};
use tally_core::commit::CommitSet;
use tally_core::error::SourceError;
use tally_core::message::MessageUnit;
use tally_core::source::{Fetched, Source};
use tracing::{debug, info};

use crate::config::KafkaConfig;

const METADATA_TIMEOUT: Duration = Duration::from_secs(5);

/// A consumer-group member subscribed to a single topic. Auto-commit is off,
/// offsets only move when the pipeline commits a counted batch.
pub struct KafkaSource {
    consumer: Arc<StreamConsumer>,
    topic: String,
}

impl KafkaSource {
    pub fn new(config: &KafkaConfig) -> Result<Self, SourceError> {
        let client_config: ClientConfig = config.into();

        let consumer: StreamConsumer = client_config.create().map_err(connect_error)?;
        consumer
            .subscribe(&[config.topic.as_str()])
            .map_err(connect_error)?;

        info!(
            topic = %config.topic,
            group = %config.consumer_group,
            brokers = %config.bootstrap_servers,
            "subscribed to topic"
        );

        Ok(Self {
            consumer: Arc::new(consumer),
            topic: config.topic.clone(),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

fn connect_error(e: KafkaError) -> SourceError {
    SourceError::Connect {
        broker: "Kafka",
        error: Box::new(e),
    }
}

/// Splits consume errors into the ones a later poll can recover from and the
/// ones that mean this consumer is done.
pub fn classify(e: KafkaError) -> SourceError {
    match &e {
        KafkaError::MessageConsumptionFatal(_) => SourceError::Closed(e.to_string()),
        KafkaError::Global(RDKafkaErrorCode::Fatal)
        | KafkaError::Global(RDKafkaErrorCode::Authentication) => {
            SourceError::Closed(e.to_string())
        }
        _ => SourceError::Transient(Box::new(e)),
    }
}

/// One entry per partition, at the next offset to consume.
pub fn partition_list(commits: &CommitSet) -> KafkaResult<TopicPartitionList> {
    let mut list = TopicPartitionList::with_capacity(commits.offsets().len());
    for (partition, offset) in commits.offsets() {
        list.add_partition_offset(
            partition.stream(),
            partition.partition(),
            Offset::Offset(*offset),
        )?;
    }
    Ok(list)
}

#[async_trait]
impl Source for KafkaSource {
    fn name(&self) -> &'static str {
        "Kafka"
    }

    async fn fetch(&self, timeout: Duration) -> Result<Fetched, SourceError> {
        let message = match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_) => return Ok(Fetched::Timeout),
            Ok(Err(e)) => return Err(classify(e)),
            Ok(Ok(message)) => message,
        };

        Ok(Fetched::Unit(MessageUnit::offset(
            message.topic(),
            message.partition(),
            message.offset(),
            message.payload().unwrap_or_default().to_vec(),
        )))
    }

    async fn commit(&self, commits: &CommitSet) -> Result<(), SourceError> {
        let list = partition_list(commits).map_err(|e| SourceError::Commit(Box::new(e)))?;
        if list.count() == 0 {
            return Ok(());
        }

        let consumer = self.consumer.clone();
        tokio::task::spawn_blocking(move || consumer.commit(&list, CommitMode::Sync))
            .await
            .map_err(|e| SourceError::Commit(Box::new(e)))?
            .map_err(|e| SourceError::Commit(Box::new(e)))?;

        debug!(positions = %commits, "committed offsets");
        Ok(())
    }

    async fn ping(&self) -> Result<(), SourceError> {
        let consumer = self.consumer.clone();
        tokio::task::spawn_blocking(move || consumer.fetch_metadata(None, METADATA_TIMEOUT))
            .await
            .map_err(|e| SourceError::Unreachable(Box::new(e)))?
            .map_err(|e| SourceError::Unreachable(Box::new(e)))?;
        Ok(())
    }

    async fn close(&self) -> Result<(), SourceError> {
        self.consumer.unsubscribe();
        info!(topic = %self.topic, "unsubscribed from topic");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rdkafka::types::RDKafkaErrorCode;
    use tally_core::message::MessageUnit;

    use super::*;

    #[test]
    fn partition_list_uses_next_offsets() {
        let units = vec![
            MessageUnit::offset("weather-tweets", 0, 41, Vec::new()),
            MessageUnit::offset("weather-tweets", 0, 42, Vec::new()),
            MessageUnit::offset("weather-tweets", 2, 7, Vec::new()),
        ];
        let list = partition_list(&CommitSet::for_batch(&units)).unwrap();

        assert_eq!(list.count(), 2);
        assert_eq!(
            list.find_partition("weather-tweets", 0).unwrap().offset(),
            Offset::Offset(43)
        );
        assert_eq!(
            list.find_partition("weather-tweets", 2).unwrap().offset(),
            Offset::Offset(8)
        );
    }

    #[test]
    fn tags_do_not_reach_kafka() {
        let units = vec![MessageUnit::tagged("weather-tweets", 1, Vec::new())];
        let list = partition_list(&CommitSet::for_batch(&units)).unwrap();
        assert_eq!(list.count(), 0);
    }

    #[test]
    fn classifies_errors() {
        assert!(classify(KafkaError::MessageConsumptionFatal(RDKafkaErrorCode::Fatal)).is_fatal());
        assert!(classify(KafkaError::Global(RDKafkaErrorCode::Authentication)).is_fatal());
        assert!(
            !classify(KafkaError::MessageConsumption(RDKafkaErrorCode::OperationTimedOut))
                .is_fatal()
        );
        assert!(!classify(KafkaError::Global(RDKafkaErrorCode::AllBrokersDown)).is_fatal());
    }
}
