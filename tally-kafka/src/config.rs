use envconfig::Envconfig;
use rdkafka::ClientConfig;
use tally_core::config::{HttpConfig, PipelineConfig, RedisConfig};

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(from = "REDIS_ADDR", default = "redis-service:6379")]
    pub redis_addr: String,

    #[envconfig(nested = true)]
    pub redis: RedisConfig,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(nested = true)]
    pub pipeline: PipelineConfig,

    #[envconfig(nested = true)]
    pub http: HttpConfig,
}

#[derive(Envconfig, Clone, Debug)]
pub struct KafkaConfig {
    #[envconfig(from = "KAFKA_BOOTSTRAP_SERVERS", default = "kafka-service:9092")]
    pub bootstrap_servers: String,

    #[envconfig(from = "KAFKA_CONSUMER_GROUP_ID", default = "weather-consumer-group")]
    pub consumer_group: String,

    #[envconfig(from = "KAFKA_TOPIC", default = "weather-tweets")]
    pub topic: String,

    #[envconfig(from = "KAFKA_TLS", default = "false")]
    pub tls: bool,

    #[envconfig(from = "KAFKA_SESSION_TIMEOUT_MS", default = "60000")]
    pub session_timeout_ms: u32,

    #[envconfig(from = "KAFKA_HEARTBEAT_INTERVAL_MS", default = "20000")]
    pub heartbeat_interval_ms: u32,

    #[envconfig(from = "KAFKA_FETCH_MAX_BYTES", default = "1048576")]
    pub fetch_max_bytes: u32,
}

impl From<&KafkaConfig> for ClientConfig {
    fn from(config: &KafkaConfig) -> Self {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("group.id", &config.consumer_group)
            .set("auto.offset.reset", "earliest")
            // Offsets are committed by the pipeline once a batch is counted.
            .set("enable.auto.commit", "false")
            .set("fetch.max.bytes", config.fetch_max_bytes.to_string())
            .set("session.timeout.ms", config.session_timeout_ms.to_string())
            .set(
                "heartbeat.interval.ms",
                config.heartbeat_interval_ms.to_string(),
            );

        if config.tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        client_config
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults_match_the_deployment() {
        let config = Config::init_from_hashmap(&HashMap::new()).unwrap();

        assert_eq!(config.redis_addr, "redis-service:6379");
        assert_eq!(config.redis.country_hash, "country_counts");
        assert_eq!(config.kafka.bootstrap_servers, "kafka-service:9092");
        assert_eq!(config.kafka.consumer_group, "weather-consumer-group");
        assert_eq!(config.kafka.topic, "weather-tweets");
        assert_eq!(config.pipeline.batch_size, 50);
        assert_eq!(config.http.bind(), "0.0.0.0:8080");
    }

    #[test]
    fn client_config_disables_auto_commit() {
        let mut env = HashMap::new();
        env.insert("KAFKA_TLS".to_owned(), "true".to_owned());
        env.insert("KAFKA_BOOTSTRAP_SERVERS".to_owned(), "broker:9093".to_owned());
        let config = Config::init_from_hashmap(&env).unwrap();

        let client_config: ClientConfig = (&config.kafka).into();
        assert_eq!(client_config.get("enable.auto.commit"), Some("false"));
        assert_eq!(client_config.get("auto.offset.reset"), Some("earliest"));
        assert_eq!(client_config.get("bootstrap.servers"), Some("broker:9093"));
        assert_eq!(client_config.get("security.protocol"), Some("ssl"));
        assert_eq!(client_config.get("fetch.max.bytes"), Some("1048576"));
    }
}
