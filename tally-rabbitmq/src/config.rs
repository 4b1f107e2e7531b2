use envconfig::Envconfig;
use tally_core::config::{HttpConfig, PipelineConfig, RedisConfig};

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(from = "VALKEY_ADDR", default = "valkey:6379")]
    pub valkey_addr: String,

    #[envconfig(nested = true)]
    pub redis: RedisConfig,

    #[envconfig(nested = true)]
    pub rabbitmq: RabbitConfig,

    #[envconfig(nested = true)]
    pub pipeline: PipelineConfig,

    #[envconfig(nested = true)]
    pub http: HttpConfig,
}

#[derive(Envconfig, Clone, Debug)]
pub struct RabbitConfig {
    #[envconfig(from = "RABBITMQ_URL", default = "amqp://rabbitmq:5672")]
    pub url: String,

    #[envconfig(from = "RABBITMQ_QUEUE", default = "weather-tweets")]
    pub queue: String,

    // Unacknowledged deliveries the broker lets this consumer hold.
    #[envconfig(from = "RABBITMQ_PREFETCH", default = "200")]
    pub prefetch: u16,
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults_match_the_deployment() {
        let config = Config::init_from_hashmap(&HashMap::new()).unwrap();

        assert_eq!(config.valkey_addr, "valkey:6379");
        assert_eq!(config.redis.total_key, "total_messages");
        assert_eq!(config.rabbitmq.url, "amqp://rabbitmq:5672");
        assert_eq!(config.rabbitmq.queue, "weather-tweets");
        assert_eq!(config.rabbitmq.prefetch, 200);
        assert_eq!(config.pipeline.worker_count, 5);
    }

    #[test]
    fn overrides() {
        let mut env = HashMap::new();
        env.insert("VALKEY_ADDR".to_owned(), "localhost:6380".to_owned());
        env.insert("RABBITMQ_QUEUE".to_owned(), "tweets-test".to_owned());
        env.insert("BATCH_SIZE".to_owned(), "10".to_owned());
        let config = Config::init_from_hashmap(&env).unwrap();

        assert_eq!(config.valkey_addr, "localhost:6380");
        assert_eq!(config.rabbitmq.queue, "tweets-test");
        assert_eq!(config.pipeline.batch_size, 10);
        assert_eq!(config.pipeline.queue_capacity(), 20);
    }
}
