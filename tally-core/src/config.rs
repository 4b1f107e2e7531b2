use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

use crate::error::ConfigError;

/// Batching and concurrency knobs shared by every consumer binary.
#[derive(Envconfig, Clone, Debug)]
pub struct PipelineConfig {
    #[envconfig(from = "BATCH_SIZE", default = "50")]
    pub batch_size: usize,

    #[envconfig(from = "FLUSH_INTERVAL_MS", default = "1000")]
    pub flush_interval: EnvMsDuration,

    #[envconfig(from = "POLL_TIMEOUT_MS", default = "100")]
    pub poll_timeout: EnvMsDuration,

    #[envconfig(from = "WORKER_COUNT", default = "5")]
    pub worker_count: usize,

    // 0 means twice the batch size
    #[envconfig(from = "QUEUE_CAPACITY", default = "0")]
    pub queue_capacity: usize,
}

impl PipelineConfig {
    pub fn queue_capacity(&self) -> usize {
        match self.queue_capacity {
            0 => self.batch_size.max(1) * 2,
            capacity => capacity,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Zero("BATCH_SIZE"));
        }
        if self.worker_count == 0 {
            return Err(ConfigError::Zero("WORKER_COUNT"));
        }
        if self.flush_interval.0.is_zero() {
            return Err(ConfigError::Zero("FLUSH_INTERVAL_MS"));
        }
        if self.poll_timeout.0.is_zero() {
            return Err(ConfigError::Zero("POLL_TIMEOUT_MS"));
        }
        Ok(())
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            flush_interval: EnvMsDuration(time::Duration::from_secs(1)),
            poll_timeout: EnvMsDuration(time::Duration::from_millis(100)),
            worker_count: 5,
            queue_capacity: 0,
        }
    }
}

/// Key layout of the counter store. The address lives in each binary's config.
#[derive(Envconfig, Clone, Debug)]
pub struct RedisConfig {
    #[envconfig(from = "REDIS_COUNTRY_HASH", default = "country_counts")]
    pub country_hash: String,

    #[envconfig(from = "REDIS_TOTAL_KEY", default = "total_messages")]
    pub total_key: String,

    #[envconfig(from = "REDIS_TIMEOUT_MS", default = "2000")]
    pub timeout: EnvMsDuration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            country_hash: "country_counts".to_owned(),
            total_key: "total_messages".to_owned(),
            timeout: EnvMsDuration(time::Duration::from_secs(2)),
        }
    }
}

/// Health server bind address.
#[derive(Envconfig, Clone, Debug)]
pub struct HttpConfig {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8080")]
    pub port: u16,

    // Upper bound for each dependency probe behind /health.
    #[envconfig(from = "HEALTH_PROBE_TIMEOUT_MS", default = "6000")]
    pub probe_timeout: EnvMsDuration,
}

impl HttpConfig {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl std::fmt::Display for ParseEnvMsDurationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("expected a duration in milliseconds")
    }
}

impl std::error::Error for ParseEnvMsDurationError {}

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

/// Accepts both `redis://host:port` URLs and the bare `host:port` form used
/// by the deployment manifests.
pub fn redis_url(addr: &str) -> String {
    if addr.contains("://") {
        addr.to_owned()
    } else {
        format!("redis://{addr}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_durations() {
        let parsed: EnvMsDuration = "250".parse().unwrap();
        assert_eq!(parsed.0, time::Duration::from_millis(250));
        assert!("1s".parse::<EnvMsDuration>().is_err());
    }

    #[test]
    fn queue_capacity_defaults_to_twice_the_batch() {
        let config = PipelineConfig::default();
        assert_eq!(config.queue_capacity(), 100);

        let config = PipelineConfig {
            queue_capacity: 7,
            ..PipelineConfig::default()
        };
        assert_eq!(config.queue_capacity(), 7);
    }

    #[test]
    fn rejects_zero_sizes() {
        assert_eq!(PipelineConfig::default().validate(), Ok(()));

        let config = PipelineConfig {
            worker_count: 0,
            ..PipelineConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::Zero("WORKER_COUNT")));

        let config = PipelineConfig {
            batch_size: 0,
            ..PipelineConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::Zero("BATCH_SIZE")));
    }

    #[test]
    fn pipeline_defaults_from_empty_env() {
        let config = PipelineConfig::init_from_hashmap(&Default::default()).unwrap();
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.worker_count, 5);
        assert_eq!(config.flush_interval.0, time::Duration::from_secs(1));
        assert_eq!(config.poll_timeout.0, time::Duration::from_millis(100));
    }

    #[test]
    fn redis_addresses() {
        assert_eq!(redis_url("redis-service:6379"), "redis://redis-service:6379");
        assert_eq!(redis_url("redis://valkey:6379/0"), "redis://valkey:6379/0");
    }
}
