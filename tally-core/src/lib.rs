pub mod aggregate;
pub mod batch;
pub mod commit;
pub mod config;
pub mod error;
pub mod health;
pub mod message;
pub mod metrics;
pub mod metrics_consts;
pub mod pipeline;
pub mod signals;
pub mod sinks;
pub mod source;
pub mod test_utils;
