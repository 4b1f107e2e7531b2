use std::sync::Arc;

use anyhow::{bail, Context, Result};
use axum::Router;
use envconfig::Envconfig;
use tally_core::health::{self, HealthReporter};
use tally_core::metrics::{serve, setup_metrics_routes, ProcessingMetrics};
use tally_core::pipeline::{Pipeline, StopReason};
use tally_core::signals::cancel_on_signal;
use tally_core::sinks::redis::RedisSink;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use tally_kafka::config::Config;
use tally_kafka::source::KafkaSource;

fn setup_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log_layer = tracing_subscriber::fmt::layer().with_filter(filter);
    tracing_subscriber::registry().with(log_layer).init();
}

fn start_server(router: Router, bind: String) -> JoinHandle<()> {
    tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!("health server on {} stopped: {}", bind, e);
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();
    info!("starting Kafka consumer");

    let config = Config::init_from_env().context("failed to load configuration")?;
    info!("configuration loaded: {:?}", config);

    let sink = RedisSink::connect(&config.redis_addr, config.redis.clone())
        .await
        .with_context(|| format!("failed to connect to Redis at {}", config.redis_addr))?;

    let source = KafkaSource::new(&config.kafka).with_context(|| {
        format!(
            "failed to create Kafka consumer for {}",
            config.kafka.bootstrap_servers
        )
    })?;

    let source = Arc::new(source);
    let sink = Arc::new(sink);
    let metrics = Arc::new(ProcessingMetrics::new());

    let reporter = HealthReporter::new(
        source.clone(),
        sink.clone(),
        metrics.clone(),
        config.http.probe_timeout.0,
    );
    let router = setup_metrics_routes(health::router(reporter))
        .context("failed to install metrics recorder")?;
    let server = start_server(router, config.http.bind());
    info!("health server listening on {}", config.http.bind());

    let pipeline = Pipeline::new(config.pipeline.clone(), source, sink, metrics)
        .context("invalid pipeline configuration")?;

    let shutdown = CancellationToken::new();
    let signals = cancel_on_signal(shutdown.clone());

    let report = pipeline.run(shutdown).await;

    signals.abort();
    server.abort();

    match report.stopped_by {
        StopReason::Shutdown => Ok(()),
        reason => bail!(
            "Kafka consumer stopped unexpectedly ({:?}) after processing {} messages",
            reason,
            report.metrics.processed
        ),
    }
}
