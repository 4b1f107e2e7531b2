//! Ingestion loop, worker pool and shutdown sequence.
//!
//! A single ingestion task polls the source and pushes units onto a bounded
//! queue. A fixed pool of workers pulls from that queue, each one filling a
//! private batch that is flushed when it is full or when the worker's ticker
//! fires. A flush aggregates the batch, writes it to the sink and, only once
//! the write succeeded, commits the batch's positions on the source.
//!
//! Shutdown stops the polling, closes the queue, lets every worker drain and
//! flush what it holds, makes a last commit attempt and closes both ends.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::aggregate::aggregate;
use crate::batch::Batch;
use crate::commit::CommitCoordinator;
use crate::config::PipelineConfig;
use crate::error::ConfigError;
use crate::message::{MessageUnit, Position};
use crate::metrics::{MetricsSnapshot, ProcessingMetrics};
use crate::metrics_consts::{
    BATCHES_FLUSHED, BATCH_SIZE, COMMITS, COMMIT_ERRORS, DECODE_ERRORS, FETCH_ERRORS,
    FLUSH_DURATION, MESSAGES_RECEIVED, QUEUE_BLOCKED, REJECT_ERRORS, SINK_ERRORS,
    UNITS_DROPPED_ON_SHUTDOWN,
};
use crate::sinks::Sink;
use crate::source::{Fetched, Source};

type SharedQueue = Arc<Mutex<mpsc::Receiver<MessageUnit>>>;

/// Why the ingestion loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The shutdown token was cancelled.
    Shutdown,
    /// The source reported its stream as gone.
    SourceClosed,
    /// Every worker exited before the queue was closed.
    WorkersGone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineReport {
    pub stopped_by: StopReason,
    pub metrics: MetricsSnapshot,
}

/// Runs one flush: aggregate, write, then commit.
struct Flusher {
    source: Arc<dyn Source>,
    sink: Arc<dyn Sink>,
    coordinator: Arc<CommitCoordinator>,
    metrics: Arc<ProcessingMetrics>,
}

impl Flusher {
    async fn flush(&self, worker: usize, units: Vec<MessageUnit>) {
        let started = Instant::now();
        let batch_size = units.len();

        let (aggregate, decode_errors) = aggregate(&units);
        if decode_errors > 0 {
            self.metrics.record_errors(decode_errors);
            metrics::counter!(DECODE_ERRORS).increment(decode_errors);
        }

        match self.sink.apply_batch(&aggregate).await {
            Err(e) => {
                error!(
                    worker,
                    batch_size,
                    "failed to write batch to {}: {}",
                    self.sink.name(),
                    e
                );
                self.metrics.record_error();
                metrics::counter!(SINK_ERRORS).increment(1);
                self.coordinator.log_pinned(&units);
                self.reject(worker, &units).await;
            }
            Ok(()) => match self
                .coordinator
                .commit_batch(self.source.as_ref(), &units)
                .await
            {
                Ok(commits) if commits.is_empty() => {
                    debug!(worker, batch_size, "batch counted, commit deferred");
                }
                Ok(commits) => {
                    info!(
                        worker,
                        batch_size,
                        positions = %commits,
                        "processed and committed batch"
                    );
                    metrics::counter!(COMMITS).increment(1);
                }
                Err(e) => {
                    error!(
                        worker,
                        batch_size,
                        "batch counted but commit to {} failed: {}",
                        self.source.name(),
                        e
                    );
                    self.metrics.record_error();
                    metrics::counter!(COMMIT_ERRORS).increment(1);
                }
            },
        }

        metrics::counter!(BATCHES_FLUSHED).increment(1);
        metrics::histogram!(BATCH_SIZE).record(batch_size as f64);
        metrics::histogram!(FLUSH_DURATION).record(started.elapsed().as_secs_f64());
    }

    async fn reject(&self, worker: usize, units: &[MessageUnit]) {
        let positions: Vec<Position> = units.iter().map(|u| u.position().clone()).collect();
        if let Err(e) = self.source.reject(&positions).await {
            warn!(
                worker,
                "failed to hand {} positions back to {}: {}",
                positions.len(),
                self.source.name(),
                e
            );
            self.metrics.record_error();
            metrics::counter!(REJECT_ERRORS).increment(1);
        }
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    source: Arc<dyn Source>,
    sink: Arc<dyn Sink>,
    coordinator: Arc<CommitCoordinator>,
    metrics: Arc<ProcessingMetrics>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        source: Arc<dyn Source>,
        sink: Arc<dyn Sink>,
        metrics: Arc<ProcessingMetrics>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        Ok(Self {
            config,
            source,
            sink,
            coordinator: Arc::new(CommitCoordinator::new()),
            metrics,
        })
    }

    /// Consumes until `shutdown` is cancelled or the source closes, then
    /// drains. Returns once every step of the shutdown sequence completed.
    pub async fn run(self, shutdown: CancellationToken) -> PipelineReport {
        let (sender, receiver) = mpsc::channel(self.config.queue_capacity());
        let queue: SharedQueue = Arc::new(Mutex::new(receiver));

        let flusher = Arc::new(Flusher {
            source: self.source.clone(),
            sink: self.sink.clone(),
            coordinator: self.coordinator.clone(),
            metrics: self.metrics.clone(),
        });

        let mut workers = JoinSet::new();
        for id in 0..self.config.worker_count {
            workers.spawn(run_worker(
                id,
                queue.clone(),
                flusher.clone(),
                self.config.batch_size,
                self.config.flush_interval.0,
            ));
        }
        drop(queue);

        info!(
            source = self.source.name(),
            sink = self.sink.name(),
            workers = self.config.worker_count,
            batch_size = self.config.batch_size,
            queue_capacity = self.config.queue_capacity(),
            "starting consumer loop"
        );

        // The sender is moved in and dropped on return, which closes the queue.
        let stopped_by = self.ingest(sender, &shutdown).await;
        info!(reason = ?stopped_by, "ingestion stopped, waiting for workers to drain");

        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                error!("worker task failed: {}", e);
            }
        }

        match self
            .coordinator
            .commit_outstanding(self.source.as_ref())
            .await
        {
            Ok(commits) if commits.is_empty() => debug!("nothing left to commit"),
            Ok(commits) => info!(positions = %commits, "final commit succeeded"),
            Err(e) => {
                warn!("final commit failed: {}", e);
                self.metrics.record_error();
                metrics::counter!(COMMIT_ERRORS).increment(1);
            }
        }

        if let Err(e) = self.source.close().await {
            warn!("failed to close {}: {}", self.source.name(), e);
        }
        if let Err(e) = self.sink.close().await {
            warn!("failed to close {}: {}", self.sink.name(), e);
        }

        let metrics = self.metrics.snapshot();
        info!(
            processed = metrics.processed,
            errors = metrics.errors,
            "shutdown complete"
        );

        PipelineReport {
            stopped_by,
            metrics,
        }
    }

    async fn ingest(
        &self,
        queue: mpsc::Sender<MessageUnit>,
        shutdown: &CancellationToken,
    ) -> StopReason {
        let poll_timeout = self.config.poll_timeout.0;

        loop {
            let fetched = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return StopReason::Shutdown,
                fetched = self.source.fetch(poll_timeout) => fetched,
            };

            let unit = match fetched {
                Ok(Fetched::Unit(unit)) => unit,
                Ok(Fetched::Timeout) => continue,
                Err(e) if e.is_fatal() => {
                    error!("{} consumer stopped: {}", self.source.name(), e);
                    return StopReason::SourceClosed;
                }
                Err(e) => {
                    warn!("{} consumer error: {}", self.source.name(), e);
                    self.metrics.record_error();
                    metrics::counter!(FETCH_ERRORS).increment(1);
                    continue;
                }
            };

            debug!(position = %unit.position(), "received message");
            metrics::counter!(MESSAGES_RECEIVED).increment(1);

            // Tracked before a worker can see it, so no commit can skip it.
            self.coordinator.track(&unit);

            // Counted as processed once a worker can see it. A unit handed back
            // on shutdown is redelivered and counted then.
            let unit = match queue.try_send(unit) {
                Ok(()) => {
                    self.metrics.record_processed();
                    continue;
                }
                Err(TrySendError::Closed(_)) => return StopReason::WorkersGone,
                Err(TrySendError::Full(unit)) => unit,
            };

            metrics::counter!(QUEUE_BLOCKED).increment(1);
            let position = unit.position().clone();
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    warn!(%position, "shutdown while the queue was full, message left for redelivery");
                    metrics::counter!(UNITS_DROPPED_ON_SHUTDOWN).increment(1);
                    if let Err(e) = self.source.reject(&[position]).await {
                        warn!("failed to hand message back to {}: {}", self.source.name(), e);
                    }
                    return StopReason::Shutdown;
                }
                sent = queue.send(unit) => {
                    if sent.is_err() {
                        return StopReason::WorkersGone;
                    }
                    self.metrics.record_processed();
                }
            }
        }
    }
}

async fn run_worker(
    id: usize,
    queue: SharedQueue,
    flusher: Arc<Flusher>,
    batch_size: usize,
    flush_interval: Duration,
) {
    let mut batch = Batch::with_capacity(batch_size);
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            unit = next_unit(&queue) => match unit {
                Some(unit) => {
                    if batch.push(unit) {
                        flusher.flush(id, batch.take()).await;
                    }
                }
                None => {
                    if !batch.is_empty() {
                        debug!(worker = id, batch_size = batch.len(), "flushing final batch");
                        flusher.flush(id, batch.take()).await;
                    }
                    debug!(worker = id, "queue closed, worker exiting");
                    return;
                }
            },
            _ = ticker.tick() => {
                if !batch.is_empty() {
                    flusher.flush(id, batch.take()).await;
                }
            }
        }
    }
}

async fn next_unit(queue: &Mutex<mpsc::Receiver<MessageUnit>>) -> Option<MessageUnit> {
    queue.lock().await.recv().await
}
