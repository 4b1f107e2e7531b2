//! In-memory stand-ins for a broker and a counter store.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::aggregate::CountAggregate;
use crate::commit::CommitSet;
use crate::error::{SinkError, SourceError};
use crate::message::{MessageUnit, PartitionKey, Position};
use crate::sinks::Sink;
use crate::source::{Fetched, Source};

enum Scripted {
    Unit(MessageUnit),
    Error(SourceError),
}

/// A broker fed from a script. Once the script runs out it either idles,
/// returning timeouts, or reports its stream as closed.
#[derive(Default)]
pub struct MemorySource {
    script: Mutex<VecDeque<Scripted>>,
    close_when_drained: AtomicBool,
    commits: Mutex<Vec<CommitSet>>,
    rejected: Mutex<Vec<Position>>,
    fail_commits: AtomicBool,
    unreachable: AtomicBool,
    closed: AtomicUsize,
}

impl MemorySource {
    pub fn new(units: impl IntoIterator<Item = MessageUnit>) -> Self {
        let source = Self::default();
        source.extend(units);
        source
    }

    pub fn extend(&self, units: impl IntoIterator<Item = MessageUnit>) {
        self.script
            .lock()
            .unwrap()
            .extend(units.into_iter().map(Scripted::Unit));
    }

    pub fn push_error(&self, error: SourceError) {
        self.script.lock().unwrap().push_back(Scripted::Error(error));
    }

    pub fn close_when_drained(&self, close: bool) {
        self.close_when_drained.store(close, Ordering::SeqCst);
    }

    pub fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().unwrap().len()
    }

    pub fn commits(&self) -> Vec<CommitSet> {
        self.commits.lock().unwrap().clone()
    }

    /// Every committed partition offset, in commit order.
    pub fn committed_offsets(&self) -> Vec<(PartitionKey, i64)> {
        self.commits()
            .iter()
            .flat_map(|commits| {
                commits
                    .offsets()
                    .iter()
                    .map(|(partition, offset)| (partition.clone(), *offset))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Every acknowledged delivery tag, sorted.
    pub fn acked_tags(&self) -> Vec<u64> {
        let mut tags: Vec<u64> = self
            .commits()
            .iter()
            .flat_map(|commits| commits.tags().values().flatten().copied().collect::<Vec<_>>())
            .collect();
        tags.sort_unstable();
        tags
    }

    pub fn rejected(&self) -> Vec<Position> {
        self.rejected.lock().unwrap().clone()
    }

    pub fn close_calls(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Source for MemorySource {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn fetch(&self, timeout: Duration) -> Result<Fetched, SourceError> {
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Scripted::Unit(unit)) => Ok(Fetched::Unit(unit)),
            Some(Scripted::Error(error)) => Err(error),
            None if self.close_when_drained.load(Ordering::SeqCst) => {
                Err(SourceError::Closed("script drained".to_owned()))
            }
            None => {
                tokio::time::sleep(timeout).await;
                Ok(Fetched::Timeout)
            }
        }
    }

    async fn commit(&self, commits: &CommitSet) -> Result<(), SourceError> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(SourceError::Commit("commit refused".into()));
        }
        self.commits.lock().unwrap().push(commits.clone());
        Ok(())
    }

    async fn reject(&self, positions: &[Position]) -> Result<(), SourceError> {
        self.rejected
            .lock()
            .unwrap()
            .extend(positions.iter().cloned());
        Ok(())
    }

    async fn ping(&self) -> Result<(), SourceError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(SourceError::Unreachable("broker is down".into()));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), SourceError> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A counter store kept in a `HashMap`.
#[derive(Default)]
pub struct MemorySink {
    counts: Mutex<HashMap<String, i64>>,
    total: Mutex<i64>,
    writes: AtomicUsize,
    fail_next: AtomicUsize,
    write_delay: Mutex<Option<Duration>>,
    unreachable: AtomicBool,
    closed: AtomicUsize,
}

impl MemorySink {
    /// Makes every write sleep for `delay` before it lands.
    pub fn set_write_delay(&self, delay: Duration) {
        *self.write_delay.lock().unwrap() = Some(delay);
    }

    /// Makes the next `count` writes fail without touching the counters.
    pub fn fail_next_writes(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn count(&self, country: &str) -> i64 {
        self.counts
            .lock()
            .unwrap()
            .get(country)
            .copied()
            .unwrap_or_default()
    }

    pub fn counts(&self) -> HashMap<String, i64> {
        self.counts.lock().unwrap().clone()
    }

    pub fn total(&self) -> i64 {
        *self.total.lock().unwrap()
    }

    /// Number of successful writes.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sink for MemorySink {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn apply_batch(&self, aggregate: &CountAggregate) -> Result<(), SinkError> {
        let delay = *self.write_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SinkError::Rejected("injected failure".to_owned()));
        }

        let mut counts = self.counts.lock().unwrap();
        for (country, increment) in aggregate.counts() {
            *counts.entry(country.clone()).or_default() += increment;
        }
        *self.total.lock().unwrap() += aggregate.total();
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn ping(&self) -> Result<(), SinkError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(SinkError::Rejected("store is down".to_owned()));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), SinkError> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
