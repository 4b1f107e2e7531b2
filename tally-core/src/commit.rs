//! Commit bookkeeping shared by every worker.
//!
//! Workers flush batches independently and units of one partition can be
//! spread across several of them, so a worker cannot commit "its" highest
//! offset on its own: a later batch finishing first would acknowledge an
//! earlier batch that is still in flight, or that failed. The coordinator
//! sees every offset from the moment it is enqueued and only lets a
//! partition advance up to its lowest offset that has not been durably
//! counted yet. Commits are serialized so the broker never sees a
//! partition move backwards.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::error::SourceError;
use crate::message::{MessageUnit, PartitionKey, Position};
use crate::metrics_consts::COMMITS_DEFERRED;
use crate::source::Source;

/// Positions to acknowledge after a batch has been counted.
///
/// Offsets are stored as the next offset to consume (last offset + 1), which
/// is what Kafka expects. Tags are listed one by one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitSet {
    offsets: BTreeMap<PartitionKey, i64>,
    tags: BTreeMap<String, Vec<u64>>,
}

impl CommitSet {
    /// Highest offset + 1 per partition and every delivery tag of a batch.
    pub fn for_batch(units: &[MessageUnit]) -> Self {
        let mut commits = CommitSet::default();
        for unit in units {
            match unit.position() {
                Position::Offset { partition, offset } => {
                    let next = offset + 1;
                    commits
                        .offsets
                        .entry(partition.clone())
                        .and_modify(|current| *current = (*current).max(next))
                        .or_insert(next);
                }
                Position::Tag { queue, tag } => {
                    commits.tags.entry(queue.clone()).or_default().push(*tag);
                }
            }
        }
        for tags in commits.tags.values_mut() {
            tags.sort_unstable();
            tags.dedup();
        }
        commits
    }

    pub fn offsets(&self) -> &BTreeMap<PartitionKey, i64> {
        &self.offsets
    }

    pub fn tags(&self) -> &BTreeMap<String, Vec<u64>> {
        &self.tags
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty() && self.tags.is_empty()
    }

    /// Number of partition offsets plus number of tags.
    pub fn len(&self) -> usize {
        self.offsets.len() + self.tags.values().map(Vec::len).sum::<usize>()
    }
}

impl fmt::Display for CommitSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (partition, offset) in &self.offsets {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{partition}->{offset}")?;
            first = false;
        }
        for (queue, tags) in &self.tags {
            if !first {
                write!(f, ", ")?;
            }
            match (tags.first(), tags.last()) {
                (Some(low), Some(high)) if low != high => {
                    write!(f, "{queue}#{low}..={high} ({} tags)", tags.len())?
                }
                (Some(tag), _) => write!(f, "{queue}#{tag}")?,
                _ => write!(f, "{queue}#-")?,
            }
            first = false;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct PartitionState {
    /// Offsets handed to workers and not counted yet, including failed ones.
    pending: BTreeSet<i64>,
    /// Lowest offset ever tracked. Committing it would acknowledge nothing.
    floor: Option<i64>,
    /// Highest counted offset + 1.
    counted: Option<i64>,
    /// Last offset the broker accepted.
    committed: Option<i64>,
}

impl PartitionState {
    /// The furthest this partition can be committed without skipping
    /// anything that is still pending.
    fn watermark(&self) -> Option<i64> {
        let counted = self.counted?;
        Some(match self.pending.first() {
            Some(&low) => low.min(counted),
            None => counted,
        })
    }

    fn advances(&self, offset: i64) -> bool {
        match (self.committed, self.floor) {
            (Some(committed), _) => offset > committed,
            (None, Some(floor)) => offset > floor,
            (None, None) => true,
        }
    }
}

#[derive(Debug, Default)]
pub struct CommitCoordinator {
    partitions: Mutex<HashMap<PartitionKey, PartitionState>>,
    // Held across the broker call so commits reach the broker in the order
    // their watermarks were computed.
    gate: tokio::sync::Mutex<()>,
}

impl CommitCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a unit as in flight. Must be called before the unit is
    /// visible to any worker.
    pub fn track(&self, unit: &MessageUnit) {
        if let Position::Offset { partition, offset } = unit.position() {
            self.with_partitions(|partitions| {
                let state = partitions.entry(partition.clone()).or_default();
                state.pending.insert(*offset);
                state.floor = Some(state.floor.map_or(*offset, |floor| floor.min(*offset)));
            });
        }
    }

    /// Marks a batch as durably counted and returns what can be committed
    /// because of it. Offsets are clamped to the lowest pending offset of
    /// their partition, tags are passed through untouched.
    pub fn settle(&self, units: &[MessageUnit]) -> CommitSet {
        let batch = CommitSet::for_batch(units);

        let offsets = self.with_partitions(|partitions| {
            for unit in units {
                if let Position::Offset { partition, offset } = unit.position() {
                    if let Some(state) = partitions.get_mut(partition) {
                        state.pending.remove(offset);
                    }
                }
            }

            let mut offsets = BTreeMap::new();
            for (partition, next) in batch.offsets() {
                let state = partitions.entry(partition.clone()).or_default();
                state.counted = Some(state.counted.map_or(*next, |c| c.max(*next)));

                match state.watermark() {
                    Some(watermark) if state.advances(watermark) => {
                        offsets.insert(partition.clone(), watermark);
                    }
                    _ => {
                        debug!(
                            partition = %partition,
                            batch_offset = next,
                            lowest_pending = ?state.pending.first(),
                            "commit deferred until earlier offsets are counted"
                        );
                        metrics::counter!(COMMITS_DEFERRED).increment(1);
                    }
                }
            }
            offsets
        });

        CommitSet {
            offsets,
            tags: batch.tags,
        }
    }

    /// Logs where a batch whose write failed pins its partitions. Nothing is
    /// changed here: the batch is never settled, so its offsets stay pending
    /// and every later watermark of the partition stays below them.
    pub fn log_pinned(&self, units: &[MessageUnit]) {
        let pinned = CommitSet::for_batch(units);
        for (partition, _) in pinned.offsets() {
            let lowest = units
                .iter()
                .filter_map(|unit| match unit.position() {
                    Position::Offset { partition: p, offset } if p == partition => Some(*offset),
                    _ => None,
                })
                .min();
            warn!(
                partition = %partition,
                pinned_at = ?lowest,
                "partition commits pinned by a failed batch"
            );
        }
    }

    /// Everything counted but not yet accepted by the broker.
    pub fn outstanding(&self) -> CommitSet {
        let offsets = self.with_partitions(|partitions| {
            partitions
                .iter()
                .filter_map(|(partition, state)| {
                    state
                        .watermark()
                        .filter(|watermark| state.advances(*watermark))
                        .map(|watermark| (partition.clone(), watermark))
                })
                .collect()
        });

        CommitSet {
            offsets,
            tags: BTreeMap::new(),
        }
    }

    /// Settles a counted batch and commits the result. Returns the set that
    /// was sent to the broker, which is empty when nothing could advance.
    pub async fn commit_batch<S>(
        &self,
        source: &S,
        units: &[MessageUnit],
    ) -> Result<CommitSet, SourceError>
    where
        S: Source + ?Sized,
    {
        let _gate = self.gate.lock().await;
        let commits = self.settle(units);
        self.send(source, commits).await
    }

    /// Best-effort commit of whatever is still outstanding, used on shutdown.
    pub async fn commit_outstanding<S>(&self, source: &S) -> Result<CommitSet, SourceError>
    where
        S: Source + ?Sized,
    {
        let _gate = self.gate.lock().await;
        let commits = self.outstanding();
        self.send(source, commits).await
    }

    async fn send<S>(&self, source: &S, commits: CommitSet) -> Result<CommitSet, SourceError>
    where
        S: Source + ?Sized,
    {
        if commits.is_empty() {
            return Ok(commits);
        }

        source.commit(&commits).await?;

        self.with_partitions(|partitions| {
            for (partition, offset) in commits.offsets() {
                let state = partitions.entry(partition.clone()).or_default();
                if state.advances(*offset) {
                    state.committed = Some(*offset);
                }
            }
        });

        Ok(commits)
    }

    fn with_partitions<T>(&self, f: impl FnOnce(&mut HashMap<PartitionKey, PartitionState>) -> T) -> T {
        // Only plain bookkeeping runs under this lock, a poisoned map is still consistent.
        let mut partitions = self
            .partitions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut partitions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MemorySource;

    fn offsets(partition: i32, range: std::ops::Range<i64>) -> Vec<MessageUnit> {
        range
            .map(|offset| MessageUnit::offset("weather-tweets", partition, offset, vec![]))
            .collect()
    }

    fn key(partition: i32) -> PartitionKey {
        PartitionKey::new("weather-tweets", partition)
    }

    #[test]
    fn batch_commit_set_takes_highest_offset_per_partition() {
        let mut units = offsets(0, 10..13);
        units.extend(offsets(1, 3..5));
        units.push(MessageUnit::offset("weather-tweets", 0, 7, vec![]));

        let commits = CommitSet::for_batch(&units);

        assert_eq!(commits.offsets().get(&key(0)), Some(&13));
        assert_eq!(commits.offsets().get(&key(1)), Some(&5));
        assert!(commits.tags().is_empty());
        assert_eq!(commits.len(), 2);
    }

    #[test]
    fn batch_commit_set_lists_every_tag() {
        let units: Vec<_> = [4, 2, 9, 2]
            .into_iter()
            .map(|tag| MessageUnit::tagged("weather-tweets", tag, vec![]))
            .collect();

        let commits = CommitSet::for_batch(&units);

        assert_eq!(commits.tags().get("weather-tweets"), Some(&vec![2, 4, 9]));
        assert!(commits.offsets().is_empty());
        assert_eq!(commits.to_string(), "weather-tweets#2..=9 (3 tags)");
    }

    #[test]
    fn in_order_batches_commit_immediately() {
        let coordinator = CommitCoordinator::new();
        let first = offsets(0, 0..50);
        let second = offsets(0, 50..100);
        first.iter().chain(&second).for_each(|u| coordinator.track(u));

        assert_eq!(coordinator.settle(&first).offsets().get(&key(0)), Some(&50));
        assert_eq!(coordinator.settle(&second).offsets().get(&key(0)), Some(&100));
    }

    #[test]
    fn later_batch_waits_for_earlier_one() {
        let coordinator = CommitCoordinator::new();
        let first = offsets(0, 0..50);
        let second = offsets(0, 50..100);
        first.iter().chain(&second).for_each(|u| coordinator.track(u));

        // The second batch lands first: committing 100 would acknowledge 0..50 too.
        let commits = coordinator.settle(&second);
        assert!(commits.is_empty());

        let commits = coordinator.settle(&first);
        assert_eq!(commits.offsets().get(&key(0)), Some(&100));
    }

    #[test]
    fn failed_batch_pins_its_partition() {
        let coordinator = CommitCoordinator::new();
        let first = offsets(0, 0..50);
        let second = offsets(0, 50..100);
        let other = offsets(1, 0..10);
        first
            .iter()
            .chain(&second)
            .chain(&other)
            .for_each(|u| coordinator.track(u));

        coordinator.log_pinned(&first);
        let commits = coordinator.settle(&second);
        assert!(!commits.offsets().contains_key(&key(0)));

        // Other partitions are unaffected.
        let commits = coordinator.settle(&other);
        assert_eq!(commits.offsets().get(&key(1)), Some(&10));

        let outstanding = coordinator.outstanding();
        assert!(!outstanding.offsets().contains_key(&key(0)));
    }

    #[test]
    fn tags_pass_through() {
        let coordinator = CommitCoordinator::new();
        let units: Vec<_> = (1..=3)
            .map(|tag| MessageUnit::tagged("weather-tweets", tag, vec![]))
            .collect();
        units.iter().for_each(|u| coordinator.track(u));

        let commits = coordinator.settle(&units);
        assert_eq!(commits.tags().get("weather-tweets"), Some(&vec![1, 2, 3]));
        assert!(coordinator.outstanding().is_empty());
    }

    #[tokio::test]
    async fn commits_never_move_backwards() {
        let coordinator = CommitCoordinator::new();
        let source = MemorySource::default();
        let first = offsets(0, 0..50);
        let second = offsets(0, 50..100);
        first.iter().chain(&second).for_each(|u| coordinator.track(u));

        let sent = coordinator.commit_batch(&source, &first).await.unwrap();
        assert_eq!(sent.offsets().get(&key(0)), Some(&50));
        let sent = coordinator.commit_batch(&source, &second).await.unwrap();
        assert_eq!(sent.offsets().get(&key(0)), Some(&100));

        // Redelivery of an already committed range does not regress the broker.
        let replay = offsets(0, 0..50);
        replay.iter().for_each(|u| coordinator.track(u));
        let sent = coordinator.commit_batch(&source, &replay).await.unwrap();
        assert!(sent.is_empty());

        assert_eq!(source.committed_offsets(), vec![(key(0), 50), (key(0), 100)]);
        assert!(coordinator.outstanding().is_empty());
    }

    #[tokio::test]
    async fn failed_commit_is_retried_on_shutdown() {
        let coordinator = CommitCoordinator::new();
        let source = MemorySource::default();
        let batch = offsets(3, 0..5);
        batch.iter().for_each(|u| coordinator.track(u));

        source.fail_commits(true);
        assert!(coordinator.commit_batch(&source, &batch).await.is_err());
        assert_eq!(coordinator.outstanding().offsets().get(&key(3)), Some(&5));

        source.fail_commits(false);
        let sent = coordinator.commit_outstanding(&source).await.unwrap();
        assert_eq!(sent.offsets().get(&key(3)), Some(&5));
        assert!(coordinator.outstanding().is_empty());
    }
}
