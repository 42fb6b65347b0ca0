//! Offset tracking and commit bookkeeping.
//!
//! The tracker keeps, per partition, the highest *contiguous* processed
//! offset. An offset becomes committable only when every offset below it on
//! the same partition has been processed too; aborted sequences leave gaps,
//! which keeps their offsets (and everything after them) uncommitted until
//! the messages are reprocessed.
//!
//! Commits are two-phase: [`pending_commits`](OffsetTracker::pending_commits)
//! yields what would be committed, and [`confirm`](OffsetTracker::confirm)
//! records the broker's acknowledgement. A failed commit confirms nothing,
//! so the next attempt retries the same offsets.

use silverback_core::envelope::{MessageId, TopicPartition};
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug)]
struct PartitionState {
    /// Next offset expected to become processed (contiguity cursor).
    next: i64,
    /// Offsets processed ahead of the cursor.
    pending: BTreeSet<i64>,
    /// Highest offset confirmed committed, or `None` before the first
    /// commit.
    committed: Option<i64>,
}

impl PartitionState {
    fn committable(&self) -> Option<i64> {
        let highest = self.next - 1;
        match self.committed {
            Some(committed) if highest <= committed => None,
            _ if highest < 0 => None,
            _ => Some(highest),
        }
    }
}

/// Per-consumer offset tracker.
///
/// Reads are cheap; the map is behind a plain mutex that is never held
/// across await points.
#[derive(Debug, Default)]
pub struct OffsetTracker {
    partitions: Mutex<HashMap<TopicPartition, PartitionState>>,
    processed_since_commit: AtomicUsize,
}

impl OffsetTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the arrival of a raw envelope. Must be called in fetch order;
    /// the first observed offset of a partition seeds the contiguity
    /// cursor.
    pub fn observe(&self, id: &MessageId) {
        #[allow(clippy::unwrap_used)] // mutex poisoning is unrecoverable here
        let mut partitions = self.partitions.lock().unwrap();
        partitions
            .entry(id.topic_partition())
            .or_insert_with(|| PartitionState {
                next: id.offset,
                pending: BTreeSet::new(),
                committed: None,
            });
    }

    /// Mark one raw envelope as fully processed.
    pub fn mark_processed(&self, id: &MessageId) {
        #[allow(clippy::unwrap_used)]
        let mut partitions = self.partitions.lock().unwrap();
        let Some(state) = partitions.get_mut(&id.topic_partition()) else {
            return;
        };
        if id.offset < state.next {
            // Already covered by the cursor (duplicate mark).
            return;
        }
        state.pending.insert(id.offset);
        while state.pending.remove(&state.next) {
            state.next += 1;
        }
        self.processed_since_commit.fetch_add(1, Ordering::Relaxed);
    }

    /// `true` once at least `each` envelopes were processed since the last
    /// commit attempt.
    #[must_use]
    pub fn should_commit(&self, each: usize) -> bool {
        each > 0 && self.processed_since_commit.load(Ordering::Relaxed) >= each
    }

    /// The highest contiguous processed offset per partition that exceeds
    /// what is already committed.
    #[must_use]
    pub fn pending_commits(&self) -> Vec<MessageId> {
        #[allow(clippy::unwrap_used)]
        let partitions = self.partitions.lock().unwrap();
        partitions
            .iter()
            .filter_map(|(tp, state)| {
                state
                    .committable()
                    .map(|offset| MessageId::new(tp.topic.clone(), tp.partition, offset))
            })
            .collect()
    }

    /// Record a successful broker commit of the given offsets and reset the
    /// commit-cadence counter.
    pub fn confirm(&self, ids: &[MessageId]) {
        #[allow(clippy::unwrap_used)]
        let mut partitions = self.partitions.lock().unwrap();
        for id in ids {
            if let Some(state) = partitions.get_mut(&id.topic_partition()) {
                state.committed = Some(state.committed.map_or(id.offset, |c| c.max(id.offset)));
            }
        }
        self.processed_since_commit.store(0, Ordering::Relaxed);
    }

    /// Forget a partition (rebalance revocation). Uncommitted progress is
    /// discarded; processing resumes from the last committed offset after
    /// reassignment.
    pub fn drop_partition(&self, partition: &TopicPartition) {
        #[allow(clippy::unwrap_used)]
        let mut partitions = self.partitions.lock().unwrap();
        partitions.remove(partition);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(offset: i64) -> MessageId {
        MessageId::new("t", 0, offset)
    }

    #[test]
    fn contiguous_marks_advance_the_committable_offset() {
        let tracker = OffsetTracker::new();
        tracker.observe(&id(0));
        tracker.mark_processed(&id(0));
        tracker.mark_processed(&id(1));

        let pending = tracker.pending_commits();
        assert_eq!(pending, vec![id(1)]);
    }

    #[test]
    fn gaps_stall_commits_until_filled() {
        let tracker = OffsetTracker::new();
        tracker.observe(&id(0));
        tracker.mark_processed(&id(0));
        // Offset 1 aborted (never marked); 2 and 3 processed.
        tracker.mark_processed(&id(2));
        tracker.mark_processed(&id(3));

        assert_eq!(tracker.pending_commits(), vec![id(0)]);

        tracker.mark_processed(&id(1));
        assert_eq!(tracker.pending_commits(), vec![id(3)]);
    }

    #[test]
    fn confirm_suppresses_already_committed_offsets() {
        let tracker = OffsetTracker::new();
        tracker.observe(&id(0));
        tracker.mark_processed(&id(0));
        tracker.confirm(&tracker.pending_commits());
        assert!(tracker.pending_commits().is_empty());

        tracker.mark_processed(&id(1));
        assert_eq!(tracker.pending_commits(), vec![id(1)]);
    }

    #[test]
    fn cursor_starts_at_first_observed_offset() {
        let tracker = OffsetTracker::new();
        // Resuming mid-partition (e.g. after seek to stored + 1).
        tracker.observe(&id(40));
        tracker.mark_processed(&id(40));
        assert_eq!(tracker.pending_commits(), vec![id(40)]);
    }

    #[test]
    fn commit_cadence_counts_processed_envelopes() {
        let tracker = OffsetTracker::new();
        tracker.observe(&id(0));
        assert!(!tracker.should_commit(2));
        tracker.mark_processed(&id(0));
        assert!(!tracker.should_commit(2));
        tracker.mark_processed(&id(1));
        assert!(tracker.should_commit(2));
        tracker.confirm(&tracker.pending_commits());
        assert!(!tracker.should_commit(2));
    }

    #[test]
    fn dropped_partition_is_forgotten() {
        let tracker = OffsetTracker::new();
        tracker.observe(&id(0));
        tracker.mark_processed(&id(0));
        tracker.drop_partition(&TopicPartition::new("t", 0));
        assert!(tracker.pending_commits().is_empty());
    }
}
