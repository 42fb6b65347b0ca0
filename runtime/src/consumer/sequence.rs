//! Chunk sequence reassembly.
//!
//! A chunk sequence collects the fragments of one chunked message, keyed by
//! `x-message-id` (or by `x-first-chunk-offset` when the id is absent), and
//! completes when the terminal fragment arrives: `x-last-chunk` set, or
//! the stored count reaching `x-chunks-count`. Within a partition at most
//! one sequence is active at a time: a fragment of a different sequence (or
//! any non-chunked message) interrupts and aborts the incomplete one.
//!
//! Dropped fragments:
//!
//! - **duplicates** (already-stored index) are dropped silently and their
//!   offsets advance;
//! - **orphans** (index > 0 with no active sequence to join) are dropped and
//!   their offsets advance; a lost first chunk must not wedge the
//!   partition;
//! - **protocol violations** (inconsistent index/count/last-chunk headers)
//!   abort the sequence, and nothing from it is committed.

use silverback_core::envelope::{InboundEnvelope, MessageId};
use silverback_core::error::{ConsumeError, SequenceAbortReason};
use silverback_core::headers::names;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

/// A sequence abort to report through the callbacks.
#[derive(Debug)]
pub struct AbortedSequence {
    /// The sequence key.
    pub key: String,
    /// Why it was aborted.
    pub reason: SequenceAbortReason,
    /// How many fragments had been collected.
    pub collected: usize,
}

/// A completed chunk group.
#[derive(Debug)]
pub struct CompletedSequence {
    /// The sequence key.
    pub key: String,
    /// The composing raw envelopes, in index order.
    pub raws: Vec<InboundEnvelope>,
    /// The reassembled payload (fragments concatenated in index order).
    pub payload: Vec<u8>,
}

/// Outcome of pushing one raw envelope into the store.
#[derive(Debug)]
pub enum PushOutcome {
    /// Not a chunk fragment; process it as-is.
    Passthrough(InboundEnvelope),
    /// Fragment stored; the sequence is still incomplete.
    Buffered,
    /// The sequence completed with this fragment.
    Completed(CompletedSequence),
    /// Duplicate fragment dropped; its offset advances.
    DroppedDuplicate(MessageId),
    /// Orphan fragment (no sequence to join) dropped; its offset advances.
    DroppedMissingFirst(MessageId),
    /// Inconsistent chunk headers; the active sequence was aborted and the
    /// offending fragment is not committed.
    ProtocolViolation(AbortedSequence),
}

#[derive(Debug)]
struct ChunkSequence {
    key: String,
    total: Option<u32>,
    chunks: BTreeMap<u32, InboundEnvelope>,
    deadline: Instant,
}

/// Reassembly state for one channel.
///
/// Owned and mutated exclusively by the channel's reader task.
#[derive(Debug, Default)]
pub struct SequenceStore {
    active: Option<ChunkSequence>,
}

impl SequenceStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The deadline of the active sequence, if one is pending.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.active.as_ref().map(|s| s.deadline)
    }

    /// The partition the active sequence is collecting from, if any.
    #[must_use]
    pub fn partition(&self) -> Option<silverback_core::envelope::TopicPartition> {
        self.active
            .as_ref()
            .and_then(|s| s.chunks.values().next())
            .map(|raw| raw.id.topic_partition())
    }

    /// Abort the active sequence, if any.
    pub fn abort_active(&mut self, reason: SequenceAbortReason) -> Option<AbortedSequence> {
        self.active.take().map(|sequence| AbortedSequence {
            key: sequence.key,
            reason,
            collected: sequence.chunks.len(),
        })
    }

    /// Abort the active sequence when its deadline has passed.
    pub fn check_timeout(&mut self, now: Instant) -> Option<AbortedSequence> {
        if self.active.as_ref().is_some_and(|s| now >= s.deadline) {
            self.abort_active(SequenceAbortReason::Timeout)
        } else {
            None
        }
    }

    /// Push one raw envelope.
    ///
    /// Returns the interruption abort of a previous sequence (when this
    /// envelope started a new one) alongside the outcome for the envelope
    /// itself.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumeError::Header`] when a chunk header is present but
    /// malformed.
    pub fn push(
        &mut self,
        envelope: InboundEnvelope,
        timeout: Duration,
    ) -> Result<(Option<AbortedSequence>, PushOutcome), ConsumeError> {
        if !envelope.headers.contains(names::CHUNK_INDEX) {
            // Any non-chunk message interrupts an incomplete sequence.
            let aborted = self.abort_active(SequenceAbortReason::Interrupted);
            return Ok((aborted, PushOutcome::Passthrough(envelope)));
        }

        let index = envelope
            .headers
            .get_u32(names::CHUNK_INDEX)?
            .unwrap_or_default();
        let count = envelope.headers.get_u32(names::CHUNKS_COUNT)?;
        let last = envelope.headers.get_flag(names::LAST_CHUNK);
        let key = Self::sequence_key(&envelope, index);

        let Some(key) = key else {
            // Index > 0 with neither a message id nor a first-chunk offset:
            // nothing to join it to.
            return Ok((None, PushOutcome::DroppedMissingFirst(envelope.id)));
        };

        // A fragment of a different group interrupts the active sequence.
        let mismatch = self.active.as_ref().is_some_and(|active| active.key != key);
        let interrupted = if mismatch {
            self.abort_active(SequenceAbortReason::Interrupted)
        } else {
            None
        };

        let outcome = match &mut self.active {
            Some(active) => {
                debug_assert_eq!(active.key, key);
                Self::push_fragment(active, envelope, index, count, last, timeout)
            }
            None if index == 0 => {
                let mut sequence = ChunkSequence {
                    key,
                    total: None,
                    chunks: BTreeMap::new(),
                    deadline: Instant::now() + timeout,
                };
                let outcome =
                    Self::push_fragment(&mut sequence, envelope, index, count, last, timeout);
                if matches!(outcome, PushOutcome::Buffered) {
                    self.active = Some(sequence);
                }
                outcome
            }
            // No sequence was started for this key: the first chunk is gone
            // (or already timed out). Drop and advance.
            None => PushOutcome::DroppedMissingFirst(envelope.id),
        };

        if matches!(
            outcome,
            PushOutcome::Completed(_) | PushOutcome::ProtocolViolation(_)
        ) {
            self.active = None;
        }
        Ok((interrupted, outcome))
    }

    fn sequence_key(envelope: &InboundEnvelope, index: u32) -> Option<String> {
        if let Some(id) = envelope.headers.get(names::MESSAGE_ID) {
            return Some(id.to_string());
        }
        if let Some(first_offset) = envelope.headers.get(names::FIRST_CHUNK_OFFSET) {
            return Some(format!("@{}", first_offset.trim()));
        }
        (index == 0).then(|| format!("@{}", envelope.id.offset))
    }

    fn push_fragment(
        sequence: &mut ChunkSequence,
        envelope: InboundEnvelope,
        index: u32,
        count: Option<u32>,
        last: bool,
        timeout: Duration,
    ) -> PushOutcome {
        if sequence.chunks.contains_key(&index) {
            return PushOutcome::DroppedDuplicate(envelope.id);
        }

        // Header consistency: a declared count must agree with an earlier
        // declaration, bound the indexes, and place the last-chunk flag on
        // the terminal index.
        let total = sequence.total.or(count);
        let violation = match (total, count) {
            (Some(a), Some(b)) if a != b => true,
            (Some(total), _) if index >= total => true,
            (Some(total), _) if last && index != total - 1 => true,
            _ => false,
        };
        if violation {
            let mut collected = sequence.chunks.len();
            collected += 1; // the offending fragment itself
            return PushOutcome::ProtocolViolation(AbortedSequence {
                key: sequence.key.clone(),
                reason: SequenceAbortReason::ProtocolViolation,
                collected,
            });
        }
        sequence.total = total;
        sequence.chunks.insert(index, envelope);
        sequence.deadline = Instant::now() + timeout;

        #[allow(clippy::cast_possible_truncation)]
        let stored = sequence.chunks.len() as u32;
        let complete_by_count = sequence.total.is_some_and(|t| stored == t);
        let complete = last || complete_by_count;
        if !complete {
            return PushOutcome::Buffered;
        }

        // Per-partition ordering means the stored indexes must be the full
        // contiguous prefix; anything else is a protocol violation.
        if last && stored != index + 1 {
            return PushOutcome::ProtocolViolation(AbortedSequence {
                key: sequence.key.clone(),
                reason: SequenceAbortReason::ProtocolViolation,
                collected: sequence.chunks.len(),
            });
        }

        let raws: Vec<InboundEnvelope> =
            std::mem::take(&mut sequence.chunks).into_values().collect();
        let payload = raws
            .iter()
            .flat_map(|raw| raw.payload.as_deref().unwrap_or_default())
            .copied()
            .collect();
        PushOutcome::Completed(CompletedSequence {
            key: sequence.key.clone(),
            raws,
            payload,
        })
    }
}
