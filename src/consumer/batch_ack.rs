//! Acknowledgment tracking for batched entries
//!
//! The broker only understands acks that address a whole entry. When an entry
//! carries a batch, per-message acks are collected in a bitset and the
//! broker-visible ack is emitted once every message of the batch has been
//! acknowledged. Cumulative acks additionally flush every entry with a lower
//! identifier.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use tracing::debug;

use crate::message::MessageId;
use crate::protocol::AckType;

/// Outstanding-ack bitset for one batched entry
#[derive(Debug)]
pub(crate) struct AckBitSet {
    words: Vec<u64>,
    len: usize,
}

impl AckBitSet {
    /// Bitset of `len` bits, all set
    pub(crate) fn new_all_set(len: usize) -> Self {
        let word_count = (len + 63) / 64;
        let mut words = vec![u64::MAX; word_count];
        let tail = len % 64;
        if tail != 0 {
            if let Some(last) = words.last_mut() {
                *last = (1u64 << tail) - 1;
            }
        }
        if len == 0 {
            words.clear();
        }
        Self { words, len }
    }

    pub(crate) fn clear(&mut self, index: usize) {
        if index < self.len {
            self.words[index / 64] &= !(1u64 << (index % 64));
        }
    }

    /// Clear bits `0..=index`
    pub(crate) fn clear_prefix(&mut self, index: usize) {
        let upto = index.min(self.len.saturating_sub(1));
        for i in 0..=upto / 64 {
            if (i + 1) * 64 <= upto + 1 {
                self.words[i] = 0;
            } else {
                let keep_from = (upto + 1) % 64;
                self.words[i] &= !((1u64 << keep_from) - 1);
            }
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Number of messages still unacknowledged
    pub(crate) fn outstanding(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }
}

/// What the caller must do after recording an ack against the tracker
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum BatchAckOutcome {
    /// The entry is fully acknowledged (or unknown to the tracker); emit a
    /// broker-visible ack addressing it. `acked_messages` is the number of
    /// batch messages completed by an individual ack, for stats.
    BrokerAckable { acked_messages: usize },
    /// The entry still has outstanding messages; nothing to send
    Deferred,
    /// The entry is still outstanding, but every entry at or below the
    /// returned identifier is covered; emit a cumulative ack there
    CumulativeAt(MessageId),
}

/// Per-batch bitset map keyed by the non-batch entry identifier.
///
/// The map must be ordered: cumulative acks need greatest-lower-key lookup
/// and range deletion. A short-lived lock over the whole map makes the
/// prune-then-report sequence atomic with respect to concurrent inserts from
/// the receive path.
#[derive(Debug, Default)]
pub(crate) struct BatchAckTracker {
    entries: Mutex<BTreeMap<MessageId, AckBitSet>>,
}

impl BatchAckTracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a freshly split batch entry with all bits outstanding
    pub(crate) fn add_entry(&self, entry: MessageId, batch_size: usize) {
        debug_assert!(!entry.is_batch());
        self.entries
            .lock()
            .insert(entry, AckBitSet::new_all_set(batch_size));
    }

    /// Drop an entry without acknowledging it (batch deserialization failed)
    pub(crate) fn remove_entry(&self, entry: &MessageId) {
        self.entries.lock().remove(entry);
    }

    /// Record an ack for one message of a batched entry
    pub(crate) fn ack(&self, message_id: MessageId, ack_type: AckType) -> BatchAckOutcome {
        let entry = message_id.entry();
        let batch_index = message_id.batch_index.unwrap_or(0) as usize;

        let mut entries = self.entries.lock();
        let (now_empty, batch_size) = match entries.get_mut(&entry) {
            None => {
                debug!("message {} not found in batch ack tracker", message_id);
                return BatchAckOutcome::BrokerAckable { acked_messages: 0 };
            }
            Some(bits) => {
                match ack_type {
                    AckType::Individual => bits.clear(batch_index),
                    AckType::Cumulative => bits.clear_prefix(batch_index),
                }
                (bits.is_empty(), bits.len())
            }
        };

        if now_empty {
            match ack_type {
                AckType::Individual => {
                    entries.remove(&entry);
                    BatchAckOutcome::BrokerAckable {
                        acked_messages: batch_size,
                    }
                }
                AckType::Cumulative => {
                    // this entry and everything below it is covered
                    entries.retain(|key, _| *key > entry);
                    BatchAckOutcome::BrokerAckable { acked_messages: 0 }
                }
            }
        } else if ack_type == AckType::Cumulative {
            // the current entry cannot be acked yet, but entries in prior
            // batches may be
            let lower = entries.range(..entry).next_back().map(|(key, _)| *key);
            match lower {
                Some(lower) => {
                    entries.retain(|key, _| *key > lower);
                    BatchAckOutcome::CumulativeAt(lower)
                }
                None => BatchAckOutcome::Deferred,
            }
        } else {
            BatchAckOutcome::Deferred
        }
    }

    /// Cumulative ack on a non-batch identifier covers every batch entry
    /// strictly below it.
    pub(crate) fn prune_below(&self, message_id: MessageId) {
        let entry = message_id.entry();
        let mut entries = self.entries.lock();
        if entries.is_empty() {
            return;
        }
        entries.retain(|key, _| *key >= entry);
    }

    /// Whether the enclosing entry of `message_id` is still tracked
    pub(crate) fn contains(&self, message_id: &MessageId) -> bool {
        self.entries.lock().contains_key(&message_id.entry())
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub(crate) fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Outstanding message count for one entry, if tracked
    #[cfg(test)]
    pub(crate) fn outstanding(&self, entry: &MessageId) -> Option<usize> {
        self.entries.lock().get(entry).map(|bits| bits.outstanding())
    }
}
