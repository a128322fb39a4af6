//! Timer-driven tracking of delivered-but-unacknowledged messages
//!
//! Identifiers move through two generations: new deliveries land in the
//! current set, a timer ticking at half the ack timeout demotes them to the
//! older set, and anything still present at the following tick has been
//! unacknowledged for at least half and at most one full ack-timeout
//! interval and triggers redelivery.

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::warn;

use super::ConsumerCore;
use crate::message::MessageId;

#[derive(Debug, Default)]
struct Generations {
    current: BTreeSet<MessageId>,
    older: BTreeSet<MessageId>,
}

/// Remembers delivered-but-unacked entry identifiers for redelivery on
/// timeout
#[derive(Debug, Default)]
pub(crate) struct UnackedMessageTracker {
    generations: Mutex<Generations>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl UnackedMessageTracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Start the redelivery timer
    pub(crate) fn start(
        self: &Arc<Self>,
        ack_timeout: Duration,
        consumer: Weak<ConsumerCore>,
    ) {
        let tracker = Arc::clone(self);
        let tick = (ack_timeout / 2).max(Duration::from_millis(1));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // immediate first tick
            loop {
                ticker.tick().await;
                let expired = {
                    let mut generations = tracker.generations.lock();
                    let expired = std::mem::take(&mut generations.older);
                    generations.older = std::mem::take(&mut generations.current);
                    expired
                };
                if expired.is_empty() {
                    continue;
                }
                let Some(consumer) = consumer.upgrade() else {
                    break;
                };
                warn!(
                    "{} messages unacknowledged past the ack timeout, requesting redelivery",
                    expired.len()
                );
                consumer.redeliver_unacknowledged_messages();
            }
        });
        *self.task.lock() = Some(handle);
    }

    pub(crate) fn add(&self, id: MessageId) {
        let mut generations = self.generations.lock();
        generations.older.remove(&id);
        generations.current.insert(id);
    }

    pub(crate) fn remove(&self, id: &MessageId) -> bool {
        let mut generations = self.generations.lock();
        let in_current = generations.current.remove(id);
        generations.older.remove(id) || in_current
    }

    /// Remove every identifier at or below `id`, returning how many were
    /// dropped
    pub(crate) fn remove_messages_till(&self, id: MessageId) -> u32 {
        let mut generations = self.generations.lock();
        drain_till(&mut generations.current, &id) + drain_till(&mut generations.older, &id)
    }

    pub(crate) fn clear(&self) {
        let mut generations = self.generations.lock();
        generations.current.clear();
        generations.older.clear();
    }

    /// Stop the timer and forget all tracked identifiers
    pub(crate) fn close(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
        self.clear();
    }

    pub(crate) fn is_empty(&self) -> bool {
        let generations = self.generations.lock();
        generations.current.is_empty() && generations.older.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        let generations = self.generations.lock();
        generations.current.len() + generations.older.len()
    }
}

fn drain_till(set: &mut BTreeSet<MessageId>, id: &MessageId) -> u32 {
    let mut kept = set.split_off(id); // holds everything >= id
    let mut removed = set.len() as u32;
    if kept.remove(id) {
        removed += 1;
    }
    *set = kept;
    removed
}
