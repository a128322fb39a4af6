//! Credit accounting for broker flow control
//!
//! The broker pushes at most as many messages as the client has granted via
//! `Flow` commands since the last subscribe. Crediting back in half-queue
//! chunks keeps the command rate at O(1) per `receiver_queue_size / 2`
//! processed messages while bounding broker run-ahead to one refill interval.

use std::sync::atomic::{AtomicU32, Ordering};

/// Tracks permits accumulated by processed messages and decides when to
/// refill the broker.
#[derive(Debug)]
pub(crate) struct PermitAccountant {
    available: AtomicU32,
    refill_threshold: u32,
}

impl PermitAccountant {
    pub(crate) fn new(receiver_queue_size: u32) -> Self {
        Self {
            available: AtomicU32::new(0),
            refill_threshold: receiver_queue_size / 2,
        }
    }

    /// Record one message handed to the application. Returns the number of
    /// permits to grant in a `Flow` command when the refill threshold is
    /// crossed.
    ///
    /// The swap to zero and the decision to emit are one linearization point:
    /// the thread whose compare-exchange wins owns exactly the swapped
    /// permits, so concurrent processors can never grant the same credit
    /// twice. Losing the exchange re-reads the counter rather than giving up,
    /// so a refill racing with more processed events is not lost.
    pub(crate) fn record_processed(&self) -> Option<u32> {
        let mut available = self.available.fetch_add(1, Ordering::SeqCst) + 1;
        while available >= self.refill_threshold {
            match self.available.compare_exchange(
                available,
                0,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Some(available),
                Err(current) => available = current,
            }
        }
        None
    }

    /// Record a corrupted message that was discarded client-side. The broker
    /// already spent that credit, so it counts like a processed message.
    pub(crate) fn record_discarded(&self) -> Option<u32> {
        self.record_processed()
    }

    /// Forget accumulated permits. Used when the subscription is re-created
    /// on a new connection and credits restart from the full queue size.
    pub(crate) fn reset(&self) {
        self.available.store(0, Ordering::SeqCst);
    }

    /// Currently accumulated, un-granted permits
    pub(crate) fn available(&self) -> u32 {
        self.available.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) fn refill_threshold(&self) -> u32 {
        self.refill_threshold
    }
}
