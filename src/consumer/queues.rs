//! Delivery queue and pending async receives
//!
//! Both queues live under one mutex so that the two racing decisions — "is an
//! async waiter parked?" on the enqueue side and "is a message available?" on
//! the receive side — are each a single atomic transition. Splitting either
//! decision would let an enqueue miss a freshly parked waiter or vice versa.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{oneshot, Notify};

use crate::error::CascadeClientError;
use crate::message::Message;

/// Completion handle for an outstanding async receive
pub(crate) type ReceiveWaiter = oneshot::Sender<Result<Message, CascadeClientError>>;

/// Where an inbound message ended up
#[derive(Debug)]
pub(crate) enum EnqueueOutcome {
    /// A parked async receive takes the message, bypassing the queue
    Waiter(ReceiveWaiter, Message),
    /// Pushed onto the incoming queue
    Queued,
    /// Zero-queue mode with nobody waiting; the message is discarded
    Dropped,
}

/// Result of the atomic poll-or-park decision of an async receive
pub(crate) enum TakeOrRegister {
    Message(Box<Message>),
    Registered(oneshot::Receiver<Result<Message, CascadeClientError>>),
}

#[derive(Debug, Default)]
struct Inner {
    incoming: VecDeque<Message>,
    pending: VecDeque<ReceiveWaiter>,
}

/// The incoming-message queue plus the queue of parked async receives
#[derive(Debug, Default)]
pub(crate) struct DeliveryQueues {
    inner: Mutex<Inner>,
    notify: Notify,
    closed: AtomicBool,
}

impl DeliveryQueues {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Route an inbound message: hand it to a parked waiter if one exists,
    /// else push it onto the incoming queue when `allow_queue` permits.
    pub(crate) fn enqueue(&self, message: Message, allow_queue: bool) -> EnqueueOutcome {
        let mut inner = self.inner.lock();
        if let Some(waiter) = inner.pending.pop_front() {
            return EnqueueOutcome::Waiter(waiter, message);
        }
        if allow_queue {
            inner.incoming.push_back(message);
            drop(inner);
            self.notify.notify_one();
            return EnqueueOutcome::Queued;
        }
        EnqueueOutcome::Dropped
    }

    /// Non-blocking poll of the incoming queue
    pub(crate) fn try_take(&self) -> Option<Message> {
        self.inner.lock().incoming.pop_front()
    }

    /// Take the next message, waiting until one arrives. Returns `None` once
    /// the queues have been closed.
    pub(crate) async fn take(&self) -> Option<Message> {
        loop {
            if let Some(message) = self.try_take() {
                return Some(message);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    /// Atomically poll the queue or park a waiter for the next message
    pub(crate) fn take_or_register(&self) -> TakeOrRegister {
        let mut inner = self.inner.lock();
        if let Some(message) = inner.incoming.pop_front() {
            return TakeOrRegister::Message(Box::new(message));
        }
        let (tx, rx) = oneshot::channel();
        inner.pending.push_back(tx);
        TakeOrRegister::Registered(rx)
    }

    /// Fail every parked async receive
    pub(crate) fn fail_pending(
        &self,
        mut make_error: impl FnMut() -> CascadeClientError,
    ) -> usize {
        let waiters: Vec<ReceiveWaiter> = {
            let mut inner = self.inner.lock();
            inner.pending.drain(..).collect()
        };
        let count = waiters.len();
        for waiter in waiters {
            let _ = waiter.send(Err(make_error()));
        }
        count
    }

    /// Drop every queued message, returning how many were discarded
    pub(crate) fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let count = inner.incoming.len();
        inner.incoming.clear();
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().incoming.len()
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Mark the queues closed and wake any blocked taker
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }
}
