//! Metrics collection for the CascadeMQ client

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::info;

use crate::message::Message;

/// Process-wide client metrics aggregated across all consumers
#[derive(Debug, Default)]
pub struct ClientMetrics {
    pub records_consumed: AtomicU64,
    pub bytes_consumed: AtomicU64,
    pub consume_errors: AtomicU64,
    pub acks_sent: AtomicU64,
    pub ack_errors: AtomicU64,
    pub connections_created: AtomicU64,
    pub connection_errors: AtomicU64,
}

impl ClientMetrics {
    pub fn record_consume(&self, byte_count: u64) {
        self.records_consumed.fetch_add(1, Ordering::Relaxed);
        self.bytes_consumed.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn record_consume_error(&self) {
        self.consume_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_acks_sent(&self, count: u64) {
        self.acks_sent.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_ack_error(&self) {
        self.ack_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_created(&self) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_error(&self) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
    }
}

/// Global metrics instance
static GLOBAL_METRICS: once_cell::sync::Lazy<Arc<ClientMetrics>> =
    once_cell::sync::Lazy::new(|| Arc::new(ClientMetrics::default()));

/// Get the global metrics instance
pub fn global_metrics() -> Arc<ClientMetrics> {
    GLOBAL_METRICS.clone()
}

/// Per-consumer statistics, updated on the receive and ack paths
#[derive(Debug)]
pub struct ConsumerStats {
    enabled: bool,
    msgs_received: AtomicU64,
    bytes_received: AtomicU64,
    receive_failures: AtomicU64,
    acks_sent: AtomicU64,
    ack_failures: AtomicU64,
    reporter: Mutex<Option<JoinHandle<()>>>,
}

impl ConsumerStats {
    pub(crate) fn new(enabled: bool) -> Self {
        Self {
            enabled,
            msgs_received: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            receive_failures: AtomicU64::new(0),
            acks_sent: AtomicU64::new(0),
            ack_failures: AtomicU64::new(0),
            reporter: Mutex::new(None),
        }
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub(crate) fn update_num_msgs_received(&self, msg: &Message) {
        self.msgs_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received
            .fetch_add(msg.payload.len() as u64, Ordering::Relaxed);
        global_metrics().record_consume(msg.payload.len() as u64);
    }

    pub(crate) fn increment_num_receive_failed(&self) {
        self.receive_failures.fetch_add(1, Ordering::Relaxed);
        global_metrics().record_consume_error();
    }

    pub(crate) fn increment_num_acks_sent(&self, count: u64) {
        self.acks_sent.fetch_add(count, Ordering::Relaxed);
        global_metrics().record_acks_sent(count);
    }

    pub(crate) fn increment_num_acks_failed(&self) {
        self.ack_failures.fetch_add(1, Ordering::Relaxed);
        global_metrics().record_ack_error();
    }

    /// Get a snapshot of the current counters
    pub fn snapshot(&self) -> ConsumerStatsSnapshot {
        ConsumerStatsSnapshot {
            msgs_received: self.msgs_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            receive_failures: self.receive_failures.load(Ordering::Relaxed),
            acks_sent: self.acks_sent.load(Ordering::Relaxed),
            ack_failures: self.ack_failures.load(Ordering::Relaxed),
        }
    }

    /// Start the periodic stats reporter. No-op when stats are disabled.
    pub(crate) fn start_reporter(
        self: &Arc<Self>,
        interval: Duration,
        topic: String,
        subscription: String,
    ) {
        if !self.enabled || interval.is_zero() {
            return;
        }
        let stats = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // immediate first tick
            loop {
                ticker.tick().await;
                let snapshot = stats.snapshot();
                info!(
                    "[{}][{}] Consumer stats: received {} msgs / {} bytes, {} receive failures, {} acks sent, {} ack failures",
                    topic,
                    subscription,
                    snapshot.msgs_received,
                    snapshot.bytes_received,
                    snapshot.receive_failures,
                    snapshot.acks_sent,
                    snapshot.ack_failures,
                );
            }
        });
        *self.reporter.lock() = Some(handle);
    }

    /// Cancel the periodic reporter, if one is running
    pub(crate) fn cancel_reporter(&self) {
        if let Some(handle) = self.reporter.lock().take() {
            handle.abort();
        }
    }
}

/// Snapshot of consumer statistics at a point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerStatsSnapshot {
    pub msgs_received: u64,
    pub bytes_received: u64,
    pub receive_failures: u64,
    pub acks_sent: u64,
    pub ack_failures: u64,
}
