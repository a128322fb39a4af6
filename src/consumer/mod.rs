//! Consumer client for receiving messages from CascadeMQ

mod batch_ack;
mod flow;
mod queues;
mod unacked;

#[cfg(test)]
mod tests;

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::client::ClientInner;
use crate::compression::CompressionProvider;
use crate::config::ConsumerConfig;
use crate::connection::{Connection, ConsumerEvent};
use crate::error::CascadeClientError;
use crate::message::{Message, MessageId};
use crate::metrics::{ConsumerStats, ConsumerStatsSnapshot};
use crate::protocol::{
    AckType, ClientCommand, MessageMetadata, SingleMessageMetadata, ValidationError,
    MAX_MESSAGE_SIZE, MIN_REDELIVER_PROTOCOL_VERSION,
};

use batch_ack::{BatchAckOutcome, BatchAckTracker};
use flow::PermitAccountant;
use queues::{DeliveryQueues, EnqueueOutcome, TakeOrRegister};
use unacked::UnackedMessageTracker;

/// Consumer lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConsumerState {
    Uninitialized = 0,
    Connecting = 1,
    Ready = 2,
    Closing = 3,
    Closed = 4,
    Failed = 5,
}

impl ConsumerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConsumerState::Uninitialized,
            1 => ConsumerState::Connecting,
            2 => ConsumerState::Ready,
            3 => ConsumerState::Closing,
            4 => ConsumerState::Closed,
            _ => ConsumerState::Failed,
        }
    }
}

#[derive(Debug)]
struct StateCell(AtomicU8);

impl StateCell {
    fn new() -> Self {
        Self(AtomicU8::new(ConsumerState::Uninitialized as u8))
    }

    fn get(&self) -> ConsumerState {
        ConsumerState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, state: ConsumerState) {
        self.0.store(state as u8, Ordering::Release);
    }

    fn compare_and_set(&self, from: ConsumerState, to: ConsumerState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Whether a connection attempt settled the consumer or should be retried
enum ConnectOutcome {
    Terminal,
    Retry,
}

/// High-level consumer handle for receiving and acknowledging messages
#[derive(Debug, Clone)]
pub struct Consumer {
    core: Arc<ConsumerCore>,
}

impl Consumer {
    pub(crate) fn from_core(core: Arc<ConsumerCore>) -> Self {
        Self { core }
    }

    /// Receive the next message, waiting until one is available
    pub async fn receive(&self) -> Result<Message, CascadeClientError> {
        self.core.ensure_receive_allowed()?;
        self.core.internal_receive().await
    }

    /// Receive the next message or return `None` once `timeout` elapses
    pub async fn receive_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Option<Message>, CascadeClientError> {
        self.core.ensure_receive_allowed()?;
        self.core.internal_receive_timeout(timeout).await
    }

    /// Receive the next message without blocking the caller until delivery;
    /// the returned future resolves when a message arrives
    pub async fn receive_async(&self) -> Result<Message, CascadeClientError> {
        self.core.ensure_receive_allowed()?;
        self.core.internal_receive_async().await
    }

    /// Acknowledge a single message
    pub async fn acknowledge(&self, message: &Message) -> Result<(), CascadeClientError> {
        self.core.acknowledge(message.id, AckType::Individual).await
    }

    /// Acknowledge this message and every message with a lower identifier
    pub async fn acknowledge_cumulative(
        &self,
        message: &Message,
    ) -> Result<(), CascadeClientError> {
        self.core.acknowledge(message.id, AckType::Cumulative).await
    }

    /// Acknowledge by identifier
    pub async fn acknowledge_id(
        &self,
        message_id: MessageId,
        ack_type: AckType,
    ) -> Result<(), CascadeClientError> {
        self.core.acknowledge(message_id, ack_type).await
    }

    /// Drop the subscription on the broker and close this consumer
    pub async fn unsubscribe(&self) -> Result<(), CascadeClientError> {
        self.core.unsubscribe().await
    }

    /// Close this consumer
    pub async fn close(&self) -> Result<(), CascadeClientError> {
        self.core.close().await
    }

    /// Ask the broker to redeliver everything delivered but not yet
    /// acknowledged
    pub fn redeliver_unacknowledged_messages(&self) {
        self.core.redeliver_unacknowledged_messages();
    }

    /// Consumer statistics, or `None` when stats are disabled
    pub fn stats(&self) -> Option<ConsumerStatsSnapshot> {
        self.core.stats_snapshot()
    }

    pub fn topic(&self) -> &str {
        &self.core.topic
    }

    pub fn subscription(&self) -> &str {
        &self.core.subscription
    }

    pub fn consumer_name(&self) -> &str {
        &self.core.consumer_name
    }

    pub fn is_connected(&self) -> bool {
        self.core.is_connected()
    }

    /// Permits accumulated but not yet granted back to the broker
    pub fn available_permits(&self) -> u32 {
        self.core.permits.available()
    }

    /// Messages buffered and ready for the application
    pub fn num_messages_in_queue(&self) -> usize {
        self.core.queues.len()
    }

    /// Whether every split batch has been fully acknowledged
    pub fn is_batch_ack_tracker_empty(&self) -> bool {
        self.core.batch_ack_tracker.is_empty()
    }
}

#[derive(Debug)]
pub(crate) struct ConsumerCore {
    client: Arc<ClientInner>,
    topic: String,
    subscription: String,
    consumer_name: String,
    config: ConsumerConfig,
    consumer_id: u64,
    partition_index: i32,
    subscribe_deadline: Instant,
    state: StateCell,
    cnx: RwLock<Option<Arc<Connection>>>,
    permits: PermitAccountant,
    batch_ack_tracker: BatchAckTracker,
    unacked: Option<Arc<UnackedMessageTracker>>,
    queues: DeliveryQueues,
    stats: Arc<ConsumerStats>,
    codec_provider: CompressionProvider,
    waiting_on_zero_queue: AtomicBool,
    // serializes the connection-identity check of the zero-queue receive with
    // the ready transition of connection_opened
    monitor: Mutex<()>,
    subscribe_tx: Mutex<Option<oneshot::Sender<Result<(), CascadeClientError>>>>,
    subscribe_rx: Mutex<Option<oneshot::Receiver<Result<(), CascadeClientError>>>>,
}

impl ConsumerCore {
    pub(crate) fn new(
        client: Arc<ClientInner>,
        topic: String,
        subscription: String,
        config: ConsumerConfig,
        partition_index: i32,
    ) -> Arc<Self> {
        let consumer_id = client.new_consumer_id();
        let consumer_name = config
            .consumer_name
            .clone()
            .unwrap_or_else(|| format!("consumer-{}", consumer_id));
        let subscribe_deadline = Instant::now() + client.config.operation_timeout;
        let stats_enabled = !client.config.stats_interval.is_zero();
        let unacked = if config.ack_timeout.is_zero() {
            None
        } else {
            Some(Arc::new(UnackedMessageTracker::new()))
        };
        let (subscribe_tx, subscribe_rx) = oneshot::channel();

        let core = Arc::new(Self {
            permits: PermitAccountant::new(config.receiver_queue_size),
            batch_ack_tracker: BatchAckTracker::new(),
            queues: DeliveryQueues::new(),
            stats: Arc::new(ConsumerStats::new(stats_enabled)),
            codec_provider: CompressionProvider::new(),
            state: StateCell::new(),
            cnx: RwLock::new(None),
            waiting_on_zero_queue: AtomicBool::new(false),
            monitor: Mutex::new(()),
            subscribe_tx: Mutex::new(Some(subscribe_tx)),
            subscribe_rx: Mutex::new(Some(subscribe_rx)),
            consumer_id,
            consumer_name,
            subscribe_deadline,
            partition_index,
            unacked,
            client,
            topic,
            subscription,
            config,
        });

        if let Some(tracker) = &core.unacked {
            tracker.start(core.config.ack_timeout, Arc::downgrade(&core));
        }
        core.stats.start_reporter(
            core.client.config.stats_interval,
            core.topic.clone(),
            core.subscription.clone(),
        );
        core
    }

    pub(crate) fn consumer_id(&self) -> u64 {
        self.consumer_id
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> ConsumerState {
        self.state.get()
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.cnx.read().is_some() && self.state.get() == ConsumerState::Ready
    }

    fn connection(&self) -> Option<Arc<Connection>> {
        self.cnx.read().clone()
    }

    fn stats_snapshot(&self) -> Option<ConsumerStatsSnapshot> {
        if self.stats.is_enabled() {
            Some(self.stats.snapshot())
        } else {
            None
        }
    }

    // ---- connection lifecycle -------------------------------------------

    /// Request a connection from the client and start the subscribe attempt
    pub(crate) fn grab_connection(self: &Arc<Self>) {
        self.state
            .compare_and_set(ConsumerState::Uninitialized, ConsumerState::Connecting);
        let core = Arc::clone(self);
        tokio::spawn(async move { core.run_connect_loop().await });
    }

    async fn run_connect_loop(self: Arc<Self>) {
        let mut backoff = crate::config::Backoff::new(self.client.config.retry_config.clone());
        loop {
            if self.state.get() != ConsumerState::Connecting {
                return;
            }
            match self.client.get_connection().await {
                Ok(cnx) => match self.connection_opened(cnx).await {
                    ConnectOutcome::Terminal => return,
                    ConnectOutcome::Retry => {}
                },
                Err(e) => {
                    if self.connection_failed(e) {
                        return;
                    }
                }
            }
            tokio::time::sleep(backoff.next_delay()).await;
        }
    }

    /// A connection attempt failed before a subscribe could even be sent.
    /// Returns true when the failure is terminal.
    fn connection_failed(&self, error: CascadeClientError) -> bool {
        warn!(
            "[{}][{}] Failed to get connection: {}",
            self.topic, self.subscription, error
        );
        if Instant::now() > self.subscribe_deadline && self.complete_subscribe(Err(error)) {
            self.state.set(ConsumerState::Failed);
            self.client.cleanup_consumer(self.consumer_id);
            return true;
        }
        false
    }

    async fn connection_opened(self: &Arc<Self>, cnx: Arc<Connection>) -> ConnectOutcome {
        *self.cnx.write() = Some(Arc::clone(&cnx));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        cnx.register_consumer(self.consumer_id, events_tx);

        info!(
            "[{}][{}] Subscribing to topic on cnx {}",
            self.topic,
            self.subscription,
            cnx.remote_addr()
        );

        let request_id = self.client.new_request_id();
        let subscribe = ClientCommand::Subscribe {
            topic: self.topic.clone(),
            subscription: self.subscription.clone(),
            consumer_id: self.consumer_id,
            request_id,
            sub_type: self.config.subscription_type,
            consumer_name: self.consumer_name.clone(),
        };

        match cnx.send_request_with_id(subscribe, request_id).await {
            Ok(()) => {
                {
                    let _monitor = self.monitor.lock();
                    self.queues.clear();
                    if let Some(tracker) = &self.unacked {
                        tracker.clear();
                    }
                    self.batch_ack_tracker.clear();

                    if !self
                        .state
                        .compare_and_set(ConsumerState::Connecting, ConsumerState::Ready)
                    {
                        // Consumer was closed while reconnecting, close the
                        // connection to make sure the broker drops the
                        // consumer on its side
                        self.state.set(ConsumerState::Closed);
                        cnx.remove_consumer(self.consumer_id);
                        cnx.close_channel();
                        return ConnectOutcome::Terminal;
                    }

                    info!(
                        "[{}][{}] Subscribed to topic on {} -- consumer: {}",
                        self.topic,
                        self.subscription,
                        cnx.remote_addr(),
                        self.consumer_id
                    );
                    self.permits.reset();
                    // If the connection is reset and someone is waiting for
                    // the messages send a flow command
                    if self.waiting_on_zero_queue.load(Ordering::Acquire) {
                        self.send_flow(&cnx, 1);
                    }
                }

                self.spawn_dispatch(Arc::clone(&cnx), events_rx);

                let first_time_connect = self.complete_subscribe(Ok(()));
                // a partitioned consumer gets its initial credit from the
                // partition fan-out on the first connect only
                if !(first_time_connect && self.partition_index > -1)
                    && self.config.receiver_queue_size != 0
                {
                    self.send_flow(&cnx, self.config.receiver_queue_size);
                }
                ConnectOutcome::Terminal
            }
            Err(e) => {
                cnx.remove_consumer(self.consumer_id);
                if matches!(
                    self.state.get(),
                    ConsumerState::Closing | ConsumerState::Closed
                ) {
                    // Consumer was closed while reconnecting, close the
                    // connection to make sure the broker drops the consumer
                    // on its side
                    cnx.close_channel();
                    return ConnectOutcome::Terminal;
                }
                warn!(
                    "[{}][{}] Failed to subscribe to topic on {}: {}",
                    self.topic,
                    self.subscription,
                    cnx.remote_addr(),
                    e
                );
                if e.is_retryable() && Instant::now() < self.subscribe_deadline {
                    return ConnectOutcome::Retry;
                }
                if !self.subscribe_completed() {
                    // unable to create the consumer at all, fail the operation
                    self.state.set(ConsumerState::Failed);
                    self.complete_subscribe(Err(e));
                    self.client.cleanup_consumer(self.consumer_id);
                    ConnectOutcome::Terminal
                } else {
                    // consumer was subscribed and connected before, keep trying
                    ConnectOutcome::Retry
                }
            }
        }
    }

    fn spawn_dispatch(
        self: &Arc<Self>,
        cnx: Arc<Connection>,
        mut events: mpsc::UnboundedReceiver<ConsumerEvent>,
    ) {
        let core = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    ConsumerEvent::Message {
                        ledger_id,
                        entry_id,
                        headers_and_payload,
                    } => core.message_received(ledger_id, entry_id, headers_and_payload, &cnx),
                    ConsumerEvent::Disconnected => {
                        core.connection_lost(&cnx);
                        break;
                    }
                }
            }
        });
    }

    fn connection_lost(self: &Arc<Self>, cnx: &Connection) {
        let is_current = self.cnx.read().as_ref().map(|c| c.id()) == Some(cnx.id());
        if !is_current {
            return;
        }
        if self
            .state
            .compare_and_set(ConsumerState::Ready, ConsumerState::Connecting)
        {
            info!(
                "[{}][{}] Connection lost, reconnecting",
                self.topic, self.subscription
            );
            let core = Arc::clone(self);
            tokio::spawn(async move { core.run_connect_loop().await });
        }
    }

    fn complete_subscribe(&self, result: Result<(), CascadeClientError>) -> bool {
        if let Some(tx) = self.subscribe_tx.lock().take() {
            let _ = tx.send(result);
            true
        } else {
            false
        }
    }

    fn subscribe_completed(&self) -> bool {
        self.subscribe_tx.lock().is_none()
    }

    pub(crate) async fn await_subscribed(&self) -> Result<(), CascadeClientError> {
        let rx = self
            .subscribe_rx
            .lock()
            .take()
            .ok_or_else(|| CascadeClientError::invalid_config("Subscribe already awaited"))?;
        rx.await.map_err(|_| {
            CascadeClientError::connection("Consumer dropped before subscribe completed")
        })?
    }

    // ---- receive path ----------------------------------------------------

    /// Handle one inbound message frame: validate, decompress, verify the
    /// checksum and dispatch to the queue, a parked receive, or the listener.
    fn message_received(
        self: &Arc<Self>,
        ledger_id: u64,
        entry_id: u64,
        mut headers_and_payload: Bytes,
        cnx: &Arc<Connection>,
    ) {
        debug!(
            "[{}][{}] Received message: {}:{}",
            self.topic, self.subscription, ledger_id, entry_id
        );

        let msg_metadata = match MessageMetadata::parse(&mut headers_and_payload) {
            Ok(metadata) => metadata,
            Err(_) => {
                self.discard_corrupted_message(
                    ledger_id,
                    entry_id,
                    cnx,
                    ValidationError::ChecksumMismatch,
                );
                return;
            }
        };
        let payload = headers_and_payload;

        let Some(uncompressed) =
            self.uncompress_payload_if_needed(ledger_id, entry_id, &msg_metadata, &payload, cnx)
        else {
            return;
        };

        if !self.verify_checksum(ledger_id, entry_id, &msg_metadata, &uncompressed, cnx) {
            return;
        }

        let num_messages = msg_metadata.num_messages_in_batch.unwrap_or(1);

        if msg_metadata.num_messages_in_batch.is_none() {
            let message = Message {
                id: MessageId::new(ledger_id, entry_id, self.partition_index),
                payload: uncompressed,
                properties: msg_metadata.properties,
                partition_key: msg_metadata.partition_key,
                publish_time: msg_metadata.publish_time,
                cnx_id: cnx.id(),
            };
            self.enqueue_message(message);
        } else if self.config.receiver_queue_size == 0 {
            // the zero-queue rendezvous cannot absorb a batch; give up on the
            // subscription rather than buffer past the granted credit
            warn!(
                "Closing consumer [{}]-[{}] due to unsupported received batch-message with zero receiver queue size",
                self.subscription, self.consumer_name
            );
            self.queues.fail_pending(|| {
                CascadeClientError::invalid_message(format!(
                    "Unsupported batch message with 0 size receiver queue for [{}]-[{}]",
                    self.subscription, self.consumer_name
                ))
            });
            let core = Arc::clone(self);
            tokio::spawn(async move {
                let _ = core.close().await;
            });
            return;
        } else {
            self.receive_individual_messages_from_batch(
                &msg_metadata,
                uncompressed,
                ledger_id,
                entry_id,
                cnx,
            );
        }

        if let Some(listener) = &self.config.message_listener {
            // run the listener away from the connection dispatch task so that
            // slow message processing never stalls the socket
            let listener = Arc::clone(listener);
            let core = Arc::clone(self);
            tokio::spawn(async move {
                for _ in 0..num_messages {
                    match core.internal_receive().await {
                        Ok(message) => {
                            debug!(
                                "[{}][{}] Calling message listener for message {}",
                                core.topic, core.subscription, message.id
                            );
                            listener(message);
                        }
                        Err(e) => {
                            warn!(
                                "[{}][{}] Failed to dequeue the message for listener: {}",
                                core.topic, core.subscription, e
                            );
                            return;
                        }
                    }
                }
            });
        }
    }

    fn receive_individual_messages_from_batch(
        self: &Arc<Self>,
        msg_metadata: &MessageMetadata,
        mut payload: Bytes,
        ledger_id: u64,
        entry_id: u64,
        cnx: &Arc<Connection>,
    ) {
        let batch_size = msg_metadata.num_messages_in_batch.unwrap_or(1) as usize;
        let batch_entry = MessageId::new(ledger_id, entry_id, self.partition_index);
        self.batch_ack_tracker.add_entry(batch_entry, batch_size);
        debug!(
            "[{}] [{}] added ack tracker for entry {}, batch size {}",
            self.subscription, self.consumer_name, batch_entry, batch_size
        );

        for i in 0..batch_size {
            match SingleMessageMetadata::parse_next(&mut payload) {
                Ok((single, single_payload)) => {
                    let message = Message {
                        id: MessageId::with_batch_index(
                            ledger_id,
                            entry_id,
                            self.partition_index,
                            i as i32,
                        ),
                        payload: single_payload,
                        properties: single.properties,
                        partition_key: single.partition_key,
                        publish_time: msg_metadata.publish_time,
                        cnx_id: cnx.id(),
                    };
                    self.enqueue_message(message);
                }
                Err(_) => {
                    warn!(
                        "[{}] [{}] unable to obtain message {} in batch",
                        self.subscription, self.consumer_name, i
                    );
                    self.batch_ack_tracker.remove_entry(&batch_entry);
                    self.discard_corrupted_message(
                        ledger_id,
                        entry_id,
                        cnx,
                        ValidationError::BatchDeSerializeError,
                    );
                    return;
                }
            }
        }
    }

    /// Enqueue a validated message for delivery, preferring a parked async
    /// receive over the queue.
    fn enqueue_message(self: &Arc<Self>, message: Message) {
        let allow_queue = self.config.receiver_queue_size != 0
            || self.waiting_on_zero_queue.load(Ordering::Acquire);
        match self.queues.enqueue(message, allow_queue) {
            EnqueueOutcome::Waiter(waiter, message) => {
                self.notify_pending_receive(waiter, message);
            }
            EnqueueOutcome::Queued | EnqueueOutcome::Dropped => {}
        }
    }

    /// Complete a parked async receive with a freshly arrived message
    fn notify_pending_receive(&self, waiter: queues::ReceiveWaiter, message: Message) {
        self.add_to_unacked(&message);
        if self.config.receiver_queue_size == 0 {
            // the single-credit flow already accounts for this message
            let _ = waiter.send(Ok(message));
        } else {
            self.message_processed(&message);
            tokio::spawn(async move {
                let _ = waiter.send(Ok(message));
            });
        }
    }

    fn uncompress_payload_if_needed(
        &self,
        ledger_id: u64,
        entry_id: u64,
        msg_metadata: &MessageMetadata,
        payload: &Bytes,
        cnx: &Arc<Connection>,
    ) -> Option<Bytes> {
        let uncompressed_size = msg_metadata.uncompressed_size as usize;
        if uncompressed_size > MAX_MESSAGE_SIZE {
            // Uncompressed size is itself corrupted since it cannot be bigger
            // than the MaxMessageSize
            error!(
                "[{}][{}] Got corrupted uncompressed message size {} at {}:{}",
                self.topic, self.subscription, uncompressed_size, ledger_id, entry_id
            );
            self.discard_corrupted_message(
                ledger_id,
                entry_id,
                cnx,
                ValidationError::UncompressedSizeCorruption,
            );
            return None;
        }

        match self
            .codec_provider
            .decode(payload, msg_metadata.compression, uncompressed_size)
        {
            Ok(uncompressed) => Some(uncompressed),
            Err(e) => {
                error!(
                    "[{}][{}] Failed to decompress message with {:?} at {}:{}: {}",
                    self.topic,
                    self.subscription,
                    msg_metadata.compression,
                    ledger_id,
                    entry_id,
                    e
                );
                self.discard_corrupted_message(
                    ledger_id,
                    entry_id,
                    cnx,
                    ValidationError::DecompressionError,
                );
                None
            }
        }
    }

    fn verify_checksum(
        &self,
        ledger_id: u64,
        entry_id: u64,
        msg_metadata: &MessageMetadata,
        payload: &Bytes,
        cnx: &Arc<Connection>,
    ) -> bool {
        let Some(stored_checksum) = msg_metadata.checksum else {
            // No checksum to validate
            return true;
        };
        let computed_checksum = crate::protocol::compute_checksum(payload);
        if stored_checksum == computed_checksum {
            return true;
        }
        error!(
            "[{}][{}] Checksum mismatch for message at {}:{}. Received checksum: {:#x} -- Computed checksum: {:#x}",
            self.topic, self.subscription, ledger_id, entry_id, stored_checksum, computed_checksum
        );
        self.discard_corrupted_message(ledger_id, entry_id, cnx, ValidationError::ChecksumMismatch);
        false
    }

    fn discard_corrupted_message(
        &self,
        ledger_id: u64,
        entry_id: u64,
        cnx: &Arc<Connection>,
        validation_error: ValidationError,
    ) {
        error!(
            "[{}][{}] Discarding corrupted message at {}:{}",
            self.topic, self.subscription, ledger_id, entry_id
        );
        cnx.write(ClientCommand::Ack {
            consumer_id: self.consumer_id,
            ledger_id,
            entry_id,
            ack_type: AckType::Individual,
            validation_error: Some(validation_error),
        });
        if let Some(permits) = self.permits.record_discarded() {
            self.send_flow(cnx, permits);
        }
        self.stats.increment_num_receive_failed();
    }

    // ---- receive flavors -------------------------------------------------

    fn ensure_receive_allowed(&self) -> Result<(), CascadeClientError> {
        if self.config.message_listener.is_some() {
            return Err(CascadeClientError::invalid_config(
                "Cannot use receive() when a message listener has been set",
            ));
        }
        match self.state.get() {
            ConsumerState::Ready | ConsumerState::Connecting => Ok(()),
            ConsumerState::Closing | ConsumerState::Closed => Err(
                CascadeClientError::already_closed("Consumer already closed"),
            ),
            state => Err(CascadeClientError::not_connected(format!("{:?}", state))),
        }
    }

    async fn internal_receive(&self) -> Result<Message, CascadeClientError> {
        if self.config.receiver_queue_size == 0 {
            return self.fetch_single_message_from_broker().await;
        }
        match self.queues.take().await {
            Some(message) => {
                self.message_processed(&message);
                self.add_to_unacked(&message);
                Ok(message)
            }
            None => {
                self.stats.increment_num_receive_failed();
                Err(CascadeClientError::already_closed(
                    "Consumer was closed while receiving",
                ))
            }
        }
    }

    async fn internal_receive_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Option<Message>, CascadeClientError> {
        match tokio::time::timeout(timeout, self.queues.take()).await {
            Ok(Some(message)) => {
                self.message_processed(&message);
                self.add_to_unacked(&message);
                Ok(Some(message))
            }
            Ok(None) => Err(CascadeClientError::already_closed(
                "Consumer was closed while receiving",
            )),
            Err(_) => Ok(None),
        }
    }

    async fn internal_receive_async(&self) -> Result<Message, CascadeClientError> {
        match self.queues.take_or_register() {
            TakeOrRegister::Message(message) => {
                let message = *message;
                self.message_processed(&message);
                self.add_to_unacked(&message);
                Ok(message)
            }
            TakeOrRegister::Registered(rx) => {
                if self.config.receiver_queue_size == 0 {
                    if let Some(cnx) = self.connection() {
                        self.send_flow(&cnx, 1);
                    }
                }
                match rx.await {
                    Ok(result) => result,
                    Err(_) => Err(CascadeClientError::already_closed(
                        "Consumer was closed while receiving",
                    )),
                }
            }
        }
    }

    /// Zero-queue receive: grant a single credit and rendezvous with the
    /// broker, discarding deliveries that belong to a replaced connection.
    async fn fetch_single_message_from_broker(&self) -> Result<Message, CascadeClientError> {
        debug_assert_eq!(self.config.receiver_queue_size, 0);

        // Just being cautious
        if self.queues.len() > 0 {
            error!("The incoming message queue should never be greater than 0 when Queue size is 0");
            self.queues.clear();
        }

        self.waiting_on_zero_queue.store(true, Ordering::Release);
        // if not connected, connection_opened will send the flow again
        if self.is_connected() {
            if let Some(cnx) = self.connection() {
                self.send_flow(&cnx, 1);
            }
        }

        let result = loop {
            match self.queues.take().await {
                None => {
                    self.stats.increment_num_receive_failed();
                    break Err(CascadeClientError::already_closed(
                        "Consumer was closed while receiving",
                    ));
                }
                Some(message) => {
                    let is_current = {
                        let _monitor = self.monitor.lock();
                        self.connection().map(|c| c.id()) == Some(message.cnx_id)
                    };
                    if is_current {
                        self.waiting_on_zero_queue.store(false, Ordering::Release);
                        break Ok(message);
                    }
                    // received due to an old flow - discard it and wait for
                    // the message from the latest flow command
                }
            }
        };

        if let Ok(message) = &result {
            self.add_to_unacked(message);
            self.stats.update_num_msgs_received(message);
        }
        // clearing the queue in case there was a race with message_received
        self.waiting_on_zero_queue.store(false, Ordering::Release);
        self.queues.clear();
        result
    }

    /// Record the event that one message has been processed by the
    /// application; periodically grants the accumulated credits back to the
    /// broker.
    fn message_processed(&self, message: &Message) {
        let Some(cnx) = self.connection() else {
            return;
        };
        if message.cnx_id != cnx.id() {
            // The processed message belonged to the old queue that was
            // cleared after reconnection
            return;
        }
        if let Some(permits) = self.permits.record_processed() {
            self.send_flow(&cnx, permits);
        }
        self.stats.update_num_msgs_received(message);
    }

    fn add_to_unacked(&self, message: &Message) {
        if let Some(tracker) = &self.unacked {
            tracker.add(message.id.entry());
        }
    }

    /// Send the flow command to have the broker start pushing messages
    fn send_flow(&self, cnx: &Connection, permits: u32) {
        debug!(
            "[{}] [{}] Adding {} additional permits",
            self.topic, self.subscription, permits
        );
        cnx.write(ClientCommand::Flow {
            consumer_id: self.consumer_id,
            permits,
        });
    }

    // ---- ack path --------------------------------------------------------

    pub(crate) async fn acknowledge(
        self: &Arc<Self>,
        message_id: MessageId,
        ack_type: AckType,
    ) -> Result<(), CascadeClientError> {
        let state = self.state.get();
        if state != ConsumerState::Ready && state != ConsumerState::Connecting {
            self.stats.increment_num_acks_failed();
            return Err(CascadeClientError::NotReady {
                state: format!("{:?}", state),
            });
        }

        if message_id.is_batch() {
            match self.batch_ack_tracker.ack(message_id, ack_type) {
                BatchAckOutcome::BrokerAckable { acked_messages } => {
                    // all messages in the batch have been acked so the broker
                    // can be acked for the whole entry
                    if ack_type == AckType::Individual && acked_messages > 0 {
                        self.stats.increment_num_acks_sent(acked_messages as u64);
                    }
                    debug!(
                        "[{}] [{}] acknowledging message - {}, acktype {:?}",
                        self.subscription, self.consumer_name, message_id, ack_type
                    );
                }
                BatchAckOutcome::Deferred => {
                    // other messages in the batch are still pending ack
                    return Ok(());
                }
                BatchAckOutcome::CumulativeAt(lower) => {
                    debug!(
                        "[{}] [{}] ack prior entry {} to broker on cumulative ack for message {}",
                        self.subscription, self.consumer_id, lower, message_id
                    );
                    let core = Arc::clone(self);
                    tokio::spawn(async move {
                        let _ = core.send_acknowledge(lower, AckType::Cumulative).await;
                    });
                    return Ok(());
                }
            }
        } else if ack_type == AckType::Cumulative {
            // a cumulative ack on a non-batch message logically covers every
            // lower batch entry
            self.batch_ack_tracker.prune_below(message_id);
        }

        self.send_acknowledge(message_id, ack_type).await
    }

    async fn send_acknowledge(
        &self,
        message_id: MessageId,
        ack_type: AckType,
    ) -> Result<(), CascadeClientError> {
        let entry = message_id.entry();
        let cmd = ClientCommand::Ack {
            consumer_id: self.consumer_id,
            ledger_id: entry.ledger_id,
            entry_id: entry.entry_id,
            ack_type,
            validation_error: None,
        };

        let cnx = if self.is_connected() {
            self.connection()
        } else {
            None
        };
        let Some(cnx) = cnx else {
            self.stats.increment_num_acks_failed();
            return Err(CascadeClientError::not_connected(format!(
                "{:?}",
                self.state.get()
            )));
        };

        // There is no broker response to an ack; success is tied to the
        // flush outcome on the connection
        match cnx.write_and_flush(cmd).await {
            Ok(()) => {
                match ack_type {
                    AckType::Individual => {
                        if let Some(tracker) = &self.unacked {
                            tracker.remove(&entry);
                        }
                        if !message_id.is_batch() {
                            self.stats.increment_num_acks_sent(1);
                        }
                    }
                    AckType::Cumulative => {
                        if let Some(tracker) = &self.unacked {
                            let acked = tracker.remove_messages_till(entry);
                            self.stats.increment_num_acks_sent(u64::from(acked));
                        }
                    }
                }
                Ok(())
            }
            Err(e) => {
                self.stats.increment_num_acks_failed();
                Err(e)
            }
        }
    }

    // ---- unsubscribe / close / redeliver --------------------------------

    pub(crate) async fn unsubscribe(&self) -> Result<(), CascadeClientError> {
        if matches!(
            self.state.get(),
            ConsumerState::Closing | ConsumerState::Closed
        ) {
            return Err(CascadeClientError::already_closed(
                "Consumer was already closed",
            ));
        }
        if !self.is_connected() {
            return Err(CascadeClientError::not_connected(format!(
                "{:?}",
                self.state.get()
            )));
        }
        let Some(cnx) = self.connection() else {
            return Err(CascadeClientError::not_connected(format!(
                "{:?}",
                self.state.get()
            )));
        };

        self.state.set(ConsumerState::Closing);
        let request_id = self.client.new_request_id();
        let unsubscribe = ClientCommand::Unsubscribe {
            consumer_id: self.consumer_id,
            request_id,
        };

        match cnx.send_request_with_id(unsubscribe, request_id).await {
            Ok(()) => {
                cnx.remove_consumer(self.consumer_id);
                info!(
                    "[{}][{}] Successfully unsubscribed from topic",
                    self.topic, self.subscription
                );
                self.state.set(ConsumerState::Closed);
                self.finalize_close();
                Ok(())
            }
            Err(e) => {
                error!(
                    "[{}][{}] Failed to unsubscribe: {}",
                    self.topic, self.subscription, e
                );
                self.state.set(ConsumerState::Ready);
                Err(e)
            }
        }
    }

    pub(crate) async fn close(&self) -> Result<(), CascadeClientError> {
        if matches!(
            self.state.get(),
            ConsumerState::Closing | ConsumerState::Closed
        ) {
            if let Some(tracker) = &self.unacked {
                tracker.close();
            }
            return Ok(());
        }

        if !self.is_connected() {
            info!(
                "[{}] [{}] Closed Consumer (not connected)",
                self.topic, self.subscription
            );
            self.state.set(ConsumerState::Closed);
            self.finalize_close();
            return Ok(());
        }

        self.stats.cancel_reporter();
        self.state.set(ConsumerState::Closing);

        let Some(cnx) = self.connection() else {
            self.state.set(ConsumerState::Closed);
            self.finalize_close();
            return Ok(());
        };

        let request_id = self.client.new_request_id();
        let close = ClientCommand::CloseConsumer {
            consumer_id: self.consumer_id,
            request_id,
        };

        let result = cnx.send_request_with_id(close, request_id).await;
        cnx.remove_consumer(self.consumer_id);
        match result {
            Ok(()) => {}
            // the channel died along with the consumer registration; the
            // broker has dropped us either way
            Err(_) if !cnx.is_active() => {}
            Err(e) => return Err(e),
        }

        info!("[{}] [{}] Closed consumer", self.topic, self.subscription);
        self.state.set(ConsumerState::Closed);
        self.finalize_close();
        Ok(())
    }

    fn finalize_close(&self) {
        self.batch_ack_tracker.clear();
        if let Some(tracker) = &self.unacked {
            tracker.close();
        }
        self.stats.cancel_reporter();
        self.queues.close();
        self.queues
            .fail_pending(|| CascadeClientError::already_closed("Consumer was closed"));
        self.queues.clear();
        self.client.cleanup_consumer(self.consumer_id);
    }

    pub(crate) fn redeliver_unacknowledged_messages(&self) {
        let cnx = self.connection();
        if self.is_connected() {
            if let Some(cnx) = &cnx {
                if cnx.remote_protocol_version() >= MIN_REDELIVER_PROTOCOL_VERSION {
                    if let Some(tracker) = &self.unacked {
                        tracker.clear();
                    }
                    cnx.write(ClientCommand::RedeliverUnacknowledgedMessages {
                        consumer_id: self.consumer_id,
                    });
                    return;
                }
            }
        }
        match &cnx {
            None => warn!(
                "[{}] Client connection needs to be established for redelivery of unacknowledged messages",
                self.subscription
            ),
            Some(_) if self.state.get() == ConsumerState::Connecting => warn!(
                "[{}] Client connection needs to be established for redelivery of unacknowledged messages",
                self.subscription
            ),
            Some(cnx) => {
                // remote end predates the redeliver command; bouncing the
                // connection makes the broker redeliver on resubscribe
                warn!(
                    "[{}] Reconnecting the client to redeliver the messages",
                    self.subscription
                );
                cnx.close_channel();
            }
        }
    }
}

impl Drop for ConsumerCore {
    fn drop(&mut self) {
        self.stats.cancel_reporter();
        if let Some(tracker) = &self.unacked {
            tracker.close();
        }
    }
}
