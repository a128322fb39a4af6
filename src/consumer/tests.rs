//! Consumer tests against a mock broker connection

use super::*;
use crate::compression::CompressionType;
use crate::config::{ClientConfig, ConsumerConfigBuilder, RetryConfig};
use crate::connection::mock::MockBroker;
use crate::protocol::{compute_checksum, testing, PROTOCOL_VERSION};
use bytes::BytesMut;
use std::collections::HashMap;

fn test_client() -> Arc<ClientInner> {
    ClientInner::new_for_test(ClientConfig::default())
}

fn fast_retry_client(operation_timeout: Duration) -> Arc<ClientInner> {
    ClientInner::new_for_test(ClientConfig {
        operation_timeout,
        retry_config: RetryConfig {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            multiplier: 2.0,
            jitter: false,
        },
        ..ClientConfig::default()
    })
}

async fn subscribed_consumer(
    queue_size: u32,
) -> (Arc<ConsumerCore>, MockBroker, Arc<Connection>) {
    let config = ConsumerConfigBuilder::new()
        .receiver_queue_size(queue_size)
        .build();
    subscribed_consumer_with(test_client(), config).await
}

async fn subscribed_consumer_with(
    client: Arc<ClientInner>,
    config: ConsumerConfig,
) -> (Arc<ConsumerCore>, MockBroker, Arc<Connection>) {
    let (cnx, broker) = Connection::mock(PROTOCOL_VERSION);
    client.test_connections.lock().push_back(Arc::clone(&cnx));
    let core = ConsumerCore::new(
        client,
        "test-topic".to_string(),
        "test-sub".to_string(),
        config,
        -1,
    );
    core.grab_connection();
    core.await_subscribed().await.unwrap();
    (core, broker, cnx)
}

async fn expect_subscribe(broker: &mut MockBroker) {
    match broker.recv_command().await {
        ClientCommand::Subscribe { .. } => {}
        other => panic!("expected Subscribe, got {:?}", other),
    }
}

async fn expect_flow(broker: &mut MockBroker, permits: u32) {
    match broker.recv_command().await {
        ClientCommand::Flow {
            permits: granted, ..
        } => assert_eq!(granted, permits),
        other => panic!("expected Flow({}), got {:?}", permits, other),
    }
}

async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("timed out waiting for: {}", what);
}

fn frame_with(meta: &MessageMetadata, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&testing::serialize_metadata(meta));
    buf.extend_from_slice(payload);
    buf.freeze()
}

/// A well-formed non-batched frame with a valid checksum
fn single_frame(payload: &[u8]) -> Bytes {
    let meta = MessageMetadata {
        compression: CompressionType::None,
        uncompressed_size: payload.len() as u32,
        publish_time: 1,
        checksum: Some(compute_checksum(payload)),
        num_messages_in_batch: None,
        partition_key: None,
        properties: HashMap::new(),
    };
    frame_with(&meta, payload)
}

/// A well-formed batched frame containing the given payloads
fn batch_frame(payloads: &[&[u8]]) -> Bytes {
    let mut body = BytesMut::new();
    for payload in payloads {
        let single = SingleMessageMetadata {
            payload_size: payload.len() as u32,
            partition_key: None,
            properties: HashMap::new(),
        };
        testing::serialize_single_message(&single, payload, &mut body);
    }
    let body = body.freeze();
    let meta = MessageMetadata {
        compression: CompressionType::None,
        uncompressed_size: body.len() as u32,
        publish_time: 1,
        checksum: Some(compute_checksum(&body)),
        num_messages_in_batch: Some(payloads.len() as u32),
        partition_key: None,
        properties: HashMap::new(),
    };
    frame_with(&meta, &body)
}

#[tokio::test]
async fn test_subscribe_sends_initial_flow_and_refills_at_threshold() {
    let (core, mut broker, _cnx) = subscribed_consumer(10).await;
    expect_subscribe(&mut broker).await;
    expect_flow(&mut broker, 10).await;

    for entry_id in 1..=5 {
        broker.push_message(core.consumer_id(), 1, entry_id, single_frame(b"payload"));
    }
    let consumer = Consumer::from_core(Arc::clone(&core));
    for _ in 0..4 {
        consumer.receive().await.unwrap();
    }
    tokio::task::yield_now().await;
    assert!(broker.try_recv_command().is_none());

    // the fifth processed message reaches the refill threshold of 5
    consumer.receive().await.unwrap();
    expect_flow(&mut broker, 5).await;
}

#[tokio::test]
async fn test_batch_individual_acks_emit_single_entry_ack() {
    let (core, mut broker, _cnx) = subscribed_consumer(10).await;
    expect_subscribe(&mut broker).await;
    expect_flow(&mut broker, 10).await;

    broker.push_message(core.consumer_id(), 7, 3, batch_frame(&[b"a", b"b", b"c"]));
    let consumer = Consumer::from_core(Arc::clone(&core));
    let mut messages = Vec::new();
    for _ in 0..3 {
        messages.push(consumer.receive().await.unwrap());
    }
    assert_eq!(messages[0].id, MessageId::with_batch_index(7, 3, -1, 0));
    assert_eq!(messages[2].id, MessageId::with_batch_index(7, 3, -1, 2));

    consumer.acknowledge(&messages[0]).await.unwrap();
    consumer.acknowledge(&messages[2]).await.unwrap();
    tokio::task::yield_now().await;
    assert!(broker.try_recv_command().is_none());

    consumer.acknowledge(&messages[1]).await.unwrap();
    match broker.recv_command().await {
        ClientCommand::Ack {
            ledger_id,
            entry_id,
            ack_type,
            validation_error,
            ..
        } => {
            assert_eq!((ledger_id, entry_id), (7, 3));
            assert_eq!(ack_type, AckType::Individual);
            assert_eq!(validation_error, None);
        }
        other => panic!("expected Ack, got {:?}", other),
    }
    assert!(core.batch_ack_tracker.is_empty());
    assert_eq!(core.stats.snapshot().acks_sent, 3);
}

#[tokio::test]
async fn test_cumulative_ack_on_non_batch_prunes_tracker() {
    let (core, mut broker, _cnx) = subscribed_consumer(10).await;
    expect_subscribe(&mut broker).await;
    expect_flow(&mut broker, 10).await;

    broker.push_message(core.consumer_id(), 7, 3, batch_frame(&[b"a", b"b", b"c"]));
    broker.push_message(core.consumer_id(), 7, 4, single_frame(b"d"));
    let consumer = Consumer::from_core(Arc::clone(&core));
    for _ in 0..4 {
        consumer.receive().await.unwrap();
    }
    assert!(!core.batch_ack_tracker.is_empty());

    consumer
        .acknowledge_id(MessageId::new(7, 4, -1), AckType::Cumulative)
        .await
        .unwrap();
    match broker.recv_command().await {
        ClientCommand::Ack {
            ledger_id,
            entry_id,
            ack_type,
            ..
        } => {
            assert_eq!((ledger_id, entry_id), (7, 4));
            assert_eq!(ack_type, AckType::Cumulative);
        }
        other => panic!("expected Ack, got {:?}", other),
    }
    assert!(core.batch_ack_tracker.is_empty());
}

#[tokio::test]
async fn test_partial_cumulative_ack_flushes_prior_batch() {
    let (core, mut broker, _cnx) = subscribed_consumer(10).await;
    expect_subscribe(&mut broker).await;
    expect_flow(&mut broker, 10).await;

    broker.push_message(core.consumer_id(), 7, 3, batch_frame(&[b"a", b"b", b"c"]));
    broker.push_message(core.consumer_id(), 7, 5, batch_frame(&[b"d", b"e"]));
    let consumer = Consumer::from_core(Arc::clone(&core));
    for _ in 0..5 {
        consumer.receive().await.unwrap();
    }
    expect_flow(&mut broker, 5).await;

    consumer
        .acknowledge_id(MessageId::with_batch_index(7, 5, -1, 0), AckType::Cumulative)
        .await
        .unwrap();

    // the prior entry is flushed with a cumulative ack; (7,5) stays tracked
    match broker.recv_command().await {
        ClientCommand::Ack {
            ledger_id,
            entry_id,
            ack_type,
            ..
        } => {
            assert_eq!((ledger_id, entry_id), (7, 3));
            assert_eq!(ack_type, AckType::Cumulative);
        }
        other => panic!("expected Ack, got {:?}", other),
    }
    assert!(!core.batch_ack_tracker.contains(&MessageId::new(7, 3, -1)));
    assert!(core.batch_ack_tracker.contains(&MessageId::new(7, 5, -1)));
    assert_eq!(
        core.batch_ack_tracker.outstanding(&MessageId::new(7, 5, -1)),
        Some(1)
    );
}

#[tokio::test]
async fn test_checksum_mismatch_discards_and_restores_credit() {
    let (core, mut broker, _cnx) = subscribed_consumer(2).await;
    expect_subscribe(&mut broker).await;
    expect_flow(&mut broker, 2).await;

    let meta = MessageMetadata {
        compression: CompressionType::None,
        uncompressed_size: 7,
        publish_time: 1,
        checksum: Some(0xbad_c0de),
        num_messages_in_batch: None,
        partition_key: None,
        properties: HashMap::new(),
    };
    broker.push_message(core.consumer_id(), 7, 9, frame_with(&meta, b"payload"));

    match broker.recv_command().await {
        ClientCommand::Ack {
            ledger_id,
            entry_id,
            ack_type,
            validation_error,
            ..
        } => {
            assert_eq!((ledger_id, entry_id), (7, 9));
            assert_eq!(ack_type, AckType::Individual);
            assert_eq!(validation_error, Some(ValidationError::ChecksumMismatch));
        }
        other => panic!("expected Ack, got {:?}", other),
    }
    // threshold is 1 for a queue of 2, so the returned credit flows back
    expect_flow(&mut broker, 1).await;
    assert_eq!(core.stats.snapshot().receive_failures, 1);
    assert_eq!(core.queues.len(), 0);
}

#[tokio::test]
async fn test_oversized_uncompressed_size_is_discarded() {
    let (core, mut broker, _cnx) = subscribed_consumer(2).await;
    expect_subscribe(&mut broker).await;
    expect_flow(&mut broker, 2).await;

    let meta = MessageMetadata {
        compression: CompressionType::None,
        uncompressed_size: (MAX_MESSAGE_SIZE + 1) as u32,
        publish_time: 1,
        checksum: None,
        num_messages_in_batch: None,
        partition_key: None,
        properties: HashMap::new(),
    };
    broker.push_message(core.consumer_id(), 7, 10, frame_with(&meta, b"tiny"));

    match broker.recv_command().await {
        ClientCommand::Ack {
            validation_error, ..
        } => assert_eq!(
            validation_error,
            Some(ValidationError::UncompressedSizeCorruption)
        ),
        other => panic!("expected Ack, got {:?}", other),
    }
}

#[tokio::test]
async fn test_uncompressed_size_at_limit_is_accepted() {
    let (core, mut broker, _cnx) = subscribed_consumer(2).await;
    expect_subscribe(&mut broker).await;
    expect_flow(&mut broker, 2).await;

    let payload = vec![0u8; MAX_MESSAGE_SIZE];
    broker.push_message(core.consumer_id(), 7, 11, single_frame(&payload));

    let consumer = Consumer::from_core(Arc::clone(&core));
    let message = consumer.receive().await.unwrap();
    assert_eq!(message.payload.len(), MAX_MESSAGE_SIZE);
}

#[tokio::test]
async fn test_compressed_payload_round_trips_through_receive() {
    let (core, mut broker, _cnx) = subscribed_consumer(2).await;
    expect_subscribe(&mut broker).await;
    expect_flow(&mut broker, 2).await;

    let payload = b"compressible payload compressible payload compressible payload";
    let provider = CompressionProvider::new();
    let compressed = provider.encode(payload, CompressionType::Lz4).unwrap();
    let meta = MessageMetadata {
        compression: CompressionType::Lz4,
        uncompressed_size: payload.len() as u32,
        publish_time: 1,
        checksum: Some(compute_checksum(payload)),
        num_messages_in_batch: None,
        partition_key: None,
        properties: HashMap::new(),
    };
    broker.push_message(core.consumer_id(), 3, 1, frame_with(&meta, &compressed));

    let consumer = Consumer::from_core(Arc::clone(&core));
    let message = consumer.receive().await.unwrap();
    assert_eq!(&message.payload[..], payload);
}

#[tokio::test]
async fn test_zero_queue_batch_closes_consumer_and_fails_pending() {
    let (core, mut broker, _cnx) = subscribed_consumer(0).await;
    expect_subscribe(&mut broker).await;

    let consumer = Consumer::from_core(Arc::clone(&core));
    let pending = {
        let consumer = consumer.clone();
        tokio::spawn(async move { consumer.receive_async().await })
    };
    // the parked zero-queue receive asks for a single credit
    expect_flow(&mut broker, 1).await;

    broker.push_message(core.consumer_id(), 7, 3, batch_frame(&[b"a", b"b"]));

    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, CascadeClientError::InvalidMessage { .. }));
    match broker.recv_command().await {
        ClientCommand::CloseConsumer { .. } => {}
        other => panic!("expected CloseConsumer, got {:?}", other),
    }
    wait_until("consumer closed", || {
        core.state() == ConsumerState::Closed
    })
    .await;
}

#[tokio::test]
async fn test_zero_queue_fetch_discards_stale_connection_messages() {
    let (core, mut broker, cnx) = subscribed_consumer(0).await;
    expect_subscribe(&mut broker).await;

    let consumer = Consumer::from_core(Arc::clone(&core));
    let receiving = {
        let consumer = consumer.clone();
        tokio::spawn(async move { consumer.receive().await })
    };
    expect_flow(&mut broker, 1).await;

    // a message from a retired connection must never be returned
    let stale = Message {
        id: MessageId::new(9, 9, -1),
        payload: Bytes::from_static(b"stale"),
        properties: HashMap::new(),
        partition_key: None,
        publish_time: 0,
        cnx_id: cnx.id() + 1000,
    };
    core.queues.enqueue(stale, true);
    tokio::task::yield_now().await;

    broker.push_message(core.consumer_id(), 7, 1, single_frame(b"fresh"));
    let message = receiving.await.unwrap().unwrap();
    assert_eq!(message.id, MessageId::new(7, 1, -1));
    assert_eq!(&message.payload[..], b"fresh");
    assert_eq!(core.queues.len(), 0);
}

#[tokio::test]
async fn test_reconnect_resubscribes_and_clears_queue() {
    let (core, mut broker_a, _cnx_a) = subscribed_consumer(4).await;
    expect_subscribe(&mut broker_a).await;
    expect_flow(&mut broker_a, 4).await;

    broker_a.push_message(core.consumer_id(), 1, 1, single_frame(b"left"));
    broker_a.push_message(core.consumer_id(), 1, 2, single_frame(b"over"));
    wait_until("messages queued", || core.queues.len() == 2).await;

    let (cnx_b, mut broker_b) = Connection::mock(PROTOCOL_VERSION);
    core.client
        .test_connections
        .lock()
        .push_back(Arc::clone(&cnx_b));

    broker_a.disconnect();
    expect_subscribe(&mut broker_b).await;
    expect_flow(&mut broker_b, 4).await;
    wait_until("consumer ready", || core.state() == ConsumerState::Ready).await;

    // the pre-reconnect backlog was invalidated along with its credits
    assert_eq!(core.queues.len(), 0);
    assert_eq!(core.permits.available(), 0);
    assert!(core.is_connected());
}

#[tokio::test]
async fn test_subscribe_retries_until_broker_accepts() {
    let client = fast_retry_client(Duration::from_secs(30));
    let (cnx, mut broker) = Connection::mock(PROTOCOL_VERSION);
    broker.fail_requests(true);
    client.test_connections.lock().push_back(Arc::clone(&cnx));
    client.test_connections.lock().push_back(Arc::clone(&cnx));

    let core = ConsumerCore::new(
        Arc::clone(&client),
        "test-topic".to_string(),
        "test-sub".to_string(),
        ConsumerConfigBuilder::new().receiver_queue_size(4).build(),
        -1,
    );
    core.grab_connection();

    expect_subscribe(&mut broker).await;
    broker.fail_requests(false);

    core.await_subscribed().await.unwrap();
    expect_subscribe(&mut broker).await;
    expect_flow(&mut broker, 4).await;
    assert_eq!(core.state(), ConsumerState::Ready);
}

#[tokio::test]
async fn test_subscribe_failure_past_deadline_fails_consumer() {
    let client = fast_retry_client(Duration::ZERO);
    let (cnx, broker) = Connection::mock(PROTOCOL_VERSION);
    broker.fail_requests(true);
    client.test_connections.lock().push_back(cnx);

    let core = ConsumerCore::new(
        Arc::clone(&client),
        "test-topic".to_string(),
        "test-sub".to_string(),
        ConsumerConfig::default(),
        -1,
    );
    core.grab_connection();

    let err = core.await_subscribed().await.unwrap_err();
    assert!(matches!(err, CascadeClientError::Broker { .. }));
    assert_eq!(core.state(), ConsumerState::Failed);
    assert_eq!(client.consumer_count(), 0);
}

#[tokio::test]
async fn test_partitioned_first_connect_skips_initial_flow() {
    let client = test_client();
    let (cnx, mut broker) = Connection::mock(PROTOCOL_VERSION);
    client.test_connections.lock().push_back(Arc::clone(&cnx));

    let core = ConsumerCore::new(
        Arc::clone(&client),
        "test-topic-p0".to_string(),
        "test-sub".to_string(),
        ConsumerConfigBuilder::new().receiver_queue_size(8).build(),
        0,
    );
    core.grab_connection();
    core.await_subscribed().await.unwrap();

    expect_subscribe(&mut broker).await;
    tokio::task::yield_now().await;
    assert!(broker.try_recv_command().is_none());

    // a reconnect is no longer the first connect and grants the full queue
    let (cnx_b, mut broker_b) = Connection::mock(PROTOCOL_VERSION);
    client.test_connections.lock().push_back(cnx_b);
    broker.disconnect();
    expect_subscribe(&mut broker_b).await;
    expect_flow(&mut broker_b, 8).await;
}

#[tokio::test]
async fn test_ack_rejected_when_not_ready() {
    let (core, mut broker, _cnx) = subscribed_consumer(2).await;
    expect_subscribe(&mut broker).await;
    expect_flow(&mut broker, 2).await;

    let consumer = Consumer::from_core(Arc::clone(&core));
    consumer.close().await.unwrap();

    let err = consumer
        .acknowledge_id(MessageId::new(1, 1, -1), AckType::Individual)
        .await
        .unwrap_err();
    assert!(matches!(err, CascadeClientError::NotReady { .. }));
    assert_eq!(core.stats.snapshot().ack_failures, 1);

    let err = consumer.receive().await.unwrap_err();
    assert!(matches!(err, CascadeClientError::AlreadyClosed { .. }));
}

#[tokio::test]
async fn test_ack_flush_failure_fails_the_ack() {
    let (core, mut broker, _cnx) = subscribed_consumer(2).await;
    expect_subscribe(&mut broker).await;
    expect_flow(&mut broker, 2).await;

    broker.push_message(core.consumer_id(), 1, 1, single_frame(b"payload"));
    let consumer = Consumer::from_core(Arc::clone(&core));
    let message = consumer.receive().await.unwrap();

    broker.fail_writes(true);
    let err = consumer.acknowledge(&message).await.unwrap_err();
    assert!(matches!(err, CascadeClientError::Connection { .. }));
    assert_eq!(core.stats.snapshot().ack_failures, 1);
}

#[tokio::test]
async fn test_acking_unknown_batch_entry_is_idempotent() {
    let (core, mut broker, _cnx) = subscribed_consumer(2).await;
    expect_subscribe(&mut broker).await;
    expect_flow(&mut broker, 2).await;

    let consumer = Consumer::from_core(Arc::clone(&core));
    consumer
        .acknowledge_id(MessageId::with_batch_index(5, 5, -1, 0), AckType::Individual)
        .await
        .unwrap();
    match broker.recv_command().await {
        ClientCommand::Ack {
            ledger_id,
            entry_id,
            ..
        } => assert_eq!((ledger_id, entry_id), (5, 5)),
        other => panic!("expected Ack, got {:?}", other),
    }
}

#[tokio::test]
async fn test_batch_of_one_with_flag_set_takes_batch_path() {
    let (core, mut broker, _cnx) = subscribed_consumer(4).await;
    expect_subscribe(&mut broker).await;
    expect_flow(&mut broker, 4).await;

    broker.push_message(core.consumer_id(), 9, 1, batch_frame(&[b"only"]));
    let consumer = Consumer::from_core(Arc::clone(&core));
    let message = consumer.receive().await.unwrap();

    // the broker will ack this entry by batch index 0, so the one-bit
    // tracker must exist
    assert_eq!(message.id, MessageId::with_batch_index(9, 1, -1, 0));
    assert!(core.batch_ack_tracker.contains(&message.id));

    consumer.acknowledge(&message).await.unwrap();
    match broker.recv_command().await {
        ClientCommand::Ack {
            ledger_id,
            entry_id,
            ack_type,
            ..
        } => {
            assert_eq!((ledger_id, entry_id), (9, 1));
            assert_eq!(ack_type, AckType::Individual);
        }
        other => panic!("expected Ack, got {:?}", other),
    }
    assert!(core.batch_ack_tracker.is_empty());
}

#[tokio::test]
async fn test_receive_timeout_returns_none_when_idle() {
    let (core, mut broker, _cnx) = subscribed_consumer(2).await;
    expect_subscribe(&mut broker).await;
    expect_flow(&mut broker, 2).await;

    let consumer = Consumer::from_core(Arc::clone(&core));
    let received = consumer
        .receive_timeout(Duration::from_millis(20))
        .await
        .unwrap();
    assert!(received.is_none());
}

#[tokio::test]
async fn test_receive_async_completes_on_later_delivery() {
    let (core, mut broker, _cnx) = subscribed_consumer(4).await;
    expect_subscribe(&mut broker).await;
    expect_flow(&mut broker, 4).await;

    let consumer = Consumer::from_core(Arc::clone(&core));
    let pending = {
        let consumer = consumer.clone();
        tokio::spawn(async move { consumer.receive_async().await })
    };
    tokio::task::yield_now().await;

    broker.push_message(core.consumer_id(), 2, 1, single_frame(b"late"));
    let message = pending.await.unwrap().unwrap();
    assert_eq!(message.id, MessageId::new(2, 1, -1));
    // the waiter bypassed the queue entirely
    assert_eq!(core.queues.len(), 0);
}

#[tokio::test]
async fn test_redeliver_clears_unacked_and_sends_command() {
    let config = ConsumerConfigBuilder::new()
        .receiver_queue_size(4)
        .ack_timeout(Duration::from_secs(600))
        .build();
    let (core, mut broker, _cnx) = subscribed_consumer_with(test_client(), config).await;
    expect_subscribe(&mut broker).await;
    expect_flow(&mut broker, 4).await;

    broker.push_message(core.consumer_id(), 1, 1, single_frame(b"payload"));
    let consumer = Consumer::from_core(Arc::clone(&core));
    consumer.receive().await.unwrap();
    assert!(!core.unacked.as_ref().unwrap().is_empty());

    consumer.redeliver_unacknowledged_messages();
    match broker.recv_command().await {
        ClientCommand::RedeliverUnacknowledgedMessages { .. } => {}
        other => panic!("expected RedeliverUnacknowledgedMessages, got {:?}", other),
    }
    assert!(core.unacked.as_ref().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_ack_timeout_triggers_redelivery() {
    let config = ConsumerConfigBuilder::new()
        .receiver_queue_size(4)
        .ack_timeout(Duration::from_secs(5))
        .build();
    let (core, mut broker, _cnx) = subscribed_consumer_with(test_client(), config).await;
    expect_subscribe(&mut broker).await;
    expect_flow(&mut broker, 4).await;

    broker.push_message(core.consumer_id(), 1, 1, single_frame(b"payload"));
    let consumer = Consumer::from_core(Arc::clone(&core));
    consumer.receive().await.unwrap();

    // the tracker ticks at half the ack timeout: demote at 2.5s, expire at 5s
    tokio::time::sleep(Duration::from_secs(6)).await;
    match broker.recv_command().await {
        ClientCommand::RedeliverUnacknowledgedMessages { .. } => {}
        other => panic!("expected RedeliverUnacknowledgedMessages, got {:?}", other),
    }
    assert!(core.unacked.as_ref().unwrap().is_empty());
}

#[tokio::test]
async fn test_redeliver_on_old_protocol_bounces_connection() {
    let client = test_client();
    let (cnx, mut broker) = Connection::mock(MIN_REDELIVER_PROTOCOL_VERSION - 1);
    client.test_connections.lock().push_back(Arc::clone(&cnx));
    // the bounce forces a reconnect; park a fresh connection for it
    let (cnx_spare, _broker_spare) = Connection::mock(PROTOCOL_VERSION);
    client.test_connections.lock().push_back(cnx_spare);

    let core = ConsumerCore::new(
        Arc::clone(&client),
        "test-topic".to_string(),
        "test-sub".to_string(),
        ConsumerConfigBuilder::new().receiver_queue_size(2).build(),
        -1,
    );
    core.grab_connection();
    core.await_subscribed().await.unwrap();
    expect_subscribe(&mut broker).await;
    expect_flow(&mut broker, 2).await;

    core.redeliver_unacknowledged_messages();
    wait_until("connection bounced", || !cnx.is_active()).await;
}

#[tokio::test]
async fn test_unsubscribe_closes_consumer() {
    let (core, mut broker, _cnx) = subscribed_consumer(2).await;
    expect_subscribe(&mut broker).await;
    expect_flow(&mut broker, 2).await;

    let consumer = Consumer::from_core(Arc::clone(&core));
    consumer.unsubscribe().await.unwrap();
    match broker.recv_command().await {
        ClientCommand::Unsubscribe { .. } => {}
        other => panic!("expected Unsubscribe, got {:?}", other),
    }
    assert_eq!(core.state(), ConsumerState::Closed);

    let err = consumer.unsubscribe().await.unwrap_err();
    assert!(matches!(err, CascadeClientError::AlreadyClosed { .. }));
}

#[tokio::test]
async fn test_unsubscribe_failure_restores_ready() {
    let (core, mut broker, _cnx) = subscribed_consumer(2).await;
    expect_subscribe(&mut broker).await;
    expect_flow(&mut broker, 2).await;

    broker.fail_requests(true);
    let consumer = Consumer::from_core(Arc::clone(&core));
    let err = consumer.unsubscribe().await.unwrap_err();
    assert!(matches!(err, CascadeClientError::Broker { .. }));
    assert_eq!(core.state(), ConsumerState::Ready);
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let (core, mut broker, _cnx) = subscribed_consumer(2).await;
    expect_subscribe(&mut broker).await;
    expect_flow(&mut broker, 2).await;

    let consumer = Consumer::from_core(Arc::clone(&core));
    consumer.close().await.unwrap();
    match broker.recv_command().await {
        ClientCommand::CloseConsumer { .. } => {}
        other => panic!("expected CloseConsumer, got {:?}", other),
    }
    assert_eq!(core.state(), ConsumerState::Closed);
    consumer.close().await.unwrap();
}

#[tokio::test]
async fn test_close_fails_parked_receives() {
    let (core, mut broker, _cnx) = subscribed_consumer(4).await;
    expect_subscribe(&mut broker).await;
    expect_flow(&mut broker, 4).await;

    let consumer = Consumer::from_core(Arc::clone(&core));
    let pending = {
        let consumer = consumer.clone();
        tokio::spawn(async move { consumer.receive_async().await })
    };
    tokio::task::yield_now().await;

    consumer.close().await.unwrap();
    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, CascadeClientError::AlreadyClosed { .. }));
}

#[tokio::test]
async fn test_listener_pump_preserves_flow_accounting() {
    let received = Arc::new(Mutex::new(Vec::new()));
    let listener_sink = Arc::clone(&received);
    let config = ConsumerConfigBuilder::new()
        .receiver_queue_size(4)
        .message_listener(Arc::new(move |message: Message| {
            listener_sink.lock().push(message);
        }))
        .build();
    let (core, mut broker, _cnx) = subscribed_consumer_with(test_client(), config).await;
    expect_subscribe(&mut broker).await;
    expect_flow(&mut broker, 4).await;

    broker.push_message(core.consumer_id(), 1, 1, single_frame(b"one"));
    broker.push_message(core.consumer_id(), 1, 2, single_frame(b"two"));
    wait_until("listener invoked twice", || received.lock().len() == 2).await;

    let mut ids: Vec<MessageId> = received.lock().iter().map(|m| m.id).collect();
    ids.sort();
    assert_eq!(ids, vec![MessageId::new(1, 1, -1), MessageId::new(1, 2, -1)]);
    // messages pumped through the listener release their credits at the
    // half-queue threshold like application receives do
    expect_flow(&mut broker, 2).await;

    let consumer = Consumer::from_core(Arc::clone(&core));
    let err = consumer.receive().await.unwrap_err();
    assert!(matches!(err, CascadeClientError::InvalidConfig { .. }));
}
