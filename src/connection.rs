//! Connection management for the CascadeMQ client
//!
//! A `Connection` is shared between consumers (and, in a full client,
//! producers); consumers hold non-owning references and may have the
//! connection swapped out underneath them on reconnect. Frames are written by
//! a dedicated writer task and read by a dedicated reader task, so callers
//! never touch the socket directly.

use bytes::Bytes;
use dashmap::DashMap;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

use crate::error::CascadeClientError;
use crate::metrics::global_metrics;
use crate::protocol::{BrokerCommand, ClientCodec, ClientCommand, PROTOCOL_VERSION};

static CONNECTION_ID_SEQ: AtomicU64 = AtomicU64::new(1);

/// Events routed from a connection to a registered consumer
#[derive(Debug)]
pub(crate) enum ConsumerEvent {
    Message {
        ledger_id: u64,
        entry_id: u64,
        headers_and_payload: Bytes,
    },
    Disconnected,
}

#[derive(Debug)]
enum Outbound {
    Command {
        cmd: ClientCommand,
        flush: Option<oneshot::Sender<Result<(), CascadeClientError>>>,
    },
    Shutdown,
}

/// A single connection to a broker
#[derive(Debug)]
pub(crate) struct Connection {
    id: u64,
    remote_addr: String,
    request_timeout: Duration,
    outbound: mpsc::UnboundedSender<Outbound>,
    pending_requests: DashMap<u64, oneshot::Sender<Result<(), CascadeClientError>>>,
    consumers: DashMap<u64, mpsc::UnboundedSender<ConsumerEvent>>,
    protocol_version: AtomicI32,
    active: AtomicBool,
    disconnected: AtomicBool,
    closed_notify: Notify,
}

impl Connection {
    /// Open a connection to the broker at `addr`
    pub(crate) async fn connect(
        addr: &str,
        connection_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Arc<Self>, CascadeClientError> {
        debug!("Creating connection to broker: {}", addr);

        let stream = timeout(connection_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                global_metrics().record_connection_error();
                CascadeClientError::timeout(connection_timeout.as_millis() as u64)
            })?
            .map_err(|e| {
                global_metrics().record_connection_error();
                CascadeClientError::connection(format!("Failed to connect to {}: {}", addr, e))
            })?;

        let framed = Framed::new(stream, ClientCodec::new());
        let (sink, frames) = framed.split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let connection = Arc::new(Self {
            id: CONNECTION_ID_SEQ.fetch_add(1, Ordering::Relaxed),
            remote_addr: addr.to_string(),
            request_timeout,
            outbound: outbound_tx,
            pending_requests: DashMap::new(),
            consumers: DashMap::new(),
            protocol_version: AtomicI32::new(PROTOCOL_VERSION),
            active: AtomicBool::new(true),
            disconnected: AtomicBool::new(false),
            closed_notify: Notify::new(),
        });

        global_metrics().record_connection_created();
        tokio::spawn(Self::writer_loop(Arc::clone(&connection), sink, outbound_rx));
        tokio::spawn(Self::reader_loop(Arc::clone(&connection), frames));

        info!("Connected to broker: {}", addr);
        Ok(connection)
    }

    /// Process-wide unique identity of this connection. Messages are tagged
    /// with it so that deliveries from a replaced connection can be told apart
    /// from current ones.
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Protocol version advertised by the remote endpoint
    pub(crate) fn remote_protocol_version(&self) -> i32 {
        self.protocol_version.load(Ordering::Acquire)
    }

    /// Register a consumer to receive inbound message frames
    pub(crate) fn register_consumer(
        &self,
        consumer_id: u64,
        events: mpsc::UnboundedSender<ConsumerEvent>,
    ) {
        self.consumers.insert(consumer_id, events);
    }

    /// Remove a consumer registration
    pub(crate) fn remove_consumer(&self, consumer_id: u64) {
        self.consumers.remove(&consumer_id);
    }

    /// Send a command that expects a `Success`/`Error` reply carrying
    /// `request_id`
    pub(crate) async fn send_request_with_id(
        &self,
        cmd: ClientCommand,
        request_id: u64,
    ) -> Result<(), CascadeClientError> {
        let (tx, rx) = oneshot::channel();
        self.pending_requests.insert(request_id, tx);

        if let Err(e) = self.write_and_flush(cmd).await {
            self.pending_requests.remove(&request_id);
            return Err(e);
        }

        match timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CascadeClientError::connection(
                "Connection closed before reply",
            )),
            Err(_) => {
                self.pending_requests.remove(&request_id);
                Err(CascadeClientError::timeout(
                    self.request_timeout.as_millis() as u64,
                ))
            }
        }
    }

    /// Write a command and resolve once it has been flushed to the socket
    pub(crate) async fn write_and_flush(
        &self,
        cmd: ClientCommand,
    ) -> Result<(), CascadeClientError> {
        let (tx, rx) = oneshot::channel();
        self.outbound
            .send(Outbound::Command {
                cmd,
                flush: Some(tx),
            })
            .map_err(|_| CascadeClientError::connection("Connection closed"))?;
        rx.await
            .map_err(|_| CascadeClientError::connection("Connection closed"))?
    }

    /// Write a command without waiting for the flush outcome
    pub(crate) fn write(&self, cmd: ClientCommand) {
        let _ = self.outbound.send(Outbound::Command { cmd, flush: None });
    }

    /// Close the underlying channel. Registered consumers observe a
    /// disconnect, which forces them through their reconnect path.
    pub(crate) fn close_channel(&self) {
        self.active.store(false, Ordering::Release);
        let _ = self.outbound.send(Outbound::Shutdown);
        self.closed_notify.notify_waiters();
    }

    async fn writer_loop(
        self: Arc<Self>,
        mut sink: SplitSink<Framed<TcpStream, ClientCodec>, ClientCommand>,
        mut outbound: mpsc::UnboundedReceiver<Outbound>,
    ) {
        while let Some(item) = outbound.recv().await {
            match item {
                Outbound::Command { cmd, flush } => {
                    let result = sink.send(cmd).await;
                    match result {
                        Ok(()) => {
                            if let Some(flush) = flush {
                                let _ = flush.send(Ok(()));
                            }
                        }
                        Err(e) => {
                            error!("Failed to write to {}: {}", self.remote_addr, e);
                            if let Some(flush) = flush {
                                let _ = flush.send(Err(CascadeClientError::connection(
                                    e.to_string(),
                                )));
                            }
                            self.active.store(false, Ordering::Release);
                            self.closed_notify.notify_waiters();
                            break;
                        }
                    }
                }
                Outbound::Shutdown => {
                    let _ = sink.close().await;
                    break;
                }
            }
        }
        debug!("Writer loop for {} terminated", self.remote_addr);
    }

    async fn reader_loop(
        self: Arc<Self>,
        mut frames: SplitStream<Framed<TcpStream, ClientCodec>>,
    ) {
        loop {
            tokio::select! {
                _ = self.closed_notify.notified() => break,
                frame = frames.next() => match frame {
                    Some(Ok(cmd)) => self.handle_broker_command(cmd),
                    Some(Err(e)) => {
                        error!("Error reading from {}: {}", self.remote_addr, e);
                        break;
                    }
                    None => {
                        debug!("Broker {} closed the connection", self.remote_addr);
                        break;
                    }
                }
            }
        }
        self.handle_disconnect();
    }

    fn handle_broker_command(&self, cmd: BrokerCommand) {
        match cmd {
            BrokerCommand::Connected { protocol_version } => {
                self.protocol_version
                    .store(protocol_version, Ordering::Release);
            }
            BrokerCommand::Success { request_id } => {
                if let Some((_, reply)) = self.pending_requests.remove(&request_id) {
                    let _ = reply.send(Ok(()));
                } else {
                    warn!("Received reply for unknown request {}", request_id);
                }
            }
            BrokerCommand::Error {
                request_id,
                message,
            } => {
                if let Some((_, reply)) = self.pending_requests.remove(&request_id) {
                    let _ = reply.send(Err(CascadeClientError::broker(message)));
                } else {
                    warn!("Received error for unknown request {}: {}", request_id, message);
                }
            }
            BrokerCommand::Message {
                consumer_id,
                ledger_id,
                entry_id,
                headers_and_payload,
            } => {
                if let Some(events) = self.consumers.get(&consumer_id) {
                    let _ = events.send(ConsumerEvent::Message {
                        ledger_id,
                        entry_id,
                        headers_and_payload,
                    });
                } else {
                    debug!("Dropping message for unknown consumer {}", consumer_id);
                }
            }
        }
    }

    /// Fail everything waiting on this connection. Runs at most once.
    fn handle_disconnect(&self) {
        if self.disconnected.swap(true, Ordering::AcqRel) {
            return;
        }
        self.active.store(false, Ordering::Release);

        let request_ids: Vec<u64> = self.pending_requests.iter().map(|e| *e.key()).collect();
        for request_id in request_ids {
            if let Some((_, reply)) = self.pending_requests.remove(&request_id) {
                let _ = reply.send(Err(CascadeClientError::connection("Connection closed")));
            }
        }

        let consumer_ids: Vec<u64> = self.consumers.iter().map(|e| *e.key()).collect();
        for consumer_id in consumer_ids {
            if let Some((_, events)) = self.consumers.remove(&consumer_id) {
                let _ = events.send(ConsumerEvent::Disconnected);
            }
        }

        info!("Connection to {} closed", self.remote_addr);
    }
}
