//! Client entry point: identifier generation, connection supply and
//! subscribe operations

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::config::{ClientConfig, ConsumerConfig};
use crate::connection::Connection;
use crate::consumer::{Consumer, ConsumerCore};
use crate::error::CascadeClientError;

/// High-level CascadeMQ client. Cheap to clone; all clones share the broker
/// connection.
#[derive(Debug, Clone)]
pub struct CascadeClient {
    inner: Arc<ClientInner>,
}

impl CascadeClient {
    /// Create a new client with the given configuration
    pub fn new(config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner::new(config)),
        }
    }

    /// Attach a consumer to `topic` under `subscription`.
    ///
    /// Resolves once the broker has confirmed the subscription, or fails
    /// after the configured operation timeout.
    pub async fn subscribe<T, S>(
        &self,
        topic: T,
        subscription: S,
        config: ConsumerConfig,
    ) -> Result<Consumer, CascadeClientError>
    where
        T: Into<String>,
        S: Into<String>,
    {
        self.subscribe_partition(topic, subscription, config, -1)
            .await
    }

    /// Attach a consumer to one partition of a partitioned topic. Used by
    /// the topic-level fan-out, which owns the initial flow grant for the
    /// first connect.
    pub async fn subscribe_partition<T, S>(
        &self,
        topic: T,
        subscription: S,
        config: ConsumerConfig,
        partition_index: i32,
    ) -> Result<Consumer, CascadeClientError>
    where
        T: Into<String>,
        S: Into<String>,
    {
        let core = ConsumerCore::new(
            Arc::clone(&self.inner),
            topic.into(),
            subscription.into(),
            config,
            partition_index,
        );
        self.inner.consumers.insert(core.consumer_id(), ());
        core.grab_connection();
        core.await_subscribed().await?;
        Ok(Consumer::from_core(core))
    }

    /// Close the shared broker connection. Consumers observe a disconnect.
    pub fn close(&self) {
        if let Some(cnx) = self.inner.connection.lock().take() {
            cnx.close_channel();
        }
    }
}

/// Shared client state handed to every consumer
#[derive(Debug)]
pub(crate) struct ClientInner {
    pub(crate) config: ClientConfig,
    consumer_id_seq: AtomicU64,
    request_id_seq: AtomicU64,
    connection: Mutex<Option<Arc<Connection>>>,
    consumers: DashMap<u64, ()>,
    #[cfg(test)]
    pub(crate) test_connections: Mutex<std::collections::VecDeque<Arc<Connection>>>,
}

impl ClientInner {
    fn new(config: ClientConfig) -> Self {
        Self {
            config,
            consumer_id_seq: AtomicU64::new(1),
            request_id_seq: AtomicU64::new(1),
            connection: Mutex::new(None),
            consumers: DashMap::new(),
            #[cfg(test)]
            test_connections: Mutex::new(std::collections::VecDeque::new()),
        }
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(config: ClientConfig) -> Arc<Self> {
        Arc::new(Self::new(config))
    }

    pub(crate) fn new_consumer_id(&self) -> u64 {
        self.consumer_id_seq.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn new_request_id(&self) -> u64 {
        self.request_id_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Number of consumers attached through this client
    #[cfg(test)]
    pub(crate) fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// Forget a consumer that reached a terminal state
    pub(crate) fn cleanup_consumer(&self, consumer_id: u64) {
        debug!("Cleaning up consumer {}", consumer_id);
        self.consumers.remove(&consumer_id);
    }

    /// Hand out the shared connection, dialing the broker if the current one
    /// is gone or dead
    pub(crate) async fn get_connection(&self) -> Result<Arc<Connection>, CascadeClientError> {
        #[cfg(test)]
        {
            if let Some(cnx) = self.test_connections.lock().pop_front() {
                return Ok(cnx);
            }
        }

        {
            let guard = self.connection.lock();
            if let Some(cnx) = guard.as_ref() {
                if cnx.is_active() {
                    return Ok(Arc::clone(cnx));
                }
            }
        }

        let cnx = Connection::connect(
            &self.config.broker_addr,
            self.config.connection_timeout,
            self.config.operation_timeout,
        )
        .await?;
        *self.connection.lock() = Some(Arc::clone(&cnx));
        Ok(cnx)
    }
}
