//! Configuration types for the CascadeMQ client

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::message::Message;
use crate::protocol::SubscriptionType;

/// Callback invoked for every delivered message when listener mode is enabled.
///
/// Listener callbacks run on the listener executor, never on the connection
/// I/O task.
pub type MessageListener = Arc<dyn Fn(Message) + Send + Sync>;

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Broker address to connect to
    pub broker_addr: String,
    /// Connection timeout
    pub connection_timeout: Duration,
    /// Timeout for request/reply operations (subscribe, unsubscribe, close)
    pub operation_timeout: Duration,
    /// Interval between consumer stats log lines; zero disables stats
    pub stats_interval: Duration,
    /// Reconnect backoff configuration
    pub retry_config: RetryConfig,
    /// Client identifier
    pub client_id: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            broker_addr: "localhost:6650".to_string(),
            connection_timeout: Duration::from_secs(10),
            operation_timeout: Duration::from_secs(30),
            stats_interval: Duration::ZERO,
            retry_config: RetryConfig::default(),
            client_id: None,
        }
    }
}

/// Consumer-specific configuration
#[derive(Clone)]
pub struct ConsumerConfig {
    /// Number of messages the broker may push ahead of the application.
    /// Zero turns every receive into a rendezvous with the broker.
    pub receiver_queue_size: u32,
    /// Subscription mode
    pub subscription_type: SubscriptionType,
    /// Consumer name reported to the broker
    pub consumer_name: Option<String>,
    /// How long a delivered message may stay unacknowledged before the
    /// consumer asks for redelivery; zero disables the tracker
    pub ack_timeout: Duration,
    /// Listener invoked for each delivered message
    pub message_listener: Option<MessageListener>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            receiver_queue_size: 1000,
            subscription_type: SubscriptionType::Exclusive,
            consumer_name: None,
            ack_timeout: Duration::ZERO,
            message_listener: None,
        }
    }
}

impl fmt::Debug for ConsumerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerConfig")
            .field("receiver_queue_size", &self.receiver_queue_size)
            .field("subscription_type", &self.subscription_type)
            .field("consumer_name", &self.consumer_name)
            .field("ack_timeout", &self.ack_timeout)
            .field("message_listener", &self.message_listener.is_some())
            .finish()
    }
}

/// Retry configuration driving reconnect backoff
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Initial retry delay
    pub initial_delay: Duration,
    /// Maximum retry delay
    pub max_delay: Duration,
    /// Retry delay multiplier
    pub multiplier: f64,
    /// Jitter for retry delays
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Exponential backoff over a [`RetryConfig`]
#[derive(Debug)]
pub(crate) struct Backoff {
    config: RetryConfig,
    next: Duration,
}

impl Backoff {
    pub(crate) fn new(config: RetryConfig) -> Self {
        let next = config.initial_delay;
        Self { config, next }
    }

    /// Delay to apply before the next attempt
    pub(crate) fn next_delay(&mut self) -> Duration {
        let base = self.next;
        let grown = base.mul_f64(self.config.multiplier);
        self.next = grown.min(self.config.max_delay);

        if self.config.jitter {
            let quarter = (base.as_millis() / 4) as u64;
            if quarter > 0 {
                use rand::Rng;
                let extra = rand::thread_rng().gen_range(0..=quarter);
                return base + Duration::from_millis(extra);
            }
        }
        base
    }
}

/// Builder for ClientConfig
#[derive(Debug, Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn broker_addr<S: Into<String>>(mut self, addr: S) -> Self {
        self.config.broker_addr = addr.into();
        self
    }

    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection_timeout = timeout;
        self
    }

    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.config.operation_timeout = timeout;
        self
    }

    pub fn stats_interval(mut self, interval: Duration) -> Self {
        self.config.stats_interval = interval;
        self
    }

    pub fn retry_config(mut self, retry_config: RetryConfig) -> Self {
        self.config.retry_config = retry_config;
        self
    }

    pub fn client_id<S: Into<String>>(mut self, client_id: S) -> Self {
        self.config.client_id = Some(client_id.into());
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

/// Builder for ConsumerConfig
#[derive(Debug, Default)]
pub struct ConsumerConfigBuilder {
    config: ConsumerConfig,
}

impl ConsumerConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn receiver_queue_size(mut self, size: u32) -> Self {
        self.config.receiver_queue_size = size;
        self
    }

    pub fn subscription_type(mut self, sub_type: SubscriptionType) -> Self {
        self.config.subscription_type = sub_type;
        self
    }

    pub fn consumer_name<S: Into<String>>(mut self, name: S) -> Self {
        self.config.consumer_name = Some(name.into());
        self
    }

    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.config.ack_timeout = timeout;
        self
    }

    pub fn message_listener(mut self, listener: MessageListener) -> Self {
        self.config.message_listener = Some(listener);
        self
    }

    pub fn build(self) -> ConsumerConfig {
        self.config
    }
}
