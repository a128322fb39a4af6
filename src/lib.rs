//! # CascadeMQ Client Library
//!
//! An async Rust consumer client for the CascadeMQ message broker.
//!
//! The broker pushes messages over a shared binary connection; the consumer
//! bounds in-memory buffering with credit-based flow control, verifies and
//! decompresses every frame, splits batched entries, and translates
//! per-message acknowledgments into broker-visible entry acks.
//!
//! ## Features
//!
//! - **Credit-based flow control**: the broker never runs more than one
//!   refill interval ahead of the configured receiver queue
//! - **Batch-aware acknowledgment**: individual and cumulative acks across a
//!   mix of batched and non-batched messages
//! - **Async/Await**: built on tokio for non-blocking I/O
//! - **Zero-copy payloads**: `bytes::Bytes` end to end
//! - **Automatic reconnect**: subscriptions are re-established with
//!   exponential backoff when the connection drops
//! - **Observability**: built-in per-consumer stats and tracing support
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use cascademq_client::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = CascadeClient::new(
//!         ClientConfigBuilder::new()
//!             .broker_addr("localhost:6650")
//!             .build(),
//!     );
//!
//!     let consumer = client
//!         .subscribe(
//!             "my-topic",
//!             "my-subscription",
//!             ConsumerConfigBuilder::new().receiver_queue_size(1000).build(),
//!         )
//!         .await?;
//!
//!     loop {
//!         let msg = consumer.receive().await?;
//!         println!("Received: {}", String::from_utf8_lossy(&msg.payload));
//!         consumer.acknowledge(&msg).await?;
//!     }
//! }
//! ```

pub mod client;
pub mod compression;
pub mod config;
mod connection;
pub mod consumer;
pub mod error;
pub mod message;
pub mod metrics;
pub mod protocol;

pub use client::CascadeClient;
pub use config::{
    ClientConfig, ClientConfigBuilder, ConsumerConfig, ConsumerConfigBuilder, MessageListener,
    RetryConfig,
};
pub use consumer::{Consumer, ConsumerState};
pub use error::CascadeClientError;
pub use message::{Message, MessageId};
pub use metrics::{global_metrics, ConsumerStatsSnapshot};
pub use protocol::{AckType, SubscriptionType};

/// Client library result type
pub type Result<T> = std::result::Result<T, CascadeClientError>;

/// Client library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
