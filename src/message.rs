//! Message identifiers and the consumed message type

use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;

/// Identifier of a message within a partitioned topic.
///
/// Identifiers are totally ordered, lexicographically on
/// `(ledger_id, entry_id, partition, batch_index)`. A message produced as part
/// of a batch additionally carries the index of its position inside the
/// broker-addressable entry; `batch_index` is `None` for non-batched messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageId {
    pub ledger_id: u64,
    pub entry_id: u64,
    pub partition: i32,
    pub batch_index: Option<i32>,
}

impl MessageId {
    /// Create a non-batch message identifier
    pub fn new(ledger_id: u64, entry_id: u64, partition: i32) -> Self {
        Self {
            ledger_id,
            entry_id,
            partition,
            batch_index: None,
        }
    }

    /// Create an identifier for message `batch_index` within a batched entry
    pub fn with_batch_index(ledger_id: u64, entry_id: u64, partition: i32, batch_index: i32) -> Self {
        Self {
            ledger_id,
            entry_id,
            partition,
            batch_index: Some(batch_index),
        }
    }

    /// The broker-addressable entry this message belongs to.
    ///
    /// For a batched message this strips the batch index; acknowledgments on
    /// the wire always address the whole entry.
    pub fn entry(&self) -> MessageId {
        MessageId {
            ledger_id: self.ledger_id,
            entry_id: self.entry_id,
            partition: self.partition,
            batch_index: None,
        }
    }

    /// Whether this identifier refers to a message inside a batched entry
    pub fn is_batch(&self) -> bool {
        self.batch_index.is_some()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.batch_index {
            Some(idx) => write!(
                f,
                "{}:{}:{}:{}",
                self.ledger_id, self.entry_id, self.partition, idx
            ),
            None => write!(f, "{}:{}:{}", self.ledger_id, self.entry_id, self.partition),
        }
    }
}

/// A message delivered to the application.
///
/// Ownership transfers to the application on delivery; the consumer keeps only
/// the identifier for unacknowledged-message tracking.
#[derive(Debug, Clone)]
pub struct Message {
    /// Identifier assigned by the broker
    pub id: MessageId,
    /// Uncompressed message payload
    pub payload: Bytes,
    /// Application-defined properties
    pub properties: HashMap<String, String>,
    /// Routing key the producer attached, if any
    pub partition_key: Option<String>,
    /// Publish timestamp in milliseconds since the epoch
    pub publish_time: u64,
    /// Identity of the connection this message arrived on. Used to filter out
    /// messages pushed through a connection that has since been replaced.
    pub(crate) cnx_id: u64,
}

impl Message {
    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Look up an application property
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}
