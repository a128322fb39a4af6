//! Error types for the CascadeMQ client library

/// Main error type for CascadeMQ client operations
#[derive(Debug, thiserror::Error)]
pub enum CascadeClientError {
    /// Connection-related errors
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Protocol-related errors
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Error reported by the broker in a command reply
    #[error("Broker error: {message}")]
    Broker { message: String },

    /// Operation attempted after the consumer was closed
    #[error("Consumer already closed: {message}")]
    AlreadyClosed { message: String },

    /// Operation attempted while no connection to the broker exists
    #[error("Not connected to broker. State: {state}")]
    NotConnected { state: String },

    /// Acknowledge attempted while the consumer is neither Ready nor Connecting
    #[error("Consumer not ready. State: {state}")]
    NotReady { state: String },

    /// Message that cannot be handled in the current configuration
    #[error("Invalid message: {message}")]
    InvalidMessage { message: String },

    /// Blocking receive was interrupted before a message arrived
    #[error("Receive interrupted")]
    Interrupted,

    /// Operation timed out
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Invalid configuration
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CascadeClientError {
    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a new protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a new broker error
    pub fn broker<S: Into<String>>(message: S) -> Self {
        Self::Broker {
            message: message.into(),
        }
    }

    /// Create a new already-closed error
    pub fn already_closed<S: Into<String>>(message: S) -> Self {
        Self::AlreadyClosed {
            message: message.into(),
        }
    }

    /// Create a new not-connected error
    pub fn not_connected<S: Into<String>>(state: S) -> Self {
        Self::NotConnected {
            state: state.into(),
        }
    }

    /// Create a new invalid message error
    pub fn invalid_message<S: Into<String>>(message: S) -> Self {
        Self::InvalidMessage {
            message: message.into(),
        }
    }

    /// Create a new invalid config error
    pub fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { .. } => true,
            Self::Broker { .. } => true,
            Self::Timeout { .. } => true,
            Self::NotConnected { .. } => true,
            Self::Io(_) => true,
            _ => false,
        }
    }

    /// Check if this error is a connection error
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Io(_))
    }

    /// Check if this error is a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
