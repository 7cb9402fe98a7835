//! Error types for the meshchat peer
//!
//! Each concern gets its own error enum so callers can match on exactly the
//! failures an operation can produce. `MeshchatError` unifies them for code
//! that only needs to propagate.

use std::time::Duration;

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Failures reported by the pubsub transport
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Transport failed to start: {reason}")]
    StartFailed { reason: String },
    #[error("Subscribe to topic '{topic}' failed: {reason}")]
    SubscribeFailed { topic: String, reason: String },
    #[error("Publish to topic '{topic}' failed: {reason}")]
    PublishFailed { topic: String, reason: String },
    #[error("Connection failed to peer {peer}: {reason}")]
    ConnectFailed { peer: String, reason: String },
    #[error("Connection to peer {peer} timed out after {timeout:?}")]
    ConnectTimeout { peer: String, timeout: Duration },
    #[error("Invalid multiaddr '{addr}': {reason}")]
    InvalidAddress { addr: String, reason: String },
    #[error("Stream to peer {peer} failed: {reason}")]
    StreamFailed { peer: String, reason: String },
    #[error("Transport is closed")]
    Closed,
}

/// An inbound payload could not be turned into a chat message
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Payload on topic '{topic}' is not valid UTF-8: {source}")]
    InvalidUtf8 {
        topic: String,
        #[source]
        source: std::string::FromUtf8Error,
    },
}

/// Failures of the identify side-channel exchange
#[derive(Debug, thiserror::Error)]
pub enum IdentityFetchError {
    #[error("Could not open identify stream: {0}")]
    StreamOpen(#[from] TransportError),
    #[error("Identify stream read failed: {0}")]
    Read(#[from] std::io::Error),
    #[error("Identify response was empty")]
    EmptyResponse,
    #[error("Identify frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },
    #[error("Identify response is malformed: {0}")]
    Malformed(#[from] bincode::Error),
    #[error("Identify exchange timed out after {0:?}")]
    Timeout(Duration),
}

/// Caller-facing precondition violations on topic operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopicError {
    #[error("Not subscribed to topic '{topic}'")]
    NotSubscribed { topic: String },
    #[error("Already subscribed to topic '{topic}'")]
    AlreadySubscribed { topic: String },
}

/// A registered message handler failed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    #[error("Handler '{handler}' failed: {reason}")]
    Failed { handler: String, reason: String },
    #[error("Handler '{handler}' dropped a message: downstream queue is full")]
    QueueFull { handler: String },
    #[error("Handler '{handler}' dropped a message: downstream queue is closed")]
    QueueClosed { handler: String },
}

impl HandlerError {
    pub fn failed<H: Into<String>, R: Into<String>>(handler: H, reason: R) -> Self {
        HandlerError::Failed {
            handler: handler.into(),
            reason: reason.into(),
        }
    }
}

/// Bridge channel failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel buffer is full")]
    ChannelFull,
    #[error("Channel is closed")]
    ChannelClosed,
    #[error("Channel receiver was dropped")]
    ReceiverDropped,
}

/// Configuration loading and validation failures
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for '{field}': {reason}")]
    Invalid { field: String, reason: String },
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    pub fn invalid<F: Into<String>, R: Into<String>>(field: F, reason: R) -> Self {
        ConfigError::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// Operation Results
// ----------------------------------------------------------------------------

/// Result of subscribing to a topic
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscribeError {
    #[error("Already subscribed to topic '{0}'")]
    AlreadySubscribed(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("Topic registry is not running")]
    RegistryStopped,
}

/// Result of publishing a chat message
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    #[error("Not subscribed to topic '{0}'")]
    NotSubscribed(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("Topic registry is not running")]
    RegistryStopped,
}

// ----------------------------------------------------------------------------
// Unified Error Type
// ----------------------------------------------------------------------------

/// Unified error type for the meshchat crates
#[derive(Debug, thiserror::Error)]
pub enum MeshchatError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Identity fetch error: {0}")]
    IdentityFetch(#[from] IdentityFetchError),

    #[error("Topic error: {0}")]
    Topic(#[from] TopicError),

    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),

    #[error("Subscribe error: {0}")]
    Subscribe(#[from] SubscribeError),

    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Lifecycle call made in the wrong service state
    #[error("Invalid service state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Fatal failure while bringing the service up
    #[error("Service startup failed: {reason}")]
    Startup { reason: String },

    /// Internal channel communication error
    #[error("Channel communication failed: {message}")]
    ChannelCommunication { message: String },
}

impl MeshchatError {
    /// Create a channel communication error with a message
    pub fn channel_error<T: Into<String>>(message: T) -> Self {
        MeshchatError::ChannelCommunication {
            message: message.into(),
        }
    }

    /// Create a configuration error for a field
    pub fn config_error<F: Into<String>, R: Into<String>>(field: F, reason: R) -> Self {
        MeshchatError::Config(ConfigError::invalid(field, reason))
    }

    /// Create a startup error with a reason
    pub fn startup_error<T: Into<String>>(reason: T) -> Self {
        MeshchatError::Startup {
            reason: reason.into(),
        }
    }

    /// Whether this error must abort service startup
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MeshchatError::Startup { .. }
                | MeshchatError::Transport(TransportError::StartFailed { .. })
                | MeshchatError::Config(_)
        )
    }
}

pub type MeshchatResult<T> = Result<T, MeshchatError>;
