//! meshchat core
//!
//! Foundational types for a publish/subscribe chat peer: the chat message
//! model, the error taxonomy, configuration, the typed bridge between the
//! network context and a consumer, the collaborator traits the runtime is
//! written against, and the TTL cache of peer identities fetched over the
//! identify side channel.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod channel;
pub mod config;
pub mod errors;
pub mod identity;
pub mod message;
pub mod task_logging;
pub mod transport;
pub mod types;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use channel::{
    create_bridge, ChannelConfig, ChatEvent, ConsumerBridge, InboundEvent, NetworkBridge,
    OutboundCommand, SystemEvent, SystemNotifier,
};
pub use config::{
    IdentityCacheConfig, MaintainerConfig, ServiceConfig, DEFAULT_CHAT_TOPIC,
    DEFAULT_DISCOVERY_TOPIC,
};
pub use errors::{
    ChannelError, ConfigError, DecodeError, HandlerError, IdentityFetchError, MeshchatError,
    MeshchatResult, PublishError, SubscribeError, TopicError, TransportError,
};
pub use identity::{IdentifyRecord, IdentityCacheStats, PeerIdentityCache, PeerIdentityEntry};
pub use message::{ChatMessage, RawMessage, StoredMessage};
pub use task_logging::{LogLevel, TaskId, TaskLogger};
pub use transport::{IdentifyStream, IdentityService, Subscription, Transport, IDENTIFY_PROTOCOL_ID};
pub use types::{ConnectionInfo, KnownPeer, Multiaddr, PeerId, Protocol, SystemTimeSource, TimeSource, Timestamp};
