//! meshchat runtime
//!
//! The network-context half of a pubsub chat peer:
//! - `ChatService`: orchestrates startup, background loops and shutdown
//! - `TopicRegistry`: single owner of subscriptions and their consumer tasks
//! - `MessageRouter`: decode, identity check, handler fan-out, storage
//! - `MessageStore`: per-topic logs with unread counts
//! - `ConnectionMaintainer`: keeps the node dialled into the mesh
//! - `ServiceHost`: runs a service on a dedicated thread
//!
//! `meshchat-core` provides the types and collaborator traits these are
//! written against.

pub mod discovery;
pub mod drain;
pub mod host;
pub mod maintainer;
pub mod registry;
pub mod router;
pub mod service;
pub mod shutdown;
pub mod store;

pub use discovery::{DiscoveryAnnouncer, PeerAnnouncement, PeerTopicFollower};
pub use drain::CommandDrain;
pub use host::ServiceHost;
pub use maintainer::{
    compatible_candidates, dial, sample_candidates, Candidate, ConnectionMaintainer, CycleReport,
    MaintainerStats,
};
pub use registry::{RegistryHandle, SubscribedTopics, TopicRegistry, TopicState, TopicStatus};
pub use router::{BridgeForwarder, MessageHandler, MessageRouter, MessageSink, RouterStats, BRIDGE_HANDLER};
pub use service::{ChatService, ServiceState};
pub use shutdown::{shutdown_channel, ShutdownSignal, ShutdownTrigger};
pub use store::{MessageStore, TopicSummary};

// Re-export core types for convenience
pub use meshchat_core::{
    create_bridge, ChatEvent, ChatMessage, ConnectionInfo, ConsumerBridge, InboundEvent,
    MeshchatError, MeshchatResult, OutboundCommand, PeerId, ServiceConfig, SystemEvent, TaskId,
    TaskLogger,
};
