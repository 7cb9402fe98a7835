//! Collaborator Trait Definitions
//!
//! The pubsub transport and the identify side channel are external to this
//! crate. The runtime only ever talks to them through these traits; concrete
//! implementations wrap a real network stack, and the `testing` module
//! provides in-memory versions.

use std::collections::HashSet;
use tokio::io::AsyncRead;

use crate::errors::TransportError;
use crate::message::RawMessage;
use crate::types::{KnownPeer, Multiaddr, PeerId};

/// Protocol identifier of the identify exchange
pub const IDENTIFY_PROTOCOL_ID: &str = "/ipfs/id/1.0.0";

/// Readable half of an identify stream
pub type IdentifyStream = Box<dyn AsyncRead + Send + Unpin>;

// ----------------------------------------------------------------------------
// Pubsub Transport
// ----------------------------------------------------------------------------

/// Publish/subscribe transport consumed by the runtime
///
/// Implementations own connection management, the gossip mesh and message
/// signing. All methods are safe to call concurrently.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Identity of the local node
    fn local_peer_id(&self) -> PeerId;

    /// Bring the transport up and return the addresses it listens on
    ///
    /// Failing here is the only fatal error of service startup.
    async fn start(&self) -> Result<Vec<Multiaddr>, TransportError>;

    /// Join a topic and return the stream of its messages
    async fn subscribe(&self, topic: &str) -> Result<Box<dyn Subscription>, TransportError>;

    /// Publish bytes on a topic
    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), TransportError>;

    /// Currently connected peers
    fn peers(&self) -> HashSet<PeerId>;

    /// Peers in the peer store, with the addresses they advertised
    fn known_peers(&self) -> Vec<KnownPeer>;

    /// Dial an address; resolves once the connection is established
    async fn connect(&self, addr: &Multiaddr) -> Result<(), TransportError>;

    /// Topics that connected peers have announced interest in
    fn peer_topics(&self) -> HashSet<String> {
        HashSet::new()
    }
}

/// Message stream of one subscribed topic
#[async_trait::async_trait]
pub trait Subscription: Send {
    /// Next message on the topic; `None` once the subscription has ended
    async fn next_message(&mut self) -> Option<RawMessage>;
}

// ----------------------------------------------------------------------------
// Identify Side Channel
// ----------------------------------------------------------------------------

/// Opens point-to-point protocol streams to peers
#[async_trait::async_trait]
pub trait IdentityService: Send + Sync {
    async fn open_stream(&self, peer: &PeerId, protocol: &str) -> Result<IdentifyStream, TransportError>;
}
