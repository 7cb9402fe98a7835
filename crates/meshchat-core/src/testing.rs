//! In-memory collaborators for tests
//!
//! `MemoryNetwork` is a shared topic bus; every `MemoryTransport` attached to
//! it sees what the others publish, including its own messages. Connection
//! behaviour, start failures and subscribe failures can be scripted per
//! transport. `MockIdentityService` serves canned identify responses and
//! counts how often each peer was asked.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::errors::TransportError;
use crate::identity::IdentifyRecord;
use crate::message::RawMessage;
use crate::transport::{IdentifyStream, IdentityService, Subscription, Transport};
use crate::types::{KnownPeer, Multiaddr, PeerId, TimeSource, Timestamp};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Deterministic peer id for test node `n`
pub fn test_peer_id(n: u8) -> PeerId {
    PeerId::new(format!("12D3KooWTestPeer{:03}abcdefgh{:02x}", n, n))
}

// ----------------------------------------------------------------------------
// Mock Time Source
// ----------------------------------------------------------------------------

/// Clock that only moves when told to
#[derive(Debug, Clone)]
pub struct MockTimeSource {
    millis: Arc<AtomicU64>,
}

impl MockTimeSource {
    pub fn new(start: Timestamp) -> Self {
        Self {
            millis: Arc::new(AtomicU64::new(start.as_millis())),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.millis.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, to: Timestamp) {
        self.millis.store(to.as_millis(), Ordering::SeqCst);
    }
}

impl TimeSource for MockTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp::new(self.millis.load(Ordering::SeqCst))
    }
}

// ----------------------------------------------------------------------------
// Mock Identity Service
// ----------------------------------------------------------------------------

/// Identify responder with canned frames per peer
#[derive(Debug, Default)]
pub struct MockIdentityService {
    responses: Mutex<HashMap<PeerId, Vec<u8>>>,
    opens: Mutex<HashMap<PeerId, usize>>,
    delay: Option<Duration>,
}

impl MockIdentityService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every stream open, to widen race windows
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn insert(&self, peer: PeerId, record: IdentifyRecord) {
        let frame = record.encode_frame().unwrap_or_default();
        self.insert_raw(peer, frame);
    }

    /// Serve these exact bytes, framing included
    pub fn insert_raw(&self, peer: PeerId, bytes: Vec<u8>) {
        lock(&self.responses).insert(peer, bytes);
    }

    pub fn open_count(&self, peer: &PeerId) -> usize {
        lock(&self.opens).get(peer).copied().unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl IdentityService for MockIdentityService {
    async fn open_stream(&self, peer: &PeerId, _protocol: &str) -> Result<IdentifyStream, TransportError> {
        *lock(&self.opens).entry(peer.clone()).or_insert(0) += 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let response = lock(&self.responses).get(peer).cloned();
        match response {
            Some(bytes) => Ok(Box::new(std::io::Cursor::new(bytes))),
            None => Err(TransportError::StreamFailed {
                peer: peer.to_string(),
                reason: "protocol not supported".to_string(),
            }),
        }
    }
}

// ----------------------------------------------------------------------------
// Memory Network
// ----------------------------------------------------------------------------

type TopicSubscribers = HashMap<String, Vec<mpsc::UnboundedSender<RawMessage>>>;

/// Topic bus shared by every `MemoryTransport` created from it
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    subscribers: Arc<Mutex<TopicSubscribers>>,
    next_port: Arc<AtomicU64>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport for `peer` attached to this network
    pub fn transport(&self, peer: PeerId) -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport::new(self.clone(), peer))
    }

    /// Deliver a raw message to every subscriber of its topic
    pub fn inject(&self, message: RawMessage) -> usize {
        let mut subscribers = lock(&self.subscribers);
        match subscribers.get_mut(&message.topic) {
            Some(senders) => {
                senders.retain(|tx| tx.send(message.clone()).is_ok());
                senders.len()
            }
            None => 0,
        }
    }

    fn attach(&self, topic: &str) -> mpsc::UnboundedReceiver<RawMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.subscribers).entry(topic.to_string()).or_default().push(tx);
        rx
    }

    /// End every subscription to `topic`, returning how many were attached
    pub fn close_topic(&self, topic: &str) -> usize {
        lock(&self.subscribers)
            .remove(topic)
            .map(|senders| senders.len())
            .unwrap_or(0)
    }

    /// Number of live subscriptions on `topic` across all transports
    pub fn subscriber_count(&self, topic: &str) -> usize {
        lock(&self.subscribers)
            .get(topic)
            .map(|senders| senders.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }
}

/// Scripted outcome of dialling an address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectBehavior {
    Succeed,
    Fail,
    /// Never resolves; exercises dial timeouts
    Hang,
}

/// In-memory `Transport` implementation
#[derive(Debug)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    peer_id: PeerId,
    listen_addrs: Vec<Multiaddr>,
    public_key: Option<Vec<u8>>,
    fail_start: AtomicBool,
    failing_topics: Mutex<HashSet<String>>,
    subscribe_calls: Mutex<HashMap<String, usize>>,
    connected: Mutex<HashSet<PeerId>>,
    known: Mutex<Vec<KnownPeer>>,
    connect_behavior: Mutex<HashMap<String, ConnectBehavior>>,
    default_behavior: Mutex<ConnectBehavior>,
    dials: Mutex<Vec<Multiaddr>>,
    peer_topics: Mutex<HashSet<String>>,
}

impl MemoryTransport {
    fn new(network: MemoryNetwork, peer_id: PeerId) -> Self {
        let port = 9000 + network.next_port.fetch_add(1, Ordering::SeqCst);
        let listen = format!("/ip4/127.0.0.1/tcp/{}", port);
        let listen_addrs = listen.parse::<Multiaddr>().into_iter().collect();
        Self {
            network,
            peer_id,
            listen_addrs,
            public_key: None,
            fail_start: AtomicBool::new(false),
            failing_topics: Mutex::new(HashSet::new()),
            subscribe_calls: Mutex::new(HashMap::new()),
            connected: Mutex::new(HashSet::new()),
            known: Mutex::new(Vec::new()),
            connect_behavior: Mutex::new(HashMap::new()),
            default_behavior: Mutex::new(ConnectBehavior::Succeed),
            dials: Mutex::new(Vec::new()),
            peer_topics: Mutex::new(HashSet::new()),
        }
    }

    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }

    pub fn fail_start(&self) {
        self.fail_start.store(true, Ordering::SeqCst);
    }

    pub fn fail_subscribe(&self, topic: &str) {
        lock(&self.failing_topics).insert(topic.to_string());
    }

    /// How many times `subscribe` reached the transport for `topic`
    pub fn subscribe_calls(&self, topic: &str) -> usize {
        lock(&self.subscribe_calls).get(topic).copied().unwrap_or(0)
    }

    pub fn set_connected(&self, peers: impl IntoIterator<Item = PeerId>) {
        *lock(&self.connected) = peers.into_iter().collect();
    }

    pub fn set_known_peers(&self, peers: Vec<KnownPeer>) {
        *lock(&self.known) = peers;
    }

    pub fn set_connect_behavior(&self, addr: &Multiaddr, behavior: ConnectBehavior) {
        lock(&self.connect_behavior).insert(addr.to_string(), behavior);
    }

    pub fn set_default_connect_behavior(&self, behavior: ConnectBehavior) {
        *lock(&self.default_behavior) = behavior;
    }

    /// Every address dialled so far, in order
    pub fn dials(&self) -> Vec<Multiaddr> {
        lock(&self.dials).clone()
    }

    pub fn set_peer_topics(&self, topics: impl IntoIterator<Item = String>) {
        *lock(&self.peer_topics) = topics.into_iter().collect();
    }
}

impl MemoryNetwork {
    /// Create a transport whose published envelopes embed `key`
    pub fn transport_with_key(&self, peer: PeerId, key: Vec<u8>) -> Arc<MemoryTransport> {
        let mut transport = MemoryTransport::new(self.clone(), peer);
        transport.public_key = Some(key);
        Arc::new(transport)
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    fn local_peer_id(&self) -> PeerId {
        self.peer_id.clone()
    }

    async fn start(&self) -> Result<Vec<Multiaddr>, TransportError> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(TransportError::StartFailed {
                reason: "address already in use".to_string(),
            });
        }
        Ok(self.listen_addrs.clone())
    }

    async fn subscribe(&self, topic: &str) -> Result<Box<dyn Subscription>, TransportError> {
        *lock(&self.subscribe_calls).entry(topic.to_string()).or_insert(0) += 1;
        if lock(&self.failing_topics).contains(topic) {
            return Err(TransportError::SubscribeFailed {
                topic: topic.to_string(),
                reason: "scripted failure".to_string(),
            });
        }
        Ok(Box::new(MemorySubscription {
            receiver: self.network.attach(topic),
        }))
    }

    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), TransportError> {
        let mut message = RawMessage::new(topic, data).with_source(self.peer_id.clone());
        if let Some(key) = &self.public_key {
            message = message.with_public_key(key.clone());
        }
        self.network.inject(message);
        Ok(())
    }

    fn peers(&self) -> HashSet<PeerId> {
        lock(&self.connected).clone()
    }

    fn known_peers(&self) -> Vec<KnownPeer> {
        lock(&self.known).clone()
    }

    async fn connect(&self, addr: &Multiaddr) -> Result<(), TransportError> {
        lock(&self.dials).push(addr.clone());
        let behavior = lock(&self.connect_behavior)
            .get(&addr.to_string())
            .copied()
            .unwrap_or(*lock(&self.default_behavior));

        match behavior {
            ConnectBehavior::Succeed => {
                if let Some(peer) = addr.peer_id() {
                    lock(&self.connected).insert(peer.clone());
                }
                Ok(())
            }
            ConnectBehavior::Fail => Err(TransportError::ConnectFailed {
                peer: addr.to_string(),
                reason: "connection refused".to_string(),
            }),
            ConnectBehavior::Hang => {
                futures::future::pending::<()>().await;
                Ok(())
            }
        }
    }

    fn peer_topics(&self) -> HashSet<String> {
        lock(&self.peer_topics).clone()
    }
}

/// Subscription fed by the memory network
pub struct MemorySubscription {
    receiver: mpsc::UnboundedReceiver<RawMessage>,
}

#[async_trait::async_trait]
impl Subscription for MemorySubscription {
    async fn next_message(&mut self) -> Option<RawMessage> {
        self.receiver.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_loops_back_to_own_subscription() {
        let network = MemoryNetwork::new();
        let alice = network.transport(test_peer_id(1));
        let mut sub = alice.subscribe("general").await.unwrap();

        alice.publish("general", b"hello".to_vec()).await.unwrap();
        let message = sub.next_message().await.unwrap();
        assert_eq!(message.data, b"hello");
        assert_eq!(message.source, Some(test_peer_id(1)));
        assert_eq!(message.public_key, None);
    }

    #[tokio::test]
    async fn test_closed_topic_ends_subscriptions() {
        let network = MemoryNetwork::new();
        let alice = network.transport(test_peer_id(1));
        let mut sub = alice.subscribe("general").await.unwrap();

        assert_eq!(network.close_topic("general"), 1);
        assert_eq!(sub.next_message().await, None);
        assert_eq!(network.subscriber_count("general"), 0);
        assert_eq!(network.close_topic("general"), 0);
    }

    #[tokio::test]
    async fn test_scripted_connect_outcomes() {
        let network = MemoryNetwork::new();
        let node = network.transport(test_peer_id(1));
        let good: Multiaddr = format!("/ip4/10.0.0.2/tcp/4001/p2p/{}", test_peer_id(2)).parse().unwrap();
        let bad: Multiaddr = "/ip4/10.0.0.3/tcp/4001".parse().unwrap();
        node.set_connect_behavior(&bad, ConnectBehavior::Fail);

        assert!(node.connect(&good).await.is_ok());
        assert!(node.connect(&bad).await.is_err());
        assert!(node.peers().contains(&test_peer_id(2)));
        assert_eq!(node.dials().len(), 2);
    }

    #[test]
    fn test_mock_clock_moves_only_when_told() {
        let clock = MockTimeSource::new(Timestamp::from_secs(100));
        assert_eq!(clock.now(), Timestamp::from_secs(100));
        clock.advance(Duration::from_secs(5));
        assert_eq!(clock.now(), Timestamp::from_secs(105));
    }
}
