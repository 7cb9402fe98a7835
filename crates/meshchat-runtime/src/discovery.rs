//! Discovery topic traffic
//!
//! The announcer periodically publishes a small JSON presence record on the
//! discovery topic so browser peers can find dialable addresses. The
//! follower optionally joins every topic that connected peers advertise.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use meshchat_core::{
    MeshchatError, MeshchatResult, Multiaddr, PeerId, PublishError, SubscribeError,
    SystemNotifier, TaskLogger, TimeSource, Transport,
};

use crate::registry::RegistryHandle;
use crate::router::MessageRouter;
use crate::shutdown::ShutdownSignal;

// ----------------------------------------------------------------------------
// Presence Announcements
// ----------------------------------------------------------------------------

/// Presence record published on the discovery topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAnnouncement {
    pub peer_id: String,
    pub addrs: Vec<String>,
    /// Seconds since the Unix epoch
    pub timestamp: u64,
}

impl PeerAnnouncement {
    /// Announce `listen_addrs`, each carrying the local `/p2p/` suffix
    pub fn new(peer_id: &PeerId, listen_addrs: &[Multiaddr], timestamp: u64) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            addrs: listen_addrs
                .iter()
                .map(|addr| addr.clone().with_peer_id(peer_id).to_string())
                .collect(),
            timestamp,
        }
    }

    pub fn to_json(&self) -> MeshchatResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> MeshchatResult<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

pub struct DiscoveryAnnouncer {
    router: Arc<MessageRouter>,
    topic: String,
    listen_addrs: Vec<Multiaddr>,
    interval: Duration,
    clock: Arc<dyn TimeSource>,
    logger: TaskLogger,
}

impl DiscoveryAnnouncer {
    pub fn new(
        router: Arc<MessageRouter>,
        topic: String,
        listen_addrs: Vec<Multiaddr>,
        interval: Duration,
        clock: Arc<dyn TimeSource>,
        logger: TaskLogger,
    ) -> Self {
        Self {
            router,
            topic,
            listen_addrs,
            interval,
            clock,
            logger,
        }
    }

    /// Publish one announcement
    pub async fn announce(&self) -> MeshchatResult<PeerAnnouncement> {
        let announcement = PeerAnnouncement::new(
            self.router.local_peer_id(),
            &self.listen_addrs,
            self.clock.now().as_unix_secs(),
        );
        let json = announcement.to_json()?;
        self.router.publish(&self.topic, &json).await?;
        Ok(announcement)
    }

    pub async fn run(self, mut shutdown: ShutdownSignal) {
        self.logger
            .debug(&format!("Announcing presence on '{}' every {:?}", self.topic, self.interval));
        loop {
            if shutdown.is_triggered() {
                break;
            }
            match self.announce().await {
                Ok(announcement) => self.logger.trace(&format!(
                    "Announced {} addresses",
                    announcement.addrs.len()
                )),
                Err(MeshchatError::Publish(PublishError::NotSubscribed(topic))) => {
                    self.logger
                        .debug(&format!("Not announcing: '{}' is not joined", topic));
                }
                Err(err) => self.logger.warn(&format!("Announcement failed: {}", err)),
            }
            if !shutdown.sleep(self.interval).await {
                break;
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Peer Topic Follower
// ----------------------------------------------------------------------------

pub struct PeerTopicFollower {
    transport: Arc<dyn Transport>,
    registry: RegistryHandle,
    notifier: SystemNotifier,
    interval: Duration,
    logger: TaskLogger,
}

impl PeerTopicFollower {
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: RegistryHandle,
        notifier: SystemNotifier,
        interval: Duration,
        logger: TaskLogger,
    ) -> Self {
        Self {
            transport,
            registry,
            notifier,
            interval,
            logger,
        }
    }

    /// Join every advertised topic not yet held; returns the topics joined
    pub async fn poll_once(&self) -> Vec<String> {
        let advertised: BTreeSet<String> = self.transport.peer_topics().into_iter().collect();
        let mut joined = Vec::new();
        for topic in advertised {
            if self.registry.is_subscribed(&topic) {
                continue;
            }
            match self.registry.subscribe(topic.as_str()).await {
                Ok(()) => {
                    self.notifier.notify(format!("Subscribed to topic: {}", topic));
                    joined.push(topic);
                }
                Err(SubscribeError::AlreadySubscribed(_)) => {}
                Err(err) => {
                    self.logger
                        .warn(&format!("Could not follow peer topic '{}': {}", topic, err));
                }
            }
        }
        joined
    }

    pub async fn run(self, mut shutdown: ShutdownSignal) {
        loop {
            if shutdown.is_triggered() {
                break;
            }
            let joined = self.poll_once().await;
            if !joined.is_empty() {
                self.logger
                    .info(&format!("Following peer topics: {}", joined.join(", ")));
            }
            if !shutdown.sleep(self.interval).await {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{SubscribedTopics, TopicRegistry};
    use crate::shutdown::shutdown_channel;
    use meshchat_core::testing::{test_peer_id, MemoryNetwork, MockTimeSource};
    use meshchat_core::{create_bridge, ChannelConfig, InboundEvent, SystemTimeSource, Timestamp};

    #[test]
    fn test_announcement_json_shape() {
        let addrs: Vec<Multiaddr> = vec!["/ip4/127.0.0.1/tcp/9095".parse().unwrap()];
        let announcement = PeerAnnouncement::new(&test_peer_id(1), &addrs, 1_700_000_000);
        let json = announcement.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["peer_id"], test_peer_id(1).to_string());
        assert_eq!(value["timestamp"], 1_700_000_000u64);
        assert_eq!(
            value["addrs"][0],
            format!("/ip4/127.0.0.1/tcp/9095/p2p/{}", test_peer_id(1))
        );
        assert_eq!(PeerAnnouncement::from_json(&json).unwrap(), announcement);
    }

    #[tokio::test]
    async fn test_announce_requires_discovery_subscription() {
        let network = MemoryNetwork::new();
        let transport = network.transport(test_peer_id(1));
        let topics = SubscribedTopics::new();
        let router = Arc::new(MessageRouter::new(
            "alice",
            transport.clone(),
            topics.clone(),
            TaskLogger::disabled(),
        ));
        let clock = Arc::new(MockTimeSource::new(Timestamp::from_secs(1_700_000_000)));
        let announcer = DiscoveryAnnouncer::new(
            router.clone(),
            "discovery".to_string(),
            vec!["/ip4/127.0.0.1/tcp/9095".parse().unwrap()],
            Duration::from_secs(60),
            clock,
            TaskLogger::disabled(),
        );
        assert!(matches!(
            announcer.announce().await,
            Err(MeshchatError::Publish(PublishError::NotSubscribed(_)))
        ));

        let (_trigger, signal) = shutdown_channel();
        let (registry, _task) = TopicRegistry::spawn(
            transport,
            router.clone(),
            topics,
            &ChannelConfig::testing(),
            Arc::new(SystemTimeSource),
            signal,
            TaskLogger::disabled(),
        );
        registry.subscribe("discovery").await.unwrap();
        let sent = announcer.announce().await.unwrap();
        assert_eq!(sent.timestamp, 1_700_000_000);
    }

    #[tokio::test]
    async fn test_follower_joins_new_peer_topics_once() {
        let network = MemoryNetwork::new();
        let transport = network.transport(test_peer_id(1));
        let topics = SubscribedTopics::new();
        let router = Arc::new(MessageRouter::new(
            "alice",
            transport.clone(),
            topics.clone(),
            TaskLogger::disabled(),
        ));
        let (_trigger, signal) = shutdown_channel();
        let (registry, _task) = TopicRegistry::spawn(
            transport.clone(),
            router,
            topics,
            &ChannelConfig::testing(),
            Arc::new(SystemTimeSource),
            signal,
            TaskLogger::disabled(),
        );
        registry.subscribe("general").await.unwrap();
        let (bridge, mut consumer) = create_bridge(&ChannelConfig::testing());

        transport.set_peer_topics(["general".to_string(), "rust".to_string()]);
        let follower = PeerTopicFollower::new(
            transport.clone(),
            registry.clone(),
            bridge.system.clone(),
            Duration::from_secs(1),
            TaskLogger::disabled(),
        );

        assert_eq!(follower.poll_once().await, vec!["rust".to_string()]);
        assert!(follower.poll_once().await.is_empty());
        assert_eq!(transport.subscribe_calls("rust"), 1);
        assert!(matches!(
            consumer.try_recv_event(),
            Ok(Some(InboundEvent::System(event))) if event.message == "Subscribed to topic: rust"
        ));
    }
}
