//! Chat Service Orchestrator
//!
//! Owns every long-running piece of a peer and the order they come up in:
//! transport, topic registry, default and discovery topics, then the
//! background loops. The service is driven entirely from the network
//! context; the consumer only ever holds the [`ConsumerBridge`].

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Instrument;

use meshchat_core::channel::{CommandReceiver, EventOutlet};
use meshchat_core::{
    create_bridge, ChatEvent, ChatMessage, ConnectionInfo, ConsumerBridge, IdentityService,
    MeshchatError, MeshchatResult, Multiaddr, PeerId, PeerIdentityCache, PublishError,
    ServiceConfig, SubscribeError, SystemNotifier, SystemTimeSource, TaskId, TaskLogger,
    TimeSource, Transport,
};

use crate::discovery::{DiscoveryAnnouncer, PeerTopicFollower};
use crate::drain::{connect_and_report, CommandDrain};
use crate::maintainer::ConnectionMaintainer;
use crate::registry::{RegistryHandle, SubscribedTopics, TopicRegistry};
use crate::router::{BridgeForwarder, MessageHandler, MessageRouter, BRIDGE_HANDLER};
use crate::shutdown::{shutdown_channel, ShutdownTrigger};
use crate::store::MessageStore;

/// How long `stop` waits for each background task before aborting it
const TASK_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

// ----------------------------------------------------------------------------
// Lifecycle State
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceState {
    Created,
    Starting,
    Ready,
    Stopping,
    Stopped,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceState::Created => "Created",
            ServiceState::Starting => "Starting",
            ServiceState::Ready => "Ready",
            ServiceState::Stopping => "Stopping",
            ServiceState::Stopped => "Stopped",
        };
        f.write_str(name)
    }
}

// ----------------------------------------------------------------------------
// Service
// ----------------------------------------------------------------------------

pub struct ChatService {
    config: ServiceConfig,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn TimeSource>,
    router: Arc<MessageRouter>,
    topics: SubscribedTopics,
    chat: EventOutlet<ChatEvent>,
    notifier: SystemNotifier,
    commands: Option<CommandReceiver>,
    consumer: Option<ConsumerBridge>,
    registry: Option<RegistryHandle>,
    shutdown: Option<ShutdownTrigger>,
    tasks: Vec<(TaskId, JoinHandle<()>)>,
    listen_addrs: Vec<Multiaddr>,
    state: watch::Sender<ServiceState>,
    logger: TaskLogger,
}

impl ChatService {
    pub fn new(
        config: ServiceConfig,
        transport: Arc<dyn Transport>,
        identity: Arc<dyn IdentityService>,
        logger: TaskLogger,
    ) -> MeshchatResult<Self> {
        Self::with_clock(config, transport, identity, Arc::new(SystemTimeSource), logger)
    }

    /// Build a service whose timestamps and cache ages come from `clock`
    pub fn with_clock(
        config: ServiceConfig,
        transport: Arc<dyn Transport>,
        identity: Arc<dyn IdentityService>,
        clock: Arc<dyn TimeSource>,
        logger: TaskLogger,
    ) -> MeshchatResult<Self> {
        config.validate()?;

        let (network, consumer) = create_bridge(&config.channels);
        let (chat, notifier, commands) = network.into_parts();

        let identities = Arc::new(PeerIdentityCache::new(
            identity,
            Arc::clone(&clock),
            config.identity.clone(),
            logger.for_task(TaskId::IdentityCache),
        ));
        let topics = SubscribedTopics::new();
        let router = MessageRouter::new(
            config.nickname.clone(),
            Arc::clone(&transport),
            topics.clone(),
            logger.for_task(TaskId::Router),
        )
        .with_identity_cache(identities)
        .with_store(Arc::new(MessageStore::new()))
        .with_clock(Arc::clone(&clock))
        .with_notifier(notifier.clone());

        let mut forwarder = BridgeForwarder::new(
            chat.clone(),
            transport.local_peer_id(),
            logger.for_task(TaskId::Router),
        );
        if !config.discovery_topic.is_empty() {
            forwarder = forwarder.skip_topic(config.discovery_topic.clone());
        }
        router.add_handler(BRIDGE_HANDLER, Arc::new(forwarder));

        let (state, _) = watch::channel(ServiceState::Created);
        Ok(Self {
            config,
            transport,
            clock,
            router: Arc::new(router),
            topics,
            chat,
            notifier,
            commands: Some(commands),
            consumer: Some(consumer),
            registry: None,
            shutdown: None,
            tasks: Vec::new(),
            listen_addrs: Vec::new(),
            state,
            logger,
        })
    }

    /// Hand the consumer end of the bridge out; only the first call succeeds
    pub fn take_consumer_bridge(&mut self) -> Option<ConsumerBridge> {
        self.consumer.take()
    }

    pub fn state(&self) -> ServiceState {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions
    pub fn state_changes(&self) -> watch::Receiver<ServiceState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: ServiceState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            self.logger
                .debug(&format!("Service state {} -> {}", previous, next));
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.transport.local_peer_id()
    }

    pub fn listen_addrs(&self) -> &[Multiaddr] {
        &self.listen_addrs
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub fn message_store(&self) -> &Arc<MessageStore> {
        self.router.store()
    }

    pub fn identity_cache(&self) -> Option<&Arc<PeerIdentityCache>> {
        self.router.identity_cache()
    }

    /// Register an extra handler after the bridge forwarder
    pub fn add_handler<S: Into<String>>(&self, name: S, handler: Arc<dyn MessageHandler>) {
        self.router.add_handler(name, handler);
    }

    pub fn subscribed_topics(&self) -> HashSet<String> {
        self.topics.snapshot()
    }

    // ------------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------------

    pub async fn subscribe<S: Into<String>>(&self, topic: S) -> Result<(), SubscribeError> {
        match &self.registry {
            Some(registry) => registry.subscribe(topic).await,
            None => Err(SubscribeError::RegistryStopped),
        }
    }

    pub async fn publish(&self, topic: &str, text: &str) -> Result<ChatMessage, PublishError> {
        if self.state() != ServiceState::Ready {
            return Err(PublishError::RegistryStopped);
        }
        self.router.publish(topic, text).await
    }

    /// Local identity and connectivity snapshot
    pub fn connection_info(&self) -> ConnectionInfo {
        let peer_id = self.transport.local_peer_id();
        let connected_peers = self.transport.peers();
        ConnectionInfo {
            multiaddr: self
                .listen_addrs
                .first()
                .map(|addr| addr.clone().with_peer_id(&peer_id).to_string()),
            nickname: self.config.nickname.clone(),
            peer_count: connected_peers.len(),
            connected_peers,
            peer_id,
        }
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Bring the service up; any error leaves it `Stopped`
    pub async fn start(&mut self) -> MeshchatResult<()> {
        let current = self.state();
        if current != ServiceState::Created {
            return Err(MeshchatError::InvalidState {
                expected: ServiceState::Created.to_string(),
                actual: current.to_string(),
            });
        }

        self.set_state(ServiceState::Starting);
        self.logger.info(&format!(
            "Starting chat service as '{}' ({})",
            self.config.nickname,
            self.transport.local_peer_id().short_id()
        ));

        if let Err(err) = self.bring_up().await {
            self.logger.error(&format!("Startup failed: {}", err));
            self.teardown().await;
            return Err(err);
        }

        self.set_state(ServiceState::Ready);
        self.notifier.notify_with(
            format!("Joined chat room as '{}'", self.config.nickname),
            &*self.clock,
        );
        self.spawn_startup_dials();
        self.logger.info("Chat service ready");
        Ok(())
    }

    async fn bring_up(&mut self) -> MeshchatResult<()> {
        self.listen_addrs = self.transport.start().await?;
        for addr in &self.listen_addrs {
            self.logger.info(&format!("Listening on {}", addr));
        }

        let (trigger, _) = shutdown_channel();
        let (registry, registry_task) = TopicRegistry::spawn(
            Arc::clone(&self.transport),
            self.router.clone(),
            self.topics.clone(),
            &self.config.channels,
            Arc::clone(&self.clock),
            trigger.signal(),
            self.logger.for_task(TaskId::TopicRegistry),
        );
        self.tasks.push((TaskId::TopicRegistry, registry_task));
        self.registry = Some(registry.clone());
        self.shutdown = Some(trigger);

        let default_topic = self.config.default_topic.clone();
        registry.subscribe(default_topic.as_str()).await.map_err(|err| {
            MeshchatError::startup_error(format!(
                "could not join default topic '{}': {}",
                default_topic, err
            ))
        })?;

        let discovery_topic = self.config.discovery_topic.clone();
        if !discovery_topic.is_empty() && discovery_topic != default_topic {
            if let Err(err) = registry.subscribe(discovery_topic.as_str()).await {
                self.logger
                    .warn(&format!("Discovery topic unavailable: {}", err));
                self.notifier.notify_with(
                    format!("Failed to subscribe to discovery topic: {}", err),
                    &*self.clock,
                );
            }
        }

        self.spawn_background(registry);
        Ok(())
    }

    fn spawn_task<F>(&mut self, task: TaskId, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let span = self.logger.for_task(task).span();
        self.tasks.push((task, tokio::spawn(future.instrument(span))));
    }

    fn spawn_background(&mut self, registry: RegistryHandle) {
        let Some(signal) = self.shutdown.as_ref().map(ShutdownTrigger::signal) else {
            return;
        };

        if let Some(commands) = self.commands.take() {
            let drain = CommandDrain::new(
                commands,
                self.router.clone(),
                registry.clone(),
                Arc::clone(&self.transport),
                self.notifier.clone(),
                self.config.default_topic.clone(),
                self.config.drain_interval(),
                self.config.maintainer.dial_timeout(),
                self.logger.for_task(TaskId::CommandDrain),
            );
            self.spawn_task(TaskId::CommandDrain, drain.run(signal.clone()));
        }

        if self.config.maintainer.enabled {
            let maintainer = ConnectionMaintainer::new(
                Arc::clone(&self.transport),
                self.config.maintainer.clone(),
                self.logger.for_task(TaskId::Maintainer),
            );
            let signal = signal.clone();
            self.spawn_task(TaskId::Maintainer, async move {
                maintainer.run(signal).await;
            });
        }

        if let Some(interval) = self.config.announce_interval() {
            let announcer = DiscoveryAnnouncer::new(
                self.router.clone(),
                self.config.discovery_topic.clone(),
                self.listen_addrs.clone(),
                interval,
                Arc::clone(&self.clock),
                self.logger.for_task(TaskId::Discovery),
            );
            self.spawn_task(TaskId::Discovery, announcer.run(signal.clone()));
        }

        if self.config.follow_peer_topics {
            let follower = PeerTopicFollower::new(
                Arc::clone(&self.transport),
                registry,
                self.notifier.clone(),
                self.config.peer_topic_poll_interval(),
                self.logger.for_task(TaskId::Discovery),
            );
            self.spawn_task(TaskId::Discovery, follower.run(signal));
        }
    }

    fn spawn_startup_dials(&mut self) {
        if self.config.connect_addrs.is_empty() {
            return;
        }
        let Some(signal) = self.shutdown.as_ref().map(ShutdownTrigger::signal) else {
            return;
        };
        let addrs = self.config.connect_addrs.clone();
        let transport = Arc::clone(&self.transport);
        let notifier = self.notifier.clone();
        let timeout = self.config.maintainer.dial_timeout();
        let logger = self.logger.for_task(TaskId::Orchestrator);

        self.spawn_task(TaskId::Orchestrator, async move {
            for addr in addrs {
                if signal.is_triggered() {
                    break;
                }
                connect_and_report(transport.as_ref(), &addr, timeout, &notifier, &logger).await;
            }
        });
    }

    /// Stop every background task and close the bridge
    ///
    /// Consumer sends fail with `ChannelClosed` afterwards. Stopping a
    /// stopped service is a no-op.
    pub async fn stop(&mut self) -> MeshchatResult<()> {
        if self.state() == ServiceState::Stopped {
            return Ok(());
        }
        self.logger.info("Stopping chat service");
        self.set_state(ServiceState::Stopping);
        self.teardown().await;
        self.logger.info("Chat service stopped");
        Ok(())
    }

    async fn teardown(&mut self) {
        if let Some(trigger) = &self.shutdown {
            trigger.trigger();
        }
        if let Some(registry) = &self.registry {
            registry.shutdown().await;
        }

        for (task, mut handle) in self.tasks.drain(..) {
            match tokio::time::timeout(TASK_JOIN_TIMEOUT, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) if err.is_cancelled() => {}
                Ok(Err(err)) => self.logger.warn(&format!("{} task failed: {}", task, err)),
                Err(_) => {
                    self.logger
                        .warn(&format!("{} task did not stop in time; aborting", task));
                    handle.abort();
                }
            }
        }

        if let Some(mut commands) = self.commands.take() {
            commands.close();
        }
        self.chat.close();
        self.notifier.close();
        self.set_state(ServiceState::Stopped);
    }
}

impl Drop for ChatService {
    fn drop(&mut self) {
        if let Some(trigger) = &self.shutdown {
            trigger.trigger();
        }
        for (_, handle) in &self.tasks {
            handle.abort();
        }
        self.chat.close();
        self.notifier.close();
    }
}

impl fmt::Debug for ChatService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatService")
            .field("nickname", &self.config.nickname)
            .field("state", &self.state())
            .field("topics", &self.topics.snapshot())
            .field("tasks", &self.tasks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshchat_core::testing::{test_peer_id, MemoryNetwork, MockIdentityService};
    use meshchat_core::{InboundEvent, TransportError, DEFAULT_CHAT_TOPIC, DEFAULT_DISCOVERY_TOPIC};

    fn service(network: &MemoryNetwork, n: u8, nick: &str) -> ChatService {
        ChatService::new(
            ServiceConfig::testing(nick),
            network.transport(test_peer_id(n)),
            Arc::new(MockIdentityService::new()),
            TaskLogger::disabled(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_start_joins_reserved_topics() {
        let network = MemoryNetwork::new();
        let mut chat = service(&network, 1, "alice");
        let mut consumer = chat.take_consumer_bridge().unwrap();
        assert!(chat.take_consumer_bridge().is_none());

        chat.start().await.unwrap();
        assert_eq!(chat.state(), ServiceState::Ready);
        assert_eq!(
            chat.subscribed_topics(),
            HashSet::from([DEFAULT_CHAT_TOPIC.to_string(), DEFAULT_DISCOVERY_TOPIC.to_string()])
        );
        assert!(matches!(
            consumer.try_recv_event(),
            Ok(Some(InboundEvent::System(event))) if event.message == "Joined chat room as 'alice'"
        ));

        chat.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_state_changes_follow_lifecycle() {
        let network = MemoryNetwork::new();
        let mut chat = service(&network, 1, "alice");
        let mut states = chat.state_changes();
        assert_eq!(*states.borrow_and_update(), ServiceState::Created);

        chat.start().await.unwrap();
        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), ServiceState::Ready);

        chat.stop().await.unwrap();
        assert_eq!(*states.borrow_and_update(), ServiceState::Stopped);
    }

    #[tokio::test]
    async fn test_second_start_is_invalid_state() {
        let network = MemoryNetwork::new();
        let mut chat = service(&network, 1, "alice");
        chat.start().await.unwrap();

        assert!(matches!(
            chat.start().await,
            Err(MeshchatError::InvalidState { .. })
        ));
        chat.stop().await.unwrap();
        assert!(matches!(
            chat.start().await,
            Err(MeshchatError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_transport_start_failure_is_fatal() {
        let network = MemoryNetwork::new();
        let transport = network.transport(test_peer_id(1));
        transport.fail_start();
        let mut chat = ChatService::new(
            ServiceConfig::testing("alice"),
            transport,
            Arc::new(MockIdentityService::new()),
            TaskLogger::disabled(),
        )
        .unwrap();
        let consumer = chat.take_consumer_bridge().unwrap();

        let err = chat.start().await.unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(
            err,
            MeshchatError::Transport(TransportError::StartFailed { .. })
        ));
        assert_eq!(chat.state(), ServiceState::Stopped);
        assert!(consumer.is_closed());
    }

    #[tokio::test]
    async fn test_default_topic_failure_is_fatal_but_discovery_is_not() {
        let network = MemoryNetwork::new();
        let transport = network.transport(test_peer_id(1));
        transport.fail_subscribe(DEFAULT_CHAT_TOPIC);
        let mut chat = ChatService::new(
            ServiceConfig::testing("alice"),
            transport,
            Arc::new(MockIdentityService::new()),
            TaskLogger::disabled(),
        )
        .unwrap();
        let err = chat.start().await.unwrap_err();
        assert!(matches!(err, MeshchatError::Startup { .. }));

        let transport = network.transport(test_peer_id(2));
        transport.fail_subscribe(DEFAULT_DISCOVERY_TOPIC);
        let mut chat = ChatService::new(
            ServiceConfig::testing("bob"),
            transport,
            Arc::new(MockIdentityService::new()),
            TaskLogger::disabled(),
        )
        .unwrap();
        let mut consumer = chat.take_consumer_bridge().unwrap();
        chat.start().await.unwrap();

        let messages: Vec<String> = consumer
            .poll_events()
            .into_iter()
            .filter_map(|event| match event {
                InboundEvent::System(system) => Some(system.message),
                InboundEvent::Chat(_) => None,
            })
            .collect();
        assert!(messages[0].starts_with("Failed to subscribe to discovery topic"));
        assert_eq!(messages[1], "Joined chat room as 'bob'");
        chat.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_connection_info_reports_listen_address() {
        let network = MemoryNetwork::new();
        let mut chat = service(&network, 1, "alice");
        assert_eq!(chat.connection_info().multiaddr, None);

        chat.start().await.unwrap();
        let info = chat.connection_info();
        assert_eq!(info.peer_id, test_peer_id(1));
        assert_eq!(info.nickname, "alice");
        assert_eq!(info.peer_count, 0);
        let addr = info.multiaddr.unwrap();
        assert!(addr.starts_with("/ip4/127.0.0.1/tcp/"));
        assert!(addr.ends_with(&format!("/p2p/{}", test_peer_id(1))));
        chat.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_closes_bridge() {
        let network = MemoryNetwork::new();
        let mut chat = service(&network, 1, "alice");
        let consumer = chat.take_consumer_bridge().unwrap();
        chat.start().await.unwrap();

        chat.stop().await.unwrap();
        chat.stop().await.unwrap();
        assert_eq!(chat.state(), ServiceState::Stopped);
        assert!(consumer.send_message("late", None).is_err());
        assert_eq!(
            chat.publish(DEFAULT_CHAT_TOPIC, "late").await,
            Err(PublishError::RegistryStopped)
        );
        assert_eq!(chat.subscribe("late").await, Err(SubscribeError::RegistryStopped));
    }
}
