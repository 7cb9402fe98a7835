//! Topic Registry
//!
//! A single actor owns every subscription. Callers talk to it through a
//! [`RegistryHandle`], so "check then subscribe" is one serialized step and
//! two concurrent subscribe requests for the same topic cannot both reach
//! the transport. A successful subscribe spawns the topic's consumer task
//! immediately; there is no separate "start handlers" step to forget.
//!
//! The set of subscribed topic names is published through a shared,
//! read-only view that the router and the handle read without a round trip.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::Instrument;

use meshchat_core::{
    ChannelConfig, SubscribeError, Subscription, TaskId, TaskLogger, Timestamp, Transport,
};

use crate::router::MessageSink;
use crate::shutdown::ShutdownSignal;

/// How long the actor waits for consumer tasks to wind down at shutdown
const CONSUMER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

// ----------------------------------------------------------------------------
// Shared Topic View
// ----------------------------------------------------------------------------

/// Names of the topics the registry currently holds
///
/// Only the registry actor inserts; everyone else reads snapshots.
#[derive(Debug, Clone, Default)]
pub struct SubscribedTopics {
    inner: Arc<RwLock<HashSet<String>>>,
}

impl SubscribedTopics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.inner
            .read()
            .map(|topics| topics.contains(topic))
            .unwrap_or_else(|poisoned| poisoned.into_inner().contains(topic))
    }

    pub fn snapshot(&self) -> HashSet<String> {
        self.inner
            .read()
            .map(|topics| topics.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn insert(&self, topic: &str) -> bool {
        match self.inner.write() {
            Ok(mut topics) => topics.insert(topic.to_string()),
            Err(poisoned) => poisoned.into_inner().insert(topic.to_string()),
        }
    }
}

// ----------------------------------------------------------------------------
// Topic State
// ----------------------------------------------------------------------------

/// Registry record for one subscribed topic
#[derive(Debug)]
pub struct TopicState {
    pub name: String,
    pub subscribed_at: Timestamp,
    /// Whether the consumer task is still pulling messages
    pub handler_running: bool,
    consumer: Option<JoinHandle<()>>,
}

/// Externally visible view of a [`TopicState`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicStatus {
    pub name: String,
    pub subscribed_at: Timestamp,
    pub handler_running: bool,
}

impl From<&TopicState> for TopicStatus {
    fn from(state: &TopicState) -> Self {
        Self {
            name: state.name.clone(),
            subscribed_at: state.subscribed_at,
            handler_running: state.handler_running,
        }
    }
}

// ----------------------------------------------------------------------------
// Commands and Handle
// ----------------------------------------------------------------------------

#[derive(Debug)]
enum RegistryCommand {
    Subscribe {
        topic: String,
        reply: oneshot::Sender<Result<(), SubscribeError>>,
    },
    Topics {
        reply: oneshot::Sender<Vec<TopicStatus>>,
    },
    ConsumerFinished {
        topic: String,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable front door to the registry actor
#[derive(Debug, Clone)]
pub struct RegistryHandle {
    commands: mpsc::Sender<RegistryCommand>,
    topics: SubscribedTopics,
}

impl RegistryHandle {
    /// Subscribe to `topic` and start consuming it
    ///
    /// Fails with `AlreadySubscribed` without touching the transport when
    /// the topic is already held.
    pub async fn subscribe<S: Into<String>>(&self, topic: S) -> Result<(), SubscribeError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(RegistryCommand::Subscribe {
                topic: topic.into(),
                reply,
            })
            .await
            .map_err(|_| SubscribeError::RegistryStopped)?;
        response.await.map_err(|_| SubscribeError::RegistryStopped)?
    }

    /// Snapshot of subscribed topic names
    pub fn subscribed_topics(&self) -> HashSet<String> {
        self.topics.snapshot()
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.topics.contains(topic)
    }

    pub fn view(&self) -> SubscribedTopics {
        self.topics.clone()
    }

    /// Per-topic consumer status, sorted by name
    pub async fn topic_states(&self) -> Vec<TopicStatus> {
        let (reply, response) = oneshot::channel();
        if self
            .commands
            .send(RegistryCommand::Topics { reply })
            .await
            .is_err()
        {
            return Vec::new();
        }
        response.await.unwrap_or_default()
    }

    /// Stop the actor and wait for its consumers to finish
    pub async fn shutdown(&self) {
        let (reply, response) = oneshot::channel();
        if self
            .commands
            .send(RegistryCommand::Shutdown { reply })
            .await
            .is_ok()
        {
            let _ = response.await;
        }
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }
}

// ----------------------------------------------------------------------------
// Registry Actor
// ----------------------------------------------------------------------------

/// Owner of all subscriptions and their consumer tasks
pub struct TopicRegistry {
    transport: Arc<dyn Transport>,
    sink: Arc<dyn MessageSink>,
    states: HashMap<String, TopicState>,
    topics: SubscribedTopics,
    commands: mpsc::Receiver<RegistryCommand>,
    notify_finished: mpsc::WeakSender<RegistryCommand>,
    shutdown: ShutdownSignal,
    clock: Arc<dyn meshchat_core::TimeSource>,
    logger: TaskLogger,
}

impl TopicRegistry {
    /// Spawn the actor on the current runtime
    ///
    /// `topics` is the view the router was built with; the actor becomes
    /// its only writer.
    pub fn spawn(
        transport: Arc<dyn Transport>,
        sink: Arc<dyn MessageSink>,
        topics: SubscribedTopics,
        config: &ChannelConfig,
        clock: Arc<dyn meshchat_core::TimeSource>,
        shutdown: ShutdownSignal,
        logger: TaskLogger,
    ) -> (RegistryHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.registry_buffer_size);
        let registry = TopicRegistry {
            transport,
            sink,
            states: HashMap::new(),
            topics: topics.clone(),
            commands: rx,
            notify_finished: tx.downgrade(),
            shutdown,
            clock,
            logger,
        };
        let span = registry.logger.span();
        let handle = tokio::spawn(registry.run().instrument(span));
        (RegistryHandle { commands: tx, topics }, handle)
    }

    async fn run(mut self) {
        self.logger.debug("Topic registry started");
        let mut shutdown = self.shutdown.clone();
        let mut pending_reply = None;

        loop {
            let command = tokio::select! {
                command = self.commands.recv() => command,
                _ = shutdown.triggered() => None,
            };
            match command {
                Some(RegistryCommand::Subscribe { topic, reply }) => {
                    let result = self.subscribe(&topic).await;
                    let _ = reply.send(result);
                }
                Some(RegistryCommand::Topics { reply }) => {
                    let _ = reply.send(self.statuses());
                }
                Some(RegistryCommand::ConsumerFinished { topic }) => {
                    if let Some(state) = self.states.get_mut(&topic) {
                        state.handler_running = false;
                        self.logger.debug(&format!("Consumer for '{}' finished", topic));
                    }
                }
                Some(RegistryCommand::Shutdown { reply }) => {
                    pending_reply = Some(reply);
                    break;
                }
                None => break,
            }
        }

        self.commands.close();
        self.join_consumers().await;
        self.logger.debug("Topic registry stopped");
        if let Some(reply) = pending_reply {
            let _ = reply.send(());
        }
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), SubscribeError> {
        if self.states.contains_key(topic) {
            self.logger
                .debug(&format!("Already subscribed to '{}', not resubscribing", topic));
            return Err(SubscribeError::AlreadySubscribed(topic.to_string()));
        }

        let subscription = match self.transport.subscribe(topic).await {
            Ok(subscription) => subscription,
            Err(err) => {
                self.logger
                    .warn(&format!("Subscribe to '{}' failed: {}", topic, err));
                return Err(SubscribeError::Transport(err));
            }
        };

        let consumer = self.spawn_consumer(topic, subscription);
        self.states.insert(
            topic.to_string(),
            TopicState {
                name: topic.to_string(),
                subscribed_at: self.clock.now(),
                handler_running: true,
                consumer: Some(consumer),
            },
        );
        self.topics.insert(topic);
        self.logger.info(&format!("Subscribed to topic '{}'", topic));
        Ok(())
    }

    fn spawn_consumer(&self, topic: &str, subscription: Box<dyn Subscription>) -> JoinHandle<()> {
        let logger = self.logger.for_task(TaskId::TopicConsumer);
        let span = logger.span();
        let consumer = TopicConsumer {
            topic: topic.to_string(),
            subscription,
            sink: Arc::clone(&self.sink),
            shutdown: self.shutdown.clone(),
            finished: self.notify_finished.clone(),
            logger,
        };
        tokio::spawn(consumer.run().instrument(span))
    }

    fn statuses(&self) -> Vec<TopicStatus> {
        let mut statuses: Vec<TopicStatus> = self.states.values().map(TopicStatus::from).collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    async fn join_consumers(&mut self) {
        for state in self.states.values_mut() {
            let Some(mut consumer) = state.consumer.take() else {
                continue;
            };
            if tokio::time::timeout(CONSUMER_JOIN_TIMEOUT, &mut consumer)
                .await
                .is_err()
            {
                self.logger
                    .warn(&format!("Consumer for '{}' did not stop in time", state.name));
                consumer.abort();
            }
            state.handler_running = false;
        }
    }
}

// ----------------------------------------------------------------------------
// Per-topic Consumer
// ----------------------------------------------------------------------------

struct TopicConsumer {
    topic: String,
    subscription: Box<dyn Subscription>,
    sink: Arc<dyn MessageSink>,
    shutdown: ShutdownSignal,
    finished: mpsc::WeakSender<RegistryCommand>,
    logger: TaskLogger,
}

impl TopicConsumer {
    async fn run(mut self) {
        self.logger
            .debug(&format!("Consuming messages on '{}'", self.topic));
        loop {
            if self.shutdown.is_triggered() {
                break;
            }
            let next = tokio::select! {
                biased;
                _ = self.shutdown.triggered() => break,
                message = self.subscription.next_message() => message,
            };
            match next {
                Some(message) => self.sink.deliver(message).await,
                None => {
                    self.logger
                        .warn(&format!("Subscription to '{}' ended", self.topic));
                    break;
                }
            }
        }

        // the registry closes its queue before joining consumers, so this
        // send cannot wait on a registry that is shutting down
        if let Some(registry) = self.finished.upgrade() {
            let finished = RegistryCommand::ConsumerFinished {
                topic: self.topic.clone(),
            };
            if registry.send(finished).await.is_err() {
                self.logger
                    .trace(&format!("Registry gone before '{}' consumer finished", self.topic));
            }
        }
    }
}
