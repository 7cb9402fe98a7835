//! Message Router
//!
//! Turns raw pubsub envelopes into [`ChatMessage`]s and fans them out:
//!
//! 1. decode the payload as UTF-8, dropping it on failure
//! 2. resolve the sender, `unknown` when the envelope names none
//! 3. own messages skip identity resolution and are stored already read
//! 4. remote messages without an embedded key consult the identity cache;
//!    a miss is logged and the message is delivered anyway
//! 5. registered handlers run in registration order, each isolated from the
//!    others' failures
//! 6. the message is appended to its topic's log
//!
//! The router is also the publish path for local text.

use std::any::Any;
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use meshchat_core::channel::{EventOutlet, NonBlockingSend};
use meshchat_core::{
    ChannelError, ChatEvent, ChatMessage, DecodeError, HandlerError, PeerId, PeerIdentityCache,
    PublishError, RawMessage, SystemNotifier, SystemTimeSource, TaskId, TaskLogger, TimeSource,
    Transport,
};

use crate::registry::SubscribedTopics;
use crate::store::MessageStore;

/// Name under which the bridge forwarder is registered
pub const BRIDGE_HANDLER: &str = "bridge";

// ----------------------------------------------------------------------------
// Handler Seams
// ----------------------------------------------------------------------------

/// Receives every routed chat message
pub trait MessageHandler: Send + Sync {
    fn handle(&self, message: &ChatMessage) -> Result<(), HandlerError>;
}

impl<F> MessageHandler for F
where
    F: Fn(&ChatMessage) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle(&self, message: &ChatMessage) -> Result<(), HandlerError> {
        self(message)
    }
}

/// Where topic consumers hand off raw envelopes
#[async_trait::async_trait]
pub trait MessageSink: Send + Sync {
    async fn deliver(&self, message: RawMessage);
}

/// Forwards routed messages to the consumer's chat channel
#[derive(Debug, Clone)]
pub struct BridgeForwarder {
    outlet: EventOutlet<ChatEvent>,
    local_peer_id: PeerId,
    skip_topics: HashSet<String>,
    logger: TaskLogger,
}

impl BridgeForwarder {
    pub fn new(outlet: EventOutlet<ChatEvent>, local_peer_id: PeerId, logger: TaskLogger) -> Self {
        Self {
            outlet,
            local_peer_id,
            skip_topics: HashSet::new(),
            logger,
        }
    }

    /// Keep messages on `topic` out of the consumer's feed
    pub fn skip_topic<S: Into<String>>(mut self, topic: S) -> Self {
        self.skip_topics.insert(topic.into());
        self
    }
}

impl MessageHandler for BridgeForwarder {
    fn handle(&self, message: &ChatMessage) -> Result<(), HandlerError> {
        if self.skip_topics.contains(message.topic()) {
            return Ok(());
        }
        let read = message.sender_peer_id() == &self.local_peer_id;
        let event = ChatEvent::from_message(message, read);
        match self.outlet.try_send_non_blocking(event.clone()) {
            Ok(()) => {
                self.logger.log_send(TaskId::Consumer, &event);
                Ok(())
            }
            Err(err) => {
                self.logger.log_drop(TaskId::Consumer, &event, &err.to_string());
                Err(match err {
                    ChannelError::ChannelFull => HandlerError::QueueFull {
                        handler: BRIDGE_HANDLER.to_string(),
                    },
                    _ => HandlerError::QueueClosed {
                        handler: BRIDGE_HANDLER.to_string(),
                    },
                })
            }
        }
    }
}

fn panic_reason(payload: &(dyn Any + Send)) -> &str {
    if let Some(reason) = payload.downcast_ref::<&str>() {
        reason
    } else if let Some(reason) = payload.downcast_ref::<String>() {
        reason.as_str()
    } else {
        "unknown cause"
    }
}

// ----------------------------------------------------------------------------
// Statistics
// ----------------------------------------------------------------------------

/// Router counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub routed: u64,
    pub decode_failures: u64,
    pub handler_failures: u64,
    /// Remote messages delivered without a resolvable public key
    pub identity_misses: u64,
}

#[derive(Debug, Default)]
struct RouterCounters {
    routed: AtomicU64,
    decode_failures: AtomicU64,
    handler_failures: AtomicU64,
    identity_misses: AtomicU64,
}

impl RouterCounters {
    fn snapshot(&self) -> RouterStats {
        RouterStats {
            routed: self.routed.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            identity_misses: self.identity_misses.load(Ordering::Relaxed),
        }
    }
}

// ----------------------------------------------------------------------------
// Router
// ----------------------------------------------------------------------------

type NamedHandler = (String, Arc<dyn MessageHandler>);

pub struct MessageRouter {
    local_peer_id: PeerId,
    nickname: String,
    transport: Arc<dyn Transport>,
    topics: SubscribedTopics,
    identities: Option<Arc<PeerIdentityCache>>,
    store: Arc<MessageStore>,
    handlers: RwLock<Vec<NamedHandler>>,
    clock: Arc<dyn TimeSource>,
    notifier: SystemNotifier,
    stats: RouterCounters,
    logger: TaskLogger,
}

impl MessageRouter {
    pub fn new<S: Into<String>>(
        nickname: S,
        transport: Arc<dyn Transport>,
        topics: SubscribedTopics,
        logger: TaskLogger,
    ) -> Self {
        Self {
            local_peer_id: transport.local_peer_id(),
            nickname: nickname.into(),
            transport,
            topics,
            identities: None,
            store: Arc::new(MessageStore::new()),
            handlers: RwLock::new(Vec::new()),
            clock: Arc::new(SystemTimeSource),
            notifier: SystemNotifier::detached(),
            stats: RouterCounters::default(),
            logger,
        }
    }

    pub fn with_identity_cache(mut self, cache: Arc<PeerIdentityCache>) -> Self {
        self.identities = Some(cache);
        self
    }

    pub fn with_store(mut self, store: Arc<MessageStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn TimeSource>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_notifier(mut self, notifier: SystemNotifier) -> Self {
        self.notifier = notifier;
        self
    }

    /// Register a handler; handlers run in registration order
    pub fn add_handler<S: Into<String>>(&self, name: S, handler: Arc<dyn MessageHandler>) {
        let name = name.into();
        self.logger.debug(&format!("Registered message handler '{}'", name));
        match self.handlers.write() {
            Ok(mut handlers) => handlers.push((name, handler)),
            Err(poisoned) => poisoned.into_inner().push((name, handler)),
        }
    }

    pub fn handler_names(&self) -> Vec<String> {
        self.handlers_snapshot()
            .into_iter()
            .map(|(name, _)| name)
            .collect()
    }

    pub fn local_peer_id(&self) -> &PeerId {
        &self.local_peer_id
    }

    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    pub fn store(&self) -> &Arc<MessageStore> {
        &self.store
    }

    pub fn identity_cache(&self) -> Option<&Arc<PeerIdentityCache>> {
        self.identities.as_ref()
    }

    pub fn stats(&self) -> RouterStats {
        self.stats.snapshot()
    }

    fn handlers_snapshot(&self) -> Vec<NamedHandler> {
        match self.handlers.read() {
            Ok(handlers) => handlers.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Run one raw envelope through the pipeline
    pub async fn route(&self, raw: RawMessage) -> Result<ChatMessage, DecodeError> {
        let RawMessage {
            topic,
            data,
            source,
            public_key,
        } = raw;

        let text = match String::from_utf8(data) {
            Ok(text) => text,
            Err(source) => {
                self.stats.decode_failures.fetch_add(1, Ordering::Relaxed);
                let err = DecodeError::InvalidUtf8 { topic, source };
                self.logger.warn(&format!("Dropping message: {}", err));
                return Err(err);
            }
        };

        let sender = source.unwrap_or_else(PeerId::unknown);
        let is_self = sender == self.local_peer_id;

        if !is_self && public_key.is_none() {
            self.resolve_identity(&sender, &topic).await;
        }

        let nickname = if is_self {
            self.nickname.clone()
        } else {
            sender.short_id()
        };
        let message = ChatMessage::new(text, sender, nickname, topic, self.clock.now());

        self.dispatch(&message);
        self.store.append(message.clone(), is_self);
        self.stats.routed.fetch_add(1, Ordering::Relaxed);
        Ok(message)
    }

    async fn resolve_identity(&self, sender: &PeerId, topic: &str) {
        if sender.is_unknown() {
            self.stats.identity_misses.fetch_add(1, Ordering::Relaxed);
            self.logger
                .warn(&format!("Message on '{}' names no sender; delivering unverified", topic));
            return;
        }
        let Some(cache) = &self.identities else {
            return;
        };
        match cache.get_or_fetch(sender).await {
            Some(entry) if entry.has_public_key() => {
                self.logger.trace(&format!(
                    "Resolved key for {}: {}",
                    sender.short_id(),
                    entry.public_key_hex()
                ));
            }
            _ => {
                self.stats.identity_misses.fetch_add(1, Ordering::Relaxed);
                self.logger.warn(&format!(
                    "No public key for {}; delivering unverified",
                    sender.short_id()
                ));
            }
        }
    }

    fn dispatch(&self, message: &ChatMessage) {
        for (name, handler) in self.handlers_snapshot() {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler.handle(message)))
                .unwrap_or_else(|payload| {
                    Err(HandlerError::failed(
                        name.as_str(),
                        format!("panicked: {}", panic_reason(payload.as_ref())),
                    ))
                });
            if let Err(err) = outcome {
                self.stats.handler_failures.fetch_add(1, Ordering::Relaxed);
                self.logger
                    .warn(&format!("Handler '{}' failed: {}", name, err));
                if name != BRIDGE_HANDLER {
                    self.notifier
                        .notify_with(format!("Message handler '{}' failed: {}", name, err), &*self.clock);
                }
            }
        }
    }

    /// Publish `text` on a subscribed topic
    ///
    /// The returned message is not added to the local log; it comes back
    /// through the subscription like any other delivery.
    pub async fn publish(&self, topic: &str, text: &str) -> Result<ChatMessage, PublishError> {
        if !self.topics.contains(topic) {
            self.logger
                .debug(&format!("Refusing to publish on unsubscribed topic '{}'", topic));
            return Err(PublishError::NotSubscribed(topic.to_string()));
        }
        self.transport
            .publish(topic, text.as_bytes().to_vec())
            .await?;
        Ok(ChatMessage::new(
            text.to_string(),
            self.local_peer_id.clone(),
            self.nickname.clone(),
            topic.to_string(),
            self.clock.now(),
        ))
    }
}

#[async_trait::async_trait]
impl MessageSink for MessageRouter {
    async fn deliver(&self, message: RawMessage) {
        // decode failures are already logged and counted by `route`
        let _ = self.route(message).await;
    }
}

impl std::fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRouter")
            .field("local_peer_id", &self.local_peer_id)
            .field("nickname", &self.nickname)
            .field("handlers", &self.handler_names())
            .field("stats", &self.stats())
            .finish()
    }
}
