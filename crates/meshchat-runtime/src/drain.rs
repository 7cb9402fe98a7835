//! Outbound command drain
//!
//! Polls the consumer's command queue on a fixed interval, executing every
//! queued command in order before sleeping again. Outcomes the consumer
//! should see are reported as system events.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TryRecvError;

use meshchat_core::channel::CommandReceiver;
use meshchat_core::{
    Multiaddr, OutboundCommand, PublishError, SubscribeError, SystemNotifier, TaskId, TaskLogger,
    Transport,
};

use crate::maintainer::dial;
use crate::registry::RegistryHandle;
use crate::router::MessageRouter;
use crate::shutdown::ShutdownSignal;

/// Dial `addr` on behalf of the consumer and report the outcome
pub async fn connect_and_report(
    transport: &dyn Transport,
    addr: &str,
    timeout: Duration,
    notifier: &SystemNotifier,
    logger: &TaskLogger,
) -> bool {
    let target = match addr.parse::<Multiaddr>() {
        Ok(target) => target,
        Err(err) => {
            logger.warn(&format!("Rejected peer address {}: {}", addr, err));
            notifier.notify(format!("Failed to connect to {}: {}", addr, err));
            return false;
        }
    };
    match dial(transport, &target, timeout).await {
        Ok(()) => {
            let who = target
                .peer_id()
                .map(|peer| peer.short_id())
                .unwrap_or_else(|| addr.to_string());
            logger.info(&format!("Connected to {}", addr));
            notifier.notify(format!("Connected to peer: {}", who));
            true
        }
        Err(err) => {
            logger.warn(&format!("Dial to {} failed: {}", addr, err));
            notifier.notify(format!("Failed to connect to {}: {}", addr, err));
            false
        }
    }
}

pub struct CommandDrain {
    commands: CommandReceiver,
    router: Arc<MessageRouter>,
    registry: RegistryHandle,
    transport: Arc<dyn Transport>,
    notifier: SystemNotifier,
    default_topic: String,
    interval: Duration,
    dial_timeout: Duration,
    logger: TaskLogger,
}

impl CommandDrain {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        commands: CommandReceiver,
        router: Arc<MessageRouter>,
        registry: RegistryHandle,
        transport: Arc<dyn Transport>,
        notifier: SystemNotifier,
        default_topic: String,
        interval: Duration,
        dial_timeout: Duration,
        logger: TaskLogger,
    ) -> Self {
        Self {
            commands,
            router,
            registry,
            transport,
            notifier,
            default_topic,
            interval,
            dial_timeout,
            logger,
        }
    }

    /// Execute everything currently queued; returns how many ran
    ///
    /// `None` once the consumer has dropped its end.
    pub async fn drain_once(&mut self) -> Option<usize> {
        let mut executed = 0;
        loop {
            match self.commands.try_recv() {
                Ok(command) => {
                    self.logger.log_receive(TaskId::Consumer, &command);
                    self.execute(command).await;
                    executed += 1;
                }
                Err(TryRecvError::Empty) => return Some(executed),
                Err(TryRecvError::Disconnected) => return None,
            }
        }
    }

    pub async fn execute(&self, command: OutboundCommand) {
        match command {
            OutboundCommand::Send { message, topic } => {
                let topic = topic.unwrap_or_else(|| self.default_topic.clone());
                match self.router.publish(&topic, &message).await {
                    Ok(sent) => self.logger.debug(&format!(
                        "Published {} bytes on '{}'",
                        sent.text().len(),
                        sent.topic()
                    )),
                    Err(PublishError::NotSubscribed(topic)) => {
                        self.notifier.notify(format!(
                            "Cannot send message: not subscribed to topic '{}'",
                            topic
                        ));
                    }
                    Err(err) => {
                        self.logger.warn(&format!("Publish on '{}' failed: {}", topic, err));
                        self.notifier
                            .notify(format!("Failed to send message: {}", err));
                    }
                }
            }
            OutboundCommand::Subscribe { topic } => match self.registry.subscribe(topic.as_str()).await {
                Ok(()) => {
                    self.notifier.notify(format!("Subscribed to topic: {}", topic));
                }
                Err(SubscribeError::AlreadySubscribed(_)) => {
                    self.notifier
                        .notify(format!("Already subscribed to topic: {}", topic));
                }
                Err(err) => {
                    self.notifier
                        .notify(format!("Failed to subscribe to {}: {}", topic, err));
                }
            },
            OutboundCommand::ConnectPeer(addr) => {
                connect_and_report(
                    self.transport.as_ref(),
                    &addr,
                    self.dial_timeout,
                    &self.notifier,
                    &self.logger,
                )
                .await;
            }
            OutboundCommand::MarkTopicRead { topic } => {
                let flipped = self.router.store().mark_topic_read(&topic);
                self.logger
                    .debug(&format!("Marked {} messages read on '{}'", flipped, topic));
            }
        }
    }

    pub async fn run(mut self, mut shutdown: ShutdownSignal) {
        self.logger.debug("Command drain started");
        loop {
            if shutdown.is_triggered() {
                break;
            }
            if self.drain_once().await.is_none() {
                self.logger.info("Consumer dropped its command sender");
                break;
            }
            if !shutdown.sleep(self.interval).await {
                break;
            }
        }
        self.commands.close();
        let abandoned = std::iter::from_fn(|| self.commands.try_recv().ok()).count();
        if abandoned > 0 {
            self.logger
                .warn(&format!("Discarded {} queued commands at shutdown", abandoned));
        }
        self.logger.debug("Command drain stopped");
    }
}

impl std::fmt::Debug for CommandDrain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandDrain")
            .field("default_topic", &self.default_topic)
            .field("interval", &self.interval)
            .finish()
    }
}
