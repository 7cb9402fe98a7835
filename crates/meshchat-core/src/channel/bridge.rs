//! Cross-Context Bridge
//!
//! The only crossing point between the network context and the consumer
//! context. `create_bridge` returns both ends: the network end is split up
//! among the runtime's tasks, the consumer end is moved to the UI or CLI
//! thread. Every operation on the consumer end is non-blocking unless its
//! name says otherwise.

use tokio::sync::mpsc::error::TryRecvError;

use crate::channel::communication::{ChatEvent, InboundEvent, OutboundCommand, SystemEvent};
use crate::channel::utils::{
    create_chat_channel, create_command_channel, create_system_channel, ChatEventReceiver,
    CommandReceiver, CommandSender, EventOutlet, NonBlockingSend, SystemEventReceiver,
};
use crate::config::ChannelConfig;
use crate::errors::ChannelError;
use crate::types::{TimeSource, Timestamp};

/// Create both ends of the bridge
pub fn create_bridge(config: &ChannelConfig) -> (NetworkBridge, ConsumerBridge) {
    let (chat_tx, chat_rx) = create_chat_channel(config);
    let (system_tx, system_rx) = create_system_channel(config);
    let (command_tx, command_rx) = create_command_channel(config);

    let network = NetworkBridge {
        chat: EventOutlet::new(chat_tx),
        system: SystemNotifier::new(EventOutlet::new(system_tx)),
        commands: command_rx,
    };
    let consumer = ConsumerBridge {
        chat: chat_rx,
        system: system_rx,
        commands: command_tx,
    };
    (network, consumer)
}

// ----------------------------------------------------------------------------
// Network End
// ----------------------------------------------------------------------------

/// Network-side ends of the three bridge channels
#[derive(Debug)]
pub struct NetworkBridge {
    pub chat: EventOutlet<ChatEvent>,
    pub system: SystemNotifier,
    pub commands: CommandReceiver,
}

impl NetworkBridge {
    pub fn into_parts(self) -> (EventOutlet<ChatEvent>, SystemNotifier, CommandReceiver) {
        (self.chat, self.system, self.commands)
    }
}

/// Reports local failures and status lines to the consumer
///
/// A full or closed system channel never fails the caller; the event is
/// dropped and `notify` returns false.
#[derive(Debug, Clone)]
pub struct SystemNotifier {
    outlet: EventOutlet<SystemEvent>,
}

impl SystemNotifier {
    pub fn new(outlet: EventOutlet<SystemEvent>) -> Self {
        Self { outlet }
    }

    /// Notifier whose channel is already closed
    pub fn detached() -> Self {
        let (tx, _) = tokio::sync::mpsc::channel(1);
        let outlet = EventOutlet::new(tx);
        outlet.close();
        Self { outlet }
    }

    pub fn notify_at<S: Into<String>>(&self, message: S, at: Timestamp) -> bool {
        let message = message.into();
        match self.outlet.try_send_non_blocking(SystemEvent::new(message.as_str(), at)) {
            Ok(()) => true,
            Err(err) => {
                tracing::debug!("system event dropped ({}): {}", err, message);
                false
            }
        }
    }

    pub fn notify<S: Into<String>>(&self, message: S) -> bool {
        self.notify_at(message, Timestamp::now())
    }

    pub fn notify_with<S: Into<String>, T: TimeSource + ?Sized>(&self, message: S, clock: &T) -> bool {
        self.notify_at(message, clock.now())
    }

    pub fn close(&self) {
        self.outlet.close();
    }

    pub fn is_closed(&self) -> bool {
        self.outlet.is_closed()
    }
}

// ----------------------------------------------------------------------------
// Consumer End
// ----------------------------------------------------------------------------

/// Consumer-side ends of the bridge
#[derive(Debug)]
pub struct ConsumerBridge {
    chat: ChatEventReceiver,
    system: SystemEventReceiver,
    commands: CommandSender,
}

impl ConsumerBridge {
    /// Queue a command for the network context
    pub fn send_command(&self, command: OutboundCommand) -> Result<(), ChannelError> {
        self.commands.try_send_non_blocking(command)
    }

    /// Publish text on `topic`, or on the default topic when `None`
    pub fn send_message<S: Into<String>>(&self, message: S, topic: Option<String>) -> Result<(), ChannelError> {
        self.send_command(OutboundCommand::Send {
            message: message.into(),
            topic,
        })
    }

    pub fn subscribe<S: Into<String>>(&self, topic: S) -> Result<(), ChannelError> {
        self.send_command(OutboundCommand::Subscribe { topic: topic.into() })
    }

    pub fn connect_peer<S: Into<String>>(&self, addr: S) -> Result<(), ChannelError> {
        self.send_command(OutboundCommand::ConnectPeer(addr.into()))
    }

    pub fn mark_topic_read<S: Into<String>>(&self, topic: S) -> Result<(), ChannelError> {
        self.send_command(OutboundCommand::MarkTopicRead { topic: topic.into() })
    }

    /// Take one pending event without waiting
    ///
    /// System events are preferred over chat events when both are queued.
    /// `Ok(None)` means nothing is pending; `Err(ChannelClosed)` means the
    /// network side has shut down and everything queued has been drained.
    pub fn try_recv_event(&mut self) -> Result<Option<InboundEvent>, ChannelError> {
        let system_closed = match self.system.try_recv() {
            Ok(event) => return Ok(Some(InboundEvent::System(event))),
            Err(TryRecvError::Empty) => false,
            Err(TryRecvError::Disconnected) => true,
        };
        match self.chat.try_recv() {
            Ok(event) => Ok(Some(InboundEvent::Chat(event))),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) if system_closed => Err(ChannelError::ChannelClosed),
            Err(TryRecvError::Disconnected) => Ok(None),
        }
    }

    /// Drain everything currently queued
    pub fn poll_events(&mut self) -> Vec<InboundEvent> {
        let mut events = Vec::new();
        while let Ok(Some(event)) = self.try_recv_event() {
            events.push(event);
        }
        events
    }

    /// Wait for the next event; `None` once both inbound channels are closed
    pub async fn recv_event(&mut self) -> Option<InboundEvent> {
        let mut system_open = true;
        let mut chat_open = true;
        while system_open || chat_open {
            tokio::select! {
                biased;
                event = self.system.recv(), if system_open => match event {
                    Some(event) => return Some(InboundEvent::System(event)),
                    None => system_open = false,
                },
                event = self.chat.recv(), if chat_open => match event {
                    Some(event) => return Some(InboundEvent::Chat(event)),
                    None => chat_open = false,
                },
            }
        }
        None
    }

    /// Blocking variant of `recv_event` for threads outside the runtime
    ///
    /// Must not be called from within an async execution context.
    pub fn blocking_recv_event(&mut self) -> Option<InboundEvent> {
        futures::executor::block_on(self.recv_event())
    }

    /// Whether the network side has stopped accepting commands
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_queue_is_not_an_error() {
        let (_network, mut consumer) = create_bridge(&ChannelConfig::testing());
        assert_eq!(consumer.try_recv_event(), Ok(None));
        assert!(consumer.poll_events().is_empty());
    }

    #[test]
    fn test_system_events_are_drained_first() {
        let (network, mut consumer) = create_bridge(&ChannelConfig::testing());
        let chat = ChatEvent {
            message: "hi".into(),
            sender_nick: "peer".into(),
            sender_id: "QmPeer".into(),
            timestamp: 1.0,
            topic: "general".into(),
            read: false,
        };
        network.chat.try_send_non_blocking(chat).unwrap();
        assert!(network.system.notify_at("status", Timestamp::from_secs(1)));

        let events = consumer.poll_events();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], InboundEvent::System(_)));
        assert!(events[1].is_chat());
    }

    #[test]
    fn test_commands_cross_in_order() {
        let (mut network, consumer) = create_bridge(&ChannelConfig::testing());
        consumer.send_message("one", None).unwrap();
        consumer.subscribe("rust").unwrap();
        consumer.connect_peer("/ip4/127.0.0.1/tcp/9095").unwrap();

        assert!(matches!(network.commands.try_recv(), Ok(OutboundCommand::Send { .. })));
        assert!(matches!(network.commands.try_recv(), Ok(OutboundCommand::Subscribe { .. })));
        assert!(matches!(network.commands.try_recv(), Ok(OutboundCommand::ConnectPeer(_))));
    }

    #[test]
    fn test_sends_fail_after_network_side_closes() {
        let (network, mut consumer) = create_bridge(&ChannelConfig::testing());
        let (chat, system, mut commands) = network.into_parts();

        assert!(system.notify_at("last words", Timestamp::from_secs(5)));
        commands.close();
        chat.close();
        system.close();

        assert_eq!(consumer.send_message("late", None), Err(ChannelError::ChannelClosed));
        assert!(consumer.is_closed());
        assert!(!system.notify("dropped"));

        assert!(matches!(consumer.try_recv_event(), Ok(Some(InboundEvent::System(_)))));
        assert_eq!(consumer.try_recv_event(), Err(ChannelError::ChannelClosed));
    }

    #[test]
    fn test_blocking_recv_returns_none_after_close() {
        let (network, mut consumer) = create_bridge(&ChannelConfig::testing());
        let handle = std::thread::spawn(move || consumer.blocking_recv_event());
        network.system.notify("ready");
        let first = handle.join().unwrap();
        assert!(matches!(first, Some(InboundEvent::System(ref e)) if e.message == "ready"));

        let (network, mut consumer) = create_bridge(&ChannelConfig::testing());
        network.chat.close();
        network.system.close();
        assert_eq!(consumer.blocking_recv_event(), None);
    }
}
