//! Channel Utilities
//!
//! Bounded tokio channels for each bridge payload, plus `EventOutlet`, a
//! shareable sender that can be closed once for every clone.

use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::channel::communication::{ChatEvent, OutboundCommand, SystemEvent};
use crate::config::ChannelConfig;
use crate::errors::ChannelError;

pub type ChatEventSender = mpsc::Sender<ChatEvent>;
pub type ChatEventReceiver = mpsc::Receiver<ChatEvent>;
pub type SystemEventSender = mpsc::Sender<SystemEvent>;
pub type SystemEventReceiver = mpsc::Receiver<SystemEvent>;
pub type CommandSender = mpsc::Sender<OutboundCommand>;
pub type CommandReceiver = mpsc::Receiver<OutboundCommand>;

// ----------------------------------------------------------------------------
// Channel Creation Utilities
// ----------------------------------------------------------------------------

/// Create bounded chat event channel (Network → Consumer)
pub fn create_chat_channel(config: &ChannelConfig) -> (ChatEventSender, ChatEventReceiver) {
    mpsc::channel(config.chat_buffer_size)
}

/// Create bounded system event channel (Network → Consumer)
pub fn create_system_channel(config: &ChannelConfig) -> (SystemEventSender, SystemEventReceiver) {
    mpsc::channel(config.system_buffer_size)
}

/// Create bounded command channel (Consumer → Network)
pub fn create_command_channel(config: &ChannelConfig) -> (CommandSender, CommandReceiver) {
    mpsc::channel(config.command_buffer_size)
}

fn map_try_send<T>(err: TrySendError<T>) -> ChannelError {
    match err {
        TrySendError::Full(_) => ChannelError::ChannelFull,
        TrySendError::Closed(_) => ChannelError::ChannelClosed,
    }
}

// ----------------------------------------------------------------------------
// Non-blocking Send Utilities
// ----------------------------------------------------------------------------

/// Send without waiting; a full queue is reported, never awaited
pub trait NonBlockingSend<T> {
    fn try_send_non_blocking(&self, message: T) -> Result<(), ChannelError>;
}

impl<T> NonBlockingSend<T> for mpsc::Sender<T> {
    fn try_send_non_blocking(&self, message: T) -> Result<(), ChannelError> {
        self.try_send(message).map_err(map_try_send)
    }
}

// ----------------------------------------------------------------------------
// Closable Outlet
// ----------------------------------------------------------------------------

/// Network-side sender shared by every producer of one bridge channel
///
/// Closing the outlet drops the only underlying sender, so the consumer sees
/// the channel disconnect once it has drained what was already queued.
#[derive(Debug)]
pub struct EventOutlet<T> {
    inner: Arc<Mutex<Option<mpsc::Sender<T>>>>,
}

impl<T> Clone for EventOutlet<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> EventOutlet<T> {
    pub fn new(sender: mpsc::Sender<T>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(sender))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<mpsc::Sender<T>>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn close(&self) {
        self.lock().take();
    }

    pub fn is_closed(&self) -> bool {
        match self.lock().as_ref() {
            Some(sender) => sender.is_closed(),
            None => true,
        }
    }

    /// Fraction of the buffer currently occupied
    pub fn utilization(&self) -> Option<f32> {
        self.lock().as_ref().map(|sender| {
            let max = sender.max_capacity();
            if max == 0 {
                0.0
            } else {
                (max - sender.capacity()) as f32 / max as f32
            }
        })
    }
}

impl<T> NonBlockingSend<T> for EventOutlet<T> {
    fn try_send_non_blocking(&self, message: T) -> Result<(), ChannelError> {
        match self.lock().as_ref() {
            Some(sender) => sender.try_send(message).map_err(map_try_send),
            None => Err(ChannelError::ChannelClosed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Timestamp;

    #[test]
    fn test_full_channel_reports_channel_full() {
        let config = ChannelConfig {
            command_buffer_size: 1,
            ..ChannelConfig::testing()
        };
        let (tx, _rx) = create_command_channel(&config);
        let cmd = OutboundCommand::Subscribe { topic: "a".into() };
        assert!(tx.try_send_non_blocking(cmd.clone()).is_ok());
        assert_eq!(tx.try_send_non_blocking(cmd), Err(ChannelError::ChannelFull));
    }

    #[test]
    fn test_closed_outlet_rejects_sends_for_all_clones() {
        let (tx, mut rx) = create_system_channel(&ChannelConfig::testing());
        let outlet = EventOutlet::new(tx);
        let clone = outlet.clone();

        clone
            .try_send_non_blocking(SystemEvent::new("before", Timestamp::from_secs(1)))
            .unwrap();
        outlet.close();

        assert!(clone.is_closed());
        assert_eq!(
            clone.try_send_non_blocking(SystemEvent::new("after", Timestamp::from_secs(2))),
            Err(ChannelError::ChannelClosed)
        );
        assert_eq!(rx.try_recv().unwrap().message, "before");
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn test_outlet_utilization() {
        let config = ChannelConfig {
            system_buffer_size: 4,
            ..ChannelConfig::testing()
        };
        let (tx, _rx) = create_system_channel(&config);
        let outlet = EventOutlet::new(tx);
        assert_eq!(outlet.utilization(), Some(0.0));
        outlet
            .try_send_non_blocking(SystemEvent::new("x", Timestamp::from_secs(1)))
            .unwrap();
        assert_eq!(outlet.utilization(), Some(0.25));
        outlet.close();
        assert_eq!(outlet.utilization(), None);
    }
}
