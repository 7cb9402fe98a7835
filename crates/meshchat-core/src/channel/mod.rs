//! Channel Module
//!
//! Bridge infrastructure between the network context and the consumer:
//! - `communication`: tagged payload types carried by the bridge
//! - `utils`: channel constructors and non-blocking send helpers
//! - `bridge`: the two bridge ends handed to each context

pub mod bridge;
pub mod communication;
pub mod utils;

pub use bridge::{create_bridge, ConsumerBridge, NetworkBridge, SystemNotifier};
pub use communication::{ChatEvent, InboundEvent, OutboundCommand, SystemEvent};
pub use utils::{
    create_chat_channel, create_command_channel, create_system_channel, ChatEventReceiver,
    ChatEventSender, CommandReceiver, CommandSender, EventOutlet, NonBlockingSend,
    SystemEventReceiver, SystemEventSender,
};

pub use crate::config::ChannelConfig;
