//! Bridge Payload Types
//!
//! Everything that crosses between the network context and the consumer
//! context is one of these tagged unions. The serde representation matches
//! the JSON records consumers have always exchanged with the peer.

use serde::{Deserialize, Serialize};

use crate::message::ChatMessage;
use crate::types::Timestamp;

// ----------------------------------------------------------------------------
// Inbound: Network → Consumer
// ----------------------------------------------------------------------------

/// A chat message delivered to the consumer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatEvent {
    pub message: String,
    pub sender_nick: String,
    pub sender_id: String,
    /// Seconds since the Unix epoch
    pub timestamp: f64,
    pub topic: String,
    pub read: bool,
}

impl ChatEvent {
    pub fn from_message(message: &ChatMessage, read: bool) -> Self {
        Self {
            message: message.text().to_string(),
            sender_nick: message.sender_nickname().to_string(),
            sender_id: message.sender_peer_id().to_string(),
            timestamp: message.timestamp().as_unix_secs_f64(),
            topic: message.topic().to_string(),
            read,
        }
    }
}

/// A status or diagnostic line for the consumer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemEvent {
    pub message: String,
    /// Seconds since the Unix epoch
    pub timestamp: f64,
}

impl SystemEvent {
    pub fn new<S: Into<String>>(message: S, at: Timestamp) -> Self {
        Self {
            message: message.into(),
            timestamp: at.as_unix_secs_f64(),
        }
    }
}

/// Events flowing from the network context to the consumer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum InboundEvent {
    #[serde(rename = "chat_message")]
    Chat(ChatEvent),
    #[serde(rename = "system_message")]
    System(SystemEvent),
}

impl InboundEvent {
    pub fn is_chat(&self) -> bool {
        matches!(self, InboundEvent::Chat(_))
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

impl From<ChatEvent> for InboundEvent {
    fn from(event: ChatEvent) -> Self {
        InboundEvent::Chat(event)
    }
}

impl From<SystemEvent> for InboundEvent {
    fn from(event: SystemEvent) -> Self {
        InboundEvent::System(event)
    }
}

// ----------------------------------------------------------------------------
// Outbound: Consumer → Network
// ----------------------------------------------------------------------------

/// Commands the consumer issues to the network context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum OutboundCommand {
    /// Publish text; `None` targets the default topic
    Send {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        topic: Option<String>,
    },
    /// Join a topic
    Subscribe { topic: String },
    /// Dial a peer by multiaddress string
    ConnectPeer(String),
    /// Mark every stored message on a topic as read
    MarkTopicRead { topic: String },
}
