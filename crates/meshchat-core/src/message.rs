//! Chat message model
//!
//! `RawMessage` is what the transport hands us; `ChatMessage` is the
//! validated, enriched form the router builds from it; `StoredMessage` is a
//! chat message as kept in a topic's log.

use serde::{Deserialize, Serialize};

use crate::types::{PeerId, Timestamp};

// ----------------------------------------------------------------------------
// Transport Envelope
// ----------------------------------------------------------------------------

/// A message as delivered by a pubsub subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub topic: String,
    pub data: Vec<u8>,
    /// Originating peer, when the envelope names one
    pub source: Option<PeerId>,
    /// Public key embedded in the envelope, when the sender signed with one
    pub public_key: Option<Vec<u8>>,
}

impl RawMessage {
    pub fn new<T: Into<String>>(topic: T, data: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            data,
            source: None,
            public_key: None,
        }
    }

    pub fn with_source(mut self, source: PeerId) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_public_key(mut self, key: Vec<u8>) -> Self {
        self.public_key = Some(key);
        self
    }
}

// ----------------------------------------------------------------------------
// Chat Messages
// ----------------------------------------------------------------------------

/// A validated chat message. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    text: String,
    sender_peer_id: PeerId,
    sender_nickname: String,
    topic: String,
    timestamp: Timestamp,
}

impl ChatMessage {
    pub fn new(
        text: String,
        sender_peer_id: PeerId,
        sender_nickname: String,
        topic: String,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            text,
            sender_peer_id,
            sender_nickname,
            topic,
            timestamp,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn sender_peer_id(&self) -> &PeerId {
        &self.sender_peer_id
    }

    pub fn sender_nickname(&self) -> &str {
        &self.sender_nickname
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn timestamp_unix(&self) -> u64 {
        self.timestamp.as_unix_secs()
    }
}

/// A chat message held in a topic's log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub message: ChatMessage,
    pub read: bool,
}

impl StoredMessage {
    pub fn new(message: ChatMessage, read: bool) -> Self {
        Self { message, read }
    }

    pub fn text(&self) -> &str {
        self.message.text()
    }

    pub fn topic(&self) -> &str {
        self.message.topic()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_message_accessors() {
        let msg = ChatMessage::new(
            "hello".to_string(),
            PeerId::new("QmPeer12345678"),
            "12345678".to_string(),
            "general".to_string(),
            Timestamp::from_secs(1_700_000_000),
        );
        assert_eq!(msg.text(), "hello");
        assert_eq!(msg.topic(), "general");
        assert_eq!(msg.timestamp_unix(), 1_700_000_000);

        let stored = StoredMessage::new(msg, false);
        assert_eq!(stored.text(), "hello");
        assert!(!stored.read);
    }

    #[test]
    fn test_raw_message_builders() {
        let raw = RawMessage::new("general", b"hi".to_vec())
            .with_source(PeerId::new("QmSender"))
            .with_public_key(vec![1, 2, 3]);
        assert_eq!(raw.source, Some(PeerId::new("QmSender")));
        assert_eq!(raw.public_key.as_deref(), Some(&[1u8, 2, 3][..]));
    }
}
