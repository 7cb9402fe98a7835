//! Per-topic message log with unread tracking
//!
//! Each topic's messages and its unread counter live in one map entry, so an
//! append or a mark-read on a topic is observed atomically. Different topics
//! never contend on the same entry.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use meshchat_core::{ChatMessage, StoredMessage};

#[derive(Debug, Default)]
struct TopicLog {
    messages: Vec<StoredMessage>,
    unread: usize,
}

/// Overview of one topic's log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicSummary {
    pub name: String,
    pub total: usize,
    pub unread: usize,
}

/// In-memory, append-only message log keyed by topic
#[derive(Debug, Default)]
pub struct MessageStore {
    logs: DashMap<String, TopicLog>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append to the message's topic log, returning the topic's unread count
    pub fn append(&self, message: ChatMessage, read: bool) -> usize {
        let mut log = self.logs.entry(message.topic().to_string()).or_default();
        if !read {
            log.unread += 1;
        }
        log.messages.push(StoredMessage::new(message, read));
        log.unread
    }

    /// Messages on `topic` in arrival order
    pub fn messages(&self, topic: &str) -> Vec<StoredMessage> {
        self.logs
            .get(topic)
            .map(|log| log.messages.clone())
            .unwrap_or_default()
    }

    pub fn len(&self, topic: &str) -> usize {
        self.logs.get(topic).map(|log| log.messages.len()).unwrap_or(0)
    }

    pub fn unread_count(&self, topic: &str) -> usize {
        self.logs.get(topic).map(|log| log.unread).unwrap_or(0)
    }

    pub fn total_unread(&self) -> usize {
        self.logs.iter().map(|log| log.unread).sum()
    }

    /// Mark every message on `topic` read; returns how many flipped
    ///
    /// Idempotent, and a no-op for topics with no log.
    pub fn mark_topic_read(&self, topic: &str) -> usize {
        let Some(mut log) = self.logs.get_mut(topic) else {
            return 0;
        };
        let mut flipped = 0;
        for stored in log.messages.iter_mut().filter(|stored| !stored.read) {
            stored.read = true;
            flipped += 1;
        }
        log.unread = 0;
        flipped
    }

    /// Every topic with a log, sorted by name
    pub fn topics(&self) -> Vec<TopicSummary> {
        let mut topics: Vec<TopicSummary> = self
            .logs
            .iter()
            .map(|entry| TopicSummary {
                name: entry.key().clone(),
                total: entry.messages.len(),
                unread: entry.unread,
            })
            .collect();
        topics.sort_by(|a, b| a.name.cmp(&b.name));
        topics
    }
}
