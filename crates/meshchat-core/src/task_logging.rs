//! Task Communication Logging
//!
//! Every long-running component receives a `TaskLogger` in its constructor
//! instead of reaching for a global logger. The logger knows which task it
//! speaks for, filters by level, and provides the `tracing` span that the
//! component's spawned futures are instrumented with.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::channel::{ChatEvent, InboundEvent, OutboundCommand};

// ----------------------------------------------------------------------------
// Log Event Types
// ----------------------------------------------------------------------------

/// Log levels for task events
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "TRACE"),
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// Identifiers of the tasks that make up a running peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskId {
    Orchestrator,
    TopicRegistry,
    TopicConsumer,
    Router,
    IdentityCache,
    Maintainer,
    CommandDrain,
    Discovery,
    Consumer,
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskId::Orchestrator => "Orchestrator",
            TaskId::TopicRegistry => "TopicRegistry",
            TaskId::TopicConsumer => "TopicConsumer",
            TaskId::Router => "Router",
            TaskId::IdentityCache => "IdentityCache",
            TaskId::Maintainer => "Maintainer",
            TaskId::CommandDrain => "CommandDrain",
            TaskId::Discovery => "Discovery",
            TaskId::Consumer => "Consumer",
        };
        f.write_str(name)
    }
}

/// Direction of a bridge message relative to the logging task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Send,
    Receive,
    Drop,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Send => write!(f, "→"),
            Direction::Receive => write!(f, "←"),
            Direction::Drop => write!(f, "✗"),
        }
    }
}

// ----------------------------------------------------------------------------
// Message Summaries
// ----------------------------------------------------------------------------

/// Short, log-safe description of a bridge payload
pub trait MessageSummary {
    fn kind(&self) -> &'static str;
    fn summary(&self) -> String;
}

impl MessageSummary for ChatEvent {
    fn kind(&self) -> &'static str {
        "Chat"
    }

    fn summary(&self) -> String {
        format!("topic:{} from:{} text:{:.20}", self.topic, self.sender_nick, self.message)
    }
}

impl MessageSummary for InboundEvent {
    fn kind(&self) -> &'static str {
        match self {
            InboundEvent::Chat(chat) => chat.kind(),
            InboundEvent::System(_) => "System",
        }
    }

    fn summary(&self) -> String {
        match self {
            InboundEvent::Chat(chat) => chat.summary(),
            InboundEvent::System(system) => format!("{:.40}", system.message),
        }
    }
}

impl MessageSummary for OutboundCommand {
    fn kind(&self) -> &'static str {
        match self {
            OutboundCommand::Send { .. } => "Send",
            OutboundCommand::Subscribe { .. } => "Subscribe",
            OutboundCommand::ConnectPeer(_) => "ConnectPeer",
            OutboundCommand::MarkTopicRead { .. } => "MarkTopicRead",
        }
    }

    fn summary(&self) -> String {
        match self {
            OutboundCommand::Send { message, topic } => {
                format!("topic:{} text:{:.20}", topic.as_deref().unwrap_or("<default>"), message)
            }
            OutboundCommand::Subscribe { topic } => format!("topic:{}", topic),
            OutboundCommand::ConnectPeer(addr) => format!("addr:{}", addr),
            OutboundCommand::MarkTopicRead { topic } => format!("topic:{}", topic),
        }
    }
}

// ----------------------------------------------------------------------------
// Logger
// ----------------------------------------------------------------------------

/// Logging context handed to each component
#[derive(Debug, Clone)]
pub struct TaskLogger {
    task: TaskId,
    min_level: LogLevel,
    enabled: bool,
    span: tracing::Span,
}

impl TaskLogger {
    pub fn new(task: TaskId) -> Self {
        Self {
            task,
            min_level: LogLevel::Debug,
            enabled: true,
            span: tracing::info_span!("meshchat", task = %task),
        }
    }

    /// Logger that discards everything
    pub fn disabled() -> Self {
        Self {
            task: TaskId::Orchestrator,
            min_level: LogLevel::Error,
            enabled: false,
            span: tracing::Span::none(),
        }
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    /// Derive the context for a child task, keeping level and enablement
    pub fn for_task(&self, task: TaskId) -> Self {
        let span = if self.enabled {
            tracing::info_span!(parent: &self.span, "task", task = %task)
        } else {
            tracing::Span::none()
        };
        Self {
            task,
            min_level: self.min_level,
            enabled: self.enabled,
            span,
        }
    }

    pub fn task(&self) -> TaskId {
        self.task
    }

    /// Span to instrument this task's futures with
    pub fn span(&self) -> tracing::Span {
        self.span.clone()
    }

    pub fn should_log(&self, level: LogLevel) -> bool {
        self.enabled && level >= self.min_level
    }

    pub fn log_task_event(&self, level: LogLevel, message: &str) {
        if !self.should_log(level) {
            return;
        }
        let task = self.task;
        match level {
            LogLevel::Trace => tracing::trace!(%task, "{}", message),
            LogLevel::Debug => tracing::debug!(%task, "{}", message),
            LogLevel::Info => tracing::info!(%task, "{}", message),
            LogLevel::Warn => tracing::warn!(%task, "{}", message),
            LogLevel::Error => tracing::error!(%task, "{}", message),
        }
    }

    pub fn trace(&self, message: &str) {
        self.log_task_event(LogLevel::Trace, message);
    }

    pub fn debug(&self, message: &str) {
        self.log_task_event(LogLevel::Debug, message);
    }

    pub fn info(&self, message: &str) {
        self.log_task_event(LogLevel::Info, message);
    }

    pub fn warn(&self, message: &str) {
        self.log_task_event(LogLevel::Warn, message);
    }

    pub fn error(&self, message: &str) {
        self.log_task_event(LogLevel::Error, message);
    }

    pub fn log_send<T: MessageSummary>(&self, to: TaskId, message: &T) {
        self.log_comm(Direction::Send, to, message, None);
    }

    pub fn log_receive<T: MessageSummary>(&self, from: TaskId, message: &T) {
        self.log_comm(Direction::Receive, from, message, None);
    }

    pub fn log_drop<T: MessageSummary>(&self, to: TaskId, message: &T, reason: &str) {
        self.log_comm(Direction::Drop, to, message, Some(reason));
    }

    fn log_comm<T: MessageSummary>(
        &self,
        direction: Direction,
        peer_task: TaskId,
        message: &T,
        reason: Option<&str>,
    ) {
        let level = match direction {
            Direction::Drop => LogLevel::Warn,
            _ => LogLevel::Trace,
        };
        if !self.should_log(level) {
            return;
        }
        let line = match reason {
            Some(reason) => format!(
                "{} {} {} {} {} reason:{}",
                self.task,
                direction,
                peer_task,
                message.kind(),
                message.summary(),
                reason
            ),
            None => format!(
                "{} {} {} {} {}",
                self.task,
                direction,
                peer_task,
                message.kind(),
                message.summary()
            ),
        };
        self.log_task_event(level, &line);
    }
}

impl Default for TaskLogger {
    fn default() -> Self {
        Self::new(TaskId::Orchestrator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::SystemEvent;
    use crate::Timestamp;

    #[test]
    fn test_task_id_display() {
        assert_eq!(TaskId::TopicRegistry.to_string(), "TopicRegistry");
        assert_eq!(TaskId::CommandDrain.to_string(), "CommandDrain");
    }

    #[test]
    fn test_level_filtering() {
        let logger = TaskLogger::new(TaskId::Router).with_level(LogLevel::Warn);
        assert!(!logger.should_log(LogLevel::Debug));
        assert!(!logger.should_log(LogLevel::Info));
        assert!(logger.should_log(LogLevel::Warn));
        assert!(logger.should_log(LogLevel::Error));

        let disabled = TaskLogger::disabled();
        assert!(!disabled.should_log(LogLevel::Error));
    }

    #[test]
    fn test_child_logger_keeps_settings() {
        let parent = TaskLogger::new(TaskId::Orchestrator).with_level(LogLevel::Info);
        let child = parent.for_task(TaskId::Maintainer);
        assert_eq!(child.task(), TaskId::Maintainer);
        assert!(child.should_log(LogLevel::Info));
        assert!(!child.should_log(LogLevel::Debug));
        assert!(!TaskLogger::disabled().for_task(TaskId::Router).should_log(LogLevel::Error));
    }

    #[test]
    fn test_message_summaries() {
        let command = OutboundCommand::Send {
            message: "hello there".to_string(),
            topic: None,
        };
        assert_eq!(command.kind(), "Send");
        assert!(command.summary().contains("<default>"));

        let event = InboundEvent::System(SystemEvent::new("Joined", Timestamp::from_secs(1)));
        assert_eq!(event.kind(), "System");
        assert_eq!(event.summary(), "Joined");
    }
}
