//! Centralized Configuration Management
//!
//! All tunables of the peer live here so a single TOML document can describe
//! a node. Every struct has production defaults and a `testing()` preset with
//! short intervals.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::errors::ConfigError;

/// Default chat topic joined at startup
pub const DEFAULT_CHAT_TOPIC: &str = "universal-connectivity";
/// Topic used for peer announcements
pub const DEFAULT_DISCOVERY_TOPIC: &str = "universal-connectivity-browser-peer-discovery";

// ----------------------------------------------------------------------------
// Channel Configuration
// ----------------------------------------------------------------------------

/// Buffer sizes for the bounded bridge and actor channels
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Chat events (network → consumer)
    pub chat_buffer_size: usize,
    /// System events (network → consumer)
    pub system_buffer_size: usize,
    /// Outbound commands (consumer → network)
    pub command_buffer_size: usize,
    /// Topic registry actor mailbox
    pub registry_buffer_size: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            chat_buffer_size: 256, // chat bursts on busy topics
            system_buffer_size: 128,
            command_buffer_size: 64, // user input is slow
            registry_buffer_size: 32,
        }
    }
}

impl ChannelConfig {
    /// Small buffers so tests can exercise backpressure
    pub fn testing() -> Self {
        Self {
            chat_buffer_size: 16,
            system_buffer_size: 16,
            command_buffer_size: 8,
            registry_buffer_size: 8,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("channels.chat_buffer_size", self.chat_buffer_size),
            ("channels.system_buffer_size", self.system_buffer_size),
            ("channels.command_buffer_size", self.command_buffer_size),
            ("channels.registry_buffer_size", self.registry_buffer_size),
        ] {
            if value == 0 {
                return Err(ConfigError::invalid(field, "buffer size must be non-zero"));
            }
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Identity Cache Configuration
// ----------------------------------------------------------------------------

/// Peer identity cache settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityCacheConfig {
    /// Entries older than this (measured from fetch completion) are refetched
    pub ttl_secs: u64,
    /// Upper bound on a single identify exchange
    pub fetch_timeout_secs: u64,
    /// Largest identify frame accepted
    pub max_frame_len: usize,
    /// Serialize concurrent fetches for the same peer
    pub dedupe_fetches: bool,
}

impl Default for IdentityCacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            fetch_timeout_secs: 10,
            max_frame_len: 64 * 1024,
            dedupe_fetches: true,
        }
    }
}

impl IdentityCacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fetch_timeout_secs == 0 {
            return Err(ConfigError::invalid("identity.fetch_timeout_secs", "must be non-zero"));
        }
        if self.max_frame_len == 0 {
            return Err(ConfigError::invalid("identity.max_frame_len", "must be non-zero"));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Connection Maintainer Configuration
// ----------------------------------------------------------------------------

/// Background dialling policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintainerConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Dial only while fewer than this many peers are connected
    pub target_peers: usize,
    /// Most candidates sampled per cycle
    pub max_candidates: usize,
    pub dial_timeout_secs: u64,
    /// Dials in flight at once within a cycle
    pub max_concurrent_dials: usize,
}

impl Default for MaintainerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 15,
            target_peers: 20,
            max_candidates: 50,
            dial_timeout_secs: 5,
            max_concurrent_dials: 8,
        }
    }
}

impl MaintainerConfig {
    pub fn testing() -> Self {
        Self {
            enabled: false,
            interval_secs: 1,
            dial_timeout_secs: 1,
            ..Self::default()
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_secs == 0 {
            return Err(ConfigError::invalid("maintainer.interval_secs", "must be non-zero"));
        }
        if self.max_candidates == 0 {
            return Err(ConfigError::invalid("maintainer.max_candidates", "must be non-zero"));
        }
        if self.dial_timeout_secs == 0 {
            return Err(ConfigError::invalid("maintainer.dial_timeout_secs", "must be non-zero"));
        }
        if self.max_concurrent_dials == 0 {
            return Err(ConfigError::invalid("maintainer.max_concurrent_dials", "must be non-zero"));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Service Configuration
// ----------------------------------------------------------------------------

/// Top-level configuration of a chat peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Local display name
    pub nickname: String,
    /// Topic joined at startup; failure to join it aborts start
    pub default_topic: String,
    /// Announcement topic joined at startup
    pub discovery_topic: String,
    /// Peers dialled once the service is ready
    pub connect_addrs: Vec<String>,
    /// Outbound command drain interval
    pub drain_interval_ms: u64,
    /// Publish a presence announcement on the discovery topic this often
    pub announce_interval_secs: Option<u64>,
    /// Join topics that connected peers are subscribed to
    pub follow_peer_topics: bool,
    pub peer_topic_poll_secs: u64,
    pub channels: ChannelConfig,
    pub identity: IdentityCacheConfig,
    pub maintainer: MaintainerConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            nickname: "anonymous".to_string(),
            default_topic: DEFAULT_CHAT_TOPIC.to_string(),
            discovery_topic: DEFAULT_DISCOVERY_TOPIC.to_string(),
            connect_addrs: Vec::new(),
            drain_interval_ms: 100,
            announce_interval_secs: Some(60),
            follow_peer_topics: false,
            peer_topic_poll_secs: 2,
            channels: ChannelConfig::default(),
            identity: IdentityCacheConfig::default(),
            maintainer: MaintainerConfig::default(),
        }
    }
}

impl ServiceConfig {
    pub fn new<S: Into<String>>(nickname: S) -> Self {
        Self {
            nickname: nickname.into(),
            ..Self::default()
        }
    }

    /// Fast, quiet configuration for tests: no announcements, no maintainer
    pub fn testing<S: Into<String>>(nickname: S) -> Self {
        Self {
            nickname: nickname.into(),
            drain_interval_ms: 10,
            announce_interval_secs: None,
            peer_topic_poll_secs: 1,
            channels: ChannelConfig::testing(),
            maintainer: MaintainerConfig::testing(),
            ..Self::default()
        }
    }

    pub fn with_default_topic<S: Into<String>>(mut self, topic: S) -> Self {
        self.default_topic = topic.into();
        self
    }

    pub fn with_connect_addrs(mut self, addrs: Vec<String>) -> Self {
        self.connect_addrs = addrs;
        self
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }

    pub fn announce_interval(&self) -> Option<Duration> {
        self.announce_interval_secs.map(Duration::from_secs)
    }

    pub fn peer_topic_poll_interval(&self) -> Duration {
        Duration::from_secs(self.peer_topic_poll_secs)
    }

    /// Parse a TOML document; missing fields take their defaults
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: ServiceConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nickname.trim().is_empty() {
            return Err(ConfigError::invalid("nickname", "must not be empty"));
        }
        if self.default_topic.is_empty() {
            return Err(ConfigError::invalid("default_topic", "must not be empty"));
        }
        if self.drain_interval_ms == 0 {
            return Err(ConfigError::invalid("drain_interval_ms", "must be non-zero"));
        }
        if self.announce_interval_secs == Some(0) {
            return Err(ConfigError::invalid("announce_interval_secs", "must be non-zero when set"));
        }
        if self.follow_peer_topics && self.peer_topic_poll_secs == 0 {
            return Err(ConfigError::invalid("peer_topic_poll_secs", "must be non-zero"));
        }
        self.channels.validate()?;
        self.identity.validate()?;
        self.maintainer.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_defaults_match_reserved_topics() {
        let config = ServiceConfig::default();
        assert_eq!(config.default_topic, "universal-connectivity");
        assert_eq!(config.discovery_topic, "universal-connectivity-browser-peer-discovery");
        assert_eq!(config.identity.ttl(), Duration::from_secs(300));
        assert_eq!(config.maintainer.interval(), Duration::from_secs(15));
        assert_eq!(config.maintainer.target_peers, 20);
        assert_eq!(config.maintainer.max_candidates, 50);
        assert_eq!(config.drain_interval(), Duration::from_millis(100));
        assert_ok!(config.validate());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = ServiceConfig::from_toml_str(
            r#"
            nickname = "alice"
            connect_addrs = ["/ip4/127.0.0.1/tcp/9095"]

            [maintainer]
            target_peers = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.nickname, "alice");
        assert_eq!(config.connect_addrs.len(), 1);
        assert_eq!(config.maintainer.target_peers, 5);
        assert_eq!(config.maintainer.max_candidates, 50);
        assert_eq!(config.default_topic, DEFAULT_CHAT_TOPIC);
    }

    #[test]
    fn test_validation_rejects_zero_values() {
        let mut config = ServiceConfig::testing("bob");
        config.channels.command_buffer_size = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { field, .. }) if field == "channels.command_buffer_size"));

        let mut config = ServiceConfig::testing("bob");
        config.maintainer.max_candidates = 0;
        assert_err!(config.validate());

        let config = ServiceConfig::testing("  ");
        assert_err!(config.validate());
    }

    #[test]
    fn test_malformed_toml_is_parse_error() {
        let err = ServiceConfig::from_toml_str("nickname = [").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_toml_roundtrip() {
        let mut config = ServiceConfig::testing("carol");
        config.announce_interval_secs = Some(30);
        let text = toml::to_string(&config).unwrap();
        let parsed = ServiceConfig::from_toml_str(&text).unwrap();
        assert_eq!(parsed, config);
    }
}
