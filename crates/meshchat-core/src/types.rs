//! Core types used throughout the meshchat peer

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::errors::TransportError;

// ----------------------------------------------------------------------------
// Peer Identity
// ----------------------------------------------------------------------------

/// Number of trailing characters used for short peer labels
pub const SHORT_ID_LEN: usize = 8;

/// Canonical string form of a network peer identifier
///
/// Equality is exact and case-sensitive: two identifiers are the same peer
/// only when their canonical strings are byte-for-byte identical.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Sender label used when an inbound envelope carries no source
    pub const UNKNOWN: &'static str = "unknown";

    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    /// Placeholder identity for messages without a sender
    pub fn unknown() -> Self {
        Self(Self::UNKNOWN.to_string())
    }

    pub fn is_unknown(&self) -> bool {
        self.0 == Self::UNKNOWN
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Trailing characters of the identifier, used as a fallback nickname
    pub fn short_id(&self) -> String {
        let count = self.0.chars().count();
        self.0
            .chars()
            .skip(count.saturating_sub(SHORT_ID_LEN))
            .collect()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

// ----------------------------------------------------------------------------
// Timestamp
// ----------------------------------------------------------------------------

/// Millisecond timestamp since Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    pub fn new(millis: u64) -> Self {
        Self(millis)
    }

    pub fn from_secs(secs: u64) -> Self {
        Self(secs.saturating_mul(1000))
    }

    /// Current wall-clock time
    pub fn now() -> Self {
        SystemTimeSource.now()
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Whole seconds since the epoch
    pub fn as_unix_secs(&self) -> u64 {
        self.0 / 1000
    }

    /// Seconds since the epoch as a float, the form carried on the bridge
    pub fn as_unix_secs_f64(&self) -> f64 {
        self.0 as f64 / 1000.0
    }

    /// Time elapsed since `earlier`, zero if `earlier` is in the future
    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }

    pub fn saturating_add(&self, duration: Duration) -> Timestamp {
        Timestamp(self.0.saturating_add(duration.as_millis() as u64))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

// ----------------------------------------------------------------------------
// Time Source
// ----------------------------------------------------------------------------

/// Source of the current time
///
/// Components that reason about ages (cache TTLs, message timestamps) take a
/// time source so tests can drive the clock explicitly.
pub trait TimeSource: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Wall-clock time source
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp::new(
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        )
    }
}

impl<T: TimeSource + ?Sized> TimeSource for std::sync::Arc<T> {
    fn now(&self) -> Timestamp {
        (**self).now()
    }
}

// ----------------------------------------------------------------------------
// Multiaddr
// ----------------------------------------------------------------------------

/// One component of a multiaddress
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Protocol {
    Ip4(Ipv4Addr),
    Ip6(Ipv6Addr),
    Dns(String),
    Dns4(String),
    Dns6(String),
    Dnsaddr(String),
    Tcp(u16),
    Udp(u16),
    Quic,
    QuicV1,
    Ws,
    Wss,
    Tls,
    Noise,
    WebTransport,
    WebRtc,
    WebRtcDirect,
    Certhash(String),
    P2pCircuit,
    P2p(PeerId),
}

impl Protocol {
    fn parse<'a, I>(name: &str, parts: &mut I, addr: &str) -> Result<Self, TransportError>
    where
        I: Iterator<Item = &'a str>,
    {
        let invalid = |reason: String| TransportError::InvalidAddress {
            addr: addr.to_string(),
            reason,
        };
        let mut value = |name: &str| {
            parts
                .next()
                .filter(|v| !v.is_empty())
                .ok_or_else(|| invalid(format!("missing value for /{}", name)))
        };

        let protocol = match name {
            "ip4" => Protocol::Ip4(
                value(name)?
                    .parse::<Ipv4Addr>()
                    .map_err(|e| invalid(format!("bad ip4: {}", e)))?,
            ),
            "ip6" => Protocol::Ip6(
                value(name)?
                    .parse::<Ipv6Addr>()
                    .map_err(|e| invalid(format!("bad ip6: {}", e)))?,
            ),
            "tcp" => Protocol::Tcp(
                value(name)?
                    .parse::<u16>()
                    .map_err(|e| invalid(format!("bad tcp port: {}", e)))?,
            ),
            "udp" => Protocol::Udp(
                value(name)?
                    .parse::<u16>()
                    .map_err(|e| invalid(format!("bad udp port: {}", e)))?,
            ),
            "dns" => Protocol::Dns(value(name)?.to_string()),
            "dns4" => Protocol::Dns4(value(name)?.to_string()),
            "dns6" => Protocol::Dns6(value(name)?.to_string()),
            "dnsaddr" => Protocol::Dnsaddr(value(name)?.to_string()),
            "certhash" => Protocol::Certhash(value(name)?.to_string()),
            "p2p" | "ipfs" => Protocol::P2p(PeerId::new(value(name)?)),
            "quic" => Protocol::Quic,
            "quic-v1" => Protocol::QuicV1,
            "ws" => Protocol::Ws,
            "wss" => Protocol::Wss,
            "tls" => Protocol::Tls,
            "noise" => Protocol::Noise,
            "webtransport" => Protocol::WebTransport,
            "webrtc" => Protocol::WebRtc,
            "webrtc-direct" => Protocol::WebRtcDirect,
            "p2p-circuit" => Protocol::P2pCircuit,
            other => return Err(invalid(format!("unknown protocol /{}", other))),
        };
        Ok(protocol)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Ip4(ip) => write!(f, "/ip4/{}", ip),
            Protocol::Ip6(ip) => write!(f, "/ip6/{}", ip),
            Protocol::Dns(host) => write!(f, "/dns/{}", host),
            Protocol::Dns4(host) => write!(f, "/dns4/{}", host),
            Protocol::Dns6(host) => write!(f, "/dns6/{}", host),
            Protocol::Dnsaddr(host) => write!(f, "/dnsaddr/{}", host),
            Protocol::Tcp(port) => write!(f, "/tcp/{}", port),
            Protocol::Udp(port) => write!(f, "/udp/{}", port),
            Protocol::Quic => write!(f, "/quic"),
            Protocol::QuicV1 => write!(f, "/quic-v1"),
            Protocol::Ws => write!(f, "/ws"),
            Protocol::Wss => write!(f, "/wss"),
            Protocol::Tls => write!(f, "/tls"),
            Protocol::Noise => write!(f, "/noise"),
            Protocol::WebTransport => write!(f, "/webtransport"),
            Protocol::WebRtc => write!(f, "/webrtc"),
            Protocol::WebRtcDirect => write!(f, "/webrtc-direct"),
            Protocol::Certhash(hash) => write!(f, "/certhash/{}", hash),
            Protocol::P2pCircuit => write!(f, "/p2p-circuit"),
            Protocol::P2p(peer) => write!(f, "/p2p/{}", peer),
        }
    }
}

/// Parsed multiaddress such as `/ip4/1.2.3.4/tcp/4001/p2p/Qm...`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Multiaddr {
    protocols: Vec<Protocol>,
}

impl Multiaddr {
    pub fn protocols(&self) -> &[Protocol] {
        &self.protocols
    }

    /// Peer identifier carried by the trailing `/p2p/` component, if any
    pub fn peer_id(&self) -> Option<&PeerId> {
        self.protocols.iter().rev().find_map(|p| match p {
            Protocol::P2p(peer) => Some(peer),
            _ => None,
        })
    }

    /// Append a `/p2p/<peer>` component unless one is already present
    pub fn with_peer_id(mut self, peer: &PeerId) -> Self {
        if self.peer_id().is_none() {
            self.protocols.push(Protocol::P2p(peer.clone()));
        }
        self
    }

    /// Whether this address can be dialled by the TCP/IPv4 stack in use
    ///
    /// QUIC addresses are excluded even when they also carry an IPv4 host.
    pub fn is_tcp_ipv4(&self) -> bool {
        let has_ip4 = self.protocols.iter().any(|p| matches!(p, Protocol::Ip4(_)));
        let has_tcp = self.protocols.iter().any(|p| matches!(p, Protocol::Tcp(_)));
        let has_quic = self
            .protocols
            .iter()
            .any(|p| matches!(p, Protocol::Quic | Protocol::QuicV1));
        has_ip4 && has_tcp && !has_quic
    }
}

impl FromStr for Multiaddr {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let rest = trimmed
            .strip_prefix('/')
            .ok_or_else(|| TransportError::InvalidAddress {
                addr: s.to_string(),
                reason: "must start with '/'".to_string(),
            })?;

        let mut parts = rest.split('/');
        let mut protocols = Vec::new();
        while let Some(name) = parts.next() {
            if name.is_empty() {
                // tolerate a single trailing slash
                if parts.next().is_none() {
                    break;
                }
                return Err(TransportError::InvalidAddress {
                    addr: s.to_string(),
                    reason: "empty component".to_string(),
                });
            }
            protocols.push(Protocol::parse(name, &mut parts, s)?);
        }

        if protocols.is_empty() {
            return Err(TransportError::InvalidAddress {
                addr: s.to_string(),
                reason: "no components".to_string(),
            });
        }
        Ok(Self { protocols })
    }
}

impl TryFrom<String> for Multiaddr {
    type Error = TransportError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Multiaddr> for String {
    fn from(addr: Multiaddr) -> Self {
        addr.to_string()
    }
}

impl fmt::Display for Multiaddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for protocol in &self.protocols {
            write!(f, "{}", protocol)?;
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Peer Store Views
// ----------------------------------------------------------------------------

/// A peer known to the transport's peer store, with its advertised addresses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownPeer {
    pub peer_id: PeerId,
    pub addrs: Vec<Multiaddr>,
}

impl KnownPeer {
    pub fn new(peer_id: PeerId, addrs: Vec<Multiaddr>) -> Self {
        Self { peer_id, addrs }
    }

    /// First address usable by the TCP/IPv4 stack
    pub fn compatible_addr(&self) -> Option<&Multiaddr> {
        self.addrs.iter().find(|addr| addr.is_tcp_ipv4())
    }

    pub fn is_compatible(&self) -> bool {
        self.compatible_addr().is_some()
    }
}

/// Snapshot of the local node's connectivity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub peer_id: PeerId,
    pub nickname: String,
    /// First listen address with the local `/p2p/` component appended
    pub multiaddr: Option<String>,
    pub connected_peers: HashSet<PeerId>,
    pub peer_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const PEER: &str = "QmbXUUZ4LoDE59Hx9zjiH88S9YY77ft9b3pFtPsyH2xeZJ";

    #[test]
    fn test_short_id_takes_trailing_chars() {
        let peer = PeerId::new(PEER);
        assert_eq!(peer.short_id(), "syH2xeZJ");
        assert_eq!(peer.short_id().len(), SHORT_ID_LEN);
        assert_eq!(PeerId::new("abc").short_id(), "abc");
    }

    #[test]
    fn test_peer_id_equality_is_exact() {
        let peer = PeerId::new(PEER);
        assert_eq!(peer, PeerId::new(PEER));
        assert_ne!(peer, PeerId::new(PEER.to_lowercase()));
        assert_ne!(peer, PeerId::new(format!("{} ", PEER)));
        assert_ne!(peer, PeerId::new(&PEER[..PEER.len() - 1]));
    }

    #[test]
    fn test_multiaddr_roundtrip_and_peer_id() {
        let text = format!("/ip4/127.0.0.1/tcp/9095/p2p/{}", PEER);
        let addr: Multiaddr = text.parse().unwrap();
        assert_eq!(addr.to_string(), text);
        assert_eq!(addr.peer_id(), Some(&PeerId::new(PEER)));
        assert!(addr.is_tcp_ipv4());
    }

    #[test]
    fn test_multiaddr_compatibility_filter() {
        let compatible: Multiaddr = "/ip4/10.0.0.1/tcp/4001".parse().unwrap();
        let quic: Multiaddr = "/ip4/10.0.0.1/udp/4001/quic-v1".parse().unwrap();
        let ip6: Multiaddr = "/ip6/::1/tcp/4001".parse().unwrap();
        let dns: Multiaddr = format!("/dnsaddr/bootstrap.libp2p.io/p2p/{}", PEER).parse().unwrap();

        assert!(compatible.is_tcp_ipv4());
        assert!(!quic.is_tcp_ipv4());
        assert!(!ip6.is_tcp_ipv4());
        assert!(!dns.is_tcp_ipv4());
    }

    #[test]
    fn test_multiaddr_rejects_garbage() {
        assert!("ip4/1.2.3.4".parse::<Multiaddr>().is_err());
        assert!("/ip4/not-an-ip/tcp/1".parse::<Multiaddr>().is_err());
        assert!("/ip4/1.2.3.4/tcp".parse::<Multiaddr>().is_err());
        assert!("/bogus/1".parse::<Multiaddr>().is_err());
        assert!("/".parse::<Multiaddr>().is_err());
    }

    #[test]
    fn test_with_peer_id_appends_once() {
        let peer = PeerId::new(PEER);
        let addr: Multiaddr = "/ip4/0.0.0.0/tcp/4001".parse().unwrap();
        let full = addr.with_peer_id(&peer).with_peer_id(&peer);
        assert_eq!(full.to_string(), format!("/ip4/0.0.0.0/tcp/4001/p2p/{}", PEER));
    }

    #[test]
    fn test_timestamp_duration_since_saturates() {
        let early = Timestamp::from_secs(10);
        let late = Timestamp::from_secs(12);
        assert_eq!(late.duration_since(early), Duration::from_secs(2));
        assert_eq!(early.duration_since(late), Duration::ZERO);
    }

    proptest! {
        #[test]
        fn prop_quic_never_compatible(a in any::<u8>(), port in 1u16..=u16::MAX) {
            let addr: Multiaddr = format!("/ip4/10.0.0.{}/tcp/{}/quic", a, port).parse().unwrap();
            prop_assert!(!addr.is_tcp_ipv4());
        }

        #[test]
        fn prop_tcp_ipv4_roundtrips(a in any::<u8>(), b in any::<u8>(), port in any::<u16>()) {
            let text = format!("/ip4/192.168.{}.{}/tcp/{}", a, b, port);
            let addr: Multiaddr = text.parse().unwrap();
            prop_assert!(addr.is_tcp_ipv4());
            prop_assert_eq!(addr.to_string(), text);
        }

        #[test]
        fn prop_short_id_is_suffix(id in "[1-9A-HJ-NP-Za-km-z]{0,60}") {
            let peer = PeerId::new(id.clone());
            let short = peer.short_id();
            prop_assert!(id.ends_with(&short));
            prop_assert_eq!(short.chars().count(), id.chars().count().min(SHORT_ID_LEN));
        }
    }
}
