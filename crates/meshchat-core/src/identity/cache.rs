//! Peer identity cache
//!
//! Lazily fetches peer metadata over the identify side channel and keeps it
//! for a fixed TTL measured from fetch completion. Stale entries are not
//! evicted; they are replaced the next time someone asks for them. Callers
//! always receive clones.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::record::{read_identify_record, IdentifyRecord};
use crate::config::IdentityCacheConfig;
use crate::errors::IdentityFetchError;
use crate::task_logging::TaskLogger;
use crate::transport::{IdentityService, IDENTIFY_PROTOCOL_ID};
use crate::types::{PeerId, TimeSource, Timestamp};

// ----------------------------------------------------------------------------
// Cache Entry
// ----------------------------------------------------------------------------

/// Cached result of an identify exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerIdentityEntry {
    pub peer_id: PeerId,
    pub public_key: Vec<u8>,
    pub protocol_version: String,
    pub agent_version: String,
    pub listen_addrs: Vec<String>,
    pub protocols: Vec<String>,
    pub fetched_at: Timestamp,
}

impl PeerIdentityEntry {
    pub fn from_record(peer_id: PeerId, record: IdentifyRecord, fetched_at: Timestamp) -> Self {
        Self {
            peer_id,
            public_key: record.public_key,
            protocol_version: record.protocol_version,
            agent_version: record.agent_version,
            listen_addrs: record.listen_addrs,
            protocols: record.protocols,
            fetched_at,
        }
    }

    pub fn fetched_at_unix(&self) -> u64 {
        self.fetched_at.as_unix_secs()
    }

    pub fn has_public_key(&self) -> bool {
        !self.public_key.is_empty()
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(&self.public_key)
    }

    /// Stale once strictly more than `ttl` has passed since the fetch completed
    pub fn is_stale(&self, now: Timestamp, ttl: Duration) -> bool {
        now.duration_since(self.fetched_at) > ttl
    }
}

// ----------------------------------------------------------------------------
// Statistics
// ----------------------------------------------------------------------------

/// Counters describing cache behaviour
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityCacheStats {
    /// Lookups answered from a fresh entry
    pub hits: u64,
    /// Lookups that found nothing fresh
    pub misses: u64,
    /// Identify exchanges started
    pub fetches: u64,
    /// Identify exchanges that failed
    pub failures: u64,
}

#[derive(Debug, Default)]
struct StatCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    fetches: AtomicU64,
    failures: AtomicU64,
}

impl StatCounters {
    fn snapshot(&self) -> IdentityCacheStats {
        IdentityCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            fetches: self.fetches.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

// ----------------------------------------------------------------------------
// Cache
// ----------------------------------------------------------------------------

type FetchGuard = Arc<tokio::sync::Mutex<()>>;

/// TTL cache of peer identities backed by the identify exchange
pub struct PeerIdentityCache {
    service: Arc<dyn IdentityService>,
    clock: Arc<dyn TimeSource>,
    config: IdentityCacheConfig,
    entries: Mutex<HashMap<PeerId, PeerIdentityEntry>>,
    inflight: Mutex<HashMap<PeerId, FetchGuard>>,
    stats: StatCounters,
    logger: TaskLogger,
}

impl PeerIdentityCache {
    pub fn new(
        service: Arc<dyn IdentityService>,
        clock: Arc<dyn TimeSource>,
        config: IdentityCacheConfig,
        logger: TaskLogger,
    ) -> Self {
        Self {
            service,
            clock,
            config,
            entries: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            stats: StatCounters::default(),
            logger,
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<PeerId, PeerIdentityEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn inflight(&self) -> MutexGuard<'_, HashMap<PeerId, FetchGuard>> {
        self.inflight.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fresh cached entry for `peer`, without fetching
    pub fn get(&self, peer: &PeerId) -> Option<PeerIdentityEntry> {
        let now = self.clock.now();
        let ttl = self.config.ttl();
        self.entries()
            .get(peer)
            .filter(|entry| !entry.is_stale(now, ttl))
            .cloned()
    }

    /// Return a fresh entry, fetching one when missing or stale
    ///
    /// Every failure of the exchange yields `None`; nothing is cached then.
    pub async fn get_or_fetch(&self, peer: &PeerId) -> Option<PeerIdentityEntry> {
        if let Some(entry) = self.get(peer) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Some(entry);
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);

        if !self.config.dedupe_fetches {
            return self.fetch_and_store(peer).await;
        }

        let guard = Arc::clone(self.inflight().entry(peer.clone()).or_default());
        let result = {
            let _fetching = guard.lock().await;
            // Another caller may have completed the fetch while we waited
            match self.get(peer) {
                Some(entry) => Some(entry),
                None => self.fetch_and_store(peer).await,
            }
        };

        let mut inflight = self.inflight();
        if let Some(current) = inflight.get(peer) {
            // map + this caller hold the only references: no one is waiting
            if Arc::ptr_eq(current, &guard) && Arc::strong_count(&guard) == 2 {
                inflight.remove(peer);
            }
        }
        result
    }

    /// Run one identify exchange with `peer` without touching the cache
    pub async fn fetch(&self, peer: &PeerId) -> Result<IdentifyRecord, IdentityFetchError> {
        let timeout = self.config.fetch_timeout();
        let exchange = async {
            let mut stream = self.service.open_stream(peer, IDENTIFY_PROTOCOL_ID).await?;
            read_identify_record(&mut stream, self.config.max_frame_len).await
        };
        tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| IdentityFetchError::Timeout(timeout))?
    }

    async fn fetch_and_store(&self, peer: &PeerId) -> Option<PeerIdentityEntry> {
        self.stats.fetches.fetch_add(1, Ordering::Relaxed);
        match self.fetch(peer).await {
            Ok(record) => {
                let entry = PeerIdentityEntry::from_record(peer.clone(), record, self.clock.now());
                self.logger.debug(&format!(
                    "identified {} agent:{} protocols:{}",
                    peer,
                    entry.agent_version,
                    entry.protocols.len()
                ));
                self.entries().insert(peer.clone(), entry.clone());
                Some(entry)
            }
            Err(err) => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                self.logger.warn(&format!("identify exchange with {} failed: {}", peer, err));
                None
            }
        }
    }

    /// Number of entries held, fresh or stale
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn stats(&self) -> IdentityCacheStats {
        self.stats.snapshot()
    }
}

impl std::fmt::Debug for PeerIdentityCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerIdentityCache")
            .field("config", &self.config)
            .field("entries", &self.len())
            .field("stats", &self.stats())
            .finish()
    }
}
