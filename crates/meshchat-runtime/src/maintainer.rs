//! Connection Maintainer
//!
//! Keeps the local node meshed. Every interval, while fewer than
//! `target_peers` are connected, it samples up to `max_candidates` known,
//! unconnected peers that advertise a TCP/IPv4 address and dials them with a
//! per-dial timeout. Dial failures are expected and only logged.

use futures::stream::{self, StreamExt};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, RngCore, SeedableRng};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use meshchat_core::{KnownPeer, MaintainerConfig, Multiaddr, PeerId, TaskLogger, Transport, TransportError};

use crate::shutdown::ShutdownSignal;

// ----------------------------------------------------------------------------
// Dialing
// ----------------------------------------------------------------------------

/// Dial `addr`, giving up after `timeout`
pub async fn dial(transport: &dyn Transport, addr: &Multiaddr, timeout: Duration) -> Result<(), TransportError> {
    match tokio::time::timeout(timeout, transport.connect(addr)).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::ConnectTimeout {
            peer: addr.to_string(),
            timeout,
        }),
    }
}

/// A peer worth dialling and the address to dial it on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub peer_id: PeerId,
    pub addr: Multiaddr,
}

/// Known peers that are not connected and have a compatible address
pub fn compatible_candidates(known: &[KnownPeer], connected: &HashSet<PeerId>) -> Vec<Candidate> {
    known
        .iter()
        .filter(|peer| !connected.contains(&peer.peer_id))
        .filter_map(|peer| {
            peer.compatible_addr().map(|addr| Candidate {
                peer_id: peer.peer_id.clone(),
                addr: addr.clone(),
            })
        })
        .collect()
}

/// Uniform sample of at most `max` candidates
pub fn sample_candidates<R: Rng + ?Sized>(candidates: &[Candidate], max: usize, rng: &mut R) -> Vec<Candidate> {
    candidates.choose_multiple(rng, max).cloned().collect()
}

// ----------------------------------------------------------------------------
// Reports and Statistics
// ----------------------------------------------------------------------------

/// Outcome of one maintenance cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub connected: usize,
    pub compatible: usize,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// The cycle did nothing because the node already had enough peers
    pub skipped: bool,
}

/// Running totals across cycles
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintainerStats {
    pub cycles: u64,
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
}

impl MaintainerStats {
    fn record(&mut self, report: &CycleReport) {
        self.cycles += 1;
        self.attempts += report.attempted as u64;
        self.successes += report.succeeded as u64;
        self.failures += report.failed as u64;
    }
}

// ----------------------------------------------------------------------------
// Maintainer Task
// ----------------------------------------------------------------------------

pub struct ConnectionMaintainer {
    transport: Arc<dyn Transport>,
    config: MaintainerConfig,
    rng: Box<dyn RngCore + Send>,
    stats: MaintainerStats,
    logger: TaskLogger,
}

impl ConnectionMaintainer {
    pub fn new(transport: Arc<dyn Transport>, config: MaintainerConfig, logger: TaskLogger) -> Self {
        Self {
            transport,
            config,
            rng: Box::new(StdRng::from_entropy()),
            stats: MaintainerStats::default(),
            logger,
        }
    }

    /// Replace the sampling source, for reproducible runs
    pub fn with_rng<R: RngCore + Send + 'static>(mut self, rng: R) -> Self {
        self.rng = Box::new(rng);
        self
    }

    pub fn stats(&self) -> MaintainerStats {
        self.stats
    }

    /// Run one cycle: snapshot, sample, dial
    pub async fn run_cycle(&mut self) -> CycleReport {
        let connected = self.transport.peers();
        let mut report = CycleReport {
            connected: connected.len(),
            ..CycleReport::default()
        };

        if connected.len() >= self.config.target_peers {
            report.skipped = true;
            self.logger.trace(&format!(
                "{} peers connected, target {} met",
                connected.len(),
                self.config.target_peers
            ));
            self.stats.record(&report);
            return report;
        }

        let known = self.transport.known_peers();
        let candidates = compatible_candidates(&known, &connected);
        report.compatible = candidates.len();
        let sampled = sample_candidates(&candidates, self.config.max_candidates, &mut *self.rng);
        report.attempted = sampled.len();

        if sampled.is_empty() {
            self.logger.debug("No compatible peers to dial");
            self.stats.record(&report);
            return report;
        }

        self.logger.debug(&format!(
            "Dialling {} of {} compatible peers ({} connected)",
            sampled.len(),
            candidates.len(),
            connected.len()
        ));

        let timeout = self.config.dial_timeout();
        let transport = Arc::clone(&self.transport);
        let outcomes: Vec<(Candidate, Result<(), TransportError>)> = stream::iter(sampled)
            .map(|candidate| {
                let transport = Arc::clone(&transport);
                async move {
                    let result = dial(transport.as_ref(), &candidate.addr, timeout).await;
                    (candidate, result)
                }
            })
            .buffer_unordered(self.config.max_concurrent_dials.max(1))
            .collect()
            .await;

        for (candidate, result) in outcomes {
            match result {
                Ok(()) => {
                    report.succeeded += 1;
                    self.logger
                        .debug(&format!("Connected to {}", candidate.peer_id.short_id()));
                }
                Err(err) => {
                    report.failed += 1;
                    self.logger.warn(&format!(
                        "Dial to {} failed: {}",
                        candidate.peer_id.short_id(),
                        err
                    ));
                }
            }
        }

        self.stats.record(&report);
        report
    }

    /// Cycle every `interval` until shutdown
    pub async fn run(mut self, mut shutdown: ShutdownSignal) -> MaintainerStats {
        self.logger.debug("Connection maintainer started");
        loop {
            if shutdown.is_triggered() {
                break;
            }
            let cycle = tokio::select! {
                report = self.run_cycle() => Some(report),
                _ = shutdown.triggered() => None,
            };
            if cycle.is_none() {
                break;
            }
            if !shutdown.sleep(self.config.interval()).await {
                break;
            }
        }
        self.logger.debug(&format!("Connection maintainer stopped: {:?}", self.stats));
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshchat_core::testing::{test_peer_id, ConnectBehavior, MemoryNetwork};
    use meshchat_core::TaskId;
    use proptest::prelude::*;
    use rand_chacha::ChaCha8Rng;
    use std::io;
    use std::sync::Mutex;

    /// Collects formatted log lines for inspection
    #[derive(Clone, Default)]
    struct CapturedLog(Arc<Mutex<Vec<u8>>>);

    impl CapturedLog {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl io::Write for CapturedLog {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn known_peer(n: u8, addr: &str) -> KnownPeer {
        let peer = test_peer_id(n);
        let addr: Multiaddr = format!("{}/p2p/{}", addr, peer).parse().unwrap();
        KnownPeer::new(peer, vec![addr])
    }

    fn pool(size: usize) -> Vec<Candidate> {
        (0..size)
            .map(|n| {
                let peer = PeerId::new(format!("12D3KooWPool{:05}", n));
                Candidate {
                    addr: format!("/ip4/10.0.{}.{}/tcp/4001", n / 256, n % 256).parse().unwrap(),
                    peer_id: peer,
                }
            })
            .collect()
    }

    #[test]
    fn test_sample_is_bounded_by_pool_and_cap() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        for (size, expected) in [(10, 10), (50, 50), (200, 50)] {
            let candidates = pool(size);
            let sampled = sample_candidates(&candidates, 50, &mut rng);
            assert_eq!(sampled.len(), expected);
            let unique: HashSet<_> = sampled.iter().map(|c| c.peer_id.clone()).collect();
            assert_eq!(unique.len(), expected);
        }
    }

    #[test]
    fn test_only_unconnected_tcp_ipv4_peers_are_candidates() {
        let known = vec![
            known_peer(1, "/ip4/10.0.0.1/tcp/4001"),
            known_peer(2, "/ip4/10.0.0.2/udp/4001/quic-v1"),
            known_peer(3, "/ip6/::1/tcp/4001"),
            known_peer(4, "/ip4/10.0.0.4/tcp/4001"),
        ];
        let connected = HashSet::from([test_peer_id(4)]);

        let candidates = compatible_candidates(&known, &connected);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].peer_id, test_peer_id(1));
    }

    proptest! {
        #[test]
        fn prop_sample_never_exceeds_bounds(size in 0usize..300, max in 0usize..80, seed in any::<u64>()) {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let candidates = pool(size);
            let sampled = sample_candidates(&candidates, max, &mut rng);
            prop_assert_eq!(sampled.len(), size.min(max));
            prop_assert!(sampled.iter().all(|c| candidates.contains(c)));
        }
    }

    #[tokio::test]
    async fn test_cycle_dials_and_counts_outcomes() {
        let network = MemoryNetwork::new();
        let transport = network.transport(test_peer_id(0));
        let good = known_peer(1, "/ip4/10.0.0.1/tcp/4001");
        let bad = known_peer(2, "/ip4/10.0.0.2/tcp/4001");
        transport.set_connect_behavior(&bad.addrs[0], ConnectBehavior::Fail);
        transport.set_known_peers(vec![good, bad]);

        let mut maintainer = ConnectionMaintainer::new(
            transport.clone(),
            MaintainerConfig::default(),
            TaskLogger::disabled(),
        )
        .with_rng(ChaCha8Rng::seed_from_u64(1));

        let report = maintainer.run_cycle().await;
        assert_eq!(report.compatible, 2);
        assert_eq!(report.attempted, 2);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 1);
        assert!(transport.peers().contains(&test_peer_id(1)));

        // the connected peer is no longer a candidate
        let report = maintainer.run_cycle().await;
        assert_eq!(report.attempted, 1);
        assert_eq!(maintainer.stats().cycles, 2);
        assert_eq!(maintainer.stats().attempts, 3);
    }

    #[tokio::test]
    async fn test_cycle_skips_when_target_met() {
        let network = MemoryNetwork::new();
        let transport = network.transport(test_peer_id(0));
        transport.set_connected([test_peer_id(1), test_peer_id(2)]);
        transport.set_known_peers(vec![known_peer(3, "/ip4/10.0.0.3/tcp/4001")]);

        let config = MaintainerConfig {
            target_peers: 2,
            ..MaintainerConfig::default()
        };
        let mut maintainer = ConnectionMaintainer::new(transport.clone(), config, TaskLogger::disabled());
        let report = maintainer.run_cycle().await;

        assert!(report.skipped);
        assert!(transport.dials().is_empty());
    }

    #[tokio::test]
    async fn test_failed_dial_is_logged_at_default_level() {
        let captured = CapturedLog::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let network = MemoryNetwork::new();
        let transport = network.transport(test_peer_id(0));
        transport.set_default_connect_behavior(ConnectBehavior::Fail);
        transport.set_known_peers(vec![known_peer(4, "/ip4/10.0.0.4/tcp/4001")]);

        let mut maintainer = ConnectionMaintainer::new(
            transport,
            MaintainerConfig::default(),
            TaskLogger::new(TaskId::Maintainer),
        );
        let report = maintainer.run_cycle().await;

        assert_eq!(report.failed, 1);
        let output = captured.contents();
        assert!(output.contains("WARN"), "{}", output);
        assert!(
            output.contains(&format!("Dial to {} failed", test_peer_id(4).short_id())),
            "{}",
            output
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_dial_times_out() {
        let network = MemoryNetwork::new();
        let transport = network.transport(test_peer_id(0));
        transport.set_default_connect_behavior(ConnectBehavior::Hang);
        transport.set_known_peers(vec![known_peer(1, "/ip4/10.0.0.1/tcp/4001")]);

        let mut maintainer =
            ConnectionMaintainer::new(transport, MaintainerConfig::default(), TaskLogger::disabled());
        let report = maintainer.run_cycle().await;
        assert_eq!(report.failed, 1);
    }

    #[tokio::test]
    async fn test_dial_maps_elapsed_timeout() {
        let network = MemoryNetwork::new();
        let transport = network.transport(test_peer_id(0));
        transport.set_default_connect_behavior(ConnectBehavior::Hang);
        let addr: Multiaddr = "/ip4/10.0.0.9/tcp/4001".parse().unwrap();

        let result = dial(&*transport, &addr, Duration::from_millis(20)).await;
        assert!(matches!(result, Err(TransportError::ConnectTimeout { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_exits_on_shutdown() {
        let network = MemoryNetwork::new();
        let transport = network.transport(test_peer_id(0));
        let (trigger, signal) = crate::shutdown::shutdown_channel();
        let maintainer =
            ConnectionMaintainer::new(transport, MaintainerConfig::default(), TaskLogger::disabled());
        let task = tokio::spawn(maintainer.run(signal));

        tokio::time::sleep(Duration::from_secs(40)).await;
        trigger.trigger();
        let stats = task.await.unwrap();
        assert!(stats.cycles >= 2);
    }
}
