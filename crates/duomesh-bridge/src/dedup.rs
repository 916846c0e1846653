//! Self-broadcast echo suppression
//!
//! A broadcast this node sends is relayed by its neighbours and heard back
//! a few seconds later. Without suppression the router would hand it to
//! command processing as a fresh inbound message, which can reply, which
//! broadcasts again, and so on.
//!
//! Entries are keyed by the network a broadcast went out on plus a SHA-256
//! of its content, and live for the dedup window only: identical text sent
//! later by someone else, or heard on the other network, must get through.
//! Direct messages are never suppressed.

use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::DedupConfig;
use crate::packet::{Network, Packet};

type ContentHash = [u8; 32];
type EchoKey = (Network, ContentHash);

fn content_hash(content: &[u8]) -> ContentHash {
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&Sha256::digest(content));
    hash
}

/// Counters for monitoring
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DedupStats {
    /// Broadcasts recorded
    pub recorded: u64,
    /// Inbound echoes suppressed
    pub echoes_suppressed: u64,
    /// Entries purged after the window
    pub expired: u64,
}

/// Bounded, time-windowed set of recently sent broadcasts
#[derive(Debug)]
pub struct BroadcastDeduplicator {
    sent: Mutex<LruCache<EchoKey, Instant>>,
    window: Duration,
    stats: Mutex<DedupStats>,
}

impl BroadcastDeduplicator {
    /// Create with a window and capacity
    pub fn new(window: Duration, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            sent: Mutex::new(LruCache::new(capacity)),
            window,
            stats: Mutex::new(DedupStats::default()),
        }
    }

    /// Create from configuration
    pub fn from_config(config: &DedupConfig) -> Self {
        Self::new(config.window, config.capacity)
    }

    /// Dedup window
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record a broadcast we just sent on `network`
    pub fn on_self_broadcast_sent(&self, network: Network, content: &[u8]) {
        self.on_self_broadcast_sent_at(network, content, Instant::now());
    }

    /// Record a broadcast sent on `network` at `now`
    pub fn on_self_broadcast_sent_at(&self, network: Network, content: &[u8], now: Instant) {
        self.sent.lock().put((network, content_hash(content)), now);
        self.stats.lock().recorded += 1;
        trace!(network = %network, len = content.len(), "Recorded self broadcast");
    }

    /// Whether an inbound packet is our own broadcast coming back
    pub fn is_self_echo(&self, packet: &Packet) -> bool {
        self.is_self_echo_at(packet, Instant::now())
    }

    /// Like [`is_self_echo`](Self::is_self_echo), evaluated at `now`
    ///
    /// True only for broadcasts whose network and content match an entry
    /// recorded within `[0, window)` before `now`. Expired entries are purged.
    pub fn is_self_echo_at(&self, packet: &Packet, now: Instant) -> bool {
        if !packet.is_broadcast() {
            return false;
        }

        let key = (packet.network(), content_hash(packet.payload()));
        let mut sent = self.sent.lock();
        let Some(sent_at) = sent.peek(&key).copied() else {
            return false;
        };

        if now.saturating_duration_since(sent_at) >= self.window {
            sent.pop(&key);
            drop(sent);
            self.stats.lock().expired += 1;
            trace!("Expired self-broadcast entry");
            return false;
        }
        drop(sent);

        self.stats.lock().echoes_suppressed += 1;
        debug!(
            network = %packet.network(),
            from = packet.from_id(),
            "Suppressed self-broadcast echo"
        );
        true
    }

    /// Drop every expired entry
    pub fn purge_expired(&self, now: Instant) -> usize {
        let mut sent = self.sent.lock();
        let expired: Vec<EchoKey> = sent
            .iter()
            .filter(|(_, sent_at)| now.saturating_duration_since(**sent_at) >= self.window)
            .map(|(key, _)| *key)
            .collect();
        for key in &expired {
            sent.pop(key);
        }
        drop(sent);

        if !expired.is_empty() {
            self.stats.lock().expired += expired.len() as u64;
        }
        expired.len()
    }

    /// Live entries
    pub fn len(&self) -> usize {
        self.sent.lock().len()
    }

    /// No entries
    pub fn is_empty(&self) -> bool {
        self.sent.lock().is_empty()
    }

    /// Counter snapshot
    pub fn stats(&self) -> DedupStats {
        self.stats.lock().clone()
    }
}

impl Default for BroadcastDeduplicator {
    fn default() -> Self {
        Self::from_config(&DedupConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::BROADCAST_ID;

    fn broadcast(text: &str) -> Packet {
        Packet::builder(Network::A, 0x1234, BROADCAST_ID).text(text).build()
    }

    #[test]
    fn test_echo_within_window_suppressed() {
        let dedup = BroadcastDeduplicator::default();
        let t0 = Instant::now();
        dedup.on_self_broadcast_sent_at(Network::A, b"weather: sunny", t0);

        for secs in [0, 1, 30, 59] {
            assert!(
                dedup.is_self_echo_at(&broadcast("weather: sunny"), t0 + Duration::from_secs(secs)),
                "{secs}s"
            );
        }
        assert_eq!(dedup.stats().echoes_suppressed, 4);
    }

    #[test]
    fn test_echo_after_window_passes_and_purges() {
        let dedup = BroadcastDeduplicator::default();
        let t0 = Instant::now();
        dedup.on_self_broadcast_sent_at(Network::A, b"hello", t0);

        assert!(!dedup.is_self_echo_at(&broadcast("hello"), t0 + Duration::from_secs(60)));
        assert!(dedup.is_empty());
        assert!(!dedup.is_self_echo_at(&broadcast("hello"), t0 + Duration::from_secs(1)));
    }

    #[test]
    fn test_direct_messages_never_suppressed() {
        let dedup = BroadcastDeduplicator::default();
        let t0 = Instant::now();
        dedup.on_self_broadcast_sent_at(Network::A, b"ping", t0);

        let direct = Packet::builder(Network::A, 0x1234, 0x5678).text("ping").build();
        assert!(!dedup.is_self_echo_at(&direct, t0));
        assert!(dedup.is_self_echo_at(&broadcast("ping"), t0));
    }

    #[test]
    fn test_different_content_passes() {
        let dedup = BroadcastDeduplicator::default();
        let t0 = Instant::now();
        dedup.on_self_broadcast_sent_at(Network::A, b"one", t0);
        assert!(!dedup.is_self_echo_at(&broadcast("two"), t0));
    }

    #[test]
    fn test_purge_expired() {
        let dedup = BroadcastDeduplicator::new(Duration::from_secs(10), 16);
        let t0 = Instant::now();
        dedup.on_self_broadcast_sent_at(Network::A, b"old", t0);
        dedup.on_self_broadcast_sent_at(Network::A, b"new", t0 + Duration::from_secs(8));

        assert_eq!(dedup.purge_expired(t0 + Duration::from_secs(12)), 1);
        assert_eq!(dedup.len(), 1);
        assert!(dedup.is_self_echo_at(&broadcast("new"), t0 + Duration::from_secs(12)));
    }

    #[test]
    fn test_capacity_bounds_memory() {
        let dedup = BroadcastDeduplicator::new(Duration::from_secs(60), 2);
        let t0 = Instant::now();
        dedup.on_self_broadcast_sent_at(Network::A, b"a", t0);
        dedup.on_self_broadcast_sent_at(Network::A, b"b", t0);
        dedup.on_self_broadcast_sent_at(Network::A, b"c", t0);
        assert_eq!(dedup.len(), 2);
        assert!(!dedup.is_self_echo_at(&broadcast("a"), t0));
    }

    #[test]
    fn test_same_text_on_other_network_passes() {
        let dedup = BroadcastDeduplicator::default();
        let t0 = Instant::now();
        dedup.on_self_broadcast_sent_at(Network::A, b"net check", t0);

        let on_b = Packet::builder(Network::B, 0x1234, BROADCAST_ID)
            .text("net check")
            .build();
        assert!(!dedup.is_self_echo_at(&on_b, t0 + Duration::from_secs(1)));
        assert!(dedup.is_self_echo_at(&broadcast("net check"), t0 + Duration::from_secs(1)));

        // sending the same text on both networks tracks each separately
        dedup.on_self_broadcast_sent_at(Network::B, b"net check", t0);
        assert_eq!(dedup.len(), 2);
        assert!(dedup.is_self_echo_at(&on_b, t0 + Duration::from_secs(1)));
    }
}
