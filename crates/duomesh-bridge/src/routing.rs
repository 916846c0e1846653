//! Sender to network memory
//!
//! The only source of truth for "which network does this conversation
//! belong to". Every inbound packet refreshes its sender's entry, every
//! reply reads it, and a timer sweep evicts entries older than the TTL.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::packet::Network;

/// Where a sender was last heard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenderNetworkEntry {
    /// Network of the last inbound packet
    pub network: Network,
    /// When it arrived
    pub last_seen: Instant,
}

/// Sender id to network map with TTL eviction
#[derive(Debug)]
pub struct SenderNetworkMap {
    entries: Mutex<HashMap<u32, SenderNetworkEntry>>,
    ttl: Duration,
}

impl SenderNetworkMap {
    /// Create with an entry lifetime
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Record (or refresh) a sender
    pub fn record(&self, sender: u32, network: Network, now: Instant) {
        let previous = self.entries.lock().insert(
            sender,
            SenderNetworkEntry {
                network,
                last_seen: now,
            },
        );
        if let Some(previous) = previous {
            if previous.network != network {
                debug!(sender, from = %previous.network, to = %network, "Sender moved networks");
            }
        }
    }

    /// Network a sender was last heard on
    pub fn lookup(&self, sender: u32) -> Option<Network> {
        self.entries.lock().get(&sender).map(|entry| entry.network)
    }

    /// Full entry for a sender
    pub fn entry(&self, sender: u32) -> Option<SenderNetworkEntry> {
        self.entries.lock().get(&sender).copied()
    }

    /// Evict entries older than the TTL; returns how many were removed
    pub fn sweep(&self, now: Instant) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| now.saturating_duration_since(entry.last_seen) < self.ttl);
        before - entries.len()
    }

    /// Known senders
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// No senders known
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
