//! Directory of known nodes
//!
//! Entries arrive from several places (radio node-info frames, configured
//! names, in-band sender names) and each source spells node ids its own
//! way. A node id has four equivalent spellings:
//!
//! | form | example |
//! |------|---------|
//! | numeric | `2712847316` |
//! | numeric as string | `"2712847316"` |
//! | hex with prefix | `"!a1b2c3d4"` |
//! | hex without prefix | `"a1b2c3d4"` |
//!
//! Text keys that name exactly one id are stored in the prefixed, padded
//! form, so `"!ff"`, `"ff"` and `"255"` all land on `"!000000ff"`. Lookups
//! try every form before reporting an unknown sender.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::packet::format_node_id;

/// Key under which an entry was stored
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NodeKey {
    /// Numeric id
    Numeric(u32),
    /// Textual id in whatever form the source used (stored lowercase)
    Text(String),
}

impl NodeKey {
    /// Text key, normalised
    ///
    /// Input with a single reading becomes `!xxxxxxxx`; ambiguous or
    /// unparsable input is kept as written, lowercased.
    pub fn text(raw: &str) -> Self {
        match parse_node_id(raw).as_slice() {
            [id] => NodeKey::Text(format_node_id(*id)),
            _ => NodeKey::Text(raw.trim().to_ascii_lowercase()),
        }
    }

    /// The four spellings of an id
    pub fn representations(id: u32) -> [NodeKey; 4] {
        [
            NodeKey::Numeric(id),
            NodeKey::Text(id.to_string()),
            NodeKey::Text(format_node_id(id)),
            NodeKey::Text(format!("{:08x}", id)),
        ]
    }
}

/// Parse any textual spelling of a node id
///
/// Precedence:
/// - a `!` or `0x` prefix always means hex, padded or not
/// - all-digit input is decimal; eight digits are also valid hex, so they
///   yield both readings, decimal first
/// - anything else of up to eight hex digits is hex
///
/// Callers needing one id take the first reading, so configure hex ids
/// with the `!` prefix.
pub fn parse_node_id(raw: &str) -> Vec<u32> {
    let raw = raw.trim().to_ascii_lowercase();

    if let Some(hex) = raw.strip_prefix('!').or_else(|| raw.strip_prefix("0x")) {
        return parse_hex(hex).into_iter().collect();
    }

    let mut ids = Vec::with_capacity(2);
    if raw.bytes().all(|b| b.is_ascii_digit()) {
        ids.extend(raw.parse::<u32>().ok());
        if raw.len() == 8 {
            if let Some(id) = parse_hex(&raw).filter(|id| !ids.contains(id)) {
                ids.push(id);
            }
        }
    } else {
        ids.extend(parse_hex(&raw));
    }
    ids
}

fn parse_hex(digits: &str) -> Option<u32> {
    if digits.is_empty() || digits.len() > 8 || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u32::from_str_radix(digits, 16).ok()
}

/// What we know about a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeEntry {
    /// Display name
    pub long_name: String,
    /// Abbreviation shown on radio screens
    pub short_name: Option<String>,
    /// When the node was last heard
    pub last_heard: Option<DateTime<Utc>>,
}

impl NodeEntry {
    /// Entry with only a name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            long_name: name.into(),
            short_name: None,
            last_heard: None,
        }
    }
}

/// Thread-safe node directory
#[derive(Debug, Default)]
pub struct NodeDirectory {
    entries: RwLock<HashMap<NodeKey, NodeEntry>>,
}

impl NodeDirectory {
    /// Empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory seeded from configured `id -> name` pairs, keyed as written
    pub fn from_known(known: &HashMap<String, String>) -> Self {
        let directory = Self::new();
        for (id, name) in known {
            directory.insert(NodeKey::text(id), NodeEntry::named(name.clone()));
        }
        directory
    }

    /// Store an entry under one key
    pub fn insert(&self, key: NodeKey, entry: NodeEntry) {
        trace!(?key, name = %entry.long_name, "Directory entry stored");
        self.entries.write().insert(key, entry);
    }

    /// Record a node heard on the air under its numeric id
    pub fn upsert_heard(&self, id: u32, long_name: &str, short_name: Option<&str>) {
        let mut entries = self.entries.write();
        let entry = entries
            .entry(NodeKey::Numeric(id))
            .or_insert_with(|| NodeEntry::named(long_name));
        entry.long_name = long_name.to_string();
        if let Some(short) = short_name {
            entry.short_name = Some(short.to_string());
        }
        entry.last_heard = Some(Utc::now());
    }

    /// Find a node by numeric id, trying all four spellings
    pub fn lookup(&self, id: u32) -> Option<NodeEntry> {
        let entries = self.entries.read();
        NodeKey::representations(id)
            .iter()
            .find_map(|key| entries.get(key).cloned())
    }

    /// Find a node by any textual spelling
    pub fn lookup_str(&self, raw: &str) -> Option<NodeEntry> {
        if let Some(entry) = self.entries.read().get(&NodeKey::text(raw)) {
            return Some(entry.clone());
        }
        parse_node_id(raw).into_iter().find_map(|id| self.lookup(id))
    }

    /// Display name for a node
    pub fn name_of(&self, id: u32) -> Option<String> {
        self.lookup(id).map(|entry| entry.long_name)
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// No entries
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
