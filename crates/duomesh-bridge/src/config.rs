//! Configuration types for the dual-network bridge
//!
//! This module provides configuration structures for each radio link
//! (transport, channel keys, health timing, reconnect policy) and for the
//! router as a whole (dedup window, sender memory, watchdog escalation).

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::codec::ChannelKeys;
use crate::error::{BridgeError, Result};
use crate::packet::Network;

/// Maximum payload size for Network A LoRa packets
pub const LORA_MAX_PAYLOAD: usize = 237;

/// Network A framing magic number (first 2 bytes)
pub const MESHTASTIC_MAGIC: u16 = 0x94C3;

/// Network B frame start byte, device to host
pub const COMPANION_INBOUND_START: u8 = 0x3E;

/// Network B frame start byte, host to device
pub const COMPANION_OUTBOUND_START: u8 = 0x3C;

/// Default baud rate for serial radios
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Default TCP API port of networked radios
pub const DEFAULT_TCP_PORT: u16 = 4403;

/// Default maximum hop limit for outgoing packets
pub const DEFAULT_MAX_HOPS: u8 = 3;

/// Maximum allowed hops
pub const MAX_HOP_LIMIT: u8 = 7;

/// Minimum ratio between silence timeout and check interval
pub const MIN_SILENCE_RATIO: u32 = 4;

/// Default wait for a frame before reporting "no data"
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Pause inserted after every "no data ready" read
pub const IDLE_BACKOFF: Duration = Duration::from_millis(10);

/// Default health check cadence
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Default silence allowed before reconnecting
pub const DEFAULT_SILENCE_TIMEOUT: Duration = Duration::from_secs(120);

/// Default self-broadcast dedup window
pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(60);

/// Default lifetime of a sender -> network record
pub const DEFAULT_SENDER_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Default reconnect attempts before escalating
pub const DEFAULT_RECONNECT_ATTEMPTS: u32 = 3;

/// Default minimum gap between watchdog escalations per component
pub const DEFAULT_ESCALATION_COOLDOWN: Duration = Duration::from_secs(15 * 60);

/// Check that a health timing pair cannot produce periodic false reconnects
///
/// An interval so large that the ratio overflows is never safe.
pub fn is_health_timing_safe(check_interval: Duration, silence_timeout: Duration) -> bool {
    if check_interval.is_zero() {
        return false;
    }
    check_interval
        .checked_mul(MIN_SILENCE_RATIO)
        .is_some_and(|floor| silence_timeout >= floor)
}

/// Like [`is_health_timing_safe`], as a configuration error
pub fn check_health_timing(check_interval: Duration, silence_timeout: Duration) -> Result<()> {
    if is_health_timing_safe(check_interval, silence_timeout) {
        Ok(())
    } else {
        Err(BridgeError::UnsafeHealthTiming {
            check_interval,
            silence_timeout,
        })
    }
}

/// Main configuration for the bridge
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Configured links, primary first
    #[serde(default)]
    pub networks: Vec<NetworkConfig>,

    /// Network used for cold replies (defaults to the primary)
    #[serde(default)]
    pub default_network: Option<Network>,

    /// Self-broadcast suppression settings
    #[serde(default)]
    pub dedup: DedupConfig,

    /// Sender memory settings
    #[serde(default)]
    pub routing: RoutingConfig,

    /// Escalation settings
    #[serde(default)]
    pub watchdog: WatchdogConfig,

    /// Pre-populated node names, keyed by any node id representation
    #[serde(default)]
    pub known_nodes: HashMap<String, String>,
}

impl BridgeConfig {
    /// Parse from a JSON string
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: BridgeConfig = serde_json::from_str(json)
            .map_err(|e| BridgeError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&text)
    }

    /// The primary network, if any link is configured
    pub fn primary_network(&self) -> Option<Network> {
        self.networks.first().map(|n| n.network)
    }

    /// Network used when a reply target has no recorded origin
    pub fn cold_reply_network(&self) -> Option<Network> {
        self.default_network.or_else(|| self.primary_network())
    }

    /// Configuration for one network
    pub fn network(&self, network: Network) -> Option<&NetworkConfig> {
        self.networks.iter().find(|n| n.network == network)
    }

    /// Validate the whole tree
    pub fn validate(&self) -> Result<()> {
        if self.networks.len() > 2 {
            return Err(BridgeError::InvalidConfig(format!(
                "at most two networks supported, got {}",
                self.networks.len()
            )));
        }
        if self.networks.len() == 2 && self.networks[0].network == self.networks[1].network {
            return Err(BridgeError::InvalidConfig(format!(
                "{} configured twice",
                self.networks[0].network
            )));
        }
        if let Some(default) = self.default_network {
            if self.network(default).is_none() {
                return Err(BridgeError::InvalidConfig(format!(
                    "default network {} is not configured",
                    default
                )));
            }
        }
        for network in &self.networks {
            network.validate()?;
        }
        if self.dedup.window.is_zero() {
            return Err(BridgeError::InvalidConfig(
                "dedup window must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration for one radio link
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Which network this link carries
    pub network: Network,

    /// How to reach the radio
    pub transport: TransportConfig,

    /// Channel PSKs keyed by channel index (hex, `default`, shorthand `1`..`10`, or `none`)
    #[serde(default)]
    pub channel_keys: BTreeMap<u8, String>,

    /// Our node id in any representation; learned from the radio when absent
    #[serde(default)]
    pub node_id: Option<String>,

    /// Health supervision timing
    #[serde(default)]
    pub health: HealthConfig,

    /// Reconnection behavior
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Hop limit for outgoing packets
    #[serde(default = "default_max_hops")]
    pub max_hops: u8,
}

fn default_max_hops() -> u8 {
    DEFAULT_MAX_HOPS
}

impl NetworkConfig {
    /// Link over TCP
    pub fn tcp(network: Network, host: impl Into<String>, port: u16) -> Self {
        Self::with_transport(
            network,
            TransportConfig::Tcp {
                host: host.into(),
                port,
            },
        )
    }

    /// Link over a serial port
    pub fn serial(network: Network, port: impl Into<PathBuf>) -> Self {
        Self::with_transport(
            network,
            TransportConfig::Serial {
                port: port.into(),
                baud_rate: DEFAULT_BAUD_RATE,
            },
        )
    }

    fn with_transport(network: Network, transport: TransportConfig) -> Self {
        Self {
            network,
            transport,
            channel_keys: BTreeMap::new(),
            node_id: None,
            health: HealthConfig::default(),
            reconnect: ReconnectConfig::default(),
            max_hops: DEFAULT_MAX_HOPS,
        }
    }

    /// Add a channel key
    pub fn channel_key(mut self, index: u8, psk: impl Into<String>) -> Self {
        self.channel_keys.insert(index, psk.into());
        self
    }

    /// Set our node id
    pub fn node_id(mut self, id: impl Into<String>) -> Self {
        self.node_id = Some(id.into());
        self
    }

    /// Override health timing
    pub fn health(mut self, health: HealthConfig) -> Self {
        self.health = health;
        self
    }

    /// Override reconnect policy
    pub fn reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Validate this link
    pub fn validate(&self) -> Result<()> {
        self.health.validate()?;
        if self.reconnect.max_attempts == 0 {
            return Err(BridgeError::InvalidConfig(format!(
                "{}: reconnect.max_attempts must be at least 1",
                self.network
            )));
        }
        if self.max_hops > MAX_HOP_LIMIT {
            return Err(BridgeError::InvalidConfig(format!(
                "{}: max_hops {} exceeds {}",
                self.network, self.max_hops, MAX_HOP_LIMIT
            )));
        }
        if !(0.0..=1.0).contains(&self.reconnect.jitter) {
            return Err(BridgeError::InvalidConfig(format!(
                "{}: reconnect.jitter must be within 0..=1",
                self.network
            )));
        }
        ChannelKeys::from_config(&self.channel_keys)?;
        Ok(())
    }
}

/// How to reach a radio
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    /// Serial port connection
    Serial {
        /// Path to serial port (e.g., /dev/ttyUSB0, COM3)
        port: PathBuf,
        /// Baud rate (default: 115200)
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
    },
    /// TCP connection to a networked radio
    Tcp {
        /// Host address
        host: String,
        /// Port number
        #[serde(default = "default_tcp_port")]
        port: u16,
    },
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

fn default_tcp_port() -> u16 {
    DEFAULT_TCP_PORT
}

impl TransportConfig {
    /// Human readable endpoint for logs
    pub fn endpoint(&self) -> String {
        match self {
            TransportConfig::Serial { port, .. } => format!("serial:{}", port.display()),
            TransportConfig::Tcp { host, port } => format!("tcp:{}:{}", host, port),
        }
    }
}

/// Health supervision timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Cadence of the periodic health check
    #[serde(with = "humantime_serde", default = "default_check_interval")]
    pub check_interval: Duration,

    /// Silence tolerated before reconnecting (>= 4x check interval)
    #[serde(with = "humantime_serde", default = "default_silence_timeout")]
    pub silence_timeout: Duration,

    /// Wait for a frame before reporting "no data"; bounds shutdown latency
    #[serde(with = "humantime_serde", default = "default_read_timeout")]
    pub read_timeout: Duration,

    /// Interval between keepalive frames
    #[serde(with = "humantime_serde", default = "default_keepalive_interval")]
    pub keepalive_interval: Duration,
}

fn default_check_interval() -> Duration {
    DEFAULT_CHECK_INTERVAL
}

fn default_silence_timeout() -> Duration {
    DEFAULT_SILENCE_TIMEOUT
}

fn default_read_timeout() -> Duration {
    DEFAULT_READ_TIMEOUT
}

fn default_keepalive_interval() -> Duration {
    Duration::from_secs(300)
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval: DEFAULT_CHECK_INTERVAL,
            silence_timeout: DEFAULT_SILENCE_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            keepalive_interval: default_keepalive_interval(),
        }
    }
}

impl HealthConfig {
    /// Validate timing
    pub fn validate(&self) -> Result<()> {
        check_health_timing(self.check_interval, self.silence_timeout)?;
        if self.read_timeout.is_zero() {
            return Err(BridgeError::InvalidConfig(
                "health.read_timeout must be non-zero".to_string(),
            ));
        }
        if self.keepalive_interval.is_zero() {
            return Err(BridgeError::InvalidConfig(
                "health.keepalive_interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Reconnection behavior configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Attempts before the link is declared failed and escalated
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first reconnection attempt
    #[serde(with = "humantime_serde", default = "default_initial_delay")]
    pub initial_delay: Duration,

    /// Maximum delay between reconnection attempts
    #[serde(with = "humantime_serde", default = "default_max_delay")]
    pub max_delay: Duration,

    /// Fractional jitter applied to each delay (0.25 = +/-25%)
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_max_attempts() -> u32 {
    DEFAULT_RECONNECT_ATTEMPTS
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_jitter() -> f64 {
    0.25
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            jitter: default_jitter(),
        }
    }
}

/// Self-broadcast suppression configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// How long a sent broadcast is remembered
    #[serde(with = "humantime_serde", default = "default_dedup_window")]
    pub window: Duration,

    /// Upper bound on remembered broadcasts
    #[serde(default = "default_dedup_capacity")]
    pub capacity: usize,
}

fn default_dedup_window() -> Duration {
    DEFAULT_DEDUP_WINDOW
}

fn default_dedup_capacity() -> usize {
    256
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_DEDUP_WINDOW,
            capacity: default_dedup_capacity(),
        }
    }
}

/// Sender memory configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Lifetime of a sender -> network record
    #[serde(with = "humantime_serde", default = "default_sender_ttl")]
    pub sender_ttl: Duration,

    /// Cadence of the eviction sweep
    #[serde(with = "humantime_serde", default = "default_sweep_interval")]
    pub sweep_interval: Duration,
}

fn default_sender_ttl() -> Duration {
    DEFAULT_SENDER_TTL
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(600)
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            sender_ttl: DEFAULT_SENDER_TTL,
            sweep_interval: default_sweep_interval(),
        }
    }
}

/// Watchdog escalation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogConfig {
    /// Marker file watched by the external supervisor (None = log only)
    #[serde(default)]
    pub marker_path: Option<PathBuf>,

    /// Minimum gap between escalations for the same component
    #[serde(with = "humantime_serde", default = "default_escalation_cooldown")]
    pub cooldown: Duration,

    /// Prefix for component names in markers
    #[serde(default = "default_component_prefix")]
    pub component_prefix: String,
}

fn default_escalation_cooldown() -> Duration {
    DEFAULT_ESCALATION_COOLDOWN
}

fn default_component_prefix() -> String {
    "duomesh".to_string()
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            marker_path: None,
            cooldown: DEFAULT_ESCALATION_COOLDOWN,
            component_prefix: default_component_prefix(),
        }
    }
}

/// Builder for BridgeConfig
#[derive(Debug, Default)]
pub struct BridgeConfigBuilder {
    config: BridgeConfig,
}

impl BridgeConfigBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a link; the first one added is the primary
    pub fn network(mut self, network: NetworkConfig) -> Self {
        self.config.networks.push(network);
        self
    }

    /// Network for cold replies
    pub fn default_network(mut self, network: Network) -> Self {
        self.config.default_network = Some(network);
        self
    }

    /// Self-broadcast dedup window
    pub fn dedup_window(mut self, window: Duration) -> Self {
        self.config.dedup.window = window;
        self
    }

    /// Sender record lifetime
    pub fn sender_ttl(mut self, ttl: Duration) -> Self {
        self.config.routing.sender_ttl = ttl;
        self
    }

    /// Watchdog marker file
    pub fn marker_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.watchdog.marker_path = Some(path.into());
        self
    }

    /// Escalation cooldown
    pub fn escalation_cooldown(mut self, cooldown: Duration) -> Self {
        self.config.watchdog.cooldown = cooldown;
        self
    }

    /// Pre-populate a node name
    pub fn known_node(mut self, id: impl Into<String>, name: impl Into<String>) -> Self {
        self.config.known_nodes.insert(id.into(), name.into());
        self
    }

    /// Build without validation
    pub fn build(self) -> BridgeConfig {
        self.config
    }

    /// Build and validate
    pub fn try_build(self) -> Result<BridgeConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

// Custom serde module for Duration with humantime
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_health_timing_is_safe() {
        let health = HealthConfig::default();
        assert_eq!(health.check_interval, Duration::from_secs(30));
        assert_eq!(health.silence_timeout, Duration::from_secs(120));
        assert!(health.validate().is_ok());
    }

    #[test]
    fn test_ratio_below_four_is_flagged() {
        let check = Duration::from_secs(30);
        for silence in [0, 30, 60, 90, 119] {
            assert!(
                !is_health_timing_safe(check, Duration::from_secs(silence)),
                "{silence}s should be unsafe"
            );
        }
        assert!(is_health_timing_safe(check, Duration::from_secs(120)));
        assert!(is_health_timing_safe(check, Duration::from_secs(600)));
    }

    #[test]
    fn test_ratio_check_across_intervals() {
        for check_secs in 1..=60u64 {
            let check = Duration::from_secs(check_secs);
            let just_under = check * MIN_SILENCE_RATIO - Duration::from_millis(1);
            assert!(!is_health_timing_safe(check, just_under));
            assert!(check_health_timing(check, just_under).is_err());
            assert!(is_health_timing_safe(check, check * MIN_SILENCE_RATIO));
        }
    }

    #[test]
    fn test_zero_check_interval_rejected() {
        assert!(!is_health_timing_safe(Duration::ZERO, Duration::from_secs(120)));
    }

    #[test]
    fn test_huge_check_interval_rejected_without_panic() {
        assert!(!is_health_timing_safe(Duration::MAX, Duration::MAX));
        assert!(!is_health_timing_safe(Duration::MAX / 2, Duration::MAX));

        let config = BridgeConfigBuilder::new()
            .network(NetworkConfig::tcp(Network::A, "127.0.0.1", 4403).health(HealthConfig {
                check_interval: Duration::MAX,
                silence_timeout: Duration::MAX,
                ..Default::default()
            }))
            .build();
        assert!(matches!(
            config.validate(),
            Err(BridgeError::UnsafeHealthTiming { .. })
        ));
    }

    #[test]
    fn test_unsafe_network_rejected_by_validate() {
        let config = BridgeConfigBuilder::new()
            .network(NetworkConfig::tcp(Network::A, "127.0.0.1", 4403).health(HealthConfig {
                check_interval: Duration::from_secs(30),
                silence_timeout: Duration::from_secs(60),
                ..Default::default()
            }))
            .build();

        assert!(matches!(
            config.validate(),
            Err(BridgeError::UnsafeHealthTiming { .. })
        ));
    }

    #[test]
    fn test_duplicate_network_rejected() {
        let result = BridgeConfigBuilder::new()
            .network(NetworkConfig::tcp(Network::A, "a", 4403))
            .network(NetworkConfig::tcp(Network::A, "b", 4403))
            .try_build();
        assert!(result.is_err());
    }

    #[test]
    fn test_bad_channel_key_rejected() {
        let result = BridgeConfigBuilder::new()
            .network(NetworkConfig::tcp(Network::A, "a", 4403).channel_key(1, "not-a-key"))
            .try_build();
        assert!(matches!(result, Err(BridgeError::InvalidConfig(_))));

        let ok = BridgeConfigBuilder::new()
            .network(NetworkConfig::tcp(Network::A, "a", 4403).channel_key(1, "default"))
            .try_build();
        assert!(ok.is_ok());
    }

    #[test]
    fn test_default_network_must_be_configured() {
        let result = BridgeConfigBuilder::new()
            .network(NetworkConfig::tcp(Network::A, "a", 4403))
            .default_network(Network::B)
            .try_build();
        assert!(result.is_err());
    }

    #[test]
    fn test_cold_reply_network_falls_back_to_primary() {
        let config = BridgeConfigBuilder::new()
            .network(NetworkConfig::tcp(Network::B, "b", 5000))
            .network(NetworkConfig::tcp(Network::A, "a", 4403))
            .build();
        assert_eq!(config.primary_network(), Some(Network::B));
        assert_eq!(config.cold_reply_network(), Some(Network::B));

        let config = BridgeConfigBuilder::new()
            .network(NetworkConfig::tcp(Network::B, "b", 5000))
            .network(NetworkConfig::tcp(Network::A, "a", 4403))
            .default_network(Network::A)
            .build();
        assert_eq!(config.cold_reply_network(), Some(Network::A));
    }

    #[test]
    fn test_json_loading() {
        let json = r#"{
            "networks": [
                {
                    "network": "a",
                    "transport": { "type": "tcp", "host": "10.0.0.5" },
                    "channel_keys": { "0": "default" },
                    "health": { "check_interval": "15s", "silence_timeout": "1m" }
                },
                {
                    "network": "b",
                    "transport": { "type": "serial", "port": "/dev/ttyACM0" }
                }
            ],
            "default_network": "a",
            "dedup": { "window": "90s" }
        }"#;

        let config = BridgeConfig::from_json_str(json).unwrap();
        assert_eq!(config.networks.len(), 2);
        let a = config.network(Network::A).unwrap();
        assert_eq!(a.health.check_interval, Duration::from_secs(15));
        assert_eq!(a.health.silence_timeout, Duration::from_secs(60));
        assert_eq!(a.channel_keys.get(&0).map(String::as_str), Some("default"));
        assert!(matches!(
            a.transport,
            TransportConfig::Tcp { port: DEFAULT_TCP_PORT, .. }
        ));
        let b = config.network(Network::B).unwrap();
        assert!(matches!(
            b.transport,
            TransportConfig::Serial { baud_rate: DEFAULT_BAUD_RATE, .. }
        ));
        assert_eq!(config.dedup.window, Duration::from_secs(90));
        assert_eq!(config.routing.sender_ttl, DEFAULT_SENDER_TTL);
    }

    #[test]
    fn test_shipped_node_config_loads() {
        let config =
            BridgeConfig::from_json_str(include_str!("../../duomesh-node/config/duomesh.json"))
                .unwrap();
        assert_eq!(config.primary_network(), Some(Network::A));
        assert_eq!(config.cold_reply_network(), Some(Network::A));
        assert_eq!(config.watchdog.cooldown, DEFAULT_ESCALATION_COOLDOWN);
        assert_eq!(config.known_nodes.len(), 1);
    }

    #[test]
    fn test_json_with_unsafe_timing_rejected() {
        let json = r#"{
            "networks": [{
                "network": "a",
                "transport": { "type": "tcp", "host": "radio" },
                "health": { "check_interval": "30s", "silence_timeout": "90s" }
            }]
        }"#;
        assert!(BridgeConfig::from_json_str(json).is_err());
    }

    #[test]
    fn test_config_roundtrips_through_json() {
        let config = BridgeConfigBuilder::new()
            .network(NetworkConfig::tcp(Network::A, "radio", 4403).channel_key(0, "default"))
            .known_node("!a1b2c3d4", "base")
            .build();
        let json = serde_json::to_string_pretty(&config).unwrap();
        let recovered = BridgeConfig::from_json_str(&json).unwrap();
        assert_eq!(recovered.networks.len(), 1);
        assert_eq!(recovered.known_nodes.get("!a1b2c3d4").unwrap(), "base");
    }
}
