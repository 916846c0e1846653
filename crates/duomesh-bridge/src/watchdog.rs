//! Escalation to an external supervising process
//!
//! When a link exhausts its reconnect budget the bridge does not restart
//! anything itself. It raises a marker `{component, timestamp, reason}` and
//! a separate, privileged supervisor decides what to do with it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::error::{BridgeError, Result};

/// Escalation request handed to the external supervisor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationMarker {
    /// Component asking for intervention (e.g. `duomesh.network-b`)
    pub component: String,
    /// When the request was raised
    pub timestamp: DateTime<Utc>,
    /// Human readable cause
    pub reason: String,
}

impl EscalationMarker {
    /// Marker stamped now
    pub fn new(component: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            timestamp: Utc::now(),
            reason: reason.into(),
        }
    }
}

/// Channel to the external supervisor
#[async_trait]
pub trait Watchdog: Send + Sync {
    /// Deliver an escalation marker
    async fn signal(&self, marker: &EscalationMarker) -> Result<()>;
}

/// Writes the marker as JSON to a file the supervisor watches
#[derive(Debug, Clone)]
pub struct MarkerFileWatchdog {
    path: PathBuf,
}

impl MarkerFileWatchdog {
    /// Watchdog writing to `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Marker file location
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read back the current marker, if any
    pub async fn read_marker(&self) -> Result<Option<EscalationMarker>> {
        match fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| BridgeError::Escalation(e.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BridgeError::Io(e)),
        }
    }
}

#[async_trait]
impl Watchdog for MarkerFileWatchdog {
    async fn signal(&self, marker: &EscalationMarker) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(marker)
            .map_err(|e| BridgeError::Escalation(e.to_string()))?;

        // write then rename so the supervisor never sees a partial marker
        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, &bytes).await?;
        fs::rename(&tmp_path, &self.path).await?;

        info!(path = %self.path.display(), component = %marker.component, "Escalation marker written");
        Ok(())
    }
}

/// Forwards markers to an in-process relay
#[derive(Debug, Clone)]
pub struct ChannelWatchdog {
    tx: mpsc::UnboundedSender<EscalationMarker>,
}

impl ChannelWatchdog {
    /// Watchdog and the receiving end of its channel
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EscalationMarker>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Watchdog for ChannelWatchdog {
    async fn signal(&self, marker: &EscalationMarker) -> Result<()> {
        self.tx
            .send(marker.clone())
            .map_err(|_| BridgeError::Escalation("relay dropped".to_string()))
    }
}

/// Logs the escalation and nothing else (no supervisor configured)
#[derive(Debug, Clone, Default)]
pub struct LogOnlyWatchdog;

#[async_trait]
impl Watchdog for LogOnlyWatchdog {
    async fn signal(&self, marker: &EscalationMarker) -> Result<()> {
        error!(
            component = %marker.component,
            reason = %marker.reason,
            "Escalation requested but no watchdog configured"
        );
        Ok(())
    }
}

/// Rate limits escalations per component
#[derive(Debug)]
pub struct EscalationPolicy {
    cooldown: Duration,
    last: Mutex<HashMap<String, Instant>>,
}

impl EscalationPolicy {
    /// Policy with a per-component cooldown
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last: Mutex::new(HashMap::new()),
        }
    }

    /// Whether `component` may escalate at `now`; records the escalation if so
    pub fn try_acquire(&self, component: &str, now: Instant) -> bool {
        let mut last = self.last.lock();
        if let Some(previous) = last.get(component) {
            if now.saturating_duration_since(*previous) < self.cooldown {
                debug!(component, "Escalation suppressed by cooldown");
                return false;
            }
        }
        last.insert(component.to_string(), now);
        true
    }
}
