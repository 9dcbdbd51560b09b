//! Configuration structures.
//!
//! Every section deserializes from any serde source and falls back to its
//! `Default` for missing fields. Durations use humantime strings ("60s").

use crate::types::{Error, ErrorKind, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Complete configuration for one module process.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub module: ModuleConfig,

    #[serde(default)]
    pub escalation: EscalationConfig,

    #[serde(default)]
    pub bus: BusConfig,

    #[serde(default)]
    pub transport: TransportConfig,
}

impl Config {
    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        self.escalation.validate()?;
        self.bus.validate()?;
        self.transport.validate()
    }
}

// =============================================================================
// Module
// =============================================================================

/// Module host configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleConfig {
    /// Human readable label returned by `get_label`.
    pub label: Option<String>,

    /// Version string returned by `get_version`.
    pub version: String,

    /// Deadline for outbound calls whose method carries no timeout hint.
    #[serde(with = "humantime_serde")]
    pub call_timeout: Duration,

    /// How long `close` waits for background tasks before giving up.
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,

    /// Pause before a failed restartable background task runs again.
    #[serde(with = "humantime_serde")]
    pub restart_delay: Duration,

    /// Compare major versions with peers announcing themselves.
    pub check_peer_versions: bool,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            label: None,
            version: env!("CARGO_PKG_VERSION").to_string(),
            call_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(30),
            restart_delay: Duration::from_secs(1),
            check_peer_versions: true,
        }
    }
}

// =============================================================================
// Fault escalation
// =============================================================================

/// Threshold/window pair for one error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationRule {
    /// Same-kind records inside the window needed to reach SevereError.
    pub threshold: usize,

    #[serde(with = "humantime_serde")]
    pub window: Duration,
}

impl Default for EscalationRule {
    fn default() -> Self {
        Self {
            threshold: 3,
            window: Duration::from_secs(60),
        }
    }
}

/// Fault escalation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    /// Kinds that move the module out of Ok. Others are logged only.
    pub significant_kinds: Vec<ErrorKind>,

    /// Rule applied to kinds without an override.
    pub default_rule: EscalationRule,

    /// Per-kind overrides.
    pub rules: BTreeMap<ErrorKind, EscalationRule>,

    /// Kinds that count when reported by a peer.
    pub remote_kinds: Vec<ErrorKind>,

    /// Failures of one kind from one peer needed to move this module to Error.
    pub remote_rule: EscalationRule,

    /// Maximum number of records kept in the log.
    pub log_capacity: usize,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            significant_kinds: vec![
                ErrorKind::Motion,
                ErrorKind::Image,
                ErrorKind::Module,
                ErrorKind::General,
            ],
            default_rule: EscalationRule::default(),
            rules: BTreeMap::new(),
            remote_kinds: vec![
                ErrorKind::Motion,
                ErrorKind::Image,
                ErrorKind::Module,
                ErrorKind::General,
            ],
            remote_rule: EscalationRule::default(),
            log_capacity: 256,
        }
    }
}

impl EscalationConfig {
    pub fn rule_for(&self, kind: ErrorKind) -> EscalationRule {
        self.rules.get(&kind).copied().unwrap_or(self.default_rule)
    }

    pub fn is_significant(&self, kind: ErrorKind) -> bool {
        self.significant_kinds.contains(&kind)
    }

    pub fn is_remote_significant(&self, kind: ErrorKind) -> bool {
        self.remote_kinds.contains(&kind)
    }

    /// Longest window of any rule; records older than this are pruned.
    pub fn longest_window(&self) -> Duration {
        self.rules
            .values()
            .map(|r| r.window)
            .fold(self.default_rule.window.max(self.remote_rule.window), Duration::max)
    }

    pub fn validate(&self) -> Result<()> {
        if self.log_capacity == 0 {
            return Err(Error::validation("escalation log_capacity must be > 0"));
        }
        if self.remote_rule.threshold == 0 {
            return Err(Error::validation("remote escalation threshold must be > 0"));
        }
        let rules = std::iter::once((None, &self.default_rule))
            .chain(self.rules.iter().map(|(k, r)| (Some(*k), r)));
        for (kind, rule) in rules {
            if rule.threshold == 0 {
                return Err(Error::validation(match kind {
                    Some(kind) => format!("escalation threshold for {} must be > 0", kind),
                    None => "default escalation threshold must be > 0".to_string(),
                }));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Event bus
// =============================================================================

/// What a full subscriber queue does with the next event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest queued event to make room.
    #[default]
    DropOldest,
    /// Discard the incoming event.
    DropNewest,
}

/// Event bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Per-subscriber queue capacity.
    pub queue_capacity: usize,

    pub overflow: OverflowPolicy,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            overflow: OverflowPolicy::DropOldest,
        }
    }
}

impl BusConfig {
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(Error::validation("bus queue_capacity must be > 0"));
        }
        Ok(())
    }
}

// =============================================================================
// Transport
// =============================================================================

/// TCP transport configuration, shared by the hub and its clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Hub address (clients connect here, the hub binds here).
    pub hub_addr: String,

    /// Maximum frame payload size in bytes.
    pub max_frame_bytes: u32,

    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Time a new connection has to send its Hello frame.
    #[serde(with = "humantime_serde")]
    pub hello_timeout: Duration,

    /// Connections silent for longer than this are dropped by the hub.
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,

    /// Slow consumers that cannot accept a frame within this window are dropped.
    #[serde(with = "humantime_serde")]
    pub write_timeout: Duration,

    /// Interval between client keepalive frames. Must be below `read_timeout`.
    #[serde(with = "humantime_serde")]
    pub keepalive_interval: Duration,

    /// Maximum concurrent hub connections.
    pub max_connections: usize,

    /// Per-connection outbound frame queue.
    pub outbound_queue: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            hub_addr: "127.0.0.1:7420".to_string(),
            max_frame_bytes: 5 * 1024 * 1024,
            connect_timeout: Duration::from_secs(5),
            hello_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(15),
            max_connections: 256,
            outbound_queue: 1024,
        }
    }
}

impl TransportConfig {
    /// Set the silence timeout, shortening the keepalive interval to a
    /// third of it when the current interval would not fit.
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self.keepalive_interval = self.keepalive_interval.min(read_timeout / 3);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.read_timeout.is_zero() || self.keepalive_interval.is_zero() {
            return Err(Error::validation(
                "read_timeout and keepalive_interval must be > 0",
            ));
        }
        if self.keepalive_interval >= self.read_timeout {
            return Err(Error::validation(
                "keepalive_interval must be shorter than read_timeout",
            ));
        }
        if self.max_connections == 0 || self.outbound_queue == 0 {
            return Err(Error::validation(
                "max_connections and outbound_queue must be > 0",
            ));
        }
        Ok(())
    }
}
