//! Fault escalation: sliding-window error log and module state machine.
//!
//! ```text
//!   Ok ──first significant error──▶ Error ──threshold reached──▶ SevereError
//!    ▲                                                               │
//!    └──────────────────────────── reset ◀───────────────────────────┘
//! ```
//! A kind reaches its threshold when the number of its records inside the
//! kind's window is at least the configured threshold. SevereError is
//! sticky until reset.
//!
//! Failures reported by peers are kept in the same log but counted per
//! (kind, peer) under their own rule. A peer that keeps failing moves this
//! module to Error, never further.

use crate::types::{EscalationConfig, ErrorKind, Identity};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::time::Instant;

/// Health state of a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModuleState {
    #[default]
    Ok,
    Error,
    SevereError,
}

impl ModuleState {
    pub fn as_str(self) -> &'static str {
        match self {
            ModuleState::Ok => "OK",
            ModuleState::Error => "ERROR",
            ModuleState::SevereError => "SEVERE_ERROR",
        }
    }
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One logged error.
#[derive(Debug, Clone)]
pub struct ExceptionRecord {
    pub kind: ErrorKind,
    pub at: Instant,
    pub message: String,
    /// Peer that reported the failure; `None` for local errors.
    pub peer: Option<Identity>,
}

/// A state change produced by [`FaultEscalation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTransition {
    pub from: ModuleState,
    pub to: ModuleState,
    /// Kind that caused the change; `None` for a reset.
    pub kind: Option<ErrorKind>,
    pub message: String,
}

/// Per-module error log and state machine.
#[derive(Debug)]
pub struct FaultEscalation {
    config: EscalationConfig,
    records: VecDeque<ExceptionRecord>,
    state: ModuleState,
    error_string: String,
}

impl FaultEscalation {
    pub fn new(config: EscalationConfig) -> Self {
        Self {
            records: VecDeque::with_capacity(config.log_capacity.min(1024)),
            config,
            state: ModuleState::Ok,
            error_string: String::new(),
        }
    }

    pub fn state(&self) -> ModuleState {
        self.state
    }

    /// Message of the most recent significant error, empty when healthy.
    pub fn error_string(&self) -> &str {
        &self.error_string
    }

    pub fn records(&self) -> impl Iterator<Item = &ExceptionRecord> {
        self.records.iter()
    }

    /// Local records of `kind` inside that kind's window, as of `now`.
    pub fn count_in_window(&self, kind: ErrorKind, now: Instant) -> usize {
        let window = self.config.rule_for(kind).window;
        self.records
            .iter()
            .filter(|r| {
                r.peer.is_none() && r.kind == kind && now.saturating_duration_since(r.at) <= window
            })
            .count()
    }

    /// Failures of `kind` reported by `peer` inside the remote window.
    pub fn count_remote(&self, kind: ErrorKind, peer: &Identity, now: Instant) -> usize {
        let window = self.config.remote_rule.window;
        self.records
            .iter()
            .filter(|r| {
                r.kind == kind
                    && r.peer.as_ref() == Some(peer)
                    && now.saturating_duration_since(r.at) <= window
            })
            .count()
    }

    /// Log an error and advance the state machine.
    pub fn record(
        &mut self,
        kind: ErrorKind,
        message: impl Into<String>,
        at: Instant,
    ) -> Option<StateTransition> {
        let message = message.into();
        self.push(kind, message.clone(), None, at);

        if !self.config.is_significant(kind) {
            return None;
        }
        self.error_string = message.clone();

        let target = if self.count_in_window(kind, at) >= self.config.rule_for(kind).threshold {
            ModuleState::SevereError
        } else {
            ModuleState::Error
        };
        // States only move forward within an episode.
        if target <= self.state {
            return None;
        }
        let from = std::mem::replace(&mut self.state, target);
        Some(StateTransition {
            from,
            to: target,
            kind: Some(kind),
            message,
        })
    }

    /// Log a failure reported by `peer` and advance the state machine.
    ///
    /// Once the peer's count for `kind` reaches the remote threshold, a
    /// healthy module moves to Error.
    pub fn record_remote(
        &mut self,
        kind: ErrorKind,
        peer: &Identity,
        message: impl Into<String>,
        at: Instant,
    ) -> Option<StateTransition> {
        let message = message.into();
        self.push(kind, message.clone(), Some(peer.clone()), at);

        if !self.config.is_remote_significant(kind)
            || self.count_remote(kind, peer, at) < self.config.remote_rule.threshold
            || self.state >= ModuleState::Error
        {
            return None;
        }
        let message = format!("severe error in {} module: {}", peer, message);
        self.error_string = message.clone();
        let from = std::mem::replace(&mut self.state, ModuleState::Error);
        Some(StateTransition {
            from,
            to: ModuleState::Error,
            kind: Some(kind),
            message,
        })
    }

    /// Clear the log and return to Ok.
    pub fn reset(&mut self) -> Option<StateTransition> {
        self.records.clear();
        self.error_string.clear();
        if self.state == ModuleState::Ok {
            return None;
        }
        let from = std::mem::replace(&mut self.state, ModuleState::Ok);
        Some(StateTransition {
            from,
            to: ModuleState::Ok,
            kind: None,
            message: "error state reset".to_string(),
        })
    }

    fn push(&mut self, kind: ErrorKind, message: String, peer: Option<Identity>, at: Instant) {
        self.prune(at);
        if self.records.len() >= self.config.log_capacity {
            self.records.pop_front();
        }
        self.records.push_back(ExceptionRecord {
            kind,
            at,
            message,
            peer,
        });
    }

    fn prune(&mut self, now: Instant) {
        let horizon = self.config.longest_window();
        while let Some(front) = self.records.front() {
            if now.saturating_duration_since(front.at) > horizon {
                self.records.pop_front();
            } else {
                break;
            }
        }
    }
}
