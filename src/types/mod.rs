//! Core types shared by every layer.
//!
//! - **IDs**: Strongly-typed identifiers (Identity, EventId, SubscriptionId)
//! - **Errors**: Error enum, ErrorKind classification, Result alias
//! - **Config**: Module, escalation, bus and transport configuration

mod config;
mod errors;
mod ids;

pub use config::{
    BusConfig, Config, EscalationConfig, EscalationRule, ModuleConfig, OverflowPolicy,
    TransportConfig,
};
pub use errors::{Error, ErrorKind, Result};
pub use ids::{EventId, Identity, SubscriptionId};
