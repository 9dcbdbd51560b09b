//! # obsbus - capability-based RPC and typed events for control modules
//!
//! Independent control processes ("modules": telescope, camera, dome,
//! scheduler, ...) discover each other's capabilities, call each other's
//! methods, and broadcast typed notifications. Each module tracks its own
//! fault history and degrades predictably under repeated failure.
//!
//! ## Architecture
//!
//! ```text
//!   caller module                                 target module
//!  ┌──────────────────────┐                    ┌──────────────────────┐
//!  │ InterfaceRegistry    │  list_interfaces   │ Dispatcher           │
//!  │   └─▶ Proxy ─────────┼──── Comm ─────────▶│   └─▶ handler task   │
//!  │                      │                    │         │ error      │
//!  │ EventBus ◀───────────┼──── events ◀───────┼─ FaultEscalation     │
//!  └──────────────────────┘                    └──────────────────────┘
//! ```
//!
//! - [`comm`]: transport trait with an in-process and a TCP hub backend
//! - [`interfaces`]: capability descriptors and the built-in catalog
//! - [`proxy`]: capability lookup, single-flight caching, proxies
//! - [`dispatch`]: method table and the handler boundary
//! - [`events`]: event type tree and the bounded-queue event bus
//! - [`module`]: module host, lifecycle, fault escalation

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod comm;
pub mod dispatch;
pub mod events;
pub mod interfaces;
pub mod module;
pub mod proxy;
pub mod types;

// Internal utilities
pub mod observability;

pub use comm::{Comm, Inbound};
pub use events::{Event, EventBus, EventPayload};
pub use module::{Module, ModuleContext, ModuleState};
pub use proxy::{InterfaceRegistry, Proxy};
pub use types::{
    BusConfig, Config, Error, ErrorKind, EscalationConfig, Identity, ModuleConfig, Result,
    TransportConfig,
};
