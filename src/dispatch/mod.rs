//! RPC dispatcher: method table, argument checks, and the handler boundary.
//!
//! The table is derived from the interfaces a module declares. Every
//! declared method needs a binding and nothing else may be bound, so the
//! callable surface always matches what `list_interfaces` advertises.
//!
//! Each inbound call runs its handler on a fresh task. Errors and panics
//! stop at this boundary: they are classified, logged, fed into fault
//! escalation, and returned to the caller as a failure result.

mod guard;

pub use guard::{ExclusiveGuard, ExclusiveLock};

use crate::comm::{Call, CallResult};
use crate::interfaces::{InterfaceCatalog, MethodSignature, IMODULE, LIST_INTERFACES};
use crate::module::recovery::with_recovery;
use crate::module::{ModuleContext, ModuleState};
use crate::types::{Error, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Type-erased method implementation.
pub type Handler =
    Arc<dyn Fn(Arc<ModuleContext>, Vec<Value>) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Wrap an async closure as a [`Handler`].
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Arc<ModuleContext>, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(move |ctx, args| f(ctx, args).boxed())
}

/// Decode positional argument `index`. Arguments were already checked
/// against the signature, so failures here mean a handler/signature mismatch.
pub fn arg<T: DeserializeOwned>(args: &[Value], index: usize) -> Result<T> {
    let value = args.get(index).cloned().unwrap_or(Value::Null);
    serde_json::from_value(value)
        .map_err(|e| Error::invocation(format!("argument {}: {}", index, e)))
}

// =============================================================================
// Method table
// =============================================================================

struct MethodEntry {
    interface: String,
    signature: MethodSignature,
    handler: Handler,
}

/// Immutable method table of one module.
pub struct MethodTable {
    interfaces: BTreeSet<String>,
    entries: HashMap<String, MethodEntry>,
}

impl fmt::Debug for MethodTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut methods: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        methods.sort_unstable();
        f.debug_struct("MethodTable")
            .field("interfaces", &self.interfaces)
            .field("methods", &methods)
            .finish()
    }
}

impl MethodTable {
    /// Start a table for the declared interfaces. `IModule` is always added.
    pub fn builder<'a>(
        catalog: &InterfaceCatalog,
        declared: impl IntoIterator<Item = &'a str>,
    ) -> Result<MethodTableBuilder> {
        let interfaces =
            catalog.closure_of(declared.into_iter().chain(std::iter::once(IMODULE)))?;
        let methods = catalog.methods_of(interfaces.iter().map(String::as_str))?;
        Ok(MethodTableBuilder {
            interfaces,
            declared: methods
                .into_iter()
                .map(|(name, m)| (name, (m.interface, m.signature)))
                .collect(),
            handlers: HashMap::new(),
            errors: Vec::new(),
        })
    }

    /// Implemented interfaces, including everything they extend.
    pub fn interfaces(&self) -> &BTreeSet<String> {
        &self.interfaces
    }

    pub fn signature(&self, method: &str) -> Option<&MethodSignature> {
        self.entries.get(method).map(|e| &e.signature)
    }
}

/// Collects bindings; [`build`](Self::build) checks them against the
/// declared interfaces.
pub struct MethodTableBuilder {
    interfaces: BTreeSet<String>,
    declared: HashMap<String, (String, MethodSignature)>,
    handlers: HashMap<String, Handler>,
    errors: Vec<String>,
}

impl fmt::Debug for MethodTableBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodTableBuilder")
            .field("interfaces", &self.interfaces)
            .field("bound", &self.handlers.len())
            .field("errors", &self.errors)
            .finish()
    }
}

impl MethodTableBuilder {
    /// Bind an async closure to a declared method.
    pub fn bind<F, Fut>(self, method: &str, f: F) -> Self
    where
        F: Fn(Arc<ModuleContext>, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.bind_handler(method, handler(f))
    }

    pub fn bind_handler(mut self, method: &str, handler: Handler) -> Self {
        if !self.declared.contains_key(method) {
            self.errors.push(format!(
                "{} is not declared by any implemented interface",
                method
            ));
        } else if self.handlers.insert(method.to_string(), handler).is_some() {
            self.errors.push(format!("{} is bound twice", method));
        }
        self
    }

    pub fn is_bound(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    pub fn build(mut self) -> Result<MethodTable> {
        let mut missing: Vec<&str> = self
            .declared
            .keys()
            .filter(|m| !self.handlers.contains_key(*m))
            .map(String::as_str)
            .collect();
        missing.sort_unstable();
        if !missing.is_empty() {
            self.errors
                .push(format!("declared methods without binding: {}", missing.join(", ")));
        }
        if !self.errors.is_empty() {
            return Err(Error::validation(self.errors.join("; ")));
        }

        let mut entries = HashMap::with_capacity(self.declared.len());
        for (name, (interface, signature)) in self.declared {
            if let Some(handler) = self.handlers.remove(&name) {
                entries.insert(
                    name,
                    MethodEntry {
                        interface,
                        signature,
                        handler,
                    },
                );
            }
        }
        Ok(MethodTable {
            interfaces: self.interfaces,
            entries,
        })
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Answers inbound calls for one module.
#[derive(Debug)]
pub struct Dispatcher {
    ctx: Arc<ModuleContext>,
    table: MethodTable,
}

impl Dispatcher {
    pub fn new(ctx: Arc<ModuleContext>, table: MethodTable) -> Self {
        Self { ctx, table }
    }

    pub fn table(&self) -> &MethodTable {
        &self.table
    }

    pub async fn dispatch(&self, call: Call) -> CallResult {
        if call.method == LIST_INTERFACES {
            return CallResult::Success(Value::from(
                self.table.interfaces.iter().cloned().collect::<Vec<_>>(),
            ));
        }

        let Some(entry) = self.table.entries.get(&call.method) else {
            tracing::debug!("{} called unknown method {}", call.caller, call.method);
            return Error::invocation(format!("unknown method: {}", call.method)).to_failure();
        };
        if let Err(e) = entry.signature.check_args(&call.args) {
            tracing::debug!("{} sent bad arguments to {}: {}", call.caller, call.method, e);
            return e.to_failure();
        }

        if entry.interface != IMODULE && self.ctx.state().await == ModuleState::SevereError {
            return Error::module(format!(
                "module is in severe error state: {}",
                self.ctx.error_string().await
            ))
            .to_failure();
        }

        let operation = format!("{}.{}", self.ctx.identity(), call.method);
        let outcome = with_recovery((entry.handler)(self.ctx.clone(), call.args), &operation).await;

        match outcome {
            Ok(value) => CallResult::Success(value),
            Err(e) => {
                tracing::warn!("{} called by {} failed: {}", operation, call.caller, e);
                self.ctx.record_error(&e).await;
                e.to_failure()
            }
        }
    }
}
