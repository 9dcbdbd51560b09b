//! Capability-checked handles on remote modules.
//!
//! A [`Proxy`] is bound to one peer and one interface (plus everything that
//! interface extends). It holds no connection state of its own; every call
//! goes straight to [`Comm::send_call`](crate::comm::Comm::send_call).
//! Proxies are obtained from the [`InterfaceRegistry`], which confirms the
//! peer actually implements the interface first. Failures the peer reports
//! are passed to the registry's [`RemoteFailureSink`], if one is set.

pub mod registry;
pub mod typed;

pub use registry::InterfaceRegistry;
pub use typed::{AbortableProxy, CameraProxy, ModuleProxy, TypedProxy};

use crate::comm::Comm;
use crate::interfaces::MethodSignature;
use crate::types::{Error, ErrorKind, Identity, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Receives the failures peers report back through proxies.
#[async_trait]
pub trait RemoteFailureSink: Send + Sync {
    async fn remote_failure(&self, peer: &Identity, kind: ErrorKind, message: &str);
}

/// Handle for calling one interface on one peer.
#[derive(Clone)]
pub struct Proxy {
    target: Identity,
    interface: String,
    methods: Arc<BTreeMap<String, MethodSignature>>,
    comm: Arc<dyn Comm>,
    default_timeout: Duration,
    failures: Option<Weak<dyn RemoteFailureSink>>,
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("target", &self.target)
            .field("interface", &self.interface)
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Proxy {
    pub(crate) fn new(
        target: Identity,
        interface: String,
        methods: BTreeMap<String, MethodSignature>,
        comm: Arc<dyn Comm>,
        default_timeout: Duration,
        failures: Option<Weak<dyn RemoteFailureSink>>,
    ) -> Self {
        Self {
            target,
            interface,
            methods: Arc::new(methods),
            comm,
            default_timeout,
            failures,
        }
    }

    pub fn target(&self) -> &Identity {
        &self.target
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn has_method(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    /// Invoke `method` on the peer.
    ///
    /// The deadline is `deadline` if given, else the method's own timeout,
    /// else the module's default call timeout. Methods outside the bound
    /// interface and malformed arguments fail locally without any traffic.
    pub async fn call(
        &self,
        method: &str,
        args: Vec<Value>,
        deadline: Option<Duration>,
    ) -> Result<Value> {
        let Some(signature) = self.methods.get(method) else {
            return Err(Error::invocation(format!(
                "{} is not a method of {}",
                method, self.interface
            )));
        };
        signature.check_args(&args)?;

        let deadline = deadline
            .or(signature.timeout)
            .unwrap_or(self.default_timeout);
        tracing::debug!("calling {}.{} (deadline {:?})", self.target, method, deadline);
        let result = self
            .comm
            .send_call(&self.target, method, args, deadline)
            .await?
            .into_result(&self.target);

        if let Err(Error::Remote { kind, message, .. }) = &result {
            if let Some(sink) = self.failures.as_ref().and_then(Weak::upgrade) {
                sink.remote_failure(&self.target, *kind, message).await;
            }
        }
        result
    }

    /// [`call`](Self::call) and decode the returned value.
    pub async fn call_as<T: DeserializeOwned>(
        &self,
        method: &str,
        args: Vec<Value>,
        deadline: Option<Duration>,
    ) -> Result<T> {
        let value = self.call(method, args, deadline).await?;
        serde_json::from_value(value).map_err(|e| {
            Error::invocation(format!(
                "{}.{} returned an unexpected value: {}",
                self.target, method, e
            ))
        })
    }
}
