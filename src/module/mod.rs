//! Module host: context, lifecycle, event handlers, and background tasks.
//!
//! A [`Module`] ties one [`Comm`] endpoint to a dispatcher, an event bus,
//! an interface registry, and a fault escalation machine. Handlers receive
//! an `Arc<ModuleContext>`; there is no global "current module".
//!
//! Lifecycle:
//! ```text
//!   build ──▶ open (connect, ModuleOpenedEvent) ──▶ ... ──▶ close
//!                                                           │
//!        ModuleClosedEvent, cancel `closing`, wait grace, disconnect
//! ```

pub mod escalation;
pub mod recovery;

pub use escalation::{ExceptionRecord, FaultEscalation, ModuleState, StateTransition};

use crate::comm::{Call, CallResult, Comm, Inbound};
use crate::dispatch::{handler, Dispatcher, Handler, MethodTable};
use crate::events::{
    Event, EventBus, EventPayload, ModuleClosedEvent, ModuleOpenedEvent, ModuleStateChangedEvent,
    Subscription,
};
use crate::interfaces::InterfaceCatalog;
use crate::observability::{without_capture, LogRecords};
use crate::proxy::{InterfaceRegistry, ModuleProxy, Proxy, RemoteFailureSink, TypedProxy};
use crate::types::{
    BusConfig, Config, Error, ErrorKind, EscalationConfig, Identity, ModuleConfig, Result,
};
use async_trait::async_trait;
use recovery::with_recovery;
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

// =============================================================================
// Context
// =============================================================================

/// Everything module code needs, passed explicitly to handlers.
pub struct ModuleContext {
    identity: Identity,
    config: ModuleConfig,
    comm: Arc<dyn Comm>,
    bus: Arc<EventBus>,
    registry: InterfaceRegistry,
    interfaces: BTreeSet<String>,
    faults: Mutex<FaultEscalation>,
    closing: CancellationToken,
    tracker: TaskTracker,
}

impl fmt::Debug for ModuleContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleContext")
            .field("identity", &self.identity)
            .field("interfaces", &self.interfaces)
            .field("closing", &self.closing.is_cancelled())
            .finish()
    }
}

impl ModuleContext {
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Configured label, or the identity when none is set.
    pub fn label(&self) -> &str {
        self.config
            .label
            .as_deref()
            .unwrap_or_else(|| self.identity.as_str())
    }

    pub fn version(&self) -> &str {
        &self.config.version
    }

    pub fn config(&self) -> &ModuleConfig {
        &self.config
    }

    pub fn comm(&self) -> &Arc<dyn Comm> {
        &self.comm
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn registry(&self) -> &InterfaceRegistry {
        &self.registry
    }

    /// Implemented interfaces, including `IModule` and everything extended.
    pub fn interfaces(&self) -> &BTreeSet<String> {
        &self.interfaces
    }

    pub fn implements(&self, interface: &str) -> bool {
        self.interfaces.contains(interface)
    }

    /// Cancelled when the module starts closing.
    pub fn closing(&self) -> &CancellationToken {
        &self.closing
    }

    pub fn is_closing(&self) -> bool {
        self.closing.is_cancelled()
    }

    // =========================================================================
    // Health
    // =========================================================================

    pub async fn state(&self) -> ModuleState {
        self.faults.lock().await.state()
    }

    pub async fn error_string(&self) -> String {
        self.faults.lock().await.error_string().to_string()
    }

    /// Clear the error log and return to `Ok`.
    pub async fn reset_error(&self) {
        let mut faults = self.faults.lock().await;
        if let Some(transition) = faults.reset() {
            self.announce(transition).await;
        }
    }

    /// Feed an error into fault escalation.
    ///
    /// The escalation lock is held until the resulting state change has
    /// been published, so observers see transitions in the order they
    /// happened.
    pub async fn record_error(&self, error: &Error) {
        let at = tokio::time::Instant::now().into_std();
        let mut faults = self.faults.lock().await;
        if let Some(transition) = faults.record(error.kind(), error.message(), at) {
            self.announce(transition).await;
        }
    }

    /// Feed a failure reported by `peer` into fault escalation.
    pub async fn record_remote_failure(&self, peer: &Identity, kind: ErrorKind, message: &str) {
        let at = tokio::time::Instant::now().into_std();
        let mut faults = self.faults.lock().await;
        if let Some(transition) = faults.record_remote(kind, peer, message, at) {
            self.announce(transition).await;
        }
    }

    async fn announce(&self, transition: StateTransition) {
        match transition.to {
            ModuleState::SevereError => tracing::error!(
                "{} entered {} after {}: {}",
                self.identity,
                transition.to,
                transition.kind.map_or("reset", |k| k.as_str()),
                transition.message
            ),
            ModuleState::Error => tracing::warn!(
                "{} entered {}: {}",
                self.identity,
                transition.to,
                transition.message
            ),
            ModuleState::Ok => tracing::info!("{} is {} again", self.identity, transition.to),
        }

        let payload = ModuleStateChangedEvent {
            old: transition.from,
            new: transition.to,
            kind: transition.kind,
            message: transition.message,
        };
        if let Err(e) = self.publish(&payload).await {
            tracing::debug!("state change of {} not broadcast: {}", self.identity, e);
        }
    }

    // =========================================================================
    // Events and peers
    // =========================================================================

    /// Publish a typed payload locally and to every other module.
    pub async fn publish<E: EventPayload>(&self, payload: &E) -> Result<()> {
        let event = Event::from_payload(self.identity.clone(), payload)?;
        self.publish_event(event).await
    }

    /// Local subscribers always receive the event, even if the transport
    /// refuses it.
    pub async fn publish_event(&self, event: Event) -> Result<()> {
        self.bus.publish(event.clone()).await;
        self.comm.publish_event(&event).await
    }

    pub async fn proxy<P: TypedProxy>(&self, identity: &Identity) -> Result<P> {
        self.registry.proxy(identity).await
    }

    pub async fn proxy_for(&self, identity: &Identity, interface: &str) -> Result<Proxy> {
        self.registry.create_proxy(identity, interface).await
    }

    // =========================================================================
    // Background tasks
    // =========================================================================

    /// Run `task` in the background until it returns or the module closes.
    ///
    /// A restartable task that fails or panics is started again after the
    /// configured restart delay, unless the module is closing. Failures are
    /// recorded in fault escalation either way. Tasks should watch
    /// [`closing`](Self::closing) and return once it fires.
    pub fn spawn_background<F, Fut>(
        self: &Arc<Self>,
        name: impl Into<String>,
        restartable: bool,
        task: F,
    ) -> JoinHandle<()>
    where
        F: Fn(Arc<ModuleContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        let ctx = self.clone();
        self.tracker.spawn(async move {
            loop {
                match with_recovery(task(ctx.clone()), &name).await {
                    Ok(()) => {
                        tracing::debug!("background task {} of {} finished", name, ctx.identity);
                        return;
                    }
                    Err(e) => {
                        tracing::warn!("background task {} of {} failed: {}", name, ctx.identity, e);
                        ctx.record_error(&e).await;
                    }
                }
                if !restartable || ctx.is_closing() {
                    return;
                }
                tokio::select! {
                    _ = ctx.closing.cancelled() => return,
                    _ = tokio::time::sleep(ctx.config.restart_delay) => {}
                }
                tracing::info!("restarting background task {} of {}", name, ctx.identity);
            }
        })
    }
}

#[async_trait]
impl RemoteFailureSink for ModuleContext {
    async fn remote_failure(&self, peer: &Identity, kind: ErrorKind, message: &str) {
        self.record_remote_failure(peer, kind, message).await;
    }
}

// =============================================================================
// Module
// =============================================================================

/// A hosted module.
pub struct Module {
    ctx: Arc<ModuleContext>,
    inbound: Arc<ModuleInbound>,
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module").field("ctx", &self.ctx).finish()
    }
}

impl std::ops::Deref for Module {
    type Target = ModuleContext;

    fn deref(&self) -> &ModuleContext {
        &self.ctx
    }
}

impl Module {
    /// Start building a module on top of `comm`. The module's identity is
    /// the transport's identity.
    pub fn builder(comm: Arc<dyn Comm>) -> ModuleBuilder {
        ModuleBuilder::new(comm)
    }

    pub fn context(&self) -> &Arc<ModuleContext> {
        &self.ctx
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inbound.dispatcher
    }

    /// Connect and announce this module.
    pub async fn open(&self) -> Result<()> {
        let inbound: Arc<dyn Inbound> = self.inbound.clone();
        self.ctx.comm.connect(inbound).await?;
        tracing::info!(
            "module {} opened (version {}, interfaces {:?})",
            self.ctx.identity,
            self.ctx.version(),
            self.ctx.interfaces
        );
        let opened = ModuleOpenedEvent {
            label: self.ctx.label().to_string(),
            version: self.ctx.version().to_string(),
        };
        if let Err(e) = self.ctx.publish(&opened).await {
            tracing::warn!("could not announce {}: {}", self.ctx.identity, e);
        }
        Ok(())
    }

    /// Announce, stop background work, and disconnect.
    ///
    /// Waits up to the configured grace period for tracked tasks; after that
    /// it proceeds anyway.
    pub async fn close(&self) -> Result<()> {
        if let Err(e) = self.ctx.publish(&ModuleClosedEvent {}).await {
            tracing::debug!("close of {} not broadcast: {}", self.ctx.identity, e);
        }
        self.ctx.closing.cancel();
        self.ctx.tracker.close();

        let grace = self.ctx.config.shutdown_grace;
        if tokio::time::timeout(grace, self.ctx.tracker.wait()).await.is_err() {
            tracing::warn!(
                "{} background task(s) of {} still running after {:?}",
                self.ctx.tracker.len(),
                self.ctx.identity,
                grace
            );
        }

        let disconnected = self.ctx.comm.disconnect().await;
        self.ctx.registry.invalidate_all().await;
        self.ctx.bus.close_all().await;
        tracing::info!("module {} closed", self.ctx.identity);
        disconnected
    }

    /// Open, run until `shutdown` resolves or the module is closed from
    /// within, then close.
    pub async fn run<S>(&self, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        self.open().await?;
        tokio::select! {
            _ = shutdown => tracing::info!("shutdown requested for {}", self.ctx.identity),
            _ = self.ctx.closing.cancelled() => {}
        }
        self.close().await
    }

    /// Subscribe to `event_type` and its descendants.
    pub async fn subscribe(&self, event_type: &str) -> Subscription {
        self.ctx
            .bus
            .subscribe(self.ctx.identity.clone(), event_type)
            .await
    }

    /// Invoke `handler` for every event of `event_type` (or a descendant)
    /// until the module closes. Events are handled one at a time.
    pub async fn on_event<F, Fut>(&self, event_type: &str, handler: F) -> JoinHandle<()>
    where
        F: Fn(Arc<ModuleContext>, Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let subscription = self.subscribe(event_type).await;
        let ctx = self.ctx.clone();
        self.ctx.tracker.spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = ctx.closing.cancelled() => break,
                    event = subscription.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                let event_type = event.event_type.clone();
                if let Err(e) = handler(ctx.clone(), event).await {
                    tracing::warn!(
                        "{} failed handling {}: {}",
                        ctx.identity,
                        event_type,
                        e
                    );
                    ctx.record_error(&e).await;
                }
            }
        })
    }

    /// Typed variant of [`on_event`](Self::on_event).
    pub async fn on<E, F, Fut>(&self, handler: F) -> JoinHandle<()>
    where
        E: EventPayload,
        F: Fn(Arc<ModuleContext>, Event, E) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.on_event(E::EVENT_TYPE, move |ctx, event| {
            let handler = handler.clone();
            async move {
                let payload: E = event.decode()?;
                handler(ctx, event, payload).await
            }
        })
        .await
    }

    /// Broadcast queued log records as [`LogEvent`](crate::events::LogEvent)s
    /// until the module closes or the queue's layer is gone.
    ///
    /// Whatever is logged while publishing is not queued again.
    pub fn forward_logs(&self, mut records: LogRecords) -> JoinHandle<()> {
        let ctx = self.ctx.clone();
        self.ctx.tracker.spawn(without_capture(async move {
            loop {
                let record = tokio::select! {
                    _ = ctx.closing.cancelled() => break,
                    record = records.recv() => match record {
                        Some(record) => record,
                        None => break,
                    },
                };
                if let Err(e) = ctx.publish(&record).await {
                    tracing::debug!("log record of {} not broadcast: {}", ctx.identity, e);
                }
            }
            if records.dropped() > 0 {
                tracing::debug!(
                    "{} dropped {} log record(s) on a full queue",
                    ctx.identity,
                    records.dropped()
                );
            }
        }))
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Assembles a [`Module`]: declared interfaces, method bindings, config.
pub struct ModuleBuilder {
    comm: Arc<dyn Comm>,
    config: ModuleConfig,
    escalation: EscalationConfig,
    bus: BusConfig,
    catalog: InterfaceCatalog,
    declared: Vec<String>,
    bindings: Vec<(String, Handler)>,
}

impl fmt::Debug for ModuleBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleBuilder")
            .field("identity", &self.comm.identity())
            .field("declared", &self.declared)
            .field("bound", &self.bindings.len())
            .finish()
    }
}

impl ModuleBuilder {
    fn new(comm: Arc<dyn Comm>) -> Self {
        Self {
            comm,
            config: ModuleConfig::default(),
            escalation: EscalationConfig::default(),
            bus: BusConfig::default(),
            catalog: InterfaceCatalog::builtin(),
            declared: Vec::new(),
            bindings: Vec::new(),
        }
    }

    /// Apply the module, escalation, and bus sections of `config`.
    pub fn with_config(mut self, config: &Config) -> Self {
        self.config = config.module.clone();
        self.escalation = config.escalation.clone();
        self.bus = config.bus.clone();
        self
    }

    pub fn config(mut self, config: ModuleConfig) -> Self {
        self.config = config;
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.config.label = Some(label.into());
        self
    }

    pub fn escalation(mut self, escalation: EscalationConfig) -> Self {
        self.escalation = escalation;
        self
    }

    pub fn bus_config(mut self, bus: BusConfig) -> Self {
        self.bus = bus;
        self
    }

    /// Replace the interface catalog (the built-in one by default).
    pub fn catalog(mut self, catalog: InterfaceCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Declare an implemented interface.
    pub fn implements(mut self, interface: impl Into<String>) -> Self {
        self.declared.push(interface.into());
        self
    }

    /// Bind a method of a declared interface.
    pub fn bind<F, Fut>(mut self, method: impl Into<String>, f: F) -> Self
    where
        F: Fn(Arc<ModuleContext>, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.bindings.push((method.into(), handler(f)));
        self
    }

    pub fn build(self) -> Result<Module> {
        self.escalation.validate()?;
        self.bus.validate()?;

        let mut table = MethodTable::builder(&self.catalog, self.declared.iter().map(String::as_str))?;
        for (method, handler) in imodule_handlers() {
            table = table.bind_handler(method, handler);
        }
        for (method, handler) in self.bindings {
            table = table.bind_handler(&method, handler);
        }
        let table = table.build()?;

        let catalog = Arc::new(self.catalog);
        let ctx = Arc::new(ModuleContext {
            identity: self.comm.identity(),
            registry: InterfaceRegistry::new(
                self.comm.clone(),
                catalog,
                self.config.call_timeout,
            ),
            interfaces: table.interfaces().clone(),
            faults: Mutex::new(FaultEscalation::new(self.escalation)),
            bus: Arc::new(EventBus::new(self.bus)),
            config: self.config,
            comm: self.comm,
            closing: CancellationToken::new(),
            tracker: TaskTracker::new(),
        });
        let sink: Weak<dyn RemoteFailureSink> = Arc::downgrade(&ctx) as Weak<ModuleContext>;
        ctx.registry.report_failures_to(sink);
        let inbound = Arc::new(ModuleInbound {
            ctx: ctx.clone(),
            dispatcher: Dispatcher::new(ctx.clone(), table),
        });
        Ok(Module { ctx, inbound })
    }
}

fn imodule_handlers() -> Vec<(&'static str, Handler)> {
    vec![
        (
            "get_state",
            handler(|ctx, _| async move { Ok(Value::from(ctx.state().await.as_str())) }),
        ),
        (
            "get_error_string",
            handler(|ctx, _| async move { Ok(Value::String(ctx.error_string().await)) }),
        ),
        (
            "reset_error",
            handler(|ctx, _| async move {
                ctx.reset_error().await;
                Ok(Value::Bool(true))
            }),
        ),
        (
            "get_label",
            handler(|ctx, _| async move { Ok(Value::from(ctx.label())) }),
        ),
        (
            "get_version",
            handler(|ctx, _| async move { Ok(Value::from(ctx.version())) }),
        ),
    ]
}

// =============================================================================
// Inbound
// =============================================================================

/// Transport-facing side of a module.
struct ModuleInbound {
    ctx: Arc<ModuleContext>,
    dispatcher: Dispatcher,
}

#[async_trait]
impl Inbound for ModuleInbound {
    async fn handle_call(&self, call: Call) -> CallResult {
        self.dispatcher.dispatch(call).await
    }

    async fn handle_event(&self, event: Event) {
        if event.is::<ModuleClosedEvent>() {
            self.ctx.registry.invalidate(&event.origin).await;
        } else if event.is::<ModuleOpenedEvent>() {
            // The announcement can trail calls already answered by the peer,
            // so it must not drop their cache entry. A peer re-opening under
            // the same identity always leaves first, and `peer_left` drops it.
            if self.ctx.config.check_peer_versions && !self.ctx.is_closing() {
                let ctx = self.ctx.clone();
                let peer = event.origin.clone();
                self.ctx.tracker.spawn(async move {
                    check_peer_version(&ctx, &peer).await;
                });
            }
        }
        self.ctx.bus.publish(event).await;
    }

    async fn peer_joined(&self, identity: &Identity) {
        tracing::debug!("{} sees {} join", self.ctx.identity, identity);
    }

    async fn peer_left(&self, identity: &Identity) {
        tracing::debug!("{} sees {} leave", self.ctx.identity, identity);
        self.ctx.registry.invalidate(identity).await;
    }
}

async fn check_peer_version(ctx: &ModuleContext, peer: &Identity) {
    let version = match ctx.proxy::<ModuleProxy>(peer).await {
        Ok(proxy) => proxy.get_version().await,
        Err(e) => Err(e),
    };
    match version {
        Ok(version) if major_version(&version) != major_version(ctx.version()) => {
            tracing::warn!(
                "version mismatch: {} runs {} but {} runs {}",
                peer,
                version,
                ctx.identity,
                ctx.version()
            );
        }
        Ok(_) => {}
        Err(e) => tracing::debug!("could not check version of {}: {}", peer, e),
    }
}

fn major_version(version: &str) -> &str {
    let version = version.trim().trim_start_matches('v');
    version.split('.').next().unwrap_or(version)
}
