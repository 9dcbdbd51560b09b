//! In-process transport.
//!
//! A [`LocalNetwork`] connects any number of [`LocalComm`] endpoints living
//! in the same process. Calls run the target's handler on a spawned task;
//! events travel through each endpoint's unbounded inbox and are pumped in
//! order.

use super::{pump_inbound, Call, CallResult, Comm, Inbound, InboundMessage, PendingCalls};
use crate::events::Event;
use crate::types::{Error, Identity, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

#[derive(Clone)]
struct Endpoint {
    inbound: Arc<dyn Inbound>,
    inbox: mpsc::UnboundedSender<InboundMessage>,
}

/// Shared in-process network.
#[derive(Default)]
pub struct LocalNetwork {
    endpoints: RwLock<HashMap<Identity, Endpoint>>,
}

impl fmt::Debug for LocalNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalNetwork")
            .field("identities", &self.identities())
            .finish()
    }
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create an endpoint. It joins the network on `connect`.
    pub fn comm(self: &Arc<Self>, identity: Identity) -> LocalComm {
        LocalComm {
            identity,
            network: self.clone(),
            epoch: AtomicU64::new(0),
            pending: Arc::new(PendingCalls::new()),
            session: Mutex::new(None),
        }
    }

    /// Connected identities, sorted.
    pub fn identities(&self) -> Vec<Identity> {
        let mut ids: Vec<Identity> = self.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<Identity, Endpoint>> {
        self.endpoints.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<Identity, Endpoint>> {
        self.endpoints.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn join(&self, identity: &Identity, endpoint: Endpoint) -> Result<()> {
        let mut endpoints = self.write();
        if endpoints.contains_key(identity) {
            return Err(Error::connection(format!(
                "identity {} is already connected",
                identity
            )));
        }
        for (other, peer) in endpoints.iter() {
            if other != identity {
                let _ = peer.inbox.send(InboundMessage::PeerJoined(identity.clone()));
            }
        }
        endpoints.insert(identity.clone(), endpoint);
        Ok(())
    }

    fn leave(&self, identity: &Identity) {
        let mut endpoints = self.write();
        if endpoints.remove(identity).is_none() {
            return;
        }
        for peer in endpoints.values() {
            let _ = peer.inbox.send(InboundMessage::PeerLeft(identity.clone()));
        }
    }

    fn endpoint(&self, identity: &Identity) -> Option<Endpoint> {
        self.read().get(identity).cloned()
    }
}

#[derive(Debug)]
struct Session {
    _guard: DropGuard,
}

/// One module's endpoint on a [`LocalNetwork`].
pub struct LocalComm {
    identity: Identity,
    network: Arc<LocalNetwork>,
    epoch: AtomicU64,
    pending: Arc<PendingCalls>,
    session: Mutex<Option<Session>>,
}

impl fmt::Debug for LocalComm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalComm")
            .field("identity", &self.identity)
            .field("epoch", &self.epoch())
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl LocalComm {
    fn session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_connected(&self) -> bool {
        self.session().is_some()
    }
}

#[async_trait]
impl Comm for LocalComm {
    fn identity(&self) -> Identity {
        self.identity.clone()
    }

    fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    async fn connect(&self, inbound: Arc<dyn Inbound>) -> Result<()> {
        let mut session = self.session();
        if session.is_some() {
            return Err(Error::connection(format!("{} is already connected", self.identity)));
        }

        let (inbox, rx) = mpsc::unbounded_channel();
        self.network.join(
            &self.identity,
            Endpoint {
                inbound: inbound.clone(),
                inbox,
            },
        )?;

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = pump_inbound(inbound, rx) => {}
            }
        });

        *session = Some(Session {
            _guard: cancel.drop_guard(),
        });
        self.epoch.fetch_add(1, Ordering::SeqCst);
        tracing::info!("{} joined local network", self.identity);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let Some(session) = self.session().take() else {
            return Ok(());
        };
        self.network.leave(&self.identity);
        drop(session);

        let failed = self.pending.fail_all("connection lost");
        self.epoch.fetch_add(1, Ordering::SeqCst);
        tracing::info!(
            "{} left local network ({} outstanding calls failed)",
            self.identity,
            failed
        );
        Ok(())
    }

    async fn send_call(
        &self,
        target: &Identity,
        method: &str,
        args: Vec<Value>,
        deadline: Duration,
    ) -> Result<CallResult> {
        if !self.is_connected() {
            return Err(Error::connection(format!("{} is not connected", self.identity)));
        }
        let endpoint = self
            .network
            .endpoint(target)
            .ok_or_else(|| Error::remote(target.as_str(), "module is not connected"))?;

        let pending = self.pending.register(target);
        let call = Call {
            id: pending.id(),
            caller: self.identity.clone(),
            target: target.clone(),
            method: method.to_string(),
            args,
            deadline_ms: u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
        };
        tracing::debug!("call {} -> {}.{}", call.id, target, method);

        let id = call.id;
        let slots = self.pending.clone();
        tokio::spawn(async move {
            let result = endpoint.inbound.handle_call(call).await;
            slots.complete(id, Ok(result));
        });

        pending.wait(deadline).await
    }

    async fn publish_event(&self, event: &Event) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::connection(format!("{} is not connected", self.identity)));
        }
        let endpoints = self.network.read();
        for (identity, peer) in endpoints.iter() {
            if *identity != self.identity {
                let _ = peer.inbox.send(InboundMessage::Event(event.clone()));
            }
        }
        Ok(())
    }

    async fn peers(&self) -> Vec<Identity> {
        self.network
            .identities()
            .into_iter()
            .filter(|id| *id != self.identity)
            .collect()
    }
}

impl Drop for LocalComm {
    fn drop(&mut self) {
        if self.session().is_some() {
            self.network.leave(&self.identity);
        }
    }
}
