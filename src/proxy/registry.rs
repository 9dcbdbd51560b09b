//! Interface registry: which peer implements what.
//!
//! Answers are cached per identity together with the transport epoch they
//! were confirmed under; an entry from an older epoch is treated as absent.
//! Concurrent lookups of the same uncached identity share one in-flight
//! `list_interfaces` query. Failed lookups are never cached.

use super::{Proxy, RemoteFailureSink, TypedProxy};
use crate::comm::Comm;
use crate::interfaces::{InterfaceCatalog, LIST_INTERFACES};
use crate::types::{Error, Identity, Result};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::Mutex;

/// Interface set of one peer.
pub type InterfaceSet = Arc<BTreeSet<String>>;

type QueryOutcome = std::result::Result<InterfaceSet, Arc<Error>>;
type SharedQuery = Shared<BoxFuture<'static, QueryOutcome>>;

#[derive(Debug, Clone)]
struct CacheEntry {
    interfaces: InterfaceSet,
    epoch: u64,
}

struct InFlight {
    flight: u64,
    epoch: u64,
    query: SharedQuery,
}

#[derive(Default)]
struct RegistryState {
    cache: HashMap<Identity, CacheEntry>,
    in_flight: HashMap<Identity, InFlight>,
    next_flight: u64,
}

/// Capability lookup and proxy factory.
pub struct InterfaceRegistry {
    comm: Arc<dyn Comm>,
    catalog: Arc<InterfaceCatalog>,
    call_timeout: Duration,
    state: Mutex<RegistryState>,
    failures: OnceLock<Weak<dyn RemoteFailureSink>>,
}

impl fmt::Debug for InterfaceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterfaceRegistry")
            .field("identity", &self.comm.identity())
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}

impl InterfaceRegistry {
    pub fn new(comm: Arc<dyn Comm>, catalog: Arc<InterfaceCatalog>, call_timeout: Duration) -> Self {
        Self {
            comm,
            catalog,
            call_timeout,
            state: Mutex::new(RegistryState::default()),
            failures: OnceLock::new(),
        }
    }

    pub fn catalog(&self) -> &InterfaceCatalog {
        &self.catalog
    }

    /// Route failures reported through proxies created from now on to
    /// `sink`. Only the first sink set is kept.
    pub fn report_failures_to(&self, sink: Weak<dyn RemoteFailureSink>) {
        if self.failures.set(sink).is_err() {
            tracing::debug!("remote failure sink already set");
        }
    }

    /// Interfaces implemented by `identity`.
    pub async fn get_interfaces(&self, identity: &Identity) -> Result<InterfaceSet> {
        let (flight, epoch, query) = {
            let mut state = self.state.lock().await;
            let current = self.comm.epoch();
            match state.cache.get(identity) {
                Some(entry) if entry.epoch == current => return Ok(entry.interfaces.clone()),
                Some(_) => {
                    state.cache.remove(identity);
                }
                None => {}
            }

            match state.in_flight.get(identity) {
                Some(existing) if existing.epoch == current => {
                    (existing.flight, existing.epoch, existing.query.clone())
                }
                _ => {
                    state.next_flight += 1;
                    let flight = state.next_flight;
                    let query = query_interfaces(self.comm.clone(), identity.clone(), self.call_timeout)
                        .boxed()
                        .shared();
                    state.in_flight.insert(
                        identity.clone(),
                        InFlight {
                            flight,
                            epoch: current,
                            query: query.clone(),
                        },
                    );
                    (flight, current, query)
                }
            }
        };

        let outcome = query.await;

        let mut state = self.state.lock().await;
        let still_current = state
            .in_flight
            .get(identity)
            .is_some_and(|f| f.flight == flight);
        if still_current {
            state.in_flight.remove(identity);
            if let Ok(interfaces) = &outcome {
                if self.comm.epoch() == epoch {
                    state.cache.insert(
                        identity.clone(),
                        CacheEntry {
                            interfaces: interfaces.clone(),
                            epoch,
                        },
                    );
                }
            }
        }
        outcome.map_err(|e| e.replicate())
    }

    /// Forget what is known about `identity`.
    pub async fn invalidate(&self, identity: &Identity) {
        let mut state = self.state.lock().await;
        state.cache.remove(identity);
        state.in_flight.remove(identity);
    }

    pub async fn invalidate_all(&self) {
        let mut state = self.state.lock().await;
        state.cache.clear();
        state.in_flight.clear();
    }

    /// Identities with a currently valid cache entry.
    pub async fn cached(&self) -> Vec<Identity> {
        let state = self.state.lock().await;
        let epoch = self.comm.epoch();
        let mut ids: Vec<Identity> = state
            .cache
            .iter()
            .filter(|(_, e)| e.epoch == epoch)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Proxy for `interface` on `identity`.
    ///
    /// Fails with `InterfaceNotSupported` when the peer does not implement
    /// the interface and everything it extends.
    pub async fn create_proxy(&self, identity: &Identity, interface: &str) -> Result<Proxy> {
        let required = self.catalog.closure(interface)?;
        let implemented = self.get_interfaces(identity).await?;
        if let Some(missing) = required.iter().find(|i| !implemented.contains(*i)) {
            return Err(Error::interface_not_supported(format!(
                "{} does not implement {} (missing {})",
                identity, interface, missing
            )));
        }
        let methods = self
            .catalog
            .methods(interface)?
            .into_iter()
            .map(|(name, resolved)| (name, resolved.signature))
            .collect();
        Ok(Proxy::new(
            identity.clone(),
            interface.to_string(),
            methods,
            self.comm.clone(),
            self.call_timeout,
            self.failures.get().cloned(),
        ))
    }

    /// Typed wrapper around [`create_proxy`](Self::create_proxy).
    pub async fn proxy<P: TypedProxy>(&self, identity: &Identity) -> Result<P> {
        Ok(P::from_proxy(self.create_proxy(identity, P::INTERFACE).await?))
    }

    /// Reachable peers implementing `interface`, sorted. Peers that fail to
    /// answer the interface query are skipped.
    pub async fn clients_with_interface(&self, interface: &str) -> Result<Vec<Identity>> {
        let required = self.catalog.closure(interface)?;
        let me = self.comm.identity();
        let mut peers = self.comm.peers().await;
        peers.sort();

        let mut found = Vec::new();
        for peer in peers.into_iter().filter(|p| *p != me) {
            match self.get_interfaces(&peer).await {
                Ok(set) if required.is_subset(&set) => found.push(peer),
                Ok(_) => {}
                Err(e) => tracing::debug!("skipping {}: {}", peer, e),
            }
        }
        Ok(found)
    }
}

async fn query_interfaces(
    comm: Arc<dyn Comm>,
    identity: Identity,
    deadline: Duration,
) -> QueryOutcome {
    let run = async {
        tracing::debug!("querying interfaces of {}", identity);
        let value = comm
            .send_call(&identity, LIST_INTERFACES, Vec::new(), deadline)
            .await?
            .into_result(&identity)?;
        let names: Vec<String> = serde_json::from_value(value).map_err(|e| {
            Error::remote(identity.as_str(), format!("malformed interface list: {}", e))
        })?;
        Ok::<_, Error>(Arc::new(names.into_iter().collect::<BTreeSet<_>>()))
    };
    run.await.map_err(Arc::new)
}
