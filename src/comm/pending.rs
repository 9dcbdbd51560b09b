//! Outstanding-call bookkeeping shared by the transports.
//!
//! Each outbound call owns a slot keyed by its call id. The reply, a
//! rejection, a timeout, or a lost connection resolves the slot exactly
//! once; anything arriving after that finds no slot and is dropped.

use super::CallResult;
use crate::types::{Error, Identity, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;

type Outcome = Result<CallResult>;

#[derive(Debug)]
struct Slot {
    target: Identity,
    tx: oneshot::Sender<Outcome>,
}

/// Table of calls waiting for a reply.
#[derive(Debug, Default)]
pub struct PendingCalls {
    slots: Mutex<HashMap<u64, Slot>>,
    next_id: AtomicU64,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<u64, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate a call id and its slot.
    pub fn register(&self, target: &Identity) -> PendingCall<'_> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.slots().insert(
            id,
            Slot {
                target: target.clone(),
                tx,
            },
        );
        PendingCall {
            calls: self,
            id,
            target: target.clone(),
            rx: Some(rx),
        }
    }

    /// Resolve a slot. Returns false if nobody is waiting any more.
    pub fn complete(&self, id: u64, outcome: Outcome) -> bool {
        let Some(slot) = self.slots().remove(&id) else {
            tracing::debug!("Dropping late reply for call {}", id);
            return false;
        };
        slot.tx.send(outcome).is_ok()
    }

    /// Resolve a slot only if `responder` is the peer the call went to.
    pub fn complete_from(&self, id: u64, responder: &Identity, outcome: Outcome) -> bool {
        let mut slots = self.slots();
        match slots.get(&id) {
            Some(slot) if slot.target == *responder => {}
            Some(slot) => {
                tracing::warn!(
                    "Ignoring reply to call {} from {}: call went to {}",
                    id,
                    responder,
                    slot.target
                );
                return false;
            }
            None => {
                tracing::debug!("Dropping late reply for call {}", id);
                return false;
            }
        }
        let Some(slot) = slots.remove(&id) else {
            return false;
        };
        drop(slots);
        slot.tx.send(outcome).is_ok()
    }

    /// Fail every outstanding call. Returns how many were waiting.
    pub fn fail_all(&self, reason: &str) -> usize {
        let drained: Vec<Slot> = self.slots().drain().map(|(_, slot)| slot).collect();
        let count = drained.len();
        for slot in drained {
            let _ = slot.tx.send(Err(Error::remote(slot.target.as_str(), reason)));
        }
        count
    }

    /// Fail the outstanding calls addressed to one peer.
    pub fn fail_target(&self, target: &Identity, reason: &str) -> usize {
        let ids: Vec<u64> = self
            .slots()
            .iter()
            .filter(|(_, slot)| slot.target == *target)
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .filter(|id| self.complete(*id, Err(Error::remote(target.as_str(), reason))))
            .count()
    }

    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle for one outstanding call. Dropping it releases the slot.
#[derive(Debug)]
pub struct PendingCall<'a> {
    calls: &'a PendingCalls,
    id: u64,
    target: Identity,
    rx: Option<oneshot::Receiver<Outcome>>,
}

impl PendingCall<'_> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the outcome, at most `deadline`.
    pub async fn wait(mut self, deadline: Duration) -> Result<CallResult> {
        let Some(rx) = self.rx.take() else {
            return Err(Error::connection_lost(self.target.as_str()));
        };
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_closed)) => Err(Error::connection_lost(self.target.as_str())),
            Err(_elapsed) => Err(Error::remote_timeout(
                self.target.as_str(),
                format!("no reply to call {} within {:?}", self.id, deadline),
            )),
        }
    }
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        self.calls.slots().remove(&self.id);
    }
}
