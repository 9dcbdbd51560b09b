//! Fail-fast exclusive access for hardware operations.

use crate::types::{Error, Result};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Lock held for the duration of one hardware operation.
///
/// A second caller does not queue: it fails at once with a `BusyError`,
/// so a call such as `expose` cannot silently wait behind another exposure.
#[derive(Debug, Clone)]
pub struct ExclusiveLock {
    name: Arc<str>,
    inner: Arc<Mutex<()>>,
}

/// Held while the operation runs; released on drop.
#[derive(Debug)]
pub struct ExclusiveGuard {
    _guard: OwnedMutexGuard<()>,
}

impl ExclusiveLock {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Arc::from(name.into()),
            inner: Arc::new(Mutex::new(())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn acquire(&self) -> Result<ExclusiveGuard> {
        self.inner
            .clone()
            .try_lock_owned()
            .map(|guard| ExclusiveGuard { _guard: guard })
            .map_err(|_| Error::busy(format!("{} is busy", self.name)))
    }

    pub fn is_busy(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}
