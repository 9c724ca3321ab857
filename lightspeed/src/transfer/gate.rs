//! Process-wide admission control for transfers.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::{Error, Result};

/// Bounds the number of simultaneously active sessions.
///
/// Admission never queues: a saturated gate rejects immediately.
#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    limit: usize,
}

/// Scoped admission; dropping it frees the slot.
#[derive(Debug)]
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
}

impl ConcurrencyGate {
    pub fn new(limit: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    pub fn try_acquire(&self) -> Result<GatePermit> {
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => {
                debug!(held = self.held(), limit = self.limit, "Transfer admitted");
                Ok(GatePermit { _permit: permit })
            }
            Err(_) => Err(Error::CapacityExceeded { limit: self.limit }),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Number of permits currently held.
    pub fn held(&self) -> usize {
        self.limit
            .saturating_sub(self.semaphore.available_permits())
    }
}
