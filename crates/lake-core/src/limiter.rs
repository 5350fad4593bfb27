//! Fixed-capacity admission limiter shared by both execution paths

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};

/// Bounds the number of statements executing at once.
///
/// Slots are held through RAII permits, so every exit path releases its slot
/// exactly once.
#[derive(Debug, Clone)]
pub struct ExecutionLimiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl ExecutionLimiter {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait for a slot. Returns None if `cancel` fires first.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Option<OwnedSemaphorePermit> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Slot wait abandoned by cancellation");
                None
            }
            permit = self.semaphore.clone().acquire_owned() => permit.ok(),
        }
    }

    /// Take a slot without waiting; fails with TooManyRequests when saturated.
    pub fn try_acquire(&self) -> Result<OwnedSemaphorePermit> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .map_err(|_| Error::TooManyRequests)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently held
    pub fn active(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }
}
