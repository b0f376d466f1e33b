//! Bounded admission control for simultaneous executions.
//!
//! Waiters are served in FIFO order. A slot is held by a `GateSlot` guard
//! and returned when the guard is dropped, so no code path can leak one.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::errors::SandboxError;

#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// A held execution slot
#[derive(Debug)]
pub struct GateSlot {
    _permit: OwnedSemaphorePermit,
}

impl ConcurrencyGate {
    pub fn new(capacity: usize) -> Result<Self, SandboxError> {
        if capacity == 0 {
            return Err(SandboxError::ConfigError(
                "concurrency gate capacity must be greater than 0".to_string(),
            ));
        }

        Ok(Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        })
    }

    /// Wait for a free slot
    pub async fn acquire(&self) -> Result<GateSlot, SandboxError> {
        let permit = self.semaphore.clone().acquire_owned().await.map_err(|_| {
            SandboxError::RuntimeUnavailable("execution gate is closed".to_string())
        })?;
        Ok(GateSlot { _permit: permit })
    }

    /// Take a slot only if one is free right now
    pub fn try_acquire(&self) -> Option<GateSlot> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| GateSlot { _permit: permit })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn in_use(&self) -> usize {
        self.capacity - self.available()
    }

    /// Stop admitting; current waiters and later callers get an error
    pub fn close(&self) {
        self.semaphore.close();
    }
}
