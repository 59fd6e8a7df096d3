//! Named admission gates shared by every dispatch session.
//!
//! Both limiters are plain values handed to the components that need them,
//! so tests can inject small capacities and observe contention.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use burstcast_core::{BurstError, Result};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Bounds the number of in-flight sends across all sessions.
#[derive(Debug, Clone)]
pub struct SendLimiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl SendLimiter {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait for a send slot, or `None` once `cancel` fires.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Option<OwnedSemaphorePermit> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            permit = self.semaphore.clone().acquire_owned() => permit.ok(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently free.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// Serializes every endpoint/sub-target creation and deletion, keeping a
/// minimum spacing between consecutive calls.
#[derive(Debug, Clone)]
pub struct ProvisioningLimiter {
    semaphore: Arc<Semaphore>,
    pace: Duration,
    last_call: Arc<Mutex<Option<Instant>>>,
}

impl ProvisioningLimiter {
    pub fn new(pace: Duration) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(1)),
            pace,
            last_call: Arc::new(Mutex::new(None)),
        }
    }

    /// Run `op` while holding the single provisioning slot.
    ///
    /// Waiting for the slot and the pacing delay both end early with
    /// `BurstError::Cancelled` once `cancel` fires; `op` itself is not raced.
    pub async fn run<F, Fut, T>(&self, cancel: &CancellationToken, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BurstError::Cancelled),
            permit = self.semaphore.acquire() => permit
                .map_err(|_| BurstError::Provisioning("provisioning limiter closed".into()))?,
        };

        let wait = self
            .last_call()
            .map(|last| self.pace.saturating_sub(last.elapsed()))
            .unwrap_or_default();
        if !wait.is_zero() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(BurstError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }

        let out = op().await;
        self.mark_call();
        out
    }

    fn last_call(&self) -> Option<Instant> {
        match self.last_call.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn mark_call(&self) {
        let mut guard = match self.last_call.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Some(Instant::now());
    }
}
