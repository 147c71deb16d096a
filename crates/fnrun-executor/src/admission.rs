use fnrun_common::{FnrunError, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::debug;

/// Bounds how many sandboxes may run at once. With `max_queue` of zero an
/// invocation arriving at capacity is rejected with `Busy`; otherwise up to
/// `max_queue` invocations wait for a slot.
#[derive(Debug)]
pub struct AdmissionGate {
    permits: Arc<Semaphore>,
    capacity: usize,
    max_queue: usize,
    waiting: Arc<AtomicUsize>,
}

/// Held for the lifetime of one sandbox; the slot frees on drop.
#[derive(Debug)]
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
}

struct WaitingSlot(Arc<AtomicUsize>);

impl Drop for WaitingSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl AdmissionGate {
    pub fn new(capacity: usize, max_queue: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            max_queue,
            waiting: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_flight(&self) -> usize {
        self.capacity
            .saturating_sub(self.permits.available_permits())
    }

    pub fn queued(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    pub async fn admit(&self) -> Result<AdmissionPermit> {
        match self.permits.clone().try_acquire_owned() {
            Ok(permit) => return Ok(AdmissionPermit { _permit: permit }),
            Err(TryAcquireError::Closed) => {
                return Err(FnrunError::Internal("admission gate closed".into()))
            }
            Err(TryAcquireError::NoPermits) => {}
        }

        let busy = || {
            FnrunError::Busy(format!(
                "all {} sandbox slots in use",
                self.capacity
            ))
        };
        if self.max_queue == 0 {
            return Err(busy());
        }
        if self.waiting.fetch_add(1, Ordering::SeqCst) >= self.max_queue {
            self.waiting.fetch_sub(1, Ordering::SeqCst);
            return Err(busy());
        }
        // Releases the queue slot even if this future is dropped mid-wait
        let _slot = WaitingSlot(self.waiting.clone());
        debug!(queued = self.queued(), "Waiting for a sandbox slot");

        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| FnrunError::Internal("admission gate closed".into()))?;
        Ok(AdmissionPermit { _permit: permit })
    }

    /// `admit`, giving up with `Busy` once `limit` passes without a free slot.
    pub async fn admit_within(&self, limit: Duration) -> Result<AdmissionPermit> {
        match tokio::time::timeout(limit, self.admit()).await {
            Ok(admitted) => admitted,
            Err(_) => Err(FnrunError::Busy(format!(
                "no sandbox slot freed within {}ms",
                limit.as_millis()
            ))),
        }
    }
}
