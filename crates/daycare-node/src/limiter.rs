use std::sync::Arc;

use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

/// Host-wide gate on the number of sandboxes running at once.
///
/// Waiting for a slot has no timeout: under load requests queue rather than
/// being turned away. The slot is returned when the permit is dropped.
#[derive(Clone, Debug)]
pub struct Limiter {
    slots: Arc<Semaphore>,
    capacity: usize,
}

impl Limiter {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, AcquireError> {
        self.slots.clone().acquire_owned().await
    }
}
