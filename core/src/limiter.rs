//! Fixed-capacity admission gate for in-flight probes.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounds how many probes run at once.
///
/// At most `capacity` permits exist. An [`admit`](AdmissionGate::admit)
/// call past that suspends until a held permit drops; dropping the
/// [`Permit`] is the only release path, so a probe task cannot exit
/// without returning its slot.
pub struct AdmissionGate {
    sem: Arc<Semaphore>,
    capacity: usize,
}

impl Clone for AdmissionGate {
    fn clone(&self) -> Self {
        AdmissionGate { sem: self.sem.clone(), capacity: self.capacity }
    }
}

/// A held concurrency slot. Released on drop.
pub struct Permit {
    _inner: OwnedSemaphorePermit,
}

impl AdmissionGate {
    /// Capacity below one is clamped to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        AdmissionGate { sem: Arc::new(Semaphore::new(capacity)), capacity }
    }

    /// Waits for a free slot. The semaphore is never closed, so
    /// acquisition cannot fail.
    pub async fn admit(&self) -> Permit {
        let inner = self.sem.clone().acquire_owned().await.unwrap();
        Permit { _inner: inner }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently free.
    pub fn available(&self) -> usize {
        self.sem.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_capacity_is_clamped() {
        let gate = AdmissionGate::new(0);
        assert_eq!(gate.capacity(), 1);
    }

    #[tokio::test]
    async fn permits_return_on_drop() {
        let gate = AdmissionGate::new(2);
        let a = gate.admit().await;
        let b = gate.admit().await;
        assert_eq!(gate.available(), 0);
        drop(a);
        assert_eq!(gate.available(), 1);
        drop(b);
        assert_eq!(gate.available(), 2);
    }

    #[tokio::test]
    async fn admit_waits_for_a_free_slot() {
        let gate = AdmissionGate::new(1);
        let held = gate.admit().await;
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move {
                let _p = gate.admit().await;
            })
        };
        // The waiter cannot finish while the slot is held.
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        drop(held);
        waiter.await.unwrap();
    }
}
