//! Bounded resource pool with scoped leases.
//!
//! A `Pool<T>` holds a fixed set of resources behind a bounded channel,
//! which doubles as a counting semaphore: `acquire` blocks while the pool
//! is empty and never hands the same resource to two callers. A `Lease`
//! returns its resource on drop, on every exit path.

use std::ops::{Deref, DerefMut};
use tokio::sync::{mpsc, Mutex};

/// Fixed-capacity pool of exclusively-leased resources.
pub struct Pool<T> {
    tx: mpsc::Sender<T>,
    rx: Mutex<mpsc::Receiver<T>>,
    capacity: usize,
}

impl<T: Send + 'static> Pool<T> {
    /// Build a pool over a fixed set of resources. Capacity equals the
    /// number of resources supplied and never grows.
    pub fn new(resources: Vec<T>) -> Self {
        let capacity = resources.len().max(1);
        let (tx, rx) = mpsc::channel(capacity);
        for resource in resources {
            // Capacity matches the resource count, so send cannot fail.
            let _ = tx.try_send(resource);
        }
        Self {
            tx,
            rx: Mutex::new(rx),
            capacity,
        }
    }

    /// Check a resource out of the pool, waiting (without timeout) until
    /// one is available.
    pub async fn acquire(&self) -> Lease<T> {
        let mut rx = self.rx.lock().await;
        // The pool owns a sender for the lifetime of `self`, so the
        // channel cannot be closed while we hold `&self`.
        let resource = rx.recv().await.expect("pool channel closed");
        Lease {
            resource: Some(resource),
            slot: self.tx.clone(),
        }
    }

    /// Remove every currently-available resource, for shutdown. Resources
    /// leased out at this point are returned to the (now-unused) channel
    /// when their leases drop.
    pub async fn drain(&self) -> Vec<T> {
        let mut rx = self.rx.lock().await;
        let mut drained = Vec::with_capacity(self.capacity);
        while let Ok(resource) = rx.try_recv() {
            drained.push(resource);
        }
        drained
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Exclusive access to one pooled resource. Dropping the lease returns the
/// resource to the pool exactly once.
pub struct Lease<T> {
    resource: Option<T>,
    slot: mpsc::Sender<T>,
}

impl<T> Deref for Lease<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Only `Drop` takes the resource out.
        self.resource.as_ref().expect("lease already released")
    }
}

impl<T> DerefMut for Lease<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.resource.as_mut().expect("lease already released")
    }
}

impl<T> Drop for Lease<T> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            // The slot we vacated is still reserved for us, so this only
            // fails if the pool itself is gone.
            if self.slot.try_send(resource).is_err() {
                tracing::debug!("Pool dropped before lease release; discarding resource");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_acquire_returns_pooled_resource() {
        let pool = Pool::new(vec![7u32]);
        let lease = pool.acquire().await;
        assert_eq!(*lease, 7);
    }

    #[tokio::test]
    async fn test_capacity_matches_resource_count() {
        let pool = Pool::new(vec![1, 2, 3]);
        assert_eq!(pool.capacity(), 3);
    }

    #[tokio::test]
    async fn test_at_most_capacity_leases_outstanding() {
        let pool = Pool::new(vec![1, 2]);
        let _a = pool.acquire().await;
        let _b = pool.acquire().await;

        // Third acquire must block until a lease is released.
        let blocked = timeout(Duration::from_millis(50), pool.acquire()).await;
        assert!(blocked.is_err(), "acquire beyond capacity did not block");
    }

    #[tokio::test]
    async fn test_release_unblocks_waiting_acquire() {
        let pool = Pool::new(vec![1]);
        let lease = pool.acquire().await;
        drop(lease);

        let lease = timeout(Duration::from_millis(50), pool.acquire()).await;
        assert!(lease.is_ok(), "released resource was not reissued");
    }

    #[tokio::test]
    async fn test_lease_released_on_error_path() {
        let pool = Pool::new(vec![1]);

        fn failing_op<T>(_lease: Lease<T>) -> Result<(), &'static str> {
            Err("operation failed")
        }

        let lease = pool.acquire().await;
        assert!(failing_op(lease).is_err());

        // The lease dropped inside the failing operation; the resource
        // must be available again.
        let reacquired = timeout(Duration::from_millis(50), pool.acquire()).await;
        assert!(reacquired.is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_acquires_never_share_a_resource() {
        use std::sync::Arc;

        let pool = Arc::new(Pool::new(vec![1, 2, 3, 4]));
        let mut tasks = Vec::new();
        for _ in 0..32 {
            let pool = Arc::clone(&pool);
            tasks.push(tokio::spawn(async move {
                let lease = pool.acquire().await;
                let value = *lease;
                tokio::time::sleep(Duration::from_millis(1)).await;
                // The resource cannot have been handed to anyone else
                // while we held the lease.
                assert_eq!(*lease, value);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_drain_empties_available_resources() {
        let pool = Pool::new(vec![1, 2, 3]);
        let lease = pool.acquire().await;

        let drained = pool.drain().await;
        assert_eq!(drained.len(), 2);

        // The outstanding lease returns to the channel on drop without
        // panicking, even though the pool has been drained.
        drop(lease);
    }
}
