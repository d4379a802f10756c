use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{Semaphore, TryAcquireError};

use crate::error::DbError;

/// Held permit for a mode lock. Releasing is dropping.
#[derive(Debug)]
pub struct LockPermit {
    _permit: tokio::sync::OwnedSemaphorePermit,
}

/// Cancellable, fair async mutex serializing work on a shared connection.
///
/// Built on a single-permit tokio semaphore, which queues waiters in FIFO
/// order, so `SingleConnection` execution proceeds in acquisition order.
/// The waiter count is tracked so contention failures can report how many
/// tasks were queued when the deadline passed.
pub struct AsyncLocker {
    semaphore: Arc<Semaphore>,
    waiters: AtomicUsize,
    label: &'static str,
}

impl AsyncLocker {
    pub fn new(label: &'static str) -> Arc<Self> {
        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(1)),
            waiters: AtomicUsize::new(0),
            label,
        })
    }

    /// Number of tasks currently waiting for the lock.
    pub fn waiters(&self) -> usize {
        self.waiters.load(Ordering::Relaxed)
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Wait indefinitely for the lock.
    pub async fn lock(&self) -> Result<LockPermit, DbError> {
        // Fast path avoids touching the waiter counter.
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => return Ok(LockPermit { _permit: permit }),
            Err(TryAcquireError::NoPermits) => {}
            Err(TryAcquireError::Closed) => return Err(DbError::Cancelled),
        }

        self.waiters.fetch_add(1, Ordering::Relaxed);
        let result = self.semaphore.clone().acquire_owned().await;
        self.waiters.fetch_sub(1, Ordering::Relaxed);

        match result {
            Ok(permit) => Ok(LockPermit { _permit: permit }),
            Err(_) => Err(DbError::Cancelled),
        }
    }

    /// Wait for the lock up to `timeout`; `None` waits forever.
    ///
    /// A missed deadline surfaces `ModeContention` carrying the waiter
    /// count observed at expiry.
    pub async fn try_lock(&self, timeout: Option<Duration>) -> Result<LockPermit, DbError> {
        let Some(timeout) = timeout else {
            return self.lock().await;
        };

        match tokio::time::timeout(timeout, self.lock()).await {
            Ok(result) => result,
            Err(_) => Err(DbError::ModeContention {
                waiters: self.waiters(),
                timeout,
            }),
        }
    }
}

impl std::fmt::Debug for AsyncLocker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncLocker")
            .field("label", &self.label)
            .field("waiters", &self.waiters())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lock_is_exclusive() {
        let locker = AsyncLocker::new("test");
        let held = locker.lock().await.unwrap();

        let result = locker.try_lock(Some(Duration::from_millis(20))).await;
        match result {
            Err(DbError::ModeContention { timeout, .. }) => {
                assert_eq!(timeout, Duration::from_millis(20));
            }
            other => panic!("expected contention, got {other:?}"),
        }

        drop(held);
        locker.try_lock(Some(Duration::from_millis(20))).await.unwrap();
    }

    #[tokio::test]
    async fn waiter_count_is_reported() {
        let locker = AsyncLocker::new("test");
        let held = locker.lock().await.unwrap();

        let waiter = {
            let locker = locker.clone();
            tokio::spawn(async move { locker.lock().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(locker.waiters(), 1);

        drop(held);
        waiter.await.unwrap().unwrap();
        assert_eq!(locker.waiters(), 0);
    }

    #[tokio::test]
    async fn fifo_ordering() {
        let locker = AsyncLocker::new("test");
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let held = locker.lock().await.unwrap();

        let mut handles = Vec::new();
        for i in 0..4 {
            let locker = locker.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let _p = locker.lock().await.unwrap();
                order.lock().unwrap().push(i);
            }));
            // Let each task reach the queue before spawning the next.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        drop(held);
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }
}
