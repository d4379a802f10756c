use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{DbError, PoolSnapshot};
use crate::modes::ExecutionType;

/// Held governor permit; releasing is dropping.
#[derive(Debug)]
pub struct GovernorPermit {
    _permit: Option<OwnedSemaphorePermit>,
}

impl GovernorPermit {
    fn unlimited() -> Self {
        Self { _permit: None }
    }
}

/// Bounded-permit wrapper over connection acquisition.
///
/// Attributes work to the read or write pool, applies back-pressure when
/// a pool is exhausted, and reports a full snapshot when the acquire
/// deadline passes. Writer preference reserves the write pool exclusively
/// for writes; when disabled, writes may borrow read permits.
pub struct PoolGovernor {
    reads: Option<Pool>,
    writes: Option<Pool>,
    acquire_timeout: Duration,
    writer_preference: bool,
}

struct Pool {
    label: &'static str,
    semaphore: Arc<Semaphore>,
    max: usize,
    queued: AtomicUsize,
}

impl Pool {
    fn new(label: &'static str, max: usize) -> Self {
        Self {
            label,
            semaphore: Arc::new(Semaphore::new(max)),
            max,
            queued: AtomicUsize::new(0),
        }
    }

    fn in_use(&self) -> usize {
        self.max - self.semaphore.available_permits()
    }

    fn snapshot(&self, timeout: Duration) -> PoolSnapshot {
        PoolSnapshot {
            label: self.label,
            in_use: self.in_use(),
            max: self.max,
            queued: self.queued.load(Ordering::Relaxed),
            timeout,
        }
    }

    async fn acquire(&self, timeout: Duration) -> Result<OwnedSemaphorePermit, DbError> {
        self.queued.fetch_add(1, Ordering::Relaxed);
        let result =
            tokio::time::timeout(timeout, self.semaphore.clone().acquire_owned()).await;
        self.queued.fetch_sub(1, Ordering::Relaxed);

        match result {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(DbError::Cancelled),
            Err(_) => Err(DbError::PoolSaturated(self.snapshot(timeout))),
        }
    }
}

impl PoolGovernor {
    /// `None` for a bound disables limiting for that execution type.
    pub fn new(
        max_concurrent_reads: Option<usize>,
        max_concurrent_writes: Option<usize>,
        acquire_timeout: Duration,
        writer_preference: bool,
    ) -> Self {
        Self {
            reads: max_concurrent_reads.map(|n| Pool::new("reads", n.max(1))),
            writes: max_concurrent_writes.map(|n| Pool::new("writes", n.max(1))),
            acquire_timeout,
            writer_preference,
        }
    }

    /// A governor that admits everything immediately.
    pub fn unlimited() -> Self {
        Self::new(None, None, Duration::from_secs(5), true)
    }

    pub async fn admit(&self, execution: ExecutionType) -> Result<GovernorPermit, DbError> {
        let pool = match execution {
            ExecutionType::Read => self.reads.as_ref(),
            ExecutionType::Write => match (&self.writes, self.writer_preference) {
                (Some(writes), _) => Some(writes),
                // Without writer preference, writes contend for read slots.
                (None, false) => self.reads.as_ref(),
                (None, true) => None,
            },
        };

        match pool {
            Some(pool) => {
                let permit = pool.acquire(self.acquire_timeout).await?;
                Ok(GovernorPermit {
                    _permit: Some(permit),
                })
            }
            None => Ok(GovernorPermit::unlimited()),
        }
    }

    pub fn read_snapshot(&self) -> Option<PoolSnapshot> {
        self.reads.as_ref().map(|p| p.snapshot(self.acquire_timeout))
    }

    pub fn write_snapshot(&self) -> Option<PoolSnapshot> {
        self.writes.as_ref().map(|p| p.snapshot(self.acquire_timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn saturation_reports_snapshot() {
        let governor = PoolGovernor::new(Some(1), None, Duration::from_millis(20), true);

        let held = governor.admit(ExecutionType::Read).await.unwrap();
        let result = governor.admit(ExecutionType::Read).await;
        match result {
            Err(DbError::PoolSaturated(snapshot)) => {
                assert_eq!(snapshot.label, "reads");
                assert_eq!(snapshot.in_use, 1);
                assert_eq!(snapshot.max, 1);
            }
            other => panic!("expected saturation, got {other:?}"),
        }

        drop(held);
        governor.admit(ExecutionType::Read).await.unwrap();
    }

    #[tokio::test]
    async fn unlimited_admits_everything() {
        let governor = PoolGovernor::unlimited();
        for _ in 0..64 {
            governor.admit(ExecutionType::Write).await.unwrap();
        }
    }

    #[tokio::test]
    async fn writes_do_not_consume_read_pool_under_preference() {
        let governor = PoolGovernor::new(Some(1), None, Duration::from_millis(20), true);
        let _read = governor.admit(ExecutionType::Read).await.unwrap();
        // Write pool is unbounded and unaffected by read saturation.
        governor.admit(ExecutionType::Write).await.unwrap();
    }
}
