//! Counting permit pools bounding in-flight work.
//!
//! Two pools gate the pipeline: one caps concurrently open files, the other
//! caps records being turned into write intents. A permit is owned, so it can
//! be moved into the task doing the work and is returned when that task drops it.

use crate::ingestion::IngestionError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

struct PoolInner {
    name: &'static str,
    capacity: usize,
    semaphore: Arc<Semaphore>,
    in_flight: AtomicUsize,
    high_water: AtomicUsize,
}

/// A named counting permit pool
///
/// ```
/// # tokio_test::block_on(async {
/// use citefold::ingestion::PermitPool;
///
/// let pool = PermitPool::new("files", 2);
/// let permit = pool.acquire().await.unwrap();
/// assert_eq!(pool.in_flight(), 1);
/// drop(permit);
/// assert_eq!(pool.in_flight(), 0);
/// assert_eq!(pool.high_water(), 1);
/// # });
/// ```
#[derive(Clone)]
pub struct PermitPool {
    inner: Arc<PoolInner>,
}

/// One unit of capacity from a [`PermitPool`], returned on drop
pub struct Permit {
    _permit: OwnedSemaphorePermit,
    pool: Arc<PoolInner>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.pool.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for PermitPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermitPool")
            .field("name", &self.inner.name)
            .field("capacity", &self.inner.capacity)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl PermitPool {
    /// Create a pool of `capacity` permits; a zero capacity is raised to one
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(PoolInner {
                name,
                capacity,
                semaphore: Arc::new(Semaphore::new(capacity)),
                in_flight: AtomicUsize::new(0),
                high_water: AtomicUsize::new(0),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Permits currently held
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Largest number of permits ever held at the same time
    pub fn high_water(&self) -> usize {
        self.inner.high_water.load(Ordering::SeqCst)
    }

    /// Wait for a permit.
    ///
    /// Fails only when the pool has been closed; the caller must then skip the
    /// unit of work instead of running it without a permit.
    pub async fn acquire(&self) -> Result<Permit, IngestionError> {
        let permit = self
            .inner
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| IngestionError::PermitPoolClosed(self.inner.name))?;
        let now = self.inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.high_water.fetch_max(now, Ordering::SeqCst);
        Ok(Permit {
            _permit: permit,
            pool: self.inner.clone(),
        })
    }

    /// Wait until every permit has been returned
    pub async fn wait_idle(&self) -> Result<(), IngestionError> {
        let capacity = u32::try_from(self.inner.capacity).unwrap_or(u32::MAX);
        let all = self
            .inner
            .semaphore
            .acquire_many(capacity)
            .await
            .map_err(|_| IngestionError::PermitPoolClosed(self.inner.name))?;
        drop(all);
        Ok(())
    }

    /// Refuse all further acquisitions; waiters fail with `PermitPoolClosed`
    pub fn close(&self) {
        self.inner.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.semaphore.is_closed()
    }
}
