//! Generic Resource Pool
//!
//! Bounded pool of reusable resources (connections, handles, parsers)
//! built by an async factory. Acquisition prefers an idle resource,
//! creates a new one while under capacity, and otherwise polls until a
//! release frees capacity or the acquire timeout expires.

use futures::future::BoxFuture;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use switchboard_common::protocol::{Result, SwitchboardError};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// How often a blocked acquire re-checks for freed capacity.
const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Resource pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum live resources (idle + checked out)
    pub max_size: usize,
    /// How long an acquire waits at capacity before failing
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 10,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

/// A checked-out resource with its pool-assigned identity.
///
/// The ID ties the resource back to the pool on release; the value is
/// the caller's to use until then.
#[derive(Debug)]
pub struct PooledResource<T> {
    pub id: u64,
    pub value: T,
}

/// Point-in-time pool occupancy.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct PoolStats {
    pub idle: usize,
    pub in_use: usize,
    pub created: u64,
    pub max_size: usize,
}

type Factory<T> = Box<dyn Fn() -> BoxFuture<'static, Result<T>> + Send + Sync>;

/// Bounded async resource pool.
///
/// # Example
///
/// ```ignore
/// let pool = ResourcePool::new(PoolConfig::default(), || {
///     Box::pin(async { Ok(Client::connect().await?) })
/// });
/// let client = pool.acquire().await?;
/// // ... use client.value ...
/// pool.release(client).await;
/// ```
pub struct ResourcePool<T> {
    config: PoolConfig,
    factory: Factory<T>,
    idle: Mutex<Vec<PooledResource<T>>>,
    in_use: Mutex<HashSet<u64>>,
    next_id: AtomicU64,
    created: AtomicU64,
}

impl<T: Send + 'static> ResourcePool<T> {
    /// Creates an empty pool; resources are built lazily on acquire.
    pub fn new<F>(config: PoolConfig, factory: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, Result<T>> + Send + Sync + 'static,
    {
        Self {
            config,
            factory: Box::new(factory),
            idle: Mutex::new(Vec::new()),
            in_use: Mutex::new(HashSet::new()),
            next_id: AtomicU64::new(1),
            created: AtomicU64::new(0),
        }
    }

    /// Checks out a resource, building one if under capacity, waiting up
    /// to the configured acquire timeout.
    ///
    /// # Errors
    ///
    /// [`SwitchboardError::PoolTimeout`] when the pool stays at capacity
    /// for the whole acquire timeout; factory errors propagate as-is.
    pub async fn acquire(&self) -> Result<PooledResource<T>> {
        self.acquire_with_timeout(self.config.acquire_timeout).await
    }

    /// Like [`ResourcePool::acquire`] with a per-call wait bound instead
    /// of the config default.
    pub async fn acquire_with_timeout(&self, timeout: Duration) -> Result<PooledResource<T>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(resource) = self.try_acquire().await? {
                return Ok(resource);
            }
            if Instant::now() >= deadline {
                return Err(SwitchboardError::PoolTimeout(timeout.as_millis() as u64));
            }
            tokio::time::sleep(ACQUIRE_POLL_INTERVAL).await;
        }
    }

    /// One non-blocking acquisition attempt.
    async fn try_acquire(&self) -> Result<Option<PooledResource<T>>> {
        // Reuse an idle resource first
        {
            let mut idle = self.idle.lock().await;
            if let Some(resource) = idle.pop() {
                self.in_use.lock().await.insert(resource.id);
                return Ok(Some(resource));
            }
        }

        // Under capacity: build a fresh one. The in_use slot is reserved
        // before the factory runs so concurrent acquires cannot overshoot.
        let id = {
            let idle = self.idle.lock().await;
            let mut in_use = self.in_use.lock().await;
            if idle.len() + in_use.len() >= self.config.max_size {
                return Ok(None);
            }
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            in_use.insert(id);
            id
        };

        match (self.factory)().await {
            Ok(value) => {
                self.created.fetch_add(1, Ordering::Relaxed);
                debug!(resource_id = id, "pool resource created");
                Ok(Some(PooledResource { id, value }))
            }
            Err(e) => {
                self.in_use.lock().await.remove(&id);
                Err(e)
            }
        }
    }

    /// Returns a resource to the idle set.
    ///
    /// Releasing a resource the pool is not tracking is logged and
    /// ignored rather than corrupting occupancy accounting.
    pub async fn release(&self, resource: PooledResource<T>) {
        let mut in_use = self.in_use.lock().await;
        if !in_use.remove(&resource.id) {
            warn!(resource_id = resource.id, "release of untracked resource ignored");
            return;
        }
        drop(in_use);
        self.idle.lock().await.push(resource);
    }

    /// Drops a broken resource instead of returning it, freeing its slot.
    pub async fn discard(&self, resource: PooledResource<T>) {
        let mut in_use = self.in_use.lock().await;
        if !in_use.remove(&resource.id) {
            warn!(resource_id = resource.id, "discard of untracked resource ignored");
        }
    }

    /// Current occupancy counters.
    pub async fn stats(&self) -> PoolStats {
        let idle = self.idle.lock().await.len();
        let in_use = self.in_use.lock().await.len();
        PoolStats {
            idle,
            in_use,
            created: self.created.load(Ordering::Relaxed),
            max_size: self.config.max_size,
        }
    }

    /// Drops all idle resources. Checked-out resources are unaffected.
    pub async fn clear_idle(&self) {
        self.idle.lock().await.clear();
    }
}
