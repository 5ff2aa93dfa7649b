//! Bulkhead: bounded concurrency admission control
//!
//! A bulkhead caps how many calls may run at once and how many may queue
//! waiting for a slot. Waiters acquire permits in FIFO order; that is the
//! only fairness guarantee. An optional wait bound fails queued callers
//! with `BulkheadTimeout` instead of letting them wait forever.
//!
//! Permits and the waiting counter are released on every exit path,
//! including caller cancellation, via drop guards.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::clock::{default_clock, Clock};
use crate::error::ResilienceError;
use crate::events::{ListenerId, Listeners};

/// Observable bulkhead events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkheadEvent {
    /// A call obtained a concurrency permit
    Admitted,
    /// A call was turned away (queue full or wait timeout)
    Rejected,
    /// A call finished and released its permit
    Released,
}

/// Configuration for bulkhead behavior
#[derive(Debug, Clone)]
pub struct BulkheadConfig {
    /// Maximum calls running concurrently
    pub max_concurrent_calls: usize,
    /// Maximum calls queued waiting for a permit
    pub max_waiting_calls: usize,
    /// Bound on how long a queued call waits, if any
    pub max_wait_duration: Option<Duration>,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 10,
            max_waiting_calls: 10,
            max_wait_duration: None,
        }
    }
}

impl BulkheadConfig {
    fn validate(&self) -> Result<(), ResilienceError> {
        if self.max_concurrent_calls == 0 {
            return Err(ResilienceError::InvalidArgument(
                "max_concurrent_calls must be > 0".to_string(),
            ));
        }
        if let Some(wait) = self.max_wait_duration {
            if wait.is_zero() {
                return Err(ResilienceError::InvalidArgument(
                    "max_wait_duration must be > 0 when set".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Snapshot of bulkhead statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkheadStats {
    /// Calls with a recorded outcome
    pub total_calls: u64,
    /// Admitted calls whose operation succeeded
    pub successful_calls: u64,
    /// Admitted calls whose operation failed
    pub failed_calls: u64,
    /// Calls rejected at admission (queue full or wait timeout)
    pub rejected_calls: u64,
}

#[derive(Debug, Default)]
struct StatsCells {
    successful_calls: AtomicU64,
    failed_calls: AtomicU64,
    rejected_calls: AtomicU64,
}

impl StatsCells {
    fn snapshot(&self) -> BulkheadStats {
        let successful = self.successful_calls.load(Ordering::Relaxed);
        let failed = self.failed_calls.load(Ordering::Relaxed);
        let rejected = self.rejected_calls.load(Ordering::Relaxed);
        BulkheadStats {
            total_calls: successful + failed + rejected,
            successful_calls: successful,
            failed_calls: failed,
            rejected_calls: rejected,
        }
    }

    fn reset(&self) {
        self.successful_calls.store(0, Ordering::Relaxed);
        self.failed_calls.store(0, Ordering::Relaxed);
        self.rejected_calls.store(0, Ordering::Relaxed);
    }
}

/// Bounded-concurrency gate around an async operation
///
/// # Example
/// ```no_run
/// use parapet::bulkhead::{Bulkhead, BulkheadConfig};
///
/// # async fn example() {
/// let bulkhead = Bulkhead::new(BulkheadConfig {
///     max_concurrent_calls: 4,
///     max_waiting_calls: 16,
///     max_wait_duration: None,
/// })
/// .unwrap();
///
/// let result = bulkhead
///     .execute(|| async { Ok::<_, String>("done") })
///     .await;
/// # let _ = result;
/// # }
/// ```
pub struct Bulkhead {
    config: BulkheadConfig,
    clock: Arc<dyn Clock>,
    semaphore: Arc<Semaphore>,
    waiting: Mutex<usize>,
    stats: StatsCells,
    listeners: Listeners<BulkheadEvent>,
}

impl Bulkhead {
    /// Create a bulkhead with the given configuration
    pub fn new(config: BulkheadConfig) -> Result<Self, ResilienceError> {
        config.validate()?;
        let permits = config.max_concurrent_calls;
        Ok(Self {
            config,
            clock: default_clock(),
            semaphore: Arc::new(Semaphore::new(permits)),
            waiting: Mutex::new(0),
            stats: StatsCells::default(),
            listeners: Listeners::new(),
        })
    }

    /// Create a bulkhead with default configuration
    pub fn new_default() -> Self {
        let config = BulkheadConfig::default();
        let permits = config.max_concurrent_calls;
        Self {
            config,
            clock: default_clock(),
            semaphore: Arc::new(Semaphore::new(permits)),
            waiting: Mutex::new(0),
            stats: StatsCells::default(),
            listeners: Listeners::new(),
        }
    }

    /// Replace the clock, mainly so tests can inject virtual time
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Calls currently holding a permit
    pub fn active_calls(&self) -> usize {
        self.config.max_concurrent_calls - self.semaphore.available_permits()
    }

    /// Calls currently queued for a permit
    pub fn waiting_calls(&self) -> usize {
        *self.waiting.lock().expect("bulkhead waiting counter poisoned")
    }

    /// Permits not currently in use
    pub fn available_capacity(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Fraction of concurrency capacity in use, in `[0, 1]`
    pub fn utilization_rate(&self) -> f64 {
        self.active_calls() as f64 / self.config.max_concurrent_calls as f64
    }

    /// Register a listener for admission events
    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&BulkheadEvent) + Send + Sync + 'static,
    {
        self.listeners.add(listener)
    }

    /// Remove a previously registered listener
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// Snapshot of the bulkhead's statistics
    pub fn statistics(&self) -> BulkheadStats {
        self.stats.snapshot()
    }

    /// Reset all statistics counters to zero
    pub fn reset_statistics(&self) {
        self.stats.reset();
    }

    /// Execute an operation once a concurrency permit is held
    ///
    /// Rejection paths: `BulkheadFull` when the waiting queue is at
    /// capacity, `BulkheadTimeout` when `max_wait_duration` elapses
    /// first. The permit is released unconditionally when the operation
    /// finishes, fails, or the caller is cancelled.
    pub async fn execute<F, Fut, T, E>(&self, op: F) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = match self.acquire_permit().await {
            Ok(permit) => permit,
            Err(err) => {
                self.stats.rejected_calls.fetch_add(1, Ordering::Relaxed);
                self.listeners.emit(&BulkheadEvent::Rejected);
                return Err(err.widen());
            }
        };
        self.listeners.emit(&BulkheadEvent::Admitted);

        let result = op().await;
        drop(permit);
        self.listeners.emit(&BulkheadEvent::Released);

        match result {
            Ok(value) => {
                self.stats.successful_calls.fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Err(error) => {
                self.stats.failed_calls.fetch_add(1, Ordering::Relaxed);
                Err(ResilienceError::Underlying(error))
            }
        }
    }

    async fn acquire_permit(
        &self,
    ) -> Result<tokio::sync::OwnedSemaphorePermit, ResilienceError> {
        // Fast path: a free permit means no queueing at all.
        if let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() {
            return Ok(permit);
        }

        // Queue-full test and waiting increment are one critical section.
        {
            let mut waiting = self
                .waiting
                .lock()
                .expect("bulkhead waiting counter poisoned");
            if *waiting >= self.config.max_waiting_calls {
                return Err(ResilienceError::BulkheadFull);
            }
            *waiting += 1;
        }
        let _wait_slot = WaitSlot { bulkhead: self };

        let acquired = match self.config.max_wait_duration {
            Some(bound) => {
                tokio::select! {
                    permit = Arc::clone(&self.semaphore).acquire_owned() => Some(permit),
                    _ = self.clock.sleep(bound) => None,
                }
            }
            None => Some(Arc::clone(&self.semaphore).acquire_owned().await),
        };

        match acquired {
            // The semaphore is never closed, so acquisition cannot fail;
            // treat a closed semaphore as cancellation all the same.
            Some(permit) => permit.map_err(|_| ResilienceError::Cancelled),
            None => Err(ResilienceError::BulkheadTimeout),
        }
    }
}

impl std::fmt::Debug for Bulkhead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bulkhead")
            .field("config", &self.config)
            .field("active_calls", &self.active_calls())
            .field("waiting_calls", &self.waiting_calls())
            .finish_non_exhaustive()
    }
}

/// Decrements the waiting counter on every exit from the wait queue,
/// including cancellation of the waiting caller.
struct WaitSlot<'a> {
    bulkhead: &'a Bulkhead,
}

impl Drop for WaitSlot<'_> {
    fn drop(&mut self) {
        let mut waiting = self
            .bulkhead
            .waiting
            .lock()
            .expect("bulkhead waiting counter poisoned");
        *waiting = waiting.saturating_sub(1);
    }
}
