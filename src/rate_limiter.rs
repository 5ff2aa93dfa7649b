//! Token-bucket rate limiting
//!
//! Tokens accrue continuously at `permits_per_second` up to
//! `burst_capacity`. Each admission consumes one or more tokens; refill
//! and deduction happen inside one critical section so concurrent
//! admissions can never observe a partially refilled bucket.
//!
//! `try_execute` rejects immediately when tokens are short;
//! `execute` sleeps until enough tokens have accrued and re-enters the
//! admission transaction.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use crate::clock::{default_clock, Clock};
use crate::error::ResilienceError;
use crate::events::{ListenerId, Listeners};

/// Tolerance for floating-point token comparisons
const TOKEN_EPSILON: f64 = 1e-9;

/// Observable rate limiter events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimiterEvent {
    /// Permits were granted
    Admitted {
        /// Number of permits consumed
        permits: u32,
    },
    /// Permits were refused
    Rejected {
        /// Number of permits requested
        permits: u32,
    },
}

/// Configuration for token-bucket behavior
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Continuous refill rate
    pub permits_per_second: f64,
    /// Maximum tokens the bucket holds
    pub burst_capacity: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            permits_per_second: 10.0,
            burst_capacity: 10,
        }
    }
}

impl RateLimiterConfig {
    fn validate(&self) -> Result<(), ResilienceError> {
        if !(self.permits_per_second > 0.0) || !self.permits_per_second.is_finite() {
            return Err(ResilienceError::InvalidArgument(
                "permits_per_second must be > 0".to_string(),
            ));
        }
        if self.burst_capacity == 0 {
            return Err(ResilienceError::InvalidArgument(
                "burst_capacity must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Snapshot of rate limiter statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiterStats {
    /// Admissions granted
    pub admitted_calls: u64,
    /// Admissions refused (`try_execute` only)
    pub rejected_calls: u64,
    /// Accumulated time blocking callers spent waiting for tokens
    pub total_wait: Duration,
}

#[derive(Debug, Default)]
struct StatsCells {
    admitted_calls: AtomicU64,
    rejected_calls: AtomicU64,
    total_wait_micros: AtomicU64,
}

impl StatsCells {
    fn snapshot(&self) -> RateLimiterStats {
        RateLimiterStats {
            admitted_calls: self.admitted_calls.load(Ordering::Relaxed),
            rejected_calls: self.rejected_calls.load(Ordering::Relaxed),
            total_wait: Duration::from_micros(self.total_wait_micros.load(Ordering::Relaxed)),
        }
    }

    fn reset(&self) {
        self.admitted_calls.store(0, Ordering::Relaxed);
        self.rejected_calls.store(0, Ordering::Relaxed);
        self.total_wait_micros.store(0, Ordering::Relaxed);
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket admission around an async operation
///
/// The bucket starts full: `burst_capacity` tokens are immediately
/// available.
///
/// # Example
/// ```no_run
/// use parapet::rate_limiter::{RateLimiter, RateLimiterConfig};
///
/// # async fn example() {
/// let limiter = RateLimiter::new(RateLimiterConfig {
///     permits_per_second: 100.0,
///     burst_capacity: 10,
/// })
/// .unwrap();
///
/// let result = limiter
///     .try_execute(|| async { Ok::<_, String>("sent") })
///     .await;
/// # let _ = result;
/// # }
/// ```
pub struct RateLimiter {
    config: RateLimiterConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<Option<BucketState>>,
    stats: StatsCells,
    listeners: Listeners<RateLimiterEvent>,
}

impl RateLimiter {
    /// Create a rate limiter with the given configuration
    pub fn new(config: RateLimiterConfig) -> Result<Self, ResilienceError> {
        config.validate()?;
        Ok(Self {
            config,
            clock: default_clock(),
            state: Mutex::new(None),
            stats: StatsCells::default(),
            listeners: Listeners::new(),
        })
    }

    /// Create a rate limiter allowing `permits_per_second` with an equal burst
    pub fn per_second(permits_per_second: u32) -> Result<Self, ResilienceError> {
        Self::new(RateLimiterConfig {
            permits_per_second: permits_per_second as f64,
            burst_capacity: permits_per_second.max(1),
        })
    }

    /// Replace the clock, mainly so tests can inject virtual time
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Tokens currently available, after refreshing the bucket
    pub fn available_tokens(&self) -> f64 {
        let mut state = self.state.lock().expect("rate limiter state poisoned");
        let bucket = self.refill(&mut state);
        bucket.tokens
    }

    /// Register a listener for admission events
    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&RateLimiterEvent) + Send + Sync + 'static,
    {
        self.listeners.add(listener)
    }

    /// Remove a previously registered listener
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// Snapshot of the limiter's statistics
    pub fn statistics(&self) -> RateLimiterStats {
        self.stats.snapshot()
    }

    /// Reset all statistics counters to zero
    pub fn reset_statistics(&self) {
        self.stats.reset();
    }

    /// Execute the operation if one token is immediately available
    pub async fn try_execute<F, Fut, T, E>(&self, op: F) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.try_execute_n(1, op).await
    }

    /// Execute the operation if `permits` tokens are immediately available
    pub async fn try_execute_n<F, Fut, T, E>(
        &self,
        permits: u32,
        op: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.check_permits(permits).map_err(ResilienceError::widen)?;

        let admitted = {
            let mut state = self.state.lock().expect("rate limiter state poisoned");
            let bucket = self.refill(&mut state);
            if bucket.tokens + TOKEN_EPSILON >= permits as f64 {
                bucket.tokens -= permits as f64;
                true
            } else {
                false
            }
        };

        if !admitted {
            self.stats.rejected_calls.fetch_add(1, Ordering::Relaxed);
            self.listeners.emit(&RateLimiterEvent::Rejected { permits });
            return Err(ResilienceError::RateLimitExceeded);
        }

        self.stats.admitted_calls.fetch_add(1, Ordering::Relaxed);
        self.listeners.emit(&RateLimiterEvent::Admitted { permits });
        op().await.map_err(ResilienceError::Underlying)
    }

    /// Execute the operation, waiting for one token if necessary
    pub async fn execute<F, Fut, T, E>(&self, op: F) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_n(1, op).await
    }

    /// Execute the operation, waiting until `permits` tokens are available
    pub async fn execute_n<F, Fut, T, E>(
        &self,
        permits: u32,
        op: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.check_permits(permits).map_err(ResilienceError::widen)?;

        loop {
            // Refill and deduction are one atomic action; the sleep for
            // missing tokens happens outside the lock.
            let missing = {
                let mut state = self.state.lock().expect("rate limiter state poisoned");
                let bucket = self.refill(&mut state);
                if bucket.tokens + TOKEN_EPSILON >= permits as f64 {
                    bucket.tokens -= permits as f64;
                    None
                } else {
                    Some(permits as f64 - bucket.tokens)
                }
            };

            match missing {
                None => break,
                Some(tokens) => {
                    let wait = Duration::from_secs_f64(tokens / self.config.permits_per_second);
                    self.stats
                        .total_wait_micros
                        .fetch_add(wait.as_micros() as u64, Ordering::Relaxed);
                    self.clock.sleep(wait).await;
                }
            }
        }

        self.stats.admitted_calls.fetch_add(1, Ordering::Relaxed);
        self.listeners.emit(&RateLimiterEvent::Admitted { permits });
        op().await.map_err(ResilienceError::Underlying)
    }

    fn check_permits(&self, permits: u32) -> Result<(), ResilienceError> {
        if permits == 0 {
            return Err(ResilienceError::InvalidArgument(
                "permits must be > 0".to_string(),
            ));
        }
        if permits > self.config.burst_capacity {
            return Err(ResilienceError::InvalidArgument(format!(
                "permits ({permits}) exceed burst_capacity ({})",
                self.config.burst_capacity
            )));
        }
        Ok(())
    }

    /// Refill the bucket up to now; the bucket starts full on first use
    fn refill<'a>(&self, state: &'a mut Option<BucketState>) -> &'a mut BucketState {
        let now = self.clock.now();
        match state {
            Some(bucket) => {
                let elapsed = now.saturating_duration_since(bucket.last_refill);
                bucket.tokens = (bucket.tokens
                    + elapsed.as_secs_f64() * self.config.permits_per_second)
                    .min(self.config.burst_capacity as f64);
                bucket.last_refill = now;
            }
            None => {
                *state = Some(BucketState {
                    tokens: self.config.burst_capacity as f64,
                    last_refill: now,
                });
            }
        }
        state.as_mut().expect("bucket just initialized")
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
