//! Time limiter: deadline enforcement with cooperative cancellation
//!
//! Each call races the guarded operation against a deadline from the
//! configured clock. When the deadline wins, the operation's future is
//! dropped, which cancels it cooperatively at its next suspension point.
//!
//! Variants decide what a deadline expiry means to the caller: an error,
//! a `None`, a fallback value, or another attempt.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};

use crate::clock::{default_clock, Clock};
use crate::error::ResilienceError;
use crate::events::{ListenerId, Listeners};

/// What a deadline expiry means for [`TimeLimiter::execute_configured`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnTimeout {
    /// Fail the call with `TimedOut`
    #[default]
    Throw,
    /// Resolve the call with `None`
    ReturnNone,
    /// Resolve the call with the supplied fallback
    Fallback,
}

/// Observable time limiter events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeLimiterEvent {
    /// The operation finished before the deadline
    Success {
        /// How long the operation ran
        duration: Duration,
    },
    /// The deadline fired and the operation was cancelled
    Timeout {
        /// The deadline that expired
        timeout: Duration,
    },
    /// The operation failed on its own before the deadline
    Failure,
}

/// Configuration for time limiter behavior
#[derive(Debug, Clone)]
pub struct TimeLimiterConfig {
    /// Default deadline for each call
    pub timeout: Duration,
    /// Default strategy used by [`TimeLimiter::execute_configured`]
    pub on_timeout: OnTimeout,
}

impl Default for TimeLimiterConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            on_timeout: OnTimeout::Throw,
        }
    }
}

impl TimeLimiterConfig {
    fn validate(&self) -> Result<(), ResilienceError> {
        if self.timeout.is_zero() {
            return Err(ResilienceError::InvalidArgument(
                "timeout must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Snapshot of time limiter statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeLimiterStats {
    /// Calls started
    pub total_calls: u64,
    /// Calls that finished before their deadline
    pub successful_calls: u64,
    /// Calls cancelled by their deadline
    pub timed_out_calls: u64,
    /// Calls that failed on their own
    pub failed_calls: u64,
    /// Accumulated run time of successful calls
    pub total_success_duration: Duration,
    /// Accumulated deadline time of timed-out calls
    pub total_timeout_duration: Duration,
}

#[derive(Debug, Default)]
struct StatsCells {
    total_calls: AtomicU64,
    successful_calls: AtomicU64,
    timed_out_calls: AtomicU64,
    failed_calls: AtomicU64,
    success_duration_micros: AtomicU64,
    timeout_duration_micros: AtomicU64,
}

impl StatsCells {
    fn snapshot(&self) -> TimeLimiterStats {
        TimeLimiterStats {
            total_calls: self.total_calls.load(Ordering::Relaxed),
            successful_calls: self.successful_calls.load(Ordering::Relaxed),
            timed_out_calls: self.timed_out_calls.load(Ordering::Relaxed),
            failed_calls: self.failed_calls.load(Ordering::Relaxed),
            total_success_duration: Duration::from_micros(
                self.success_duration_micros.load(Ordering::Relaxed),
            ),
            total_timeout_duration: Duration::from_micros(
                self.timeout_duration_micros.load(Ordering::Relaxed),
            ),
        }
    }

    fn reset(&self) {
        self.total_calls.store(0, Ordering::Relaxed);
        self.successful_calls.store(0, Ordering::Relaxed);
        self.timed_out_calls.store(0, Ordering::Relaxed);
        self.failed_calls.store(0, Ordering::Relaxed);
        self.success_duration_micros.store(0, Ordering::Relaxed);
        self.timeout_duration_micros.store(0, Ordering::Relaxed);
    }
}

enum RaceOutcome<T, E> {
    Success(T),
    TimedOut,
    Failed(E),
}

/// Deadline enforcement around async operations
///
/// # Example
/// ```no_run
/// use parapet::time_limiter::{TimeLimiter, TimeLimiterConfig};
/// use std::time::Duration;
///
/// # async fn example() {
/// let limiter = TimeLimiter::new(TimeLimiterConfig {
///     timeout: Duration::from_millis(250),
///     ..Default::default()
/// })
/// .unwrap();
///
/// let result = limiter
///     .execute(|| async { Ok::<_, String>("fast enough") })
///     .await;
/// # let _ = result;
/// # }
/// ```
pub struct TimeLimiter {
    config: TimeLimiterConfig,
    clock: Arc<dyn Clock>,
    stats: StatsCells,
    listeners: Listeners<TimeLimiterEvent>,
}

impl TimeLimiter {
    /// Create a time limiter with the given configuration
    pub fn new(config: TimeLimiterConfig) -> Result<Self, ResilienceError> {
        config.validate()?;
        Ok(Self {
            config,
            clock: default_clock(),
            stats: StatsCells::default(),
            listeners: Listeners::new(),
        })
    }

    /// Create a time limiter with default configuration
    pub fn new_default() -> Self {
        Self {
            config: TimeLimiterConfig::default(),
            clock: default_clock(),
            stats: StatsCells::default(),
            listeners: Listeners::new(),
        }
    }

    /// Replace the clock, mainly so tests can inject virtual time
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Register a listener for time limiter events
    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&TimeLimiterEvent) + Send + Sync + 'static,
    {
        self.listeners.add(listener)
    }

    /// Remove a previously registered listener
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// Snapshot of the limiter's statistics
    pub fn statistics(&self) -> TimeLimiterStats {
        self.stats.snapshot()
    }

    /// Reset all statistics counters to zero
    pub fn reset_statistics(&self) {
        self.stats.reset();
    }

    /// Execute with the configured deadline; expiry fails with `TimedOut`
    pub async fn execute<F, Fut, T, E>(&self, op: F) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match self.race(self.config.timeout, op).await {
            RaceOutcome::Success(value) => Ok(value),
            RaceOutcome::TimedOut => Err(ResilienceError::TimedOut),
            RaceOutcome::Failed(error) => Err(ResilienceError::Underlying(error)),
        }
    }

    /// Execute with a per-call deadline override
    pub async fn execute_with<F, Fut, T, E>(
        &self,
        timeout: Duration,
        op: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if timeout.is_zero() {
            return Err(
                ResilienceError::InvalidArgument("timeout must be > 0".to_string()).widen(),
            );
        }
        match self.race(timeout, op).await {
            RaceOutcome::Success(value) => Ok(value),
            RaceOutcome::TimedOut => Err(ResilienceError::TimedOut),
            RaceOutcome::Failed(error) => Err(ResilienceError::Underlying(error)),
        }
    }

    /// Execute, resolving a deadline expiry as `None`
    pub async fn execute_or_null<F, Fut, T, E>(
        &self,
        op: F,
    ) -> Result<Option<T>, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match self.race(self.config.timeout, op).await {
            RaceOutcome::Success(value) => Ok(Some(value)),
            RaceOutcome::TimedOut => Ok(None),
            RaceOutcome::Failed(error) => Err(ResilienceError::Underlying(error)),
        }
    }

    /// Execute, answering a deadline expiry with the fallback operation
    ///
    /// Only a timeout triggers the fallback; operation errors propagate
    /// unchanged.
    pub async fn execute_or_fallback<F, Fut, FB, FutB, T, E>(
        &self,
        fallback: FB,
        op: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        FB: FnOnce() -> FutB,
        FutB: Future<Output = Result<T, E>>,
    {
        match self.race(self.config.timeout, op).await {
            RaceOutcome::Success(value) => Ok(value),
            RaceOutcome::TimedOut => fallback().await.map_err(ResilienceError::Underlying),
            RaceOutcome::Failed(error) => Err(ResilienceError::Underlying(error)),
        }
    }

    /// Execute, answering a deadline expiry with a ready value
    pub async fn execute_or_default<F, Fut, T, E>(
        &self,
        default: T,
        op: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match self.race(self.config.timeout, op).await {
            RaceOutcome::Success(value) => Ok(value),
            RaceOutcome::TimedOut => Ok(default),
            RaceOutcome::Failed(error) => Err(ResilienceError::Underlying(error)),
        }
    }

    /// Execute honoring the configured [`OnTimeout`] strategy
    ///
    /// `Throw` fails with `TimedOut`, `ReturnNone` resolves `None`, and
    /// `Fallback` resolves the fallback operation's value.
    pub async fn execute_configured<F, Fut, FB, FutB, T, E>(
        &self,
        fallback: FB,
        op: F,
    ) -> Result<Option<T>, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        FB: FnOnce() -> FutB,
        FutB: Future<Output = Result<T, E>>,
    {
        match self.race(self.config.timeout, op).await {
            RaceOutcome::Success(value) => Ok(Some(value)),
            RaceOutcome::Failed(error) => Err(ResilienceError::Underlying(error)),
            RaceOutcome::TimedOut => match self.config.on_timeout {
                OnTimeout::Throw => Err(ResilienceError::TimedOut),
                OnTimeout::ReturnNone => Ok(None),
                OnTimeout::Fallback => fallback()
                    .await
                    .map(Some)
                    .map_err(ResilienceError::Underlying),
            },
        }
    }

    /// Execute, re-racing on timeout up to `retries` additional times
    ///
    /// Operation errors end the attempts immediately; if every attempt
    /// times out, the final `TimedOut` is returned.
    pub async fn execute_with_retry<F, Fut, T, E>(
        &self,
        retries: u32,
        mut op: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        for _ in 0..=retries {
            match self.race(self.config.timeout, &mut op).await {
                RaceOutcome::Success(value) => return Ok(value),
                RaceOutcome::Failed(error) => return Err(ResilienceError::Underlying(error)),
                RaceOutcome::TimedOut => continue,
            }
        }
        Err(ResilienceError::TimedOut)
    }

    /// Execute many operations in parallel, each under its own deadline
    ///
    /// Results align positionally with `ops`; a timeout or failure
    /// yields `None` at that position.
    pub async fn execute_all<F, Fut, T, E>(&self, ops: Vec<F>) -> Vec<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let races = ops
            .into_iter()
            .map(|op| self.race(self.config.timeout, op));
        futures::future::join_all(races)
            .await
            .into_iter()
            .map(|outcome| match outcome {
                RaceOutcome::Success(value) => Some(value),
                RaceOutcome::TimedOut | RaceOutcome::Failed(_) => None,
            })
            .collect()
    }

    /// Race many operations under one shared deadline
    ///
    /// The first success wins and the remaining operations are
    /// cancelled. If every operation fails before the deadline, the last
    /// failure is returned; if the deadline fires first, `TimedOut`.
    pub async fn execute_race<F, Fut, T, E>(&self, ops: Vec<F>) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if ops.is_empty() {
            return Err(
                ResilienceError::InvalidArgument("ops must not be empty".to_string()).widen(),
            );
        }

        self.stats.total_calls.fetch_add(1, Ordering::Relaxed);
        let start = self.clock.now();
        let mut contenders: FuturesUnordered<Fut> = ops.into_iter().map(|op| op()).collect();
        let deadline = self.clock.sleep(self.config.timeout);
        tokio::pin!(deadline);

        let mut last_error = None;
        loop {
            tokio::select! {
                _ = &mut deadline => {
                    self.stats.timed_out_calls.fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .timeout_duration_micros
                        .fetch_add(self.config.timeout.as_micros() as u64, Ordering::Relaxed);
                    self.listeners.emit(&TimeLimiterEvent::Timeout {
                        timeout: self.config.timeout,
                    });
                    return Err(ResilienceError::TimedOut);
                }
                next = contenders.next() => match next {
                    Some(Ok(value)) => {
                        let duration = self.clock.now() - start;
                        self.stats.successful_calls.fetch_add(1, Ordering::Relaxed);
                        self.stats
                            .success_duration_micros
                            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
                        self.listeners.emit(&TimeLimiterEvent::Success { duration });
                        return Ok(value);
                    }
                    Some(Err(error)) => last_error = Some(error),
                    None => {
                        self.stats.failed_calls.fetch_add(1, Ordering::Relaxed);
                        self.listeners.emit(&TimeLimiterEvent::Failure);
                        return match last_error {
                            Some(error) => Err(ResilienceError::Underlying(error)),
                            None => Err(ResilienceError::TimedOut),
                        };
                    }
                }
            }
        }
    }

    /// Race one operation against a deadline, recording the outcome
    async fn race<F, Fut, T, E>(&self, timeout: Duration, op: F) -> RaceOutcome<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.stats.total_calls.fetch_add(1, Ordering::Relaxed);
        let start = self.clock.now();
        let operation = op();

        let outcome = tokio::select! {
            result = operation => match result {
                Ok(value) => RaceOutcome::Success(value),
                Err(error) => RaceOutcome::Failed(error),
            },
            _ = self.clock.sleep(timeout) => RaceOutcome::TimedOut,
        };

        match &outcome {
            RaceOutcome::Success(_) => {
                let duration = self.clock.now() - start;
                self.stats.successful_calls.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .success_duration_micros
                    .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
                self.listeners.emit(&TimeLimiterEvent::Success { duration });
            }
            RaceOutcome::TimedOut => {
                self.stats.timed_out_calls.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .timeout_duration_micros
                    .fetch_add(timeout.as_micros() as u64, Ordering::Relaxed);
                self.listeners.emit(&TimeLimiterEvent::Timeout { timeout });
            }
            RaceOutcome::Failed(_) => {
                self.stats.failed_calls.fetch_add(1, Ordering::Relaxed);
                self.listeners.emit(&TimeLimiterEvent::Failure);
            }
        }
        outcome
    }
}

impl std::fmt::Debug for TimeLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeLimiter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
