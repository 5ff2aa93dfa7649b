//! Retry and repeat engines driven by composable schedules
//!
//! [`Retry`] re-executes an operation on *errors*, consulting its
//! [`Schedule`] for a `(delay, continue?)` decision after every failed
//! attempt. [`Repeat`] re-executes on *successful values*: it keeps
//! calling the operation until a predicate is satisfied, a collection
//! budget is reached, or an overall timeout expires.
//!
//! Jitter is applied per attempt through the schedule and never
//! accumulates across attempts.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{default_clock, Clock};
use crate::error::ResilienceError;
use crate::events::{ListenerId, Listeners};
use crate::schedule::Schedule;

/// Observable retry events
#[derive(Debug, Clone, PartialEq)]
pub enum RetryEvent {
    /// Another attempt was scheduled after a failure
    RetryScheduled {
        /// Zero-based index of the attempt that just failed
        attempt: u32,
        /// Delay before the next attempt
        delay: Duration,
    },
    /// The operation succeeded
    Succeeded {
        /// Total number of attempts made
        attempts: u32,
    },
    /// The schedule halted with the operation still failing
    Exhausted {
        /// Total number of attempts made
        attempts: u32,
    },
}

/// Snapshot of retry statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryStats {
    /// Attempts across all calls, including first attempts
    pub total_attempts: u64,
    /// Calls that eventually succeeded
    pub successful_calls: u64,
    /// Calls that exhausted their schedule
    pub failed_calls: u64,
    /// Re-attempts performed (attempts beyond each call's first)
    pub retries_performed: u64,
    /// Accumulated back-off delay actually slept
    pub total_delay: Duration,
}

#[derive(Debug, Default)]
struct StatsCells {
    total_attempts: AtomicU64,
    successful_calls: AtomicU64,
    failed_calls: AtomicU64,
    retries_performed: AtomicU64,
    total_delay_micros: AtomicU64,
}

impl StatsCells {
    fn snapshot(&self) -> RetryStats {
        RetryStats {
            total_attempts: self.total_attempts.load(Ordering::Relaxed),
            successful_calls: self.successful_calls.load(Ordering::Relaxed),
            failed_calls: self.failed_calls.load(Ordering::Relaxed),
            retries_performed: self.retries_performed.load(Ordering::Relaxed),
            total_delay: Duration::from_micros(self.total_delay_micros.load(Ordering::Relaxed)),
        }
    }

    fn reset(&self) {
        self.total_attempts.store(0, Ordering::Relaxed);
        self.successful_calls.store(0, Ordering::Relaxed);
        self.failed_calls.store(0, Ordering::Relaxed);
        self.retries_performed.store(0, Ordering::Relaxed);
        self.total_delay_micros.store(0, Ordering::Relaxed);
    }
}

/// Record of one attempt within [`Retry::execute_with_history`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptRecord {
    /// Zero-based attempt index
    pub attempt: u32,
    /// Whether this attempt succeeded
    pub succeeded: bool,
    /// Back-off slept after this attempt, if another followed
    pub delay_before_next: Option<Duration>,
}

/// Attempt history returned alongside the result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryHistory {
    /// One record per attempt, in order
    pub attempts: Vec<AttemptRecord>,
    /// Wall time of the whole call including back-off sleeps
    pub total_duration: Duration,
}

/// Schedule-driven re-execution on errors
///
/// # Example
/// ```no_run
/// use parapet::retry::Retry;
/// use parapet::ResilienceError;
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), ResilienceError<String>> {
/// let retry = Retry::exponential(3, Duration::from_millis(100), 2.0)
///     .map_err(ResilienceError::widen)?;
///
/// let value = retry
///     .execute(|| async { Ok::<_, String>(42) })
///     .await?;
/// assert_eq!(value, 42);
/// # Ok(())
/// # }
/// ```
pub struct Retry<E> {
    schedule: Schedule<E>,
    clock: Arc<dyn Clock>,
    stats: StatsCells,
    listeners: Listeners<RetryEvent>,
}

impl<E> Retry<E> {
    /// Build a retry engine from an explicit schedule
    pub fn with_schedule(schedule: Schedule<E>) -> Self {
        Self {
            schedule,
            clock: default_clock(),
            stats: StatsCells::default(),
            listeners: Listeners::new(),
        }
    }

    /// Exponential backoff: up to `retries` re-attempts, delay
    /// `base * factor^attempt`
    pub fn exponential(retries: u32, base: Duration, factor: f64) -> Result<Self, ResilienceError> {
        let schedule = Schedule::exponential(base, factor)?.and(Schedule::recurs(retries));
        Ok(Self::with_schedule(schedule))
    }

    /// Exponential backoff with the pre-jitter delay capped at `max_delay`
    pub fn capped_exponential(
        retries: u32,
        base: Duration,
        factor: f64,
        max_delay: Duration,
    ) -> Result<Self, ResilienceError> {
        let schedule = Schedule::exponential(base, factor)?
            .capped(max_delay)?
            .and(Schedule::recurs(retries));
        Ok(Self::with_schedule(schedule))
    }

    /// Fibonacci backoff: up to `retries` re-attempts
    pub fn fibonacci(retries: u32, base: Duration) -> Self {
        Self::with_schedule(Schedule::fibonacci(base).and(Schedule::recurs(retries)))
    }

    /// Constant delay between up to `retries` re-attempts
    pub fn spaced(retries: u32, delay: Duration) -> Self {
        Self::with_schedule(Schedule::spaced(delay).and(Schedule::recurs(retries)))
    }

    /// Replace the clock, mainly so tests can inject virtual time
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Wrap the schedule in per-attempt jitter
    pub fn with_jitter(mut self, factor: f64) -> Result<Self, ResilienceError> {
        self.schedule = self.schedule.jittered(factor)?;
        Ok(self)
    }

    /// Register a listener for retry events
    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&RetryEvent) + Send + Sync + 'static,
    {
        self.listeners.add(listener)
    }

    /// Remove a previously registered listener
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// Snapshot of the engine's statistics
    pub fn statistics(&self) -> RetryStats {
        self.stats.snapshot()
    }

    /// Reset all statistics counters to zero
    pub fn reset_statistics(&self) {
        self.stats.reset();
    }

    /// Execute `op`, re-attempting per the schedule while it errors
    pub async fn execute<F, Fut, T>(&self, op: F) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_if(|_| true, op).await
    }

    /// Execute `op`, re-attempting only errors the predicate accepts
    ///
    /// Errors rejected by `retryable` propagate unchanged without
    /// consulting the schedule.
    pub async fn execute_if<P, F, Fut, T>(
        &self,
        retryable: P,
        mut op: F,
    ) -> Result<T, ResilienceError<E>>
    where
        P: Fn(&E) -> bool,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt: u32 = 0;
        loop {
            self.stats.total_attempts.fetch_add(1, Ordering::Relaxed);
            match op().await {
                Ok(value) => {
                    self.stats.successful_calls.fetch_add(1, Ordering::Relaxed);
                    self.listeners.emit(&RetryEvent::Succeeded {
                        attempts: attempt + 1,
                    });
                    return Ok(value);
                }
                Err(error) => {
                    if !retryable(&error) {
                        self.stats.failed_calls.fetch_add(1, Ordering::Relaxed);
                        return Err(ResilienceError::Underlying(error));
                    }
                    let decision = self.schedule.decide(attempt, &error);
                    if !decision.proceed {
                        self.stats.failed_calls.fetch_add(1, Ordering::Relaxed);
                        self.listeners.emit(&RetryEvent::Exhausted {
                            attempts: attempt + 1,
                        });
                        return Err(ResilienceError::Underlying(error));
                    }
                    self.stats.retries_performed.fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .total_delay_micros
                        .fetch_add(decision.delay.as_micros() as u64, Ordering::Relaxed);
                    self.listeners.emit(&RetryEvent::RetryScheduled {
                        attempt,
                        delay: decision.delay,
                    });
                    tracing::debug!(attempt, delay_ms = decision.delay.as_millis() as u64, "retrying after failure");
                    self.clock.sleep(decision.delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Execute `op`, returning `default` if every attempt fails
    pub async fn execute_or_default<F, Fut, T>(&self, default: T, op: F) -> T
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match self.execute(op).await {
            Ok(value) => value,
            Err(_) => default,
        }
    }

    /// Execute `op`, recording every attempt and the total duration
    pub async fn execute_with_history<F, Fut, T>(
        &self,
        mut op: F,
    ) -> (Result<T, ResilienceError<E>>, RetryHistory)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let start = self.clock.now();
        let mut attempts = Vec::new();
        let mut attempt: u32 = 0;

        let result = loop {
            self.stats.total_attempts.fetch_add(1, Ordering::Relaxed);
            match op().await {
                Ok(value) => {
                    self.stats.successful_calls.fetch_add(1, Ordering::Relaxed);
                    attempts.push(AttemptRecord {
                        attempt,
                        succeeded: true,
                        delay_before_next: None,
                    });
                    self.listeners.emit(&RetryEvent::Succeeded {
                        attempts: attempt + 1,
                    });
                    break Ok(value);
                }
                Err(error) => {
                    let decision = self.schedule.decide(attempt, &error);
                    if !decision.proceed {
                        self.stats.failed_calls.fetch_add(1, Ordering::Relaxed);
                        attempts.push(AttemptRecord {
                            attempt,
                            succeeded: false,
                            delay_before_next: None,
                        });
                        self.listeners.emit(&RetryEvent::Exhausted {
                            attempts: attempt + 1,
                        });
                        break Err(ResilienceError::Underlying(error));
                    }
                    self.stats.retries_performed.fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .total_delay_micros
                        .fetch_add(decision.delay.as_micros() as u64, Ordering::Relaxed);
                    attempts.push(AttemptRecord {
                        attempt,
                        succeeded: false,
                        delay_before_next: Some(decision.delay),
                    });
                    self.listeners.emit(&RetryEvent::RetryScheduled {
                        attempt,
                        delay: decision.delay,
                    });
                    self.clock.sleep(decision.delay).await;
                    attempt += 1;
                }
            }
        };

        let history = RetryHistory {
            attempts,
            total_duration: self.clock.now() - start,
        };
        (result, history)
    }
}

impl<E> std::fmt::Debug for Retry<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Retry")
            .field("schedule", &self.schedule)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

/// Schedule-driven re-execution on successful values
///
/// Pacing between repetitions comes from an optional [`Schedule`]; an
/// optional overall timeout bounds the whole repetition and fails with
/// `TimedOut` when it fires first.
pub struct Repeat<T> {
    pacing: Option<Schedule<T>>,
    timeout: Option<Duration>,
    clock: Arc<dyn Clock>,
}

impl<T> Repeat<T> {
    /// Repeat with no pacing and no overall timeout
    pub fn new() -> Self {
        Self {
            pacing: None,
            timeout: None,
            clock: default_clock(),
        }
    }

    /// Fixed delay between repetitions
    pub fn with_fixed_delay(mut self, delay: Duration) -> Self {
        self.pacing = Some(Schedule::spaced(delay));
        self
    }

    /// Exponentially growing delay between repetitions
    pub fn with_exponential_delay(
        mut self,
        base: Duration,
        factor: f64,
    ) -> Result<Self, ResilienceError> {
        self.pacing = Some(Schedule::exponential(base, factor)?);
        Ok(self)
    }

    /// Explicit pacing schedule
    pub fn with_pacing(mut self, schedule: Schedule<T>) -> Self {
        self.pacing = Some(schedule);
        self
    }

    /// Bound the whole repetition; expiry fails with `TimedOut`
    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self, ResilienceError> {
        if timeout.is_zero() {
            return Err(ResilienceError::InvalidArgument(
                "timeout must be > 0".to_string(),
            ));
        }
        self.timeout = Some(timeout);
        Ok(self)
    }

    /// Replace the clock, mainly so tests can inject virtual time
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Run `op` up to `max_attempts` times, returning the first value the
    /// predicate accepts
    ///
    /// Exhausting the budget fails with `ConditionNotMet`. Operation
    /// errors propagate immediately.
    pub async fn until<P, F, Fut, E>(
        &self,
        max_attempts: u32,
        pred: P,
        op: F,
    ) -> Result<T, ResilienceError<E>>
    where
        P: Fn(&T) -> bool,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if max_attempts == 0 {
            return Err(ResilienceError::InvalidArgument(
                "max_attempts must be > 0".to_string(),
            )
            .widen());
        }
        self.bounded(self.until_inner(max_attempts, pred, op)).await
    }

    async fn until_inner<P, F, Fut, E>(
        &self,
        max_attempts: u32,
        pred: P,
        mut op: F,
    ) -> Result<T, ResilienceError<E>>
    where
        P: Fn(&T) -> bool,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        for attempt in 0..max_attempts {
            let value = op().await.map_err(ResilienceError::Underlying)?;
            if pred(&value) {
                return Ok(value);
            }
            if attempt + 1 < max_attempts {
                if !self.pace(attempt, &value).await {
                    break;
                }
            }
        }
        Err(ResilienceError::ConditionNotMet)
    }

    /// Run `op` while the predicate holds, collecting the accepted values
    ///
    /// The first rejected value ends the repetition and is not included;
    /// the result may be empty if the very first value is rejected.
    pub async fn while_collecting<P, F, Fut, E>(
        &self,
        max_attempts: u32,
        pred: P,
        op: F,
    ) -> Result<Vec<T>, ResilienceError<E>>
    where
        P: Fn(&T) -> bool,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if max_attempts == 0 {
            return Err(ResilienceError::InvalidArgument(
                "max_attempts must be > 0".to_string(),
            )
            .widen());
        }
        self.bounded(self.while_inner(max_attempts, pred, op)).await
    }

    async fn while_inner<P, F, Fut, E>(
        &self,
        max_attempts: u32,
        pred: P,
        mut op: F,
    ) -> Result<Vec<T>, ResilienceError<E>>
    where
        P: Fn(&T) -> bool,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut results = Vec::new();
        for attempt in 0..max_attempts {
            let value = op().await.map_err(ResilienceError::Underlying)?;
            if !pred(&value) {
                break;
            }
            let keep_going = if attempt + 1 < max_attempts {
                self.pace(attempt, &value).await
            } else {
                false
            };
            results.push(value);
            if !keep_going {
                break;
            }
        }
        Ok(results)
    }

    /// Run `op` exactly `count` times, collecting every result
    pub async fn collect<F, Fut, E>(&self, count: u32, op: F) -> Result<Vec<T>, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.bounded(self.collect_inner(count, op)).await
    }

    async fn collect_inner<F, Fut, E>(
        &self,
        count: u32,
        mut op: F,
    ) -> Result<Vec<T>, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut results = Vec::with_capacity(count as usize);
        for attempt in 0..count {
            let value = op().await.map_err(ResilienceError::Underlying)?;
            if attempt + 1 < count && !self.pace(attempt, &value).await {
                results.push(value);
                break;
            }
            results.push(value);
        }
        Ok(results)
    }

    /// Sleep per the pacing schedule; returns whether repetition continues
    async fn pace(&self, attempt: u32, value: &T) -> bool {
        match &self.pacing {
            Some(schedule) => {
                let decision = schedule.decide(attempt, value);
                if !decision.proceed {
                    return false;
                }
                self.clock.sleep(decision.delay).await;
                true
            }
            None => true,
        }
    }

    /// Race a repetition against the configured overall timeout
    async fn bounded<R, E>(
        &self,
        run: impl Future<Output = Result<R, ResilienceError<E>>>,
    ) -> Result<R, ResilienceError<E>> {
        match self.timeout {
            Some(timeout) => {
                tokio::select! {
                    result = run => result,
                    _ = self.clock.sleep(timeout) => Err(ResilienceError::TimedOut),
                }
            }
            None => run.await,
        }
    }
}

impl<T> Default for Repeat<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Repeat<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repeat")
            .field("pacing", &self.pacing)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
