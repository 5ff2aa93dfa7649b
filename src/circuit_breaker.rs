//! Circuit breaker for fault isolation
//!
//! The circuit breaker prevents cascading failures by failing fast when a
//! guarded operation keeps failing. It has three states:
//! - Closed: normal operation, consecutive failures are counted
//! - Open: calls are rejected immediately with `BreakerOpen`
//! - HalfOpen: a bounded number of probe calls test recovery
//!
//! Admission and state transitions are transactional: the state is read
//! and updated under one lock, the operation runs outside it, and the
//! resulting transition (if any) is published to listeners only after the
//! transaction commits. Cancellation of an admitted call counts as
//! neither success nor failure; a half-open probe slot taken by a
//! cancelled call is still released.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use crate::clock::{default_clock, Clock};
use crate::error::ResilienceError;
use crate::events::{ListenerId, Listeners};

/// State of the circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests pass through; consecutive failures are counted
    Closed,
    /// Requests are rejected immediately
    Open,
    /// A bounded number of probes test whether the fault has cleared
    HalfOpen,
}

/// Observable circuit breaker events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitBreakerEvent {
    /// The breaker moved between states
    StateChange {
        /// State before the transition
        from: CircuitState,
        /// State after the transition
        to: CircuitState,
    },
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Wait after the last failure before half-open probing
    pub reset_timeout: Duration,
    /// Successes in half-open needed to close the circuit
    pub half_open_success_threshold: u32,
    /// Concurrent probes admitted while half-open
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            half_open_success_threshold: 2,
            half_open_max_calls: 3,
        }
    }
}

impl CircuitBreakerConfig {
    fn validate(&self) -> Result<(), ResilienceError> {
        if self.failure_threshold == 0 {
            return Err(ResilienceError::InvalidArgument(
                "failure_threshold must be > 0".to_string(),
            ));
        }
        if self.reset_timeout.is_zero() {
            return Err(ResilienceError::InvalidArgument(
                "reset_timeout must be > 0".to_string(),
            ));
        }
        if self.half_open_success_threshold == 0 {
            return Err(ResilienceError::InvalidArgument(
                "half_open_success_threshold must be > 0".to_string(),
            ));
        }
        if self.half_open_max_calls == 0 {
            return Err(ResilienceError::InvalidArgument(
                "half_open_max_calls must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Snapshot of circuit breaker statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerStats {
    /// Calls submitted, admitted or not
    pub total_calls: u64,
    /// Admitted calls that succeeded
    pub successful_calls: u64,
    /// Admitted calls that failed
    pub failed_calls: u64,
    /// Calls rejected at admission
    pub rejected_calls: u64,
    /// State transitions since creation or the last stats reset
    pub state_transitions: u64,
}

#[derive(Debug, Default)]
struct StatsCells {
    total_calls: AtomicU64,
    successful_calls: AtomicU64,
    failed_calls: AtomicU64,
    rejected_calls: AtomicU64,
    state_transitions: AtomicU64,
}

impl StatsCells {
    fn snapshot(&self) -> CircuitBreakerStats {
        CircuitBreakerStats {
            total_calls: self.total_calls.load(Ordering::Relaxed),
            successful_calls: self.successful_calls.load(Ordering::Relaxed),
            failed_calls: self.failed_calls.load(Ordering::Relaxed),
            rejected_calls: self.rejected_calls.load(Ordering::Relaxed),
            state_transitions: self.state_transitions.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        self.total_calls.store(0, Ordering::Relaxed);
        self.successful_calls.store(0, Ordering::Relaxed);
        self.failed_calls.store(0, Ordering::Relaxed);
        self.rejected_calls.store(0, Ordering::Relaxed);
        self.state_transitions.store(0, Ordering::Relaxed);
    }
}

/// Internal state, guarded by one mutex
#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    half_open_success_count: u32,
    half_open_in_flight: u32,
    half_open_epoch: u64,
    last_failure_time: Option<Instant>,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            half_open_success_count: 0,
            half_open_in_flight: 0,
            half_open_epoch: 0,
            last_failure_time: None,
        }
    }
}

/// How a call was admitted, deciding what must be released afterwards
enum Admission {
    Closed,
    HalfOpen { epoch: u64 },
}

/// Circuit breaker guarding an async operation
///
/// # Example
/// ```no_run
/// use parapet::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
///
/// # async fn example() {
/// let breaker = CircuitBreaker::new(CircuitBreakerConfig::default()).unwrap();
///
/// let result = breaker
///     .execute(|| async { Ok::<_, String>(42) })
///     .await;
/// # let _ = result;
/// # }
/// ```
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<BreakerState>,
    stats: StatsCells,
    listeners: Listeners<CircuitBreakerEvent>,
}

impl CircuitBreaker {
    /// Create a circuit breaker with the given configuration
    pub fn new(config: CircuitBreakerConfig) -> Result<Self, ResilienceError> {
        config.validate()?;
        Ok(Self {
            config,
            clock: default_clock(),
            state: Mutex::new(BreakerState::new()),
            stats: StatsCells::default(),
            listeners: Listeners::new(),
        })
    }

    /// Create a circuit breaker with default configuration
    pub fn new_default() -> Self {
        Self {
            config: CircuitBreakerConfig::default(),
            clock: default_clock(),
            state: Mutex::new(BreakerState::new()),
            stats: StatsCells::default(),
            listeners: Listeners::new(),
        }
    }

    /// Replace the clock, mainly so tests can inject virtual time
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Current state of the breaker
    pub fn current_state(&self) -> CircuitState {
        self.state.lock().expect("breaker state poisoned").state
    }

    /// Consecutive failure count
    pub fn failure_count(&self) -> u32 {
        self.state
            .lock()
            .expect("breaker state poisoned")
            .failure_count
    }

    /// Successes counted so far while half-open
    pub fn half_open_success_count(&self) -> u32 {
        self.state
            .lock()
            .expect("breaker state poisoned")
            .half_open_success_count
    }

    /// Register a listener for state change events
    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&CircuitBreakerEvent) + Send + Sync + 'static,
    {
        self.listeners.add(listener)
    }

    /// Remove a previously registered listener
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// Snapshot of the breaker's statistics
    pub fn statistics(&self) -> CircuitBreakerStats {
        self.stats.snapshot()
    }

    /// Reset all statistics counters to zero
    pub fn reset_statistics(&self) {
        self.stats.reset();
    }

    /// Execute an operation under breaker protection
    ///
    /// Rejected admissions fail with `BreakerOpen` without running the
    /// operation. Operation errors count as failures and propagate as
    /// `Underlying`.
    pub async fn execute<F, Fut, T, E>(&self, op: F) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.stats.total_calls.fetch_add(1, Ordering::Relaxed);

        let admission = match self.try_admit() {
            Ok(admission) => admission,
            Err(err) => {
                self.stats.rejected_calls.fetch_add(1, Ordering::Relaxed);
                return Err(err.widen());
            }
        };

        // Releases a half-open probe slot on every exit path, including
        // cancellation of the caller mid-operation.
        let _slot = ProbeSlot {
            breaker: self,
            admission,
        };

        match op().await {
            Ok(value) => {
                self.stats.successful_calls.fetch_add(1, Ordering::Relaxed);
                let event = self.on_success();
                self.publish(event);
                Ok(value)
            }
            Err(error) => {
                self.stats.failed_calls.fetch_add(1, Ordering::Relaxed);
                let event = self.on_failure();
                self.publish(event);
                Err(ResilienceError::Underlying(error))
            }
        }
    }

    /// Execute an operation, running `fallback` instead when admission is
    /// rejected
    ///
    /// Only admission rejections trigger the fallback; operation errors
    /// propagate unchanged.
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
        match self.execute(op).await {
            Err(err) if err.is_admission_rejection() => {
                fallback().await.map_err(ResilienceError::Underlying)
            }
            other => other,
        }
    }

    /// Force the breaker closed, clearing every counter
    pub fn reset(&self) {
        let event = {
            let mut state = self.state.lock().expect("breaker state poisoned");
            let prior = state.state;
            *state = BreakerState {
                half_open_epoch: state.half_open_epoch,
                ..BreakerState::new()
            };
            (prior != CircuitState::Closed).then_some(CircuitBreakerEvent::StateChange {
                from: prior,
                to: CircuitState::Closed,
            })
        };
        self.publish(event);
    }

    /// Force the breaker open, stamping the failure time
    pub fn trip(&self) {
        let event = {
            let mut state = self.state.lock().expect("breaker state poisoned");
            let prior = state.state;
            state.state = CircuitState::Open;
            state.last_failure_time = Some(self.clock.now());
            state.half_open_success_count = 0;
            (prior != CircuitState::Open).then_some(CircuitBreakerEvent::StateChange {
                from: prior,
                to: CircuitState::Open,
            })
        };
        self.publish(event);
    }

    /// Transactional admission check
    fn try_admit(&self) -> Result<Admission, ResilienceError> {
        let (admission, event) = {
            let mut state = self.state.lock().expect("breaker state poisoned");
            match state.state {
                CircuitState::Closed => (Admission::Closed, None),
                CircuitState::Open => {
                    let elapsed = state
                        .last_failure_time
                        .map(|t| self.clock.now() - t)
                        .unwrap_or(Duration::MAX);
                    if elapsed >= self.config.reset_timeout {
                        state.state = CircuitState::HalfOpen;
                        state.half_open_success_count = 0;
                        state.half_open_epoch += 1;
                        state.half_open_in_flight = 1;
                        (
                            Admission::HalfOpen {
                                epoch: state.half_open_epoch,
                            },
                            Some(CircuitBreakerEvent::StateChange {
                                from: CircuitState::Open,
                                to: CircuitState::HalfOpen,
                            }),
                        )
                    } else {
                        return Err(ResilienceError::BreakerOpen);
                    }
                }
                CircuitState::HalfOpen => {
                    if state.half_open_in_flight >= self.config.half_open_max_calls {
                        return Err(ResilienceError::BreakerOpen);
                    }
                    state.half_open_in_flight += 1;
                    (
                        Admission::HalfOpen {
                            epoch: state.half_open_epoch,
                        },
                        None,
                    )
                }
            }
        };
        self.publish(event);
        Ok(admission)
    }

    fn on_success(&self) -> Option<CircuitBreakerEvent> {
        let mut state = self.state.lock().expect("breaker state poisoned");
        match state.state {
            CircuitState::Closed => {
                state.failure_count = 0;
                None
            }
            CircuitState::HalfOpen => {
                state.half_open_success_count += 1;
                if state.half_open_success_count >= self.config.half_open_success_threshold {
                    state.state = CircuitState::Closed;
                    state.failure_count = 0;
                    state.half_open_success_count = 0;
                    state.last_failure_time = None;
                    Some(CircuitBreakerEvent::StateChange {
                        from: CircuitState::HalfOpen,
                        to: CircuitState::Closed,
                    })
                } else {
                    None
                }
            }
            CircuitState::Open => None,
        }
    }

    fn on_failure(&self) -> Option<CircuitBreakerEvent> {
        let mut state = self.state.lock().expect("breaker state poisoned");
        match state.state {
            CircuitState::Closed => {
                state.failure_count += 1;
                if state.failure_count >= self.config.failure_threshold {
                    state.state = CircuitState::Open;
                    state.last_failure_time = Some(self.clock.now());
                    Some(CircuitBreakerEvent::StateChange {
                        from: CircuitState::Closed,
                        to: CircuitState::Open,
                    })
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                state.state = CircuitState::Open;
                state.last_failure_time = Some(self.clock.now());
                state.half_open_success_count = 0;
                Some(CircuitBreakerEvent::StateChange {
                    from: CircuitState::HalfOpen,
                    to: CircuitState::Open,
                })
            }
            CircuitState::Open => None,
        }
    }

    /// Count and emit a committed transition, outside the state lock
    fn publish(&self, event: Option<CircuitBreakerEvent>) {
        if let Some(event) = event {
            self.stats.state_transitions.fetch_add(1, Ordering::Relaxed);
            if let CircuitBreakerEvent::StateChange { from, to } = event {
                tracing::debug!(?from, ?to, "circuit breaker state change");
            }
            self.listeners.emit(&event);
        }
    }

    fn release_probe_slot(&self, epoch: u64) {
        let mut state = self.state.lock().expect("breaker state poisoned");
        if state.half_open_epoch == epoch {
            state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("state", &self.current_state())
            .finish_non_exhaustive()
    }
}

struct ProbeSlot<'a> {
    breaker: &'a CircuitBreaker,
    admission: Admission,
}

impl Drop for ProbeSlot<'_> {
    fn drop(&mut self) {
        if let Admission::HalfOpen { epoch } = self.admission {
            self.breaker.release_probe_slot(epoch);
        }
    }
}
