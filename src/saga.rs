//! Saga: forward execution with reverse compensation
//!
//! A saga runs an ordered list of steps. When a step fails, the steps
//! that already succeeded are compensated in exact reverse order, each
//! compensation receiving the result its step produced. Compensation
//! failures are collected, never raised; the original step failure stays
//! the top-level error.
//!
//! Steps can individually be wrapped in a deadline (time limiter) or a
//! retry policy through the builder. Cancellation during forward
//! execution triggers compensation of the steps completed so far.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::clock::{default_clock, Clock};
use crate::error::ResilienceError;
use crate::events::{ListenerId, Listeners};
use crate::retry::Retry;
use crate::time_limiter::{TimeLimiter, TimeLimiterConfig};

type StepAction<R, E> =
    Arc<dyn Fn() -> BoxFuture<'static, Result<R, ResilienceError<E>>> + Send + Sync>;
type StepCompensation<R, E> =
    Arc<dyn Fn(R) -> BoxFuture<'static, Result<(), E>> + Send + Sync>;

/// One forward step with an optional undo action
pub struct SagaStep<R, E> {
    name: String,
    action: StepAction<R, E>,
    compensation: Option<StepCompensation<R, E>>,
}

impl<R, E> SagaStep<R, E> {
    /// Name the step was registered under
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Record of a successfully executed forward step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutedStep<R> {
    /// Step name
    pub name: String,
    /// Zero-based forward position
    pub index: usize,
    /// The value the step produced
    pub result: R,
}

/// A compensation that did not complete normally
#[derive(Debug, Clone, PartialEq)]
pub enum CompensationError<E> {
    /// The compensation ran and failed
    Failed {
        /// Step whose compensation failed
        step: String,
        /// The failure
        error: ResilienceError<E>,
    },
    /// The compensation was abandoned by the compensation deadline
    Abandoned {
        /// Step whose compensation never completed
        step: String,
    },
}

/// Outcome of one saga execution
#[derive(Debug, Clone, PartialEq)]
pub enum SagaResult<R, E> {
    /// Every step completed
    Success {
        /// Result of the final step
        result: R,
        /// Every step in forward order with its result
        executed_steps: Vec<ExecutedStep<R>>,
        /// Wall time of the whole run
        duration: Duration,
    },
    /// A step failed and compensation ran
    Failure {
        /// The step failure (or `Cancelled`)
        error: ResilienceError<E>,
        /// Steps whose compensation completed (or was absent)
        compensated_steps: usize,
        /// Compensations that failed or were abandoned
        compensation_errors: Vec<CompensationError<E>>,
        /// Wall time of the whole run including compensation
        duration: Duration,
    },
}

impl<R, E> SagaResult<R, E> {
    /// Whether the saga completed every step
    pub fn is_success(&self) -> bool {
        matches!(self, SagaResult::Success { .. })
    }
}

/// Observable saga events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SagaEvent {
    /// A forward step is about to run
    StepStarted {
        /// Step name
        name: String,
    },
    /// A forward step completed
    StepCompleted {
        /// Step name
        name: String,
    },
    /// A forward step failed
    StepFailed {
        /// Step name
        name: String,
    },
    /// Reverse compensation began
    CompensationStarted {
        /// Number of executed steps to process
        steps: usize,
    },
    /// A step's compensation completed
    StepCompensated {
        /// Step name
        name: String,
    },
    /// A step's compensation failed
    CompensationFailed {
        /// Step name
        name: String,
    },
    /// A step's compensation was abandoned by the deadline
    CompensationAbandoned {
        /// Step name
        name: String,
    },
}

/// Configuration for saga behavior
#[derive(Debug, Clone)]
pub struct SagaConfig {
    /// Keep compensating after a compensation failure
    pub continue_on_compensation_failure: bool,
    /// Deadline for the entire compensation phase
    pub compensation_timeout: Option<Duration>,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            continue_on_compensation_failure: true,
            compensation_timeout: None,
        }
    }
}

impl SagaConfig {
    fn validate(&self) -> Result<(), ResilienceError> {
        if let Some(timeout) = self.compensation_timeout {
            if timeout.is_zero() {
                return Err(ResilienceError::InvalidArgument(
                    "compensation_timeout must be > 0 when set".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Snapshot of saga statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SagaStats {
    /// Executions started
    pub total_executions: u64,
    /// Executions where every step completed
    pub successful_executions: u64,
    /// Executions that entered compensation
    pub failed_executions: u64,
    /// Forward steps completed across executions
    pub steps_executed: u64,
    /// Compensations completed across executions
    pub steps_compensated: u64,
}

#[derive(Debug, Default)]
struct StatsCells {
    total_executions: AtomicU64,
    successful_executions: AtomicU64,
    failed_executions: AtomicU64,
    steps_executed: AtomicU64,
    steps_compensated: AtomicU64,
}

impl StatsCells {
    fn snapshot(&self) -> SagaStats {
        SagaStats {
            total_executions: self.total_executions.load(Ordering::Relaxed),
            successful_executions: self.successful_executions.load(Ordering::Relaxed),
            failed_executions: self.failed_executions.load(Ordering::Relaxed),
            steps_executed: self.steps_executed.load(Ordering::Relaxed),
            steps_compensated: self.steps_compensated.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        self.total_executions.store(0, Ordering::Relaxed);
        self.successful_executions.store(0, Ordering::Relaxed);
        self.failed_executions.store(0, Ordering::Relaxed);
        self.steps_executed.store(0, Ordering::Relaxed);
        self.steps_compensated.store(0, Ordering::Relaxed);
    }
}

/// Builder assembling a [`Saga`] step by step
///
/// # Example
/// ```no_run
/// use parapet::saga::SagaBuilder;
///
/// # async fn example() {
/// let saga = SagaBuilder::new("order")
///     .compensable_step(
///         "reserve",
///         || async { Ok::<_, String>("reservation-1".to_string()) },
///         |reservation: String| async move {
///             let _ = reservation;
///             Ok(())
///         },
///     )
///     .step("confirm", || async { Ok("confirmed".to_string()) })
///     .build()
///     .unwrap();
///
/// let outcome = saga.execute().await;
/// # let _ = outcome;
/// # }
/// ```
pub struct SagaBuilder<R, E> {
    name: String,
    steps: Vec<SagaStep<R, E>>,
    config: SagaConfig,
    clock: Arc<dyn Clock>,
}

impl<R, E> SagaBuilder<R, E>
where
    R: Send + 'static,
    E: Send + 'static,
{
    /// Start a builder for a named saga
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            config: SagaConfig::default(),
            clock: default_clock(),
        }
    }

    /// Replace the saga configuration
    pub fn with_config(mut self, config: SagaConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the clock, mainly so tests can inject virtual time
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Add a step with no compensation
    pub fn step<A, FutA>(mut self, name: impl Into<String>, action: A) -> Self
    where
        A: Fn() -> FutA + Send + Sync + 'static,
        FutA: Future<Output = Result<R, E>> + Send + 'static,
    {
        self.steps.push(SagaStep {
            name: name.into(),
            action: wrap_action(action),
            compensation: None,
        });
        self
    }

    /// Add a step with a compensation receiving the step's result
    pub fn compensable_step<A, FutA, C, FutC>(
        mut self,
        name: impl Into<String>,
        action: A,
        compensation: C,
    ) -> Self
    where
        A: Fn() -> FutA + Send + Sync + 'static,
        FutA: Future<Output = Result<R, E>> + Send + 'static,
        C: Fn(R) -> FutC + Send + Sync + 'static,
        FutC: Future<Output = Result<(), E>> + Send + 'static,
    {
        self.steps.push(SagaStep {
            name: name.into(),
            action: wrap_action(action),
            compensation: Some(wrap_compensation(compensation)),
        });
        self
    }

    /// Add a step whose action must finish within `timeout`
    pub fn timed_step<A, FutA>(
        mut self,
        name: impl Into<String>,
        timeout: Duration,
        action: A,
    ) -> Result<Self, ResilienceError>
    where
        A: Fn() -> FutA + Send + Sync + 'static,
        FutA: Future<Output = Result<R, E>> + Send + 'static,
    {
        self.steps.push(SagaStep {
            name: name.into(),
            action: wrap_timed_action(timeout, action)?,
            compensation: None,
        });
        Ok(self)
    }

    /// Add a compensable step whose action must finish within `timeout`
    pub fn compensable_timed_step<A, FutA, C, FutC>(
        mut self,
        name: impl Into<String>,
        timeout: Duration,
        action: A,
        compensation: C,
    ) -> Result<Self, ResilienceError>
    where
        A: Fn() -> FutA + Send + Sync + 'static,
        FutA: Future<Output = Result<R, E>> + Send + 'static,
        C: Fn(R) -> FutC + Send + Sync + 'static,
        FutC: Future<Output = Result<(), E>> + Send + 'static,
    {
        self.steps.push(SagaStep {
            name: name.into(),
            action: wrap_timed_action(timeout, action)?,
            compensation: Some(wrap_compensation(compensation)),
        });
        Ok(self)
    }

    /// Add a step whose action is retried with a constant delay
    pub fn retried_step<A, FutA>(
        mut self,
        name: impl Into<String>,
        retries: u32,
        delay: Duration,
        action: A,
    ) -> Self
    where
        A: Fn() -> FutA + Send + Sync + 'static,
        FutA: Future<Output = Result<R, E>> + Send + 'static,
    {
        self.steps.push(SagaStep {
            name: name.into(),
            action: wrap_retried_action(retries, delay, action),
            compensation: None,
        });
        self
    }

    /// Add a compensable step whose action is retried with a constant delay
    pub fn compensable_retried_step<A, FutA, C, FutC>(
        mut self,
        name: impl Into<String>,
        retries: u32,
        delay: Duration,
        action: A,
        compensation: C,
    ) -> Self
    where
        A: Fn() -> FutA + Send + Sync + 'static,
        FutA: Future<Output = Result<R, E>> + Send + 'static,
        C: Fn(R) -> FutC + Send + Sync + 'static,
        FutC: Future<Output = Result<(), E>> + Send + 'static,
    {
        self.steps.push(SagaStep {
            name: name.into(),
            action: wrap_retried_action(retries, delay, action),
            compensation: Some(wrap_compensation(compensation)),
        });
        self
    }

    /// Finish the builder
    pub fn build(self) -> Result<Saga<R, E>, ResilienceError> {
        self.config.validate()?;
        if self.steps.is_empty() {
            return Err(ResilienceError::InvalidArgument(
                "saga requires at least one step".to_string(),
            ));
        }
        Ok(Saga {
            name: self.name,
            steps: self.steps,
            config: self.config,
            clock: self.clock,
            stats: StatsCells::default(),
            listeners: Listeners::new(),
        })
    }
}

fn wrap_action<R, E, A, FutA>(action: A) -> StepAction<R, E>
where
    A: Fn() -> FutA + Send + Sync + 'static,
    FutA: Future<Output = Result<R, E>> + Send + 'static,
    R: Send + 'static,
    E: Send + 'static,
{
    Arc::new(
        move || -> BoxFuture<'static, Result<R, ResilienceError<E>>> {
            let fut = action();
            Box::pin(async move { fut.await.map_err(ResilienceError::Underlying) })
        },
    )
}

fn wrap_timed_action<R, E, A, FutA>(
    timeout: Duration,
    action: A,
) -> Result<StepAction<R, E>, ResilienceError>
where
    A: Fn() -> FutA + Send + Sync + 'static,
    FutA: Future<Output = Result<R, E>> + Send + 'static,
    R: Send + 'static,
    E: Send + 'static,
{
    let limiter = Arc::new(TimeLimiter::new(TimeLimiterConfig {
        timeout,
        ..Default::default()
    })?);
    let action = Arc::new(action);
    Ok(Arc::new(
        move || -> BoxFuture<'static, Result<R, ResilienceError<E>>> {
            let limiter = Arc::clone(&limiter);
            let action = Arc::clone(&action);
            Box::pin(async move { limiter.execute(move || action()).await })
        },
    ))
}

fn wrap_retried_action<R, E, A, FutA>(retries: u32, delay: Duration, action: A) -> StepAction<R, E>
where
    A: Fn() -> FutA + Send + Sync + 'static,
    FutA: Future<Output = Result<R, E>> + Send + 'static,
    R: Send + 'static,
    E: Send + 'static,
{
    let retry = Arc::new(Retry::<E>::spaced(retries, delay));
    let action = Arc::new(action);
    Arc::new(
        move || -> BoxFuture<'static, Result<R, ResilienceError<E>>> {
            let retry = Arc::clone(&retry);
            let action = Arc::clone(&action);
            Box::pin(async move { retry.execute(move || action()).await })
        },
    )
}

fn wrap_compensation<R, E, C, FutC>(compensation: C) -> StepCompensation<R, E>
where
    C: Fn(R) -> FutC + Send + Sync + 'static,
    FutC: Future<Output = Result<(), E>> + Send + 'static,
    R: Send + 'static,
    E: Send + 'static,
{
    Arc::new(
        move |result| -> BoxFuture<'static, Result<(), E>> { Box::pin(compensation(result)) },
    )
}

/// Forward/compensate transactional sequencer
pub struct Saga<R, E> {
    name: String,
    steps: Vec<SagaStep<R, E>>,
    config: SagaConfig,
    clock: Arc<dyn Clock>,
    stats: StatsCells,
    listeners: Listeners<SagaEvent>,
}

impl<R, E> Saga<R, E>
where
    R: Clone + Send + 'static,
    E: Send + 'static,
{
    /// Name the saga was built with
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of steps
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Register a listener for saga events
    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&SagaEvent) + Send + Sync + 'static,
    {
        self.listeners.add(listener)
    }

    /// Remove a previously registered listener
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// Snapshot of the saga's statistics
    pub fn statistics(&self) -> SagaStats {
        self.stats.snapshot()
    }

    /// Reset all statistics counters to zero
    pub fn reset_statistics(&self) {
        self.stats.reset();
    }

    /// Run the saga forward, compensating on failure
    pub async fn execute(&self) -> SagaResult<R, E> {
        self.run(None).await
    }

    /// Run the saga forward, compensating on failure or cancellation
    ///
    /// Cancelling the token between or during steps stops forward
    /// execution; the steps completed so far are compensated and the
    /// failure's error is `Cancelled`.
    pub async fn execute_cancellable(&self, token: &CancellationToken) -> SagaResult<R, E> {
        self.run(Some(token)).await
    }

    async fn run(&self, token: Option<&CancellationToken>) -> SagaResult<R, E> {
        self.stats.total_executions.fetch_add(1, Ordering::Relaxed);
        let start = self.clock.now();
        let mut executed: Vec<ExecutedStep<R>> = Vec::new();
        let mut failure: Option<ResilienceError<E>> = None;

        for (index, step) in self.steps.iter().enumerate() {
            self.listeners.emit(&SagaEvent::StepStarted {
                name: step.name.clone(),
            });

            let outcome = match token {
                Some(token) => {
                    tokio::select! {
                        _ = token.cancelled() => Err(ResilienceError::Cancelled),
                        result = (step.action)() => result,
                    }
                }
                None => (step.action)().await,
            };

            match outcome {
                Ok(result) => {
                    self.stats.steps_executed.fetch_add(1, Ordering::Relaxed);
                    self.listeners.emit(&SagaEvent::StepCompleted {
                        name: step.name.clone(),
                    });
                    executed.push(ExecutedStep {
                        name: step.name.clone(),
                        index,
                        result,
                    });
                }
                Err(cause) => {
                    self.listeners.emit(&SagaEvent::StepFailed {
                        name: step.name.clone(),
                    });
                    tracing::debug!(saga = %self.name, step = %step.name, "saga step failed; compensating");
                    failure = Some(match cause {
                        ResilienceError::Cancelled => ResilienceError::Cancelled,
                        other => ResilienceError::SagaStepFailed {
                            step: step.name.clone(),
                            cause: Box::new(other),
                        },
                    });
                    break;
                }
            }
        }

        match failure {
            None => {
                self.stats
                    .successful_executions
                    .fetch_add(1, Ordering::Relaxed);
                let result = executed
                    .last()
                    .map(|step| step.result.clone())
                    .expect("saga has at least one step");
                SagaResult::Success {
                    result,
                    executed_steps: executed,
                    duration: self.clock.now() - start,
                }
            }
            Some(error) => {
                self.stats.failed_executions.fetch_add(1, Ordering::Relaxed);
                let (compensated_steps, compensation_errors) = self.compensate(executed).await;
                SagaResult::Failure {
                    error,
                    compensated_steps,
                    compensation_errors,
                    duration: self.clock.now() - start,
                }
            }
        }
    }

    /// Compensate executed steps in reverse order
    async fn compensate(
        &self,
        executed: Vec<ExecutedStep<R>>,
    ) -> (usize, Vec<CompensationError<E>>) {
        self.listeners.emit(&SagaEvent::CompensationStarted {
            steps: executed.len(),
        });

        let deadline: Option<Instant> = self
            .config
            .compensation_timeout
            .map(|timeout| self.clock.now() + timeout);
        let mut compensated = 0usize;
        let mut errors = Vec::new();
        let mut deadline_hit = false;

        for record in executed.into_iter().rev() {
            let step = &self.steps[record.index];

            if deadline_hit {
                errors.push(CompensationError::Abandoned {
                    step: step.name.clone(),
                });
                self.listeners.emit(&SagaEvent::CompensationAbandoned {
                    name: step.name.clone(),
                });
                continue;
            }

            let compensation = match &step.compensation {
                // A step without compensation is skipped, not an error.
                None => {
                    compensated += 1;
                    continue;
                }
                Some(compensation) => compensation,
            };

            let outcome = match deadline {
                None => Some(compensation(record.result).await),
                Some(deadline) => {
                    let now = self.clock.now();
                    if now >= deadline {
                        None
                    } else {
                        let remaining = deadline - now;
                        tokio::select! {
                            result = compensation(record.result) => Some(result),
                            _ = self.clock.sleep(remaining) => None,
                        }
                    }
                }
            };

            match outcome {
                Some(Ok(())) => {
                    compensated += 1;
                    self.stats.steps_compensated.fetch_add(1, Ordering::Relaxed);
                    self.listeners.emit(&SagaEvent::StepCompensated {
                        name: step.name.clone(),
                    });
                }
                Some(Err(error)) => {
                    errors.push(CompensationError::Failed {
                        step: step.name.clone(),
                        error: ResilienceError::Underlying(error),
                    });
                    self.listeners.emit(&SagaEvent::CompensationFailed {
                        name: step.name.clone(),
                    });
                    tracing::warn!(saga = %self.name, step = %step.name, "saga compensation failed");
                    if !self.config.continue_on_compensation_failure {
                        break;
                    }
                }
                None => {
                    deadline_hit = true;
                    errors.push(CompensationError::Abandoned {
                        step: step.name.clone(),
                    });
                    self.listeners.emit(&SagaEvent::CompensationAbandoned {
                        name: step.name.clone(),
                    });
                    tracing::warn!(saga = %self.name, step = %step.name, "saga compensation abandoned by deadline");
                }
            }
        }

        (compensated, errors)
    }
}

impl<R, E> std::fmt::Debug for Saga<R, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Saga")
            .field("name", &self.name)
            .field("steps", &self.steps.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Aggregate outcome of running many sagas concurrently
#[derive(Debug, Clone, PartialEq)]
pub struct SagaReport<R, E> {
    /// Per-saga results, aligned with the input order
    pub results: Vec<SagaResult<R, E>>,
    /// Sagas that completed every step
    pub succeeded: usize,
    /// Sagas that entered compensation
    pub failed: usize,
    /// Wall time of the whole batch
    pub total_duration: Duration,
}

impl<R, E> SagaReport<R, E> {
    /// Fraction of sagas that succeeded, in `[0, 1]`
    pub fn success_rate(&self) -> f64 {
        if self.results.is_empty() {
            0.0
        } else {
            self.succeeded as f64 / self.results.len() as f64
        }
    }
}

/// Runs independent sagas concurrently and aggregates their outcomes
#[derive(Debug)]
pub struct ParallelSagaCoordinator {
    clock: Arc<dyn Clock>,
}

impl ParallelSagaCoordinator {
    /// Create a coordinator
    pub fn new() -> Self {
        Self {
            clock: default_clock(),
        }
    }

    /// Replace the clock, mainly so tests can inject virtual time
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Execute every saga concurrently; results align with the input
    pub async fn execute_all<R, E>(&self, sagas: &[Saga<R, E>]) -> SagaReport<R, E>
    where
        R: Clone + Send + 'static,
        E: Send + 'static,
    {
        let start = self.clock.now();
        let results =
            futures::future::join_all(sagas.iter().map(|saga| saga.execute())).await;

        let succeeded = results.iter().filter(|result| result.is_success()).count();
        let failed = results.len() - succeeded;

        SagaReport {
            results,
            succeeded,
            failed,
            total_duration: self.clock.now() - start,
        }
    }
}

impl Default for ParallelSagaCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
