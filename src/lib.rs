//! Parapet: composable resilience primitives for async call chains
//!
//! # Overview
//!
//! This crate provides in-process controllers that guard an async
//! operation against overload, failure, and latency. It includes:
//!
//! - **Retry / Repeat**: schedule-driven re-execution with jitter
//! - **Circuit Breaker**: fails fast while a dependency is unhealthy
//! - **Bulkhead**: bounded concurrency with a FIFO wait queue
//! - **Rate Limiter**: token-bucket and sliding-window admission
//! - **Time Limiter**: deadlines with cooperative cancellation
//! - **Cache**: bounded TTL store with LRU/LFU/FIFO eviction and
//!   single-flight loading
//! - **Saga**: forward execution with reverse compensation
//!
//! # Key Principles
//!
//! The crate is **pure logic** with no I/O, no background threads, and no
//! knowledge of what it guards. Every primitive exposes the same surface:
//! an async `execute` combinator over a fallible operation, synchronous
//! statistics, and listeners that fire outside the primitive's critical
//! section. Time always flows through an injectable [`Clock`], so tests
//! can drive a virtual clock.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Your Application                │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Circuit Breaker                   │  ← Fail-fast isolation
//! │  (Closed / Open / HalfOpen gate)        │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Bulkhead + Rate Limiter           │  ← Admission control
//! │  (concurrency cap, token bucket)        │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Time Limiter + Retry              │  ← Latency + recovery
//! │  (deadline race, scheduled re-attempts) │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//!         Guarded Operation
//!        (HTTP call, query, job step)
//! ```
//!
//! # Usage Example
//!
//! ```no_run
//! use parapet::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
//! use parapet::retry::Retry;
//! use parapet::ResilienceError;
//! use std::time::Duration;
//!
//! # async fn fetch_quote() -> Result<String, String> { Ok("42".to_string()) }
//! # async fn example() -> Result<(), ResilienceError<String>> {
//! let breaker = CircuitBreaker::new(CircuitBreakerConfig {
//!     failure_threshold: 5,
//!     reset_timeout: Duration::from_secs(30),
//!     ..Default::default()
//! })
//! .map_err(ResilienceError::widen)?;
//!
//! let retry = Retry::capped_exponential(3, Duration::from_millis(100), 2.0, Duration::from_secs(2))
//!     .map_err(ResilienceError::widen)?;
//!
//! // Retry around the breaker: rejected admissions surface immediately,
//! // transient operation errors are re-attempted with backoff.
//! let quote = retry
//!     .execute_if(
//!         |err| !matches!(err, ResilienceError::BreakerOpen),
//!         || breaker.execute(fetch_quote),
//!     )
//!     .await;
//! # let _ = quote;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod bulkhead;
pub mod cache;
pub mod circuit_breaker;
pub mod clock;
pub mod error;
pub mod events;
pub mod rate_limiter;
pub mod registry;
pub mod retry;
pub mod saga;
pub mod schedule;
pub mod sliding_window;
pub mod time_limiter;

// Re-export main types for convenience
pub use bulkhead::{Bulkhead, BulkheadConfig, BulkheadStats};
pub use cache::{Cache, CacheConfig, CacheStats, EvictionReason, EvictionStrategy, LoadingCache};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
pub use clock::{default_clock, Clock, TokioClock};
pub use error::ResilienceError;
pub use events::{ListenerId, Listeners};
pub use rate_limiter::{RateLimiter, RateLimiterConfig, RateLimiterStats};
pub use registry::Registry;
pub use retry::{Repeat, Retry, RetryStats};
pub use saga::{
    ParallelSagaCoordinator, Saga, SagaBuilder, SagaConfig, SagaResult, SagaStats,
};
pub use schedule::{Decision, Schedule};
pub use sliding_window::{SlidingWindowConfig, SlidingWindowLimiter, SlidingWindowStats};
pub use time_limiter::{OnTimeout, TimeLimiter, TimeLimiterConfig, TimeLimiterStats};

/// Prelude module for convenient imports
///
/// # Example
/// ```
/// use parapet::prelude::*;
/// ```
pub mod prelude {
    pub use super::bulkhead::{Bulkhead, BulkheadConfig};
    pub use super::cache::{Cache, CacheConfig, EvictionStrategy, LoadingCache};
    pub use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
    pub use super::clock::{Clock, TokioClock};
    pub use super::error::ResilienceError;
    pub use super::rate_limiter::{RateLimiter, RateLimiterConfig};
    pub use super::registry::{
        BulkheadRegistry, CircuitBreakerRegistry, RateLimiterRegistry, Registry,
        TimeLimiterRegistry,
    };
    pub use super::retry::{Repeat, Retry};
    pub use super::saga::{Saga, SagaBuilder, SagaConfig, SagaResult};
    pub use super::schedule::Schedule;
    pub use super::sliding_window::{SlidingWindowConfig, SlidingWindowLimiter};
    pub use super::time_limiter::{OnTimeout, TimeLimiter, TimeLimiterConfig};
}
