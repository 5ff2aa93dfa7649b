//! Sliding-window rate limiting
//!
//! Admission timestamps are kept for the interval `(now − window, now]`.
//! A request is admitted when fewer than `max_requests` timestamps remain
//! after pruning; prune, test, and insert happen inside one critical
//! section.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use crate::clock::{default_clock, Clock};
use crate::error::ResilienceError;
use crate::events::{ListenerId, Listeners};

/// Observable sliding-window events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlidingWindowEvent {
    /// The request was admitted and its timestamp recorded
    Admitted,
    /// The request was refused because the window is full
    Rejected,
}

/// Configuration for sliding-window behavior
#[derive(Debug, Clone)]
pub struct SlidingWindowConfig {
    /// Maximum requests admitted per window
    pub max_requests: usize,
    /// Length of the moving window
    pub window_duration: Duration,
}

impl Default for SlidingWindowConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window_duration: Duration::from_secs(1),
        }
    }
}

impl SlidingWindowConfig {
    fn validate(&self) -> Result<(), ResilienceError> {
        if self.max_requests == 0 {
            return Err(ResilienceError::InvalidArgument(
                "max_requests must be > 0".to_string(),
            ));
        }
        if self.window_duration.is_zero() {
            return Err(ResilienceError::InvalidArgument(
                "window_duration must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Snapshot of sliding-window statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlidingWindowStats {
    /// Admissions granted
    pub admitted_calls: u64,
    /// Admissions refused (`try_execute` only)
    pub rejected_calls: u64,
}

#[derive(Debug, Default)]
struct StatsCells {
    admitted_calls: AtomicU64,
    rejected_calls: AtomicU64,
}

impl StatsCells {
    fn snapshot(&self) -> SlidingWindowStats {
        SlidingWindowStats {
            admitted_calls: self.admitted_calls.load(Ordering::Relaxed),
            rejected_calls: self.rejected_calls.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        self.admitted_calls.store(0, Ordering::Relaxed);
        self.rejected_calls.store(0, Ordering::Relaxed);
    }
}

/// Discrete-window admission around an async operation
///
/// # Example
/// ```no_run
/// use parapet::sliding_window::{SlidingWindowLimiter, SlidingWindowConfig};
/// use std::time::Duration;
///
/// # async fn example() {
/// let limiter = SlidingWindowLimiter::new(SlidingWindowConfig {
///     max_requests: 50,
///     window_duration: Duration::from_secs(1),
/// })
/// .unwrap();
///
/// let result = limiter
///     .try_execute(|| async { Ok::<_, String>("sent") })
///     .await;
/// # let _ = result;
/// # }
/// ```
pub struct SlidingWindowLimiter {
    config: SlidingWindowConfig,
    clock: Arc<dyn Clock>,
    timestamps: Mutex<VecDeque<Instant>>,
    stats: StatsCells,
    listeners: Listeners<SlidingWindowEvent>,
}

impl SlidingWindowLimiter {
    /// Create a sliding-window limiter with the given configuration
    pub fn new(config: SlidingWindowConfig) -> Result<Self, ResilienceError> {
        config.validate()?;
        Ok(Self {
            config,
            clock: default_clock(),
            timestamps: Mutex::new(VecDeque::new()),
            stats: StatsCells::default(),
            listeners: Listeners::new(),
        })
    }

    /// Replace the clock, mainly so tests can inject virtual time
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Requests currently recorded in the window
    pub fn current_window_count(&self) -> usize {
        let now = self.clock.now();
        let mut timestamps = self.timestamps.lock().expect("window state poisoned");
        Self::prune(&mut timestamps, now, self.config.window_duration);
        timestamps.len()
    }

    /// Register a listener for admission events
    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&SlidingWindowEvent) + Send + Sync + 'static,
    {
        self.listeners.add(listener)
    }

    /// Remove a previously registered listener
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// Snapshot of the limiter's statistics
    pub fn statistics(&self) -> SlidingWindowStats {
        self.stats.snapshot()
    }

    /// Reset all statistics counters to zero
    pub fn reset_statistics(&self) {
        self.stats.reset();
    }

    /// Execute the operation if the window has room right now
    pub async fn try_execute<F, Fut, T, E>(&self, op: F) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.try_admit() {
            self.stats.rejected_calls.fetch_add(1, Ordering::Relaxed);
            self.listeners.emit(&SlidingWindowEvent::Rejected);
            return Err(ResilienceError::RateLimitExceeded);
        }

        self.stats.admitted_calls.fetch_add(1, Ordering::Relaxed);
        self.listeners.emit(&SlidingWindowEvent::Admitted);
        op().await.map_err(ResilienceError::Underlying)
    }

    /// Execute the operation, waiting until the window has room
    pub async fn execute<F, Fut, T, E>(&self, op: F) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        loop {
            // Admission is one critical section; the wait for the oldest
            // timestamp to leave the window happens outside it.
            let wait = {
                let now = self.clock.now();
                let mut timestamps = self.timestamps.lock().expect("window state poisoned");
                Self::prune(&mut timestamps, now, self.config.window_duration);
                if timestamps.len() < self.config.max_requests {
                    timestamps.push_back(now);
                    None
                } else {
                    timestamps
                        .front()
                        .map(|oldest| (*oldest + self.config.window_duration) - now)
                }
            };

            match wait {
                None => break,
                Some(wait) => self.clock.sleep(wait).await,
            }
        }

        self.stats.admitted_calls.fetch_add(1, Ordering::Relaxed);
        self.listeners.emit(&SlidingWindowEvent::Admitted);
        op().await.map_err(ResilienceError::Underlying)
    }

    /// Prune, test, and insert atomically
    fn try_admit(&self) -> bool {
        let now = self.clock.now();
        let mut timestamps = self.timestamps.lock().expect("window state poisoned");
        Self::prune(&mut timestamps, now, self.config.window_duration);
        if timestamps.len() < self.config.max_requests {
            timestamps.push_back(now);
            true
        } else {
            false
        }
    }

    /// Drop timestamps at or before `now − window`
    fn prune(timestamps: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while let Some(oldest) = timestamps.front() {
            if now.saturating_duration_since(*oldest) >= window {
                timestamps.pop_front();
            } else {
                break;
            }
        }
    }
}

impl std::fmt::Debug for SlidingWindowLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlidingWindowLimiter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max: usize, window: Duration) -> SlidingWindowLimiter {
        SlidingWindowLimiter::new(SlidingWindowConfig {
            max_requests: max,
            window_duration: window,
        })
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_admits_up_to_max_then_rejects() {
        let l = limiter(3, Duration::from_secs(1));

        for _ in 0..3 {
            l.try_execute(|| async { Ok::<_, String>(()) })
                .await
                .unwrap();
        }
        assert_eq!(l.current_window_count(), 3);

        let result: Result<(), ResilienceError<String>> =
            l.try_execute(|| async { Ok(()) }).await;
        assert_eq!(result.unwrap_err(), ResilienceError::RateLimitExceeded);

        let stats = l.statistics();
        assert_eq!(stats.admitted_calls, 3);
        assert_eq!(stats.rejected_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_slides_and_frees_capacity() {
        let l = limiter(2, Duration::from_millis(100));

        l.try_execute(|| async { Ok::<_, String>(()) })
            .await
            .unwrap();
        tokio::time::advance(Duration::from_millis(60)).await;
        l.try_execute(|| async { Ok::<_, String>(()) })
            .await
            .unwrap();

        let result: Result<(), ResilienceError<String>> =
            l.try_execute(|| async { Ok(()) }).await;
        assert_eq!(result.unwrap_err(), ResilienceError::RateLimitExceeded);

        // The first timestamp leaves the window after another 40ms.
        tokio::time::advance(Duration::from_millis(45)).await;
        l.try_execute(|| async { Ok::<_, String>(()) })
            .await
            .unwrap();
        assert_eq!(l.current_window_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_count_never_exceeds_max() {
        let l = limiter(5, Duration::from_millis(50));

        for _ in 0..20 {
            let _ = l.try_execute(|| async { Ok::<_, String>(()) }).await;
            tokio::time::advance(Duration::from_millis(7)).await;
            assert!(l.current_window_count() <= 5);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_execute_waits_for_room() {
        let l = limiter(1, Duration::from_millis(200));

        l.execute(|| async { Ok::<_, String>(()) }).await.unwrap();

        let start = tokio::time::Instant::now();
        l.execute(|| async { Ok::<_, String>(()) }).await.unwrap();
        let waited = tokio::time::Instant::now() - start;

        assert!(
            waited >= Duration::from_millis(199),
            "second admission must wait out the window, waited {waited:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_boundary_timestamp_exactly_at_window_edge_is_pruned() {
        let l = limiter(1, Duration::from_millis(100));

        l.try_execute(|| async { Ok::<_, String>(()) })
            .await
            .unwrap();

        // The window is (now - duration, now]: at exactly 100ms the old
        // timestamp is out.
        tokio::time::advance(Duration::from_millis(100)).await;
        l.try_execute(|| async { Ok::<_, String>(()) })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_op_error_propagates_and_slot_stays_consumed() {
        let l = limiter(1, Duration::from_secs(10));
        let result: Result<(), _> = l
            .try_execute(|| async { Err("bad gateway".to_string()) })
            .await;
        assert_eq!(
            result.unwrap_err(),
            ResilienceError::Underlying("bad gateway".to_string())
        );
        assert_eq!(l.current_window_count(), 1);
    }

    #[test]
    fn test_config_validation() {
        assert!(SlidingWindowLimiter::new(SlidingWindowConfig {
            max_requests: 0,
            window_duration: Duration::from_secs(1),
        })
        .is_err());
        assert!(SlidingWindowLimiter::new(SlidingWindowConfig {
            max_requests: 1,
            window_duration: Duration::ZERO,
        })
        .is_err());
    }
}
