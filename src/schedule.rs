//! Composable retry/repeat schedules
//!
//! A [`Schedule`] turns an attempt index and the observed value (an error
//! for retry, a successful value for repeat) into a [`Decision`]: how long
//! to wait before the next attempt, and whether to attempt at all.
//! Schedules compose: `and` requires both sides to continue and waits for
//! the longer delay, `capped` bounds the pre-jitter delay, `jittered`
//! perturbs it.
//!
//! Decisions are pure in everything except jitter, which draws a fresh
//! random factor per attempt and never accumulates.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::error::ResilienceError;

/// Default jitter factor applied by [`Schedule::jittered_default`]
pub const DEFAULT_JITTER_FACTOR: f64 = 0.1;

/// Saturation bound for computed delays, so exponential growth cannot
/// overflow `Duration` arithmetic.
const MAX_DELAY_SECS: f64 = 86_400.0 * 365.0;

/// One scheduling decision: wait `delay`, then attempt again iff `proceed`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    /// Delay before the next attempt
    pub delay: Duration,
    /// Whether another attempt should run at all
    pub proceed: bool,
}

impl Decision {
    fn halt() -> Self {
        Self {
            delay: Duration::ZERO,
            proceed: false,
        }
    }
}

/// A lazy, composable scheduling policy over observed values of type `T`
pub enum Schedule<T> {
    /// Delay grows as `base * factor^attempt`; never halts on its own
    Exponential {
        /// Delay before the first re-attempt
        base: Duration,
        /// Multiplier applied per attempt
        factor: f64,
    },
    /// Delay follows `base * fib(attempt + 1)`; never halts on its own
    Fibonacci {
        /// Unit delay multiplied by the Fibonacci sequence
        base: Duration,
    },
    /// Constant delay between attempts; never halts on its own
    Spaced {
        /// Delay between attempts
        delay: Duration,
    },
    /// Continues for exactly `times` re-attempts, with zero delay
    Recurs {
        /// Number of re-attempts allowed
        times: u32,
    },
    /// Continues until the predicate accepts the observed value
    DoUntil {
        /// Halting predicate over the observed value
        pred: Arc<dyn Fn(&T) -> bool + Send + Sync>,
    },
    /// Multiplies the inner delay by `1 + r`, `r` uniform in `[-factor, factor]`
    Jittered {
        /// Schedule whose delays are perturbed
        inner: Box<Schedule<T>>,
        /// Maximum relative perturbation, in `[0, 1)`
        factor: f64,
    },
    /// Caps the inner schedule's delay (applied before any outer jitter)
    Capped {
        /// Schedule whose delays are capped
        inner: Box<Schedule<T>>,
        /// Upper bound on the delay
        max_delay: Duration,
    },
    /// Continues only while both sides continue; waits the longer delay
    Both(Box<Schedule<T>>, Box<Schedule<T>>),
}

impl<T> Schedule<T> {
    /// Exponential backoff: `base * factor^attempt`
    pub fn exponential(base: Duration, factor: f64) -> Result<Self, ResilienceError> {
        if !(factor > 0.0) {
            return Err(ResilienceError::InvalidArgument(
                "factor must be > 0".to_string(),
            ));
        }
        Ok(Self::Exponential { base, factor })
    }

    /// Fibonacci backoff: `base * fib(attempt + 1)`
    pub fn fibonacci(base: Duration) -> Self {
        Self::Fibonacci { base }
    }

    /// Constant delay between attempts
    pub fn spaced(delay: Duration) -> Self {
        Self::Spaced { delay }
    }

    /// Allow exactly `times` re-attempts
    pub fn recurs(times: u32) -> Self {
        Self::Recurs { times }
    }

    /// Continue until the predicate accepts the observed value
    pub fn do_until<F>(pred: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        Self::DoUntil {
            pred: Arc::new(pred),
        }
    }

    /// Require both schedules to continue; the delay is the longer one
    pub fn and(self, other: Schedule<T>) -> Self {
        Self::Both(Box::new(self), Box::new(other))
    }

    /// Cap this schedule's delay (pre-jitter)
    pub fn capped(self, max_delay: Duration) -> Result<Self, ResilienceError> {
        if max_delay.is_zero() {
            return Err(ResilienceError::InvalidArgument(
                "max_delay must be > 0".to_string(),
            ));
        }
        Ok(Self::Capped {
            inner: Box::new(self),
            max_delay,
        })
    }

    /// Perturb delays by a uniform factor in `[-factor, +factor]`
    pub fn jittered(self, factor: f64) -> Result<Self, ResilienceError> {
        if !(0.0..1.0).contains(&factor) {
            return Err(ResilienceError::InvalidArgument(
                "jitter factor must be in [0, 1)".to_string(),
            ));
        }
        Ok(Self::Jittered {
            inner: Box::new(self),
            factor,
        })
    }

    /// Perturb delays by the default jitter factor
    pub fn jittered_default(self) -> Self {
        Self::Jittered {
            inner: Box::new(self),
            factor: DEFAULT_JITTER_FACTOR,
        }
    }

    /// Decide what to do after observing `value` on attempt `attempt`
    /// (zero-based index of the attempt that just finished)
    pub fn decide(&self, attempt: u32, value: &T) -> Decision {
        match self {
            Schedule::Exponential { base, factor } => Decision {
                delay: scale_duration(*base, factor.powi(attempt as i32)),
                proceed: true,
            },
            Schedule::Fibonacci { base } => Decision {
                delay: scale_duration(*base, fib(attempt + 1) as f64),
                proceed: true,
            },
            Schedule::Spaced { delay } => Decision {
                delay: *delay,
                proceed: true,
            },
            Schedule::Recurs { times } => Decision {
                delay: Duration::ZERO,
                proceed: attempt < *times,
            },
            Schedule::DoUntil { pred } => {
                if pred(value) {
                    Decision::halt()
                } else {
                    Decision {
                        delay: Duration::ZERO,
                        proceed: true,
                    }
                }
            }
            Schedule::Jittered { inner, factor } => {
                let decision = inner.decide(attempt, value);
                if !decision.proceed {
                    return decision;
                }
                let perturbation = rand::thread_rng().gen_range(-*factor..=*factor);
                Decision {
                    delay: scale_duration(decision.delay, 1.0 + perturbation),
                    proceed: true,
                }
            }
            Schedule::Capped { inner, max_delay } => {
                let decision = inner.decide(attempt, value);
                Decision {
                    delay: decision.delay.min(*max_delay),
                    proceed: decision.proceed,
                }
            }
            Schedule::Both(left, right) => {
                let l = left.decide(attempt, value);
                let r = right.decide(attempt, value);
                Decision {
                    delay: l.delay.max(r.delay),
                    proceed: l.proceed && r.proceed,
                }
            }
        }
    }
}

impl<T> fmt::Debug for Schedule<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::Exponential { base, factor } => f
                .debug_struct("Exponential")
                .field("base", base)
                .field("factor", factor)
                .finish(),
            Schedule::Fibonacci { base } => {
                f.debug_struct("Fibonacci").field("base", base).finish()
            }
            Schedule::Spaced { delay } => f.debug_struct("Spaced").field("delay", delay).finish(),
            Schedule::Recurs { times } => f.debug_struct("Recurs").field("times", times).finish(),
            Schedule::DoUntil { .. } => f.debug_struct("DoUntil").finish_non_exhaustive(),
            Schedule::Jittered { inner, factor } => f
                .debug_struct("Jittered")
                .field("inner", inner)
                .field("factor", factor)
                .finish(),
            Schedule::Capped { inner, max_delay } => f
                .debug_struct("Capped")
                .field("inner", inner)
                .field("max_delay", max_delay)
                .finish(),
            Schedule::Both(left, right) => f.debug_tuple("Both").field(left).field(right).finish(),
        }
    }
}

/// Multiply a duration by a non-negative scalar, saturating at a bound
/// far beyond any plausible backoff.
fn scale_duration(duration: Duration, scalar: f64) -> Duration {
    let secs = duration.as_secs_f64() * scalar;
    if !secs.is_finite() || secs >= MAX_DELAY_SECS {
        return Duration::from_secs_f64(MAX_DELAY_SECS);
    }
    Duration::from_secs_f64(secs.max(0.0))
}

fn fib(n: u32) -> u64 {
    let (mut a, mut b) = (0u64, 1u64);
    for _ in 0..n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    a
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_growth() {
        let schedule: Schedule<()> =
            Schedule::exponential(Duration::from_millis(100), 2.0).unwrap();
        assert_eq!(
            schedule.decide(0, &()).delay,
            Duration::from_millis(100)
        );
        assert_eq!(
            schedule.decide(1, &()).delay,
            Duration::from_millis(200)
        );
        assert_eq!(
            schedule.decide(3, &()).delay,
            Duration::from_millis(800)
        );
    }

    #[test]
    fn test_exponential_rejects_bad_factor() {
        assert!(matches!(
            Schedule::<()>::exponential(Duration::from_millis(10), 0.0),
            Err(ResilienceError::InvalidArgument(_))
        ));
        assert!(matches!(
            Schedule::<()>::exponential(Duration::from_millis(10), -1.0),
            Err(ResilienceError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_fibonacci_sequence() {
        let schedule: Schedule<()> = Schedule::fibonacci(Duration::from_millis(10));
        let delays: Vec<u64> = (0..6)
            .map(|n| schedule.decide(n, &()).delay.as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![10, 10, 20, 30, 50, 80]);
    }

    #[test]
    fn test_recurs_halts_after_budget() {
        let schedule: Schedule<()> = Schedule::recurs(3);
        assert!(schedule.decide(0, &()).proceed);
        assert!(schedule.decide(2, &()).proceed);
        assert!(!schedule.decide(3, &()).proceed);
    }

    #[test]
    fn test_do_until_halts_on_match() {
        let schedule: Schedule<u32> = Schedule::do_until(|v| *v >= 10);
        assert!(schedule.decide(0, &3).proceed);
        assert!(!schedule.decide(0, &10).proceed);
    }

    #[test]
    fn test_and_requires_both_and_takes_longer_delay() {
        let schedule: Schedule<()> = Schedule::spaced(Duration::from_millis(50))
            .and(Schedule::recurs(2));

        let decision = schedule.decide(0, &());
        assert!(decision.proceed);
        assert_eq!(decision.delay, Duration::from_millis(50));

        let decision = schedule.decide(2, &());
        assert!(!decision.proceed, "recurs side must halt the composition");
    }

    #[test]
    fn test_cap_applies_before_jitter() {
        // Capped at 100ms, then jittered by up to 50%: the observed delay
        // may exceed the cap only through jitter, i.e. never beyond 150ms.
        let schedule: Schedule<()> = Schedule::exponential(Duration::from_millis(100), 10.0)
            .unwrap()
            .capped(Duration::from_millis(100))
            .unwrap()
            .jittered(0.5)
            .unwrap();

        for attempt in 0..8 {
            let delay = schedule.decide(attempt, &()).delay;
            assert!(
                delay <= Duration::from_millis(150),
                "attempt {attempt}: delay {delay:?} beyond cap plus jitter"
            );
            assert!(
                delay >= Duration::from_millis(50),
                "attempt {attempt}: delay {delay:?} below cap minus jitter"
            );
        }
    }

    #[test]
    fn test_jitter_stays_within_band() {
        let schedule: Schedule<()> = Schedule::spaced(Duration::from_millis(100))
            .jittered(0.1)
            .unwrap();
        for _ in 0..50 {
            let delay = schedule.decide(0, &()).delay;
            assert!(delay >= Duration::from_millis(90) && delay <= Duration::from_millis(110));
        }
    }

    #[test]
    fn test_jitter_rejects_out_of_range_factor() {
        assert!(Schedule::<()>::spaced(Duration::from_millis(1))
            .jittered(1.0)
            .is_err());
        assert!(Schedule::<()>::spaced(Duration::from_millis(1))
            .jittered(-0.1)
            .is_err());
    }

    #[test]
    fn test_exponential_saturates_instead_of_overflowing() {
        let schedule: Schedule<()> = Schedule::exponential(Duration::from_secs(1), 10.0).unwrap();
        let decision = schedule.decide(400, &());
        assert!(decision.proceed);
        assert_eq!(decision.delay, Duration::from_secs_f64(MAX_DELAY_SECS));
    }
}
