//! Clock abstraction for time-dependent primitives
//!
//! Every primitive that measures or waits on time takes its clock through
//! this trait so tests can drive a virtual clock. The default
//! [`TokioClock`] delegates to `tokio::time`, which means tests running
//! under `#[tokio::test(start_paused = true)]` get deterministic virtual
//! time for free: `now()` and `sleep()` both follow the paused clock.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

/// Monotonic time source plus a cancellable sleep
///
/// `sleep` suspends cooperatively; dropping the returned future (for
/// example when a surrounding `select!` picks another branch, or the
/// caller's task is cancelled) aborts the wait immediately.
#[async_trait]
pub trait Clock: Send + Sync + Debug {
    /// Current monotonic instant
    fn now(&self) -> Instant;

    /// Suspend for the given duration
    async fn sleep(&self, duration: Duration);
}

/// Clock backed by the tokio runtime
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Shared handle to the default runtime clock
pub fn default_clock() -> Arc<dyn Clock> {
    Arc::new(TokioClock)
}
