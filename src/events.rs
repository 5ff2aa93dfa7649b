//! Listener registration and event fan-out
//!
//! Each primitive owns a [`Listeners`] set for its event type. Emission
//! happens strictly outside the primitive's critical section: the caller
//! finishes its state transaction, releases the lock, and only then calls
//! [`Listeners::emit`]. Emission takes a snapshot of the registration
//! list, so listeners added or removed concurrently neither block nor
//! corrupt an in-flight dispatch.
//!
//! A listener that panics is isolated: the panic is caught, logged at
//! `warn`, and the remaining listeners still run. Listeners must not call
//! back into the same primitive synchronously; doing so from another task
//! is fine.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Opaque handle identifying a registered listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Callback<Ev> = Arc<dyn Fn(&Ev) + Send + Sync>;

/// Ordered set of listeners for one event type
pub struct Listeners<Ev> {
    entries: RwLock<Vec<(ListenerId, Callback<Ev>)>>,
    next_id: AtomicU64,
}

impl<Ev> Listeners<Ev> {
    /// Create an empty listener set
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a listener, returning the handle used to remove it
    pub fn add<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Ev) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut entries = self.entries.write().expect("listener list poisoned");
        entries.push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener by handle; removing twice is a no-op
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.write().expect("listener list poisoned");
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    /// Number of registered listeners
    pub fn len(&self) -> usize {
        self.entries.read().expect("listener list poisoned").len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dispatch an event to a snapshot of the current listeners
    ///
    /// Must be called outside the owning primitive's critical section.
    /// Listeners run in registration order; a panicking listener is
    /// logged and skipped without affecting the rest.
    pub fn emit(&self, event: &Ev) {
        let snapshot: Vec<Callback<Ev>> = {
            let entries = self.entries.read().expect("listener list poisoned");
            entries.iter().map(|(_, cb)| Arc::clone(cb)).collect()
        };

        for callback in snapshot {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                tracing::warn!("event listener panicked; continuing with remaining listeners");
            }
        }
    }
}

impl<Ev> Default for Listeners<Ev> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Ev> fmt::Debug for Listeners<Ev> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners")
            .field("len", &self.len())
            .finish()
    }
}
