//! Named-instance registries
//!
//! A registry maps a string name to one shared instance of a primitive,
//! so call sites across a process can address "the checkout breaker" by
//! name instead of plumbing handles around. `get_or_create` is idempotent
//! on the name: the builder runs only for the first caller, and a later
//! `get` returns the identical instance.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::bulkhead::Bulkhead;
use crate::circuit_breaker::CircuitBreaker;
use crate::error::ResilienceError;
use crate::rate_limiter::RateLimiter;
use crate::sliding_window::SlidingWindowLimiter;
use crate::time_limiter::TimeLimiter;

/// Named collection owning instances of one primitive type
///
/// # Example
/// ```
/// use parapet::registry::CircuitBreakerRegistry;
/// use parapet::circuit_breaker::CircuitBreaker;
///
/// let registry = CircuitBreakerRegistry::new();
/// let breaker = registry.get_or_create("payments", CircuitBreaker::new_default);
/// let same = registry.get("payments").unwrap();
/// assert!(std::sync::Arc::ptr_eq(&breaker, &same));
/// ```
pub struct Registry<T> {
    entries: RwLock<HashMap<String, Arc<T>>>,
}

impl<T> Registry<T> {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Fetch the named instance, building it if absent
    ///
    /// The builder runs only when the name is new; concurrent callers for
    /// the same name receive the same instance.
    pub fn get_or_create<F>(&self, name: &str, builder: F) -> Arc<T>
    where
        F: FnOnce() -> T,
    {
        let mut entries = self.entries.write().expect("registry poisoned");
        Arc::clone(
            entries
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(builder())),
        )
    }

    /// Fetch the named instance, building it fallibly if absent
    ///
    /// A builder error leaves the registry unchanged.
    pub fn try_get_or_create<F>(&self, name: &str, builder: F) -> Result<Arc<T>, ResilienceError>
    where
        F: FnOnce() -> Result<T, ResilienceError>,
    {
        let mut entries = self.entries.write().expect("registry poisoned");
        if let Some(existing) = entries.get(name) {
            return Ok(Arc::clone(existing));
        }
        let built = Arc::new(builder()?);
        entries.insert(name.to_string(), Arc::clone(&built));
        Ok(built)
    }

    /// Fetch the named instance, if registered
    pub fn get(&self, name: &str) -> Option<Arc<T>> {
        let entries = self.entries.read().expect("registry poisoned");
        entries.get(name).cloned()
    }

    /// Remove and return the named instance
    pub fn remove(&self, name: &str) -> Option<Arc<T>> {
        let mut entries = self.entries.write().expect("registry poisoned");
        entries.remove(name)
    }

    /// Names currently registered
    pub fn names(&self) -> Vec<String> {
        let entries = self.entries.read().expect("registry poisoned");
        entries.keys().cloned().collect()
    }

    /// Number of registered instances
    pub fn len(&self) -> usize {
        self.entries.read().expect("registry poisoned").len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every registered instance
    pub fn clear(&self) {
        self.entries.write().expect("registry poisoned").clear();
    }
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Registry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").field("len", &self.len()).finish()
    }
}

/// Registry of named circuit breakers
pub type CircuitBreakerRegistry = Registry<CircuitBreaker>;
/// Registry of named bulkheads
pub type BulkheadRegistry = Registry<Bulkhead>;
/// Registry of named token-bucket rate limiters
pub type RateLimiterRegistry = Registry<RateLimiter>;
/// Registry of named sliding-window limiters
pub type SlidingWindowRegistry = Registry<SlidingWindowLimiter>;
/// Registry of named time limiters
pub type TimeLimiterRegistry = Registry<TimeLimiter>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_get_or_create_is_idempotent_on_name() {
        let registry: Registry<u32> = Registry::new();
        let built = AtomicUsize::new(0);

        let first = registry.get_or_create("answer", || {
            built.fetch_add(1, Ordering::SeqCst);
            42
        });
        let second = registry.get_or_create("answer", || {
            built.fetch_add(1, Ordering::SeqCst);
            99
        });

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(*second, 42);
        assert_eq!(built.load(Ordering::SeqCst), 1, "builder runs once per name");
    }

    #[test]
    fn test_get_returns_the_created_instance() {
        let registry: Registry<String> = Registry::new();
        let created = registry.get_or_create("greeting", || "hello".to_string());
        let fetched = registry.get("greeting").unwrap();
        assert!(Arc::ptr_eq(&created, &fetched));
        assert!(registry.get("absent").is_none());
    }

    #[test]
    fn test_remove_returns_instance_and_forgets_name() {
        let registry: Registry<u32> = Registry::new();
        registry.get_or_create("gone", || 7);

        let removed = registry.remove("gone").unwrap();
        assert_eq!(*removed, 7);
        assert!(registry.get("gone").is_none());
        assert!(registry.remove("gone").is_none());
    }

    #[test]
    fn test_try_get_or_create_error_leaves_registry_unchanged() {
        let registry: Registry<u32> = Registry::new();

        let result = registry.try_get_or_create("bad", || {
            Err(ResilienceError::InvalidArgument("nope".to_string()))
        });
        assert!(result.is_err());
        assert!(registry.is_empty());

        let ok = registry.try_get_or_create("bad", || Ok(5)).unwrap();
        assert_eq!(*ok, 5);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_names_and_clear() {
        let registry: Registry<u32> = Registry::new();
        registry.get_or_create("a", || 1);
        registry.get_or_create("b", || 2);

        let mut names = registry.names();
        names.sort();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);

        registry.clear();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_primitive_registries() {
        use crate::circuit_breaker::CircuitBreaker;

        let breakers = CircuitBreakerRegistry::new();
        let breaker = breakers.get_or_create("payments", CircuitBreaker::new_default);
        breaker
            .execute(|| async { Ok::<_, String>(()) })
            .await
            .unwrap();

        let same = breakers.get("payments").unwrap();
        assert_eq!(same.statistics().successful_calls, 1);
    }
}
