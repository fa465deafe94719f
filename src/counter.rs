use crate::error::CoreError;
use crate::storage::{Counter, StorageBackend};
use std::sync::Arc;
use tracing::{debug, warn};

/// Generic atomic counters keyed by `(namespace, scope, key)`.
///
/// Every increment is a single atomic upsert on the backend, so concurrent
/// callers never lose updates. No bounds are enforced here; quota and rate
/// checks live in [`crate::restrictions`].
///
/// A failed increment is never retried: after a timeout the effect is unknown
/// and a retry could double-count. `StorageUnavailable` propagates to the
/// caller as is.
#[derive(Clone)]
pub struct CounterStore {
    storage: Arc<dyn StorageBackend>,
}

impl CounterStore {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    pub fn increment(
        &self,
        namespace: &str,
        scope: &str,
        key: &str,
        delta: i64,
    ) -> Result<i64, CoreError> {
        validate_counter_key(namespace, scope, key)?;
        match self.storage.increment_counter(namespace, scope, key, delta) {
            Ok(counter) => {
                debug!(namespace, scope, key, delta, value = counter.value, "counter incremented");
                Ok(counter.value)
            }
            Err(err) => {
                warn!(namespace, scope, key, delta, error = %err, "counter increment failed");
                Err(err)
            }
        }
    }

    /// Current value, `0` when the counter was never written.
    pub fn get(&self, namespace: &str, scope: &str, key: &str) -> Result<i64, CoreError> {
        Ok(self
            .storage
            .read_counter(namespace, scope, key)?
            .map(|c| c.value)
            .unwrap_or(0))
    }

    pub fn read(&self, namespace: &str, scope: &str, key: &str) -> Result<Option<Counter>, CoreError> {
        self.storage.read_counter(namespace, scope, key)
    }
}

fn validate_counter_key(namespace: &str, scope: &str, key: &str) -> Result<(), CoreError> {
    if namespace.is_empty() || scope.is_empty() || key.is_empty() {
        return Err(CoreError::Validation(
            "counter namespace, scope and key must be non-empty".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[test]
    fn missing_counter_reads_as_zero() {
        let counters = CounterStore::new(Arc::new(MemoryStorage::new()));
        assert_eq!(counters.get("usage", "t1", "task").expect("get"), 0);
        assert!(counters.read("usage", "t1", "task").expect("read").is_none());
    }

    #[test]
    fn empty_key_parts_are_rejected() {
        let counters = CounterStore::new(Arc::new(MemoryStorage::new()));
        assert!(counters.increment("", "t1", "task", 1).is_err());
        assert!(counters.increment("usage", "t1", "", 1).is_err());
    }

    #[test]
    fn decrements_are_allowed() {
        let counters = CounterStore::new(Arc::new(MemoryStorage::new()));
        counters.increment("usage", "t1", "storage", 10).expect("inc");
        assert_eq!(counters.increment("usage", "t1", "storage", -4).expect("dec"), 6);
    }
}
