//! Controller expectations: memory of issued-but-unseen intents
//!
//! The informer cache is eventually consistent. After the controller
//! issues a create or delete it must not re-run its scaling decision
//! until the cache has reflected the operation, or it would issue the
//! same operation twice. Expectations are the controller's own record
//! of in-flight operations: set before the API call, cancelled by the
//! matching informer event. A TTL keeps a parent from wedging forever
//! when a cache event is dropped.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

/// How long an unfulfilled expectation record is trusted before the
/// parent is synced anyway.
pub const EXPECTATION_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug)]
struct Expectation {
    adds: i64,
    deletions: HashSet<String>,
    timestamp: Instant,
}

impl Expectation {
    fn fulfilled(&self) -> bool {
        self.adds <= 0 && self.deletions.is_empty()
    }

    fn expired(&self, ttl: Duration) -> bool {
        self.timestamp.elapsed() >= ttl
    }
}

/// Per-parent counters of in-flight create/delete operations.
///
/// Shared across workers; lookup and update form one critical section
/// behind a single guard.
pub struct ExpectationsStore {
    entries: Mutex<HashMap<String, Expectation>>,
    ttl: Duration,
}

impl Default for ExpectationsStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ExpectationsStore {
    /// Create a store with the default expectation TTL.
    pub fn new() -> Self {
        Self::with_ttl(EXPECTATION_TIMEOUT)
    }

    /// Create a store with a custom TTL (shortened in tests).
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Record that `count` creations for this parent are about to be
    /// issued. Replaces any previous record for the parent.
    pub fn expect_creations(&self, parent_key: &str, count: i64) {
        let mut entries = self.entries.lock().expect("expectations lock poisoned");
        entries.insert(
            parent_key.to_string(),
            Expectation {
                adds: count,
                deletions: HashSet::new(),
                timestamp: Instant::now(),
            },
        );
    }

    /// Record that the given children are about to be deleted. Replaces
    /// any previous record for the parent.
    pub fn expect_deletions(&self, parent_key: &str, child_keys: Vec<String>) {
        let mut entries = self.entries.lock().expect("expectations lock poisoned");
        entries.insert(
            parent_key.to_string(),
            Expectation {
                adds: 0,
                deletions: child_keys.into_iter().collect(),
                timestamp: Instant::now(),
            },
        );
    }

    /// Note that one expected creation has been observed in the cache.
    ///
    /// Also used to roll the expectation back when the create call
    /// itself fails: a rejected create will never be observed.
    pub fn creation_observed(&self, parent_key: &str) {
        let mut entries = self.entries.lock().expect("expectations lock poisoned");
        if let Some(expectation) = entries.get_mut(parent_key) {
            if expectation.adds > 0 {
                expectation.adds -= 1;
            }
        }
    }

    /// Note that the deletion of a specific child has been observed.
    pub fn deletion_observed(&self, parent_key: &str, child_key: &str) {
        let mut entries = self.entries.lock().expect("expectations lock poisoned");
        if let Some(expectation) = entries.get_mut(parent_key) {
            expectation.deletions.remove(child_key);
        }
    }

    /// Whether all previously recorded intents for this parent have been
    /// observed.
    ///
    /// A parent with no record is satisfied. An expired record counts as
    /// satisfied so a dropped cache event cannot wedge the parent; the
    /// next sync re-establishes ground truth.
    pub fn satisfied(&self, parent_key: &str) -> bool {
        let entries = self.entries.lock().expect("expectations lock poisoned");
        match entries.get(parent_key) {
            None => true,
            Some(expectation) if expectation.fulfilled() => true,
            Some(expectation) if expectation.expired(self.ttl) => {
                warn!(
                    parent = parent_key,
                    ?expectation,
                    "expectations expired, forcing sync"
                );
                true
            }
            Some(expectation) => {
                debug!(parent = parent_key, ?expectation, "expectations unsatisfied");
                false
            }
        }
    }

    /// Drop the record for a parent (the parent was deleted).
    pub fn delete(&self, parent_key: &str) {
        let mut entries = self.entries.lock().expect("expectations lock poisoned");
        entries.remove(parent_key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "default/vm-a";

    #[test]
    fn test_absent_record_is_satisfied() {
        let store = ExpectationsStore::new();
        assert!(store.satisfied(KEY));
    }

    #[test]
    fn test_creation_expectation_lifecycle() {
        let store = ExpectationsStore::new();
        store.expect_creations(KEY, 1);
        assert!(!store.satisfied(KEY));

        store.creation_observed(KEY);
        assert!(store.satisfied(KEY));
    }

    #[test]
    fn test_creation_observed_floors_at_zero() {
        let store = ExpectationsStore::new();
        store.expect_creations(KEY, 1);
        store.creation_observed(KEY);
        store.creation_observed(KEY);
        assert!(store.satisfied(KEY));
    }

    #[test]
    fn test_deletion_expectation_lifecycle() {
        let store = ExpectationsStore::new();
        store.expect_deletions(
            KEY,
            vec!["default/vmi-1".to_string(), "default/vmi-2".to_string()],
        );
        assert!(!store.satisfied(KEY));

        store.deletion_observed(KEY, "default/vmi-1");
        assert!(!store.satisfied(KEY));

        store.deletion_observed(KEY, "default/vmi-2");
        assert!(store.satisfied(KEY));
    }

    #[test]
    fn test_unrelated_deletion_is_ignored() {
        let store = ExpectationsStore::new();
        store.expect_deletions(KEY, vec!["default/vmi-1".to_string()]);
        store.deletion_observed(KEY, "default/vmi-other");
        assert!(!store.satisfied(KEY));
    }

    #[test]
    fn test_new_expectation_replaces_previous_record() {
        let store = ExpectationsStore::new();
        store.expect_deletions(KEY, vec!["default/vmi-1".to_string()]);
        store.expect_creations(KEY, 1);
        // the pending deletion was superseded
        store.creation_observed(KEY);
        assert!(store.satisfied(KEY));
    }

    #[test]
    fn test_expired_record_is_satisfied() {
        let store = ExpectationsStore::with_ttl(Duration::from_millis(1));
        store.expect_creations(KEY, 1);
        std::thread::sleep(Duration::from_millis(5));
        assert!(store.satisfied(KEY));
    }

    #[test]
    fn test_delete_drops_record() {
        let store = ExpectationsStore::new();
        store.expect_creations(KEY, 3);
        store.delete(KEY);
        assert!(store.satisfied(KEY));
    }

    #[test]
    fn test_keys_are_independent() {
        let store = ExpectationsStore::new();
        store.expect_creations("default/vm-a", 1);
        assert!(store.satisfied("default/vm-b"));
        assert!(!store.satisfied("default/vm-a"));
    }
}
