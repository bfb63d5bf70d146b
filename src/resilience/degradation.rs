//! Last-known-good values kept around to bridge outages.

use crate::resilience::clock::Clock;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// A fallback value and how old it is.
#[derive(Debug, Clone, PartialEq)]
pub struct StaleValue<V> {
    pub value: V,
    pub age: Duration,
}

#[derive(Debug)]
struct DegradationEntry<V> {
    value: V,
    stored_at: Instant,
}

/// Boundary-level store refreshed on every real success and read only while
/// degraded. It never triggers a fetch of its own.
#[derive(Debug)]
pub struct DegradationCache<V> {
    entries: Mutex<HashMap<String, DegradationEntry<V>>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl<V: Clone> DegradationCache<V> {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            clock,
        }
    }

    pub fn remember(&self, key: &str, value: V) {
        let stored_at = self.clock.now();
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), DegradationEntry { value, stored_at });
    }

    /// The last-known-good value for `key`, unless it is older than the TTL.
    pub fn fallback(&self, key: &str) -> Option<StaleValue<V>> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let age = now.saturating_duration_since(entries.get(key)?.stored_at);
        if age >= self.ttl {
            entries.remove(key);
            return None;
        }
        entries.get(key).map(|e| StaleValue {
            value: e.value.clone(),
            age,
        })
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Stored entries, including expired ones not yet pruned.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
