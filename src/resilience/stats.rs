//! Per-endpoint call counters.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

/// Counters for one logical resource key. Only real outbound calls feed
/// `total_calls`, `successes` and `failures`; the remaining counters record how
/// calls were answered without one.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointStats {
    pub total_calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub cache_hits: u64,
    pub shared_waits: u64,
    pub lock_timeouts: u64,
    pub fallbacks_served: u64,
    pub quarantine_skips: u64,
}

/// How a single poll or command was served, as far as the counters care.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Success(DateTime<Utc>),
    Failure(DateTime<Utc>),
    CacheHit,
    SharedWait,
    LockTimeout,
    Fallback,
    QuarantineSkip,
}

#[derive(Debug, Default)]
pub struct StatsRegistry {
    endpoints: Mutex<BTreeMap<String, EndpointStats>>,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, key: &str, event: Event) -> EndpointStats {
        let mut guard = self
            .endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let s = guard.entry(key.to_string()).or_default();
        match event {
            Event::Success(at) => {
                s.total_calls = s.total_calls.saturating_add(1);
                s.successes = s.successes.saturating_add(1);
                s.last_success_at = Some(at);
            }
            Event::Failure(at) => {
                s.total_calls = s.total_calls.saturating_add(1);
                s.failures = s.failures.saturating_add(1);
                s.last_failure_at = Some(at);
            }
            Event::CacheHit => s.cache_hits = s.cache_hits.saturating_add(1),
            Event::SharedWait => s.shared_waits = s.shared_waits.saturating_add(1),
            Event::LockTimeout => s.lock_timeouts = s.lock_timeouts.saturating_add(1),
            Event::Fallback => s.fallbacks_served = s.fallbacks_served.saturating_add(1),
            Event::QuarantineSkip => {
                s.quarantine_skips = s.quarantine_skips.saturating_add(1)
            }
        }
        s.clone()
    }

    pub fn snapshot(&self) -> BTreeMap<String, EndpointStats> {
        self.endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn reset(&self) {
        self.endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
