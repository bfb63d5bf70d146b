//! Per-key cooldown after the remote side signals overload.

use crate::resilience::clock::Clock;
use log::warn;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Longest a key is ever kept away, whatever the remote asked for.
pub const MAX_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug)]
pub struct Quarantine {
    until: Mutex<HashMap<String, Instant>>,
    cooldown: Duration,
    clock: Arc<dyn Clock>,
}

impl Quarantine {
    pub fn new(cooldown: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            until: Mutex::new(HashMap::new()),
            cooldown,
            clock,
        }
    }

    /// Keep `key` away from the backend for `retry_after`, or the configured
    /// cooldown when the remote gave no hint, capped at [`MAX_WINDOW`]. An existing
    /// longer quarantine wins.
    pub fn impose(&self, key: &str, retry_after: Option<Duration>) {
        let window = retry_after.unwrap_or(self.cooldown).min(MAX_WINDOW);
        let now = self.clock.now();
        let until = now.checked_add(window).unwrap_or(now);
        let mut map = self.until.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = map.entry(key.to_string()).or_insert(until);
        if *slot < until {
            *slot = until;
        }
        warn!(
            "Backend overloaded, '{}' quarantined for {}s",
            key,
            window.as_secs()
        );
    }

    /// Time left on the quarantine for `key`, if any.
    pub fn remaining(&self, key: &str) -> Option<Duration> {
        let now = self.clock.now();
        let mut map = self.until.lock().unwrap_or_else(PoisonError::into_inner);
        match map.get(key) {
            Some(until) if *until > now => Some(*until - now),
            Some(_) => {
                map.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn clear(&self) {
        self.until
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::clock::ManualClock;

    #[test]
    fn retry_after_overrides_cooldown() {
        let clock = ManualClock::new();
        let q = Quarantine::new(Duration::from_secs(300), Arc::new(clock.clone()));
        q.impose("status", Some(Duration::from_secs(10)));
        assert_eq!(q.remaining("status"), Some(Duration::from_secs(10)));
        clock.advance(Duration::from_secs(10));
        assert_eq!(q.remaining("status"), None);
    }

    #[test]
    fn huge_retry_after_is_capped() {
        let clock = ManualClock::new();
        let q = Quarantine::new(Duration::from_secs(300), Arc::new(clock.clone()));
        q.impose("status", Some(Duration::from_secs(u64::MAX)));
        assert_eq!(q.remaining("status"), Some(MAX_WINDOW));
        clock.advance(MAX_WINDOW);
        assert_eq!(q.remaining("status"), None);
    }

    #[test]
    fn default_cooldown_and_isolation() {
        let clock = ManualClock::new();
        let q = Quarantine::new(Duration::from_secs(300), Arc::new(clock.clone()));
        q.impose("config", None);
        assert!(q.remaining("status").is_none());
        clock.advance(Duration::from_secs(299));
        assert_eq!(q.remaining("config"), Some(Duration::from_secs(1)));
        q.clear();
        assert!(q.remaining("config").is_none());
    }
}
