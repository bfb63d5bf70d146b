//! Consecutive-outcome health tracking with hysteresis.

use crate::resilience::clock::Clock;
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};

/// Result of one real outbound call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

/// Point-in-time copy of the monitor state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthState {
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub degraded: bool,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
}

impl HealthState {
    fn healthy() -> Self {
        Self {
            consecutive_failures: 0,
            consecutive_successes: 0,
            degraded: false,
            last_success_at: None,
            last_failure_at: None,
        }
    }
}

/// Flips into degraded mode after `failure_threshold` consecutive failures and back
/// out after `success_threshold` consecutive successes.
#[derive(Debug)]
pub struct HealthMonitor {
    state: Mutex<HealthState>,
    failure_threshold: u32,
    success_threshold: u32,
    clock: Arc<dyn Clock>,
}

impl HealthMonitor {
    pub fn new(failure_threshold: u32, success_threshold: u32, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(HealthState::healthy()),
            failure_threshold: failure_threshold.max(1),
            success_threshold: success_threshold.max(1),
            clock,
        }
    }

    /// Fold one outcome into the counters. Returns true when this call changed the
    /// degraded flag.
    pub fn record(&self, outcome: Outcome) -> bool {
        let now = self.clock.wall();
        let mut s = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match outcome {
            Outcome::Success => {
                s.consecutive_successes = s.consecutive_successes.saturating_add(1);
                s.consecutive_failures = 0;
                s.last_success_at = Some(now);
                if s.degraded && s.consecutive_successes >= self.success_threshold {
                    s.degraded = false;
                    info!(
                        "Gateway recovered after {} consecutive successes",
                        s.consecutive_successes
                    );
                    return true;
                }
            }
            Outcome::Failure => {
                s.consecutive_failures = s.consecutive_failures.saturating_add(1);
                s.consecutive_successes = 0;
                s.last_failure_at = Some(now);
                if !s.degraded && s.consecutive_failures >= self.failure_threshold {
                    s.degraded = true;
                    warn!(
                        "Gateway degraded after {} consecutive failures",
                        s.consecutive_failures
                    );
                    return true;
                }
            }
        }
        false
    }

    pub fn is_degraded(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .degraded
    }

    pub fn snapshot(&self) -> HealthState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Back to the initial healthy state, timestamps included.
    pub fn reset(&self) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = HealthState::healthy();
    }
}
