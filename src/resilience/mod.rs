//! Resilience core: the single object every poll and command goes through.
//!
//! ```text
//! poll(key) ──► live cache hit? ──yes──► Cached
//!                 │ no
//!                 ▼
//!         degraded + fail_fast? ──yes──► fallback / Absent
//!                 │ no
//!                 ▼
//!          key quarantined? ──yes──► fallback / Absent (or Overload)
//!                 │ no
//!                 ▼
//!      coalesced fetch (call timeout) ──ok──► Live (health, stats, fallback store)
//!                 │ err
//!                 ▼
//!      degraded + graceful? ──yes──► fallback / Absent
//!                 │ no
//!                 ▼
//!            error propagates
//! ```
//!
//! Health and per-endpoint call counters only ever see outcomes of outbound calls
//! made by the caller itself. Cache hits, coalesced waits and lock timeouts are
//! counted separately and never move the degraded flag. The same holds for a
//! backend that keeps its own cache: an answer it served without going to the
//! gateway comes back as `Cached`.

pub mod clock;
pub mod coalescer;
pub mod degradation;
pub mod health;
pub mod quarantine;
pub mod stats;

use crate::error::{GatewayError, Result};
use chrono::{DateTime, Utc};
use clock::{Clock, SystemClock};
use coalescer::{Fetched, RequestCoalescer, Source};
use degradation::DegradationCache;
use health::{HealthMonitor, Outcome};
use log::{debug, info, warn};
use quarantine::Quarantine;
use serde::Serialize;
use stats::{EndpointStats, Event, StatsRegistry};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Tunables of the core. Built from the `[cache]` and `[health]` config sections.
#[derive(Debug, Clone, PartialEq)]
pub struct ResiliencePolicy {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub degradation_ttl: Duration,
    /// While degraded, answer from the fallback without fetching. Recovery needs
    /// real successes, so with this set the core stays degraded until
    /// [`ResilienceCore::reset_health`].
    pub fail_fast: bool,
    pub graceful_degradation: bool,
    pub overload_cooldown: Duration,
    /// Bounded wait for another caller's in-flight fetch.
    pub lock_timeout: Duration,
    /// Upper bound on a single outbound call.
    pub call_timeout: Duration,
}

impl Default for ResiliencePolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            degradation_ttl: Duration::from_secs(25),
            fail_fast: false,
            graceful_degradation: true,
            overload_cooldown: Duration::from_secs(300),
            lock_timeout: Duration::from_millis(5000),
            call_timeout: Duration::from_secs(5),
        }
    }
}

/// What `poll` hands back. A value is never invented: when nothing trustworthy is
/// available the answer is `Absent`.
#[derive(Debug, Clone, PartialEq)]
pub enum Reading<V> {
    /// Fetched just now, by this caller or one it coalesced with.
    Live(V),
    /// Served from the short-lived cache.
    Cached { value: V, age: Duration },
    /// Stale last-known-good value served while the gateway is unreachable.
    Degraded { value: V, age: Duration },
    /// No fresh data and no usable fallback.
    Absent,
}

impl<V> Reading<V> {
    pub fn value(&self) -> Option<&V> {
        match self {
            Reading::Live(v) => Some(v),
            Reading::Cached { value, .. } | Reading::Degraded { value, .. } => Some(value),
            Reading::Absent => None,
        }
    }

    pub fn into_value(self) -> Option<V> {
        match self {
            Reading::Live(v) => Some(v),
            Reading::Cached { value, .. } | Reading::Degraded { value, .. } => Some(value),
            Reading::Absent => None,
        }
    }

    pub fn age(&self) -> Option<Duration> {
        match self {
            Reading::Live(_) => Some(Duration::ZERO),
            Reading::Cached { age, .. } | Reading::Degraded { age, .. } => Some(*age),
            Reading::Absent => None,
        }
    }

    pub fn freshness(&self) -> &'static str {
        match self {
            Reading::Live(_) => "live",
            Reading::Cached { .. } => "cached",
            Reading::Degraded { .. } => "degraded",
            Reading::Absent => "absent",
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Reading::Absent)
    }
}

/// Observability snapshot returned by `health()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub degraded: bool,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub endpoints: BTreeMap<String, EndpointStats>,
}

/// Coalescer, health monitor, fallback cache, quarantine and stats wired together.
#[derive(Debug)]
pub struct ResilienceCore<V> {
    policy: ResiliencePolicy,
    clock: Arc<dyn Clock>,
    coalescer: RequestCoalescer<Fetched<V>>,
    health: HealthMonitor,
    degradation: DegradationCache<V>,
    quarantine: Quarantine,
    stats: StatsRegistry,
}

impl<V: Clone> ResilienceCore<V> {
    pub fn new(policy: ResiliencePolicy) -> Self {
        Self::with_clock(policy, Arc::new(SystemClock))
    }

    pub fn with_clock(policy: ResiliencePolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            coalescer: RequestCoalescer::new(policy.lock_timeout, clock.clone()),
            health: HealthMonitor::new(
                policy.failure_threshold,
                policy.success_threshold,
                clock.clone(),
            ),
            degradation: DegradationCache::new(policy.degradation_ttl, clock.clone()),
            quarantine: Quarantine::new(policy.overload_cooldown, clock.clone()),
            stats: StatsRegistry::new(),
            policy,
            clock,
        }
    }

    pub fn policy(&self) -> &ResiliencePolicy {
        &self.policy
    }

    /// Read `key` through the cache, falling back per the degradation policy.
    pub async fn poll<F, Fut>(&self, key: &str, ttl: Duration, fetch: F) -> Result<Reading<V>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        self.poll_fetched(key, ttl, move || async move { fetch().await.map(Fetched::live) })
            .await
    }

    /// Like [`poll`](Self::poll), for a fetch that reports where its value came
    /// from. A value the layer below served from its own cache is passed through
    /// as `Cached` and never counts as a real success.
    pub async fn poll_fetched<F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        fetch: F,
    ) -> Result<Reading<V>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Fetched<V>>>,
    {
        if let Some(hit) = self.coalescer.lookup(key) {
            self.stats.record(key, Event::CacheHit);
            return Ok(Reading::Cached {
                age: hit.age + hit.value.age,
                value: hit.value.value,
            });
        }

        if self.policy.fail_fast && self.health.is_degraded() {
            debug!("Fail-fast: skipping fetch of {} while degraded", key);
            return Ok(self.degraded_reading(key));
        }

        if let Some(left) = self.quarantine.remaining(key) {
            self.stats.record(key, Event::QuarantineSkip);
            debug!("{} quarantined for another {}s", key, left.as_secs());
            if self.policy.graceful_degradation {
                return Ok(self.degraded_reading(key));
            }
            return Err(GatewayError::Overload {
                message: format!("'{key}' is cooling down after an overload signal"),
                retry_after: Some(left),
            });
        }

        let call_timeout = self.policy.call_timeout;
        let fetched = self
            .coalescer
            .get(key, ttl, move || async move {
                match tokio::time::timeout(call_timeout, fetch()).await {
                    Ok(result) => result,
                    Err(_) => Err(GatewayError::Transport(format!(
                        "call timed out after {}ms",
                        call_timeout.as_millis()
                    ))),
                }
            })
            .await;

        match fetched {
            Ok(f) => {
                let inner = f.value;
                let age = f.age + inner.age;
                Ok(match (f.source, inner.source) {
                    (Source::Live, below) if below.is_outbound() => {
                        self.record_success(key);
                        self.degradation.remember(key, inner.value.clone());
                        Reading::Live(inner.value)
                    }
                    (Source::Shared, below) if below.is_outbound() => {
                        self.stats.record(key, Event::SharedWait);
                        Reading::Live(inner.value)
                    }
                    (Source::Stale, _) | (_, Source::Stale) => {
                        self.stats.record(key, Event::LockTimeout);
                        Reading::Degraded {
                            value: inner.value,
                            age,
                        }
                    }
                    _ => {
                        self.stats.record(key, Event::CacheHit);
                        Reading::Cached {
                            value: inner.value,
                            age,
                        }
                    }
                })
            }
            Err(rejected) => {
                if rejected.is_real() {
                    self.record_failure(key, &rejected.error);
                } else if matches!(rejected.error, GatewayError::LockTimeout { .. }) {
                    self.stats.record(key, Event::LockTimeout);
                } else {
                    self.stats.record(key, Event::SharedWait);
                }

                if self.policy.graceful_degradation && self.health.is_degraded() {
                    return Ok(self.degraded_reading(key));
                }
                Err(rejected.error)
            }
        }
    }

    /// Run a write against the backend. Writes are never cached or coalesced; on
    /// success the listed read keys are invalidated so the next poll sees the change.
    pub async fn command<T, Fut>(&self, key: &str, invalidates: &[&str], call: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        if let Some(left) = self.quarantine.remaining(key) {
            self.stats.record(key, Event::QuarantineSkip);
            return Err(GatewayError::Overload {
                message: format!("'{key}' is cooling down after an overload signal"),
                retry_after: Some(left),
            });
        }

        let outcome = match tokio::time::timeout(self.policy.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Transport(format!(
                "call timed out after {}ms",
                self.policy.call_timeout.as_millis()
            ))),
        };

        match outcome {
            Ok(value) => {
                self.record_success(key);
                for k in invalidates {
                    self.coalescer.invalidate(k);
                }
                Ok(value)
            }
            Err(err) => {
                self.record_failure(key, &err);
                Err(err)
            }
        }
    }

    pub fn health(&self) -> HealthReport {
        let state = self.health.snapshot();
        HealthReport {
            degraded: state.degraded,
            consecutive_failures: state.consecutive_failures,
            consecutive_successes: state.consecutive_successes,
            last_success_at: state.last_success_at,
            last_failure_at: state.last_failure_at,
            endpoints: self.stats.snapshot(),
        }
    }

    /// Administrative reset: health counters, fallback values, quarantines and
    /// stats. The short-lived coalescer cache is left alone.
    pub fn reset_health(&self) {
        self.health.reset();
        self.degradation.clear();
        self.quarantine.clear();
        self.stats.reset();
        info!("Health state reset");
    }

    /// Number of keys with an outbound fetch currently running.
    pub fn in_flight(&self) -> usize {
        self.coalescer.in_flight()
    }

    fn degraded_reading(&self, key: &str) -> Reading<V> {
        if !self.policy.graceful_degradation {
            return Reading::Absent;
        }
        match self.degradation.fallback(key) {
            Some(stale) => {
                self.stats.record(key, Event::Fallback);
                Reading::Degraded {
                    value: stale.value,
                    age: stale.age,
                }
            }
            None => Reading::Absent,
        }
    }

    fn record_success(&self, key: &str) {
        self.health.record(Outcome::Success);
        self.stats.record(key, Event::Success(self.clock.wall()));
    }

    fn record_failure(&self, key: &str, err: &GatewayError) {
        if !err.counts_as_failure() {
            debug!("{} failed without reaching the gateway: {}", key, err);
            return;
        }
        warn!("{} failed ({}): {}", key, err.kind(), err);
        self.health.record(Outcome::Failure);
        self.stats.record(key, Event::Failure(self.clock.wall()));
        if let GatewayError::Overload { retry_after, .. } = err {
            self.quarantine.impose(key, *retry_after);
        }
    }
}
