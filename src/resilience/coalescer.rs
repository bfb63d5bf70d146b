//! Single-flight TTL cache.
//!
//! `get` returns a live cached value without touching the in-flight registry. On a
//! miss the first caller for a key becomes its fetcher; everyone else arriving while
//! that fetch runs waits (bounded by `lock_timeout`) and receives the very same
//! result or error. Only the fetcher's outcome is a *real* outcome, which is what
//! [`Source`] tells the caller.
//!
//! Successful results are stored with their TTL. A failed fetch never replaces a
//! previous entry, so an expired value is still around to be handed out when a
//! waiter gives up on a slow fetch.

use crate::error::GatewayError;
use crate::resilience::clock::Clock;
use log::{debug, trace};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Where a value (or error) handed to a caller came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Source {
    /// This caller performed the outbound call.
    Live,
    /// Served from a live cache entry.
    Cache,
    /// Another caller's in-flight fetch was reused.
    Shared,
    /// Waiting on another fetch timed out; an expired entry was returned instead.
    Stale,
}

impl Source {
    /// Whether an outbound call produced the value, by this caller or one it
    /// coalesced with.
    pub fn is_outbound(self) -> bool {
        matches!(self, Source::Live | Source::Shared)
    }
}

/// A value handed back by the coalescer.
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched<V> {
    pub value: V,
    pub source: Source,
    /// Time since the value was fetched (zero for live and shared results).
    pub age: Duration,
}

impl<V> Fetched<V> {
    /// A value this caller just fetched itself.
    pub fn live(value: V) -> Self {
        Self {
            value,
            source: Source::Live,
            age: Duration::ZERO,
        }
    }
}

/// A failure handed back by the coalescer.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejected {
    pub error: GatewayError,
    /// `Live` when this caller's own outbound call failed; `Shared` when the failure
    /// was observed from another caller's fetch or from a local lock timeout.
    pub source: Source,
}

impl Rejected {
    /// Whether this failure came from an outbound call made by this caller.
    pub fn is_real(&self) -> bool {
        self.source == Source::Live
    }
}

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    fetched_at: Instant,
    ttl: Duration,
}

impl<V> CacheEntry<V> {
    fn is_live(&self, now: Instant) -> bool {
        now < self.fetched_at + self.ttl
    }

    fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.fetched_at)
    }
}

type Outcome<V> = Result<V, GatewayError>;
type Registry<V> = Mutex<HashMap<String, watch::Receiver<Option<Outcome<V>>>>>;

enum Role<V> {
    Fetcher(watch::Sender<Option<Outcome<V>>>),
    Waiter(watch::Receiver<Option<Outcome<V>>>),
}

/// Removes the in-flight registration when the fetcher finishes or is dropped, so a
/// cancelled fetcher can never wedge its key.
struct FlightGuard<'a, V> {
    registry: &'a Registry<V>,
    key: &'a str,
}

impl<V> Drop for FlightGuard<'_, V> {
    fn drop(&mut self) {
        lock(self.registry).remove(self.key);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-key single-flight cache.
#[derive(Debug)]
pub struct RequestCoalescer<V> {
    entries: Mutex<HashMap<String, CacheEntry<V>>>,
    in_flight: Registry<V>,
    lock_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl<V: Clone> RequestCoalescer<V> {
    pub fn new(lock_timeout: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            lock_timeout,
            clock,
        }
    }

    /// Return the cached value for `key` if it is still live.
    pub fn lookup(&self, key: &str) -> Option<Fetched<V>> {
        let now = self.clock.now();
        let entries = lock(&self.entries);
        entries.get(key).filter(|e| e.is_live(now)).map(|e| Fetched {
            value: e.value.clone(),
            source: Source::Cache,
            age: e.age(now),
        })
    }

    /// Return whatever value is stored for `key`, live or expired.
    pub fn stale(&self, key: &str) -> Option<Fetched<V>> {
        let now = self.clock.now();
        lock(&self.entries).get(key).map(|e| Fetched {
            value: e.value.clone(),
            source: Source::Stale,
            age: e.age(now),
        })
    }

    /// Drop the stored value for `key` (e.g. after a write changed it).
    pub fn invalidate(&self, key: &str) {
        lock(&self.entries).remove(key);
    }

    pub fn clear(&self) {
        lock(&self.entries).clear();
    }

    /// Number of keys with a fetch currently running.
    pub fn in_flight(&self) -> usize {
        lock(&self.in_flight).len()
    }

    /// Fetch `key` through the cache, making at most one outbound call at a time.
    ///
    /// A `ttl` of zero disables storing the result, though concurrent callers are
    /// still coalesced onto a single call.
    pub async fn get<F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        fetch: F,
    ) -> Result<Fetched<V>, Rejected>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, GatewayError>>,
    {
        if let Some(hit) = self.lookup(key) {
            trace!("Cache hit for {} (age {}ms)", key, hit.age.as_millis());
            return Ok(hit);
        }

        let role = {
            let mut in_flight = lock(&self.in_flight);
            match in_flight.get(key) {
                Some(rx) => Role::Waiter(rx.clone()),
                None => {
                    // A fetch may have landed between the lookup above and taking the
                    // registry; its entry is already stored by then.
                    if let Some(hit) = self.lookup(key) {
                        return Ok(hit);
                    }
                    let (tx, rx) = watch::channel(None);
                    in_flight.insert(key.to_string(), rx);
                    Role::Fetcher(tx)
                }
            }
        };

        match role {
            Role::Fetcher(tx) => self.run_fetch(key, ttl, tx, fetch).await,
            Role::Waiter(rx) => self.wait_for_fetch(key, rx).await,
        }
    }

    async fn run_fetch<F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        tx: watch::Sender<Option<Outcome<V>>>,
        fetch: F,
    ) -> Result<Fetched<V>, Rejected>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, GatewayError>>,
    {
        let guard = FlightGuard {
            registry: &self.in_flight,
            key,
        };
        let outcome = fetch().await;

        if let Ok(value) = &outcome {
            if !ttl.is_zero() {
                lock(&self.entries).insert(
                    key.to_string(),
                    CacheEntry {
                        value: value.clone(),
                        fetched_at: self.clock.now(),
                        ttl,
                    },
                );
            }
        }
        drop(guard);
        // No receivers left just means nobody was waiting.
        let _ = tx.send(Some(outcome.clone()));

        match outcome {
            Ok(value) => Ok(Fetched {
                value,
                source: Source::Live,
                age: Duration::ZERO,
            }),
            Err(error) => Err(Rejected {
                error,
                source: Source::Live,
            }),
        }
    }

    async fn wait_for_fetch(
        &self,
        key: &str,
        mut rx: watch::Receiver<Option<Outcome<V>>>,
    ) -> Result<Fetched<V>, Rejected> {
        let waited = tokio::time::timeout(self.lock_timeout, async {
            rx.wait_for(Option::is_some)
                .await
                .map(|outcome| outcome.clone())
        })
        .await;

        match waited {
            Ok(Ok(Some(Ok(value)))) => Ok(Fetched {
                value,
                source: Source::Shared,
                age: Duration::ZERO,
            }),
            Ok(Ok(Some(Err(error)))) => Err(Rejected {
                error,
                source: Source::Shared,
            }),
            Ok(Ok(None)) | Ok(Err(_)) => Err(Rejected {
                error: GatewayError::Transport(format!(
                    "in-flight fetch of '{key}' was abandoned"
                )),
                source: Source::Shared,
            }),
            Err(_) => {
                debug!(
                    "Gave up waiting {}ms for in-flight fetch of {}",
                    self.lock_timeout.as_millis(),
                    key
                );
                match self.stale(key) {
                    Some(stale) => Ok(stale),
                    None => Err(Rejected {
                        error: GatewayError::LockTimeout {
                            key: key.to_string(),
                        },
                        source: Source::Shared,
                    }),
                }
            }
        }
    }
}
