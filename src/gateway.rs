//! Public entry point: one selected backend behind one resilience core.

use crate::backend::selector::BackendSelector;
use crate::backend::{Backend, BackendKind, GridExportPolicy, OperationMode};
use crate::config::{CacheConfig, Config};
use crate::error::{GatewayError, Result};
use crate::resilience::clock::{Clock, SystemClock};
use crate::resilience::{HealthReport, Reading, ResilienceCore};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Logical read resources, each cached under its own key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    Status,
    Config,
    Vitals,
}

impl Resource {
    pub const ALL: [Resource; 3] = [Resource::Status, Resource::Config, Resource::Vitals];

    pub fn key(self) -> &'static str {
        match self {
            Resource::Status => "status",
            Resource::Config => "config",
            Resource::Vitals => "vitals",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Resource::ALL.into_iter().find(|r| r.key() == s)
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Writes invalidate every read they may change.
const WRITE_INVALIDATES: &[&str] = &["status", "config", "vitals"];

#[derive(Debug)]
pub struct Gateway {
    backend: Backend,
    core: ResilienceCore<Value>,
    cache: CacheConfig,
}

impl Gateway {
    /// Validate `config`, select a backend by probing and build the core.
    pub async fn connect(config: &Config) -> Result<Self> {
        config
            .validate()
            .map_err(|e| GatewayError::Config(e.to_string()))?;
        let selector = BackendSelector::from_config(config)?;
        let backend = selector
            .resolve(config, |b| Box::pin(b.probe()))
            .await?;
        Ok(Self::with_backend(backend, config, Arc::new(SystemClock)))
    }

    /// Wrap an already chosen backend.
    pub fn with_backend(backend: Backend, config: &Config, clock: Arc<dyn Clock>) -> Self {
        Self {
            backend,
            core: ResilienceCore::with_clock(config.resilience_policy(), clock),
            cache: config.cache.clone(),
        }
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// Read `resource`, using `ttl` or the configured TTL for it.
    pub async fn poll(&self, resource: Resource, ttl: Option<Duration>) -> Result<Reading<Value>> {
        let key = resource.key();
        let ttl = ttl.unwrap_or_else(|| self.cache.ttl_for(key));
        let backend = &self.backend;
        self.core
            .poll_fetched(key, ttl, || async move {
                match resource {
                    Resource::Status => backend.status_sourced().await,
                    Resource::Config => backend.config_sourced().await,
                    Resource::Vitals => backend.vitals_sourced().await,
                }
            })
            .await
    }

    pub async fn status(&self) -> Result<Reading<Value>> {
        self.poll(Resource::Status, None).await
    }

    pub async fn site_config(&self) -> Result<Reading<Value>> {
        self.poll(Resource::Config, None).await
    }

    pub async fn vitals(&self) -> Result<Reading<Value>> {
        self.poll(Resource::Vitals, None).await
    }

    pub async fn set_reserve(&self, pct: f64) -> Result<Value> {
        self.core
            .command("set_reserve", WRITE_INVALIDATES, self.backend.set_reserve(pct))
            .await
    }

    pub async fn set_mode(&self, mode: OperationMode) -> Result<Value> {
        self.core
            .command("set_mode", WRITE_INVALIDATES, self.backend.set_mode(mode))
            .await
    }

    pub async fn set_grid_charging(&self, enabled: bool) -> Result<Value> {
        self.core
            .command(
                "set_grid_charging",
                WRITE_INVALIDATES,
                self.backend.set_grid_charging(enabled),
            )
            .await
    }

    pub async fn set_grid_export(&self, policy: GridExportPolicy) -> Result<Value> {
        self.core
            .command(
                "set_grid_export",
                WRITE_INVALIDATES,
                self.backend.set_grid_export(policy),
            )
            .await
    }

    pub fn health(&self) -> HealthReport {
        self.core.health()
    }

    pub fn reset_health(&self) {
        self.core.reset_health()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_keys() {
        for r in Resource::ALL {
            assert_eq!(Resource::parse(r.key()), Some(r));
        }
        assert_eq!(Resource::parse("battery"), None);
    }
}
