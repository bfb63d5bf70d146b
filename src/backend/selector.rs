//! Startup choice of the single active backend.

use super::{Backend, BackendKind};
use crate::config::Config;
use crate::error::{GatewayError, Result};
use log::{debug, info, warn};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Future returned by a probe function, borrowing the backend under test.
pub type ProbeFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + 'a>>;

/// Walks the configured candidates in order and adopts the first one that answers
/// a probe. The result is final for the life of the process.
#[derive(Debug, Clone)]
pub struct BackendSelector {
    candidates: Vec<BackendKind>,
    explicit: bool,
    attempts: u32,
    retry_delay: Duration,
}

impl BackendSelector {
    pub fn from_config(config: &Config) -> Result<Self> {
        let candidates = config
            .backend
            .candidates()
            .map_err(|e| GatewayError::Config(e.to_string()))?;
        Ok(Self {
            candidates,
            explicit: config.backend.mode != "auto",
            attempts: config.backend.probe_attempts.max(1),
            retry_delay: Duration::from_millis(config.backend.probe_retry_delay_ms),
        })
    }

    pub fn candidates(&self) -> &[BackendKind] {
        &self.candidates
    }

    /// Build each configured candidate and probe it with `probe` until one passes.
    ///
    /// Production code passes `|b| Box::pin(b.probe())`.
    pub async fn resolve<P>(&self, config: &Config, probe: P) -> Result<Backend>
    where
        P: for<'a> Fn(&'a Backend) -> ProbeFuture<'a>,
    {
        let mut failures = Vec::new();
        for &kind in &self.candidates {
            if !kind.is_configured(config) {
                if self.explicit {
                    return Err(GatewayError::Config(format!(
                        "{kind} backend selected but not configured"
                    )));
                }
                debug!("Skipping {} backend: not configured", kind);
                continue;
            }
            let backend = match Backend::build(kind, config) {
                Ok(b) => b,
                Err(e) => {
                    warn!("Cannot build {} backend: {}", kind, e);
                    failures.push(format!("{kind}: {e}"));
                    continue;
                }
            };
            match self.probe_with_retries(&backend, &probe).await {
                Ok(()) => {
                    info!("Selected {} backend", kind);
                    return Ok(backend);
                }
                Err(e) => {
                    warn!("{} backend probe failed: {}", kind, e);
                    failures.push(format!("{kind}: {e}"));
                }
            }
        }

        if failures.is_empty() {
            return Err(GatewayError::Config(
                "no backend is configured; set a gateway password or an API token".into(),
            ));
        }
        Err(GatewayError::Config(format!(
            "no backend reachable ({})",
            failures.join("; ")
        )))
    }

    async fn probe_with_retries<P>(&self, backend: &Backend, probe: &P) -> Result<()>
    where
        P: for<'a> Fn(&'a Backend) -> ProbeFuture<'a>,
    {
        let mut last = None;
        for attempt in 1..=self.attempts {
            match probe(backend).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!(
                        "{} probe attempt {}/{} failed: {}",
                        backend.kind(),
                        attempt,
                        self.attempts,
                        e
                    );
                    last = Some(e);
                }
            }
            if attempt < self.attempts {
                tokio::time::sleep(self.retry_delay).await;
            }
        }
        Err(last.unwrap_or_else(|| GatewayError::Transport("probe never ran".into())))
    }
}
