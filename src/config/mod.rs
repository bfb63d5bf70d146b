//! # Configuration Management Module
//!
//! Loads the TOML configuration that tells powergate how to reach the gateway and
//! how the resilience core should behave.
//!
//! ## Configuration Structure
//!
//! - [`GatewayConfig`] - Device address, secret and identity
//! - [`BackendConfig`] - Transport selection (explicit or auto with priority)
//! - [`LocalConfig`] - Legacy local REST credentials
//! - [`SiteApiConfig`] - Cloud and Fleet API endpoints and tokens
//! - [`CacheConfig`] - Coalescer TTLs and lock wait
//! - [`HealthConfig`] - Thresholds, fallback TTL and degradation flags
//! - [`LoggingConfig`] - Logging level and optional log file
//!
//! ## Usage
//!
//! ```rust,no_run
//! use powergate::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut config = Config::load("powergate.toml").await?;
//!     config.apply_env_overrides();
//!     config.validate()?;
//!     println!("Gateway: {}", config.gateway.host);
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration File Format
//!
//! ```toml
//! [gateway]
//! host = "192.168.91.1"
//! password = "ABCDEFGHIJ"
//!
//! [backend]
//! mode = "auto"
//! priority = ["fleetapi", "cloud", "device_protocol", "local"]
//!
//! [health]
//! failure_threshold = 5
//! success_threshold = 3
//! fail_fast = false
//! ```
//!
//! With `fail_fast = true` a degraded gateway is never polled again, so it only
//! leaves degraded mode through an explicit health reset.
//!
//! Every section has defaults, so partial files load. Precedence:
//! CLI args > Environment > Config file > Defaults

use crate::backend::BackendKind;
use crate::resilience::ResiliencePolicy;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::fs;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub local: LocalConfig,
    #[serde(default)]
    pub cloud: SiteApiConfig,
    #[serde(default = "SiteApiConfig::fleet_default")]
    pub fleetapi: SiteApiConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            gateway: GatewayConfig::default(),
            backend: BackendConfig::default(),
            local: LocalConfig::default(),
            cloud: SiteApiConfig::default(),
            fleetapi: SiteApiConfig::fleet_default(),
            cache: CacheConfig::default(),
            health: HealthConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// The gateway itself, as reached by the device protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    /// Device secret printed on the gateway (device protocol password).
    pub password: String,
    /// Device identity; discovered from the gateway when empty.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub din: Option<String>,
    pub timeout_seconds: u64,
    /// Signed binary code that accompanies the controller status query.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_signature_file: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "192.168.91.1".to_string(),
            password: String::new(),
            din: None,
            timeout_seconds: 5,
            query_signature_file: None,
        }
    }
}

impl GatewayConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// `auto` or one backend name.
    pub mode: String,
    /// Order tried by `auto`.
    pub priority: Vec<String>,
    pub probe_attempts: u32,
    pub probe_retry_delay_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            mode: "auto".to_string(),
            priority: BackendKind::DEFAULT_PRIORITY
                .iter()
                .map(|k| k.as_str().to_string())
                .collect(),
            probe_attempts: 1,
            probe_retry_delay_ms: 500,
        }
    }
}

impl BackendConfig {
    /// Backends to try, in order. An explicit mode yields exactly that backend.
    pub fn candidates(&self) -> Result<Vec<BackendKind>> {
        if self.mode != "auto" {
            return Ok(vec![parse_kind(&self.mode)?]);
        }
        self.priority.iter().map(|name| parse_kind(name)).collect()
    }
}

fn parse_kind(name: &str) -> Result<BackendKind> {
    BackendKind::parse(name).ok_or_else(|| anyhow!("Unknown backend '{}'", name))
}

/// Legacy local REST API (customer login).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    /// Defaults to `gateway.host` when empty. HTTPS unless a scheme is given.
    pub host: String,
    pub email: String,
    pub password: String,
}

/// Vendor cloud or Fleet API site endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteApiConfig {
    pub base_url: String,
    pub access_token: String,
    /// Energy site id; the first site on the account is used when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site_id: Option<u64>,
}

impl Default for SiteApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://owner-api.teslamotors.com/api/1".to_string(),
            access_token: String::new(),
            site_id: None,
        }
    }
}

impl SiteApiConfig {
    pub fn fleet_default() -> Self {
        Self {
            base_url: "https://fleet-api.prd.na.vn.cloud.tesla.com/api/1".to_string(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub default_ttl_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_ttl_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_ttl_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vitals_ttl_seconds: Option<u64>,
    pub lock_timeout_ms: u64,
    /// TTL of the device protocol backend's own request coalescer.
    pub device_ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_seconds: 5,
            status_ttl_seconds: None,
            config_ttl_seconds: None,
            vitals_ttl_seconds: None,
            lock_timeout_ms: 5000,
            device_ttl_seconds: 5,
        }
    }
}

impl CacheConfig {
    /// Coalescer TTL for a logical resource key.
    pub fn ttl_for(&self, key: &str) -> Duration {
        let per_resource = match key {
            "status" => self.status_ttl_seconds,
            "config" => self.config_ttl_seconds,
            "vitals" => self.vitals_ttl_seconds,
            _ => None,
        };
        Duration::from_secs(per_resource.unwrap_or(self.default_ttl_seconds))
    }

    fn largest_ttl_seconds(&self) -> u64 {
        [
            Some(self.default_ttl_seconds),
            self.status_ttl_seconds,
            self.config_ttl_seconds,
            self.vitals_ttl_seconds,
            Some(self.device_ttl_seconds),
        ]
        .into_iter()
        .flatten()
        .max()
        .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub degradation_ttl_seconds: u64,
    /// Skip the real fetch entirely while degraded. No successes can be recorded
    /// then, so the gateway stays degraded until `reset_health` is called.
    pub fail_fast: bool,
    /// Serve last-known-good values while degraded.
    pub graceful_degradation: bool,
    pub overload_cooldown_seconds: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            degradation_ttl_seconds: 25,
            fail_fast: false,
            graceful_degradation: true,
            overload_cooldown_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    /// Override secrets and the backend choice from `POWERGATE_*` variables.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    /// Same as [`Config::apply_env_overrides`] with an arbitrary variable source.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        if let Some(v) = get("POWERGATE_GW_PASSWORD") {
            self.gateway.password = v;
        }
        if let Some(v) = get("POWERGATE_GW_HOST") {
            self.gateway.host = v;
        }
        if let Some(v) = get("POWERGATE_BACKEND") {
            self.backend.mode = v;
        }
        if let Some(v) = get("POWERGATE_CLOUD_TOKEN") {
            self.cloud.access_token = v;
        }
        if let Some(v) = get("POWERGATE_FLEET_TOKEN") {
            self.fleetapi.access_token = v;
        }
    }

    /// Reject settings the resilience core cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.health.failure_threshold == 0 || self.health.success_threshold == 0 {
            return Err(anyhow!("Health thresholds must be at least 1"));
        }
        let largest = self.cache.largest_ttl_seconds();
        if self.health.degradation_ttl_seconds <= largest {
            return Err(anyhow!(
                "degradation_ttl_seconds ({}) must be longer than the largest cache TTL ({})",
                self.health.degradation_ttl_seconds,
                largest
            ));
        }
        if self.backend.mode == "auto" && self.backend.priority.is_empty() {
            return Err(anyhow!("Backend priority list is empty"));
        }
        self.backend.candidates()?;
        if self.backend.probe_attempts == 0 {
            return Err(anyhow!("probe_attempts must be at least 1"));
        }
        Ok(())
    }

    /// Settings for the resilience core.
    pub fn resilience_policy(&self) -> ResiliencePolicy {
        ResiliencePolicy {
            failure_threshold: self.health.failure_threshold,
            success_threshold: self.health.success_threshold,
            degradation_ttl: Duration::from_secs(self.health.degradation_ttl_seconds),
            fail_fast: self.health.fail_fast,
            graceful_degradation: self.health.graceful_degradation,
            overload_cooldown: Duration::from_secs(self.health.overload_cooldown_seconds),
            lock_timeout: Duration::from_millis(self.cache.lock_timeout_ms),
            call_timeout: self.gateway.timeout(),
        }
    }
}
