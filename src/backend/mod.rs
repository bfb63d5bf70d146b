//! # Gateway Backends
//!
//! Four transports reach the same gateway:
//!
//! - [`LocalBackend`] - legacy REST API on the gateway (customer login)
//! - [`SiteApi`] (cloud flavour) - vendor owner API with a bearer token
//! - [`SiteApi`] (fleet flavour) - official Fleet API with a bearer token
//! - [`DeviceProtocolBackend`] - binary envelope posted to the embedded controller
//!
//! They are a closed set, wrapped in [`Backend`], chosen once at startup by the
//! [`selector`] and never swapped afterwards. All of them hand back plain
//! `serde_json::Value` payloads; schema differences between transports are left to
//! the consumer.

pub mod device;
pub mod http;
pub mod local;
pub mod selector;
pub mod site;

pub use device::{DeviceProtocolBackend, DeviceTransport, HttpsDeviceTransport};
pub use local::LocalBackend;
pub use site::{SiteApi, SiteFlavor};

use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::resilience::coalescer::Fetched;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Names the transport behind a [`Backend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendKind {
    #[serde(rename = "local")]
    Local,
    #[serde(rename = "cloud")]
    Cloud,
    #[serde(rename = "fleetapi")]
    FleetApi,
    #[serde(rename = "device_protocol")]
    DeviceProtocol,
}

impl BackendKind {
    /// Order tried by `auto` selection when none is configured.
    pub const DEFAULT_PRIORITY: [BackendKind; 4] = [
        BackendKind::FleetApi,
        BackendKind::Cloud,
        BackendKind::DeviceProtocol,
        BackendKind::Local,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Local => "local",
            BackendKind::Cloud => "cloud",
            BackendKind::FleetApi => "fleetapi",
            BackendKind::DeviceProtocol => "device_protocol",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "local" => Some(BackendKind::Local),
            "cloud" => Some(BackendKind::Cloud),
            "fleetapi" | "fleet_api" => Some(BackendKind::FleetApi),
            "device_protocol" | "tedapi" => Some(BackendKind::DeviceProtocol),
            _ => None,
        }
    }

    /// Whether `config` carries the credentials this transport needs.
    pub fn is_configured(self, config: &Config) -> bool {
        match self {
            BackendKind::Local => !config.local.password.is_empty(),
            BackendKind::Cloud => !config.cloud.access_token.is_empty(),
            BackendKind::FleetApi => !config.fleetapi.access_token.is_empty(),
            BackendKind::DeviceProtocol => !config.gateway.password.is_empty(),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Battery operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationMode {
    SelfConsumption,
    Backup,
    Autonomous,
}

impl OperationMode {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationMode::SelfConsumption => "self_consumption",
            OperationMode::Backup => "backup",
            OperationMode::Autonomous => "autonomous",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "self_consumption" => Some(OperationMode::SelfConsumption),
            "backup" => Some(OperationMode::Backup),
            "autonomous" => Some(OperationMode::Autonomous),
            _ => None,
        }
    }
}

/// What may be exported to the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GridExportPolicy {
    BatteryOk,
    PvOnly,
    Never,
}

impl GridExportPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            GridExportPolicy::BatteryOk => "battery_ok",
            GridExportPolicy::PvOnly => "pv_only",
            GridExportPolicy::Never => "never",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "battery_ok" => Some(GridExportPolicy::BatteryOk),
            "pv_only" => Some(GridExportPolicy::PvOnly),
            "never" => Some(GridExportPolicy::Never),
            _ => None,
        }
    }
}

/// Reject a backup reserve outside 0..=100 before it reaches any transport.
pub fn check_reserve(pct: f64) -> Result<f64> {
    if pct.is_finite() && (0.0..=100.0).contains(&pct) {
        Ok(pct)
    } else {
        Err(GatewayError::Config(format!(
            "backup reserve must be between 0 and 100, got {pct}"
        )))
    }
}

/// The active transport.
#[derive(Debug)]
pub enum Backend {
    Local(LocalBackend),
    Cloud(SiteApi),
    FleetApi(SiteApi),
    DeviceProtocol(DeviceProtocolBackend),
}

macro_rules! dispatch {
    ($self:ident, $b:ident => $call:expr) => {
        match $self {
            Backend::Local($b) => $call,
            Backend::Cloud($b) | Backend::FleetApi($b) => $call,
            Backend::DeviceProtocol($b) => $call,
        }
    };
}

impl Backend {
    /// Construct the transport for `kind` from `config`. Performs no I/O.
    pub fn build(kind: BackendKind, config: &Config) -> Result<Self> {
        if !kind.is_configured(config) {
            return Err(GatewayError::Config(format!(
                "{kind} backend is not configured"
            )));
        }
        Ok(match kind {
            BackendKind::Local => Backend::Local(LocalBackend::from_config(config)?),
            BackendKind::Cloud => {
                Backend::Cloud(SiteApi::from_config(SiteFlavor::Cloud, &config.cloud, config)?)
            }
            BackendKind::FleetApi => Backend::FleetApi(SiteApi::from_config(
                SiteFlavor::Fleet,
                &config.fleetapi,
                config,
            )?),
            BackendKind::DeviceProtocol => {
                Backend::DeviceProtocol(DeviceProtocolBackend::from_config(config)?)
            }
        })
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::Local(_) => BackendKind::Local,
            Backend::Cloud(_) => BackendKind::Cloud,
            Backend::FleetApi(_) => BackendKind::FleetApi,
            Backend::DeviceProtocol(_) => BackendKind::DeviceProtocol,
        }
    }

    /// Lightweight connectivity and credential check used during selection.
    pub async fn probe(&self) -> Result<()> {
        dispatch!(self, b => b.probe().await)
    }

    pub async fn fetch_status(&self) -> Result<Value> {
        dispatch!(self, b => b.fetch_status().await)
    }

    pub async fn fetch_config(&self) -> Result<Value> {
        dispatch!(self, b => b.fetch_config().await)
    }

    pub async fn fetch_vitals_equivalent(&self) -> Result<Value> {
        dispatch!(self, b => b.fetch_vitals_equivalent().await)
    }

    /// Reads tagged with where the value came from. Only the device backend keeps
    /// a cache of its own; every other answer is a live one.
    pub async fn status_sourced(&self) -> Result<Fetched<Value>> {
        match self {
            Backend::DeviceProtocol(b) => b.status_sourced().await,
            other => other.fetch_status().await.map(Fetched::live),
        }
    }

    pub async fn config_sourced(&self) -> Result<Fetched<Value>> {
        match self {
            Backend::DeviceProtocol(b) => b.config_sourced().await,
            other => other.fetch_config().await.map(Fetched::live),
        }
    }

    pub async fn vitals_sourced(&self) -> Result<Fetched<Value>> {
        match self {
            Backend::DeviceProtocol(b) => b.vitals_sourced().await,
            other => other.fetch_vitals_equivalent().await.map(Fetched::live),
        }
    }

    pub async fn set_reserve(&self, pct: f64) -> Result<Value> {
        let pct = check_reserve(pct)?;
        dispatch!(self, b => b.set_reserve(pct).await)
    }

    pub async fn set_mode(&self, mode: OperationMode) -> Result<Value> {
        dispatch!(self, b => b.set_mode(mode).await)
    }

    pub async fn set_grid_charging(&self, enabled: bool) -> Result<Value> {
        dispatch!(self, b => b.set_grid_charging(enabled).await)
    }

    pub async fn set_grid_export(&self, policy: GridExportPolicy) -> Result<Value> {
        dispatch!(self, b => b.set_grid_export(policy).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_round_trip() {
        for kind in BackendKind::DEFAULT_PRIORITY {
            assert_eq!(BackendKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(BackendKind::parse("Fleet_API"), Some(BackendKind::FleetApi));
        assert_eq!(BackendKind::parse("modbus"), None);
    }

    #[test]
    fn wire_names_match_serde() {
        assert_eq!(
            serde_json::to_value(OperationMode::SelfConsumption).unwrap(),
            serde_json::json!(OperationMode::SelfConsumption.as_str())
        );
        assert_eq!(
            serde_json::to_value(GridExportPolicy::PvOnly).unwrap(),
            serde_json::json!("pv_only")
        );
        assert_eq!(
            serde_json::to_value(BackendKind::DeviceProtocol).unwrap(),
            serde_json::json!("device_protocol")
        );
        assert_eq!(OperationMode::parse("BACKUP"), Some(OperationMode::Backup));
        assert_eq!(GridExportPolicy::parse("always"), None);
    }

    #[test]
    fn reserve_bounds() {
        assert!(check_reserve(0.0).is_ok());
        assert!(check_reserve(100.0).is_ok());
        assert_eq!(check_reserve(100.5).unwrap_err().kind(), "config");
        assert!(check_reserve(-1.0).is_err());
        assert!(check_reserve(f64::NAN).is_err());
    }

    #[test]
    fn unconfigured_backend_is_rejected() {
        let config = Config::default();
        for kind in BackendKind::DEFAULT_PRIORITY {
            assert!(!kind.is_configured(&config));
            assert_eq!(Backend::build(kind, &config).unwrap_err().kind(), "config");
        }
    }
}
