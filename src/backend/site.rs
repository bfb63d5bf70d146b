//! Energy-site API shared by the vendor cloud and the Fleet API.
//!
//! Both speak the same `energy_sites/{id}/...` surface with a bearer token and wrap
//! every payload in `{"response": ...}`; they differ by base URL and token scope.

use super::http::{self, pick};
use super::{GridExportPolicy, OperationMode};
use crate::config::{Config, SiteApiConfig};
use crate::error::{GatewayError, Result};
use log::{debug, info};
use serde_json::{json, Value};
use tokio::sync::OnceCell;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteFlavor {
    Cloud,
    Fleet,
}

impl SiteFlavor {
    fn label(self) -> &'static str {
        match self {
            SiteFlavor::Cloud => "cloud",
            SiteFlavor::Fleet => "fleetapi",
        }
    }
}

/// Fields of `live_status` that make up the vitals equivalent.
const LIVE_VITALS: &[&str] = &[
    "percentage_charged",
    "energy_left",
    "total_pack_energy",
    "battery_power",
    "solar_power",
    "load_power",
    "grid_power",
    "grid_status",
    "island_status",
    "storm_mode_active",
    "timestamp",
];

#[derive(Debug)]
pub struct SiteApi {
    flavor: SiteFlavor,
    client: reqwest::Client,
    base_url: String,
    token: String,
    site_id: OnceCell<u64>,
}

impl SiteApi {
    pub fn from_config(flavor: SiteFlavor, site: &SiteApiConfig, config: &Config) -> Result<Self> {
        let client = http::client(config.gateway.timeout(), false)?;
        let site_id = OnceCell::new();
        if let Some(id) = site.site_id {
            site_id
                .set(id)
                .map_err(|e| GatewayError::Config(e.to_string()))?;
        }
        Ok(Self {
            flavor,
            client,
            base_url: site.base_url.trim_end_matches('/').to_string(),
            token: site.access_token.clone(),
            site_id,
        })
    }

    pub fn flavor(&self) -> SiteFlavor {
        self.flavor
    }

    /// Configured site id, or the first energy site listed on the account.
    async fn site_id(&self) -> Result<u64> {
        self.site_id
            .get_or_try_init(|| async {
                let products = self.request(reqwest::Method::GET, "products", None).await?;
                let id = products
                    .as_array()
                    .into_iter()
                    .flatten()
                    .find_map(|p| p.get("energy_site_id").and_then(Value::as_u64))
                    .ok_or_else(|| {
                        GatewayError::Config(format!(
                            "{} account has no energy site",
                            self.flavor.label()
                        ))
                    })?;
                info!("Using {} energy site {}", self.flavor.label(), id);
                Ok::<u64, GatewayError>(id)
            })
            .await
            .copied()
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value> {
        let url = format!("{}/{}", self.base_url, path);
        debug!("{} {} {}", self.flavor.label(), method, url);
        let mut req = self.client.request(method, &url).bearer_auth(&self.token);
        if let Some(body) = body {
            req = req.json(&body);
        }
        let payload = http::read_json(req.send().await?).await?;
        match payload {
            Value::Object(mut map) if map.contains_key("response") => {
                Ok(map.remove("response").unwrap_or(Value::Null))
            }
            _ => Err(GatewayError::Protocol(format!(
                "{} reply for {} has no response field",
                self.flavor.label(),
                path
            ))),
        }
    }

    async fn site_get(&self, endpoint: &str) -> Result<Value> {
        let id = self.site_id().await?;
        self.request(
            reqwest::Method::GET,
            &format!("energy_sites/{id}/{endpoint}"),
            None,
        )
        .await
    }

    async fn site_post(&self, endpoint: &str, body: Value) -> Result<Value> {
        let id = self.site_id().await?;
        self.request(
            reqwest::Method::POST,
            &format!("energy_sites/{id}/{endpoint}"),
            Some(body),
        )
        .await
    }

    pub async fn probe(&self) -> Result<()> {
        self.site_get("live_status").await.map(|_| ())
    }

    pub async fn fetch_status(&self) -> Result<Value> {
        self.site_get("live_status").await
    }

    pub async fn fetch_config(&self) -> Result<Value> {
        self.site_get("site_info").await
    }

    /// The cloud has no vitals endpoint; report the live status power flows.
    pub async fn fetch_vitals_equivalent(&self) -> Result<Value> {
        let live = self.site_get("live_status").await?;
        Ok(pick(&live, LIVE_VITALS))
    }

    pub async fn set_reserve(&self, pct: f64) -> Result<Value> {
        self.site_post("backup", json!({ "backup_reserve_percent": pct }))
            .await
    }

    pub async fn set_mode(&self, mode: OperationMode) -> Result<Value> {
        self.site_post("operation", json!({ "default_real_mode": mode.as_str() }))
            .await
    }

    pub async fn set_grid_charging(&self, enabled: bool) -> Result<Value> {
        self.site_post(
            "grid_import_export",
            json!({ "disallow_charge_from_grid_with_solar_installed": !enabled }),
        )
        .await
    }

    pub async fn set_grid_export(&self, policy: GridExportPolicy) -> Result<Value> {
        self.site_post(
            "grid_import_export",
            json!({ "customer_preferred_export_rule": policy.as_str() }),
        )
        .await
    }
}
