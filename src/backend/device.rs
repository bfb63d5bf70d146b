//! # Device Protocol Backend
//!
//! Talks to the gateway's embedded controller with the binary envelope from
//! [`crate::protocol`], posted over HTTPS with HTTP Basic auth
//! (`Tesla_Energy_Device:<secret>`). The controller becomes unstable when it sees
//! concurrent duplicate queries, so both reads go through this backend's own
//! [`RequestCoalescer`]: at most one `config.json` request and one status query
//! are ever in flight, whatever the caller does above.
//!
//! The transport is a trait so tests can plug in an in-memory controller.

use super::http;
use super::{GridExportPolicy, OperationMode};
use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::logutil::{escape_log, hex_snippet};
use crate::protocol::{DeviceQuery, PendingRequest, ProtocolCodec, CONFIG_FILE};
use crate::resilience::clock::SystemClock;
use crate::resilience::coalescer::{Fetched, RequestCoalescer, Source};
use bytes::Bytes;
use log::{debug, info, trace};
use reqwest::header::CONTENT_TYPE;
use serde_json::{json, Value};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

/// HTTP Basic user name the controller expects.
pub const DEVICE_USER: &str = "Tesla_Energy_Device";
const DIN_PATH: &str = "/tedapi/din";
const EXCHANGE_PATH: &str = "/tedapi/v1";

const CONFIG_KEY: &str = "device:config";
const STATUS_KEY: &str = "device:status";

type RequestBuilder = fn(&DeviceProtocolBackend, &ProtocolCodec) -> PendingRequest;

pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Carries encoded envelopes to the controller and back.
pub trait DeviceTransport: Send + Sync + fmt::Debug {
    /// Ask the gateway for its device identity.
    fn fetch_din(&self) -> TransportFuture<'_, String>;

    /// Post one request envelope and return the raw response envelope.
    fn exchange(&self, body: Bytes) -> TransportFuture<'_, Vec<u8>>;
}

/// reqwest transport to `https://<host>/tedapi/...`. The gateway uses a
/// self-signed certificate, so validation is relaxed for this client only.
#[derive(Debug)]
pub struct HttpsDeviceTransport {
    client: reqwest::Client,
    base_url: String,
    secret: String,
}

impl HttpsDeviceTransport {
    pub fn new(host: &str, secret: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http::client(timeout, true)?,
            base_url: http::base_url(host),
            secret: secret.to_string(),
        })
    }
}

impl DeviceTransport for HttpsDeviceTransport {
    fn fetch_din(&self) -> TransportFuture<'_, String> {
        Box::pin(async move {
            let url = format!("{}{}", self.base_url, DIN_PATH);
            let response = self
                .client
                .get(&url)
                .basic_auth(DEVICE_USER, Some(&self.secret))
                .send()
                .await?;
            let din = http::check_status(response).await?.text().await?;
            let din = din.trim();
            if din.is_empty() {
                return Err(GatewayError::Protocol("gateway returned an empty DIN".into()));
            }
            Ok(din.to_string())
        })
    }

    fn exchange(&self, body: Bytes) -> TransportFuture<'_, Vec<u8>> {
        Box::pin(async move {
            let url = format!("{}{}", self.base_url, EXCHANGE_PATH);
            let response = self
                .client
                .post(&url)
                .basic_auth(DEVICE_USER, Some(&self.secret))
                .header(CONTENT_TYPE, "application/octet-string")
                .body(body)
                .send()
                .await?;
            let bytes = http::check_status(response).await?.bytes().await?;
            Ok(bytes.to_vec())
        })
    }
}

pub struct DeviceProtocolBackend {
    transport: Arc<dyn DeviceTransport>,
    configured_din: Option<String>,
    codec: OnceCell<ProtocolCodec>,
    reads: RequestCoalescer<String>,
    read_ttl: Duration,
    query_code: Vec<u8>,
}

impl fmt::Debug for DeviceProtocolBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceProtocolBackend")
            .field("transport", &self.transport)
            .field("din", &self.codec.get().map(ProtocolCodec::din))
            .field("read_ttl", &self.read_ttl)
            .finish()
    }
}

impl DeviceProtocolBackend {
    pub fn from_config(config: &Config) -> Result<Self> {
        let transport = HttpsDeviceTransport::new(
            &config.gateway.host,
            &config.gateway.password,
            config.gateway.timeout(),
        )?;
        let query_code = match &config.gateway.query_signature_file {
            Some(path) => std::fs::read(path).map_err(|e| {
                GatewayError::Config(format!("cannot read query signature {path}: {e}"))
            })?,
            None => Vec::new(),
        };
        Ok(Self::new(
            Arc::new(transport),
            config.gateway.din.clone().filter(|d| !d.is_empty()),
            Duration::from_secs(config.cache.device_ttl_seconds),
            Duration::from_millis(config.cache.lock_timeout_ms),
        )
        .with_query_code(query_code))
    }

    /// Backend over any transport. When `din` is `None` it is fetched from the
    /// gateway on first use.
    pub fn new(
        transport: Arc<dyn DeviceTransport>,
        din: Option<String>,
        read_ttl: Duration,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            configured_din: din,
            codec: OnceCell::new(),
            reads: RequestCoalescer::new(lock_timeout, Arc::new(SystemClock)),
            read_ttl,
            query_code: Vec::new(),
        }
    }

    pub fn with_query_code(mut self, code: Vec<u8>) -> Self {
        self.query_code = code;
        self
    }

    async fn codec(&self) -> Result<&ProtocolCodec> {
        self.codec
            .get_or_try_init(|| async {
                let din = match &self.configured_din {
                    Some(din) => din.clone(),
                    None => {
                        let din = self.transport.fetch_din().await?;
                        info!("Discovered gateway DIN {}", din);
                        din
                    }
                };
                Ok::<ProtocolCodec, GatewayError>(ProtocolCodec::new(din))
            })
            .await
    }

    /// Device identity, discovering it if necessary.
    pub async fn din(&self) -> Result<String> {
        Ok(self.codec().await?.din().to_string())
    }

    async fn round_trip(&self, codec: &ProtocolCodec, request: PendingRequest) -> Result<String> {
        trace!(
            "Device request #{}: {}",
            request.marker(),
            hex_snippet(request.bytes(), 48)
        );
        let response = self.transport.exchange(request.body()).await?;
        let json = codec.decode_response(&request, &response)?;
        trace!("Device reply #{}: {}", request.marker(), escape_log(&json));
        Ok(json)
    }

    async fn read_once(&self, build: RequestBuilder) -> Result<String> {
        let codec = self.codec().await?;
        let request = build(self, codec);
        self.round_trip(codec, request).await
    }

    async fn coalesced(&self, key: &str, build: RequestBuilder) -> Result<Fetched<String>> {
        let fetched = self
            .reads
            .get(key, self.read_ttl, || self.read_once(build))
            .await
            .map_err(|rejected| rejected.error)?;
        debug!("{} served ({:?})", key, fetched.source);
        Ok(fetched)
    }

    async fn read_config(&self) -> Result<Fetched<String>> {
        self.coalesced(CONFIG_KEY, |_, codec| codec.encode_config_request(CONFIG_FILE))
            .await
    }

    async fn read_status(&self) -> Result<Fetched<String>> {
        self.coalesced(STATUS_KEY, |backend, codec| {
            codec.encode_query_request(&DeviceQuery::status(backend.query_code.clone()))
        })
        .await
    }

    /// Raw `config.json` text, coalesced.
    pub async fn config_json(&self) -> Result<String> {
        Ok(self.read_config().await?.value)
    }

    /// Raw controller status JSON, coalesced.
    pub async fn status_json(&self) -> Result<String> {
        Ok(self.read_status().await?.value)
    }

    /// Number of device reads currently on the wire.
    pub fn reads_in_flight(&self) -> usize {
        self.reads.in_flight()
    }

    pub async fn firmware_version(&self) -> Result<Option<String>> {
        let status: Value = serde_json::from_str(&self.status_json().await?)?;
        Ok(firmware_version(&status))
    }

    pub async fn probe(&self) -> Result<()> {
        self.config_json().await.map(|_| ())
    }

    pub async fn fetch_status(&self) -> Result<Value> {
        Ok(self.status_sourced().await?.value)
    }

    pub async fn fetch_config(&self) -> Result<Value> {
        Ok(self.config_sourced().await?.value)
    }

    pub async fn fetch_vitals_equivalent(&self) -> Result<Value> {
        Ok(self.vitals_sourced().await?.value)
    }

    /// Parsed status, tagged with whether it came off the wire or from this
    /// backend's read cache.
    pub async fn status_sourced(&self) -> Result<Fetched<Value>> {
        parse(self.read_status().await?)
    }

    pub async fn config_sourced(&self) -> Result<Fetched<Value>> {
        parse(self.read_config().await?)
    }

    /// Vitals count as live when at least one of their two reads reached the
    /// controller.
    pub async fn vitals_sourced(&self) -> Result<Fetched<Value>> {
        let (status, config) = tokio::try_join!(self.status_sourced(), self.config_sourced())?;
        let din = self.din().await?;
        let source = if status.source.is_outbound() || config.source.is_outbound() {
            Source::Live
        } else {
            Source::Cache
        };
        Ok(Fetched {
            value: derive_vitals(&din, &status.value, &config.value),
            source,
            age: status.age.max(config.age),
        })
    }

    pub async fn set_reserve(&self, _pct: f64) -> Result<Value> {
        Err(unsupported("set_reserve"))
    }

    pub async fn set_mode(&self, _mode: OperationMode) -> Result<Value> {
        Err(unsupported("set_mode"))
    }

    pub async fn set_grid_charging(&self, _enabled: bool) -> Result<Value> {
        Err(unsupported("set_grid_charging"))
    }

    pub async fn set_grid_export(&self, _policy: GridExportPolicy) -> Result<Value> {
        Err(unsupported("set_grid_export"))
    }
}

fn parse(raw: Fetched<String>) -> Result<Fetched<Value>> {
    Ok(Fetched {
        value: serde_json::from_str(&raw.value)?,
        source: raw.source,
        age: raw.age,
    })
}

fn unsupported(operation: &'static str) -> GatewayError {
    GatewayError::Unsupported {
        backend: "device_protocol",
        operation,
    }
}

/// Firmware version reported in the controller status.
pub fn firmware_version(status: &Value) -> Option<String> {
    status
        .pointer("/system/updateUrgencyCheck/version/version")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Build a vitals-like summary from the controller status and site config.
///
/// Anything the device did not report stays `null`; nothing is defaulted to zero.
pub fn derive_vitals(din: &str, status: &Value, config: &Value) -> Value {
    let system = status.pointer("/control/systemStatus");
    let full = system
        .and_then(|s| s.get("nominalFullPackEnergyWh"))
        .and_then(Value::as_f64);
    let remaining = system
        .and_then(|s| s.get("nominalEnergyRemainingWh"))
        .and_then(Value::as_f64);
    let percentage = match (full, remaining) {
        (Some(full), Some(remaining)) if full > 0.0 => json!(remaining / full * 100.0),
        _ => Value::Null,
    };

    let islanding = status.pointer("/control/islanding");
    let flag = |name: &str| {
        islanding
            .and_then(|i| i.get(name))
            .cloned()
            .unwrap_or(Value::Null)
    };

    let meters: serde_json::Map<String, Value> = status
        .pointer("/control/meterAggregates")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|m| {
            let location = m.get("location")?.as_str()?.to_ascii_lowercase();
            Some((location, m.get("realPowerW").cloned().unwrap_or(Value::Null)))
        })
        .collect();

    let count = |path: &str| {
        config
            .pointer(path)
            .and_then(Value::as_array)
            .map(|a| json!(a.len()))
            .unwrap_or(Value::Null)
    };

    json!({
        "din": din,
        "firmware_version": firmware_version(status),
        "battery": {
            "nominal_full_pack_energy_wh": full,
            "nominal_energy_remaining_wh": remaining,
            "percentage": percentage,
            "blocks": count("/battery_blocks"),
        },
        "grid": {
            "grid_ok": flag("gridOK"),
            "microgrid_ok": flag("microGridOK"),
            "island_mode": flag("customerIslandMode"),
            "contactor_closed": flag("contactorClosed"),
        },
        "meters": meters,
        "alerts": status.pointer("/control/alerts/active").cloned().unwrap_or(Value::Null),
        "site_name": config.pointer("/site_info/site_name").cloned().unwrap_or(Value::Null),
    })
}
