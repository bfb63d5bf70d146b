//! reqwest plumbing shared by the HTTP-based backends.

use crate::error::{GatewayError, Result};
use crate::logutil::escape_log;
use crate::resilience::quarantine::MAX_WINDOW;
use log::trace;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;

/// Build a client with the given per-request timeout.
///
/// `accept_invalid_certs` is only set for transports that talk to the gateway's
/// self-signed certificate on the local network.
pub fn client(timeout: Duration, accept_invalid_certs: bool) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .danger_accept_invalid_certs(accept_invalid_certs)
        .pool_max_idle_per_host(2)
        .build()
        .map_err(|e| GatewayError::Config(format!("cannot build HTTP client: {e}")))
}

/// Root URL for a gateway host. A bare host means HTTPS; a host that already
/// names its scheme is used as given.
pub fn base_url(host: &str) -> String {
    let host = host.trim_end_matches('/');
    if host.contains("://") {
        host.to_string()
    } else {
        format!("https://{host}")
    }
}

/// Map a non-success HTTP status to the error taxonomy.
pub fn error_for_status(
    status: StatusCode,
    retry_after: Option<Duration>,
    body: String,
) -> GatewayError {
    let detail = if body.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("HTTP {}: {}", status.as_u16(), escape_log(&body))
    };
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => GatewayError::Auth(detail),
        StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => {
            GatewayError::Overload {
                message: detail,
                retry_after,
            }
        }
        _ => GatewayError::Transport(detail),
    }
}

/// Numeric `Retry-After` header in seconds, capped at the longest quarantine.
/// HTTP-date values are ignored and the configured cooldown applies instead.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(|secs| Duration::from_secs(secs).min(MAX_WINDOW))
}

/// Turn an error status into a [`GatewayError`], consuming the body for context.
pub async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let retry = retry_after(response.headers());
    let body = response.text().await.unwrap_or_default();
    Err(error_for_status(status, retry, body))
}

/// Check the status and decode the body as JSON.
pub async fn read_json(response: reqwest::Response) -> Result<Value> {
    let response = check_status(response).await?;
    let bytes = response.bytes().await?;
    if bytes.is_empty() {
        return Ok(Value::Null);
    }
    trace!(
        "Response body: {}",
        escape_log(&String::from_utf8_lossy(&bytes))
    );
    Ok(serde_json::from_slice(&bytes)?)
}

/// Copy `keys` out of an object, keeping missing ones as explicit nulls.
pub fn pick(source: &Value, keys: &[&str]) -> Value {
    let mut out = serde_json::Map::with_capacity(keys.len());
    for key in keys {
        out.insert(
            key.to_string(),
            source.get(*key).cloned().unwrap_or(Value::Null),
        );
    }
    Value::Object(out)
}
