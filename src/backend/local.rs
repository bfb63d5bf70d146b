//! Legacy local REST API on the gateway.
//!
//! Customer login returns session cookies (`AuthCookie`, `UserRecord`) on older
//! firmware and a bearer token on newer firmware; whichever comes back is replayed
//! on every request. A 401/403 drops the session and logs in again once.

use super::http::{self, check_status};
use super::{GridExportPolicy, OperationMode};
use crate::config::Config;
use crate::error::{GatewayError, Result};
use log::{debug, info};
use reqwest::header::{COOKIE, SET_COOKIE};
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};
use tokio::sync::Mutex;

const LOGIN_PATH: &str = "/api/login/Basic";
const SESSION_COOKIES: [&str; 2] = ["AuthCookie", "UserRecord"];

#[derive(Debug, Clone, PartialEq, Eq)]
enum Session {
    Cookies(String),
    Bearer(String),
}

#[derive(Debug)]
pub struct LocalBackend {
    client: reqwest::Client,
    base_url: String,
    email: String,
    password: String,
    session: Mutex<Option<Session>>,
}

impl LocalBackend {
    pub fn from_config(config: &Config) -> Result<Self> {
        let host = if config.local.host.is_empty() {
            &config.gateway.host
        } else {
            &config.local.host
        };
        Ok(Self {
            client: http::client(config.gateway.timeout(), true)?,
            base_url: http::base_url(host),
            email: config.local.email.clone(),
            password: config.local.password.clone(),
            session: Mutex::new(None),
        })
    }

    async fn login(&self) -> Result<Session> {
        let url = format!("{}{}", self.base_url, LOGIN_PATH);
        let response = self
            .client
            .post(&url)
            .json(&json!({
                "username": "customer",
                "email": self.email,
                "password": self.password,
                "force_sm_off": false,
            }))
            .send()
            .await?;
        let response = check_status(response).await?;

        let cookies: Vec<String> = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(|v| v.split(';').next())
            .filter(|pair| {
                SESSION_COOKIES
                    .iter()
                    .any(|name| pair.starts_with(&format!("{name}=")))
            })
            .map(str::to_string)
            .collect();

        let session = if !cookies.is_empty() {
            Session::Cookies(cookies.join("; "))
        } else {
            let body: Value = response.json().await?;
            let token = body
                .get("token")
                .and_then(Value::as_str)
                .ok_or_else(|| GatewayError::Auth("login returned no session".into()))?;
            Session::Bearer(token.to_string())
        };
        info!("Logged in to local gateway API at {}", self.base_url);
        Ok(session)
    }

    async fn session(&self) -> Result<Session> {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_ref() {
            return Ok(session.clone());
        }
        let session = self.login().await?;
        *guard = Some(session.clone());
        Ok(session)
    }

    async fn send(
        &self,
        method: &Method,
        path: &str,
        body: Option<&Value>,
        session: &Session,
    ) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self.client.request(method.clone(), &url);
        req = match session {
            Session::Cookies(cookies) => req.header(COOKIE, cookies),
            Session::Bearer(token) => req.bearer_auth(token),
        };
        if let Some(body) = body {
            req = req.json(body);
        }
        Ok(req.send().await?)
    }

    async fn request(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
        debug!("local {} {}", method, path);
        let session = self.session().await?;
        let response = self.send(&method, path, body.as_ref(), &session).await?;
        if matches!(
            response.status(),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
        ) {
            debug!("Local session rejected, logging in again");
            *self.session.lock().await = None;
            let session = self.session().await?;
            let retry = self.send(&method, path, body.as_ref(), &session).await?;
            return http::read_json(retry).await;
        }
        http::read_json(response).await
    }

    async fn get(&self, path: &str) -> Result<Value> {
        self.request(Method::GET, path, None).await
    }

    /// Write an operation change and commit it.
    async fn write_operation(&self, real_mode: &str, reserve: f64) -> Result<Value> {
        let result = self
            .request(
                Method::POST,
                "/api/operation",
                Some(json!({
                    "real_mode": real_mode,
                    "backup_reserve_percent": reserve,
                })),
            )
            .await?;
        self.get("/api/config/completed").await?;
        Ok(result)
    }

    async fn current_operation(&self) -> Result<(String, f64)> {
        let op = self.get("/api/operation").await?;
        let mode = op
            .get("real_mode")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::Protocol("operation has no real_mode".into()))?;
        let reserve = op
            .get("backup_reserve_percent")
            .and_then(Value::as_f64)
            .ok_or_else(|| {
                GatewayError::Protocol("operation has no backup_reserve_percent".into())
            })?;
        Ok((mode.to_string(), reserve))
    }

    pub async fn probe(&self) -> Result<()> {
        self.session().await?;
        self.get("/api/status").await.map(|_| ())
    }

    pub async fn fetch_status(&self) -> Result<Value> {
        let soe = self.get("/api/system_status/soe").await?;
        let aggregates = self.get("/api/meters/aggregates").await?;
        let grid = self.get("/api/system_status/grid_status").await?;
        Ok(json!({
            "soe": soe,
            "aggregates": aggregates,
            "grid_status": grid,
        }))
    }

    pub async fn fetch_config(&self) -> Result<Value> {
        self.get("/api/site_info").await
    }

    pub async fn fetch_vitals_equivalent(&self) -> Result<Value> {
        self.get("/api/system_status").await
    }

    pub async fn set_reserve(&self, pct: f64) -> Result<Value> {
        let (mode, _) = self.current_operation().await?;
        self.write_operation(&mode, pct).await
    }

    pub async fn set_mode(&self, mode: OperationMode) -> Result<Value> {
        let (_, reserve) = self.current_operation().await?;
        self.write_operation(mode.as_str(), reserve).await
    }

    pub async fn set_grid_charging(&self, enabled: bool) -> Result<Value> {
        self.request(
            Method::POST,
            "/api/grid_import_export",
            Some(json!({ "disallow_charge_from_grid_with_solar_installed": !enabled })),
        )
        .await
    }

    pub async fn set_grid_export(&self, policy: GridExportPolicy) -> Result<Value> {
        self.request(
            Method::POST,
            "/api/grid_import_export",
            Some(json!({ "customer_preferred_export_rule": policy.as_str() })),
        )
        .await
    }
}
