//! Local and site API backends against a stub HTTP server.
mod common;

use common::{StubResponse, StubServer};
use powergate::backend::{Backend, LocalBackend, SiteApi, SiteFlavor};
use powergate::config::Config;
use powergate::error::GatewayError;
use powergate::gateway::{Gateway, Resource};
use powergate::resilience::clock::ManualClock;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const LOGIN: &str = "/api/login/Basic";
const SITE_INFO: &str = "/api/site_info";

fn local_config(server: &StubServer) -> Config {
    let mut config = Config::default();
    config.local.host = server.url();
    config.local.email = "owner@example.com".into();
    config.local.password = "secret".into();
    config
}

fn site_api(server: &StubServer, site_id: Option<u64>) -> SiteApi {
    let mut config = Config::default();
    config.cloud.base_url = format!("{}/api/1", server.url());
    config.cloud.access_token = "cloud-token".into();
    config.cloud.site_id = site_id;
    SiteApi::from_config(SiteFlavor::Cloud, &config.cloud, &config).unwrap()
}

#[tokio::test]
async fn local_logs_in_again_after_a_rejected_cookie() {
    let logins = Arc::new(AtomicUsize::new(0));
    let counter = logins.clone();
    let server = StubServer::start(move |req| match req.path.as_str() {
        LOGIN => {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            StubResponse::json(200, json!({}))
                .with_header("Set-Cookie", &format!("AuthCookie=session{n}; Path=/"))
                .with_header("Set-Cookie", "UserRecord=owner; Path=/")
                .with_header("Set-Cookie", "Tracking=ignored; Path=/")
        }
        SITE_INFO => match req.header("cookie") {
            // The first session has already expired on the gateway.
            Some(c) if c.contains("AuthCookie=session1") => StubResponse::status(401),
            Some(c) if c.contains("AuthCookie=session2") => {
                StubResponse::json(200, json!({ "site_name": "Home" }))
            }
            _ => StubResponse::status(403),
        },
        _ => StubResponse::status(404),
    })
    .await;

    let local = LocalBackend::from_config(&local_config(&server)).unwrap();
    let site = local.fetch_config().await.unwrap();
    assert_eq!(site["site_name"], "Home");
    assert_eq!(logins.load(Ordering::SeqCst), 2);
    assert_eq!(server.hits(SITE_INFO), 2);

    let last = server.requests().pop().unwrap();
    let cookie = last.header("cookie").unwrap();
    assert!(cookie.contains("UserRecord=owner"), "{cookie}");
    assert!(!cookie.contains("Tracking"), "{cookie}");
}

#[tokio::test]
async fn local_accepts_a_bearer_session() {
    let server = StubServer::start(|req| match req.path.as_str() {
        LOGIN => StubResponse::json(200, json!({ "token": "tok-1" })),
        SITE_INFO if req.header("authorization") == Some("Bearer tok-1") => {
            StubResponse::json(200, json!({ "site_name": "Cabin" }))
        }
        _ => StubResponse::status(401),
    })
    .await;

    let local = LocalBackend::from_config(&local_config(&server)).unwrap();
    assert_eq!(local.fetch_config().await.unwrap()["site_name"], "Cabin");
    // The session is reused.
    local.fetch_config().await.unwrap();
    assert_eq!(server.hits(LOGIN), 1);

    let login = &server.requests()[0];
    assert_eq!(login.method, "POST");
    assert!(login.body.contains("owner@example.com"), "{}", login.body);
}

#[tokio::test]
async fn local_relogin_happens_only_once() {
    let server = StubServer::start(|req| match req.path.as_str() {
        LOGIN => StubResponse::json(200, json!({ "token": "revoked" })),
        _ => StubResponse::status(401),
    })
    .await;

    let local = LocalBackend::from_config(&local_config(&server)).unwrap();
    let err = local.fetch_config().await.unwrap_err();
    assert_eq!(err.kind(), "auth");
    assert_eq!(server.hits(LOGIN), 2);
    assert_eq!(server.hits(SITE_INFO), 2);
}

#[tokio::test]
async fn site_api_unwraps_response_and_discovers_the_site() {
    let server = StubServer::start(|req| {
        if req.header("authorization") != Some("Bearer cloud-token") {
            return StubResponse::status(401);
        }
        match req.path.as_str() {
            "/api/1/products" => StubResponse::json(
                200,
                json!({ "response": [{ "id": 1, "vin": "CAR" }, { "energy_site_id": 42 }] }),
            ),
            "/api/1/energy_sites/42/site_info" => {
                StubResponse::json(200, json!({ "response": { "site_name": "Home" } }))
            }
            _ => StubResponse::status(404),
        }
    })
    .await;

    let api = site_api(&server, None);
    assert_eq!(api.fetch_config().await.unwrap(), json!({ "site_name": "Home" }));
    api.fetch_config().await.unwrap();
    assert_eq!(server.hits("/api/1/products"), 1);
}

#[tokio::test]
async fn site_api_reply_without_response_is_a_protocol_error() {
    let server = StubServer::start(|_| StubResponse::json(200, json!({ "error": null })))
        .await;

    let err = site_api(&server, Some(7)).fetch_status().await.unwrap_err();
    assert!(matches!(err, GatewayError::Protocol(_)), "{err}");
    assert!(err.to_string().contains("no response field"), "{err}");
}

#[tokio::test]
async fn rate_limit_quarantines_the_resource() {
    let live_calls = Arc::new(AtomicUsize::new(0));
    let counter = live_calls.clone();
    let server = StubServer::start(move |req| match req.path.as_str() {
        "/api/1/energy_sites/7/live_status" => {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                StubResponse::json(429, json!({ "error": "too many requests" }))
                    .with_header("Retry-After", "30")
            } else {
                StubResponse::json(200, json!({ "response": { "percentage_charged": 64.0 } }))
            }
        }
        "/api/1/energy_sites/7/site_info" => {
            StubResponse::json(200, json!({ "response": { "site_name": "Home" } }))
        }
        _ => StubResponse::status(404),
    })
    .await;

    let clock = ManualClock::new();
    let gateway = Gateway::with_backend(
        Backend::Cloud(site_api(&server, Some(7))),
        &Config::default(),
        Arc::new(clock.clone()),
    );

    let err = gateway.poll(Resource::Status, None).await.unwrap_err();
    match err {
        GatewayError::Overload { retry_after, .. } => {
            assert_eq!(retry_after, Some(Duration::from_secs(30)))
        }
        other => panic!("expected overload, got {other}"),
    }

    // Cooling down: no request leaves, and nothing is made up.
    let reading = gateway.poll(Resource::Status, None).await.unwrap();
    assert!(reading.is_absent());
    assert_eq!(live_calls.load(Ordering::SeqCst), 1);
    assert_eq!(gateway.health().endpoints["status"].quarantine_skips, 1);

    // Other resources are still served.
    let config = gateway.poll(Resource::Config, None).await.unwrap();
    assert_eq!(config.freshness(), "live");

    clock.advance(Duration::from_secs(30));
    let reading = gateway.poll(Resource::Status, None).await.unwrap();
    assert_eq!(reading.freshness(), "live");
    assert_eq!(reading.value().unwrap()["percentage_charged"], 64.0);
    assert_eq!(live_calls.load(Ordering::SeqCst), 2);
}
