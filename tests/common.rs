//! Test utilities & fixtures.
//! An in-memory gateway controller and a few fetch helpers shared by the
//! integration tests.
#![allow(dead_code)]

use bytes::Bytes;
use powergate::backend::device::{DeviceTransport, TransportFuture};
use powergate::error::{GatewayError, Result};
use powergate::protocol::ProtocolCodec;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub const DIN: &str = "1232100-00-E--TG0000000001";

pub const CONFIG_JSON: &str = r#"{"battery_blocks":[{"vin":"A"},{"vin":"B"}],"site_info":{"site_name":"Test Site"}}"#;

pub const STATUS_JSON: &str = r#"{
  "control": {
    "systemStatus": {"nominalFullPackEnergyWh": 27000.0, "nominalEnergyRemainingWh": 20250.0},
    "islanding": {"customerIslandMode": "Wait", "contactorClosed": true, "microGridOK": true, "gridOK": true},
    "meterAggregates": [{"location": "LOAD", "realPowerW": 950.0}, {"location": "SOLAR", "realPowerW": 2100.0}],
    "alerts": {"active": []}
  },
  "system": {"updateUrgencyCheck": {"version": {"version": "24.12.1"}}}
}"#;

/// In-memory controller: decodes every request envelope and answers with the
/// configured documents, echoing the request marker.
#[derive(Debug)]
pub struct FakeDevice {
    pub din: String,
    pub delay: Duration,
    /// Added to the echoed marker; non-zero simulates a mismatched reply.
    pub marker_skew: AtomicU32,
    pub offline: AtomicBool,
    pub exchanges: AtomicUsize,
    pub din_lookups: AtomicUsize,
}

impl FakeDevice {
    pub fn new() -> Self {
        Self {
            din: DIN.to_string(),
            delay: Duration::ZERO,
            marker_skew: AtomicU32::new(0),
            offline: AtomicBool::new(false),
            exchanges: AtomicUsize::new(0),
            din_lookups: AtomicUsize::new(0),
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::new()
        }
    }

    pub fn exchanges(&self) -> usize {
        self.exchanges.load(Ordering::SeqCst)
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }
}

impl DeviceTransport for FakeDevice {
    fn fetch_din(&self) -> TransportFuture<'_, String> {
        Box::pin(async move {
            self.din_lookups.fetch_add(1, Ordering::SeqCst);
            Ok(self.din.clone())
        })
    }

    fn exchange(&self, body: Bytes) -> TransportFuture<'_, Vec<u8>> {
        Box::pin(async move {
            self.exchanges.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.offline.load(Ordering::SeqCst) {
                return Err(GatewayError::Transport("connection refused".into()));
            }
            let view = ProtocolCodec::decode_request(&body)?;
            let marker = view.marker + self.marker_skew.load(Ordering::SeqCst);
            let reply = match view.config_file {
                Some(file) => {
                    ProtocolCodec::encode_config_response(&self.din, marker, &file, CONFIG_JSON)
                }
                None => ProtocolCodec::encode_query_response(&self.din, marker, STATUS_JSON),
            };
            Ok(reply)
        })
    }
}

/// Counts invocations of a fetch function.
#[derive(Debug, Clone, Default)]
pub struct CallCounter(Arc<AtomicUsize>);

impl CallCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bump the counter and return the new call number (1-based).
    pub fn hit(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

pub fn transport_error() -> GatewayError {
    GatewayError::Transport("connection refused".into())
}

pub async fn failing_fetch(counter: CallCounter) -> Result<u32> {
    counter.hit();
    Err(transport_error())
}

pub async fn ok_fetch(counter: CallCounter, value: u32) -> Result<u32> {
    counter.hit();
    Ok(value)
}

/// One request as seen by [`StubServer`]. Header names are lowercased.
#[derive(Debug, Clone)]
pub struct StubRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl StubRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct StubResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl StubResponse {
    pub fn json(status: u16, body: serde_json::Value) -> Self {
        Self {
            status,
            headers: vec![("Content-Type".into(), "application/json".into())],
            body: body.to_string(),
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

type Handler = Arc<dyn Fn(&StubRequest) -> StubResponse + Send + Sync>;

/// Minimal HTTP/1.1 server on 127.0.0.1. Every connection carries one request
/// and is closed after the scripted response.
pub struct StubServer {
    pub addr: SocketAddr,
    requests: Arc<Mutex<Vec<StubRequest>>>,
}

impl StubServer {
    pub async fn start<H>(handler: H) -> Self
    where
        H: Fn(&StubRequest) -> StubResponse + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let handler: Handler = Arc::new(handler);
        let log = requests.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let handler = handler.clone();
                let log = log.clone();
                tokio::spawn(async move {
                    serve(stream, handler, log).await;
                });
            }
        });
        Self { addr, requests }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn requests(&self) -> Vec<StubRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Number of requests seen for `path`.
    pub fn hits(&self, path: &str) -> usize {
        self.requests().iter().filter(|r| r.path == path).count()
    }
}

async fn serve(mut stream: TcpStream, handler: Handler, log: Arc<Mutex<Vec<StubRequest>>>) {
    let Some(request) = read_request(&mut stream).await else {
        return;
    };
    log.lock().unwrap().push(request.clone());
    let response = handler(&request);

    let mut head = format!("HTTP/1.1 {} Stub\r\n", response.status);
    for (name, value) in &response.headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str(&format!(
        "Content-Length: {}\r\nConnection: close\r\n\r\n",
        response.body.len()
    ));
    let _ = stream.write_all(head.as_bytes()).await;
    let _ = stream.write_all(response.body.as_bytes()).await;
    let _ = stream.shutdown().await;
}

async fn read_request(stream: &mut TcpStream) -> Option<StubRequest> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 2048];
    let header_end = loop {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.split("\r\n");
    let mut first = lines.next()?.split_whitespace();
    let method = first.next()?.to_string();
    let path = first.next()?.to_string();
    let headers: Vec<(String, String)> = lines
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            Some((name.trim().to_ascii_lowercase(), value.trim().to_string()))
        })
        .collect();

    let length = headers
        .iter()
        .find(|(k, _)| k == "content-length")
        .and_then(|(_, v)| v.parse::<usize>().ok())
        .unwrap_or(0);
    while buf.len() < header_end + length {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let end = buf.len().min(header_end + length);
    let body = String::from_utf8_lossy(&buf[header_end..end]).to_string();

    Some(StubRequest {
        method,
        path,
        headers,
        body,
    })
}
