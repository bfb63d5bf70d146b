//! # Powergate - Resilient Energy Gateway Client
//!
//! Powergate reads telemetry from, and sends control changes to, a residential
//! energy-storage gateway over one of four transports: the legacy local REST API,
//! the vendor cloud API, the Fleet API, or the binary device protocol spoken to
//! the gateway's embedded controller.
//!
//! ## Features
//!
//! - **Backend Selection**: Explicit choice or priority-ordered probing at startup; the chosen transport never changes afterwards.
//! - **Single-Flight Cache**: Concurrent reads of the same resource share one outbound call and a short TTL cache.
//! - **Health Tracking**: Consecutive real failures flip the client into degraded mode; consecutive successes flip it back.
//! - **Graceful Degradation**: While degraded, last-known-good values are served and marked stale, never invented.
//! - **Overload Quarantine**: A rate-limit signal keeps the affected resource away from the backend for a cooldown.
//! - **Async Design**: Built with Tokio; no global state, everything hangs off one [`gateway::Gateway`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use powergate::config::Config;
//! use powergate::gateway::{Gateway, Resource};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut config = Config::load("powergate.toml").await?;
//!     config.apply_env_overrides();
//!
//!     let gateway = Gateway::connect(&config).await?;
//!     let reading = gateway.poll(Resource::Status, None).await?;
//!     println!("{} {:?}", reading.freshness(), reading.value());
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`gateway`] - Public entry point tying a backend to the resilience core
//! - [`resilience`] - Coalescer, health monitor, degradation cache, quarantine, stats
//! - [`backend`] - The four transports and the backend selector
//! - [`protocol`] - Binary envelope codec for the device protocol
//! - [`config`] - Configuration loading and validation
//! - [`error`] - Error taxonomy
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │     Gateway     │ ← poll / commands / health
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │ ResilienceCore  │ ← coalescing, health, fallback
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │     Backend     │ ← local / cloud / fleetapi / device protocol
//! └─────────────────┘
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod gateway;
pub mod logutil;
pub mod protocol;
pub mod resilience;

pub use error::{GatewayError, Result};
pub use gateway::{Gateway, Resource};
pub use resilience::{HealthReport, Reading};
