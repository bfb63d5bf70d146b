//! Binary entrypoint for the powergate CLI.
//!
//! Commands:
//! - `init` - write a starter `powergate.toml`
//! - `probe` - run backend selection and print the chosen backend
//! - `poll <status|config|vitals> [--ttl <s>]` - print one reading with its freshness
//! - `health` - poll every resource once, then print the health report
//!
//! See the library crate docs for module-level details: `powergate::`.
use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use log::{debug, info, warn};
use serde_json::json;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use powergate::config::Config;
use powergate::logutil::redact;
use powergate::gateway::{Gateway, Resource};
use powergate::resilience::Reading;

#[derive(Parser)]
#[command(name = "powergate")]
#[command(about = "Resilient client for a residential energy-storage gateway")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "powergate.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init,
    /// Select a backend by probing and report which one answered
    Probe,
    /// Read one resource through the resilience core
    Poll {
        /// status, config or vitals
        resource: String,
        /// Cache TTL in seconds (defaults to the configured TTL)
        #[arg(long)]
        ttl: Option<u64>,
    },
    /// Poll every resource once and print the health report
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Init = cli.command {
        init_logging(None, cli.verbose);
        if Path::new(&cli.config).exists() {
            return Err(anyhow!("{} already exists; not overwriting", cli.config));
        }
        Config::create_default(&cli.config).await?;
        info!("Wrote default configuration to {}", cli.config);
        println!("Created {}", cli.config);
        return Ok(());
    }

    let mut config = if Path::new(&cli.config).exists() {
        Config::load(&cli.config).await?
    } else {
        Config::default()
    };
    config.apply_env_overrides();
    init_logging(Some(&config), cli.verbose);
    if !Path::new(&cli.config).exists() {
        warn!(
            "{} not found; using defaults and environment overrides",
            cli.config
        );
    }
    info!("Starting powergate v{}", env!("CARGO_PKG_VERSION"));
    debug!(
        "Gateway {} (secret {}), cloud token {}, fleet token {}",
        config.gateway.host,
        redact(&config.gateway.password),
        redact(&config.cloud.access_token),
        redact(&config.fleetapi.access_token)
    );
    let gateway = Gateway::connect(&config).await?;

    match cli.command {
        // Handled before the gateway was built
        Commands::Init => {}
        Commands::Probe => {
            let out = json!({
                "backend": gateway.backend_kind(),
                "candidates": config.backend.candidates()?,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        Commands::Poll { resource, ttl } => {
            let resource = Resource::parse(&resource)
                .ok_or_else(|| anyhow!("Unknown resource '{}'", resource))?;
            let reading = gateway
                .poll(resource, ttl.map(Duration::from_secs))
                .await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&render(resource, &reading))?
            );
        }
        Commands::Health => {
            for resource in Resource::ALL {
                if let Err(e) = gateway.poll(resource, None).await {
                    warn!("Polling {} failed: {}", resource, e);
                }
            }
            println!("{}", serde_json::to_string_pretty(&gateway.health())?);
        }
    }
    Ok(())
}

fn render(resource: Resource, reading: &Reading<serde_json::Value>) -> serde_json::Value {
    json!({
        "resource": resource.key(),
        "freshness": reading.freshness(),
        "age_ms": reading.age().map(|a| a.as_millis() as u64),
        "value": reading.value(),
    })
}

fn init_logging(config: Option<&Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides the configured level
    let base_level = match verbosity {
        0 => config
            .and_then(|c| log::LevelFilter::from_str(&c.logging.level).ok())
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);

    let log_file = config
        .and_then(|c| c.logging.file.as_ref())
        .and_then(|path| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok()
        });

    if let Some(f) = log_file {
        let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
        // Echo to the console only when attached to a terminal
        let is_tty = atty::is(atty::Stream::Stdout);
        builder.format(move |fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            let line = format!("{} [{}] {}", ts, record.level(), record.args());
            if let Ok(mut guard) = write_mutex.lock() {
                let _ = writeln!(guard, "{}", line);
            }
            if is_tty {
                writeln!(fmt, "{}", line)
            } else {
                Ok(())
            }
        });
    } else {
        builder.format(|fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
        });
    }
    let _ = builder.try_init();
}
