//! Tunnel Demo: host application for the tunnel coordinator
//!
//! Stands in for the mobile UI: reads bridge commands as JSON lines on
//! stdin and writes responses and `ConnectionStateChanged` events as JSON
//! lines on stdout. A line of the form `fetch <url>` resolves the proxy
//! configuration for that destination the way the host networking layer
//! would, on a blocking thread. Logs go to stderr.
//!
//! ```text
//! $ tunnel-demo [coordinator.toml]
//! {"command":"AddListener","event":"ConnectionStateChanged"}
//! {"command":"StartTunnel","config":"{\"LocalSocksProxyPort\":1080}"}
//! fetch https://ipinfo.io/json
//! {"command":"StopTunnel"}
//! ```

mod engine;

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use tunnel_core::{CoordinatorConfig, TunnelCoordinator};

// Use mimalloc as the global allocator
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();

    info!("Tunnel demo starting...");

    let config = match std::env::args().nth(1) {
        Some(path) => CoordinatorConfig::from_toml_file(Path::new(&path))
            .with_context(|| format!("loading coordinator config from {}", path))?,
        None => CoordinatorConfig::default(),
    };

    let coordinator = Arc::new(
        TunnelCoordinator::new(config, Arc::new(engine::simulated_factory))
            .context("building tunnel coordinator")?,
    );
    coordinator.set_reset_hook(|state| {
        info!("Connection pool reset ({})", state);
    });

    let (events_tx, events_rx) = crossbeam_channel::unbounded();
    let bridge = coordinator.bridge(events_tx);

    let printer = std::thread::Builder::new()
        .name("event-printer".to_string())
        .spawn(move || {
            for event in events_rx {
                match serde_json::to_string(&event) {
                    Ok(line) => println!("{}", line),
                    Err(e) => warn!("Failed to encode event: {}", e),
                }
            }
        })
        .context("spawning event printer")?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(url) = line.strip_prefix("fetch ") {
            let url = url.trim().to_string();
            let coordinator = coordinator.clone();
            // The accessor blocks while the tunnel is in a transient state
            tokio::task::spawn_blocking(move || {
                let config = coordinator.configuration_for_url(&url);
                let reply = serde_json::json!({
                    "fetch": url,
                    "route": config.to_string(),
                    "proxy": config.proxy_url(),
                });
                println!("{}", reply);
            });
            continue;
        }

        println!("{}", bridge.handle_json(line).await);
    }

    info!("Input closed");
    coordinator.shutdown().await;
    drop(bridge);
    drop(coordinator);
    let _ = printer.join();

    info!("Tunnel demo shutting down");
    Ok(())
}
