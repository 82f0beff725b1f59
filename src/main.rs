//! Admission gate server.
//!
//! # Architecture Overview
//!
//! ```text
//!                      ┌────────────────────────────────────────────────┐
//!                      │                 ADMISSION GATE                 │
//!   Client Request     │  ┌──────────┐   ┌───────────┐   ┌───────────┐  │
//!   ───────────────────┼─▶│  trace + │──▶│ admission │──▶│downstream │──┼──▶ Upstream
//!                      │  │request id│   │middleware │   │ forwarder │  │    API
//!                      │  └──────────┘   └─────┬─────┘   └───────────┘  │
//!                      │                       │ full                   │
//!                      │                       ▼                        │
//!   202 + position     │                 ┌───────────┐                  │
//!   ◀──────────────────┼─────────────────│FIFO queue │ drained one per  │
//!                      │                 └───────────┘ completion       │
//!                      │                                                │
//!                      │  exempt: /api/health, /api/debug/network-info, │
//!                      │          /api/admin/*, /api/queue/*            │
//!                      └────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;

use admission_gate::config::{load_config, GateConfig};
use admission_gate::lifecycle::{signals, Shutdown};
use admission_gate::observability::{logging, metrics};
use admission_gate::HttpServer;

#[derive(Parser)]
#[command(name = "admission-gate")]
#[command(about = "Concurrency-limiting admission gate with a FIFO overflow queue", long_about = None)]
struct Args {
    /// Path to a TOML config file. Defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => GateConfig::default(),
    };

    logging::init_logging(&config.observability);

    tracing::info!("admission-gate v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        config_file = ?args.config,
        bind_address = %config.listener.bind_address,
        upstream = %config.upstream.address,
        max_concurrent = config.admission.max_concurrent,
        retain_results = config.admission.retain_results,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let listener = TcpListener::bind(&config.listener.bind_address).await?;

    let shutdown = Shutdown::new();
    signals::spawn_signal_handler(&shutdown);

    let server = HttpServer::new(config)?;
    server.run(listener, shutdown.subscribe()).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
