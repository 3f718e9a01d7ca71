//! CLI entry point for rf_bench
//!
//! Loads the bench configuration, connects every enabled instrument and
//! serves the remote-control socket until Ctrl-C.
//!
//! ```bash
//! rf_bench --config config/bench.example.toml --port 5006
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use rf_bench::config::BenchConfig;
use rf_bench::remote::RemoteServer;
use rf_bench::telemetry::{self, TracingConfig};
use rf_bench::Bench;
use std::path::PathBuf;
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "rf_bench")]
#[command(about = "RF test bench controller with remote task control", long_about = None)]
struct Cli {
    /// Bench configuration file (TOML)
    #[arg(long, default_value = "config/bench.toml")]
    config: PathBuf,

    /// Override the configured log level
    #[arg(long)]
    log_level: Option<String>,

    /// Override the remote-control port
    #[arg(long)]
    port: Option<u16>,

    /// Override the remote-control bind address
    #[arg(long)]
    address: Option<String>,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = BenchConfig::load_from(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    if let Some(level) = cli.log_level {
        config.application.log_level = level;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(address) = cli.address {
        config.server.address = address;
    }

    if cli.print_config {
        print!("{}", config.to_toml_string().context("rendering configuration")?);
        return Ok(());
    }

    let tracing_config = TracingConfig::from_bench_config(&config).map_err(anyhow::Error::msg)?;
    telemetry::init(tracing_config).map_err(anyhow::Error::msg)?;
    info!(name = %config.application.name, instruments = config.instruments.len(), "rf_bench starting");

    let bench = Bench::from_config(&config)
        .await
        .context("bringing up instruments")?;

    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    if config.server.enabled {
        let addr = format!("{}:{}", config.server.address, config.server.port);
        let server = RemoteServer::bind(addr.as_str(), bench.manager().clone())
            .await
            .with_context(|| format!("binding remote control to {}", addr))?;
        server.run_until(shutdown).await;
    } else {
        info!("remote control disabled; waiting for Ctrl-C");
        shutdown.await;
    }

    info!("shutdown requested");
    for snapshot in bench.shutdown().await {
        info!(task = %snapshot.id, state = %snapshot.state, "task ended");
    }
    Ok(())
}
