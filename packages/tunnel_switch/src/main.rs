use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use tunnel_switch::serial::DeviceOpener;
use tunnel_switch::{System, load_config};

#[derive(Parser)]
#[command(name = "tunnel-switch")]
#[command(about = "Share serial DCEs among several DTE terminals")]
struct Args {
    /// Configuration file (JSON or TOML)
    #[arg(short, long, default_value = "tunnel.json")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_directive = if args.debug {
        "tunnel_switch=debug,tunnel_core=debug,info"
    } else {
        "tunnel_switch=info,tunnel_core=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let config = load_config(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;

    if args.check {
        let tunnels = config.build().context("Invalid configuration")?;
        println!(
            "{}: {} serials, {} tunnels",
            args.config.display(),
            config.serial.len(),
            tunnels.len()
        );
        for t in &tunnels {
            let dtes: Vec<String> = t.dtes().iter().map(|e| e.id().to_string()).collect();
            println!(
                "  tunnel {} ({}): DCE {} <- DTE [{}]",
                t.id(),
                t.description(),
                t.dce().id(),
                dtes.join(", ")
            );
        }
        return Ok(());
    }

    info!("Starting tunnel switch with {}", args.config.display());
    let system = System::start(&config, Arc::new(DeviceOpener))
        .await
        .context("Failed to start tunnels")?;

    tunnel_switch::system::wait_for_signal().await;

    let reports = system.shutdown().await;
    for report in &reports {
        let tunnel = report.tunnel.map(|t| t.to_string()).unwrap_or_default();
        if report.is_clean() {
            info!(
                "Tunnel {} stopped ({} loops, {} endpoints)",
                tunnel,
                report.loops_stopped,
                report.endpoints_stopped.len()
            );
        } else {
            warn!(
                "Tunnel {} stopped with failed endpoints {:?}, unresponsive endpoints {:?} and unresponsive loops {:?}",
                tunnel,
                report.endpoints_failed,
                report.endpoints_unresponsive,
                report.loops_unresponsive
            );
        }
    }
    info!("Shutdown complete");
    Ok(())
}
