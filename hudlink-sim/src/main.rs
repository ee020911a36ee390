//! HUDLink simulator — entry point.
//!
//! ```text
//! hudlink-sim                    Run the default scenario for 15 s
//! hudlink-sim --config <path>    Load a custom config TOML
//! hudlink-sim --duration <secs>  Change how long the operator walks
//! hudlink-sim --gen-config       Write default config to stdout
//! hudlink-sim --scan             List real USB peripherals (`usb` feature)
//! ```

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use hudlink_core::format_for_hud;
use hudlink_sim::config::SimConfig;
use hudlink_sim::service::SimService;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "hudlink-sim", about = "Stream CoT telemetry to a simulated HUD")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "hudlink-sim.toml")]
    config: PathBuf,

    /// Seconds to keep streaming once connected.
    #[arg(short, long, default_value_t = 15)]
    duration: u64,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,

    /// List attached USB peripherals and their compatible drivers, then exit.
    #[cfg(feature = "usb")]
    #[arg(long)]
    scan: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        let text = toml::to_string_pretty(&SimConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let config = SimConfig::load(&cli.config);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("hudlink-sim v{}", env!("CARGO_PKG_VERSION"));

    #[cfg(feature = "usb")]
    if cli.scan {
        scan(&config);
        return Ok(());
    }
    info!(
        "device {} ({}), rate {}",
        config.scenario.device, config.scenario.product_name, config.streaming.rate
    );

    let shutdown = CancellationToken::new();
    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received Ctrl+C, shutting down...");
            ctrl_c.cancel();
        }
    });

    let service = SimService::new(config);
    let report = service
        .run(Duration::from_secs(cli.duration), shutdown)
        .await?;

    println!("── Summary ──────────────────────────────────");
    println!("connection: {}", report.status_line);
    if let Some(reason) = report.failure() {
        println!("failure:    {reason}");
    }
    println!(
        "stream:     {} sent, {} partial, {} failed, {} skipped",
        report.stream.sent, report.stream.partial, report.stream.failed, report.stream.skipped
    );
    println!(
        "HUD:        {} decoded, {} garbled",
        report.messages.len(),
        report.garbled
    );
    if let Some(last) = report.messages.last() {
        println!("last frame:\n{}", format_for_hud(last));
    }
    Ok(())
}

#[cfg(feature = "usb")]
fn scan(config: &SimConfig) {
    use std::sync::Arc;

    use hudlink_core::{DriverRegistry, NusbHost, UsbHost};

    let host: Arc<dyn UsbHost> = Arc::new(NusbHost::new());
    let registry = DriverRegistry::with_defaults(host.clone(), &config.driver);
    for device in host.enumerate() {
        let drivers: Vec<String> = registry
            .compatible(&device)
            .map(|p| p.name().to_string())
            .collect();
        println!("{}", device.summary());
        if !drivers.is_empty() {
            println!("  drivers: {}", drivers.join(", "));
        }
    }
}
