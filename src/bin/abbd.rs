//! ABB Driver - command stream over the RAPID motion server
//!
//! - Connects the motion and logger channels
//! - Pushes units, tool, workobject, speed and zone from the config
//! - Streams line commands from stdin, printing JSON status lines
//! - Disconnects on `quit`, end of input or Ctrl+C

use abbd::{CommandStream, ConsoleObserver, DriverConfig, LoggingObserver, Session, TelemetryObserver};
use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, Level};

#[derive(Parser)]
#[command(name = "abbd")]
#[command(about = "ABB robot driver - streams commands to the RAPID motion server")]
#[command(version)]
struct Args {
    /// Path to the driver configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Print telemetry records as JSON lines on stdout
    #[arg(long)]
    telemetry_json: bool,

    /// Log at debug level (every frame sent and received)
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn get_config_path(&self) -> String {
        self.config
            .clone()
            .or_else(|| std::env::var("ABBD_CONFIG").ok())
            .unwrap_or_else(|| "config/abbd.yaml".to_string())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config_path = args.get_config_path();

    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::INFO })
        .with_writer(std::io::stderr)
        .init();

    info!("ABB Robot Driver");
    info!("{}", "=".repeat(50));
    info!("Using config: {}", config_path);

    let config = DriverConfig::load_from_path(&config_path)
        .with_context(|| format!("Failed to load config {}", config_path))?;

    let observer: Arc<dyn TelemetryObserver> = if args.telemetry_json {
        Arc::new(ConsoleObserver)
    } else {
        Arc::new(LoggingObserver)
    };

    let mut session = match Session::connect_with_config(&config, observer).await {
        Ok(session) => session,
        Err(e) => {
            error!("Robot connection failed: {}", e);
            error!("Make sure:");
            error!("   - The RAPID server task is running on the controller");
            error!("   - {} and {} are reachable", config.motion_endpoint(), config.telemetry_endpoint());
            return Err(e.into());
        }
    };

    if let Err(e) = session.apply_defaults(&config).await {
        error!("Failed to apply motion defaults: {}", e);
        session.close().await.context("Failed during shutdown")?;
        return Err(e.into());
    }
    info!("Robot ready for commands!");

    let mut stream = CommandStream::new(session);
    let run_result = stream.run().await;
    if let Err(e) = &run_result {
        error!("Command stream error: {}", e);
    }

    info!("Performing graceful shutdown");
    stream.shutdown().await?;
    info!("Shutdown complete");
    run_result
}
