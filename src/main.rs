use anyhow::{Context, Result};
use log::{error, info};
use std::fs;
use std::path::Path;
use tokio::signal::unix::{signal, SignalKind};

use spi_link_controller::config::Config;
use spi_link_controller::daemon::Daemon;
use spi_link_controller::node::DeviceNode;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logger();

    // Parse command line arguments
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/spi-link/config.yaml".to_string());

    info!("SPI link controller starting...");
    info!("Loading configuration from: {}", config_path);

    let config = load_config(&config_path)?;
    info!("Configuration loaded successfully");

    let daemon = Daemon::new(config.clone())?;

    // Claim the bus slot before exposing anything to callers.
    if let Err(e) = daemon.attach() {
        error!("Startup attachment failed: {:#}", e);
        return Err(e);
    }

    let node = DeviceNode::bind(
        Path::new(&config.node.socket),
        daemon.driver(),
        daemon.indicator(),
    )?;
    tokio::spawn(async move {
        if let Err(e) = node.serve().await {
            error!("Device node error: {:#}", e);
        }
    });

    // Setup signal handling via tokio
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to setup SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to setup SIGINT handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("Failed to setup SIGHUP handler")?;

    info!("Daemon started successfully");

    loop {
        tokio::select! {
            result = daemon.poll() => {
                if let Err(e) = result {
                    error!("Daemon poll error: {}", e);
                    return Err(e);
                }
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down gracefully");
                break;
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down gracefully");
                break;
            }
            _ = sighup.recv() => {
                info!("Received SIGHUP, reloading configuration");
                match load_config(&config_path) {
                    Ok(new_config) => {
                        daemon.reload_config(new_config)?;
                        info!("Configuration reloaded successfully");
                    }
                    Err(e) => error!("Configuration reload failed: {:#}", e),
                }
            }
        }
    }

    daemon.shutdown();
    info!("SPI link controller shutdown complete");
    Ok(())
}

fn load_config(path: &str) -> Result<Config> {
    let content = fs::read_to_string(path)
        .context(format!("Failed to read config file: {}", path))?;
    let config: Config =
        serde_yaml::from_str(&content).context("Failed to parse configuration file")?;
    config.validate()?;
    Ok(config)
}

fn init_logger() {
    // Use `env_logger` for logging. Systemd/journald will capture stdout/stderr.
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();
}
