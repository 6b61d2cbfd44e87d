use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{info, warn};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::sleep;

use crate::bus::{self, LinuxBus, PeripheralDescriptor};
use crate::config::Config;
use crate::indicator::{GpioIndicator, Indicator, MemoryIndicator};
use crate::spi::SpidevPort;
use crate::transfer::Driver;

/// Name under which this driver claims its bus slot. A slot claimed
/// under any other name is left alone.
pub const DRIVER_NAME: &str = "spi-link";

/// Owns the driver context and bridges the platform bus to it: claims
/// the slot at startup, then mirrors device-node hotplug into
/// `on_attach`/`on_detach` notifications.
pub struct Daemon {
    config: Mutex<Config>,
    bus: LinuxBus,
    driver: Arc<Driver>,
    indicator: Arc<dyn Indicator>,
    shutdown_tx: watch::Sender<bool>,
}

impl Daemon {
    pub fn new(config: Config) -> Result<Self> {
        let bus = LinuxBus::system(&config.runtime_dir);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let driver = Arc::new(Driver::new(shutdown_rx));

        let indicator: Arc<dyn Indicator> = match GpioIndicator::new(config.indicator.pin) {
            Ok(gpio) => Arc::new(gpio),
            Err(err) => {
                warn!(
                    "GPIO pin {} unavailable ({}), using in-memory indicator",
                    config.indicator.pin, err
                );
                Arc::new(MemoryIndicator::default())
            }
        };

        Ok(Daemon {
            config: Mutex::new(config),
            bus,
            driver,
            indicator,
            shutdown_tx,
        })
    }

    /// Claim our bus slot. Fatal on failure; the device node must not be
    /// exposed without a registered slot.
    pub fn attach(&self) -> Result<()> {
        let spi = self.config.lock().spi.clone();
        bus::attach(&self.bus, &spi, DRIVER_NAME).context("bus attachment failed")?;
        Ok(())
    }

    /// One monitor pass: bind or unbind the peripheral to match what the
    /// bus currently exposes, then sleep for the polling interval.
    pub async fn poll(&self) -> Result<()> {
        let (spi, interval_ms) = {
            let config = self.config.lock();
            (config.spi.clone(), config.polling.interval_ms)
        };
        let desc = PeripheralDescriptor::from_config(&spi);
        let node = self.bus.device_node(&desc);

        let node_present = node.exists();
        let attached = self.driver.is_attached().await;

        if node_present && !attached {
            match SpidevPort::open(&node, &desc) {
                Ok(port) => match self.driver.on_attach(Arc::new(port)).await {
                    Ok(()) => info!("peripheral ready on {}", desc.identity()),
                    Err(err) => warn!("attach notification dropped: {}", err),
                },
                Err(err) => warn!("cannot open {}: {:#}", desc.identity(), err),
            }
        } else if !node_present && attached {
            match self.driver.on_detach().await {
                Ok(()) => info!("peripheral removed from {}", desc.identity()),
                Err(err) => warn!("detach notification dropped: {}", err),
            }
        }

        sleep(Duration::from_millis(interval_ms)).await;
        Ok(())
    }

    pub fn driver(&self) -> Arc<Driver> {
        self.driver.clone()
    }

    pub fn indicator(&self) -> Arc<dyn Indicator> {
        self.indicator.clone()
    }

    /// Interrupt every pending bus-lock wait and refuse new ones.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn reload_config(&self, new_config: Config) -> Result<()> {
        new_config.validate()?;
        *self.config.lock() = new_config;
        info!("Configuration reloaded successfully");
        Ok(())
    }
}
