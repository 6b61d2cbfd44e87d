use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub spi: SpiConfig,
    pub indicator: IndicatorConfig,
    pub polling: PollingConfig,
    pub node: NodeConfig,
    /// Directory holding bus-slot claim files.
    pub runtime_dir: String,
}

/// Transfer parameters for the one bus/chip-select pair this driver
/// serves. Applied to the peripheral descriptor at attach time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpiConfig {
    pub bus: u8,
    pub chip_select: u8,
    pub speed_hz: u32,
    pub mode: u8,
    pub bits_per_word: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorConfig {
    /// GPIO pin driving the status LED.
    pub pin: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Hotplug monitor pass interval.
    pub interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Where the device-node socket is bound.
    pub socket: String,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.spi.speed_hz > 0, "spi.speed_hz must be non-zero");
        ensure!(self.spi.mode <= 3, "spi.mode must be 0..=3");
        ensure!(
            self.spi.bits_per_word == 8,
            "only 8-bit words are supported"
        );
        ensure!(
            self.polling.interval_ms > 0,
            "polling.interval_ms must be non-zero"
        );
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            spi: SpiConfig {
                bus: 4,
                chip_select: 0,
                speed_hz: 10_000,
                mode: 0,
                bits_per_word: 8,
            },
            indicator: IndicatorConfig { pin: 23 },
            polling: PollingConfig { interval_ms: 100 },
            node: NodeConfig {
                socket: "/run/spi-link/spi-link.sock".to_string(),
            },
            runtime_dir: "/run/spi-link".to_string(),
        }
    }
}
