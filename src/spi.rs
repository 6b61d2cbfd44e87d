use std::path::Path;

use anyhow::{Context, Result};
use linux_embedded_hal::spidev::{SpiModeFlags, Spidev, SpidevOptions, SpidevTransfer};
use log::debug;
use parking_lot::Mutex;

use crate::bus::PeripheralDescriptor;
use crate::transfer::PeripheralPort;

/// Live spidev binding for one bus/chip-select pair.
pub struct SpidevPort {
    dev: Mutex<Spidev>,
    identity: String,
}

impl SpidevPort {
    /// Open the device node and apply the descriptor's transfer
    /// parameters.
    pub fn open(path: &Path, desc: &PeripheralDescriptor) -> Result<Self> {
        let mut dev = Spidev::open(path)
            .context(format!("Failed to open SPI device: {}", path.display()))?;
        let options = SpidevOptions::new()
            .bits_per_word(desc.bits_per_word)
            .max_speed_hz(desc.speed_hz)
            .mode(mode_flags(desc.mode))
            .build();
        dev.configure(&options)
            .context("Failed to configure SPI device")?;
        debug!(
            "configured {} at {} Hz, mode {}",
            desc.identity(),
            desc.speed_hz,
            desc.mode
        );
        Ok(SpidevPort {
            dev: Mutex::new(dev),
            identity: desc.identity(),
        })
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }
}

fn mode_flags(mode: u8) -> SpiModeFlags {
    match mode {
        1 => SpiModeFlags::SPI_MODE_1,
        2 => SpiModeFlags::SPI_MODE_2,
        3 => SpiModeFlags::SPI_MODE_3,
        _ => SpiModeFlags::SPI_MODE_0,
    }
}

impl PeripheralPort for SpidevPort {
    fn exchange(&self, tx: &[u8], rx: &mut [u8]) -> Result<(), i32> {
        let mut xfer = SpidevTransfer::read_write(tx, rx);
        let mut dev = self.dev.lock();
        dev.transfer(&mut xfer)
            .map_err(|err| err.raw_os_error().unwrap_or(-1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_flags_map() {
        assert_eq!(mode_flags(0).bits(), SpiModeFlags::SPI_MODE_0.bits());
        assert_eq!(mode_flags(1).bits(), SpiModeFlags::SPI_MODE_1.bits());
        assert_eq!(mode_flags(2).bits(), SpiModeFlags::SPI_MODE_2.bits());
        assert_eq!(mode_flags(3).bits(), SpiModeFlags::SPI_MODE_3.bits());
    }
}
