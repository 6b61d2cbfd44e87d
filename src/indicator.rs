use anyhow::{Context, Result};
use parking_lot::Mutex;
use rppal::gpio::{Gpio, OutputPin};

/// Externally owned boolean status device. The driver only reads and
/// flips it; requesting and releasing the underlying pin belongs to
/// whoever constructs the implementation.
pub trait Indicator: Send + Sync {
    fn get_state(&self) -> bool;
    fn set_state(&self, on: bool);
}

/// Status LED on a GPIO output pin.
pub struct GpioIndicator {
    pin: Mutex<OutputPin>,
}

impl GpioIndicator {
    pub fn new(pin_number: u8) -> Result<Self> {
        let gpio = Gpio::new().context("Failed to open GPIO controller")?;
        let mut pin = gpio
            .get(pin_number)
            .context(format!("Failed to request GPIO pin {}", pin_number))?
            .into_output();
        pin.set_low();
        Ok(GpioIndicator {
            pin: Mutex::new(pin),
        })
    }
}

impl Indicator for GpioIndicator {
    fn get_state(&self) -> bool {
        self.pin.lock().is_set_high()
    }

    fn set_state(&self, on: bool) {
        let mut pin = self.pin.lock();
        if on {
            pin.set_high();
        } else {
            pin.set_low();
        }
    }
}

/// In-memory stand-in used by tests and by hosts without a usable GPIO
/// controller.
#[derive(Default)]
pub struct MemoryIndicator {
    state: Mutex<bool>,
}

impl Indicator for MemoryIndicator {
    fn get_state(&self) -> bool {
        *self.state.lock()
    }

    fn set_state(&self, on: bool) {
        *self.state.lock() = on;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_indicator_toggles() {
        let led = MemoryIndicator::default();
        assert!(!led.get_state());
        led.set_state(true);
        assert!(led.get_state());
        led.set_state(false);
        assert!(!led.get_state());
    }
}
