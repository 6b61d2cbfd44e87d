//! Userspace driver for a single SPI-attached peripheral.
//!
//! Claims one bus/chip-select slot, serializes every full-duplex
//! exchange through a shared transfer buffer pair, frames writes with a
//! one-byte length header and mirrors activity on a status LED.

pub mod bus;
pub mod config;
pub mod daemon;
pub mod error;
pub mod indicator;
pub mod node;
pub mod session;
pub mod spi;
pub mod transfer;

// Re-export main types for convenience
pub use bus::{attach, BusSubsystem, LinuxBus, PeripheralDescriptor};
pub use daemon::{Daemon, DRIVER_NAME};
pub use error::{AttachError, TransferError};
pub use indicator::{GpioIndicator, Indicator, MemoryIndicator};
pub use session::{frame_payload, Session, MAX_WRITE_LEN};
pub use transfer::{Driver, PeripheralPort, SPI_BUFFER_SIZE};
