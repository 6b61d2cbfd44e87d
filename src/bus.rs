use std::fs;
use std::io::{ErrorKind, Write};
use std::path::PathBuf;

use log::{info, warn};

use crate::config::SpiConfig;
use crate::error::AttachError;

/// Transfer parameters for one bus/chip-select binding, fixed at attach
/// time and applied to the device node when the peripheral is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralDescriptor {
    pub bus: u8,
    pub chip_select: u8,
    pub speed_hz: u32,
    pub mode: u8,
    pub bits_per_word: u8,
}

impl PeripheralDescriptor {
    pub fn from_config(cfg: &SpiConfig) -> Self {
        PeripheralDescriptor {
            bus: cfg.bus,
            chip_select: cfg.chip_select,
            speed_hz: cfg.speed_hz,
            mode: cfg.mode,
            bits_per_word: cfg.bits_per_word,
        }
    }

    /// Canonical identity of the (controller, chip-select) pair; the key
    /// under which the slot is claimed.
    pub fn identity(&self) -> String {
        format!("spi{}.{}", self.bus, self.chip_select)
    }
}

/// Boundary to the platform bus layer, one method per attachment step so
/// callers and tests can observe each step independently. Controller and
/// descriptor references must be balanced by the matching release call.
pub trait BusSubsystem: Send + Sync {
    /// Confirm the controller for `bus` exists and take a reference on it.
    fn find_controller(&self, bus: u8) -> Result<(), AttachError>;

    fn release_controller(&self, bus: u8);

    /// Allocate a peripheral descriptor slot on the controller.
    fn alloc_descriptor(&self, bus: u8) -> Result<(), AttachError>;

    fn release_descriptor(&self, desc: &PeripheralDescriptor);

    /// Name of the driver currently claiming `identity`, if any.
    fn claimed_by(&self, identity: &str) -> Option<String>;

    /// Record the claim for `identity` and bind the descriptor to the bus.
    fn register(
        &self,
        identity: &str,
        driver_name: &str,
        desc: &PeripheralDescriptor,
    ) -> Result<(), AttachError>;
}

/// Borrowed controller reference, released on every exit path.
struct ControllerRef<'a> {
    bus: &'a dyn BusSubsystem,
    index: u8,
}

impl Drop for ControllerRef<'_> {
    fn drop(&mut self) {
        self.bus.release_controller(self.index);
    }
}

/// Claim the configured bus/chip-select slot for `driver_name`.
///
/// Idempotent: re-invocation when the slot is already ours succeeds
/// without a second registration, and a slot held under a different
/// driver name is never stolen.
pub fn attach(
    bus: &dyn BusSubsystem,
    cfg: &SpiConfig,
    driver_name: &str,
) -> Result<(), AttachError> {
    bus.find_controller(cfg.bus)?;
    let _controller = ControllerRef { bus, index: cfg.bus };

    bus.alloc_descriptor(cfg.bus)?;
    let desc = PeripheralDescriptor::from_config(cfg);
    let identity = desc.identity();

    match bus.claimed_by(&identity) {
        Some(owner) if owner != driver_name => {
            bus.release_descriptor(&desc);
            warn!("slot {} is held by driver '{}'", identity, owner);
            Err(AttachError::SlotClaimedByOther {
                identity,
                driver: owner,
            })
        }
        Some(_) => {
            // Re-entry after a restart: the claim is already ours.
            bus.release_descriptor(&desc);
            info!("slot {} already registered to this driver", identity);
            Ok(())
        }
        None => {
            if let Err(err) = bus.register(&identity, driver_name, &desc) {
                bus.release_descriptor(&desc);
                return Err(err);
            }
            info!(
                "registered {} at {} Hz, mode {}",
                identity, desc.speed_hz, desc.mode
            );
            Ok(())
        }
    }
}

/// Platform bus layer backed by spidev device nodes, with slot claims
/// recorded as files in a runtime directory so independent driver
/// processes cannot take the same bus/chip-select pair.
pub struct LinuxBus {
    dev_root: PathBuf,
    claim_dir: PathBuf,
}

impl LinuxBus {
    pub fn new(dev_root: impl Into<PathBuf>, claim_dir: impl Into<PathBuf>) -> Self {
        LinuxBus {
            dev_root: dev_root.into(),
            claim_dir: claim_dir.into(),
        }
    }

    /// The live system layout: nodes under /dev, claims under the
    /// daemon's runtime directory.
    pub fn system(runtime_dir: impl Into<PathBuf>) -> Self {
        Self::new("/dev", runtime_dir)
    }

    pub fn device_node(&self, desc: &PeripheralDescriptor) -> PathBuf {
        self.dev_root
            .join(format!("spidev{}.{}", desc.bus, desc.chip_select))
    }

    fn claim_path(&self, identity: &str) -> PathBuf {
        self.claim_dir.join(format!("{}.claim", identity))
    }
}

impl BusSubsystem for LinuxBus {
    fn find_controller(&self, bus: u8) -> Result<(), AttachError> {
        // A controller is visible through the device nodes it exposes.
        let prefix = format!("spidev{}.", bus);
        let entries = fs::read_dir(&self.dev_root).map_err(|_| AttachError::NoSuchBus(bus))?;
        for entry in entries.flatten() {
            if entry.file_name().to_string_lossy().starts_with(&prefix) {
                return Ok(());
            }
        }
        Err(AttachError::NoSuchBus(bus))
    }

    fn release_controller(&self, _bus: u8) {}

    fn alloc_descriptor(&self, _bus: u8) -> Result<(), AttachError> {
        fs::create_dir_all(&self.claim_dir).map_err(|_| AttachError::AllocationFailed)
    }

    fn release_descriptor(&self, _desc: &PeripheralDescriptor) {}

    fn claimed_by(&self, identity: &str) -> Option<String> {
        fs::read_to_string(self.claim_path(identity))
            .ok()
            .map(|s| s.trim().to_string())
    }

    fn register(
        &self,
        identity: &str,
        driver_name: &str,
        _desc: &PeripheralDescriptor,
    ) -> Result<(), AttachError> {
        // create_new loses exactly one race against a concurrent claimant.
        let path = self.claim_path(identity);
        match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                writeln!(file, "{}", driver_name)
                    .map_err(|e| AttachError::RegistrationFailed(raw_code(&e)))?;
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let driver = self.claimed_by(identity).unwrap_or_default();
                Err(AttachError::SlotClaimedByOther {
                    identity: identity.to_string(),
                    driver,
                })
            }
            Err(e) => Err(AttachError::RegistrationFailed(raw_code(&e))),
        }
    }
}

fn raw_code(err: &std::io::Error) -> i32 {
    err.raw_os_error().unwrap_or(-1)
}
