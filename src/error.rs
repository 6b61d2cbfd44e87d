use thiserror::Error;

/// Attachment-time failures. Any of these abort driver startup; the
/// session interface is never exposed without a claimed bus slot.
#[derive(Debug, Error)]
pub enum AttachError {
    #[error("SPI controller {0} not present (is the bus driver loaded?)")]
    NoSuchBus(u8),

    #[error("controller has no free peripheral slot")]
    AllocationFailed,

    #[error("bus slot {identity} already claimed by driver '{driver}'")]
    SlotClaimedByOther { identity: String, driver: String },

    #[error("bus registration rejected with status {0}")]
    RegistrationFailed(i32),
}

/// Per-operation failures surfaced to session callers. All of these are
/// recoverable; none of them changes the attachment state.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransferError {
    #[error("no peripheral attached")]
    NotAttached,

    #[error("interrupted while waiting for the bus lock")]
    Interrupted,

    #[error("transfer of {requested} bytes exceeds buffer capacity {capacity}")]
    BufferOverflow { requested: usize, capacity: usize },

    #[error("bus transport failed with status {0}")]
    TransportError(i32),

    #[error("transfer buffer allocation failed")]
    AllocationExhausted,
}
