//! Unified error type for sensorlink.
//!
//! We avoid `alloc` - all error variants carry only fixed-size data.
//! Implements `defmt::Format` (feature `defmt`) for efficient on-target logging.

use crate::ble::state::ConnectionState;

/// Top-level error type used across the library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    // BLE
    /// The radio stack refused or failed a command.
    Stack(StackError),

    /// The operation is not allowed in the current connection state.
    InvalidState(ConnectionState),

    /// Read/write attempted without a ready link (state, value handle
    /// and connection handle must all be present).
    NotReady,

    /// An event referenced a connection handle that is not our link.
    ForeignConnection(u16),

    /// Write payload exceeds a single ATT MTU payload.
    PayloadTooLarge { len: usize, max: usize },

    // Resources
    /// Not enough memory headroom to bring the radio up.
    InsufficientHeadroom { free: usize },

    // Peripheral side
    /// Advertising records do not fit in one legacy advertising PDU.
    AdvertisingOverflow,
}

/// Failures reported by the radio command surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StackError {
    /// Raw error code from the underlying stack.
    Raw(u32),
    /// Command queue full; try again later.
    Busy,
    /// The radio is deactivated.
    NotActive,
}

// Convenience conversions

impl From<StackError> for Error {
    fn from(e: StackError) -> Self {
        Error::Stack(e)
    }
}
