//! CAN Transport Error Types

use thiserror::Error;

/// Errors reported by a transport adapter when a frame cannot be sent
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Controller entered bus-off state
    #[error("CAN bus off")]
    BusOff,

    /// Transmit queue of the controller is full
    #[error("CAN transmit queue full")]
    TxQueueFull,

    /// Payload does not fit a classic CAN frame
    #[error("Payload of {0} bytes exceeds CAN frame capacity")]
    PayloadTooLong(usize),

    /// Adapter is gone or was never opened
    #[error("CAN adapter disconnected")]
    Disconnected,

    /// Driver specific failure
    #[error("CAN driver error: {0}")]
    Driver(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Driver(err.to_string())
    }
}
