//! OBD-II over CAN Protocol Primitives
//!
//! This crate provides the CAN frame model, identifier conventions, OBD-II
//! single-frame request encoding and the transport adapter seam used by the
//! polling engine. Mock and simulated transports are included for tests and
//! bench setups without hardware.

mod error;
mod frame;
mod mock;
mod pid;
mod transport;

pub use error::TransportError;
pub use frame::{
    default_response_id, encode_request, format_id, max_id, CanFrame, FRAME_LEN,
    MAX_EXTENDED_ID, MAX_STANDARD_ID, PADDING_BYTE, RESPONSE_ID_OFFSET,
};
pub use mock::{MockTransport, SimulatedEcu};
pub use pid::{Pid, POSITIVE_RESPONSE_OFFSET, REPLY_HEADER_LEN};
pub use transport::{frame_channel, CanTransport, FrameSink, FrameSource, DEFAULT_QUEUE_CAPACITY};

/// OBD-II service constants
pub mod mode {
    /// Current data
    pub const CURRENT_DATA: u8 = 0x01;
}
