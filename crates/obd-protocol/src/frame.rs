//! CAN Frame Model and OBD-II Request Encoding

use serde::{Deserialize, Serialize};
use std::fmt;

/// Largest 11-bit (standard) identifier
pub const MAX_STANDARD_ID: u32 = 0x7FF;

/// Largest 29-bit (extended) identifier
pub const MAX_EXTENDED_ID: u32 = 0x1FFF_FFFF;

/// Offset between a physical request identifier and the ECU reply
pub const RESPONSE_ID_OFFSET: u32 = 0x8;

/// Data length of a classic CAN frame
pub const FRAME_LEN: usize = 8;

/// Filler for unused request bytes
pub const PADDING_BYTE: u8 = 0xAA;

/// A single CAN frame as seen by the polling engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanFrame {
    /// Arbitration identifier
    pub id: u32,
    /// 29-bit identifier format
    pub extended: bool,
    /// Payload bytes
    pub data: Vec<u8>,
}

impl CanFrame {
    /// Create a new frame
    pub fn new(id: u32, extended: bool, data: impl Into<Vec<u8>>) -> Self {
        Self {
            id,
            extended,
            data: data.into(),
        }
    }

    /// Build the single-frame OBD-II request for `pid`
    pub fn pid_request(id: u32, extended: bool, pid: u32) -> Self {
        Self::new(id, extended, encode_request(pid).to_vec())
    }
}

impl fmt::Display for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [", format_id(self.id, self.extended))?;
        for (i, byte) in self.data.iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            write!(f, "{:02X}", byte)?;
        }
        write!(f, "]")
    }
}

/// Highest identifier allowed for the given format
pub fn max_id(extended: bool) -> u32 {
    if extended {
        MAX_EXTENDED_ID
    } else {
        MAX_STANDARD_ID
    }
}

/// Conventional ECU reply identifier for a physical request identifier
pub fn default_response_id(request_id: u32) -> u32 {
    request_id | RESPONSE_ID_OFFSET
}

/// Format an identifier the way ECU documentation prints them
pub fn format_id(id: u32, extended: bool) -> String {
    if extended {
        format!("0x{:08X}", id)
    } else {
        format!("0x{:03X}", id)
    }
}

/// Encode a PID code into a single-frame request payload.
///
/// Byte 0 carries the count of significant bytes, followed by the code
/// big-endian (service byte included) and `0xAA` padding:
///
/// * `0x010C`   -> `02 01 0C AA AA AA AA AA`
/// * `0x22F190` -> `03 22 F1 90 AA AA AA AA`
pub fn encode_request(pid: u32) -> [u8; FRAME_LEN] {
    let width = match pid {
        0..=0xFFFF => 2,
        0x1_0000..=0xFF_FFFF => 3,
        _ => 4,
    };

    let mut data = [PADDING_BYTE; FRAME_LEN];
    data[0] = width as u8;
    let be = pid.to_be_bytes();
    data[1..=width].copy_from_slice(&be[4 - width..]);
    data
}
