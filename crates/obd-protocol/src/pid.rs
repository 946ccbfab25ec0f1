//! Standard OBD-II PID Definitions
//!
//! Service 01 parameters with their reply sizes and decoding formulas.
//! The polling engine itself treats PIDs as opaque codes; this table is used
//! by the simulated ECU and by hosts that want ready-made formulas.

use crate::mode;
use serde::{Deserialize, Serialize};

/// Offset of the positive response service byte (request service + 0x40)
pub const POSITIVE_RESPONSE_OFFSET: u8 = 0x40;

/// Bytes preceding the data bytes in a single-frame reply: length, service, PID
pub const REPLY_HEADER_LEN: usize = 3;

/// Standard OBD-II PIDs for Mode 01 (current data)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Pid {
    /// Engine RPM (0x0C)
    Rpm = 0x0C,
    /// Vehicle speed (0x0D)
    Speed = 0x0D,
    /// Engine coolant temperature (0x05)
    CoolantTemp = 0x05,
    /// Calculated engine load (0x04)
    EngineLoad = 0x04,
    /// Mass air flow rate (0x10)
    Maf = 0x10,
    /// Short-term fuel trim bank 1 (0x06)
    ShortFuelTrim = 0x06,
    /// Long-term fuel trim bank 1 (0x07)
    LongFuelTrim = 0x07,
    /// Oxygen sensor voltage bank 1, sensor 1 (0x14)
    O2Voltage = 0x14,
    /// Intake manifold absolute pressure (0x0B)
    IntakeManifoldPressure = 0x0B,
    /// Throttle position (0x11)
    ThrottlePosition = 0x11,
}

impl Pid {
    /// All known PIDs
    pub const ALL: [Pid; 10] = [
        Pid::Rpm,
        Pid::Speed,
        Pid::CoolantTemp,
        Pid::EngineLoad,
        Pid::Maf,
        Pid::ShortFuelTrim,
        Pid::LongFuelTrim,
        Pid::O2Voltage,
        Pid::IntakeManifoldPressure,
        Pid::ThrottlePosition,
    ];

    /// Look up a PID by its single-byte code
    pub fn from_code(code: u8) -> Option<Pid> {
        Self::ALL.iter().copied().find(|pid| pid.as_hex() == code)
    }

    /// Get the PID hex value
    pub fn as_hex(&self) -> u8 {
        *self as u8
    }

    /// Request code including the service byte (e.g. `0x010C`)
    pub fn request_code(&self) -> u32 {
        ((mode::CURRENT_DATA as u32) << 8) | self.as_hex() as u32
    }

    /// Get the number of data bytes in the reply for this PID
    pub fn response_bytes(&self) -> usize {
        match self {
            Pid::Rpm | Pid::Maf | Pid::O2Voltage => 2,
            _ => 1,
        }
    }

    /// Minimum reply payload length, header included
    pub fn reply_length(&self) -> usize {
        REPLY_HEADER_LEN + self.response_bytes()
    }

    /// Decode a full reply payload (`len 41 pid A [B]`) using the standard formula
    pub fn decode(&self, payload: &[u8]) -> Option<f64> {
        let data = payload.get(REPLY_HEADER_LEN..)?;
        let a = *data.first()? as f64;
        let value = match self {
            // RPM: ((A*256)+B)/4
            Pid::Rpm => (a * 256.0 + *data.get(1)? as f64) / 4.0,
            // Speed: A (km/h)
            Pid::Speed => a,
            // Coolant Temp: A - 40 (°C)
            Pid::CoolantTemp => a - 40.0,
            // Engine Load / Throttle: A * 100 / 255 (%)
            Pid::EngineLoad | Pid::ThrottlePosition => a * 100.0 / 255.0,
            // MAF: ((A*256)+B) / 100 (g/s)
            Pid::Maf => (a * 256.0 + *data.get(1)? as f64) / 100.0,
            // Short/Long fuel trim: (A - 128) * 100 / 128 (%)
            Pid::ShortFuelTrim | Pid::LongFuelTrim => (a - 128.0) * 100.0 / 128.0,
            // O2 Voltage: A / 200 (V)
            Pid::O2Voltage => a / 200.0,
            // Intake manifold pressure: A (kPa)
            Pid::IntakeManifoldPressure => a,
        };
        Some(value)
    }
}
