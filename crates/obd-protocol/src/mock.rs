//! Mock and Simulated Transports
//!
//! Used by tests and by the poller when no CAN hardware is attached.

use crate::error::TransportError;
use crate::frame::{default_response_id, CanFrame, FRAME_LEN, PADDING_BYTE};
use crate::mode;
use crate::pid::{Pid, POSITIVE_RESPONSE_OFFSET};
use crate::transport::{CanTransport, FrameSink};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

/// Transport that records every frame and can be told to fail
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    sent: Arc<Mutex<Vec<CanFrame>>>,
    failure: Arc<Mutex<Option<TransportError>>>,
}

impl MockTransport {
    /// Create a recording transport
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent send fail with `error` (or succeed with `None`)
    pub fn fail_with(&self, error: Option<TransportError>) {
        *lock(&self.failure) = error;
    }

    /// Snapshot of all frames sent so far
    pub fn sent_frames(&self) -> Vec<CanFrame> {
        lock(&self.sent).clone()
    }

    /// Number of frames sent so far
    pub fn sent_count(&self) -> usize {
        lock(&self.sent).len()
    }
}

impl CanTransport for MockTransport {
    fn send(&mut self, frame: &CanFrame) -> Result<(), TransportError> {
        if let Some(error) = lock(&self.failure).clone() {
            return Err(error);
        }
        if frame.data.len() > FRAME_LEN {
            return Err(TransportError::PayloadTooLong(frame.data.len()));
        }
        lock(&self.sent).push(frame.clone());
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// ECU simulator answering service 01 requests for the standard PID table
pub struct SimulatedEcu {
    /// Where replies are delivered, as a real adapter's receive path would
    sink: FrameSink,
    /// Number of requests seen, mixed into the generated values
    requests: u64,
}

impl SimulatedEcu {
    /// Create a simulator replying through `sink`
    pub fn new(sink: FrameSink) -> Self {
        info!("Creating simulated ECU transport");
        Self { sink, requests: 0 }
    }

    /// Build the reply for a request frame, if the simulator knows the PID
    pub fn reply_to(&self, request: &CanFrame) -> Option<CanFrame> {
        let data = &request.data;
        if data.len() < 3 || data[0] != 0x02 || data[1] != mode::CURRENT_DATA {
            return None;
        }
        let pid = Pid::from_code(data[2])?;

        let mut hasher = DefaultHasher::new();
        self.requests.hash(&mut hasher);
        pid.hash(&mut hasher);
        let hash = hasher.finish();

        let value_bytes = sample_bytes(pid, hash);
        let mut payload = vec![PADDING_BYTE; FRAME_LEN];
        payload[0] = (2 + value_bytes.len()) as u8;
        payload[1] = mode::CURRENT_DATA + POSITIVE_RESPONSE_OFFSET;
        payload[2] = pid.as_hex();
        payload[3..3 + value_bytes.len()].copy_from_slice(&value_bytes);

        Some(CanFrame::new(
            default_response_id(request.id),
            request.extended,
            payload,
        ))
    }
}

impl CanTransport for SimulatedEcu {
    fn send(&mut self, frame: &CanFrame) -> Result<(), TransportError> {
        self.requests += 1;
        match self.reply_to(frame) {
            Some(reply) => {
                debug!("Simulated ECU reply {}", reply);
                if !self.sink.deliver_frame(reply) {
                    debug!("Simulated ECU reply dropped");
                }
            }
            None => debug!("Simulated ECU ignoring {}", frame),
        }
        Ok(())
    }
}

/// Pseudo-random but plausible raw bytes for a PID
fn sample_bytes(pid: Pid, hash: u64) -> Vec<u8> {
    match pid {
        // RPM: 800-3500 RPM range
        Pid::Rpm => {
            let rpm = 800 + (hash % 2700) as u16;
            (rpm * 4).to_be_bytes().to_vec()
        }
        // Speed: 0-120 km/h
        Pid::Speed => vec![(hash % 120) as u8],
        // Coolant temp: 70-105°C (stored as value + 40)
        Pid::CoolantTemp => vec![(110 + (hash % 35)) as u8],
        // Engine load / throttle: 20-80% of 255
        Pid::EngineLoad | Pid::ThrottlePosition => vec![(51 + (hash % 153)) as u8],
        // MAF: 5-50 g/s
        Pid::Maf => (500 + (hash % 4500) as u16).to_be_bytes().to_vec(),
        // Fuel trims: -10% to +10%
        Pid::ShortFuelTrim | Pid::LongFuelTrim => vec![(115 + (hash % 26)) as u8],
        // O2 voltage: 0.1-0.9V
        Pid::O2Voltage => vec![(20 + (hash % 160)) as u8, 0xFF],
        // MAP: 20-100 kPa
        Pid::IntakeManifoldPressure => vec![(20 + (hash % 80)) as u8],
    }
}
