//! PID Request State Machine
//!
//! One periodic request/response cycle: transmit every `interval`, wait up
//! to `timeout` for a reply of at least `reply_length` bytes on the response
//! identifier, then hand the payload to every consumer.

use crate::consumer::FrameConsumer;
use crate::error::ConfigError;
use obd_protocol::{default_response_id, format_id, max_id, CanFrame, MAX_EXTENDED_ID};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default period between transmissions
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

/// Default response window
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);

/// Default minimum reply length (one classic CAN frame)
pub const DEFAULT_REPLY_LENGTH: usize = 8;

/// Definition of a PID request before validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidRequestSpec {
    /// Identifier the request is sent on
    pub can_id: u32,
    /// PID code including the service byte (e.g. `0x010C`)
    pub pid: u32,
    /// Reply identifier; `can_id | 0x8` when unset
    pub response_can_id: Option<u32>,
    /// 29-bit identifiers for request and reply
    pub use_extended_id: bool,
    /// Minimum period between transmissions
    pub interval: Duration,
    /// Maximum wait for a reply after each transmission
    pub timeout: Duration,
    /// Minimum payload length of an acceptable reply
    pub reply_length: usize,
}

impl PidRequestSpec {
    /// Spec with default timing and reply length
    pub fn new(can_id: u32, pid: u32) -> Self {
        Self {
            can_id,
            pid,
            response_can_id: None,
            use_extended_id: false,
            interval: DEFAULT_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
            reply_length: DEFAULT_REPLY_LENGTH,
        }
    }
}

/// Position in the request/response cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// No outstanding request
    Idle,
    /// Request sent, waiting until `deadline`
    AwaitingResponse { deadline: Instant },
}

/// What happened to a payload offered to a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseOutcome {
    /// No round in progress; frame belongs to someone else
    NotAwaiting,
    /// Payload shorter than `reply_length`; still waiting
    TooShort,
    /// Round completed and consumers ran
    Accepted,
}

/// Per-request counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollStats {
    /// Requests handed to the transport
    pub transmissions: u64,
    /// Rounds completed by a valid reply
    pub responses: u64,
    /// Rounds abandoned at the deadline
    pub timeouts: u64,
    /// Replies discarded for being too short
    pub short_frames: u64,
    /// Transmission slots lost to transport errors
    pub send_failures: u64,
}

/// A configured PID request and its round state
pub struct PidRequest {
    can_id: u32,
    pid: u32,
    response_id: u32,
    use_extended_id: bool,
    interval: Duration,
    timeout: Duration,
    reply_length: usize,

    state: RequestState,
    /// Time of the last transmission attempt, or of engine start
    last_sent: Option<Instant>,
    stats: PollStats,
    label: String,

    extractors: Vec<Box<dyn FrameConsumer>>,
    triggers: Vec<Box<dyn FrameConsumer>>,
}

impl PidRequest {
    /// Validate a spec and fix the response identifier
    pub fn new(spec: PidRequestSpec) -> Result<Self, ConfigError> {
        check_range("can_id", spec.can_id, MAX_EXTENDED_ID)?;
        check_range("pid", spec.pid, MAX_EXTENDED_ID)?;
        let response_id = match spec.response_can_id {
            Some(id) => {
                check_range("response_can_id", id, MAX_EXTENDED_ID)?;
                id
            }
            None => default_response_id(spec.can_id),
        };
        if !spec.use_extended_id {
            for (field, id) in [("can_id", spec.can_id), ("response_can_id", response_id)] {
                if id > max_id(false) {
                    warn!(
                        "Pid 0x{:04X}: {} 0x{:X} does not fit an 11-bit identifier",
                        spec.pid, field, id
                    );
                }
            }
        }
        if spec.reply_length == 0 {
            return Err(ConfigError::ReplyLength);
        }

        Ok(Self {
            can_id: spec.can_id,
            pid: spec.pid,
            response_id,
            use_extended_id: spec.use_extended_id,
            interval: spec.interval,
            timeout: spec.timeout,
            reply_length: spec.reply_length,
            state: RequestState::Idle,
            last_sent: None,
            stats: PollStats::default(),
            label: format!("0x{:04X}", spec.pid),
            extractors: Vec::new(),
            triggers: Vec::new(),
        })
    }

    /// Identifier requests are sent on
    pub fn can_id(&self) -> u32 {
        self.can_id
    }

    /// PID code
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Identifier replies are expected on
    pub fn response_id(&self) -> u32 {
        self.response_id
    }

    /// Whether 29-bit identifiers are used
    pub fn use_extended_id(&self) -> bool {
        self.use_extended_id
    }

    /// Transmission period
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Response window
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Minimum accepted reply length
    pub fn reply_length(&self) -> usize {
        self.reply_length
    }

    /// Current round state
    pub fn state(&self) -> RequestState {
        self.state
    }

    /// Whether a round is in progress
    pub fn is_awaiting(&self) -> bool {
        matches!(self.state, RequestState::AwaitingResponse { .. })
    }

    /// Counters since creation
    pub fn stats(&self) -> PollStats {
        self.stats
    }

    /// Number of registered extractors and triggers
    pub fn consumer_count(&self) -> (usize, usize) {
        (self.extractors.len(), self.triggers.len())
    }

    pub(crate) fn add_extractor(&mut self, consumer: Box<dyn FrameConsumer>) {
        self.extractors.push(consumer);
    }

    pub(crate) fn add_trigger(&mut self, consumer: Box<dyn FrameConsumer>) {
        self.triggers.push(consumer);
    }

    /// Start the interval clock if it is not running yet
    pub(crate) fn arm(&mut self, now: Instant) {
        self.last_sent.get_or_insert(now);
    }

    /// Whether `interval` has elapsed since the last transmission
    pub fn is_due(&self, now: Instant) -> bool {
        self.last_sent
            .map(|sent| now.saturating_duration_since(sent) >= self.interval)
            .unwrap_or(false)
    }

    /// Abandon the round if its deadline has passed
    pub fn expire(&mut self, now: Instant) -> bool {
        match self.state {
            RequestState::AwaitingResponse { deadline } if now >= deadline => {
                self.state = RequestState::Idle;
                self.stats.timeouts += 1;
                metrics::counter!("obd_poll_timeouts_total", "pid" => self.label.clone())
                    .increment(1);
                debug!(
                    "Timeout polling {} for pid {}",
                    format_id(self.can_id, self.use_extended_id),
                    self.label
                );
                true
            }
            _ => false,
        }
    }

    /// Request frame for this PID
    pub fn request_frame(&self) -> CanFrame {
        CanFrame::pid_request(self.can_id, self.use_extended_id, self.pid)
    }

    /// Record a successful transmission and open the response window
    pub(crate) fn mark_sent(&mut self, now: Instant) {
        if self.is_awaiting() {
            debug!("Pid {} re-sent while awaiting, response window restarted", self.label);
        }
        self.state = RequestState::AwaitingResponse {
            deadline: now + self.timeout,
        };
        self.last_sent = Some(now);
        self.stats.transmissions += 1;
        metrics::counter!("obd_requests_sent_total", "pid" => self.label.clone()).increment(1);
    }

    /// Record a lost transmission slot; the next try is one interval later
    pub(crate) fn mark_send_failed(&mut self, now: Instant) {
        self.last_sent = Some(now);
        self.stats.send_failures += 1;
        metrics::counter!("obd_send_failures_total", "pid" => self.label.clone()).increment(1);
    }

    /// Drop any round in progress
    pub(crate) fn reset(&mut self) {
        self.state = RequestState::Idle;
    }

    /// Offer a payload received on the response identifier
    pub fn handle_response(&mut self, payload: &[u8]) -> ResponseOutcome {
        if !self.is_awaiting() {
            return ResponseOutcome::NotAwaiting;
        }

        if payload.len() < self.reply_length {
            self.stats.short_frames += 1;
            metrics::counter!("obd_short_frames_total", "pid" => self.label.clone()).increment(1);
            debug!(
                "Pid {}: discarding {} byte reply, need {}",
                self.label,
                payload.len(),
                self.reply_length
            );
            return ResponseOutcome::TooShort;
        }

        self.state = RequestState::Idle;
        self.stats.responses += 1;
        metrics::counter!("obd_responses_total", "pid" => self.label.clone()).increment(1);
        debug!("Received content for pid {}: {:02X?}", self.label, payload);

        for consumer in self.extractors.iter_mut().chain(self.triggers.iter_mut()) {
            let result = catch_unwind(AssertUnwindSafe(|| consumer.consume(payload)));
            if result.is_err() {
                metrics::counter!(
                    "obd_extraction_errors_total",
                    "sensor" => consumer.name().to_string()
                )
                .increment(1);
                warn!(
                    "Pid {}: consumer '{}' panicked on {:02X?}",
                    self.label,
                    consumer.name(),
                    payload
                );
            }
        }

        ResponseOutcome::Accepted
    }

    /// Print the request definition
    pub fn log_config(&self) {
        info!("PID Request {}", self.label);
        if self.use_extended_id {
            info!("  Can extended id: {}", format_id(self.can_id, true));
        } else {
            info!("  Can id: {}", format_id(self.can_id, false));
        }
        info!(
            "  Can response id: {}",
            format_id(self.response_id, self.use_extended_id)
        );
        info!("  Interval: {}ms", self.interval.as_millis());
        info!("  Timeout: {}ms", self.timeout.as_millis());
        info!("  Reply length: {}", self.reply_length);
        info!(
            "  Consumers: {} extractors, {} triggers",
            self.extractors.len(),
            self.triggers.len()
        );
    }
}

fn check_range(field: &'static str, value: u32, max: u32) -> Result<(), ConfigError> {
    if value > max {
        return Err(ConfigError::IdentifierOutOfRange { field, value, max });
    }
    Ok(())
}
