//! Scheduler Error Types

use thiserror::Error;

/// Configuration errors, detected before polling starts
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// Identifier outside the range allowed for its format
    #[error("{field} 0x{value:X} is out of range (max 0x{max:X})")]
    IdentifierOutOfRange {
        field: &'static str,
        value: u32,
        max: u32,
    },

    /// Reply length must be a positive byte count
    #[error("reply_length must be at least 1 byte")]
    ReplyLength,

    /// Response window longer than the poll period
    #[error("PID request '{id}': timeout {timeout_ms}ms exceeds interval {interval_ms}ms")]
    TimeoutExceedsInterval {
        id: String,
        timeout_ms: u64,
        interval_ms: u64,
    },

    /// Both or neither extraction modes configured
    #[error("sensor '{0}': configure exactly one of lambda or index")]
    ExtractionMode(String),

    /// Index composition supports 1 to 4 bytes
    #[error("index list must hold 1 to 4 entries, got {0}")]
    IndexCount(usize),

    /// Mask does not fit a byte
    #[error("sensor '{name}': mask 0x{mask:X} does not fit in one byte")]
    MaskOutOfRange { name: String, mask: u32 },

    /// Expression failed to compile
    #[error("invalid expression '{expression}': {reason}")]
    InvalidExpression { expression: String, reason: String },

    /// Two PID requests share an id
    #[error("duplicate PID request id '{0}'")]
    DuplicateId(String),

    /// Sensor references a PID request that does not exist
    #[error("sensor '{sensor}' references unknown PID request '{pid_id}'")]
    UnknownPid { sensor: String, pid_id: String },

    /// Trigger log level not recognised
    #[error("trigger '{trigger}': unknown log level '{level}'")]
    LogLevel { trigger: String, level: String },

    /// Configuration source could not be read or parsed
    #[error("failed to load configuration: {0}")]
    Load(String),
}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        ConfigError::Load(err.to_string())
    }
}

/// Errors from engine registration calls
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    /// Registration attempted after polling started
    #[error("engine already started, registration is closed")]
    AlreadyStarted,

    /// Handle does not belong to this engine
    #[error("unknown PID request handle {0}")]
    UnknownRequest(usize),

    /// Rejected PID request definition
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Failure of a single extractor invocation
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExtractError {
    /// Payload is shorter than a configured byte index
    #[error("byte index {index} out of bounds for payload of {len} bytes")]
    IndexOutOfBounds { index: usize, len: usize },

    /// Expression evaluation failed
    #[error("expression evaluation failed: {0}")]
    Expression(String),

    /// Expression produced a value of the wrong kind
    #[error("unexpected expression result: {0}")]
    UnexpectedType(String),

    /// Reported by a custom extractor
    #[error("{0}")]
    Custom(String),

    /// Custom extractor panicked
    #[error("custom extractor panicked")]
    Panicked,
}
