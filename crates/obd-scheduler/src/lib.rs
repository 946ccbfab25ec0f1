//! OBD-II PID Polling Engine
//!
//! Schedules periodic PID requests over a shared CAN bus, matches the
//! asynchronous replies back to the request that caused them and fans the
//! payload out to independent consumers (numeric sensors, boolean sensors,
//! triggers).

mod consumer;
mod engine;
mod error;
mod extract;
mod request;
mod settings;

pub use consumer::{FrameConsumer, Sensor, SensorValue, Trigger};
pub use engine::{PidHandle, PollingEngine};
pub use error::{ConfigError, EngineError, ExtractError};
pub use extract::{
    compose, BinaryExtractor, CustomFn, Expression, Extract, NumericExtractor, MAX_COMPOSED_BYTES,
};
pub use request::{
    PidRequest, PidRequestSpec, PollStats, RequestState, ResponseOutcome, DEFAULT_INTERVAL,
    DEFAULT_REPLY_LENGTH, DEFAULT_TIMEOUT,
};
pub use settings::{
    BinarySensorConfig, ObdConfig, PidRequestConfig, PollerSetup, SensorConfig, TriggerConfig,
};

/// Configuration file formats accepted by [`ObdConfig::from_text`]
pub use config::FileFormat;
