//! Declarative Configuration
//!
//! PID requests and their sensors are declared in a config file (TOML,
//! YAML or JSON) and turned into a ready-to-run [`PollingEngine`].
//!
//! ```toml
//! enabled_by_default = true
//!
//! [[pids]]
//! id = "engine_rpm"
//! can_id = 0x7E0
//! pid = 0x010C
//! interval_ms = 1000
//! timeout_ms = 200
//! reply_length = 5
//!
//! [[sensors]]
//! name = "rpm"
//! pid_id = "engine_rpm"
//! lambda = "(b3 * 256 + b4) / 4.0"
//! ```

use crate::consumer::SensorValue;
use crate::engine::{PidHandle, PollingEngine};
use crate::error::{ConfigError, EngineError};
use crate::extract::{BinaryExtractor, NumericExtractor};
use crate::request::{
    PidRequest, PidRequestSpec, DEFAULT_INTERVAL, DEFAULT_REPLY_LENGTH, DEFAULT_TIMEOUT,
};
use config::{Config, Environment, File, FileFormat};
use obd_protocol::{CanTransport, DEFAULT_QUEUE_CAPACITY};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn, Level};

/// Top level poller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObdConfig {
    /// Start transmitting as soon as the engine runs
    pub enabled_by_default: bool,
    /// Host tick period in milliseconds
    pub tick_interval_ms: u64,
    /// Depth of the inbound frame queue
    pub inbound_queue_capacity: usize,
    /// Prometheus listener address, e.g. "0.0.0.0:9000"
    pub metrics_addr: Option<String>,
    /// PID request definitions
    pub pids: Vec<PidRequestConfig>,
    /// Numeric sensors
    pub sensors: Vec<SensorConfig>,
    /// Boolean sensors
    pub binary_sensors: Vec<BinarySensorConfig>,
}

impl Default for ObdConfig {
    fn default() -> Self {
        Self {
            enabled_by_default: false,
            tick_interval_ms: 50,
            inbound_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            metrics_addr: None,
            pids: Vec::new(),
            sensors: Vec::new(),
            binary_sensors: Vec::new(),
        }
    }
}

/// One PID request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PidRequestConfig {
    /// Name sensors refer to
    pub id: String,
    /// Request identifier
    pub can_id: u32,
    /// PID code including service byte
    pub pid: u32,
    /// Reply identifier, `can_id | 0x8` when omitted
    #[serde(default)]
    pub response_can_id: Option<u32>,
    /// 29-bit identifiers
    #[serde(default)]
    pub use_extended_id: bool,
    /// Poll period (ms)
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Response window (ms)
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Minimum reply length in bytes
    #[serde(default = "default_reply_length")]
    pub reply_length: usize,
    /// Triggers fired with the raw payload of every completed round
    #[serde(default)]
    pub on_frame: Vec<TriggerConfig>,
}

/// Trigger declared on a PID request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    pub name: String,
    /// Log the payload at this level; `off` keeps it quiet
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Publish the raw payload under `name`
    #[serde(default)]
    pub publish: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TriggerConfig {
    /// Parsed log level, `None` when logging is off
    pub fn level(&self) -> Result<Option<Level>, ConfigError> {
        if self.log_level.eq_ignore_ascii_case("off") {
            return Ok(None);
        }
        self.log_level
            .parse::<Level>()
            .map(Some)
            .map_err(|_| ConfigError::LogLevel {
                trigger: self.name.clone(),
                level: self.log_level.clone(),
            })
    }

    /// Build the trigger action and, when publishing, the receiver it feeds
    fn action(
        &self,
    ) -> Result<(impl FnMut(&[u8]) + Send + 'static, Option<SensorValue<Vec<u8>>>), ConfigError>
    {
        let level = self.level()?;
        let (state, value) = if self.publish {
            let (state, value) = watch::channel(None);
            (Some(state), Some(value))
        } else {
            (None, None)
        };
        let name = self.name.clone();

        let action = move |payload: &[u8]| {
            if let Some(level) = level {
                log_payload(level, &name, payload);
            }
            if let Some(state) = &state {
                state.send_replace(Some(payload.to_vec()));
            }
        };
        Ok((action, value))
    }
}

fn log_payload(level: Level, name: &str, payload: &[u8]) {
    if level == Level::ERROR {
        error!("Trigger '{}': {:02X?}", name, payload);
    } else if level == Level::WARN {
        warn!("Trigger '{}': {:02X?}", name, payload);
    } else if level == Level::INFO {
        info!("Trigger '{}': {:02X?}", name, payload);
    } else if level == Level::DEBUG {
        debug!("Trigger '{}': {:02X?}", name, payload);
    } else {
        trace!("Trigger '{}': {:02X?}", name, payload);
    }
}

fn default_interval_ms() -> u64 {
    DEFAULT_INTERVAL.as_millis() as u64
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT.as_millis() as u64
}

fn default_reply_length() -> usize {
    DEFAULT_REPLY_LENGTH
}

impl PidRequestConfig {
    /// Engine-level request definition
    pub fn to_spec(&self) -> PidRequestSpec {
        PidRequestSpec {
            can_id: self.can_id,
            pid: self.pid,
            response_can_id: self.response_can_id,
            use_extended_id: self.use_extended_id,
            interval: Duration::from_millis(self.interval_ms),
            timeout: Duration::from_millis(self.timeout_ms),
            reply_length: self.reply_length,
        }
    }
}

/// Numeric sensor fed by a PID request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    pub name: String,
    pub pid_id: String,
    /// Treat the first indexed byte as signed
    #[serde(default)]
    pub signed: bool,
    #[serde(default)]
    pub lambda: Option<String>,
    /// 1 to 4 byte indices, composed big-endian
    #[serde(default)]
    pub index: Option<Vec<usize>>,
}

impl SensorConfig {
    /// Build the configured extractor
    pub fn extractor(&self) -> Result<NumericExtractor, ConfigError> {
        match (&self.lambda, &self.index) {
            (Some(lambda), None) => NumericExtractor::expression(lambda),
            (None, Some(indices)) => NumericExtractor::composed(indices.clone(), self.signed),
            _ => Err(ConfigError::ExtractionMode(self.name.clone())),
        }
    }
}

/// Boolean sensor fed by a PID request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinarySensorConfig {
    pub name: String,
    pub pid_id: String,
    #[serde(default)]
    pub lambda: Option<String>,
    #[serde(default)]
    pub index: Option<usize>,
    #[serde(default)]
    pub mask: Option<u32>,
}

impl BinarySensorConfig {
    /// Build the configured extractor
    pub fn extractor(&self) -> Result<BinaryExtractor, ConfigError> {
        match (&self.lambda, self.index, self.mask) {
            (Some(lambda), None, None) => BinaryExtractor::expression(lambda),
            (None, Some(index), Some(mask)) => {
                let mask = u8::try_from(mask).map_err(|_| ConfigError::MaskOutOfRange {
                    name: self.name.clone(),
                    mask,
                })?;
                Ok(BinaryExtractor::masked(index, mask))
            }
            _ => Err(ConfigError::ExtractionMode(self.name.clone())),
        }
    }
}

/// Engine built from configuration plus lookup tables for its outputs
pub struct PollerSetup<T: CanTransport> {
    pub engine: PollingEngine<T>,
    pub handles: HashMap<String, PidHandle>,
    pub sensors: HashMap<String, SensorValue<f64>>,
    pub binary_sensors: HashMap<String, SensorValue<bool>>,
    /// Raw payloads of triggers declared with `publish = true`
    pub frames: HashMap<String, SensorValue<Vec<u8>>>,
}

impl ObdConfig {
    /// Load from a file, with `OBD__`-prefixed environment overrides
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let settings = Config::builder()
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("OBD")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let config: ObdConfig = settings.try_deserialize()?;
        info!(
            "Loaded OBD configuration from {}: {} pids, {} sensors, {} binary sensors",
            path,
            config.pids.len(),
            config.sensors.len(),
            config.binary_sensors.len()
        );
        Ok(config)
    }

    /// Parse configuration text in the given format
    pub fn from_text(text: &str, format: FileFormat) -> Result<Self, ConfigError> {
        let settings = Config::builder()
            .add_source(File::from_str(text, format))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Host tick period
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Check every definition without building anything
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut ids = HashSet::new();
        for pid in &self.pids {
            if !ids.insert(pid.id.as_str()) {
                return Err(ConfigError::DuplicateId(pid.id.clone()));
            }
            if pid.timeout_ms > pid.interval_ms {
                return Err(ConfigError::TimeoutExceedsInterval {
                    id: pid.id.clone(),
                    timeout_ms: pid.timeout_ms,
                    interval_ms: pid.interval_ms,
                });
            }
            PidRequest::new(pid.to_spec())?;
        }

        let mut triggers = HashSet::new();
        for trigger in self.pids.iter().flat_map(|pid| &pid.on_frame) {
            if !triggers.insert(trigger.name.as_str()) {
                return Err(ConfigError::DuplicateId(trigger.name.clone()));
            }
            trigger.level()?;
        }

        let known = |sensor: &str, pid_id: &str| {
            if ids.contains(pid_id) {
                Ok(())
            } else {
                Err(ConfigError::UnknownPid {
                    sensor: sensor.to_string(),
                    pid_id: pid_id.to_string(),
                })
            }
        };
        for sensor in &self.sensors {
            known(&sensor.name, &sensor.pid_id)?;
            sensor.extractor()?;
        }
        for sensor in &self.binary_sensors {
            known(&sensor.name, &sensor.pid_id)?;
            sensor.extractor()?;
        }

        Ok(())
    }

    /// Validate and build an engine over `transport`
    pub fn build<T: CanTransport>(&self, transport: T) -> Result<PollerSetup<T>, EngineError> {
        self.validate()?;

        let mut engine = PollingEngine::new(transport, self.enabled_by_default);
        let mut handles = HashMap::new();
        for pid in &self.pids {
            let handle = engine.register(pid.to_spec())?;
            handles.insert(pid.id.clone(), handle);
        }

        let mut sensors = HashMap::new();
        for sensor in &self.sensors {
            let handle = lookup(&handles, &sensor.name, &sensor.pid_id)?;
            let value = engine.add_extractor(handle, sensor.name.clone(), sensor.extractor()?)?;
            sensors.insert(sensor.name.clone(), value);
        }

        let mut binary_sensors = HashMap::new();
        for sensor in &self.binary_sensors {
            let handle = lookup(&handles, &sensor.name, &sensor.pid_id)?;
            let value = engine.add_extractor(handle, sensor.name.clone(), sensor.extractor()?)?;
            binary_sensors.insert(sensor.name.clone(), value);
        }

        let mut frames = HashMap::new();
        for pid in &self.pids {
            let handle = lookup(&handles, &pid.id, &pid.id)?;
            for trigger in &pid.on_frame {
                let (action, value) = trigger.action()?;
                engine.add_trigger(handle, trigger.name.clone(), action)?;
                if let Some(value) = value {
                    frames.insert(trigger.name.clone(), value);
                }
            }
        }

        Ok(PollerSetup {
            engine,
            handles,
            sensors,
            binary_sensors,
            frames,
        })
    }
}

fn lookup(
    handles: &HashMap<String, PidHandle>,
    sensor: &str,
    pid_id: &str,
) -> Result<PidHandle, ConfigError> {
    handles
        .get(pid_id)
        .copied()
        .ok_or_else(|| ConfigError::UnknownPid {
            sensor: sensor.to_string(),
            pid_id: pid_id.to_string(),
        })
}
