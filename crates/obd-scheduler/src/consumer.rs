//! Response Consumers
//!
//! A PID request hands every accepted reply payload to its consumers.
//! Sensors run an extractor and publish the result into a last-known-value
//! store; triggers receive the raw payload.

use crate::extract::Extract;
use std::fmt::Debug;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Last published value of a sensor; `None` until the first good reply
pub type SensorValue<T> = watch::Receiver<Option<T>>;

/// Anything that wants the payload of a completed round
pub trait FrameConsumer: Send {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Handle an accepted reply payload
    fn consume(&mut self, payload: &[u8]);
}

/// Extractor bound to a published value
pub struct Sensor<E: Extract> {
    name: String,
    extractor: E,
    state: watch::Sender<Option<E::Output>>,
    /// Failed extractions since creation
    errors: u64,
}

impl<E> Sensor<E>
where
    E: Extract,
    E::Output: Clone,
{
    /// Create a sensor and the receiver its values are published to
    pub fn new(name: impl Into<String>, extractor: E) -> (Self, SensorValue<E::Output>) {
        let (state, value) = watch::channel(None);
        let sensor = Self {
            name: name.into(),
            extractor,
            state,
            errors: 0,
        };
        (sensor, value)
    }

    /// Another receiver for the published value
    pub fn subscribe(&self) -> SensorValue<E::Output> {
        self.state.subscribe()
    }

    /// Number of failed extractions
    pub fn error_count(&self) -> u64 {
        self.errors
    }
}

impl<E> FrameConsumer for Sensor<E>
where
    E: Extract + Send,
    E::Output: Clone + Debug + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn consume(&mut self, payload: &[u8]) {
        match self.extractor.extract(payload) {
            Ok(value) => {
                debug!("Sensor '{}' -> {:?}", self.name, value);
                self.state.send_replace(Some(value));
            }
            Err(e) => {
                self.errors += 1;
                metrics::counter!("obd_extraction_errors_total", "sensor" => self.name.clone())
                    .increment(1);
                warn!("Sensor '{}' extraction failed: {}", self.name, e);
            }
        }
    }
}

/// Callback fired with the raw payload of every completed round
pub struct Trigger {
    name: String,
    action: Box<dyn FnMut(&[u8]) + Send>,
}

impl Trigger {
    /// Wrap a callback
    pub fn new<F>(name: impl Into<String>, action: F) -> Self
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        Self {
            name: name.into(),
            action: Box::new(action),
        }
    }
}

impl FrameConsumer for Trigger {
    fn name(&self) -> &str {
        &self.name
    }

    fn consume(&mut self, payload: &[u8]) {
        (self.action)(payload);
    }
}
