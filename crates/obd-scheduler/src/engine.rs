//! PID Polling Engine
//!
//! Owns the transport and every PID request, drives their send/timeout
//! cycle from a periodic tick and routes inbound frames to the requests
//! waiting on that identifier. `tick` and `on_frame` take `&mut self`, so
//! they can never interleave; frames from other threads go through a
//! [`FrameSource`] drained on the engine's own context.

use crate::consumer::{FrameConsumer, Sensor, SensorValue, Trigger};
use crate::error::EngineError;
use crate::extract::Extract;
use crate::request::{PidRequest, PidRequestSpec, PollStats, RequestState, ResponseOutcome};
use obd_protocol::{format_id, CanTransport, FrameSource, MAX_EXTENDED_ID};
use std::collections::HashMap;
use std::fmt::Debug;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Handle to a registered PID request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PidHandle(usize);

impl PidHandle {
    /// Registration order index
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Polling engine over a single CAN transport
pub struct PollingEngine<T: CanTransport> {
    transport: T,
    requests: Vec<PidRequest>,
    /// Requests keyed by (response id, extended flag)
    routes: HashMap<(u32, bool), Vec<usize>>,
    enabled: bool,
    started: bool,
}

impl<T: CanTransport> PollingEngine<T> {
    /// Create an engine; with `enabled_by_default` unset nothing is sent
    /// until [`PollingEngine::enable`] is called
    pub fn new(transport: T, enabled_by_default: bool) -> Self {
        Self {
            transport,
            requests: Vec::new(),
            routes: HashMap::new(),
            enabled: enabled_by_default,
            started: false,
        }
    }

    /// Add a PID request. Closed once polling has started.
    pub fn register(&mut self, spec: PidRequestSpec) -> Result<PidHandle, EngineError> {
        if self.started {
            return Err(EngineError::AlreadyStarted);
        }

        let request = PidRequest::new(spec)?;
        if request.timeout() > request.interval() {
            warn!(
                "Pid 0x{:04X}: timeout {}ms exceeds interval {}ms, rounds will overlap",
                request.pid(),
                request.timeout().as_millis(),
                request.interval().as_millis()
            );
        }

        let index = self.requests.len();
        debug!(
            "Add request for can_id={}, pid=0x{:04X}",
            format_id(request.can_id(), request.use_extended_id()),
            request.pid()
        );
        self.routes
            .entry((request.response_id(), request.use_extended_id()))
            .or_default()
            .push(index);
        self.requests.push(request);

        Ok(PidHandle(index))
    }

    /// Attach an extractor; its results are published to the returned receiver
    pub fn add_extractor<E>(
        &mut self,
        handle: PidHandle,
        name: impl Into<String>,
        extractor: E,
    ) -> Result<SensorValue<E::Output>, EngineError>
    where
        E: Extract + Send + 'static,
        E::Output: Clone + Debug + Send + Sync + 'static,
    {
        let request = self.request_for_registration(handle)?;
        let (sensor, value) = Sensor::new(name, extractor);
        request.add_extractor(Box::new(sensor));
        Ok(value)
    }

    /// Attach any consumer alongside the extractors
    pub fn add_consumer(
        &mut self,
        handle: PidHandle,
        consumer: Box<dyn FrameConsumer>,
    ) -> Result<(), EngineError> {
        self.request_for_registration(handle)?.add_extractor(consumer);
        Ok(())
    }

    /// Attach a callback fired with the raw payload of every completed round
    pub fn add_trigger<F>(
        &mut self,
        handle: PidHandle,
        name: impl Into<String>,
        action: F,
    ) -> Result<(), EngineError>
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        let request = self.request_for_registration(handle)?;
        request.add_trigger(Box::new(Trigger::new(name, action)));
        Ok(())
    }

    fn request_for_registration(
        &mut self,
        handle: PidHandle,
    ) -> Result<&mut PidRequest, EngineError> {
        if self.started {
            return Err(EngineError::AlreadyStarted);
        }
        self.requests
            .get_mut(handle.0)
            .ok_or(EngineError::UnknownRequest(handle.0))
    }

    /// Close registration and start every request's interval clock at `now`.
    /// Called implicitly by the first `tick`.
    pub fn start(&mut self, now: Instant) {
        if self.started {
            return;
        }
        self.started = true;
        for request in &mut self.requests {
            request.arm(now);
        }
        info!(
            "OBD polling started with {} requests (enabled: {})",
            self.requests.len(),
            self.enabled
        );
    }

    /// Whether registration is closed
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Resume transmissions
    pub fn enable(&mut self) {
        if !self.enabled {
            info!("OBD polling enabled");
            self.enabled = true;
        }
    }

    /// Stop transmissions and abandon rounds in progress
    pub fn disable(&mut self) {
        if self.enabled {
            info!("OBD polling disabled");
            self.enabled = false;
        }
        for request in &mut self.requests {
            request.reset();
        }
    }

    /// Whether transmissions are enabled
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Advance every request: expire overdue rounds, then send what is due
    pub fn tick(&mut self, now: Instant) {
        self.start(now);
        if !self.enabled {
            return;
        }

        for request in &mut self.requests {
            request.expire(now);

            if !request.is_due(now) {
                continue;
            }

            let frame = request.request_frame();
            debug!("Polling {}", frame);
            match self.transport.send(&frame) {
                Ok(()) => request.mark_sent(now),
                Err(e) => {
                    warn!(
                        "Send failed for pid 0x{:04X} on {}: {}",
                        request.pid(),
                        format_id(request.can_id(), request.use_extended_id()),
                        e
                    );
                    request.mark_send_failed(now);
                }
            }
        }
    }

    /// Route an inbound frame; returns how many rounds it completed.
    /// Frames on identifiers nobody waits for are dropped silently.
    pub fn on_frame(&mut self, id: u32, extended: bool, payload: &[u8]) -> usize {
        let Some(indices) = self.routes.get(&(id & MAX_EXTENDED_ID, extended)) else {
            return 0;
        };

        let mut accepted = 0;
        for &index in indices {
            if let Some(request) = self.requests.get_mut(index) {
                if request.handle_response(payload) == ResponseOutcome::Accepted {
                    accepted += 1;
                }
            }
        }
        accepted
    }

    /// Process every queued inbound frame; returns the number of frames seen
    pub fn drain(&mut self, frames: &mut FrameSource) -> usize {
        let mut count = 0;
        while let Some(frame) = frames.try_next() {
            self.on_frame(frame.id, frame.extended, &frame.data);
            count += 1;
        }
        count
    }

    /// Drive the engine until `shutdown` flips to `true` or its sender is dropped
    pub async fn run(
        &mut self,
        frames: &mut FrameSource,
        tick_period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(tick_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("Starting OBD polling loop, tick {}ms", tick_period.as_millis());

        loop {
            tokio::select! {
                instant = ticker.tick() => self.tick(instant.into_std()),
                frame = frames.recv() => match frame {
                    Some(frame) => {
                        self.on_frame(frame.id, frame.extended, &frame.data);
                    }
                    None => {
                        warn!("Inbound frame source closed");
                        break;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("OBD polling loop stopped");
    }

    /// Registered request
    pub fn request(&self, handle: PidHandle) -> Option<&PidRequest> {
        self.requests.get(handle.0)
    }

    /// Round state of a request
    pub fn state(&self, handle: PidHandle) -> Option<RequestState> {
        self.request(handle).map(PidRequest::state)
    }

    /// Counters of a request
    pub fn stats(&self, handle: PidHandle) -> Option<PollStats> {
        self.request(handle).map(PidRequest::stats)
    }

    /// Number of registered requests
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// Whether no requests are registered
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Underlying transport
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Print every request definition
    pub fn log_config(&self) {
        info!("OBD Component (enabled: {})", self.enabled);
        for request in &self.requests {
            request.log_config();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::{BinaryExtractor, NumericExtractor};
    use obd_protocol::{frame_channel, MockTransport, Pid, SimulatedEcu, TransportError};
    use std::sync::{Arc, Mutex};

    const SECOND: Duration = Duration::from_millis(1000);

    fn spec(can_id: u32, pid: u32) -> PidRequestSpec {
        PidRequestSpec {
            interval: SECOND,
            timeout: Duration::from_millis(200),
            reply_length: 5,
            ..PidRequestSpec::new(can_id, pid)
        }
    }

    fn engine() -> (PollingEngine<MockTransport>, MockTransport) {
        let transport = MockTransport::new();
        (PollingEngine::new(transport.clone(), true), transport)
    }

    fn counter() -> (Arc<Mutex<usize>>, impl FnMut(&[u8]) + Send + 'static) {
        let count = Arc::new(Mutex::new(0));
        let inner = count.clone();
        (count, move |_: &[u8]| *inner.lock().unwrap() += 1)
    }

    const RPM_REPLY: [u8; 8] = [0x04, 0x41, 0x0C, 0x1A, 0x2B, 0xAA, 0xAA, 0xAA];

    #[test]
    fn test_first_transmission_waits_one_interval() {
        let (mut engine, transport) = engine();
        engine.register(spec(0x7E0, 0x010C)).unwrap();

        let t0 = Instant::now();
        engine.tick(t0);
        assert_eq!(transport.sent_count(), 0);

        engine.tick(t0 + SECOND);
        assert_eq!(transport.sent_count(), 1);
        let frame = &transport.sent_frames()[0];
        assert_eq!(frame.id, 0x7E0);
        assert_eq!(frame.data, vec![0x02, 0x01, 0x0C, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA]);
    }

    #[test]
    fn test_register_after_start_fails() {
        let (mut engine, _) = engine();
        let handle = engine.register(spec(0x7E0, 0x010C)).unwrap();
        engine.tick(Instant::now());

        assert_eq!(
            engine.register(spec(0x7E1, 0x010D)).unwrap_err(),
            EngineError::AlreadyStarted
        );
        let (_, action) = counter();
        assert_eq!(
            engine.add_trigger(handle, "late", action).unwrap_err(),
            EngineError::AlreadyStarted
        );
    }

    #[test]
    fn test_unknown_handle() {
        let (mut engine, _) = engine();
        let (_, action) = counter();
        assert_eq!(
            engine.add_trigger(PidHandle(3), "t", action).unwrap_err(),
            EngineError::UnknownRequest(3)
        );
    }

    #[test]
    fn test_invalid_spec_rejected() {
        let (mut engine, _) = engine();
        let err = engine.register(spec(0x1000, 0x010C)).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
        assert!(engine.is_empty());
    }

    #[test]
    fn test_round_trip_feeds_every_consumer() {
        let (mut engine, _) = engine();
        let handle = engine.register(spec(0x7E0, 0x010C)).unwrap();
        let rpm = engine
            .add_extractor(
                handle,
                "rpm",
                NumericExtractor::expression("(b3 * 256 + b4) / 4.0").unwrap(),
            )
            .unwrap();
        let raw = engine
            .add_extractor(handle, "raw", NumericExtractor::composed(vec![3, 4], false).unwrap())
            .unwrap();
        let flag = engine
            .add_extractor(handle, "flag", BinaryExtractor::masked(3, 0x1A))
            .unwrap();
        let (fired, action) = counter();
        engine.add_trigger(handle, "on_frame", action).unwrap();

        let t0 = Instant::now();
        engine.tick(t0);
        engine.tick(t0 + SECOND);
        assert_eq!(engine.on_frame(0x7E8, false, &RPM_REPLY), 1);

        assert!((rpm.borrow().unwrap() - 1674.75).abs() < 0.01);
        assert_eq!(*raw.borrow(), Some(0x1A2B as f64));
        assert_eq!(*flag.borrow(), Some(true));
        assert_eq!(*fired.lock().unwrap(), 1);
        assert_eq!(engine.state(handle), Some(RequestState::Idle));
    }

    #[test]
    fn test_short_payload_reaches_no_consumer() {
        let (mut engine, _) = engine();
        let handle = engine.register(spec(0x7E0, 0x010C)).unwrap();
        let value = engine
            .add_extractor(handle, "b0", NumericExtractor::composed(vec![0], false).unwrap())
            .unwrap();
        let (fired, action) = counter();
        engine.add_trigger(handle, "t", action).unwrap();

        let t0 = Instant::now();
        engine.start(t0);
        engine.tick(t0 + SECOND);
        assert_eq!(engine.on_frame(0x7E8, false, &[0x04, 0x41, 0x0C, 0x1A]), 0);

        assert_eq!(*value.borrow(), None);
        assert_eq!(*fired.lock().unwrap(), 0);
        assert!(engine.request(handle).unwrap().is_awaiting());
    }

    #[test]
    fn test_timeout_reaches_no_consumer() {
        let (mut engine, transport) = engine();
        let handle = engine.register(spec(0x7E0, 0x010C)).unwrap();
        let (fired, action) = counter();
        engine.add_trigger(handle, "t", action).unwrap();

        let t0 = Instant::now();
        engine.start(t0);
        engine.tick(t0 + SECOND);
        engine.tick(t0 + SECOND + Duration::from_millis(200));

        assert_eq!(engine.state(handle), Some(RequestState::Idle));
        assert_eq!(engine.stats(handle).unwrap().timeouts, 1);
        assert_eq!(*fired.lock().unwrap(), 0);

        // next transmission is one interval after the previous one
        engine.tick(t0 + 2 * SECOND - Duration::from_millis(1));
        assert_eq!(transport.sent_count(), 1);
        engine.tick(t0 + 2 * SECOND);
        assert_eq!(transport.sent_count(), 2);
    }

    #[test]
    fn test_shared_response_id_fans_out() {
        let (mut engine, _) = engine();
        let first = engine.register(spec(0x7E0, 0x010C)).unwrap();
        let second = engine.register(spec(0x7E0, 0x010D)).unwrap();
        let (a, action_a) = counter();
        let (b, action_b) = counter();
        engine.add_trigger(first, "a", action_a).unwrap();
        engine.add_trigger(second, "b", action_b).unwrap();

        let t0 = Instant::now();
        engine.start(t0);
        engine.tick(t0 + SECOND);
        assert_eq!(engine.on_frame(0x7E8, false, &RPM_REPLY), 2);

        assert_eq!(*a.lock().unwrap(), 1);
        assert_eq!(*b.lock().unwrap(), 1);
    }

    #[test]
    fn test_unmatched_frame_is_dropped() {
        let (mut engine, _) = engine();
        let handle = engine.register(spec(0x7E0, 0x010C)).unwrap();
        let (fired, action) = counter();
        engine.add_trigger(handle, "t", action).unwrap();

        let t0 = Instant::now();
        engine.start(t0);
        engine.tick(t0 + SECOND);
        assert_eq!(engine.on_frame(0x123, false, &RPM_REPLY), 0);
        // same id in the other format does not match either
        assert_eq!(engine.on_frame(0x7E8, true, &RPM_REPLY), 0);

        assert_eq!(*fired.lock().unwrap(), 0);
        assert!(engine.request(handle).unwrap().is_awaiting());
    }

    #[test]
    fn test_extended_ids() {
        let (mut engine, transport) = engine();
        let handle = engine
            .register(PidRequestSpec {
                use_extended_id: true,
                response_can_id: Some(0x18DA_F110),
                ..spec(0x18DB_33F1, 0x010C)
            })
            .unwrap();
        let (fired, action) = counter();
        engine.add_trigger(handle, "t", action).unwrap();

        let t0 = Instant::now();
        engine.start(t0);
        engine.tick(t0 + SECOND);
        assert!(transport.sent_frames()[0].extended);

        assert_eq!(engine.on_frame(0x18DA_F110, true, &RPM_REPLY), 1);
        assert_eq!(*fired.lock().unwrap(), 1);
    }

    #[test]
    fn test_disabled_engine_sends_nothing() {
        let transport = MockTransport::new();
        let mut engine = PollingEngine::new(transport.clone(), false);
        let handle = engine.register(spec(0x7E0, 0x010C)).unwrap();

        let t0 = Instant::now();
        engine.tick(t0);
        engine.tick(t0 + 3 * SECOND);
        assert_eq!(transport.sent_count(), 0);

        engine.enable();
        engine.tick(t0 + 3 * SECOND);
        assert_eq!(transport.sent_count(), 1);

        engine.disable();
        assert_eq!(engine.state(handle), Some(RequestState::Idle));
        engine.tick(t0 + 5 * SECOND);
        assert_eq!(transport.sent_count(), 1);
    }

    #[test]
    fn test_transport_error_skips_slot() {
        let (mut engine, transport) = engine();
        let handle = engine.register(spec(0x7E0, 0x010C)).unwrap();
        transport.fail_with(Some(TransportError::BusOff));

        let t0 = Instant::now();
        engine.start(t0);
        engine.tick(t0 + SECOND);
        assert_eq!(engine.state(handle), Some(RequestState::Idle));
        assert_eq!(engine.stats(handle).unwrap().send_failures, 1);

        transport.fail_with(None);
        engine.tick(t0 + SECOND + Duration::from_millis(500));
        assert_eq!(transport.sent_count(), 0);
        engine.tick(t0 + 2 * SECOND);
        assert_eq!(transport.sent_count(), 1);
        assert!(engine.request(handle).unwrap().is_awaiting());
    }

    #[test]
    fn test_extraction_error_is_isolated() {
        let (mut engine, _) = engine();
        let handle = engine.register(spec(0x7E0, 0x010C)).unwrap();
        let broken = engine
            .add_extractor(handle, "broken", NumericExtractor::composed(vec![12], false).unwrap())
            .unwrap();
        let panicking = engine
            .add_extractor(handle, "panics", BinaryExtractor::custom(|data| Ok(data[40] > 0)))
            .unwrap();
        let good = engine
            .add_extractor(handle, "good", NumericExtractor::composed(vec![3], false).unwrap())
            .unwrap();

        let t0 = Instant::now();
        engine.start(t0);
        engine.tick(t0 + SECOND);
        assert_eq!(engine.on_frame(0x7E8, false, &RPM_REPLY), 1);

        assert_eq!(*broken.borrow(), None);
        assert_eq!(*panicking.borrow(), None);
        assert_eq!(*good.borrow(), Some(0x1A as f64));
        assert_eq!(engine.state(handle), Some(RequestState::Idle));
    }

    #[test]
    fn test_panicking_trigger_does_not_escape() {
        let (mut engine, _) = engine();
        let handle = engine.register(spec(0x7E0, 0x010C)).unwrap();
        engine
            .add_consumer(
                handle,
                Box::new(Trigger::new("boom", |_: &[u8]| panic!("trigger failed"))),
            )
            .unwrap();
        let rpm = engine
            .add_extractor(handle, "rpm", NumericExtractor::composed(vec![3, 4], false).unwrap())
            .unwrap();
        engine.add_trigger(handle, "late_boom", |_| panic!("late")).unwrap();
        let (fired, action) = counter();
        engine.add_trigger(handle, "count", action).unwrap();

        let t0 = Instant::now();
        engine.start(t0);
        engine.tick(t0 + SECOND);
        assert_eq!(engine.on_frame(0x7E8, false, &RPM_REPLY), 1);

        assert_eq!(*rpm.borrow(), Some(6699.0));
        assert_eq!(*fired.lock().unwrap(), 1);
        assert_eq!(engine.state(handle), Some(RequestState::Idle));
    }

    #[test]
    fn test_at_most_one_round_outstanding() {
        let (mut engine, _) = engine();
        let handle = engine
            .register(PidRequestSpec {
                interval: Duration::from_millis(100),
                timeout: Duration::from_millis(100),
                ..spec(0x7E0, 0x010C)
            })
            .unwrap();

        let t0 = Instant::now();
        engine.start(t0);
        for step in 1..=500u64 {
            engine.tick(t0 + Duration::from_millis(step * 10));
            if step % 7 == 0 {
                engine.on_frame(0x7E8, false, &RPM_REPLY);
            }

            let stats = engine.stats(handle).unwrap();
            let closed = stats.responses + stats.timeouts;
            assert!(stats.transmissions - closed <= 1);
            assert_eq!(
                stats.transmissions - closed == 1,
                engine.request(handle).unwrap().is_awaiting()
            );
        }
    }

    #[test]
    fn test_drain_processes_queued_frames() {
        let (mut engine, _) = engine();
        let handle = engine.register(spec(0x7E0, 0x010C)).unwrap();
        let (fired, action) = counter();
        engine.add_trigger(handle, "t", action).unwrap();
        let (sink, mut source) = frame_channel(8);

        let t0 = Instant::now();
        engine.start(t0);
        engine.tick(t0 + SECOND);
        sink.deliver(0x7E8, false, &RPM_REPLY);
        sink.deliver(0x7E8, false, &RPM_REPLY);
        sink.deliver(0x7DF, false, &RPM_REPLY);

        assert_eq!(engine.drain(&mut source), 3);
        assert_eq!(*fired.lock().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_against_simulated_ecu() {
        let (sink, mut source) = frame_channel(16);
        let mut engine = PollingEngine::new(SimulatedEcu::new(sink), true);
        let rpm_handle = engine
            .register(PidRequestSpec {
                reply_length: Pid::Rpm.reply_length(),
                ..spec(0x7E0, Pid::Rpm.request_code())
            })
            .unwrap();
        let speed_handle = engine
            .register(PidRequestSpec {
                interval: Duration::from_millis(500),
                reply_length: Pid::Speed.reply_length(),
                ..spec(0x7E1, Pid::Speed.request_code())
            })
            .unwrap();
        let rpm = engine
            .add_extractor(
                rpm_handle,
                "rpm",
                NumericExtractor::expression("(b3 * 256 + b4) / 4.0").unwrap(),
            )
            .unwrap();
        let speed = engine
            .add_extractor(
                speed_handle,
                "speed",
                NumericExtractor::composed(vec![3], false).unwrap(),
            )
            .unwrap();

        let (stop, shutdown) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(3050)).await;
            let _ = stop.send(true);
        });
        engine
            .run(&mut source, Duration::from_millis(50), shutdown)
            .await;

        let rpm_stats = engine.stats(rpm_handle).unwrap();
        let speed_stats = engine.stats(speed_handle).unwrap();
        assert_eq!(rpm_stats.transmissions, 3);
        assert_eq!(rpm_stats.responses, 3);
        assert_eq!(speed_stats.transmissions, 6);
        assert_eq!(speed_stats.timeouts, 0);

        let rpm = rpm.borrow().unwrap();
        assert!((800.0..=3500.0).contains(&rpm));
        assert!(speed.borrow().unwrap() < 120.0);
    }
}
