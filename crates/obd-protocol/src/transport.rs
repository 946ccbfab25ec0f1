//! Frame Transport Adapter
//!
//! Outbound frames go through [`CanTransport::send`]. Inbound frames may
//! arrive on a driver thread or interrupt context, so they are pushed into a
//! bounded queue with a [`FrameSink`] and drained by the engine from the
//! matching [`FrameSource`] on its own scheduling context.

use crate::error::TransportError;
use crate::frame::CanFrame;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

/// Default depth of the inbound frame queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Outbound half of a CAN adapter
pub trait CanTransport {
    /// Queue a frame for transmission without waiting for any reply
    fn send(&mut self, frame: &CanFrame) -> Result<(), TransportError>;
}

impl<T: CanTransport + ?Sized> CanTransport for Box<T> {
    fn send(&mut self, frame: &CanFrame) -> Result<(), TransportError> {
        (**self).send(frame)
    }
}

/// Create a bounded inbound frame queue
pub fn frame_channel(capacity: usize) -> (FrameSink, FrameSource) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    (
        FrameSink {
            tx,
            dropped: dropped.clone(),
        },
        FrameSource { rx, dropped },
    )
}

/// Producer side handed to the adapter's receive path
#[derive(Debug, Clone)]
pub struct FrameSink {
    tx: mpsc::Sender<CanFrame>,
    dropped: Arc<AtomicU64>,
}

impl FrameSink {
    /// Hand an inbound frame to the engine. Never blocks.
    ///
    /// Returns `false` if the frame was dropped because the queue is full or
    /// the engine side has gone away.
    pub fn deliver(&self, id: u32, extended: bool, data: &[u8]) -> bool {
        self.deliver_frame(CanFrame::new(id, extended, data))
    }

    /// Hand an already built frame to the engine
    pub fn deliver_frame(&self, frame: CanFrame) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(frame)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!("Inbound queue full, dropping {}", frame);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

/// Consumer side drained by the polling engine
#[derive(Debug)]
pub struct FrameSource {
    rx: mpsc::Receiver<CanFrame>,
    dropped: Arc<AtomicU64>,
}

impl FrameSource {
    /// Take the next queued frame, if any
    pub fn try_next(&mut self) -> Option<CanFrame> {
        self.rx.try_recv().ok()
    }

    /// Wait for the next frame; `None` once every sink is dropped
    pub async fn recv(&mut self) -> Option<CanFrame> {
        self.rx.recv().await
    }

    /// Frames lost to a full queue since creation
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
