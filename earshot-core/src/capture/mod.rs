//! Acquisition driver boundary.
//!
//! The capture driver (cpal stream, WAV feeder, or a test harness) fills one
//! half of a fixed ping-pong buffer while the other half is being drained,
//! and raises a half-transfer event per filled half. Each event hands the
//! pipeline exactly `capture_buffer_len / 2` samples.
//!
//! Two hook implementations adapt those events to the two scheduling models:
//!
//! - [`DirectHooks`] feeds the capture ring straight from the callback
//!   (single-threaded cooperative model — `SampleRing::feed` is non-blocking
//!   with a bounded critical section, so it is safe in interrupt-like
//!   context);
//! - [`QueuedHooks`] posts a `DataReady` message to the acquisition task's
//!   bounded queue instead, keeping the callback's execution time independent
//!   of ring contention. A full queue drops the message and logs it.
//!
//! A driver error is fatal in both models: the fault handler records the
//! failure, broadcasts an `Error` status and clears the running flag so the
//! pipeline winds down instead of processing inconsistent data.

#[cfg(feature = "audio-cpal")]
pub mod cpal;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_channel::Sender;
use tokio::sync::broadcast;
use tracing::{error, warn};

use crate::events::{EngineStatus, StatusEvent};
use crate::msg::{HalfIndex, Message};
use crate::ring::SampleRing;

/// Fixed double buffer standing in for the hardware DMA target.
///
/// The driver writes one half while the consumer reads the other; each half
/// has its own short lock so the two sides never contend in the steady state.
pub struct PingPongBuffer {
    halves: [parking_lot::Mutex<Box<[i16]>>; 2],
    half_len: usize,
}

impl PingPongBuffer {
    /// `total_len` covers both halves and must be even.
    pub fn new(total_len: usize) -> Self {
        debug_assert!(total_len % 2 == 0 && total_len > 0);
        let half_len = total_len / 2;
        Self {
            halves: [
                parking_lot::Mutex::new(vec![0i16; half_len].into_boxed_slice()),
                parking_lot::Mutex::new(vec![0i16; half_len].into_boxed_slice()),
            ],
            half_len,
        }
    }

    pub fn half_len(&self) -> usize {
        self.half_len
    }

    /// Overwrite one half with freshly captured samples.
    pub fn write_half(&self, half: HalfIndex, samples: &[i16]) {
        debug_assert_eq!(samples.len(), self.half_len);
        let mut guard = self.halves[(half & 1) as usize].lock();
        guard.copy_from_slice(samples);
    }

    /// Read one half under its lock.
    pub fn with_half<R>(&self, half: HalfIndex, f: impl FnOnce(&[i16]) -> R) -> R {
        let guard = self.halves[(half & 1) as usize].lock();
        f(&guard)
    }
}

/// Copies ready halves from the ping-pong buffer into the capture ring.
#[derive(Clone)]
pub struct CaptureAdapter {
    ring: Arc<SampleRing>,
    buffer: Arc<PingPongBuffer>,
}

impl CaptureAdapter {
    pub fn new(ring: Arc<SampleRing>, buffer: Arc<PingPongBuffer>) -> Self {
        Self { ring, buffer }
    }

    /// Feed exactly one half-buffer into the ring.
    pub fn feed_half(&self, half: HalfIndex) {
        self.buffer.with_half(half, |samples| self.ring.feed(samples));
    }

    pub fn ring(&self) -> &SampleRing {
        &self.ring
    }
}

/// Shared fatal-fault latch: driver errors stop the pipeline.
#[derive(Clone)]
pub struct FaultHandler {
    running: Arc<AtomicBool>,
    status_tx: broadcast::Sender<StatusEvent>,
}

impl FaultHandler {
    pub fn new(running: Arc<AtomicBool>, status_tx: broadcast::Sender<StatusEvent>) -> Self {
        Self { running, status_tx }
    }

    /// Record an unrecoverable driver fault and wind the pipeline down.
    pub fn raise(&self, detail: &str) {
        error!("capture driver fault: {detail}");
        let _ = self.status_tx.send(StatusEvent {
            status: EngineStatus::Error,
            detail: Some(detail.to_string()),
        });
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Driver-facing event sink.
pub trait CaptureHooks: Send + Sync {
    /// One half of the ping-pong buffer has been filled.
    fn half_transfer(&self, half: HalfIndex);
    /// Unrecoverable driver error.
    fn error(&self, detail: &str);
}

/// Cooperative-model hooks: feed the ring directly from the callback.
pub struct DirectHooks {
    adapter: CaptureAdapter,
    fault: FaultHandler,
}

impl DirectHooks {
    pub fn new(adapter: CaptureAdapter, fault: FaultHandler) -> Self {
        Self { adapter, fault }
    }
}

impl CaptureHooks for DirectHooks {
    fn half_transfer(&self, half: HalfIndex) {
        self.adapter.feed_half(half);
    }

    fn error(&self, detail: &str) {
        self.fault.raise(detail);
    }
}

/// Task-model hooks: post `DataReady` to the acquisition queue.
///
/// The send is non-blocking; when the queue is full the message is dropped
/// and counted. Occasional drops under overload are preferred to extending
/// the callback's execution time.
pub struct QueuedHooks {
    acq_tx: Sender<Message>,
    dropped: Arc<AtomicUsize>,
    fault: FaultHandler,
}

impl QueuedHooks {
    pub fn new(acq_tx: Sender<Message>, dropped: Arc<AtomicUsize>, fault: FaultHandler) -> Self {
        Self {
            acq_tx,
            dropped,
            fault,
        }
    }
}

impl CaptureHooks for QueuedHooks {
    fn half_transfer(&self, half: HalfIndex) {
        if self.acq_tx.try_send(Message::DataReady { half }).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(half, "acquisition queue full, DataReady dropped");
        }
    }

    fn error(&self, detail: &str) {
        self.fault.raise(detail);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    fn fault() -> (FaultHandler, Arc<AtomicBool>) {
        let running = Arc::new(AtomicBool::new(true));
        let (status_tx, _) = broadcast::channel(4);
        (FaultHandler::new(Arc::clone(&running), status_tx), running)
    }

    #[test]
    fn direct_hooks_feed_alternating_halves_in_order() {
        let ring = Arc::new(SampleRing::with_capacity(64).unwrap());
        let buffer = Arc::new(PingPongBuffer::new(16));
        let (fault, _) = fault();
        let hooks = DirectHooks::new(
            CaptureAdapter::new(Arc::clone(&ring), Arc::clone(&buffer)),
            fault,
        );

        buffer.write_half(0, &[1; 8]);
        hooks.half_transfer(0);
        buffer.write_half(1, &[2; 8]);
        hooks.half_transfer(1);

        let mut out = vec![0i16; 16];
        assert!(ring.consume(&mut out));
        assert_eq!(&out[..8], &[1i16; 8]);
        assert_eq!(&out[8..], &[2i16; 8]);
    }

    #[test]
    fn queued_hooks_post_data_ready_and_drop_on_overflow() {
        let (tx, rx) = bounded::<Message>(2);
        let dropped = Arc::new(AtomicUsize::new(0));
        let (fault, _) = fault();
        let hooks = QueuedHooks::new(tx, Arc::clone(&dropped), fault);

        hooks.half_transfer(0);
        hooks.half_transfer(1);
        hooks.half_transfer(0); // queue full — dropped, not blocked

        assert_eq!(dropped.load(Ordering::Relaxed), 1);
        assert_eq!(rx.try_recv().unwrap(), Message::DataReady { half: 0 });
        assert_eq!(rx.try_recv().unwrap(), Message::DataReady { half: 1 });
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn driver_error_clears_running_flag() {
        let ring = Arc::new(SampleRing::with_capacity(16).unwrap());
        let buffer = Arc::new(PingPongBuffer::new(8));
        let (fault, running) = fault();
        let hooks = DirectHooks::new(CaptureAdapter::new(ring, buffer), fault);

        hooks.error("codec went away");
        assert!(!running.load(Ordering::SeqCst));
    }
}
