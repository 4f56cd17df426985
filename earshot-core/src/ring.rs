//! Fixed-capacity SPSC ring buffer for capture and playback samples.
//!
//! This FIFO is designed for exactly one use case:
//!
//! - one producer context feeds it (capture callback or acquisition task),
//! - one consumer context drains it (processing loop/task, or the output
//!   driver retiring played samples).
//!
//! The number of samples injected and consumed per call is constant and the
//! capacity is a multiple of that constant. The only datum shared between
//! producer and consumer is `available`, kept as a native atomic so the
//! consumer side can poll it without taking the index lock. The multi-step
//! index/copy updates are serialised by a short `parking_lot::Mutex` critical
//! section shared by `feed` and the consume paths.
//!
//! ## Overrun policy
//!
//! `feed` never blocks and never drops the incoming half-buffer: when the
//! write would exceed the free space, the oldest samples are overwritten, the
//! read index is resynchronised, `available` is clamped to the capacity and
//! the overrun is logged and counted. Real-time capture favours bounded
//! producer execution and signal continuity over completeness; the consumer
//! keeps up by construction of the cycle budget, so an overrun here means the
//! deadline was already missed.

use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::warn;

use crate::error::{EarshotError, Result};

/// Single-producer/single-consumer sample FIFO.
pub struct SampleRing {
    state: Mutex<RingState>,
    /// Samples currently readable. Updated with atomic add/sub so a lost
    /// update between producer and consumer is impossible.
    available: AtomicIsize,
    /// Number of overrun events since creation or the last `reset`.
    overruns: AtomicUsize,
    capacity: usize,
}

struct RingState {
    data: Box<[i16]>,
    write_idx: usize,
    read_idx: usize,
}

impl SampleRing {
    /// Allocate a ring of `capacity` samples, zero-filled.
    ///
    /// A zero capacity is a boot-time fatal configuration error.
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(EarshotError::Config("ring capacity must be non-zero".into()));
        }
        Ok(Self {
            state: Mutex::new(RingState {
                data: vec![0i16; capacity].into_boxed_slice(),
                write_idx: 0,
                read_idx: 0,
            }),
            available: AtomicIsize::new(0),
            overruns: AtomicUsize::new(0),
            capacity,
        })
    }

    /// Ring capacity in samples.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Samples currently readable. Lock-free; safe to poll from the
    /// processing loop while the producer is feeding.
    pub fn available(&self) -> usize {
        self.available.load(Ordering::Acquire).max(0) as usize
    }

    /// Overrun events since creation or the last `reset`.
    pub fn overruns(&self) -> usize {
        self.overruns.load(Ordering::Relaxed)
    }

    /// Rewind both indices and the counter. Storage stays allocated; stale
    /// samples are unreachable once the indices are zeroed.
    pub fn reset(&self) {
        let mut st = self.state.lock();
        st.write_idx = 0;
        st.read_idx = 0;
        self.available.store(0, Ordering::Release);
        self.overruns.store(0, Ordering::Relaxed);
    }

    /// Copy `samples` in at the write index, wrapping at capacity.
    ///
    /// Never blocks beyond the bounded index critical section, so it is safe
    /// to call from the capture callback. On overrun the oldest data is
    /// overwritten (see module docs).
    pub fn feed(&self, samples: &[i16]) {
        if samples.is_empty() {
            return;
        }
        // A single feed larger than the ring cannot preserve FIFO order;
        // sizing is validated at startup, so only the tail could survive.
        debug_assert!(samples.len() <= self.capacity);
        let samples = if samples.len() > self.capacity {
            &samples[samples.len() - self.capacity..]
        } else {
            samples
        };
        let n = samples.len();

        let mut st = self.state.lock();
        let idx = st.write_idx;
        let first = n.min(self.capacity - idx);
        st.data[idx..idx + first].copy_from_slice(&samples[..first]);
        let rest = n - first;
        if rest > 0 {
            st.data[..rest].copy_from_slice(&samples[first..]);
            st.write_idx = rest;
        } else {
            st.write_idx = (idx + first) % self.capacity;
        }

        let prev = self.available.fetch_add(n as isize, Ordering::AcqRel);
        if prev + n as isize > self.capacity as isize {
            // Oldest samples were just overwritten: resynchronise the read
            // side so the window again ends at the write index.
            st.read_idx = st.write_idx;
            self.available.store(self.capacity as isize, Ordering::Release);
            self.overruns.fetch_add(1, Ordering::Relaxed);
            warn!(
                lost = (prev + n as isize) as usize - self.capacity,
                "capture ring overrun"
            );
        }
    }

    /// Copy `dest.len()` samples out starting at the read index.
    ///
    /// Returns `false` (leaving `dest` untouched) when fewer samples are
    /// available — callers that care must check `available()` first.
    pub fn consume(&self, dest: &mut [i16]) -> bool {
        let n = dest.len();
        if n == 0 {
            return true;
        }
        let mut st = self.state.lock();
        if self.available() < n {
            return false;
        }
        let idx = st.read_idx;
        let first = n.min(self.capacity - idx);
        dest[..first].copy_from_slice(&st.data[idx..idx + first]);
        let rest = n - first;
        if rest > 0 {
            dest[first..].copy_from_slice(&st.data[..rest]);
            st.read_idx = rest;
        } else {
            st.read_idx = (idx + first) % self.capacity;
        }
        self.available.fetch_sub(n as isize, Ordering::AcqRel);
        true
    }

    /// Retire `n` samples without copying — used by the output path when the
    /// hardware already owns the data being played.
    pub fn consume_no_cpy(&self, n: usize) -> bool {
        if n == 0 {
            return true;
        }
        let mut st = self.state.lock();
        if self.available() < n {
            return false;
        }
        st.read_idx = (st.read_idx + n) % self.capacity;
        self.available.fetch_sub(n as isize, Ordering::AcqRel);
        true
    }
}
