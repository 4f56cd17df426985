//! Playback ring and noise gate.
//!
//! Processed (or raw) frames are gated, then fed into a symmetric sample
//! ring sized for double-buffered output. The output driver is started once
//! enough samples have accumulated to cover its first full transfer; after
//! that, the driver's half-transfer-complete callbacks retire played samples
//! with `consume_no_cpy` — the hardware already owns the data being played,
//! so no copy-out happens on that path.

use std::sync::Arc;

use tracing::{debug, info};

use crate::error::Result;
use crate::ring::SampleRing;

/// `log10(2^30)` — full-scale reference for 16-bit squared samples.
const FULL_SCALE_LOG10: f32 = 9.030_900;

/// RMS level of a frame in dBFS. Returns `-inf` for an all-zero frame.
pub fn level_db(frame: &[i16]) -> f32 {
    if frame.is_empty() {
        return f32::NEG_INFINITY;
    }
    let sum_sq: f32 = frame.iter().map(|&s| s as f32 * s as f32).sum();
    if sum_sq == 0.0 {
        return f32::NEG_INFINITY;
    }
    10.0 * ((sum_sq / frame.len() as f32).log10() - FULL_SCALE_LOG10)
}

/// Output-side driver boundary: started once, then drop to stop.
pub trait OutputDriver: Send + 'static {
    /// Begin draining `ring` (start the output transfer).
    fn start(&mut self, ring: Arc<SampleRing>) -> Result<()>;
}

/// Driverless sink for tests and log-only configurations.
pub struct NullOutput;

impl OutputDriver for NullOutput {
    fn start(&mut self, _ring: Arc<SampleRing>) -> Result<()> {
        debug!("null output armed");
        Ok(())
    }
}

pub struct PlaybackSink {
    ring: Arc<SampleRing>,
    driver: Box<dyn OutputDriver>,
    gate_threshold_db: f32,
    /// Samples that must be queued before the driver is started.
    arm_threshold: usize,
    started: bool,
}

impl PlaybackSink {
    /// `ring` should be sized for double-buffered output
    /// (`PipelineConfig::playback_ring_len`).
    pub fn new(ring: Arc<SampleRing>, driver: Box<dyn OutputDriver>, gate_threshold_db: f32) -> Self {
        let arm_threshold = ring.capacity() / 2;
        Self {
            ring,
            driver,
            gate_threshold_db,
            arm_threshold,
            started: false,
        }
    }

    /// Gate and enqueue one output frame.
    ///
    /// Frames whose RMS level falls below the gate threshold are zeroed in
    /// place before being fed — near-silence noise must not reach the output.
    /// Returns the pre-gate level and whether the gate muted the frame.
    pub fn push_frame(&mut self, frame: &mut [i16]) -> Result<(f32, bool)> {
        let db = level_db(frame);
        let gated = db < self.gate_threshold_db;
        if gated {
            frame.fill(0);
        }
        self.ring.feed(frame);

        if !self.started && self.ring.available() >= self.arm_threshold {
            self.driver.start(Arc::clone(&self.ring))?;
            self.started = true;
            info!(
                queued = self.ring.available(),
                "playback armed — output transfer started"
            );
        }
        Ok((db, gated))
    }

    /// Retire one played half-transfer (called from the output driver's
    /// half/full-transfer-complete callbacks).
    pub fn half_transfer_complete(&self) {
        self.ring.consume_no_cpy(self.ring.capacity() / 2);
    }

    pub fn ring(&self) -> &Arc<SampleRing> {
        &self.ring
    }

    pub fn is_started(&self) -> bool {
        self.started
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingOutput(Arc<AtomicUsize>);

    impl OutputDriver for CountingOutput {
        fn start(&mut self, _ring: Arc<SampleRing>) -> Result<()> {
            self.0.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    fn sink(capacity: usize, threshold_db: f32) -> (PlaybackSink, Arc<AtomicUsize>) {
        let starts = Arc::new(AtomicUsize::new(0));
        let ring = Arc::new(SampleRing::with_capacity(capacity).unwrap());
        (
            PlaybackSink::new(ring, Box::new(CountingOutput(Arc::clone(&starts))), threshold_db),
            starts,
        )
    }

    #[test]
    fn full_scale_square_wave_is_zero_dbfs() {
        let frame: Vec<i16> = (0..128)
            .map(|i| if i % 2 == 0 { i16::MAX } else { -i16::MAX })
            .collect();
        // (32767^2)/2^30 is fractionally below 1.0 → just under 0 dBFS.
        let db = level_db(&frame);
        assert!(db < 0.0 && db > -0.01, "db={db}");
    }

    #[test]
    fn silence_is_negative_infinity() {
        assert_eq!(level_db(&[0i16; 64]), f32::NEG_INFINITY);
        assert_eq!(level_db(&[]), f32::NEG_INFINITY);
    }

    #[test]
    fn quiet_frame_is_fully_zeroed() {
        let (mut sink, _) = sink(1024, -40.0);
        let mut frame = vec![8i16; 128]; // far below -40 dBFS
        let (db, gated) = sink.push_frame(&mut frame).unwrap();
        assert!(gated);
        assert!(db < -40.0);
        assert_eq!(frame, vec![0i16; 128]);

        let mut out = vec![-1i16; 128];
        assert!(sink.ring().consume(&mut out));
        assert_eq!(out, vec![0i16; 128]);
    }

    #[test]
    fn loud_frame_passes_unmodified() {
        let (mut sink, _) = sink(1024, -40.0);
        let original: Vec<i16> = (0..128).map(|i| (i * 200 - 12_000) as i16).collect();
        let mut frame = original.clone();
        let (db, gated) = sink.push_frame(&mut frame).unwrap();
        assert!(!gated);
        assert!(db >= -40.0);
        assert_eq!(frame, original);

        let mut out = vec![0i16; 128];
        assert!(sink.ring().consume(&mut out));
        assert_eq!(out, original);
    }

    #[test]
    fn frame_at_exact_threshold_passes() {
        // Gate condition is strictly-below: a frame at the threshold passes.
        let frame = vec![1000i16; 64];
        let db = level_db(&frame);
        let (mut sink, _) = sink(1024, db);
        let mut copy = frame.clone();
        let (_, gated) = sink.push_frame(&mut copy).unwrap();
        assert!(!gated);
        assert_eq!(copy, frame);
    }

    #[test]
    fn driver_starts_once_after_arm_threshold() {
        let (mut sink, starts) = sink(512, -90.0);
        let mut frame = vec![5000i16; 128];

        sink.push_frame(&mut frame.clone()).unwrap();
        assert_eq!(starts.load(Ordering::Relaxed), 0, "128 < 256 — not armed yet");

        sink.push_frame(&mut frame).unwrap();
        assert_eq!(starts.load(Ordering::Relaxed), 1, "256 >= 256 — armed");
        assert!(sink.is_started());

        let mut again = vec![5000i16; 128];
        sink.push_frame(&mut again).unwrap();
        assert_eq!(starts.load(Ordering::Relaxed), 1, "started exactly once");
    }

    #[test]
    fn half_transfer_complete_retires_half_the_ring() {
        let (mut sink, _) = sink(256, -90.0);
        let mut frame = vec![100i16; 256];
        sink.push_frame(&mut frame).unwrap();
        assert_eq!(sink.ring().available(), 256);
        sink.half_transfer_complete();
        assert_eq!(sink.ring().available(), 128);
    }

    #[test]
    fn level_db_matches_reference_for_known_amplitude() {
        // Constant amplitude a: RMS^2 = a^2, level = 10*log10(a^2/2^30).
        let frame = vec![4096i16; 256];
        let expect = 10.0 * ((4096.0f32 * 4096.0).log10() - FULL_SCALE_LOG10);
        assert_relative_eq!(level_db(&frame), expect, epsilon = 1e-3);
    }
}
