//! Pipeline configuration.
//!
//! All sizes are fixed before the stream starts — there is no runtime
//! reconfiguration. The defaults describe a 16 kHz keyword/sound-event
//! pipeline (25 ms window, 10 ms hop, 64 mel bins, 30-column patches).
//!
//! ## Patch geometry
//!
//! ```text
//! patch_overlap    = window_len - hop_len
//! patch_no_overlap = num_columns * hop_len      (fresh samples per cycle)
//! patch_len        = patch_overlap + patch_no_overlap
//! ```
//!
//! Each spectrogram column `i` reads `patch[i*hop .. i*hop + window]`; the
//! last column ends exactly at `patch_len`, so consecutive patches tile the
//! stream with no column skipped or repeated.

use crate::error::{EarshotError, Result};

/// Capture sample rate in Hz. The capture driver is configured for this rate;
/// no resampling happens anywhere in the pipeline.
pub const SAMPLE_RATE: u32 = 16_000;

/// Samples per ping-pong capture buffer (both halves). The driver raises one
/// half-transfer event per `CAPTURE_BUFFER_LEN / 2` samples.
pub const CAPTURE_BUFFER_LEN: usize = 1_024;

/// Bounded depth of every task message queue.
pub const QUEUE_DEPTH: usize = 10;

/// Number of busy/sleep slices one load-generation run performs.
pub const LOAD_GEN_NB_RUN: u32 = 100;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Capture/playback sample rate (Hz).
    pub sample_rate: u32,
    /// FFT length for one spectrogram column. Must be >= `window_len`.
    pub fft_len: usize,
    /// Analysis window length in samples.
    pub window_len: usize,
    /// Hop between consecutive spectrogram columns in samples.
    pub hop_len: usize,
    /// Mel filterbank size.
    pub mel_bins: usize,
    /// Spectrogram columns per patch.
    pub num_columns: usize,
    /// Total ping-pong capture buffer length in samples (two halves).
    pub capture_buffer_len: usize,
    /// Message queue depth for the task variant.
    pub queue_depth: usize,
    /// Noise gate threshold in dBFS. Output frames below this level are muted.
    pub gate_threshold_db: f32,
    /// Spectral energy below which classification results are not reported.
    pub silence_threshold: f32,
    /// Scores below this are reported as "unknown".
    pub ood_threshold: f32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            fft_len: 512,
            window_len: 400,
            hop_len: 160,
            mel_bins: 64,
            num_columns: 30,
            capture_buffer_len: CAPTURE_BUFFER_LEN,
            queue_depth: QUEUE_DEPTH,
            gate_threshold_db: -50.0,
            silence_threshold: 0.5,
            ood_threshold: 0.5,
        }
    }
}

impl PipelineConfig {
    /// Samples carried over from the previous patch.
    pub fn patch_overlap(&self) -> usize {
        self.window_len - self.hop_len
    }

    /// Fresh samples consumed from the capture ring each cycle.
    pub fn patch_no_overlap(&self) -> usize {
        self.num_columns * self.hop_len
    }

    /// Total patch length handed to the feature extractor.
    pub fn patch_len(&self) -> usize {
        self.patch_overlap() + self.patch_no_overlap()
    }

    /// Samples per half-transfer event.
    pub fn capture_half_len(&self) -> usize {
        self.capture_buffer_len / 2
    }

    /// Capture ring capacity: the smallest multiple of the capture buffer
    /// that holds one full patch, double-buffered.
    pub fn capture_ring_len(&self) -> usize {
        ((self.patch_len() / self.capture_buffer_len) + 1) * self.capture_buffer_len * 2
    }

    /// Playback ring capacity, sized for double-buffered output.
    pub fn playback_ring_len(&self) -> usize {
        self.patch_len() * 4
    }

    /// Feature patch length produced by the extractor (int8 elements).
    pub fn feature_len(&self) -> usize {
        self.mel_bins * self.num_columns
    }

    /// Reject configurations the pipeline cannot run.
    ///
    /// These are boot-time fatal conditions: once the stream is started all
    /// sizes are trusted.
    pub fn validate(&self) -> Result<()> {
        if self.window_len == 0 || self.hop_len == 0 || self.num_columns == 0 {
            return Err(EarshotError::Config(
                "window_len, hop_len and num_columns must be non-zero".into(),
            ));
        }
        if self.hop_len > self.window_len {
            return Err(EarshotError::Config(format!(
                "hop_len ({}) must not exceed window_len ({})",
                self.hop_len, self.window_len
            )));
        }
        if self.window_len > self.fft_len {
            return Err(EarshotError::Config(format!(
                "window_len ({}) must not exceed fft_len ({})",
                self.window_len, self.fft_len
            )));
        }
        if self.capture_buffer_len == 0 || self.capture_buffer_len % 2 != 0 {
            return Err(EarshotError::Config(format!(
                "capture_buffer_len ({}) must be even and non-zero",
                self.capture_buffer_len
            )));
        }
        if self.capture_half_len() > self.capture_ring_len() {
            return Err(EarshotError::Config(
                "capture ring smaller than one half-transfer".into(),
            ));
        }
        if self.mel_bins == 0 || self.mel_bins > self.fft_len / 2 {
            return Err(EarshotError::Config(format!(
                "mel_bins ({}) must be in 1..={}",
                self.mel_bins,
                self.fft_len / 2
            )));
        }
        if self.queue_depth == 0 {
            return Err(EarshotError::Config("queue_depth must be non-zero".into()));
        }
        Ok(())
    }
}
