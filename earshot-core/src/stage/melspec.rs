//! Streaming log-mel spectrogram extractor.
//!
//! One patch of overlapping audio in, one quantized feature patch out:
//!
//! 1. Slice the patch into `num_columns` windows of `window_len` samples,
//!    `hop_len` apart (the framer guarantees the last window ends exactly at
//!    the patch boundary).
//! 2. Hann-window each column, zero-pad to `fft_len`, forward FFT.
//! 3. Power spectrum over the `fft_len/2 + 1` real bins.
//! 4. Mel filterbank, log10, affine int8 quantization.
//!
//! The complex spectrum of every column is retained for the synthesizer's
//! phase prior. All scratch is pre-allocated in `new`; `extract` does not
//! allocate.

use std::f32::consts::PI;
use std::sync::Arc;

use rustfft::{num_complex::Complex32, Fft, FftPlanner};

use crate::config::PipelineConfig;
use crate::error::{EarshotError, Result};
use crate::stage::{FeatureExtractor, QuantParams};

/// Floor for the log, keeping silence finite.
const LOG_FLOOR: f32 = 1e-10;

pub struct LogMelExtractor {
    window_len: usize,
    hop_len: usize,
    fft_len: usize,
    num_columns: usize,
    mel_bins: usize,

    fft: Arc<dyn Fft<f32>>,
    hann: Vec<f32>,
    /// Triangular filters, one row of `fft_len/2 + 1` weights per mel bin.
    filter_bank: Vec<Vec<f32>>,

    // scratch, reused every patch
    fft_buf: Vec<Complex32>,
    power: Vec<f32>,
    /// Interleaved re/im for each column of the last patch.
    spectrum: Vec<f32>,
    spectral_energy: f32,

    quant: QuantParams,
}

impl LogMelExtractor {
    pub fn new(cfg: &PipelineConfig) -> Result<Self> {
        cfg.validate()?;
        let bins = cfg.fft_len / 2 + 1;
        let fft = FftPlanner::new().plan_fft_forward(cfg.fft_len);

        // Periodic Hann window.
        let hann: Vec<f32> = (0..cfg.window_len)
            .map(|n| 0.5 - 0.5 * (2.0 * PI * n as f32 / cfg.window_len as f32).cos())
            .collect();

        let filter_bank = build_mel_filter_bank(cfg.mel_bins, bins, cfg.fft_len, cfg.sample_rate)?;

        Ok(Self {
            window_len: cfg.window_len,
            hop_len: cfg.hop_len,
            fft_len: cfg.fft_len,
            num_columns: cfg.num_columns,
            mel_bins: cfg.mel_bins,
            fft,
            hann,
            filter_bank,
            fft_buf: vec![Complex32::new(0.0, 0.0); cfg.fft_len],
            power: vec![0.0; bins],
            spectrum: vec![0.0; cfg.num_columns * bins * 2],
            spectral_energy: 0.0,
            quant: QuantParams::default(),
        })
    }

    fn bins(&self) -> usize {
        self.fft_len / 2 + 1
    }
}

impl FeatureExtractor for LogMelExtractor {
    fn patch_len(&self) -> usize {
        (self.num_columns - 1) * self.hop_len + self.window_len
    }

    fn feature_len(&self) -> usize {
        self.num_columns * self.mel_bins
    }

    fn extract(&mut self, samples: &[i16], features: &mut [i8]) -> Result<()> {
        if samples.len() != self.patch_len() {
            return Err(EarshotError::PreProcess(format!(
                "patch length {} != expected {}",
                samples.len(),
                self.patch_len()
            )));
        }
        if features.len() != self.feature_len() {
            return Err(EarshotError::PreProcess(format!(
                "feature length {} != expected {}",
                features.len(),
                self.feature_len()
            )));
        }

        let bins = self.bins();
        let mut energy = 0.0f32;

        for col in 0..self.num_columns {
            let frame = &samples[col * self.hop_len..col * self.hop_len + self.window_len];

            for (i, slot) in self.fft_buf.iter_mut().enumerate() {
                let windowed = if i < self.window_len {
                    frame[i] as f32 / 32768.0 * self.hann[i]
                } else {
                    0.0
                };
                *slot = Complex32::new(windowed, 0.0);
            }
            self.fft.process(&mut self.fft_buf);

            let col_spectrum = &mut self.spectrum[col * bins * 2..(col + 1) * bins * 2];
            for (bin, c) in self.fft_buf[..bins].iter().enumerate() {
                col_spectrum[bin * 2] = c.re;
                col_spectrum[bin * 2 + 1] = c.im;
                self.power[bin] = c.re * c.re + c.im * c.im;
            }

            for (m, filter) in self.filter_bank.iter().enumerate() {
                let mel: f32 = filter
                    .iter()
                    .zip(self.power.iter())
                    .map(|(w, p)| w * p)
                    .sum();
                energy += mel;
                let log_mel = mel.max(LOG_FLOOR).log10();
                features[col * self.mel_bins + m] = self.quant.quantize(log_mel);
            }
        }

        self.spectral_energy = energy;
        Ok(())
    }

    fn complex_spectrum(&self) -> &[f32] {
        &self.spectrum
    }

    fn spectral_energy(&self) -> f32 {
        self.spectral_energy
    }

    fn set_output_quant(&mut self, quant: QuantParams) {
        self.quant = quant;
    }
}

/// HTK-style triangular mel filterbank over the real FFT bins.
fn build_mel_filter_bank(
    mel_bins: usize,
    bins: usize,
    fft_len: usize,
    sample_rate: u32,
) -> Result<Vec<Vec<f32>>> {
    let hz_to_mel = |hz: f32| 2595.0 * (1.0 + hz / 700.0).log10();
    let mel_to_hz = |mel: f32| 700.0 * (10f32.powf(mel / 2595.0) - 1.0);

    let nyquist = sample_rate as f32 / 2.0;
    let mel_max = hz_to_mel(nyquist);
    // mel_bins + 2 evenly spaced edge points from 0 Hz to Nyquist.
    let points: Vec<f32> = (0..mel_bins + 2)
        .map(|i| {
            let hz = mel_to_hz(mel_max * i as f32 / (mel_bins + 1) as f32);
            hz * fft_len as f32 / sample_rate as f32
        })
        .collect();

    let mut bank = Vec::with_capacity(mel_bins);
    for m in 0..mel_bins {
        let (left, center, right) = (points[m], points[m + 1], points[m + 2]);
        if right - left < f32::EPSILON {
            return Err(EarshotError::Config(format!(
                "mel filter {m} is degenerate — too many mel bins for fft_len {fft_len}"
            )));
        }
        let mut row = vec![0.0f32; bins];
        for (bin, w) in row.iter_mut().enumerate() {
            let f = bin as f32;
            if f > left && f < center {
                *w = (f - left) / (center - left);
            } else if f >= center && f < right {
                *w = (right - f) / (right - center);
            }
        }
        bank.push(row);
    }
    Ok(bank)
}
