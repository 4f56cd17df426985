//! Demo inference engine: spectral band-energy classifier.
//!
//! Stands in for an NPU-deployed model while exercising the exact pipeline
//! contract — quantized int8 input/output tensors with fixed shapes. It
//! averages the log-mel patch over three frequency bands and emits a score
//! distribution over {quiet, low-band, mid-band, high-band}.

use earshot_core::{EarshotError, InferenceEngine, QuantParams};
use tracing::debug;

/// Mean log-mel level (dequantized) below which the patch is called quiet.
const QUIET_MEAN_LOG_MEL: f32 = -6.0;

pub const LABELS: [&str; 4] = ["quiet", "low-band", "mid-band", "high-band"];

pub struct BandEnergyClassifier {
    mel_bins: usize,
    num_columns: usize,
    input_quant: QuantParams,
    output_quant: QuantParams,
}

impl BandEnergyClassifier {
    pub fn new(mel_bins: usize, num_columns: usize) -> Self {
        Self {
            mel_bins,
            num_columns,
            input_quant: QuantParams {
                scale: 0.1,
                zero_point: 0,
            },
            output_quant: QuantParams {
                scale: 0.01,
                zero_point: 0,
            },
        }
    }

    pub fn labels() -> Vec<String> {
        LABELS.iter().map(|s| s.to_string()).collect()
    }

    /// Mean dequantized log-mel over one band of bins, across all columns.
    fn band_mean(&self, features: &[i8], band: std::ops::Range<usize>) -> f32 {
        let mut sum = 0.0f32;
        let mut count = 0usize;
        for col in 0..self.num_columns {
            for bin in band.clone() {
                sum += self.input_quant.dequantize(features[col * self.mel_bins + bin]);
                count += 1;
            }
        }
        sum / count.max(1) as f32
    }
}

impl InferenceEngine for BandEnergyClassifier {
    fn input_len(&self) -> usize {
        self.mel_bins * self.num_columns
    }

    fn output_len(&self) -> usize {
        LABELS.len()
    }

    fn input_quant(&self) -> QuantParams {
        self.input_quant
    }

    fn output_quant(&self) -> QuantParams {
        self.output_quant
    }

    fn warm_up(&mut self) -> earshot_core::error::Result<()> {
        // Run one dummy pass so the first real cycle pays no cold-start cost.
        let input = vec![0i8; self.input_len()];
        let mut output = vec![0i8; self.output_len()];
        self.infer(&input, &mut output)?;
        debug!("band-energy classifier warmed up");
        Ok(())
    }

    fn infer(&mut self, input: &[i8], output: &mut [i8]) -> earshot_core::error::Result<()> {
        if input.len() != self.input_len() || output.len() != self.output_len() {
            return Err(EarshotError::Inference(format!(
                "tensor shape mismatch: in {} out {}",
                input.len(),
                output.len()
            )));
        }

        let third = self.mel_bins / 3;
        let low = self.band_mean(input, 0..third);
        let mid = self.band_mean(input, third..2 * third);
        let high = self.band_mean(input, 2 * third..self.mel_bins);
        let overall = (low + mid + high) / 3.0;

        let scores: [f32; 4] = if overall < QUIET_MEAN_LOG_MEL {
            [0.9, 0.03, 0.04, 0.03]
        } else {
            // Softmax over band means; quiet gets the leftover floor.
            let max = low.max(mid).max(high);
            let e = [(low - max).exp(), (mid - max).exp(), (high - max).exp()];
            let sum: f32 = e.iter().sum();
            [0.05, 0.95 * e[0] / sum, 0.95 * e[1] / sum, 0.95 * e[2] / sum]
        };

        for (slot, score) in output.iter_mut().zip(scores.iter()) {
            *slot = self.output_quant.quantize(*score);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quantized_patch(classifier: &BandEnergyClassifier, band: std::ops::Range<usize>) -> Vec<i8> {
        let q = classifier.input_quant();
        let mut features = vec![q.quantize(-10.0); classifier.input_len()];
        for col in 0..classifier.num_columns {
            for bin in band.clone() {
                features[col * classifier.mel_bins + bin] = q.quantize(2.0);
            }
        }
        features
    }

    #[test]
    fn loud_low_band_wins() {
        let mut c = BandEnergyClassifier::new(24, 4);
        let features = quantized_patch(&c, 0..8);
        let mut scores = vec![0i8; 4];
        c.infer(&features, &mut scores).unwrap();
        let argmax = scores.iter().enumerate().max_by_key(|(_, &s)| s).unwrap().0;
        assert_eq!(LABELS[argmax], "low-band");
    }

    #[test]
    fn silence_is_quiet() {
        let mut c = BandEnergyClassifier::new(24, 4);
        let q = c.input_quant();
        let features = vec![q.quantize(-10.0); c.input_len()];
        let mut scores = vec![0i8; 4];
        c.infer(&features, &mut scores).unwrap();
        let argmax = scores.iter().enumerate().max_by_key(|(_, &s)| s).unwrap().0;
        assert_eq!(LABELS[argmax], "quiet");
    }

    #[test]
    fn wrong_shape_is_rejected() {
        let mut c = BandEnergyClassifier::new(24, 4);
        let mut scores = vec![0i8; 4];
        assert!(c.infer(&[0i8; 3], &mut scores).is_err());
    }
}
