//! Processing-stage abstractions.
//!
//! The pipeline treats its three transform stages as black boxes with fixed
//! shapes, wired together at startup:
//!
//! ```text
//! patch[i16; patch_len] ──extract──► features[i8; feature_len]
//! features[i8; N]       ──infer────► scores/mask[i8; K]
//! mask[i8; K] + prior spectrum ──synthesize──► samples[i16; patch_len]
//! ```
//!
//! Shapes are checked once when the engine is built — a mismatch is a fatal
//! configuration error, never a per-cycle condition. All three stages are
//! synchronous and bounded-time; the orchestrator never blocks inside a
//! cycle.
//!
//! `&mut self` on the transform methods expresses that implementations are
//! stateful (FFT scratch, accelerator handles). The inference engine is
//! additionally shared through [`EngineHandle`]'s mutex so control surfaces
//! can warm it up or inspect it from outside the processing task.

pub mod melspec;
pub mod stub;

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;

/// Affine int8 quantization parameters, carried from the model into the
/// stages that produce or interpret quantized tensors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuantParams {
    pub scale: f32,
    pub zero_point: i8,
}

impl QuantParams {
    pub fn quantize(&self, value: f32) -> i8 {
        let q = (value / self.scale).round() + self.zero_point as f32;
        q.clamp(i8::MIN as f32, i8::MAX as f32) as i8
    }

    pub fn dequantize(&self, value: i8) -> f32 {
        (value as i32 - self.zero_point as i32) as f32 * self.scale
    }
}

impl Default for QuantParams {
    fn default() -> Self {
        Self {
            scale: 0.1,
            zero_point: 0,
        }
    }
}

/// Pre-processing: one audio patch in, one quantized feature patch out.
///
/// Implementations must be bit-reproducible: identical input produces
/// identical output, with no hidden state beyond scratch buffers (the overlap
/// history lives in the framer, not here).
pub trait FeatureExtractor: Send + 'static {
    /// Expected input patch length in samples.
    fn patch_len(&self) -> usize;
    /// Produced feature patch length in int8 elements.
    fn feature_len(&self) -> usize;
    /// Transform one patch. `features` has exactly `feature_len` elements.
    fn extract(&mut self, samples: &[i16], features: &mut [i8]) -> Result<()>;
    /// Complex spectrum of the last extracted patch (interleaved re/im per
    /// column), handed to the synthesizer as prior phase information. May be
    /// empty for extractors that do not retain it.
    fn complex_spectrum(&self) -> &[f32] {
        &[]
    }
    /// Spectral energy of the last extracted patch, for silence gating.
    fn spectral_energy(&self) -> f32 {
        f32::INFINITY
    }
    /// Adopt the model's input quantization (transferred at engine build).
    fn set_output_quant(&mut self, _quant: QuantParams) {}
}

/// Neural-network inference: fixed-shape, synchronous, bounded latency.
pub trait InferenceEngine: Send + 'static {
    /// Expected input tensor length in int8 elements.
    fn input_len(&self) -> usize;
    /// Produced output tensor length in int8 elements.
    fn output_len(&self) -> usize;
    /// Quantization of the input tensor, transferred to the extractor.
    fn input_quant(&self) -> QuantParams {
        QuantParams::default()
    }
    /// Quantization of the output tensor.
    fn output_quant(&self) -> QuantParams {
        QuantParams::default()
    }
    /// One-time warm-up: load weights, run a dummy inference. Called once
    /// before the stream starts.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
    /// Run one inference pass.
    fn infer(&mut self, input: &[i8], output: &mut [i8]) -> Result<()>;
}

/// Thread-safe shared handle to any `InferenceEngine` implementor.
#[derive(Clone)]
pub struct EngineHandle(pub Arc<Mutex<dyn InferenceEngine>>);

impl EngineHandle {
    pub fn new<E: InferenceEngine>(engine: E) -> Self {
        Self(Arc::new(Mutex::new(engine)))
    }
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle").finish_non_exhaustive()
    }
}

/// Post-processing: spectrum mask plus prior complex spectrum back to audio.
pub trait Synthesizer: Send + 'static {
    /// Expected mask length in int8 elements.
    fn mask_len(&self) -> usize;
    /// Produced sample count.
    fn output_len(&self) -> usize;
    /// Reconstruct one patch of audio.
    fn synthesize(&mut self, mask: &[i8], prior_spectrum: &[f32], out: &mut [i16]) -> Result<()>;
}

/// A resolved classification result.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub label: String,
    pub score: f32,
}

/// Argmax over a quantized score distribution, reporting "unknown" when the
/// best score stays below the out-of-distribution threshold.
pub fn top_class(
    scores: &[i8],
    quant: QuantParams,
    labels: &[String],
    ood_threshold: f32,
) -> Detection {
    let mut best_idx = 0usize;
    let mut best = i8::MIN;
    for (i, &q) in scores.iter().enumerate() {
        if q > best {
            best = q;
            best_idx = i;
        }
    }
    let score = quant.dequantize(best);
    let label = if score > ood_threshold {
        labels
            .get(best_idx)
            .cloned()
            .unwrap_or_else(|| "unknown".to_string())
    } else {
        "unknown".to_string()
    };
    Detection { label, score }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantize_round_trips_within_one_step() {
        let q = QuantParams {
            scale: 0.05,
            zero_point: -10,
        };
        for value in [-3.0f32, -0.07, 0.0, 0.51, 2.4] {
            let back = q.dequantize(q.quantize(value));
            assert!((back - value).abs() <= q.scale, "value={value} back={back}");
        }
    }

    #[test]
    fn quantize_saturates_at_i8_range() {
        let q = QuantParams {
            scale: 0.1,
            zero_point: 0,
        };
        assert_eq!(q.quantize(1e6), i8::MAX);
        assert_eq!(q.quantize(-1e6), i8::MIN);
    }

    #[test]
    fn top_class_picks_argmax() {
        let labels = vec!["quiet".to_string(), "alarm".to_string(), "speech".to_string()];
        let quant = QuantParams {
            scale: 0.01,
            zero_point: 0,
        };
        let detection = top_class(&[5, 90, 17], quant, &labels, 0.5);
        assert_eq!(detection.label, "alarm");
        assert!((detection.score - 0.9).abs() < 1e-5);
    }

    #[test]
    fn top_class_reports_unknown_below_ood_threshold() {
        let labels = vec!["quiet".to_string(), "alarm".to_string()];
        let quant = QuantParams {
            scale: 0.01,
            zero_point: 0,
        };
        let detection = top_class(&[10, 30], quant, &labels, 0.5);
        assert_eq!(detection.label, "unknown");
    }
}
