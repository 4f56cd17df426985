//! Scripted stage implementations for tests and bring-up.
//!
//! These run the full pipeline deterministically with no DSP or model
//! dependency: the extractor truncates samples to int8, the engine echoes or
//! fails on cue, the synthesizer emits a constant-amplitude frame.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{EarshotError, Result};
use crate::stage::{FeatureExtractor, InferenceEngine, QuantParams, Synthesizer};

/// Truncating extractor: `features[i] = patch[i] >> 8`. Records every patch
/// it sees so tests can assert on the exact framed input.
pub struct TruncatingExtractor {
    patch_len: usize,
    feature_len: usize,
    pub patches_seen: Arc<Mutex<Vec<Vec<i16>>>>,
    energy: f32,
}

impl TruncatingExtractor {
    pub fn new(patch_len: usize, feature_len: usize) -> Self {
        Self {
            patch_len,
            feature_len,
            patches_seen: Arc::new(Mutex::new(Vec::new())),
            energy: 1.0,
        }
    }

    /// Force the reported spectral energy (drives silence gating in tests).
    pub fn with_energy(mut self, energy: f32) -> Self {
        self.energy = energy;
        self
    }
}

impl FeatureExtractor for TruncatingExtractor {
    fn patch_len(&self) -> usize {
        self.patch_len
    }

    fn feature_len(&self) -> usize {
        self.feature_len
    }

    fn extract(&mut self, samples: &[i16], features: &mut [i8]) -> Result<()> {
        self.patches_seen.lock().push(samples.to_vec());
        for (f, s) in features.iter_mut().zip(samples.iter().cycle()) {
            *f = (s >> 8) as i8;
        }
        Ok(())
    }

    fn spectral_energy(&self) -> f32 {
        self.energy
    }
}

/// Echo engine: copies input to output (shapes permitting) and can be
/// scripted to fail on selected calls.
pub struct EchoEngine {
    input_len: usize,
    output_len: usize,
    pub calls: Arc<AtomicUsize>,
    fail_on: Option<usize>,
}

impl EchoEngine {
    pub fn new(input_len: usize, output_len: usize) -> Self {
        Self {
            input_len,
            output_len,
            calls: Arc::new(AtomicUsize::new(0)),
            fail_on: None,
        }
    }

    /// Fail the `n`-th infer call (0-based) with an inference error.
    pub fn failing_on(mut self, n: usize) -> Self {
        self.fail_on = Some(n);
        self
    }
}

impl InferenceEngine for EchoEngine {
    fn input_len(&self) -> usize {
        self.input_len
    }

    fn output_len(&self) -> usize {
        self.output_len
    }

    fn infer(&mut self, input: &[i8], output: &mut [i8]) -> Result<()> {
        let call = self.calls.fetch_add(1, Ordering::Relaxed);
        if self.fail_on == Some(call) {
            return Err(EarshotError::Inference("scripted failure".into()));
        }
        for (o, i) in output.iter_mut().zip(input.iter().cycle()) {
            *o = *i;
        }
        Ok(())
    }
}

/// Constant-score engine: every inference produces the same distribution.
pub struct ConstantEngine {
    input_len: usize,
    scores: Vec<i8>,
    quant: QuantParams,
}

impl ConstantEngine {
    pub fn new(input_len: usize, scores: Vec<i8>, quant: QuantParams) -> Self {
        Self {
            input_len,
            scores,
            quant,
        }
    }
}

impl InferenceEngine for ConstantEngine {
    fn input_len(&self) -> usize {
        self.input_len
    }

    fn output_len(&self) -> usize {
        self.scores.len()
    }

    fn output_quant(&self) -> QuantParams {
        self.quant
    }

    fn infer(&mut self, _input: &[i8], output: &mut [i8]) -> Result<()> {
        output.copy_from_slice(&self.scores);
        Ok(())
    }
}

/// Constant-amplitude synthesizer: every output sample is `amplitude`.
pub struct ToneSynthesizer {
    mask_len: usize,
    output_len: usize,
    amplitude: i16,
}

impl ToneSynthesizer {
    pub fn new(mask_len: usize, output_len: usize, amplitude: i16) -> Self {
        Self {
            mask_len,
            output_len,
            amplitude,
        }
    }
}

impl Synthesizer for ToneSynthesizer {
    fn mask_len(&self) -> usize {
        self.mask_len
    }

    fn output_len(&self) -> usize {
        self.output_len
    }

    fn synthesize(&mut self, _mask: &[i8], _prior_spectrum: &[f32], out: &mut [i16]) -> Result<()> {
        out.fill(self.amplitude);
        Ok(())
    }
}
