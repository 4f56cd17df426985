//! Pipeline orchestration.
//!
//! One processing cycle walks a fixed sequence under a fixed budget:
//!
//! ```text
//! WAIT_DATA → FRAME → PREPROCESS → INFER → POSTPROCESS → (PLAYBACK) → WAIT_DATA
//! ```
//!
//! Two scheduling strategies drive that cycle (chosen at start, see
//! [`polling`] and [`tasks`]); the cycle itself is identical in both. Stage
//! failures surface as `Result` values: the driving loop logs them, skips
//! event emission and playback for that cycle, and keeps going — cadence is
//! what the deadlines depend on, so a bad cycle must cost exactly one cycle.
//!
//! The "processing enabled" toggle only selects what reaches the output
//! (processed audio + detections vs. raw pass-through); the cycle always
//! runs, always consumes its chunk, and always keeps the overlap chain
//! intact.

pub mod polling;
pub mod tasks;

use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc,
};

use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::config::PipelineConfig;
use crate::dvfs::DvfsGovernor;
use crate::error::{EarshotError, Result};
use crate::events::{DetectionEvent, LevelEvent};
use crate::framer::PatchFramer;
use crate::playback::PlaybackSink;
use crate::ring::SampleRing;
use crate::stage::{top_class, Detection, EngineHandle, FeatureExtractor, Synthesizer};

/// Shared pipeline counters for observability.
#[derive(Default)]
pub struct PipelineDiagnostics {
    pub cycles: AtomicUsize,
    pub skipped_cycles: AtomicUsize,
    pub stage_errors: AtomicUsize,
    pub detections_emitted: AtomicUsize,
    pub gated_frames: AtomicUsize,
    pub dropped_messages: AtomicUsize,
}

impl PipelineDiagnostics {
    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            skipped_cycles: self.skipped_cycles.load(Ordering::Relaxed),
            stage_errors: self.stage_errors.load(Ordering::Relaxed),
            detections_emitted: self.detections_emitted.load(Ordering::Relaxed),
            gated_frames: self.gated_frames.load(Ordering::Relaxed),
            dropped_messages: self.dropped_messages.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DiagnosticsSnapshot {
    pub cycles: usize,
    pub skipped_cycles: usize,
    pub stage_errors: usize,
    pub detections_emitted: usize,
    pub gated_frames: usize,
    pub dropped_messages: usize,
}

/// Result of one completed cycle.
#[derive(Debug, Clone)]
pub struct CycleOutcome {
    pub seq: u64,
    /// Present when processing was enabled and the patch was not silent.
    pub detection: Option<Detection>,
    /// Output frame level in dBFS (pre-gate).
    pub level_db: f32,
    pub gated: bool,
    /// Whether the output came from the synthesizer (vs. raw pass-through).
    pub used_processing: bool,
}

/// All state owned by the processing loop/task. Exclusively owned — only the
/// capture ring inside is shared with the producer side.
pub struct ProcessingContext {
    pub config: PipelineConfig,
    pub ring: Arc<SampleRing>,
    pub running: Arc<AtomicBool>,
    pub proc_enabled: Arc<AtomicBool>,
    pub dvfs: Arc<DvfsGovernor>,
    pub detection_tx: broadcast::Sender<DetectionEvent>,
    pub level_tx: broadcast::Sender<LevelEvent>,
    pub seq: Arc<AtomicU64>,
    pub diagnostics: Arc<PipelineDiagnostics>,

    framer: PatchFramer,
    extractor: Box<dyn FeatureExtractor>,
    engine: EngineHandle,
    synthesizer: Box<dyn Synthesizer>,
    playback: Option<PlaybackSink>,
    labels: Vec<String>,

    // per-cycle scratch, allocated once
    features: Vec<i8>,
    scores: Vec<i8>,
    audio_out: Vec<i16>,
    play_frame: Vec<i16>,
}

/// Everything the context needs besides the stages themselves.
pub struct ContextShared {
    pub config: PipelineConfig,
    pub ring: Arc<SampleRing>,
    pub running: Arc<AtomicBool>,
    pub proc_enabled: Arc<AtomicBool>,
    pub dvfs: Arc<DvfsGovernor>,
    pub detection_tx: broadcast::Sender<DetectionEvent>,
    pub level_tx: broadcast::Sender<LevelEvent>,
    pub seq: Arc<AtomicU64>,
    pub diagnostics: Arc<PipelineDiagnostics>,
}

impl ProcessingContext {
    /// Wire the stages together, checking every shape once.
    ///
    /// A mismatch here is a fatal startup error: the pipeline never checks
    /// shapes again after this point.
    pub fn new(
        shared: ContextShared,
        extractor: Box<dyn FeatureExtractor>,
        engine: EngineHandle,
        synthesizer: Box<dyn Synthesizer>,
        playback: Option<PlaybackSink>,
        labels: Vec<String>,
    ) -> Result<Self> {
        let cfg = &shared.config;
        cfg.validate()?;

        if extractor.patch_len() != cfg.patch_len() {
            return Err(EarshotError::ShapeMismatch {
                stage: "extractor patch",
                expected: extractor.patch_len(),
                actual: cfg.patch_len(),
            });
        }
        let (input_len, output_len) = {
            let engine = engine.0.lock();
            (engine.input_len(), engine.output_len())
        };
        if extractor.feature_len() != input_len {
            return Err(EarshotError::ShapeMismatch {
                stage: "inference input",
                expected: input_len,
                actual: extractor.feature_len(),
            });
        }
        if synthesizer.mask_len() != output_len {
            return Err(EarshotError::ShapeMismatch {
                stage: "synthesizer mask",
                expected: synthesizer.mask_len(),
                actual: output_len,
            });
        }
        if synthesizer.output_len() < cfg.patch_no_overlap() {
            return Err(EarshotError::ShapeMismatch {
                stage: "synthesizer output",
                expected: cfg.patch_no_overlap(),
                actual: synthesizer.output_len(),
            });
        }

        let features = vec![0i8; extractor.feature_len()];
        let scores = vec![0i8; output_len];
        let audio_out = vec![0i16; synthesizer.output_len()];
        let play_frame = vec![0i16; cfg.patch_no_overlap()];
        let framer = PatchFramer::new(cfg.patch_len(), cfg.patch_overlap());

        Ok(Self {
            config: shared.config,
            ring: shared.ring,
            running: shared.running,
            proc_enabled: shared.proc_enabled,
            dvfs: shared.dvfs,
            detection_tx: shared.detection_tx,
            level_tx: shared.level_tx,
            seq: shared.seq,
            diagnostics: shared.diagnostics,
            framer,
            extractor,
            engine,
            synthesizer,
            playback,
            labels,
            features,
            scores,
            audio_out,
            play_frame,
        })
    }

    /// Fresh samples one cycle consumes.
    pub fn chunk_len(&self) -> usize {
        self.framer.no_overlap_len()
    }

    /// Flip the processing-enabled gate. Cycle cadence is unaffected.
    pub fn toggle_processing(&self) {
        let was = self.proc_enabled.fetch_xor(true, Ordering::SeqCst);
        info!(enabled = !was, "audio processing toggled");
    }

    /// Run one full processing cycle.
    ///
    /// Returns `Ok(None)` when the ring does not yet hold a full chunk (the
    /// wait-data state). Stage errors propagate as `Err` after the chunk has
    /// been consumed, so a failed cycle still advances the stream by exactly
    /// one chunk.
    pub fn run_cycle(&mut self) -> Result<Option<CycleOutcome>> {
        // Hold the high-performance clock state for the whole cycle; the
        // guard releases it on every exit path below.
        let _opp = self.dvfs.request_max();

        if self.framer.next_patch(&self.ring).is_none() {
            self.diagnostics.skipped_cycles.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }
        self.diagnostics.cycles.fetch_add(1, Ordering::Relaxed);
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);

        self.extractor
            .extract(self.framer.patch(), &mut self.features)?;
        let energy = self.extractor.spectral_energy();

        self.engine.0.lock().infer(&self.features, &mut self.scores)?;

        self.synthesizer.synthesize(
            &self.scores,
            self.extractor.complex_spectrum(),
            &mut self.audio_out,
        )?;

        let enabled = self.proc_enabled.load(Ordering::SeqCst);

        let mut detection = None;
        if enabled && energy > self.config.silence_threshold {
            let quant = self.engine.0.lock().output_quant();
            let result = top_class(&self.scores, quant, &self.labels, self.config.ood_threshold);
            debug!(seq, label = %result.label, score = result.score, "patch classified");
            if self.detection_tx.send(DetectionEvent {
                seq,
                label: result.label.clone(),
                score: result.score,
            })
            .is_ok()
            {
                self.diagnostics
                    .detections_emitted
                    .fetch_add(1, Ordering::Relaxed);
            }
            detection = Some(result);
        }

        // Processing disabled falls back to raw pass-through so the output
        // cadence never changes with the toggle.
        let chunk = self.play_frame.len();
        if enabled {
            self.play_frame.copy_from_slice(&self.audio_out[..chunk]);
        } else {
            self.play_frame.copy_from_slice(self.framer.fresh_tail());
        }

        let (level_db, gated) = match self.playback.as_mut() {
            Some(sink) => {
                let (db, was_gated) = sink.push_frame(&mut self.play_frame)?;
                if was_gated {
                    self.diagnostics.gated_frames.fetch_add(1, Ordering::Relaxed);
                }
                (db, was_gated)
            }
            None => (crate::playback::level_db(&self.play_frame), false),
        };
        let _ = self.level_tx.send(LevelEvent {
            seq,
            level_db,
            gated,
        });

        Ok(Some(CycleOutcome {
            seq,
            detection,
            level_db,
            gated,
            used_processing: enabled,
        }))
    }

    /// Retire one played output half (output driver callback path).
    pub fn playback_half_complete(&self) {
        if let Some(sink) = self.playback.as_ref() {
            sink.half_transfer_complete();
        }
    }

    pub(crate) fn log_summary(&self) {
        let snap = self.diagnostics.snapshot();
        info!(
            cycles = snap.cycles,
            skipped = snap.skipped_cycles,
            stage_errors = snap.stage_errors,
            detections = snap.detections_emitted,
            gated_frames = snap.gated_frames,
            dropped_messages = snap.dropped_messages,
            ring_overruns = self.ring.overruns(),
            "pipeline stopped — diagnostics"
        );
    }
}
