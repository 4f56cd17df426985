//! `AudioEngine` — top-level lifecycle controller.
//!
//! ## Lifecycle
//!
//! ```text
//! AudioEngine::new()
//!     └─► warm_up()          → model loaded, status = WarmingUp → Idle
//!         └─► start(mode)    → ring + tasks up, status = Running,
//!             │                 returns the capture session for the driver
//!             └─► stop()     → running=false, tasks joined, status = Stopped
//! ```
//!
//! The scheduling model is chosen once at `start` and cannot change while
//! running:
//!
//! - [`PipelineMode::Polling`] — one cooperative loop; capture hooks feed the
//!   ring directly from the callback.
//! - [`PipelineMode::Tasks`] — acquisition + processing tasks over bounded
//!   queues; capture hooks post `DataReady` messages.
//!
//! `start()`/`stop()` in the wrong state return an error rather than
//! panicking. The engine is `Send + Sync`; wrap it in `Arc` to share with
//! control surfaces.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};

use crossbeam_channel::bounded;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::info;

use crate::capture::{
    CaptureAdapter, CaptureHooks, DirectHooks, FaultHandler, PingPongBuffer, QueuedHooks,
};
use crate::config::PipelineConfig;
use crate::dvfs::{ClockScaler, DvfsGovernor, NoopScaler};
use crate::error::{EarshotError, Result};
use crate::events::{DetectionEvent, EngineStatus, LevelEvent, StatusEvent};
use crate::loadgen::LoadGenerator;
use crate::msg::Message;
use crate::pipeline::{
    polling, tasks::TaskPipeline, ContextShared, DiagnosticsSnapshot, PipelineDiagnostics,
    ProcessingContext,
};
use crate::playback::{OutputDriver, PlaybackSink};
use crate::ring::SampleRing;
use crate::stage::{EngineHandle, FeatureExtractor, Synthesizer};

/// Broadcast capacity for each event channel.
const BROADCAST_CAP: usize = 256;

/// Default load-generator tuning (slice length, busy share).
const LOAD_GEN_TIME_SLICE_MS: u32 = 50;
const LOAD_GEN_DUTY_CYCLE_PCT: u8 = 50;

/// Scheduling model, fixed at `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineMode {
    /// Single cooperative loop.
    Polling,
    /// Acquisition + processing tasks over message queues.
    Tasks,
}

/// The transform stages and output wiring the pipeline runs.
pub struct StageSet {
    pub extractor: Box<dyn FeatureExtractor>,
    pub engine: EngineHandle,
    pub synthesizer: Box<dyn Synthesizer>,
    /// Playback output, or `None` for a log-only pipeline.
    pub output: Option<Box<dyn OutputDriver>>,
    /// Class labels for the inference output distribution.
    pub labels: Vec<String>,
}

/// What the capture driver needs to deliver samples into a started engine.
pub struct CaptureSession {
    pub buffer: Arc<PingPongBuffer>,
    pub hooks: Arc<dyn CaptureHooks>,
}

enum Worker {
    Polling(JoinHandle<()>),
    Tasks(TaskPipeline),
}

pub struct AudioEngine {
    config: PipelineConfig,
    stages: Mutex<Option<StageSet>>,
    /// Shared handle to the inference engine, kept for warm-up.
    model: EngineHandle,
    running: Arc<AtomicBool>,
    proc_enabled: Arc<AtomicBool>,
    status: Arc<Mutex<EngineStatus>>,
    detection_tx: broadcast::Sender<DetectionEvent>,
    level_tx: broadcast::Sender<LevelEvent>,
    status_tx: broadcast::Sender<StatusEvent>,
    seq: Arc<AtomicU64>,
    diagnostics: Arc<PipelineDiagnostics>,
    /// Capture-side message drops, counted outside the pipeline tasks.
    capture_drops: Arc<AtomicUsize>,
    dvfs: Arc<DvfsGovernor>,
    worker: Mutex<Option<Worker>>,
    load_gen: Mutex<Option<LoadGenerator>>,
}

impl AudioEngine {
    /// Create an engine. Validates the configuration and transfers the
    /// model's input quantization to the feature extractor; does not start
    /// capturing.
    pub fn new(config: PipelineConfig, mut stages: StageSet) -> Result<Self> {
        config.validate()?;
        let input_quant = stages.engine.0.lock().input_quant();
        stages.extractor.set_output_quant(input_quant);

        let model = stages.engine.clone();
        let (detection_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (level_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (status_tx, _) = broadcast::channel(BROADCAST_CAP);

        Ok(Self {
            config,
            stages: Mutex::new(Some(stages)),
            model,
            running: Arc::new(AtomicBool::new(false)),
            // Processing is active by default.
            proc_enabled: Arc::new(AtomicBool::new(true)),
            status: Arc::new(Mutex::new(EngineStatus::Idle)),
            detection_tx,
            level_tx,
            status_tx,
            seq: Arc::new(AtomicU64::new(0)),
            diagnostics: Arc::new(PipelineDiagnostics::default()),
            capture_drops: Arc::new(AtomicUsize::new(0)),
            dvfs: Arc::new(DvfsGovernor::new(Box::new(NoopScaler))),
            worker: Mutex::new(None),
            load_gen: Mutex::new(None),
        })
    }

    /// Install a platform clock scaler (call before `start`).
    pub fn with_clock_scaler(mut self, scaler: Box<dyn ClockScaler>) -> Self {
        self.dvfs = Arc::new(DvfsGovernor::new(scaler));
        self
    }

    /// Warm up the inference engine (load weights, run a dummy pass).
    pub fn warm_up(&self) -> Result<()> {
        self.set_status(EngineStatus::WarmingUp, None);
        info!("warming up inference engine");
        self.model.0.lock().warm_up()?;
        self.set_status(EngineStatus::Idle, None);
        info!("inference engine ready");
        Ok(())
    }

    /// Start the pipeline in the given mode.
    ///
    /// Returns the capture session the driver delivers samples through. The
    /// pipeline runs in background threads until `stop()`.
    ///
    /// # Errors
    /// - `EarshotError::AlreadyRunning` when already started.
    /// - `EarshotError::ShapeMismatch` / `Config` for invalid wiring.
    pub fn start(&self, mode: PipelineMode) -> Result<CaptureSession> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(EarshotError::AlreadyRunning);
        }

        let stages = match self.stages.lock().take() {
            Some(stages) => stages,
            None => {
                self.running.store(false, Ordering::SeqCst);
                return Err(EarshotError::Config(
                    "engine already consumed its stages — build a new engine to restart".into(),
                ));
            }
        };

        match self.start_inner(mode, stages) {
            Ok(session) => {
                self.set_status(EngineStatus::Running, None);
                info!(?mode, "engine started");
                Ok(session)
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                self.set_status(EngineStatus::Error, Some(e.to_string()));
                Err(e)
            }
        }
    }

    fn start_inner(&self, mode: PipelineMode, stages: StageSet) -> Result<CaptureSession> {
        let ring = Arc::new(SampleRing::with_capacity(self.config.capture_ring_len())?);
        let buffer = Arc::new(PingPongBuffer::new(self.config.capture_buffer_len));
        let adapter = CaptureAdapter::new(Arc::clone(&ring), Arc::clone(&buffer));
        let fault = FaultHandler::new(Arc::clone(&self.running), self.status_tx.clone());

        let playback = match stages.output {
            Some(driver) => {
                let playback_ring =
                    Arc::new(SampleRing::with_capacity(self.config.playback_ring_len())?);
                Some(PlaybackSink::new(
                    playback_ring,
                    driver,
                    self.config.gate_threshold_db,
                ))
            }
            None => None,
        };

        let ctx = ProcessingContext::new(
            ContextShared {
                config: self.config.clone(),
                ring: Arc::clone(&ring),
                running: Arc::clone(&self.running),
                proc_enabled: Arc::clone(&self.proc_enabled),
                dvfs: Arc::clone(&self.dvfs),
                detection_tx: self.detection_tx.clone(),
                level_tx: self.level_tx.clone(),
                seq: Arc::clone(&self.seq),
                diagnostics: Arc::clone(&self.diagnostics),
            },
            stages.extractor,
            stages.engine,
            stages.synthesizer,
            playback,
            stages.labels,
        )?;

        let (worker, hooks): (Worker, Arc<dyn CaptureHooks>) = match mode {
            PipelineMode::Polling => {
                let hooks: Arc<dyn CaptureHooks> = Arc::new(DirectHooks::new(adapter, fault));
                let handle = thread::Builder::new()
                    .name("earshot-pipeline".into())
                    .spawn(move || polling::run(ctx))
                    .map_err(|e| EarshotError::Other(e.into()))?;
                (Worker::Polling(handle), hooks)
            }
            PipelineMode::Tasks => {
                let (acq_tx, acq_rx) = bounded::<Message>(self.config.queue_depth);
                let hooks: Arc<dyn CaptureHooks> = Arc::new(QueuedHooks::new(
                    acq_tx,
                    Arc::clone(&self.capture_drops),
                    fault,
                ));
                let pipeline = TaskPipeline::spawn(
                    ctx,
                    adapter,
                    acq_rx,
                    Arc::clone(&self.running),
                    self.config.queue_depth,
                );
                (Worker::Tasks(pipeline), hooks)
            }
        };

        *self.worker.lock() = Some(worker);
        Ok(CaptureSession { buffer, hooks })
    }

    /// Stop the pipeline. The capture driver should be stopped (dropped)
    /// first; any events it still raises are dropped harmlessly.
    ///
    /// # Errors
    /// - `EarshotError::NotRunning` when not currently running.
    pub fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(EarshotError::NotRunning);
        }
        info!("engine stop requested");

        match self.worker.lock().take() {
            Some(Worker::Polling(handle)) => {
                let _ = handle.join();
            }
            Some(Worker::Tasks(pipeline)) => pipeline.shutdown(),
            None => {}
        }
        *self.load_gen.lock() = None;

        self.set_status(EngineStatus::Stopped, None);
        info!("engine stopped");
        Ok(())
    }

    /// Flip the processing-enabled gate (control surface button 1).
    ///
    /// In task mode the request travels through the processing queue like any
    /// other control message; in polling mode the flag is flipped directly.
    pub fn toggle_processing(&self) {
        match self.worker.lock().as_ref() {
            Some(Worker::Tasks(pipeline)) => pipeline.toggle_processing(),
            _ => {
                let was = self.proc_enabled.fetch_xor(true, Ordering::SeqCst);
                info!(enabled = !was, "audio processing toggled");
            }
        }
    }

    /// Toggle synthetic load generation (control surface button 2).
    pub fn toggle_load_generation(&self) {
        let mut slot = self.load_gen.lock();
        let gen = slot.get_or_insert_with(|| {
            LoadGenerator::spawn(self.config.queue_depth, Arc::clone(&self.dvfs))
        });
        gen.toggle(LOAD_GEN_TIME_SLICE_MS, LOAD_GEN_DUTY_CYCLE_PCT);
    }

    /// Current engine status (snapshot).
    pub fn status(&self) -> EngineStatus {
        *self.status.lock()
    }

    /// Whether processing output is currently enabled.
    pub fn processing_enabled(&self) -> bool {
        self.proc_enabled.load(Ordering::SeqCst)
    }

    pub fn subscribe_detections(&self) -> broadcast::Receiver<DetectionEvent> {
        self.detection_tx.subscribe()
    }

    pub fn subscribe_levels(&self) -> broadcast::Receiver<LevelEvent> {
        self.level_tx.subscribe()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusEvent> {
        self.status_tx.subscribe()
    }

    /// Snapshot of pipeline counters, including capture-side message drops.
    pub fn diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        let mut snap = self.diagnostics.snapshot();
        snap.dropped_messages += self.capture_drops.load(Ordering::Relaxed);
        snap
    }

    fn set_status(&self, new_status: EngineStatus, detail: Option<String>) {
        *self.status.lock() = new_status;
        let _ = self.status_tx.send(StatusEvent {
            status: new_status,
            detail,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::stub::{EchoEngine, ToneSynthesizer, TruncatingExtractor};

    fn test_config() -> PipelineConfig {
        PipelineConfig {
            fft_len: 64,
            window_len: 48,
            hop_len: 16,
            mel_bins: 8,
            num_columns: 4,
            capture_buffer_len: 64,
            ..PipelineConfig::default()
        }
    }

    fn stages(cfg: &PipelineConfig) -> StageSet {
        let feature_len = cfg.feature_len();
        StageSet {
            extractor: Box::new(TruncatingExtractor::new(cfg.patch_len(), feature_len)),
            engine: EngineHandle::new(EchoEngine::new(feature_len, 4)),
            synthesizer: Box::new(ToneSynthesizer::new(4, cfg.patch_len(), 0)),
            output: None,
            labels: vec!["a".into(), "b".into()],
        }
    }

    #[test]
    fn lifecycle_start_stop_in_both_modes() {
        for mode in [PipelineMode::Polling, PipelineMode::Tasks] {
            let cfg = test_config();
            let engine = AudioEngine::new(cfg.clone(), stages(&cfg)).unwrap();
            engine.warm_up().unwrap();
            assert_eq!(engine.status(), EngineStatus::Idle);

            let _session = engine.start(mode).unwrap();
            assert_eq!(engine.status(), EngineStatus::Running);
            assert!(matches!(engine.start(mode), Err(EarshotError::AlreadyRunning)));

            engine.stop().unwrap();
            assert_eq!(engine.status(), EngineStatus::Stopped);
            assert!(matches!(engine.stop(), Err(EarshotError::NotRunning)));
        }
    }

    #[test]
    fn mismatched_stage_shapes_fail_at_start() {
        let cfg = test_config();
        let mut bad = stages(&cfg);
        bad.engine = EngineHandle::new(EchoEngine::new(7, 4)); // wrong input shape
        let engine = AudioEngine::new(cfg, bad).unwrap();
        let err = engine.start(PipelineMode::Polling);
        assert!(matches!(err, Err(EarshotError::ShapeMismatch { .. })));
        assert_eq!(engine.status(), EngineStatus::Error);
    }

    #[test]
    fn toggle_flips_processing_flag_in_polling_mode() {
        let cfg = test_config();
        let engine = AudioEngine::new(cfg, stages(&test_config())).unwrap();
        assert!(engine.processing_enabled());
        engine.toggle_processing();
        assert!(!engine.processing_enabled());
        engine.toggle_processing();
        assert!(engine.processing_enabled());
    }
}
