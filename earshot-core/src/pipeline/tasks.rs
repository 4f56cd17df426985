//! Two-task message-passing pipeline.
//!
//! The acquisition task and the processing task are independent schedulable
//! units joined only by bounded message queues and the capture ring:
//!
//! ```text
//! capture callback ──DataReady(half)──► acquisition task ──feed──► ring
//!                                             │ (chunk accumulated)
//!                                             └──DataBuffReady──► processing task ──► cycle
//! ```
//!
//! The acquisition task must never miss a hardware deadline, so it does only
//! the half-buffer copy and the availability check per message; the
//! processing task blocks on its queue between cycles and is woken once a
//! full chunk has accumulated. Sends are non-blocking (a full queue drops
//! the message and logs it), receives block, and each queue is FIFO — the
//! alternating half indices must be fed in arrival order or the overlap
//! chain breaks.
//!
//! Shutdown follows a fixed order: the capture side stops posting, the
//! acquisition task winds down and disconnects the processing queue, the
//! processing task drains whatever was already queued (without running
//! cycles once the running flag is down) and terminates last.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use crate::capture::CaptureAdapter;
use crate::msg::Message;
use crate::pipeline::{PipelineDiagnostics, ProcessingContext};

/// Acquisition-side poll interval for the shutdown flag while idle.
const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

/// Handles to the two running tasks plus their queue endpoints.
pub struct TaskPipeline {
    /// Control endpoint into the processing queue (toggle messages).
    proc_tx: Sender<Message>,
    acq_handle: Option<JoinHandle<()>>,
    proc_handle: Option<JoinHandle<()>>,
    diagnostics: Arc<PipelineDiagnostics>,
}

impl TaskPipeline {
    /// Spawn both tasks. `acq_rx` is the queue the capture hooks post
    /// `DataReady` into; its sender side lives in the driver hooks.
    pub fn spawn(
        ctx: ProcessingContext,
        adapter: CaptureAdapter,
        acq_rx: Receiver<Message>,
        running: Arc<AtomicBool>,
        queue_depth: usize,
    ) -> Self {
        let (proc_tx, proc_rx) = bounded::<Message>(queue_depth);
        let diagnostics = Arc::clone(&ctx.diagnostics);
        let chunk = ctx.chunk_len();

        let acq_handle = {
            let proc_tx = proc_tx.clone();
            let running = Arc::clone(&running);
            let diagnostics = Arc::clone(&diagnostics);
            thread::Builder::new()
                .name("earshot-acq".into())
                .spawn(move || acquisition_loop(adapter, acq_rx, proc_tx, running, chunk, diagnostics))
                .expect("spawn acquisition task")
        };

        let proc_handle = thread::Builder::new()
            .name("earshot-proc".into())
            .spawn(move || processing_loop(ctx, proc_rx))
            .expect("spawn processing task");

        Self {
            proc_tx,
            acq_handle: Some(acq_handle),
            proc_handle: Some(proc_handle),
            diagnostics,
        }
    }

    /// Post a processing-toggle request. Non-blocking; a full queue drops
    /// the request.
    pub fn toggle_processing(&self) {
        if self.proc_tx.try_send(Message::ToggleProc).is_err() {
            self.diagnostics
                .dropped_messages
                .fetch_add(1, Ordering::Relaxed);
            warn!("processing queue full, ToggleProc dropped");
        }
    }

    /// Join both tasks: acquisition first, processing last.
    ///
    /// The caller must have cleared the running flag and stopped the capture
    /// driver before calling this.
    pub fn shutdown(mut self) {
        if let Some(handle) = self.acq_handle.take() {
            let _ = handle.join();
        }
        // Drop our control endpoint so the processing queue disconnects once
        // the acquisition task's endpoint is gone too.
        let (dead_tx, _) = bounded::<Message>(1);
        self.proc_tx = dead_tx;
        if let Some(handle) = self.proc_handle.take() {
            let _ = handle.join();
        }
    }
}

/// Acquisition task body: feed ready halves, wake the processing task when a
/// chunk has accumulated.
fn acquisition_loop(
    adapter: CaptureAdapter,
    acq_rx: Receiver<Message>,
    proc_tx: Sender<Message>,
    running: Arc<AtomicBool>,
    chunk: usize,
    diagnostics: Arc<PipelineDiagnostics>,
) {
    info!("acquisition task started");
    loop {
        let msg = match acq_rx.recv_timeout(SHUTDOWN_POLL) {
            Ok(msg) => msg,
            Err(RecvTimeoutError::Timeout) => {
                if running.load(Ordering::Relaxed) {
                    continue;
                }
                break;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        };
        match msg {
            Message::DataReady { half } => {
                adapter.feed_half(half);
                if adapter.ring().available() >= chunk
                    && proc_tx.try_send(Message::DataBuffReady).is_err()
                {
                    // The processing task is still working on the previous
                    // wake-ups; dropping this one is safe because the next
                    // DataReady re-evaluates availability.
                    diagnostics.dropped_messages.fetch_add(1, Ordering::Relaxed);
                    debug!("processing queue full, DataBuffReady dropped");
                }
            }
            Message::StartAcq => info!("acquisition started"),
            other => debug!(?other, "acquisition task ignoring message"),
        }
    }
    info!("acquisition task stopped");
    // proc_tx drops here — the processing queue disconnects once the engine
    // releases its control endpoint as well.
}

/// Processing task body: block on the queue, run one cycle per wake-up.
fn processing_loop(mut ctx: ProcessingContext, proc_rx: Receiver<Message>) {
    info!("processing task started");
    while let Ok(msg) = proc_rx.recv() {
        if !ctx.running.load(Ordering::Relaxed) {
            // Stop requested: drain remaining messages without processing.
            continue;
        }
        match msg {
            Message::DataBuffReady => {
                if let Err(e) = ctx.run_cycle() {
                    ctx.diagnostics.stage_errors.fetch_add(1, Ordering::Relaxed);
                    warn!("cycle failed, output skipped: {e}");
                }
            }
            Message::ToggleProc => ctx.toggle_processing(),
            other => debug!(?other, "processing task ignoring message"),
        }
    }
    ctx.log_summary();
    info!("processing task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CaptureAdapter, PingPongBuffer, QueuedHooks};
    use crate::capture::{CaptureHooks, FaultHandler};
    use crate::config::PipelineConfig;
    use crate::dvfs::{DvfsGovernor, NoopScaler};
    use crate::pipeline::ContextShared;
    use crate::ring::SampleRing;
    use crate::stage::stub::{EchoEngine, ToneSynthesizer, TruncatingExtractor};
    use crate::stage::EngineHandle;
    use std::sync::atomic::{AtomicU64, AtomicUsize};
    use std::time::Instant;
    use tokio::sync::broadcast;

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

    #[test]
    fn dma_halves_flow_through_both_tasks_in_order() {
        let cfg = test_config();
        let ring = Arc::new(SampleRing::with_capacity(cfg.capture_ring_len()).unwrap());
        let buffer = Arc::new(PingPongBuffer::new(cfg.capture_buffer_len));
        let running = Arc::new(AtomicBool::new(true));
        let diagnostics = Arc::new(crate::pipeline::PipelineDiagnostics::default());
        let (detection_tx, _) = broadcast::channel(16);
        let (level_tx, _) = broadcast::channel(16);
        let (status_tx, _) = broadcast::channel(16);

        let feature_len = cfg.feature_len();
        let extractor = TruncatingExtractor::new(cfg.patch_len(), feature_len);
        let patches_seen = Arc::clone(&extractor.patches_seen);

        let ctx = ProcessingContext::new(
            ContextShared {
                config: cfg.clone(),
                ring: Arc::clone(&ring),
                running: Arc::clone(&running),
                proc_enabled: Arc::new(AtomicBool::new(true)),
                dvfs: Arc::new(DvfsGovernor::new(Box::new(NoopScaler))),
                detection_tx,
                level_tx,
                seq: Arc::new(AtomicU64::new(0)),
                diagnostics: Arc::clone(&diagnostics),
            },
            Box::new(extractor),
            EngineHandle::new(EchoEngine::new(feature_len, 4)),
            Box::new(ToneSynthesizer::new(4, cfg.patch_len(), 0)),
            None,
            vec![],
        )
        .unwrap();

        let (acq_tx, acq_rx) = bounded::<Message>(cfg.queue_depth);
        let fault = FaultHandler::new(Arc::clone(&running), status_tx);
        let hooks = QueuedHooks::new(acq_tx, Arc::new(AtomicUsize::new(0)), fault);
        let adapter = CaptureAdapter::new(Arc::clone(&ring), Arc::clone(&buffer));

        let pipeline = TaskPipeline::spawn(
            ctx,
            adapter,
            acq_rx,
            Arc::clone(&running),
            cfg.queue_depth,
        );

        // Simulate the capture driver: alternate halves 0/1 with a ramp so
        // ordering mistakes would show up in the framed patches.
        let half_len = cfg.capture_half_len();
        let mut next: i16 = 0;
        for i in 0..8u8 {
            let samples: Vec<i16> = (0..half_len as i16).map(|k| next + k).collect();
            next = next.wrapping_add(half_len as i16);
            buffer.write_half(i % 2, &samples);
            hooks.half_transfer(i % 2);
            thread::sleep(Duration::from_millis(5));
        }

        // 8 halves * 32 = 256 samples = 4 chunks of 64.
        let deadline = Instant::now() + Duration::from_secs(2);
        while patches_seen.lock().len() < 4 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        running.store(false, Ordering::SeqCst);
        pipeline.shutdown();

        let patches = patches_seen.lock();
        assert!(patches.len() >= 4, "expected 4 cycles, saw {}", patches.len());
        // Reassembled fresh tails must reproduce the captured ramp exactly.
        let overlap = cfg.patch_overlap();
        let mut reassembled = Vec::new();
        for patch in patches.iter().take(4) {
            reassembled.extend_from_slice(&patch[overlap..]);
        }
        let expect: Vec<i16> = (0..256i16).collect();
        assert_eq!(reassembled, expect);
    }

    #[test]
    fn shutdown_joins_cleanly_with_no_traffic() {
        let cfg = test_config();
        let ring = Arc::new(SampleRing::with_capacity(cfg.capture_ring_len()).unwrap());
        let buffer = Arc::new(PingPongBuffer::new(cfg.capture_buffer_len));
        let running = Arc::new(AtomicBool::new(true));
        let (detection_tx, _) = broadcast::channel(16);
        let (level_tx, _) = broadcast::channel(16);

        let feature_len = cfg.feature_len();
        let ctx = ProcessingContext::new(
            ContextShared {
                config: cfg.clone(),
                ring: Arc::clone(&ring),
                running: Arc::clone(&running),
                proc_enabled: Arc::new(AtomicBool::new(true)),
                dvfs: Arc::new(DvfsGovernor::new(Box::new(NoopScaler))),
                detection_tx,
                level_tx,
                seq: Arc::new(AtomicU64::new(0)),
                diagnostics: Arc::new(crate::pipeline::PipelineDiagnostics::default()),
            },
            Box::new(TruncatingExtractor::new(cfg.patch_len(), feature_len)),
            EngineHandle::new(EchoEngine::new(feature_len, 4)),
            Box::new(ToneSynthesizer::new(4, cfg.patch_len(), 0)),
            None,
            vec![],
        )
        .unwrap();

        let (_acq_tx, acq_rx) = bounded::<Message>(cfg.queue_depth);
        let adapter = CaptureAdapter::new(Arc::clone(&ring), buffer);
        let pipeline =
            TaskPipeline::spawn(ctx, adapter, acq_rx, Arc::clone(&running), cfg.queue_depth);

        let start = Instant::now();
        running.store(false, Ordering::SeqCst);
        pipeline.shutdown();
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
