//! Cooperative single-loop pipeline.
//!
//! One execution context does everything: the capture callback is the only
//! concurrent actor and it only ever calls `SampleRing::feed`. The loop polls
//! the ring's available-sample counter (lock-free) and runs a full cycle
//! whenever a chunk's worth of fresh samples has accumulated; otherwise it
//! parks briefly — the host stand-in for a wait-for-interrupt sleep. A stop
//! request takes effect at the top of the next cycle.

use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use crate::pipeline::ProcessingContext;

/// Park interval while waiting for data. Half a capture half-buffer at
/// 16 kHz is 32 ms; 1 ms keeps wake-up latency negligible against that.
const IDLE_PARK: Duration = Duration::from_millis(1);

/// Run cycles until the running flag clears. Consumes the context; the
/// caller keeps its shared handles (ring, flags, diagnostics).
pub fn run(mut ctx: ProcessingContext) {
    info!("polling pipeline started");
    let chunk = ctx.chunk_len();

    while ctx.running.load(Ordering::Relaxed) {
        if ctx.ring.available() < chunk {
            thread::park_timeout(IDLE_PARK);
            continue;
        }
        if let Err(e) = ctx.run_cycle() {
            ctx.diagnostics.stage_errors.fetch_add(1, Ordering::Relaxed);
            warn!("cycle failed, output skipped: {e}");
        }
    }

    ctx.log_summary();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::dvfs::{DvfsGovernor, NoopScaler};
    use crate::pipeline::{ContextShared, PipelineDiagnostics};
    use crate::ring::SampleRing;
    use crate::stage::stub::{EchoEngine, ToneSynthesizer, TruncatingExtractor};
    use crate::stage::EngineHandle;
    use std::sync::{
        atomic::{AtomicBool, AtomicU64},
        Arc,
    };
    use std::time::Instant;
    use tokio::sync::broadcast;

    #[test]
    fn loop_processes_fed_chunks_and_stops_on_flag() {
        let cfg = PipelineConfig {
            fft_len: 64,
            window_len: 48,
            hop_len: 16,
            mel_bins: 8,
            num_columns: 4,
            capture_buffer_len: 64,
            ..PipelineConfig::default()
        };
        let ring = Arc::new(SampleRing::with_capacity(cfg.capture_ring_len()).unwrap());
        let running = Arc::new(AtomicBool::new(true));
        let diagnostics = Arc::new(PipelineDiagnostics::default());
        let (detection_tx, _) = broadcast::channel(16);
        let (level_tx, _) = broadcast::channel(16);

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

        let handle = thread::spawn(move || run(ctx));

        // Feed three chunks at a relaxed pace, as the capture callback would.
        for _ in 0..3 {
            ring.feed(&vec![250i16; cfg.patch_no_overlap()]);
            thread::sleep(Duration::from_millis(10));
        }

        let deadline = Instant::now() + Duration::from_secs(2);
        while patches_seen.lock().len() < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        running.store(false, Ordering::SeqCst);
        handle.join().expect("polling loop panicked");

        assert_eq!(patches_seen.lock().len(), 3);
        assert_eq!(diagnostics.snapshot().cycles, 3);
    }
}
