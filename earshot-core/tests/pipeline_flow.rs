use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use earshot_core::config::PipelineConfig;
use earshot_core::stage::stub::{ConstantEngine, ToneSynthesizer, TruncatingExtractor};
use earshot_core::{
    AudioEngine, DetectionEvent, EngineHandle, PipelineMode, QuantParams, StageSet,
};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;

const NUM_CLASSES: usize = 4;

fn small_config() -> PipelineConfig {
    PipelineConfig {
        fft_len: 64,
        window_len: 48,
        hop_len: 16,
        mel_bins: 8,
        num_columns: 4,
        capture_buffer_len: 64,
        silence_threshold: 0.0,
        ..PipelineConfig::default()
    }
}

fn stage_set(cfg: &PipelineConfig) -> (StageSet, Arc<parking_lot::Mutex<Vec<Vec<i16>>>>) {
    let feature_len = cfg.feature_len();
    let extractor = TruncatingExtractor::new(cfg.patch_len(), feature_len);
    let patches_seen = Arc::clone(&extractor.patches_seen);
    // "alarm" always wins with score 0.9.
    let engine = ConstantEngine::new(
        feature_len,
        vec![5, 90, 17, 2],
        QuantParams {
            scale: 0.01,
            zero_point: 0,
        },
    );
    let stages = StageSet {
        extractor: Box::new(extractor),
        engine: EngineHandle::new(engine),
        synthesizer: Box::new(ToneSynthesizer::new(NUM_CLASSES, cfg.patch_len(), 0)),
        output: None,
        labels: vec![
            "quiet".to_string(),
            "alarm".to_string(),
            "speech".to_string(),
            "music".to_string(),
        ],
    };
    (stages, patches_seen)
}

fn recv_detection_with_timeout(
    rx: &mut broadcast::Receiver<DetectionEvent>,
    timeout: Duration,
) -> DetectionEvent {
    let start = Instant::now();
    loop {
        match rx.try_recv() {
            Ok(ev) => return ev,
            Err(TryRecvError::Empty) => {
                if start.elapsed() >= timeout {
                    panic!("timed out waiting for detection event");
                }
                thread::sleep(Duration::from_millis(5));
            }
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Closed) => panic!("detection channel closed unexpectedly"),
        }
    }
}

/// Drive the engine end-to-end the way the hardware would: alternating
/// half-transfer events carrying a continuous ramp, in both scheduling modes.
#[test]
fn captured_stream_is_classified_without_loss_in_both_modes() {
    for mode in [PipelineMode::Polling, PipelineMode::Tasks] {
        let cfg = small_config();
        let (stages, patches_seen) = stage_set(&cfg);
        let engine = AudioEngine::new(cfg.clone(), stages).unwrap();
        engine.warm_up().unwrap();
        let mut detections = engine.subscribe_detections();

        let session = engine.start(mode).unwrap();

        // Simulated capture driver: 8 halves of a ramp, halves alternating
        // 0/1 in hardware transfer order.
        let half_len = cfg.capture_half_len();
        let mut next: i16 = 0;
        for i in 0..8u8 {
            let samples: Vec<i16> = (0..half_len as i16).map(|k| next + k).collect();
            next = next.wrapping_add(half_len as i16);
            session.buffer.write_half(i % 2, &samples);
            session.hooks.half_transfer(i % 2);
            thread::sleep(Duration::from_millis(5));
        }

        // 8 * 32 = 256 samples = 4 chunks of 64 → 4 cycles, each classified.
        let first = recv_detection_with_timeout(&mut detections, Duration::from_secs(2));
        assert_eq!(first.label, "alarm", "mode {mode:?}");
        assert!((first.score - 0.9).abs() < 1e-5);

        let deadline = Instant::now() + Duration::from_secs(2);
        while patches_seen.lock().len() < 4 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        engine.stop().unwrap();

        let patches = patches_seen.lock();
        assert_eq!(patches.len(), 4, "mode {mode:?}: one cycle per chunk");

        // No loss, no duplication: the fresh tails reassemble the ramp.
        let overlap = cfg.patch_overlap();
        let mut reassembled = Vec::new();
        for patch in patches.iter() {
            reassembled.extend_from_slice(&patch[overlap..]);
        }
        let expect: Vec<i16> = (0..256i16).collect();
        assert_eq!(reassembled, expect, "mode {mode:?}");

        // Overlap continuity across every cycle boundary.
        for pair in patches.windows(2) {
            assert_eq!(
                pair[0][cfg.patch_len() - overlap..],
                pair[1][..overlap],
                "mode {mode:?}: overlap-add continuity"
            );
        }

        assert_eq!(engine.diagnostics_snapshot().cycles, 4);
    }
}

/// The first detection must arrive well inside the real-time budget: one
/// cycle's worth of audio (64 samples at 16 kHz = 4 ms) plus scheduling
/// slack.
#[test]
fn first_detection_latency_under_500ms() {
    let cfg = small_config();
    let (stages, _) = stage_set(&cfg);
    let engine = AudioEngine::new(cfg.clone(), stages).unwrap();
    let mut detections = engine.subscribe_detections();
    let session = engine.start(PipelineMode::Tasks).unwrap();

    let start = Instant::now();
    let half_len = cfg.capture_half_len();
    for i in 0..4u8 {
        let samples = vec![3_000i16; half_len];
        session.buffer.write_half(i % 2, &samples);
        session.hooks.half_transfer(i % 2);
    }

    let _first = recv_detection_with_timeout(&mut detections, Duration::from_secs(2));
    let elapsed = start.elapsed();
    engine.stop().unwrap();

    assert!(
        elapsed < Duration::from_millis(500),
        "first-detection latency too high: {elapsed:?}"
    );
}
