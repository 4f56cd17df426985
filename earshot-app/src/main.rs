//! Earshot console demo.
//!
//! Captures live audio (or feeds a WAV file), classifies each patch with the
//! demo band-energy model, and renders detections plus a level meter on the
//! console.
//!
//! ```text
//! earshot [--mode tasks|polling] [--wav FILE] [--playback] [--gate-db DB]
//! ```
//!
//! Keyboard control surface (stand-ins for the board's two user buttons):
//! `p` toggles processing output, `l` toggles synthetic load generation,
//! `q` quits.

mod classifier;
mod console;
mod wav;

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context};
use earshot_core::capture::cpal::{CpalCapture, CpalPlayback};
use earshot_core::playback::OutputDriver;
use earshot_core::stage::melspec::LogMelExtractor;
use earshot_core::stage::stub::ToneSynthesizer;
use earshot_core::{AudioEngine, EngineHandle, PipelineConfig, PipelineMode, StageSet};
use tracing::info;
use tracing_subscriber::EnvFilter;

use classifier::BandEnergyClassifier;

struct Args {
    mode: PipelineMode,
    wav: Option<PathBuf>,
    playback: bool,
    gate_db: Option<f32>,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = Args {
        mode: PipelineMode::Tasks,
        wav: None,
        playback: false,
        gate_db: None,
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--mode" => {
                let value = iter.next().context("--mode needs a value")?;
                args.mode = match value.as_str() {
                    "tasks" => PipelineMode::Tasks,
                    "polling" => PipelineMode::Polling,
                    other => bail!("unknown mode '{other}' (tasks|polling)"),
                };
            }
            "--wav" => args.wav = Some(PathBuf::from(iter.next().context("--wav needs a path")?)),
            "--playback" => args.playback = true,
            "--gate-db" => {
                args.gate_db = Some(
                    iter.next()
                        .context("--gate-db needs a value")?
                        .parse()
                        .context("--gate-db must be a number")?,
                );
            }
            "--help" | "-h" => {
                println!(
                    "usage: earshot [--mode tasks|polling] [--wav FILE] [--playback] [--gate-db DB]"
                );
                std::process::exit(0);
            }
            other => bail!("unknown argument '{other}' (try --help)"),
        }
    }
    Ok(args)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = parse_args()?;
    let mut config = PipelineConfig::default();
    if let Some(gate_db) = args.gate_db {
        config.gate_threshold_db = gate_db;
    }

    let output: Option<Box<dyn OutputDriver>> = if args.playback {
        Some(Box::new(CpalPlayback::new(config.sample_rate)))
    } else {
        None
    };

    let model = BandEnergyClassifier::new(config.mel_bins, config.num_columns);
    let stages = StageSet {
        extractor: Box::new(LogMelExtractor::new(&config)?),
        engine: EngineHandle::new(model),
        // Classification demo: no spectral reconstruction. Playback with
        // processing toggled off passes the raw capture through instead.
        synthesizer: Box::new(ToneSynthesizer::new(
            classifier::LABELS.len(),
            config.patch_len(),
            0,
        )),
        output,
        labels: BandEnergyClassifier::labels(),
    };

    let engine = Arc::new(AudioEngine::new(config.clone(), stages)?);
    engine.warm_up()?;

    let meter = console::spawn_meter(engine.subscribe_levels());
    let detections = console::spawn_detections(engine.subscribe_detections());

    let session = engine.start(args.mode)?;
    info!(mode = ?args.mode, "pipeline running");

    match args.wav {
        Some(path) => {
            let fed = wav::feed(&path, &session, &config, true)?;
            // Let the pipeline drain the tail before stopping.
            thread::sleep(Duration::from_millis(200));
            engine.stop()?;
            info!(samples = fed, "WAV feed complete");
        }
        None => {
            let capture_live = Arc::new(AtomicBool::new(true));
            let capture = CpalCapture::open(
                Arc::clone(&session.buffer),
                Arc::clone(&session.hooks),
                Arc::clone(&capture_live),
                config.sample_rate,
            )?;
            println!("listening — p: toggle processing, l: toggle load gen, q: quit");

            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                match line?.trim() {
                    "p" => engine.toggle_processing(),
                    "l" => engine.toggle_load_generation(),
                    "q" => break,
                    "" => {}
                    other => println!("unknown command '{other}' (p, l, q)"),
                }
            }

            // Shutdown order: capture stops posting, then the pipeline drains
            // and terminates.
            capture_live.store(false, Ordering::SeqCst);
            drop(capture);
            engine.stop()?;
        }
    }

    drop(meter);
    drop(detections);

    let snap = engine.diagnostics_snapshot();
    println!(
        "\ncycles={} skipped={} stage_errors={} detections={} gated_frames={} dropped_messages={}",
        snap.cycles,
        snap.skipped_cycles,
        snap.stage_errors,
        snap.detections_emitted,
        snap.gated_frames,
        snap.dropped_messages
    );
    Ok(())
}
