//! Offline mode: feed a WAV file through the capture boundary.
//!
//! The file plays the role of the microphone: samples are chunked into
//! ping-pong halves and delivered through the same hooks the live driver
//! uses, optionally paced at real time so the pipeline sees its production
//! cadence.

use std::path::Path;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context};
use earshot_core::{CaptureSession, PipelineConfig};
use tracing::{info, warn};

/// Feed the whole file. Returns the number of samples delivered (a trailing
/// partial half-buffer is zero-padded, as the hardware would).
pub fn feed(
    path: &Path,
    session: &CaptureSession,
    cfg: &PipelineConfig,
    realtime: bool,
) -> anyhow::Result<u64> {
    let mut reader =
        hound::WavReader::open(path).with_context(|| format!("open {}", path.display()))?;
    let spec = reader.spec();
    if spec.sample_rate != cfg.sample_rate {
        warn!(
            file_rate = spec.sample_rate,
            pipeline_rate = cfg.sample_rate,
            "WAV sample rate differs from the pipeline rate — playing as-is"
        );
    }

    let channels = spec.channels as usize;
    let mono: Vec<i16> = match (spec.sample_format, spec.bits_per_sample) {
        (hound::SampleFormat::Int, 16) => downmix(
            reader
                .samples::<i16>()
                .collect::<std::result::Result<Vec<_>, _>>()?,
            channels,
        ),
        (hound::SampleFormat::Float, 32) => downmix(
            reader
                .samples::<f32>()
                .collect::<std::result::Result<Vec<_>, _>>()?
                .into_iter()
                .map(|s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
                .collect(),
            channels,
        ),
        (format, bits) => bail!("unsupported WAV format: {format:?} {bits}-bit"),
    };

    let half_len = cfg.capture_half_len();
    let half_period = Duration::from_secs_f64(half_len as f64 / cfg.sample_rate as f64);
    info!(
        samples = mono.len(),
        half_len, realtime, "feeding WAV through the capture boundary"
    );

    let mut half: u8 = 0;
    let mut staging = vec![0i16; half_len];
    let mut fed = 0u64;
    for chunk in mono.chunks(half_len) {
        staging[..chunk.len()].copy_from_slice(chunk);
        staging[chunk.len()..].fill(0);
        session.buffer.write_half(half, &staging);
        session.hooks.half_transfer(half);
        half ^= 1;
        fed += half_len as u64;
        if realtime {
            thread::sleep(half_period);
        }
    }
    Ok(fed)
}

fn downmix(samples: Vec<i16>, channels: usize) -> Vec<i16> {
    if channels <= 1 {
        return samples;
    }
    samples
        .chunks_exact(channels)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| s as i32).sum();
            (sum / channels as i32) as i16
        })
        .collect()
}
