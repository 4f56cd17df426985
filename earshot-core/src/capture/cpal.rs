//! Live audio capture and playback via cpal.
//!
//! The input callback runs on an OS audio thread at elevated priority and
//! must not allocate, block or perform I/O. It downmixes to mono i16 into a
//! pre-allocated staging half; when the staging half fills it is published to
//! the ping-pong buffer and a half-transfer event is raised — the software
//! analogue of the DMA half/full-transfer interrupts.
//!
//! [`CpalPlayback`] is the symmetric output driver: once armed it drains the
//! playback ring from the output callback, substituting silence on underrun.
//!
//! `cpal::Stream` is `!Send` on Windows/macOS, so a `CpalCapture` must be
//! created and dropped on the same OS thread. `CpalPlayback` sidesteps the
//! same constraint by confining its stream to a dedicated thread.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    SampleFormat, SampleRate, Stream, StreamConfig,
};
use tracing::info;

use crate::capture::{CaptureHooks, PingPongBuffer};
use crate::error::{EarshotError, Result};
use crate::playback::OutputDriver;
use crate::ring::SampleRing;

/// Handle to an active capture stream. Dropping it stops capture.
pub struct CpalCapture {
    _stream: Stream,
    /// Actual capture sample rate reported by the device (Hz).
    pub sample_rate: u32,
}

/// Accumulates mono samples and raises half-transfer events.
struct HalfFiller {
    buffer: Arc<PingPongBuffer>,
    hooks: Arc<dyn CaptureHooks>,
    staging: Vec<i16>,
    fill: usize,
    half: u8,
}

impl HalfFiller {
    fn new(buffer: Arc<PingPongBuffer>, hooks: Arc<dyn CaptureHooks>) -> Self {
        let half_len = buffer.half_len();
        Self {
            buffer,
            hooks,
            staging: vec![0i16; half_len],
            fill: 0,
            half: 0,
        }
    }

    fn push(&mut self, sample: i16) {
        self.staging[self.fill] = sample;
        self.fill += 1;
        if self.fill == self.staging.len() {
            self.buffer.write_half(self.half, &self.staging);
            self.hooks.half_transfer(self.half);
            self.half ^= 1;
            self.fill = 0;
        }
    }
}

impl CpalCapture {
    /// Open the default input device at `sample_rate` and start capturing
    /// into `buffer`, raising events on `hooks`.
    pub fn open(
        buffer: Arc<PingPongBuffer>,
        hooks: Arc<dyn CaptureHooks>,
        running: Arc<AtomicBool>,
        sample_rate: u32,
    ) -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or(EarshotError::NoDefaultInputDevice)?;

        info!(
            device = device.name().unwrap_or_default().as_str(),
            sample_rate, "opening input device"
        );

        let supported = device
            .default_input_config()
            .map_err(|e| EarshotError::AudioDevice(e.to_string()))?;
        let channels = supported.channels();

        let config = StreamConfig {
            channels,
            sample_rate: SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let err_hooks = Arc::clone(&hooks);
        let err_fn = move |err: cpal::StreamError| err_hooks.error(&err.to_string());

        let ch = channels as usize;
        let mut filler = HalfFiller::new(buffer, hooks);

        let stream = match supported.sample_format() {
            SampleFormat::I16 => {
                let running = Arc::clone(&running);
                device.build_input_stream(
                    &config,
                    move |data: &[i16], _info| {
                        if !running.load(Ordering::Relaxed) {
                            return;
                        }
                        for frame in data.chunks_exact(ch) {
                            let sum: i32 = frame.iter().map(|&s| s as i32).sum();
                            filler.push((sum / ch as i32) as i16);
                        }
                    },
                    err_fn,
                    None,
                )
            }
            SampleFormat::F32 => {
                let running = Arc::clone(&running);
                device.build_input_stream(
                    &config,
                    move |data: &[f32], _info| {
                        if !running.load(Ordering::Relaxed) {
                            return;
                        }
                        for frame in data.chunks_exact(ch) {
                            let sum: f32 = frame.iter().sum();
                            let mono = (sum / ch as f32).clamp(-1.0, 1.0);
                            filler.push((mono * i16::MAX as f32) as i16);
                        }
                    },
                    err_fn,
                    None,
                )
            }
            other => {
                return Err(EarshotError::AudioDevice(format!(
                    "unsupported input sample format: {other:?}"
                )))
            }
        }
        .map_err(|e| EarshotError::AudioStream(e.to_string()))?;

        stream
            .play()
            .map_err(|e| EarshotError::AudioStream(e.to_string()))?;

        Ok(Self {
            _stream: stream,
            sample_rate,
        })
    }
}

/// Output driver backed by the default cpal output device.
///
/// Created unstarted; `start` (invoked by the playback sink once enough
/// samples are queued) spawns a thread that owns the stream and drains the
/// ring from the output callback. Underrun plays silence rather than
/// stalling the device.
pub struct CpalPlayback {
    sample_rate: u32,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl CpalPlayback {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    fn open_stream(ring: Arc<SampleRing>, sample_rate: u32) -> Result<Stream> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| EarshotError::AudioDevice("no default output device".into()))?;

        info!(
            device = device.name().unwrap_or_default().as_str(),
            sample_rate, "opening output device"
        );

        let supported = device
            .default_output_config()
            .map_err(|e| EarshotError::AudioDevice(e.to_string()))?;
        let channels = supported.channels() as usize;

        let config = StreamConfig {
            channels: channels as u16,
            sample_rate: SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let mut staging: Vec<i16> = Vec::new();
        let err_fn = |err: cpal::StreamError| tracing::error!("output stream error: {err}");

        let stream = match supported.sample_format() {
            SampleFormat::F32 => device.build_output_stream(
                &config,
                move |data: &mut [f32], _info| {
                    let frames = data.len() / channels;
                    staging.resize(frames, 0);
                    if !ring.consume(&mut staging) {
                        // Underrun: the ring does not hold a full callback's
                        // worth yet — play silence, retire nothing.
                        staging.fill(0);
                    }
                    for (frame, &sample) in data.chunks_exact_mut(channels).zip(staging.iter()) {
                        let value = sample as f32 / 32768.0;
                        frame.fill(value);
                    }
                },
                err_fn,
                None,
            ),
            SampleFormat::I16 => device.build_output_stream(
                &config,
                move |data: &mut [i16], _info| {
                    let frames = data.len() / channels;
                    staging.resize(frames, 0);
                    if !ring.consume(&mut staging) {
                        staging.fill(0);
                    }
                    for (frame, &sample) in data.chunks_exact_mut(channels).zip(staging.iter()) {
                        frame.fill(sample);
                    }
                },
                err_fn,
                None,
            ),
            other => {
                return Err(EarshotError::AudioDevice(format!(
                    "unsupported output sample format: {other:?}"
                )))
            }
        }
        .map_err(|e| EarshotError::AudioStream(e.to_string()))?;

        stream
            .play()
            .map_err(|e| EarshotError::AudioStream(e.to_string()))?;
        Ok(stream)
    }
}

impl OutputDriver for CpalPlayback {
    fn start(&mut self, ring: Arc<SampleRing>) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        let sample_rate = self.sample_rate;
        let running = Arc::clone(&self.running);

        // The stream must be created and dropped on one thread; block until
        // the open outcome is known so arming failures surface to the caller.
        let (open_tx, open_rx) = std::sync::mpsc::channel::<Result<()>>();
        let worker = thread::Builder::new()
            .name("earshot-out".into())
            .spawn(move || {
                let stream = match Self::open_stream(ring, sample_rate) {
                    Ok(stream) => {
                        let _ = open_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = open_tx.send(Err(e));
                        return;
                    }
                };
                while running.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(50));
                }
                drop(stream);
            })
            .map_err(|e| EarshotError::Other(e.into()))?;
        self.worker = Some(worker);

        match open_rx.recv() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(EarshotError::AudioStream(
                "output thread died before opening the device".into(),
            )),
        }
    }
}

impl Drop for CpalPlayback {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
