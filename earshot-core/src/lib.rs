//! # earshot-core
//!
//! Real-time audio AI pipeline SDK: capture → log-mel features → inference →
//! synthesis → gated playback, with fixed-latency cycle orchestration.
//!
//! ## Architecture
//!
//! ```text
//! capture driver ─half-transfer─► hooks ─► SampleRing ─► PatchFramer
//!                                                            │ (overlap-add)
//!                                      FeatureExtractor ◄────┘
//!                                            │
//!                                     InferenceEngine
//!                                      │           │
//!                          broadcast events     Synthesizer
//!                                                  │
//!                                       noise gate ─► playback ring ─► output
//! ```
//!
//! The capture callback is allocation-free and never blocked by processing;
//! the processing side consumes fixed-size overlapping windows with no
//! sample lost or repeated. Two scheduling models drive the cycle — a
//! cooperative polling loop and a two-task message-passing pipeline — chosen
//! at [`engine::AudioEngine::start`].

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod capture;
pub mod config;
pub mod dvfs;
pub mod engine;
pub mod error;
pub mod events;
pub mod framer;
pub mod loadgen;
pub mod msg;
pub mod pipeline;
pub mod playback;
pub mod ring;
pub mod stage;

// Convenience re-exports for downstream crates
pub use config::PipelineConfig;
pub use engine::{AudioEngine, CaptureSession, PipelineMode, StageSet};
pub use error::EarshotError;
pub use events::{DetectionEvent, EngineStatus, LevelEvent, StatusEvent};
pub use ring::SampleRing;
pub use stage::{EngineHandle, FeatureExtractor, InferenceEngine, QuantParams, Synthesizer};
