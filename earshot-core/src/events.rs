//! Event types broadcast by the engine to observers.
//!
//! The console app subscribes to all three channels; slow or absent
//! subscribers never block the pipeline (broadcast sends are fire-and-forget).

use serde::{Deserialize, Serialize};

/// Emitted when a processed patch produces a classification result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    /// Winning class label, or "unknown" below the OOD threshold.
    pub label: String,
    /// Winning class score.
    pub score: f32,
}

/// Emitted once per cycle with the output frame level.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelEvent {
    pub seq: u64,
    /// Output frame RMS level in dBFS.
    pub level_db: f32,
    /// Whether the noise gate muted the frame.
    pub gated: bool,
}

/// Emitted when the engine state changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub status: EngineStatus,
    /// Optional human-readable detail (e.g. error message).
    pub detail: Option<String>,
}

/// Current state of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineStatus {
    /// Engine created but `start()` not yet called.
    Idle,
    /// Warming up the inference engine.
    WarmingUp,
    /// Actively capturing and processing.
    Running,
    /// Capture stopped; engine may be restarted.
    Stopped,
    /// Unrecoverable error — restart required.
    Error,
}
