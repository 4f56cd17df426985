use thiserror::Error;

/// All errors produced by earshot-core.
#[derive(Debug, Error)]
pub enum EarshotError {
    #[error("invalid pipeline configuration: {0}")]
    Config(String),

    #[error("stage shape mismatch: {stage} expects {expected} elements, pipeline provides {actual}")]
    ShapeMismatch {
        stage: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("no default input device found")]
    NoDefaultInputDevice,

    #[error("pre-processing error: {0}")]
    PreProcess(String),

    #[error("inference error: {0}")]
    Inference(String),

    #[error("post-processing error: {0}")]
    PostProcess(String),

    #[error("engine is already running")]
    AlreadyRunning,

    #[error("engine is not running")]
    NotRunning,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, EarshotError>;
