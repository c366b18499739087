//! Error taxonomy for the overlay pipeline.
//!
//! Configuration-time failures (device, model) are fatal to starting a run and
//! surface to the caller. Per-frame inference failures are reported through
//! `InferenceError` and never stop the live feed.

use thiserror::Error;

use crate::pipeline::PipelineState;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("no capture device available at {device:?}")]
    DeviceUnavailable { device: String },
    #[error("capture session rejected configuration for {device:?}: {reason}")]
    ConfigurationRejected { device: String, reason: String },
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model resource {name}.{extension} is missing")]
    ModelMissing { name: String, extension: String },
    #[error("failed to load model {name}")]
    ModelLoadFailed {
        name: String,
        #[source]
        source: BoxError,
    },
}

impl ModelError {
    pub(crate) fn load_failed(name: &str, err: anyhow::Error) -> Self {
        Self::ModelLoadFailed {
            name: name.to_string(),
            source: err.into(),
        }
    }
}

/// Per-frame inference failure. Non-fatal: the next frame is a fresh attempt.
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("detector failed on frame {frame}")]
    Backend {
        frame: u64,
        #[source]
        source: BoxError,
    },
    #[error("inference worker is not running")]
    WorkerGone,
}

impl InferenceError {
    pub(crate) fn backend(frame: u64, err: anyhow::Error) -> Self {
        Self::Backend {
            frame,
            source: err.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("cannot {action} while pipeline is {state:?}")]
    InvalidTransition {
        action: &'static str,
        state: PipelineState,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Render an error and its sources as one line, `outer: inner: root`.
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}
