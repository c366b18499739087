//! Live-video object-detection overlay.
//!
//! Captures camera frames, runs a detector on them asynchronously and keeps an
//! overlay of labelled rectangles in sync with the rotated, aspect-filled video.
//!
//! # Architecture
//!
//! Three execution contexts:
//!
//! 1. **Capture**: the capture session's worker threads read the device and hand
//!    frames to the pipeline, dropping any frame that arrives while the previous
//!    one is still being handled.
//! 2. **Inference**: a dedicated worker runs the detector, one frame at a time.
//! 3. **Render**: the only thread that mutates overlay layers. Everything else
//!    reaches it through a `RenderQueue`.
//!
//! # Module Structure
//!
//! - `frame`: captured buffers and the borrowed view detectors receive
//! - `capture`: capture session, devices, pixel normalization
//! - `detect`: detector backends, model loading, the inference adapter
//! - `geometry`: detector space → buffer space → display space
//! - `render`: layer tree, render surfaces, render-thread queue
//! - `pipeline`: the controller state machine tying it together
//! - `config`: file + environment configuration for `overlayd`

pub mod capture;
pub mod config;
pub mod detect;
pub mod error;
pub mod frame;
pub mod geometry;
pub mod pipeline;
pub mod render;

pub use capture::{CaptureConfig, CaptureDevice, CaptureSession, CaptureStats, FrameSink};
pub use config::OverlayConfig;
pub use detect::{
    Detection, DetectionBatch, DetectorBackend, InferenceAdapter, Label, LoaderRegistry,
    ModelCatalog, ModelHandle, RankedDetection, ResourceBundle, ResourceHandle,
};
pub use error::{CaptureError, InferenceError, ModelError, PipelineError};
pub use frame::{BufferSize, Frame, FrameView, PixelFormat};
pub use geometry::{to_display_rect, NormalizedRect, OverlayGeometry, Rect};
pub use pipeline::{ModelSpec, PipelineController, PipelineSettings, PipelineState, PipelineStats};
pub use render::{
    render_channel, LayerTree, OverlayRenderer, RecordingSurface, RenderLoop, RenderQueue,
    RenderSurface,
};
