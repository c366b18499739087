//! Detector backends, model loading and the asynchronous inference adapter.

mod adapter;
mod backend;
pub mod backends;
mod registry;
mod result;

pub use adapter::{Completion, InferenceAdapter};
pub use backend::DetectorBackend;
pub use backends::ScriptedBackend;
pub use registry::{
    LoaderRegistry, ModelCatalog, ModelHandle, ModelLoader, ResourceBundle, ResourceHandle,
};
pub use result::{Detection, DetectionBatch, Label, RankedDetection};
