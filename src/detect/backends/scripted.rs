//! Scripted backend: replays detections described in a JSON model file.
//!
//! Stands in for a trained model in demos and tests. The script lists one entry
//! per frame; frames cycle once the list is exhausted.
//!
//! ```json
//! {
//!   "frames": [
//!     [{"labels": [{"identifier": "cup", "confidence": 0.87}],
//!       "bounding_box": {"x": 0.1, "y": 0.2, "width": 0.3, "height": 0.4}}],
//!     []
//!   ],
//!   "fail_every": 5
//! }
//! ```

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::Path;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::RankedDetection;
use crate::frame::FrameView;

#[derive(Debug, Deserialize)]
struct Script {
    frames: Vec<Vec<RankedDetection>>,
    /// Fail every Nth call, to exercise transient inference errors.
    #[serde(default)]
    fail_every: Option<u64>,
}

pub struct ScriptedBackend {
    frames: Vec<Vec<RankedDetection>>,
    fail_every: Option<u64>,
    calls: u64,
}

impl ScriptedBackend {
    pub fn new(frames: Vec<Vec<RankedDetection>>) -> Result<Self> {
        if frames.is_empty() {
            return Err(anyhow!("detection script has no frames"));
        }
        Ok(Self {
            frames,
            fail_every: None,
            calls: 0,
        })
    }

    pub fn with_fail_every(mut self, every: u64) -> Self {
        self.fail_every = (every > 0).then_some(every);
        self
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read detection script {}", path.display()))?;
        Self::from_json(&raw)
            .with_context(|| format!("invalid detection script {}", path.display()))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let script: Script = serde_json::from_str(raw)?;
        let backend = Self::new(script.frames)?;
        Ok(match script.fail_every {
            Some(every) => backend.with_fail_every(every),
            None => backend,
        })
    }
}

impl DetectorBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn detect(&mut self, frame: &FrameView<'_>) -> Result<Vec<RankedDetection>> {
        self.calls += 1;
        if let Some(every) = self.fail_every {
            if self.calls % every == 0 {
                return Err(anyhow!(
                    "scripted failure on call {} (frame {})",
                    self.calls,
                    frame.sequence()
                ));
            }
        }
        let index = ((self.calls - 1) % self.frames.len() as u64) as usize;
        Ok(self.frames[index].clone())
    }
}
