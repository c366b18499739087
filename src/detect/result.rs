use serde::{Deserialize, Serialize};

use crate::geometry::NormalizedRect;

/// One candidate label for a detected object.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Label {
    pub identifier: String,
    pub confidence: f32,
}

/// Raw detector output for one object: labels ranked best first.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RankedDetection {
    pub labels: Vec<Label>,
    pub bounding_box: NormalizedRect,
}

impl RankedDetection {
    pub fn top_label(&self) -> Option<&Label> {
        self.labels.first()
    }
}

/// A labelled, confidence-scored box for one frame. No identity persists across frames.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    /// In [0, 1].
    pub confidence: f32,
    pub bounding_box: NormalizedRect,
}

/// Detections for one frame, in detector output order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DetectionBatch {
    pub frame: u64,
    pub detections: Vec<Detection>,
}

impl DetectionBatch {
    /// Keep each object's top label, dropping objects without labels or below `threshold`.
    pub fn from_ranked(frame: u64, ranked: Vec<RankedDetection>, threshold: f32) -> Self {
        let detections = ranked
            .into_iter()
            .filter_map(|candidate| {
                let label = candidate.top_label()?;
                let confidence = if label.confidence.is_finite() {
                    label.confidence.clamp(0.0, 1.0)
                } else {
                    0.0
                };
                (confidence >= threshold).then(|| Detection {
                    label: label.identifier.clone(),
                    confidence,
                    bounding_box: candidate.bounding_box.clamped(),
                })
            })
            .collect();
        Self { frame, detections }
    }

    pub fn len(&self) -> usize {
        self.detections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }
}
