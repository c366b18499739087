#![cfg(feature = "backend-tract")]

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{Label, RankedDetection};
use crate::frame::{BufferSize, FrameView};
use crate::geometry::NormalizedRect;

type Plan = TypedRunnableModel<TypedModel>;

/// Labels kept per object, best first.
const MAX_LABELS: usize = 5;

/// Tract-based backend for ONNX object detectors.
///
/// Expects a single output of shape `[1, N, 4 + C]`: a normalized `x, y, w, h` box
/// followed by one score per class. Class names come from a sidecar
/// `<model>.labels` file (one per line) when present.
///
/// The runnable plan is built lazily for the first frame size it sees and rebuilt
/// if the size changes.
pub struct TractBackend {
    model_path: PathBuf,
    model: InferenceModel,
    plan: Option<(BufferSize, Plan)>,
    class_names: Vec<String>,
}

impl TractBackend {
    /// Load an ONNX model from disk.
    pub fn new<P: AsRef<Path>>(model_path: P) -> Result<Self> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?;
        let class_names = read_class_names(&model_path.with_extension("labels"))?;

        Ok(Self {
            model_path: model_path.to_path_buf(),
            model,
            plan: None,
            class_names,
        })
    }

    fn plan_for(&mut self, size: BufferSize) -> Result<&Plan> {
        let stale = !matches!(&self.plan, Some((planned, _)) if *planned == size);
        if stale {
            let plan = self
                .model
                .clone()
                .with_input_fact(
                    0,
                    InferenceFact::dt_shape(
                        f32::datum_type(),
                        tvec!(1, 3, size.height as usize, size.width as usize),
                    ),
                )
                .context("failed to set input fact")?
                .into_optimized()
                .context("failed to optimize ONNX model")?
                .into_runnable()
                .context("failed to build runnable ONNX model")?;
            log::info!(
                "TractBackend: planned {} for {}",
                self.model_path.display(),
                size
            );
            self.plan = Some((size, plan));
        }
        self.plan
            .as_ref()
            .map(|(_, plan)| plan)
            .ok_or_else(|| anyhow!("ONNX plan missing"))
    }

    fn build_input(frame: &FrameView<'_>) -> Result<Tensor> {
        let rgb = frame.to_rgb()?;
        let width = frame.width() as usize;
        let height = frame.height() as usize;
        let input =
            tract_ndarray::Array4::from_shape_fn((1, 3, height, width), |(_, channel, y, x)| {
                rgb[(y * width + x) * 3 + channel] as f32 / 255.0
            });
        Ok(input.into_tensor())
    }

    fn decode(&self, outputs: TVec<TValue>) -> Result<Vec<RankedDetection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = view.shape().to_vec();
        if shape.len() != 3 || shape[0] != 1 || shape[2] < 5 {
            return Err(anyhow!("unexpected detector output shape {:?}", shape));
        }
        let rows = view
            .into_shape((shape[1], shape[2]))
            .context("reshape detector output")?;

        Ok(decode_rows(rows, &self.class_names))
    }
}

/// Decode `[N, 4 + C]` rows into ranked detections. Every row with at least one
/// finite score is kept; the confidence threshold is applied downstream when
/// the batch is built.
fn decode_rows(
    rows: tract_ndarray::ArrayView2<'_, f32>,
    class_names: &[String],
) -> Vec<RankedDetection> {
    let mut detections = Vec::new();
    for row in rows.outer_iter() {
        let mut labels: Vec<Label> = row
            .iter()
            .skip(4)
            .enumerate()
            .filter(|(_, score)| score.is_finite())
            .map(|(class, score)| Label {
                identifier: class_name(class_names, class),
                confidence: *score,
            })
            .collect();
        if labels.is_empty() {
            continue;
        }
        labels.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        labels.truncate(MAX_LABELS);
        detections.push(RankedDetection {
            labels,
            bounding_box: NormalizedRect::new(
                row[0] as f64,
                row[1] as f64,
                row[2] as f64,
                row[3] as f64,
            ),
        });
    }
    detections
}

fn class_name(class_names: &[String], class: usize) -> String {
    class_names
        .get(class)
        .cloned()
        .unwrap_or_else(|| format!("class{}", class))
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&mut self, frame: &FrameView<'_>) -> Result<Vec<RankedDetection>> {
        let input = Self::build_input(frame)?;
        let outputs = self
            .plan_for(frame.size())?
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.decode(outputs)
    }
}

fn read_class_names(path: &Path) -> Result<Vec<String>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read labels {}", path.display()))?;
    Ok(raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}
