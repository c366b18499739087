//! Overlay layer tree and the renderer that owns it.
//!
//! `OverlayRenderer` keeps one rectangle layer with an attached text layer per
//! live detection. Each `render` discards the previous layers and commits a
//! freshly built set to the `RenderSurface` inside a transaction with implicit
//! animations disabled.
//!
//! The renderer is `Send` but not `Sync`. It is moved onto the render thread
//! (see `queue`) and every mutation arrives there as a job, so no other thread
//! can reach layer state.

pub mod queue;
#[cfg(feature = "snapshot")]
pub mod raster;

use std::ops::Range;
use std::sync::{Arc, Mutex};

use crate::detect::{Detection, DetectionBatch};
use crate::geometry::{OverlayGeometry, OverlayTransform, Point, Rect, Size};

pub use queue::{render_channel, RenderLoop, RenderQueue};
#[cfg(feature = "snapshot")]
pub use raster::RasterSurface;

pub const OVERLAY_LAYER_NAME: &str = "DetectionOverlay";
pub const SHAPE_LAYER_NAME: &str = "Found Object";
pub const TEXT_LAYER_NAME: &str = "Object Label";

const BORDER_WIDTH: f64 = 5.0;
const CORNER_RADIUS: f64 = 7.0;
/// Text is laid out this far inside the rectangle on every side, in buffer pixels.
const TEXT_INSET: f64 = 5.0;
const LABEL_FONT: &str = "Helvetica";
const LABEL_FONT_SIZE: f64 = 24.0;
const TEXT_CONTENTS_SCALE: f64 = 2.0;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl Color {
    pub const fn rgba(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    pub const BLACK: Color = Color::rgba(0.0, 0.0, 0.0, 1.0);
    /// Yellow border of a detection rectangle.
    pub const HIGHLIGHT: Color = Color::rgba(1.0, 1.0, 0.2, 1.0);

    pub fn to_rgba8(&self) -> [u8; 4] {
        let channel = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        [channel(self.r), channel(self.g), channel(self.b), channel(self.a)]
    }
}

/// Font applied to a byte range of a text layer's string.
#[derive(Clone, Debug, PartialEq)]
pub struct FontSpan {
    pub family: String,
    pub size: f64,
    pub range: Range<usize>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TextLayer {
    pub name: String,
    pub text: String,
    pub font: FontSpan,
    pub foreground: Color,
    /// Bounds in the layer's own rotated space: (box height - 10, box width - 10).
    pub bounds: Size,
    /// Counter-rotation so the text reads upright on the display.
    pub transform: OverlayTransform,
    pub contents_scale: f64,
    /// Display-space rect the text occupies.
    pub frame: Rect,
}

impl TextLayer {
    fn for_detection(
        detection: &Detection,
        buffer_rect: &Rect,
        geometry: &OverlayGeometry,
    ) -> Self {
        let text = format!("{}\n일치율: {:.2}", detection.label, detection.confidence);
        Self {
            name: TEXT_LAYER_NAME.to_string(),
            font: FontSpan {
                family: LABEL_FONT.to_string(),
                size: LABEL_FONT_SIZE,
                range: 0..detection.label.len(),
            },
            text,
            foreground: Color::BLACK,
            bounds: Size::new(
                (buffer_rect.height - 2.0 * TEXT_INSET).max(0.0),
                (buffer_rect.width - 2.0 * TEXT_INSET).max(0.0),
            ),
            transform: OverlayTransform::capture_orientation(1.0),
            contents_scale: TEXT_CONTENTS_SCALE,
            frame: geometry.map_buffer_rect(&buffer_rect.inset_by(TEXT_INSET, TEXT_INSET)),
        }
    }
}

/// Rectangle drawn around one detection, with its label attached.
#[derive(Clone, Debug, PartialEq)]
pub struct ShapeLayer {
    pub name: String,
    /// Box in buffer pixels, inside the overlay container.
    pub bounds: Rect,
    /// Box in display space.
    pub frame: Rect,
    pub border_width: f64,
    pub border_color: Color,
    pub corner_radius: f64,
    pub label: TextLayer,
}

impl ShapeLayer {
    fn for_detection(detection: &Detection, geometry: &OverlayGeometry) -> Self {
        let bounds = crate::geometry::denormalize(&detection.bounding_box, geometry.buffer_size);
        Self {
            name: SHAPE_LAYER_NAME.to_string(),
            frame: geometry.map_buffer_rect(&bounds),
            border_width: BORDER_WIDTH,
            border_color: Color::HIGHLIGHT,
            corner_radius: CORNER_RADIUS,
            label: TextLayer::for_detection(detection, &bounds, geometry),
            bounds,
        }
    }

    fn reflow(&mut self, geometry: &OverlayGeometry) {
        self.frame = geometry.map_buffer_rect(&self.bounds);
        self.label.frame =
            geometry.map_buffer_rect(&self.bounds.inset_by(TEXT_INSET, TEXT_INSET));
    }
}

/// Container holding every detection layer, sized to the capture buffer.
#[derive(Clone, Debug, PartialEq)]
pub struct OverlayLayer {
    pub name: String,
    pub bounds: Rect,
    pub position: Point,
    pub transform: OverlayTransform,
    /// Where the container lands on the display after its transform.
    pub frame: Rect,
}

impl OverlayLayer {
    fn from_geometry(geometry: &OverlayGeometry) -> Self {
        Self {
            name: OVERLAY_LAYER_NAME.to_string(),
            bounds: geometry.overlay_bounds(),
            position: geometry.display_bounds.center(),
            transform: geometry.transform,
            frame: geometry.overlay_frame(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct LayerTree {
    pub geometry: OverlayGeometry,
    pub overlay: OverlayLayer,
    pub layers: Vec<ShapeLayer>,
}

impl LayerTree {
    fn empty(geometry: OverlayGeometry) -> Self {
        Self {
            geometry,
            overlay: OverlayLayer::from_geometry(&geometry),
            layers: Vec::new(),
        }
    }
}

/// Commit scope for one layer-tree update.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transaction {
    /// Monotonic commit number.
    pub generation: u64,
    /// Suppress implicit animations so the swap is not cross-faded.
    pub disable_actions: bool,
}

/// Backend that presents the layer tree.
pub trait RenderSurface: Send {
    fn commit(&mut self, tree: &LayerTree, transaction: &Transaction);
}

#[derive(Debug, Default)]
struct Recorded {
    tree: Option<LayerTree>,
    transaction: Option<Transaction>,
    commits: u64,
}

/// Surface that keeps the last committed tree, for headless runs and tests.
///
/// Clones share the same record.
#[derive(Clone, Debug, Default)]
pub struct RecordingSurface {
    inner: Arc<Mutex<Recorded>>,
}

impl RecordingSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_tree(&self) -> Option<LayerTree> {
        self.lock().tree.clone()
    }

    pub fn last_transaction(&self) -> Option<Transaction> {
        self.lock().transaction
    }

    pub fn commits(&self) -> u64 {
        self.lock().commits
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Recorded> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl RenderSurface for RecordingSurface {
    fn commit(&mut self, tree: &LayerTree, transaction: &Transaction) {
        let mut recorded = self.lock();
        recorded.tree = Some(tree.clone());
        recorded.transaction = Some(*transaction);
        recorded.commits += 1;
    }
}

pub struct OverlayRenderer {
    surface: Box<dyn RenderSurface>,
    tree: LayerTree,
    generation: u64,
}

impl OverlayRenderer {
    pub fn new(surface: Box<dyn RenderSurface>) -> Self {
        Self {
            surface,
            tree: LayerTree::empty(OverlayGeometry::default()),
            generation: 0,
        }
    }

    pub fn geometry(&self) -> &OverlayGeometry {
        &self.tree.geometry
    }

    pub fn layers(&self) -> &[ShapeLayer] {
        &self.tree.layers
    }

    pub fn tree(&self) -> &LayerTree {
        &self.tree
    }

    /// Replace every detection layer with one built from `batch`.
    pub fn render(&mut self, batch: &DetectionBatch, geometry: &OverlayGeometry) {
        let layers = batch
            .detections
            .iter()
            .map(|detection| ShapeLayer::for_detection(detection, geometry))
            .collect();
        self.tree = LayerTree {
            geometry: *geometry,
            overlay: OverlayLayer::from_geometry(geometry),
            layers,
        };
        log::trace!(
            "OverlayRenderer: frame {} -> {} layers",
            batch.frame,
            self.tree.layers.len()
        );
        self.commit();
    }

    /// Re-solve placement for new geometry, keeping the current detections.
    pub fn reflow(&mut self, geometry: &OverlayGeometry) {
        self.tree.geometry = *geometry;
        self.tree.overlay = OverlayLayer::from_geometry(geometry);
        for layer in &mut self.tree.layers {
            layer.reflow(geometry);
        }
        self.commit();
    }

    /// Remove every detection layer.
    pub fn clear(&mut self) {
        if self.tree.layers.is_empty() {
            return;
        }
        self.tree.layers.clear();
        self.commit();
    }

    fn commit(&mut self) {
        self.generation += 1;
        let transaction = Transaction {
            generation: self.generation,
            disable_actions: true,
        };
        self.surface.commit(&self.tree, &transaction);
    }
}
