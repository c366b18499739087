//! Coordinate mapping from detector space to display space.
//!
//! Detector output is a normalized rect relative to the capture buffer. The buffer
//! is captured in landscape and displayed rotated a quarter turn with a vertical
//! flip, scaled uniformly to aspect-fill the display bounds. Everything here is a
//! pure function of its inputs.

use serde::{Deserialize, Serialize};

use crate::frame::BufferSize;

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Size {
    pub width: f64,
    pub height: f64,
}

impl Size {
    pub const fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub const fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn from_size(size: Size) -> Self {
        Self::new(0.0, 0.0, size.width, size.height)
    }

    pub fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }

    pub fn min_x(&self) -> f64 {
        self.x
    }

    pub fn min_y(&self) -> f64 {
        self.y
    }

    pub fn max_x(&self) -> f64 {
        self.x + self.width
    }

    pub fn max_y(&self) -> f64 {
        self.y + self.height
    }

    pub fn mid_x(&self) -> f64 {
        self.x + self.width / 2.0
    }

    pub fn mid_y(&self) -> f64 {
        self.y + self.height / 2.0
    }

    pub fn center(&self) -> Point {
        Point::new(self.mid_x(), self.mid_y())
    }

    /// Shrink by `dx`/`dy` on each side. Sizes never go negative.
    pub fn inset_by(&self, dx: f64, dy: f64) -> Rect {
        let width = (self.width - 2.0 * dx).max(0.0);
        let height = (self.height - 2.0 * dy).max(0.0);
        Rect::new(
            self.mid_x() - width / 2.0,
            self.mid_y() - height / 2.0,
            width,
            height,
        )
    }

    pub fn contains_rect(&self, other: &Rect) -> bool {
        other.min_x() >= self.min_x()
            && other.min_y() >= self.min_y()
            && other.max_x() <= self.max_x()
            && other.max_y() <= self.max_y()
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite()
            && self.y.is_finite()
            && self.width.is_finite()
            && self.height.is_finite()
    }

    fn bounding(points: &[Point]) -> Rect {
        let (mut min_x, mut min_y) = (f64::INFINITY, f64::INFINITY);
        let (mut max_x, mut max_y) = (f64::NEG_INFINITY, f64::NEG_INFINITY);
        for p in points {
            min_x = min_x.min(p.x);
            min_y = min_y.min(p.y);
            max_x = max_x.max(p.x);
            max_y = max_y.max(p.y);
        }
        Rect::new(min_x, min_y, max_x - min_x, max_y - min_y)
    }
}

/// Rect in [0,1]² relative to the buffer dimensions, as reported by the detector.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl NormalizedRect {
    pub const fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Clamp into the unit square. Non-finite components collapse to zero.
    pub fn clamped(&self) -> NormalizedRect {
        let unit = |v: f64| if v.is_finite() { v.clamp(0.0, 1.0) } else { 0.0 };
        let x = unit(self.x);
        let y = unit(self.y);
        NormalizedRect::new(x, y, unit(self.width).min(1.0 - x), unit(self.height).min(1.0 - y))
    }
}

/// Denormalize against the buffer size to get a buffer-pixel rect.
pub fn denormalize(rect: &NormalizedRect, buffer: BufferSize) -> Rect {
    let w = buffer.width as f64;
    let h = buffer.height as f64;
    Rect::new(rect.x * w, rect.y * h, rect.width * w, rect.height * h)
}

/// Uniform aspect-fill scale for a buffer shown rotated a quarter turn.
///
/// Width and height of the buffer are swapped against the display because the
/// buffer is landscape and the overlay is rotated. Non-finite results fall back to 1.
pub fn overlay_scale(buffer: BufferSize, display: &Rect) -> f64 {
    let x_scale = display.width / buffer.height as f64;
    let y_scale = display.height / buffer.width as f64;
    let scale = x_scale.max(y_scale);
    if scale.is_finite() {
        scale
    } else {
        1.0
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    /// Counter-clockwise rotation in a y-up space.
    fn apply(&self, p: Point) -> Point {
        match self {
            Rotation::Deg0 => p,
            Rotation::Deg90 => Point::new(-p.y, p.x),
            Rotation::Deg180 => Point::new(-p.x, -p.y),
            Rotation::Deg270 => Point::new(p.y, -p.x),
        }
    }
}

/// Affine transform applied to the overlay container about its center.
///
/// Points are scaled first (with the optional vertical flip), then rotated.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct OverlayTransform {
    pub rotation: Rotation,
    pub scale: f64,
    pub flip_vertical: bool,
}

impl Default for OverlayTransform {
    fn default() -> Self {
        Self::identity()
    }
}

impl OverlayTransform {
    pub const fn identity() -> Self {
        Self {
            rotation: Rotation::Deg0,
            scale: 1.0,
            flip_vertical: false,
        }
    }

    /// Quarter turn plus vertical flip, the fixed capture orientation.
    pub const fn capture_orientation(scale: f64) -> Self {
        Self {
            rotation: Rotation::Deg90,
            scale,
            flip_vertical: true,
        }
    }

    /// Map an offset from the anchor point.
    pub fn apply(&self, offset: Point) -> Point {
        let flip = if self.flip_vertical { -1.0 } else { 1.0 };
        let scaled = Point::new(offset.x * self.scale, offset.y * self.scale * flip);
        self.rotation.apply(scaled)
    }
}

/// Everything needed to place buffer-space layers on the display.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OverlayGeometry {
    pub buffer_size: BufferSize,
    pub display_bounds: Rect,
    pub transform: OverlayTransform,
}

impl OverlayGeometry {
    /// Solve the overlay transform for a buffer shown in the given display bounds.
    pub fn solve(buffer_size: BufferSize, display_bounds: Rect) -> Self {
        let scale = overlay_scale(buffer_size, &display_bounds);
        Self {
            buffer_size,
            display_bounds,
            transform: OverlayTransform::capture_orientation(scale),
        }
    }

    /// Overlay container bounds in buffer space.
    pub fn overlay_bounds(&self) -> Rect {
        Rect::new(
            0.0,
            0.0,
            self.buffer_size.width as f64,
            self.buffer_size.height as f64,
        )
    }

    /// Where the overlay container lands on the display.
    pub fn overlay_frame(&self) -> Rect {
        self.map_buffer_rect(&self.overlay_bounds())
    }

    /// Map a buffer-pixel rect into display space.
    pub fn map_buffer_rect(&self, rect: &Rect) -> Rect {
        let anchor = self.overlay_bounds().center();
        let position = self.display_bounds.center();
        let corners = [
            Point::new(rect.min_x(), rect.min_y()),
            Point::new(rect.max_x(), rect.max_y()),
        ]
        .map(|p| {
            let t = self
                .transform
                .apply(Point::new(p.x - anchor.x, p.y - anchor.y));
            Point::new(position.x + t.x, position.y + t.y)
        });
        Rect::bounding(&corners)
    }

    pub fn map_normalized(&self, rect: &NormalizedRect) -> Rect {
        self.map_buffer_rect(&denormalize(rect, self.buffer_size))
    }
}

/// Map a detector's normalized box to a display-space rect.
pub fn to_display_rect(rect: &NormalizedRect, buffer: BufferSize, display: &Rect) -> Rect {
    OverlayGeometry::solve(buffer, *display).map_normalized(rect)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_frame_box_fills_rotated_display() {
        let display = Rect::new(0.0, 0.0, 480.0, 640.0);
        let rect = to_display_rect(
            &NormalizedRect::new(0.0, 0.0, 1.0, 1.0),
            BufferSize::new(640, 480),
            &display,
        );
        assert_eq!(rect, display);
        assert_eq!(rect.center(), Point::new(240.0, 320.0));
    }

    #[test]
    fn sub_rect_maps_with_exact_values() {
        // scale = max(960 / 480, 1280 / 640) = 2
        let display = Rect::new(0.0, 0.0, 960.0, 1280.0);
        let rect = to_display_rect(
            &NormalizedRect::new(0.25, 0.5, 0.25, 0.25),
            BufferSize::new(640, 480),
            &display,
        );
        assert_eq!(rect, Rect::new(480.0, 320.0, 240.0, 320.0));
    }

    #[test]
    fn display_origin_offsets_result() {
        let display = Rect::new(100.0, 50.0, 480.0, 640.0);
        let rect = to_display_rect(
            &NormalizedRect::new(0.0, 0.0, 1.0, 1.0),
            BufferSize::new(640, 480),
            &display,
        );
        assert_eq!(rect, display);
    }

    #[test]
    fn mapping_is_deterministic() {
        let display = Rect::new(0.0, 0.0, 333.0, 517.0);
        let rect = NormalizedRect::new(0.1, 0.2, 0.3, 0.4);
        let buffer = BufferSize::new(640, 480);
        let first = to_display_rect(&rect, buffer, &display);
        let second = to_display_rect(&rect, buffer, &display);
        assert_eq!(first, second);
    }

    #[test]
    fn zero_buffer_height_falls_back_to_unit_scale() {
        let display = Rect::new(0.0, 0.0, 480.0, 640.0);
        let buffer = BufferSize::new(640, 0);
        assert_eq!(overlay_scale(buffer, &display), 1.0);

        let rect = to_display_rect(&NormalizedRect::new(0.0, 0.0, 1.0, 1.0), buffer, &display);
        assert!(rect.is_finite());
        assert_eq!(rect, Rect::new(240.0, 0.0, 0.0, 640.0));
    }

    #[test]
    fn empty_buffer_and_display_stay_finite() {
        let geometry = OverlayGeometry::solve(BufferSize::default(), Rect::default());
        assert_eq!(geometry.transform.scale, 1.0);
        assert!(geometry.overlay_frame().is_finite());
    }

    #[test]
    fn overlay_aspect_fills_display() {
        let display = Rect::new(0.0, 0.0, 400.0, 400.0);
        let geometry = OverlayGeometry::solve(BufferSize::new(640, 480), display);
        let frame = geometry.overlay_frame();
        let eps = 1e-9;
        assert!(frame.width >= display.width - eps);
        assert!(frame.height >= display.height - eps);
        assert!((frame.mid_x() - display.mid_x()).abs() < eps);
        assert!((frame.mid_y() - display.mid_y()).abs() < eps);
        assert!(frame.contains_rect(&display.inset_by(eps, eps)));
    }

    #[test]
    fn transform_swaps_axes() {
        let transform = OverlayTransform::capture_orientation(2.0);
        assert_eq!(transform.apply(Point::new(3.0, 5.0)), Point::new(10.0, 6.0));
        assert_eq!(OverlayTransform::identity().apply(Point::new(3.0, 5.0)), Point::new(3.0, 5.0));
    }

    #[test]
    fn normalized_rect_clamps_into_unit_square() {
        let clamped = NormalizedRect::new(-0.5, 0.8, 2.0, f64::NAN).clamped();
        assert_eq!(clamped, NormalizedRect::new(0.0, 0.8, 1.0, 0.0));
    }

    #[test]
    fn inset_never_goes_negative() {
        let inset = Rect::new(0.0, 0.0, 6.0, 20.0).inset_by(5.0, 5.0);
        assert_eq!(inset, Rect::new(3.0, 5.0, 0.0, 10.0));
    }
}
