//! Raster surface (feature: snapshot).
//!
//! Draws committed rectangle borders into an RGBA canvas the size of the display
//! bounds, so an overlay can be checked by eye against the live geometry.

use anyhow::{Context, Result};
use image::{Rgba, RgbaImage};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{LayerTree, RenderSurface, Transaction};
use crate::geometry::Rect;

/// Clones share the same canvas.
#[derive(Clone)]
pub struct RasterSurface {
    canvas: Arc<Mutex<RgbaImage>>,
}

impl RasterSurface {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            canvas: Arc::new(Mutex::new(RgbaImage::new(width, height))),
        }
    }

    pub fn image(&self) -> RgbaImage {
        self.lock().clone()
    }

    /// Write the current canvas as JPEG.
    pub fn save_jpeg<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let rgb = image::DynamicImage::ImageRgba8(self.image()).to_rgb8();
        rgb.save_with_format(path, image::ImageFormat::Jpeg)
            .with_context(|| format!("write snapshot {}", path.display()))
    }

    fn lock(&self) -> MutexGuard<'_, RgbaImage> {
        self.canvas
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl RenderSurface for RasterSurface {
    fn commit(&mut self, tree: &LayerTree, _transaction: &Transaction) {
        let mut canvas = self.lock();
        for pixel in canvas.pixels_mut() {
            *pixel = Rgba([0, 0, 0, 0]);
        }
        let origin = (tree.geometry.display_bounds.x, tree.geometry.display_bounds.y);
        for layer in &tree.layers {
            let Some(bbox) = pixel_box(&layer.frame, origin, canvas.dimensions()) else {
                continue;
            };
            let thickness = layer.border_width.round().max(1.0) as u32;
            draw_rect(&mut canvas, bbox, Rgba(layer.border_color.to_rgba8()), thickness);
        }
    }
}

/// Display rect to inclusive pixel corners, clamped to the canvas.
fn pixel_box(frame: &Rect, origin: (f64, f64), dims: (u32, u32)) -> Option<[u32; 4]> {
    let (w, h) = dims;
    if w == 0 || h == 0 || !frame.is_finite() {
        return None;
    }
    let clamp = |v: f64, max: u32| -> u32 { v.max(0.0).min((max - 1) as f64) as u32 };
    let x0 = frame.min_x() - origin.0;
    let y0 = frame.min_y() - origin.1;
    let x1 = frame.max_x() - origin.0 - 1.0;
    let y1 = frame.max_y() - origin.1 - 1.0;
    if x1 < 0.0 || y1 < 0.0 || x0 >= w as f64 || y0 >= h as f64 || x0 > x1 || y0 > y1 {
        return None;
    }
    Some([clamp(x0, w), clamp(y0, h), clamp(x1, w), clamp(y1, h)])
}

fn draw_rect(img: &mut RgbaImage, bbox: [u32; 4], color: Rgba<u8>, thickness: u32) {
    let [x0, y0, x1, y1] = bbox;
    for t in 0..thickness {
        let (xx0, yy0) = (x0.saturating_add(t), y0.saturating_add(t));
        let (xx1, yy1) = (x1.saturating_sub(t), y1.saturating_sub(t));
        if xx0 > xx1 || yy0 > yy1 {
            break;
        }
        for x in xx0..=xx1 {
            img.put_pixel(x, yy0, color);
            img.put_pixel(x, yy1, color);
        }
        for y in yy0..=yy1 {
            img.put_pixel(xx0, y, color);
            img.put_pixel(xx1, y, color);
        }
    }
}
