use anyhow::{anyhow, Result};

use crate::frame::{BufferSize, PixelFormat};

/// Convert a frame to packed RGB24, validating its length against the format.
pub(crate) fn normalize_to_rgb(
    pixels: &[u8],
    width: u32,
    height: u32,
    format: PixelFormat,
) -> Result<Vec<u8>> {
    let size = BufferSize::new(width, height);
    let expected = format
        .frame_len(size)
        .ok_or_else(|| anyhow!("{:?} frame dimensions {} are invalid", format, size))?;
    if pixels.len() != expected {
        return Err(anyhow!(
            "{:?} frame length mismatch: expected {}, got {}",
            format,
            expected,
            pixels.len()
        ));
    }
    match format {
        PixelFormat::Rgb24 => Ok(pixels.to_vec()),
        PixelFormat::Nv12 => Ok(nv12_to_rgb(pixels, width as usize, height as usize)),
    }
}

// Full-range BT.601, matching the bi-planar full-range capture output.
fn nv12_to_rgb(pixels: &[u8], w: usize, h: usize) -> Vec<u8> {
    let (luma, chroma) = pixels.split_at(w * h);
    let mut rgb = Vec::with_capacity(w * h * 3);
    for row in 0..h {
        let uv_row = &chroma[(row / 2) * w..(row / 2) * w + w];
        for col in 0..w {
            let y = luma[row * w + col] as f32;
            let u = uv_row[(col / 2) * 2] as f32 - 128.0;
            let v = uv_row[(col / 2) * 2 + 1] as f32 - 128.0;

            rgb.push(clamp_to_u8(y + 1.402 * v));
            rgb.push(clamp_to_u8(y - 0.344_136 * u - 0.714_136 * v));
            rgb.push(clamp_to_u8(y + 1.772 * u));
        }
    }
    rgb
}

fn clamp_to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}
