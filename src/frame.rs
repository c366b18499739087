//! Captured frames and the restricted view detectors receive.
//!
//! - `Frame`: immutable pixel buffer plus its dimensions. Owned transiently by the
//!   capture path and moved into the inference worker; there is no `Clone`.
//! - `FrameView`: borrowed view handed to a detector for the duration of one
//!   `detect` call. Its lifetime prevents a detector from retaining pixels.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::capture::normalize::normalize_to_rgb;

/// Negotiated pixel dimensions of the capture output.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BufferSize {
    pub width: u32,
    pub height: u32,
}

impl BufferSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// The 640x480 class preset the capture session targets.
    pub const VGA: BufferSize = BufferSize::new(640, 480);

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

impl std::fmt::Display for BufferSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// Bi-planar 4:2:0, full range: a Y plane followed by interleaved UV.
    #[default]
    Nv12,
    /// Packed 8-bit RGB.
    Rgb24,
}

impl PixelFormat {
    /// Byte length of one frame in this format, or `None` on overflow or odd NV12 sizes.
    pub fn frame_len(&self, size: BufferSize) -> Option<usize> {
        let pixels = (size.width as usize).checked_mul(size.height as usize)?;
        match self {
            PixelFormat::Rgb24 => pixels.checked_mul(3),
            PixelFormat::Nv12 => {
                if size.width % 2 != 0 || size.height % 2 != 0 {
                    return None;
                }
                pixels.checked_add(pixels / 2)
            }
        }
    }
}

/// One captured image buffer.
pub struct Frame {
    data: Vec<u8>,
    size: BufferSize,
    format: PixelFormat,
    /// Monotonic per-session frame number, starting at 1.
    sequence: u64,
    captured_at: Instant,
}

// No Clone: a frame moves along the pipeline and is never duplicated.

impl Frame {
    pub fn new(
        data: Vec<u8>,
        size: BufferSize,
        format: PixelFormat,
        sequence: u64,
    ) -> Result<Self> {
        let expected = format
            .frame_len(size)
            .ok_or_else(|| anyhow!("invalid {:?} frame dimensions {}", format, size))?;
        if data.len() != expected {
            return Err(anyhow!(
                "{:?} frame length mismatch: expected {}, got {}",
                format,
                expected,
                data.len()
            ));
        }
        Ok(Self {
            data,
            size,
            format,
            sequence,
            captured_at: Instant::now(),
        })
    }

    pub fn size(&self) -> BufferSize {
        self.size
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn age(&self) -> Duration {
        self.captured_at.elapsed()
    }

    /// Borrow the frame for one inference call.
    pub fn view(&self) -> FrameView<'_> {
        FrameView { frame: self }
    }
}

/// Borrowed view of a frame for one detector invocation.
///
/// Pixels borrowed from a view cannot outlive the call:
///
/// ```compile_fail
/// use detection_overlay::{DetectorBackend, FrameView, RankedDetection};
///
/// struct Hoarder {
///     last: Option<&'static [u8]>,
/// }
///
/// impl DetectorBackend for Hoarder {
///     fn name(&self) -> &'static str {
///         "hoarder"
///     }
///
///     fn detect(&mut self, frame: &FrameView<'_>) -> anyhow::Result<Vec<RankedDetection>> {
///         self.last = Some(frame.pixels());
///         Ok(Vec::new())
///     }
/// }
/// ```
pub struct FrameView<'a> {
    frame: &'a Frame,
}

impl<'a> FrameView<'a> {
    pub fn width(&self) -> u32 {
        self.frame.size.width
    }

    pub fn height(&self) -> u32 {
        self.frame.size.height
    }

    pub fn size(&self) -> BufferSize {
        self.frame.size
    }

    pub fn format(&self) -> PixelFormat {
        self.frame.format
    }

    pub fn sequence(&self) -> u64 {
        self.frame.sequence
    }

    pub fn pixels(&self) -> &'a [u8] {
        &self.frame.data
    }

    /// Packed RGB24 copy of the frame, converting from NV12 when needed.
    pub fn to_rgb(&self) -> Result<Vec<u8>> {
        normalize_to_rgb(
            &self.frame.data,
            self.frame.size.width,
            self.frame.size.height,
            self.frame.format,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_rejects_wrong_length() {
        let err = Frame::new(vec![0u8; 10], BufferSize::new(4, 4), PixelFormat::Rgb24, 1);
        assert!(err.is_err());
    }

    #[test]
    fn nv12_requires_even_dimensions() {
        assert_eq!(PixelFormat::Nv12.frame_len(BufferSize::new(3, 2)), None);
        assert_eq!(PixelFormat::Nv12.frame_len(BufferSize::VGA), Some(640 * 480 * 3 / 2));
    }

    #[test]
    fn view_exposes_metadata() -> Result<()> {
        let size = BufferSize::new(4, 2);
        let frame = Frame::new(vec![7u8; 12], size, PixelFormat::Nv12, 42)?;
        let view = frame.view();
        assert_eq!(view.width(), 4);
        assert_eq!(view.height(), 2);
        assert_eq!(view.sequence(), 42);
        assert_eq!(view.pixels().len(), 12);
        assert_eq!(view.to_rgb()?.len(), 4 * 2 * 3);
        Ok(())
    }
}
