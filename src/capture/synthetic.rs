//! Synthetic capture device for `stub://` paths.
//!
//! Generates a moving test pattern paced at the configured frame rate so the
//! pipeline can run end to end without a camera.

use anyhow::{anyhow, Result};
use std::time::{Duration, Instant};

use super::CaptureDevice;
use crate::frame::{BufferSize, Frame, PixelFormat};

/// Resolutions the synthetic device advertises, smallest first.
const SUPPORTED_MODES: [BufferSize; 3] = [
    BufferSize::VGA,
    BufferSize::new(1280, 720),
    BufferSize::new(1920, 1080),
];

pub struct SyntheticDevice {
    name: String,
    frame_interval: Duration,
    active: Option<(BufferSize, PixelFormat)>,
    frame_count: u64,
    next_deadline: Option<Instant>,
}

impl SyntheticDevice {
    pub fn new(name: &str, target_fps: u32) -> Self {
        Self {
            name: name.to_string(),
            frame_interval: Duration::from_secs(1) / target_fps.max(1),
            active: None,
            frame_count: 0,
            next_deadline: None,
        }
    }

    fn generate_pixels(&self, size: BufferSize, format: PixelFormat) -> Vec<u8> {
        let w = size.width as usize;
        let h = size.height as usize;
        let shift = self.frame_count as usize;
        match format {
            PixelFormat::Rgb24 => {
                let mut pixels = vec![0u8; w * h * 3];
                for (i, px) in pixels.chunks_exact_mut(3).enumerate() {
                    let (x, y) = (i % w, i / w);
                    px[0] = ((x + shift) % 256) as u8;
                    px[1] = ((y + shift) % 256) as u8;
                    px[2] = ((x + y) % 256) as u8;
                }
                pixels
            }
            PixelFormat::Nv12 => {
                let mut pixels = vec![128u8; w * h + w * h / 2];
                for (i, luma) in pixels[..w * h].iter_mut().enumerate() {
                    *luma = ((i % w + i / w + shift) % 256) as u8;
                }
                pixels
            }
        }
    }

    fn wait_for_deadline(&mut self) {
        let now = Instant::now();
        let deadline = self.next_deadline.unwrap_or(now);
        if deadline > now {
            std::thread::sleep(deadline - now);
        }
        // Do not try to catch up after a stall; resume the cadence from now.
        self.next_deadline = Some(deadline.max(now) + self.frame_interval);
    }
}

impl CaptureDevice for SyntheticDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn negotiate(&mut self, preferred: BufferSize, format: PixelFormat) -> Result<BufferSize> {
        if preferred.is_empty() {
            return Err(anyhow!("resolution {} is not a valid capture mode", preferred));
        }
        let mode = SUPPORTED_MODES
            .iter()
            .copied()
            .min_by_key(|mode| mode.area().abs_diff(preferred.area()))
            .unwrap_or(BufferSize::VGA);
        if format.frame_len(mode).is_none() {
            return Err(anyhow!("{:?} cannot represent {}", format, mode));
        }
        self.active = Some((mode, format));
        self.next_deadline = None;
        log::info!(
            "SyntheticDevice: {} negotiated {} {:?} (preferred {})",
            self.name,
            mode,
            format,
            preferred
        );
        Ok(mode)
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let (size, format) = self
            .active
            .ok_or_else(|| anyhow!("synthetic device {} is not configured", self.name))?;
        self.wait_for_deadline();
        self.frame_count += 1;
        let pixels = self.generate_pixels(size, format);
        Frame::new(pixels, size, format, self.frame_count).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiates_nearest_mode() -> Result<()> {
        let mut device = SyntheticDevice::new("stub://test", 30);
        assert_eq!(
            device.negotiate(BufferSize::new(600, 400), PixelFormat::Nv12)?,
            BufferSize::VGA
        );
        assert_eq!(
            device.negotiate(BufferSize::new(1280, 720), PixelFormat::Rgb24)?,
            BufferSize::new(1280, 720)
        );
        Ok(())
    }

    #[test]
    fn rejects_empty_resolution() {
        let mut device = SyntheticDevice::new("stub://test", 30);
        assert!(device.negotiate(BufferSize::new(0, 480), PixelFormat::Nv12).is_err());
    }

    #[test]
    fn produces_sequenced_frames_in_negotiated_format() -> Result<()> {
        let mut device = SyntheticDevice::new("stub://test", 1000);
        device.negotiate(BufferSize::VGA, PixelFormat::Nv12)?;

        let first = device.next_frame()?.ok_or_else(|| anyhow!("no frame"))?;
        let second = device.next_frame()?.ok_or_else(|| anyhow!("no frame"))?;
        assert_eq!(first.size(), BufferSize::VGA);
        assert_eq!(first.format(), PixelFormat::Nv12);
        assert_eq!(first.sequence(), 1);
        assert_eq!(second.sequence(), 2);
        assert_ne!(first.view().pixels(), second.view().pixels());
        Ok(())
    }

    #[test]
    fn unconfigured_device_errors() {
        let mut device = SyntheticDevice::new("stub://test", 30);
        assert!(device.next_frame().is_err());
    }
}
