//! V4L2 capture device (feature: ingest-v4l2).
//!
//! Frames are read from a memory-mapped stream on the capture worker and copied
//! into an owned `Frame` before the buffer is handed back to the driver.

use anyhow::{anyhow, Context, Result};
use ouroboros::self_referencing;
use std::io;
use std::time::Duration;

use super::CaptureDevice;
use crate::frame::{BufferSize, Frame, PixelFormat};

const STREAM_BUFFERS: u32 = 4;

/// Frame intervals to wait for a buffer before reporting that nothing arrived.
const READ_TIMEOUT_FRAMES: u32 = 4;
const MIN_READ_TIMEOUT: Duration = Duration::from_millis(100);
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(500);

pub struct V4l2Device {
    path: String,
    target_fps: u32,
    device: Option<v4l::Device>,
    state: Option<V4l2StreamState>,
    active: Option<(BufferSize, PixelFormat)>,
    frame_count: u64,
}

#[self_referencing]
struct V4l2StreamState {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

fn fourcc(format: PixelFormat) -> v4l::FourCC {
    match format {
        PixelFormat::Nv12 => v4l::FourCC::new(b"NV12"),
        PixelFormat::Rgb24 => v4l::FourCC::new(b"RGB3"),
    }
}

/// How long one `next_frame` may block on the driver.
fn read_timeout(target_fps: u32) -> Duration {
    if target_fps == 0 {
        return DEFAULT_READ_TIMEOUT;
    }
    let interval = Duration::from_secs(1) / target_fps;
    (interval * READ_TIMEOUT_FRAMES).max(MIN_READ_TIMEOUT)
}

impl V4l2Device {
    /// Open the device node. Failure here means the device is unavailable.
    pub fn open(path: &str, target_fps: u32) -> Result<Self> {
        let device =
            v4l::Device::with_path(path).with_context(|| format!("open v4l2 device {}", path))?;
        Ok(Self {
            path: path.to_string(),
            target_fps,
            device: Some(device),
            state: None,
            active: None,
            frame_count: 0,
        })
    }
}

impl CaptureDevice for V4l2Device {
    fn name(&self) -> &str {
        &self.path
    }

    fn negotiate(&mut self, preferred: BufferSize, format: PixelFormat) -> Result<BufferSize> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        // Renegotiating after a stop: dropping the stream releases its buffers.
        if let Some(state) = self.state.take() {
            self.active = None;
            self.device = Some(state.into_heads().device);
        }
        let device = self
            .device
            .take()
            .ok_or_else(|| anyhow!("v4l2 device {} was lost", self.path))?;

        let mut requested = device.format().context("read v4l2 format")?;
        requested.width = preferred.width;
        requested.height = preferred.height;
        requested.fourcc = fourcc(format);
        let actual = match device.set_format(&requested) {
            Ok(actual) => actual,
            Err(err) => {
                self.device = Some(device);
                return Err(anyhow::Error::new(err).context("set v4l2 format"));
            }
        };
        if actual.fourcc != fourcc(format) {
            let got = actual.fourcc;
            self.device = Some(device);
            return Err(anyhow!(
                "device {} does not support {:?} (driver chose {})",
                self.path,
                format,
                got
            ));
        }

        if self.target_fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(self.target_fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!("V4l2Device: failed to set fps on {}: {}", self.path, err);
            }
        }

        let size = BufferSize::new(actual.width, actual.height);
        let timeout = read_timeout(self.target_fps);
        let state = V4l2StreamStateBuilder {
            device,
            stream_builder: |device| {
                let mut stream = v4l::prelude::MmapStream::with_buffers(
                    device,
                    Type::VideoCapture,
                    STREAM_BUFFERS,
                )
                .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))?;
                stream.set_timeout(timeout);
                Ok(stream)
            },
        }
        .try_build()?;
        self.state = Some(state);
        self.active = Some((size, format));

        log::info!(
            "V4l2Device: {} negotiated {} {:?} (preferred {})",
            self.path,
            size,
            format,
            preferred
        );
        Ok(size)
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        use v4l::io::traits::CaptureStream;

        let (size, format) = self.active.context("v4l2 device not configured")?;
        let expected = format
            .frame_len(size)
            .ok_or_else(|| anyhow!("invalid negotiated size {}", size))?;
        let state = self.state.as_mut().context("v4l2 stream not running")?;
        let pixels = state
            .with_mut(|fields| match fields.stream.next() {
                Ok((buf, _meta)) => Ok(Some(buf.get(..expected).map(<[u8]>::to_vec))),
                Err(err) if err.kind() == io::ErrorKind::TimedOut => Ok(None),
                Err(err) => Err(err),
            })
            .context("capture v4l2 frame")?;
        let Some(pixels) = pixels else {
            return Ok(None);
        };
        let pixels = pixels.ok_or_else(|| anyhow!("v4l2 buffer shorter than {} bytes", expected))?;

        self.frame_count += 1;
        Frame::new(pixels, size, format, self.frame_count).map(Some)
    }
}
