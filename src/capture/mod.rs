//! Camera capture session.
//!
//! `CaptureSession` owns the capture device, negotiates a fixed pixel format and
//! resolution, and pushes frames to a `FrameSink` from a dedicated worker thread.
//!
//! Two threads run while the session is started:
//! - the capture worker reads frames from the device at its native rate
//! - the delivery worker hands each frame to the sink
//!
//! They are joined by a zero-capacity channel. A frame that arrives while the
//! sink is still processing the previous one is discarded, never queued, and the
//! capture worker never blocks on the sink.
//!
//! Device paths:
//! - `stub://<name>`: synthetic pattern generator
//! - any other path: V4L2 device node (feature: ingest-v4l2)

pub(crate) mod normalize;
pub mod synthetic;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::CaptureError;
use crate::frame::{BufferSize, Frame, PixelFormat};

pub use synthetic::SyntheticDevice;
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::V4l2Device;

/// Pause after a device read error before trying again.
const ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Source of frames owned by a `CaptureSession`.
pub trait CaptureDevice: Send {
    fn name(&self) -> &str;

    /// Negotiate the output format. Returns the size the device will deliver.
    fn negotiate(&mut self, preferred: BufferSize, format: PixelFormat) -> Result<BufferSize>;

    /// Wait for the next frame. `Ok(None)` means nothing arrived in time; the
    /// worker uses it to notice a stop request.
    fn next_frame(&mut self) -> Result<Option<Frame>>;
}

/// Receiver of captured frames. Called on the delivery worker, one frame at a time.
pub trait FrameSink: Send + Sync {
    fn on_frame(&self, frame: Frame);
}

impl<F> FrameSink for F
where
    F: Fn(Frame) + Send + Sync,
{
    fn on_frame(&self, frame: Frame) {
        self(frame)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Device path (e.g. "/dev/video0" or "stub://rear_camera").
    pub device: String,
    pub target_fps: u32,
    pub pixel_format: PixelFormat,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: "stub://rear_camera".to_string(),
            target_fps: 30,
            pixel_format: PixelFormat::Nv12,
        }
    }
}

/// Snapshot of capture counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub frames_captured: u64,
    pub frames_delivered: u64,
    pub frames_dropped: u64,
    pub capture_errors: u64,
    pub device: String,
}

#[derive(Default)]
struct CaptureCounters {
    captured: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    errors: AtomicU64,
    last_frame_at: Mutex<Option<Instant>>,
}

impl CaptureCounters {
    fn mark_frame(&self) {
        let mut last = self
            .last_frame_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *last = Some(Instant::now());
    }

    fn last_frame_at(&self) -> Option<Instant> {
        *self
            .last_frame_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct CaptureWorker {
    running: Arc<AtomicBool>,
    capture: JoinHandle<Box<dyn CaptureDevice>>,
    delivery: JoinHandle<()>,
}

pub struct CaptureSession {
    config: CaptureConfig,
    device: Option<Box<dyn CaptureDevice>>,
    buffer_size: Option<BufferSize>,
    sink: Option<Arc<dyn FrameSink>>,
    worker: Option<CaptureWorker>,
    counters: Arc<CaptureCounters>,
}

impl CaptureSession {
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            config,
            device: None,
            buffer_size: None,
            sink: None,
            worker: None,
            counters: Arc::new(CaptureCounters::default()),
        }
    }

    /// Build a session around an already-open device.
    pub fn with_device(config: CaptureConfig, device: Box<dyn CaptureDevice>) -> Self {
        let mut session = Self::new(config);
        session.device = Some(device);
        session
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Negotiated buffer size, once `configure` has succeeded.
    pub fn buffer_size(&self) -> Option<BufferSize> {
        self.buffer_size
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Select the device and negotiate the output format.
    pub fn configure(&mut self, preferred: BufferSize) -> Result<BufferSize, CaptureError> {
        if self.is_running() {
            return Err(self.rejected("session is running"));
        }
        if self.device.is_none() {
            self.device = Some(open_device(&self.config)?);
        }
        let format = self.config.pixel_format;
        let device = self
            .device
            .as_mut()
            .ok_or_else(|| CaptureError::DeviceUnavailable {
                device: self.config.device.clone(),
            })?;
        let size = match device.negotiate(preferred, format) {
            Ok(size) if !size.is_empty() => size,
            Ok(size) => {
                return Err(self.rejected(&format!("device reported empty size {}", size)));
            }
            Err(err) => return Err(self.rejected(&format!("{:#}", err))),
        };
        self.buffer_size = Some(size);
        log::info!(
            "CaptureSession: {} configured at {} {:?}",
            self.config.device,
            size,
            format
        );
        Ok(size)
    }

    /// Register the receiver of captured frames. Takes effect on the next `start`.
    pub fn set_frame_sink(&mut self, sink: Arc<dyn FrameSink>) {
        self.sink = Some(sink);
    }

    /// Begin delivering frames. Idempotent.
    pub fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        if self.buffer_size.is_none() {
            return Err(anyhow!("capture session is not configured"));
        }
        let sink = self
            .sink
            .clone()
            .ok_or_else(|| anyhow!("capture session has no frame sink"))?;
        let device = self
            .device
            .take()
            .ok_or_else(|| anyhow!("capture device {} is not open", self.config.device))?;

        let running = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::sync_channel::<Frame>(0);

        let delivery_counters = self.counters.clone();
        let delivery = std::thread::Builder::new()
            .name("capture-delivery".to_string())
            .spawn(move || delivery_loop(rx, sink, delivery_counters))
            .context("spawn capture delivery worker")?;

        let capture_running = running.clone();
        let capture_counters = self.counters.clone();
        let capture = std::thread::Builder::new()
            .name("capture".to_string())
            .spawn(move || capture_loop(device, tx, capture_running, capture_counters));
        let capture = match capture {
            Ok(handle) => handle,
            Err(err) => {
                // The device went down with the closure; a new configure is required.
                self.buffer_size = None;
                return Err(anyhow::Error::new(err).context("spawn capture worker"));
            }
        };

        self.worker = Some(CaptureWorker {
            running,
            capture,
            delivery,
        });
        log::info!("CaptureSession: {} started", self.config.device);
        Ok(())
    }

    /// Halt frame delivery. The device stays open and configured. Idempotent.
    pub fn stop(&mut self) -> Result<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        worker.running.store(false, Ordering::SeqCst);
        let device = worker.capture.join();
        let delivery = worker.delivery.join();
        match device {
            Ok(device) => self.device = Some(device),
            Err(_) => {
                self.buffer_size = None;
                return Err(anyhow!("capture worker for {} panicked", self.config.device));
            }
        }
        delivery.map_err(|_| anyhow!("capture delivery worker panicked"))?;
        log::info!("CaptureSession: {} stopped", self.config.device);
        Ok(())
    }

    /// True while started and the device delivered a frame recently.
    pub fn is_healthy(&self) -> bool {
        if !self.is_running() {
            return false;
        }
        match self.counters.last_frame_at() {
            Some(at) => at.elapsed() <= self.health_grace(),
            None => true,
        }
    }

    pub fn stats(&self) -> CaptureStats {
        CaptureStats {
            frames_captured: self.counters.captured.load(Ordering::Relaxed),
            frames_delivered: self.counters.delivered.load(Ordering::Relaxed),
            frames_dropped: self.counters.dropped.load(Ordering::Relaxed),
            capture_errors: self.counters.errors.load(Ordering::Relaxed),
            device: self.config.device.clone(),
        }
    }

    fn health_grace(&self) -> Duration {
        let base_ms = if self.config.target_fps == 0 {
            2_000
        } else {
            (1000 / self.config.target_fps).saturating_mul(6)
        };
        Duration::from_millis(base_ms.max(2_000) as u64)
    }

    fn rejected(&self, reason: &str) -> CaptureError {
        CaptureError::ConfigurationRejected {
            device: self.config.device.clone(),
            reason: reason.to_string(),
        }
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            log::error!("CaptureSession: stop on drop failed: {:#}", err);
        }
    }
}

fn open_device(config: &CaptureConfig) -> Result<Box<dyn CaptureDevice>, CaptureError> {
    let path = config.device.as_str();
    if path.starts_with("stub://") {
        return Ok(Box::new(SyntheticDevice::new(path, config.target_fps)));
    }
    #[cfg(feature = "ingest-v4l2")]
    {
        let node = if path == "default" { "/dev/video0" } else { path };
        match V4l2Device::open(node, config.target_fps) {
            Ok(device) => return Ok(Box::new(device)),
            Err(err) => log::warn!("CaptureSession: {:#}", err),
        }
    }
    Err(CaptureError::DeviceUnavailable {
        device: path.to_string(),
    })
}

fn capture_loop(
    mut device: Box<dyn CaptureDevice>,
    tx: SyncSender<Frame>,
    running: Arc<AtomicBool>,
    counters: Arc<CaptureCounters>,
) -> Box<dyn CaptureDevice> {
    while running.load(Ordering::SeqCst) {
        let frame = match device.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => continue,
            Err(err) => {
                counters.errors.fetch_add(1, Ordering::Relaxed);
                log::warn!("CaptureSession: read from {} failed: {:#}", device.name(), err);
                std::thread::sleep(ERROR_BACKOFF);
                continue;
            }
        };
        counters.captured.fetch_add(1, Ordering::Relaxed);
        counters.mark_frame();
        match tx.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(frame)) => {
                counters.dropped.fetch_add(1, Ordering::Relaxed);
                log::trace!(
                    "CaptureSession: dropped frame {} (previous still processing)",
                    frame.sequence()
                );
            }
            Err(TrySendError::Disconnected(_)) => break,
        }
    }
    device
}

fn delivery_loop(rx: Receiver<Frame>, sink: Arc<dyn FrameSink>, counters: Arc<CaptureCounters>) {
    for frame in rx {
        counters.delivered.fetch_add(1, Ordering::Relaxed);
        sink.on_frame(frame);
    }
}
