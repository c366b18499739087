//! Pipeline controller: capture → inference → overlay.
//!
//! State machine: `Idle → Configuring → Running ⇄ Paused → Stopped`, restartable
//! from `Stopped`.
//!
//! Frames arrive on the capture delivery thread. At most one inference is in
//! flight; a frame that arrives while one is outstanding is dropped. Results
//! are tagged with the run epoch they were submitted under. Leaving `Running`
//! bumps the epoch, so a result that completes after `pause` or `stop` is
//! discarded instead of rendered. Accepted results are posted to the render
//! thread through the `RenderQueue`; nothing here touches layer state directly.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::capture::{CaptureSession, CaptureStats, FrameSink};
use crate::detect::{DetectionBatch, InferenceAdapter, ModelCatalog, ResourceHandle};
use crate::error::{error_chain, InferenceError, PipelineError};
use crate::frame::{BufferSize, Frame};
use crate::geometry::{OverlayGeometry, Rect};
use crate::render::RenderQueue;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Configuring,
    Running,
    Paused,
    Stopped,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PipelineSettings {
    pub preferred_resolution: BufferSize,
    pub display_bounds: Rect,
    pub confidence_threshold: f32,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            preferred_resolution: BufferSize::VGA,
            display_bounds: Rect::new(0.0, 0.0, 640.0, 480.0),
            confidence_threshold: 0.0,
        }
    }
}

/// Where the detector comes from.
pub struct ModelSpec {
    pub catalog: ModelCatalog,
    pub resource: ResourceHandle,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Frames handed to the controller by the capture session.
    pub frames_seen: u64,
    pub submitted: u64,
    /// Dropped because an inference was already outstanding.
    pub dropped_busy: u64,
    /// Dropped because the pipeline was not running.
    pub dropped_inactive: u64,
    pub batches_rendered: u64,
    pub inference_failures: u64,
    /// Results discarded because the run they belonged to had ended.
    pub stale_results: u64,
}

#[derive(Default)]
struct Counters {
    frames_seen: AtomicU64,
    submitted: AtomicU64,
    dropped_busy: AtomicU64,
    dropped_inactive: AtomicU64,
    batches_rendered: AtomicU64,
    inference_failures: AtomicU64,
    stale_results: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            frames_seen: self.frames_seen.load(Ordering::Relaxed),
            submitted: self.submitted.load(Ordering::Relaxed),
            dropped_busy: self.dropped_busy.load(Ordering::Relaxed),
            dropped_inactive: self.dropped_inactive.load(Ordering::Relaxed),
            batches_rendered: self.batches_rendered.load(Ordering::Relaxed),
            inference_failures: self.inference_failures.load(Ordering::Relaxed),
            stale_results: self.stale_results.load(Ordering::Relaxed),
        }
    }
}

/// `in_flight` value when no inference is outstanding. Otherwise it holds
/// `epoch + 1` of the run that submitted the frame.
const IDLE: u64 = 0;

/// State shared with the capture delivery, inference and render threads.
struct Shared {
    accepting: AtomicBool,
    in_flight: AtomicU64,
    epoch: AtomicU64,
    render: RenderQueue,
    counters: Counters,
}

impl Shared {
    fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
    }

    fn claim(&self, epoch: u64) -> bool {
        self.in_flight
            .compare_exchange(IDLE, epoch + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Release a claim made by run `epoch`. A later run's claim is left alone.
    fn release(&self, epoch: u64) {
        let _ = self.in_flight.compare_exchange(
            epoch + 1,
            IDLE,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }
}

/// Frame sink installed on the capture session for one run.
struct FrameRouter {
    shared: Arc<Shared>,
    adapter: Arc<InferenceAdapter>,
    epoch: u64,
}

impl FrameSink for FrameRouter {
    fn on_frame(&self, frame: Frame) {
        let shared = &self.shared;
        Counters::bump(&shared.counters.frames_seen);
        if !shared.accepting.load(Ordering::SeqCst) || !shared.is_current(self.epoch) {
            Counters::bump(&shared.counters.dropped_inactive);
            return;
        }
        if !shared.claim(self.epoch) {
            Counters::bump(&shared.counters.dropped_busy);
            log::trace!(
                "PipelineController: dropped frame {} (inference outstanding)",
                frame.sequence()
            );
            return;
        }
        Counters::bump(&shared.counters.submitted);
        let completion_shared = shared.clone();
        let epoch = self.epoch;
        self.adapter
            .detect(frame, move |result| complete(&completion_shared, epoch, result));
    }
}

/// Runs on the inference worker.
fn complete(shared: &Arc<Shared>, epoch: u64, result: Result<DetectionBatch, InferenceError>) {
    shared.release(epoch);
    if !shared.is_current(epoch) {
        Counters::bump(&shared.counters.stale_results);
        log::debug!("PipelineController: discarded result from ended run {}", epoch);
        return;
    }

    let batch = match result {
        Ok(batch) => batch,
        Err(err) => {
            Counters::bump(&shared.counters.inference_failures);
            log::warn!("PipelineController: {}", error_chain(&err));
            return;
        }
    };
    let render_shared = shared.clone();
    let posted = shared.render.dispatch(move |renderer| {
        if !render_shared.is_current(epoch) {
            Counters::bump(&render_shared.counters.stale_results);
            return;
        }
        let geometry = *renderer.geometry();
        renderer.render(&batch, &geometry);
        Counters::bump(&render_shared.counters.batches_rendered);
    });
    if !posted {
        log::warn!("PipelineController: render thread is gone");
    }
}

pub struct PipelineController {
    settings: PipelineSettings,
    state: PipelineState,
    capture: CaptureSession,
    model: ModelSpec,
    adapter: Option<Arc<InferenceAdapter>>,
    router: Option<Arc<FrameRouter>>,
    shared: Arc<Shared>,
    last_error: Option<String>,
}

impl PipelineController {
    pub fn new(
        settings: PipelineSettings,
        capture: CaptureSession,
        model: ModelSpec,
        render: RenderQueue,
    ) -> Self {
        Self {
            settings,
            state: PipelineState::Idle,
            capture,
            model,
            adapter: None,
            router: None,
            shared: Arc::new(Shared {
                accepting: AtomicBool::new(false),
                in_flight: AtomicU64::new(IDLE),
                epoch: AtomicU64::new(0),
                render,
                counters: Counters::default(),
            }),
            last_error: None,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Error that ended the last failed `start`, if any.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn stats(&self) -> PipelineStats {
        self.shared.counters.snapshot()
    }

    pub fn capture_stats(&self) -> CaptureStats {
        self.capture.stats()
    }

    pub fn is_healthy(&self) -> bool {
        self.state == PipelineState::Running && self.capture.is_healthy()
    }

    /// Sink the capture session delivers to during the current run.
    pub fn frame_sink(&self) -> Option<Arc<dyn FrameSink>> {
        self.router
            .clone()
            .map(|router| router as Arc<dyn FrameSink>)
    }

    /// Configure capture, load the model and begin processing frames.
    ///
    /// Any configuration failure leaves the pipeline `Stopped` and is returned;
    /// it is not retried.
    pub fn start(&mut self) -> Result<(), PipelineError> {
        match self.state {
            PipelineState::Idle | PipelineState::Stopped => {}
            state => return Err(PipelineError::InvalidTransition { action: "start", state }),
        }
        self.state = PipelineState::Configuring;
        self.last_error = None;
        match self.configure_and_run() {
            Ok(()) => {
                self.state = PipelineState::Running;
                log::info!("PipelineController: running");
                Ok(())
            }
            Err(err) => {
                self.halt();
                self.adapter = None;
                self.router = None;
                self.state = PipelineState::Stopped;
                let message = error_chain(&err);
                log::error!("PipelineController: start failed: {}", message);
                self.last_error = Some(message);
                Err(err)
            }
        }
    }

    /// Halt capture and inference submissions, keeping the last overlay.
    pub fn pause(&mut self) -> Result<(), PipelineError> {
        self.expect_state("pause", PipelineState::Running)?;
        self.halt();
        self.state = PipelineState::Paused;
        log::info!("PipelineController: paused");
        Ok(())
    }

    pub fn resume(&mut self) -> Result<(), PipelineError> {
        self.expect_state("resume", PipelineState::Paused)?;
        if let Err(err) = self.begin_run() {
            self.halt();
            return Err(err.into());
        }
        self.state = PipelineState::Running;
        log::info!("PipelineController: resumed");
        Ok(())
    }

    /// Halt the pipeline and clear the overlay. An in-flight result is discarded.
    pub fn stop(&mut self) -> Result<(), PipelineError> {
        match self.state {
            PipelineState::Running | PipelineState::Paused => {}
            PipelineState::Stopped => return Ok(()),
            state => return Err(PipelineError::InvalidTransition { action: "stop", state }),
        }
        self.halt();
        self.shared.render.dispatch(|renderer| renderer.clear());
        self.state = PipelineState::Stopped;
        log::info!("PipelineController: stopped");
        Ok(())
    }

    /// The host surface changed size. Reflows the overlay without waiting for a new batch.
    pub fn set_display_bounds(&mut self, bounds: Rect) {
        self.settings.display_bounds = bounds;
        if let Some(buffer) = self.capture.buffer_size() {
            let geometry = OverlayGeometry::solve(buffer, bounds);
            self.shared
                .render
                .dispatch(move |renderer| renderer.reflow(&geometry));
        }
    }

    fn configure_and_run(&mut self) -> Result<(), PipelineError> {
        let buffer = self.capture.configure(self.settings.preferred_resolution)?;
        let model = self.model.catalog.load_model(&self.model.resource)?;
        let adapter = InferenceAdapter::new(model, self.settings.confidence_threshold)?;
        self.adapter = Some(Arc::new(adapter));

        let geometry = OverlayGeometry::solve(buffer, self.settings.display_bounds);
        self.shared
            .render
            .dispatch(move |renderer| renderer.reflow(&geometry));

        self.begin_run()?;
        Ok(())
    }

    fn begin_run(&mut self) -> anyhow::Result<()> {
        let adapter = self
            .adapter
            .clone()
            .ok_or_else(|| anyhow::anyhow!("no model loaded"))?;
        let router = Arc::new(FrameRouter {
            shared: self.shared.clone(),
            adapter,
            epoch: self.shared.epoch.load(Ordering::SeqCst),
        });
        self.shared.in_flight.store(IDLE, Ordering::SeqCst);
        self.capture.set_frame_sink(router.clone());
        self.router = Some(router);
        self.shared.accepting.store(true, Ordering::SeqCst);
        self.capture.start()
    }

    /// Stop accepting frames, end the current run and halt capture.
    fn halt(&mut self) {
        self.shared.accepting.store(false, Ordering::SeqCst);
        self.shared.epoch.fetch_add(1, Ordering::SeqCst);
        if let Err(err) = self.capture.stop() {
            log::error!("PipelineController: capture stop failed: {:#}", err);
        }
    }

    fn expect_state(
        &self,
        action: &'static str,
        expected: PipelineState,
    ) -> Result<(), PipelineError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(PipelineError::InvalidTransition {
                action,
                state: self.state,
            })
        }
    }
}

impl Drop for PipelineController {
    fn drop(&mut self) {
        if matches!(self.state, PipelineState::Running | PipelineState::Paused) {
            self.halt();
        }
    }
}
