use std::path::Path;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use tempfile::TempDir;

use detection_overlay::{
    render_channel, BufferSize, CaptureConfig, CaptureDevice, CaptureError, CaptureSession,
    DetectorBackend, Frame, FrameView, Label, LoaderRegistry, ModelCatalog, ModelError, ModelSpec,
    NormalizedRect, OverlayRenderer, PipelineController, PipelineError, PipelineSettings,
    PipelineState, PixelFormat, RankedDetection, RecordingSurface, Rect, RenderLoop,
    ResourceBundle, ResourceHandle,
};

const WAIT: Duration = Duration::from_secs(5);

/// Device that negotiates whatever it is asked for and never produces frames.
/// Tests push frames through the pipeline's sink themselves.
struct IdleDevice;

impl CaptureDevice for IdleDevice {
    fn name(&self) -> &str {
        "idle"
    }

    fn negotiate(&mut self, preferred: BufferSize, _format: PixelFormat) -> Result<BufferSize> {
        Ok(preferred)
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        std::thread::sleep(Duration::from_millis(5));
        Ok(None)
    }
}

/// Detector that reports each frame it starts and then blocks until released.
struct GatedBackend {
    entered: Sender<u64>,
    gate: Arc<Mutex<Receiver<()>>>,
}

impl DetectorBackend for GatedBackend {
    fn name(&self) -> &'static str {
        "gated"
    }

    fn detect(&mut self, frame: &FrameView<'_>) -> Result<Vec<RankedDetection>> {
        let _ = self.entered.send(frame.sequence());
        let gate = self.gate.lock().map_err(|_| anyhow!("gate poisoned"))?;
        gate.recv_timeout(Duration::from_secs(10))
            .map_err(|_| anyhow!("gate never opened"))?;
        Ok(vec![RankedDetection {
            labels: vec![Label {
                identifier: format!("frame{}", frame.sequence()),
                confidence: 0.9,
            }],
            bounding_box: NormalizedRect::new(0.25, 0.5, 0.25, 0.25),
        }])
    }
}

fn gated_registry() -> (LoaderRegistry, Receiver<u64>, Sender<()>) {
    let (entered_tx, entered_rx) = mpsc::channel();
    let (gate_tx, gate_rx) = mpsc::channel();
    let gate = Arc::new(Mutex::new(gate_rx));
    let mut registry = LoaderRegistry::new();
    registry.register("gated", move |_path: &Path| -> Result<Box<dyn DetectorBackend>> {
        Ok(Box::new(GatedBackend {
            entered: entered_tx.clone(),
            gate: gate.clone(),
        }))
    });
    (registry, entered_rx, gate_tx)
}

struct Harness {
    pipeline: PipelineController,
    render_loop: RenderLoop,
    surface: RecordingSurface,
    _resources: TempDir,
}

fn harness(
    capture: CaptureSession,
    registry: LoaderRegistry,
    resource: ResourceHandle,
    files: &[(&str, &str)],
) -> Result<Harness> {
    let resources = tempfile::tempdir()?;
    for (name, contents) in files {
        std::fs::write(resources.path().join(name), contents)?;
    }
    let surface = RecordingSurface::new();
    let (queue, render_loop) = render_channel(OverlayRenderer::new(Box::new(surface.clone())));
    let settings = PipelineSettings {
        preferred_resolution: BufferSize::VGA,
        display_bounds: Rect::new(0.0, 0.0, 960.0, 1280.0),
        confidence_threshold: 0.0,
    };
    let model = ModelSpec {
        catalog: ModelCatalog::new(ResourceBundle::new(resources.path()), registry),
        resource,
    };
    Ok(Harness {
        pipeline: PipelineController::new(settings, capture, model, queue),
        render_loop,
        surface,
        _resources: resources,
    })
}

fn idle_capture() -> CaptureSession {
    CaptureSession::with_device(CaptureConfig::default(), Box::new(IdleDevice))
}

fn frame(sequence: u64) -> Result<Frame> {
    let size = BufferSize::VGA;
    let len = PixelFormat::Nv12
        .frame_len(size)
        .ok_or_else(|| anyhow!("bad size"))?;
    Frame::new(vec![16u8; len], size, PixelFormat::Nv12, sequence)
}

fn wait_until(what: &str, mut done: impl FnMut() -> bool) -> Result<()> {
    let deadline = Instant::now() + WAIT;
    while !done() {
        if Instant::now() > deadline {
            return Err(anyhow!("timed out waiting for {}", what));
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    Ok(())
}

const SCRIPT_ONE_CUP: &str = r#"{
    "frames": [
        [{"labels": [{"identifier": "cup", "confidence": 0.87}],
          "bounding_box": {"x": 0.25, "y": 0.5, "width": 0.25, "height": 0.25}}]
    ],
    "fail_every": 2
}"#;

const SCRIPT_THREE_THEN_ONE: &str = r#"{
    "frames": [
        [{"labels": [{"identifier": "cup", "confidence": 0.9}],
          "bounding_box": {"x": 0.0, "y": 0.0, "width": 0.2, "height": 0.2}},
         {"labels": [{"identifier": "plant", "confidence": 0.8}],
          "bounding_box": {"x": 0.3, "y": 0.3, "width": 0.2, "height": 0.2}},
         {"labels": [{"identifier": "book", "confidence": 0.7}],
          "bounding_box": {"x": 0.6, "y": 0.6, "width": 0.2, "height": 0.2}}],
        [{"labels": [{"identifier": "person", "confidence": 0.6}],
          "bounding_box": {"x": 0.1, "y": 0.1, "width": 0.5, "height": 0.5}}]
    ]
}"#;

#[test]
fn frames_arriving_during_inference_are_dropped_not_queued() -> Result<()> {
    let (registry, entered, gate) = gated_registry();
    let mut h = harness(
        idle_capture(),
        registry,
        ResourceHandle::new("Detector", "gated"),
        &[("Detector.gated", "")],
    )?;
    h.pipeline.start()?;
    h.render_loop.run_pending();
    let sink = h
        .pipeline
        .frame_sink()
        .ok_or_else(|| anyhow!("no sink while running"))?;

    sink.on_frame(frame(1)?);
    assert_eq!(entered.recv_timeout(WAIT)?, 1);
    sink.on_frame(frame(2)?);
    sink.on_frame(frame(3)?);
    let stats = h.pipeline.stats();
    assert_eq!(stats.submitted, 1);
    assert_eq!(stats.dropped_busy, 2);

    gate.send(())?;
    assert!(h.render_loop.run_next(WAIT));
    let layers = h.render_loop.renderer().layers();
    assert_eq!(layers.len(), 1);
    assert_eq!(layers[0].label.text, "frame1\n일치율: 0.90");
    assert_eq!(layers[0].frame, Rect::new(480.0, 320.0, 240.0, 320.0));

    // Frames 2 and 3 were never queued: the next inference is frame 4.
    sink.on_frame(frame(4)?);
    assert_eq!(entered.recv_timeout(WAIT)?, 4);
    gate.send(())?;
    assert!(h.render_loop.run_next(WAIT));
    assert_eq!(h.render_loop.renderer().layers()[0].label.text, "frame4\n일치율: 0.90");
    assert!(entered.try_recv().is_err());

    let stats = h.pipeline.stats();
    assert_eq!(stats.submitted, 2);
    assert_eq!(stats.batches_rendered, 2);
    h.pipeline.stop()?;
    Ok(())
}

#[test]
fn result_completing_after_stop_is_not_rendered() -> Result<()> {
    let (registry, entered, gate) = gated_registry();
    let mut h = harness(
        idle_capture(),
        registry,
        ResourceHandle::new("Detector", "gated"),
        &[("Detector.gated", "")],
    )?;
    h.pipeline.start()?;
    h.render_loop.run_pending();
    let commits_before = h.surface.commits();
    let sink = h
        .pipeline
        .frame_sink()
        .ok_or_else(|| anyhow!("no sink while running"))?;

    sink.on_frame(frame(1)?);
    assert_eq!(entered.recv_timeout(WAIT)?, 1);
    h.pipeline.stop()?;
    assert_eq!(h.pipeline.state(), PipelineState::Stopped);

    gate.send(())?;
    wait_until("stale result", || h.pipeline.stats().stale_results == 1)?;
    h.render_loop.run_pending();

    assert!(h.render_loop.renderer().layers().is_empty());
    assert_eq!(h.surface.commits(), commits_before);
    assert_eq!(h.pipeline.stats().batches_rendered, 0);

    // The old run's sink no longer submits anything.
    sink.on_frame(frame(2)?);
    let stats = h.pipeline.stats();
    assert_eq!(stats.submitted, 1);
    assert_eq!(stats.dropped_inactive, 1);
    Ok(())
}

#[test]
fn pause_discards_in_flight_result_and_resume_accepts_new_frames() -> Result<()> {
    let (registry, entered, gate) = gated_registry();
    let mut h = harness(
        idle_capture(),
        registry,
        ResourceHandle::new("Detector", "gated"),
        &[("Detector.gated", "")],
    )?;
    h.pipeline.start()?;
    h.render_loop.run_pending();
    let sink = h
        .pipeline
        .frame_sink()
        .ok_or_else(|| anyhow!("no sink while running"))?;

    sink.on_frame(frame(1)?);
    assert_eq!(entered.recv_timeout(WAIT)?, 1);
    h.pipeline.pause()?;
    gate.send(())?;
    wait_until("stale result", || h.pipeline.stats().stale_results == 1)?;
    h.render_loop.run_pending();
    assert!(h.render_loop.renderer().layers().is_empty());

    h.pipeline.resume()?;
    let sink = h
        .pipeline
        .frame_sink()
        .ok_or_else(|| anyhow!("no sink after resume"))?;
    sink.on_frame(frame(5)?);
    assert_eq!(entered.recv_timeout(WAIT)?, 5);
    gate.send(())?;
    assert!(h.render_loop.run_next(WAIT));
    assert_eq!(h.render_loop.renderer().layers().len(), 1);

    // Pausing keeps the last overlay on screen.
    h.pipeline.pause()?;
    h.render_loop.run_pending();
    assert_eq!(h.render_loop.renderer().layers().len(), 1);

    // Stopping clears it.
    h.pipeline.stop()?;
    h.render_loop.run_pending();
    assert!(h.render_loop.renderer().layers().is_empty());
    Ok(())
}

#[test]
fn missing_model_stops_without_running() -> Result<()> {
    let mut h = harness(
        idle_capture(),
        LoaderRegistry::with_defaults(),
        ResourceHandle::new("ObjectDetector", "json"),
        &[],
    )?;
    let err = h.pipeline.start().unwrap_err();
    assert!(matches!(err, PipelineError::Model(ModelError::ModelMissing { .. })));
    assert_eq!(h.pipeline.state(), PipelineState::Stopped);
    assert!(h.pipeline.frame_sink().is_none());
    assert!(h
        .pipeline
        .last_error()
        .is_some_and(|message| message.contains("missing")));
    Ok(())
}

#[test]
fn unavailable_device_stops_without_running() -> Result<()> {
    let capture = CaptureSession::new(CaptureConfig {
        device: "/dev/no-such-camera".to_string(),
        ..CaptureConfig::default()
    });
    let mut h = harness(
        capture,
        LoaderRegistry::with_defaults(),
        ResourceHandle::new("ObjectDetector", "json"),
        &[("ObjectDetector.json", SCRIPT_ONE_CUP)],
    )?;
    let err = h.pipeline.start().unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Capture(CaptureError::DeviceUnavailable { .. })
    ));
    assert_eq!(h.pipeline.state(), PipelineState::Stopped);
    Ok(())
}

#[test]
fn failed_inference_leaves_overlay_unchanged() -> Result<()> {
    let mut h = harness(
        idle_capture(),
        LoaderRegistry::with_defaults(),
        ResourceHandle::new("ObjectDetector", "json"),
        &[("ObjectDetector.json", SCRIPT_ONE_CUP)],
    )?;
    h.pipeline.start()?;
    h.render_loop.run_pending();
    let sink = h
        .pipeline
        .frame_sink()
        .ok_or_else(|| anyhow!("no sink while running"))?;

    sink.on_frame(frame(1)?);
    assert!(h.render_loop.run_next(WAIT));
    assert_eq!(h.render_loop.renderer().layers().len(), 1);
    let commits = h.surface.commits();

    // Second call fails in the scripted detector.
    sink.on_frame(frame(2)?);
    wait_until("inference failure", || h.pipeline.stats().inference_failures == 1)?;
    assert_eq!(h.render_loop.run_pending(), 0);
    assert_eq!(h.render_loop.renderer().layers().len(), 1);
    assert_eq!(h.surface.commits(), commits);
    assert_eq!(h.pipeline.state(), PipelineState::Running);

    // The feed keeps going with the next frame.
    sink.on_frame(frame(3)?);
    assert!(h.render_loop.run_next(WAIT));
    assert_eq!(h.pipeline.stats().batches_rendered, 2);
    h.pipeline.stop()?;
    Ok(())
}

#[test]
fn render_replaces_layers_atomically_per_batch() -> Result<()> {
    let mut h = harness(
        idle_capture(),
        LoaderRegistry::with_defaults(),
        ResourceHandle::new("ObjectDetector", "json"),
        &[("ObjectDetector.json", SCRIPT_THREE_THEN_ONE)],
    )?;
    h.pipeline.start()?;
    h.render_loop.run_pending();
    let sink = h
        .pipeline
        .frame_sink()
        .ok_or_else(|| anyhow!("no sink while running"))?;

    sink.on_frame(frame(1)?);
    assert!(h.render_loop.run_next(WAIT));
    let tree = h.surface.last_tree().ok_or_else(|| anyhow!("nothing committed"))?;
    assert_eq!(tree.layers.len(), 3);
    assert!(tree
        .layers
        .iter()
        .all(|layer| layer.name == "Found Object" && layer.label.name == "Object Label"));

    sink.on_frame(frame(2)?);
    assert!(h.render_loop.run_next(WAIT));
    let tree = h.surface.last_tree().ok_or_else(|| anyhow!("nothing committed"))?;
    assert_eq!(tree.layers.len(), 1);
    assert!(tree.layers[0].label.text.starts_with("person\n"));
    assert!(h.surface.last_transaction().is_some_and(|tx| tx.disable_actions));
    h.pipeline.stop()?;
    Ok(())
}

#[test]
fn display_resize_reflows_current_layers() -> Result<()> {
    let mut h = harness(
        idle_capture(),
        LoaderRegistry::with_defaults(),
        ResourceHandle::new("ObjectDetector", "json"),
        &[("ObjectDetector.json", SCRIPT_ONE_CUP)],
    )?;
    h.pipeline.start()?;
    let sink = h
        .pipeline
        .frame_sink()
        .ok_or_else(|| anyhow!("no sink while running"))?;
    sink.on_frame(frame(1)?);
    h.render_loop.run_pending();
    wait_until("first batch", || {
        h.render_loop.run_pending();
        h.pipeline.stats().batches_rendered == 1
    })?;
    assert_eq!(
        h.render_loop.renderer().layers()[0].frame,
        Rect::new(480.0, 320.0, 240.0, 320.0)
    );

    h.pipeline.set_display_bounds(Rect::new(0.0, 0.0, 480.0, 640.0));
    assert_eq!(h.render_loop.run_pending(), 1);
    let layers = h.render_loop.renderer().layers();
    assert_eq!(layers.len(), 1);
    assert_eq!(layers[0].frame, Rect::new(240.0, 160.0, 120.0, 160.0));
    assert_eq!(h.pipeline.stats().batches_rendered, 1);
    h.pipeline.stop()?;
    Ok(())
}

#[test]
fn synthetic_camera_runs_end_to_end() -> Result<()> {
    let capture = CaptureSession::new(CaptureConfig {
        device: "stub://bench".to_string(),
        target_fps: 120,
        ..CaptureConfig::default()
    });
    let mut h = harness(
        capture,
        LoaderRegistry::with_defaults(),
        ResourceHandle::new("ObjectDetector", "json"),
        &[("ObjectDetector.json", SCRIPT_THREE_THEN_ONE)],
    )?;
    h.pipeline.start()?;
    let deadline = Instant::now() + WAIT;
    while h.pipeline.stats().batches_rendered < 3 && Instant::now() < deadline {
        h.render_loop.run_next(Duration::from_millis(50));
    }
    h.pipeline.stop()?;
    h.render_loop.run_pending();

    let stats = h.pipeline.stats();
    assert!(stats.batches_rendered >= 3);
    assert_eq!(
        stats.frames_seen,
        stats.submitted + stats.dropped_busy + stats.dropped_inactive
    );
    let capture = h.pipeline.capture_stats();
    assert!(capture.frames_captured >= stats.frames_seen);
    assert!(h.render_loop.renderer().layers().is_empty());
    Ok(())
}
