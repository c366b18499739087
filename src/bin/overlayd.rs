//! overlayd - live detection overlay daemon
//!
//! This daemon:
//! 1. Loads configuration (file + OVERLAY_* environment)
//! 2. Opens the capture device and the detector model
//! 3. Runs the pipeline with a headless render surface
//! 4. Logs a health line periodically until Ctrl-C or the time limit

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use detection_overlay::{
    render_channel, BufferSize, CaptureSession, LoaderRegistry, ModelCatalog, ModelSpec,
    OverlayConfig, OverlayRenderer, PipelineController, RecordingSurface, RenderSurface,
    ResourceBundle,
};

const HEALTH_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(author, version, about = "Live object-detection overlay daemon")]
struct Args {
    /// JSON or TOML config file.
    #[arg(long, env = "OVERLAY_CONFIG")]
    config: Option<PathBuf>,

    /// Stop after this many seconds. 0 runs until Ctrl-C.
    #[arg(long, default_value_t = 0)]
    seconds: u64,

    /// Display surface size as WIDTHxHEIGHT, overriding the config.
    #[arg(long, value_parser = parse_display)]
    display: Option<BufferSize>,

    /// Write the final overlay as a JPEG on exit.
    #[cfg(feature = "snapshot")]
    #[arg(long)]
    snapshot: Option<PathBuf>,
}

fn parse_display(value: &str) -> Result<BufferSize> {
    let (w, h) = value
        .split_once(['x', 'X'])
        .ok_or_else(|| anyhow!("expected WIDTHxHEIGHT, got {:?}", value))?;
    let size = BufferSize::new(w.trim().parse()?, h.trim().parse()?);
    if size.is_empty() {
        return Err(anyhow!("display size must be non-zero"));
    }
    Ok(size)
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = OverlayConfig::load_from(args.config.as_deref())?;
    if let Some(display) = args.display {
        cfg.display = display;
    }
    log::info!(
        "overlayd {} device={} model={} display={}",
        env!("CARGO_PKG_VERSION"),
        cfg.capture.device,
        cfg.model_resource().file_name(),
        cfg.display
    );

    let recording = RecordingSurface::new();
    #[cfg(feature = "snapshot")]
    let raster =
        detection_overlay::render::RasterSurface::new(cfg.display.width, cfg.display.height);
    #[cfg(feature = "snapshot")]
    let surface: Box<dyn RenderSurface> = match args.snapshot {
        Some(_) => Box::new(raster.clone()),
        None => Box::new(recording.clone()),
    };
    #[cfg(not(feature = "snapshot"))]
    let surface: Box<dyn RenderSurface> = Box::new(recording.clone());

    let (render_queue, render_loop) = render_channel(OverlayRenderer::new(surface));
    let render_thread = render_loop.spawn()?;

    let catalog = ModelCatalog::new(
        ResourceBundle::new(&cfg.model.resources_dir),
        LoaderRegistry::with_defaults(),
    );
    let mut pipeline = PipelineController::new(
        cfg.pipeline_settings(),
        CaptureSession::new(cfg.capture_config()),
        ModelSpec {
            catalog,
            resource: cfg.model_resource(),
        },
        render_queue,
    );
    pipeline.start()?;

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    let deadline = (args.seconds > 0).then(|| Instant::now() + Duration::from_secs(args.seconds));
    loop {
        let wait = match deadline {
            Some(deadline) => deadline
                .saturating_duration_since(Instant::now())
                .min(HEALTH_INTERVAL),
            None => HEALTH_INTERVAL,
        };
        match rx.recv_timeout(wait) {
            Ok(()) => {
                log::info!("shutdown signal received");
                break;
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {}
        }
        log_health(&pipeline);
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            break;
        }
    }

    pipeline.stop()?;
    log_health(&pipeline);
    drop(pipeline);
    render_thread
        .join()
        .map_err(|_| anyhow!("render thread panicked"))?;

    if let Some(tree) = recording.last_tree() {
        log::info!("last overlay: {} layers", tree.layers.len());
    }
    #[cfg(feature = "snapshot")]
    if let Some(path) = args.snapshot {
        raster.save_jpeg(&path)?;
        log::info!("overlay snapshot written to {}", path.display());
    }
    Ok(())
}

fn log_health(pipeline: &PipelineController) {
    let capture = pipeline.capture_stats();
    let stats = pipeline.stats();
    log::info!(
        "health: state={:?} healthy={} captured={} capture_dropped={} submitted={} busy_dropped={} rendered={} inference_failures={} stale={}",
        pipeline.state(),
        pipeline.is_healthy(),
        capture.frames_captured,
        capture.frames_dropped,
        stats.submitted,
        stats.dropped_busy,
        stats.batches_rendered,
        stats.inference_failures,
        stats.stale_results
    );
}
