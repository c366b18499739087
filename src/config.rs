use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::capture::CaptureConfig;
use crate::detect::ResourceHandle;
use crate::frame::{BufferSize, PixelFormat};
use crate::geometry::Rect;
use crate::pipeline::PipelineSettings;

const DEFAULT_DEVICE: &str = "stub://rear_camera";
const DEFAULT_CAPTURE_WIDTH: u32 = 640;
const DEFAULT_CAPTURE_HEIGHT: u32 = 480;
const DEFAULT_TARGET_FPS: u32 = 30;
const DEFAULT_RESOURCES_DIR: &str = "resources";
const DEFAULT_MODEL_NAME: &str = "ObjectDetector";
const DEFAULT_MODEL_EXTENSION: &str = "json";
const DEFAULT_DISPLAY_WIDTH: u32 = 640;
const DEFAULT_DISPLAY_HEIGHT: u32 = 480;

#[derive(Debug, Deserialize, Default)]
struct OverlayConfigFile {
    capture: Option<CaptureConfigFile>,
    model: Option<ModelConfigFile>,
    display: Option<DisplayConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    device: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    target_fps: Option<u32>,
    pixel_format: Option<PixelFormat>,
}

#[derive(Debug, Deserialize, Default)]
struct ModelConfigFile {
    resources_dir: Option<PathBuf>,
    name: Option<String>,
    extension: Option<String>,
    confidence_threshold: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct DisplayConfigFile {
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct OverlayConfig {
    pub capture: CaptureSettings,
    pub model: ModelSettings,
    pub display: BufferSize,
}

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub target_fps: u32,
    pub pixel_format: PixelFormat,
}

#[derive(Debug, Clone)]
pub struct ModelSettings {
    pub resources_dir: PathBuf,
    pub name: String,
    pub extension: String,
    pub confidence_threshold: f32,
}

impl OverlayConfig {
    /// Defaults, then the file named by `OVERLAY_CONFIG`, then `OVERLAY_*` overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("OVERLAY_CONFIG").ok().map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    /// Like `load`, with an explicit config file in place of `OVERLAY_CONFIG`.
    pub fn load_from(config_path: Option<&Path>) -> Result<Self> {
        let file_cfg = match config_path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            device: self.capture.device.clone(),
            target_fps: self.capture.target_fps,
            pixel_format: self.capture.pixel_format,
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            preferred_resolution: BufferSize::new(self.capture.width, self.capture.height),
            display_bounds: Rect::new(
                0.0,
                0.0,
                self.display.width as f64,
                self.display.height as f64,
            ),
            confidence_threshold: self.model.confidence_threshold,
        }
    }

    pub fn model_resource(&self) -> ResourceHandle {
        ResourceHandle::new(&self.model.name, &self.model.extension)
    }

    fn from_file(file: OverlayConfigFile) -> Self {
        let capture = file.capture.unwrap_or_default();
        let model = file.model.unwrap_or_default();
        let display = file.display.unwrap_or_default();
        Self {
            capture: CaptureSettings {
                device: capture.device.unwrap_or_else(|| DEFAULT_DEVICE.to_string()),
                width: capture.width.unwrap_or(DEFAULT_CAPTURE_WIDTH),
                height: capture.height.unwrap_or(DEFAULT_CAPTURE_HEIGHT),
                target_fps: capture.target_fps.unwrap_or(DEFAULT_TARGET_FPS),
                pixel_format: capture.pixel_format.unwrap_or_default(),
            },
            model: ModelSettings {
                resources_dir: model
                    .resources_dir
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_RESOURCES_DIR)),
                name: model.name.unwrap_or_else(|| DEFAULT_MODEL_NAME.to_string()),
                extension: model
                    .extension
                    .unwrap_or_else(|| DEFAULT_MODEL_EXTENSION.to_string()),
                confidence_threshold: model.confidence_threshold.unwrap_or(0.0),
            },
            display: BufferSize::new(
                display.width.unwrap_or(DEFAULT_DISPLAY_WIDTH),
                display.height.unwrap_or(DEFAULT_DISPLAY_HEIGHT),
            ),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(device) = non_empty_env("OVERLAY_DEVICE") {
            self.capture.device = device;
        }
        if let Some(dir) = non_empty_env("OVERLAY_RESOURCES_DIR") {
            self.model.resources_dir = PathBuf::from(dir);
        }
        if let Some(name) = non_empty_env("OVERLAY_MODEL_NAME") {
            self.model.name = name;
        }
        if let Some(extension) = non_empty_env("OVERLAY_MODEL_EXTENSION") {
            self.model.extension = extension;
        }
        if let Some(confidence) = non_empty_env("OVERLAY_CONFIDENCE") {
            self.model.confidence_threshold = confidence
                .parse()
                .map_err(|_| anyhow!("OVERLAY_CONFIDENCE must be a number between 0 and 1"))?;
        }
        if let Some(fps) = non_empty_env("OVERLAY_TARGET_FPS") {
            self.capture.target_fps = fps
                .parse()
                .map_err(|_| anyhow!("OVERLAY_TARGET_FPS must be a positive integer"))?;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.capture.width == 0 || self.capture.height == 0 {
            return Err(anyhow!("capture width and height must be greater than zero"));
        }
        if self.capture.target_fps == 0 {
            return Err(anyhow!("capture target_fps must be at least 1"));
        }
        if self.display.is_empty() {
            return Err(anyhow!("display width and height must be greater than zero"));
        }
        let confidence = self.model.confidence_threshold;
        if !(0.0..=1.0).contains(&confidence) {
            return Err(anyhow!(
                "model confidence_threshold must be within [0, 1], got {}",
                confidence
            ));
        }
        self.model.name = self.model.name.trim().to_string();
        if self.model.name.is_empty() {
            return Err(anyhow!("model name must not be empty"));
        }
        self.model.extension = self
            .model
            .extension
            .trim()
            .trim_start_matches('.')
            .to_ascii_lowercase();
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<OverlayConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
