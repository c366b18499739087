use std::sync::Mutex;

use tempfile::{Builder, NamedTempFile};

use detection_overlay::config::OverlayConfig;
use detection_overlay::{BufferSize, PixelFormat};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "OVERLAY_CONFIG",
        "OVERLAY_DEVICE",
        "OVERLAY_RESOURCES_DIR",
        "OVERLAY_MODEL_NAME",
        "OVERLAY_MODEL_EXTENSION",
        "OVERLAY_CONFIDENCE",
        "OVERLAY_TARGET_FPS",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn defaults_without_file_or_env() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = OverlayConfig::load().expect("load config");
    assert_eq!(cfg.capture.device, "stub://rear_camera");
    assert_eq!((cfg.capture.width, cfg.capture.height), (640, 480));
    assert_eq!(cfg.capture.target_fps, 30);
    assert_eq!(cfg.capture.pixel_format, PixelFormat::Nv12);
    assert_eq!(cfg.model.resources_dir, std::path::PathBuf::from("resources"));
    assert_eq!(cfg.model_resource().file_name(), "ObjectDetector.json");
    assert_eq!(cfg.model.confidence_threshold, 0.0);
    assert_eq!(cfg.display, BufferSize::new(640, 480));
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "capture": {
            "device": "/dev/video2",
            "width": 1280,
            "height": 720,
            "target_fps": 15,
            "pixel_format": "rgb24"
        },
        "model": {
            "resources_dir": "/opt/overlay/models",
            "name": "Shelf",
            "extension": "onnx",
            "confidence_threshold": 0.4
        },
        "display": { "width": 1080, "height": 1920 }
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("OVERLAY_CONFIG", file.path());
    std::env::set_var("OVERLAY_DEVICE", "stub://bench");
    std::env::set_var("OVERLAY_CONFIDENCE", "0.75");
    std::env::set_var("OVERLAY_MODEL_EXTENSION", ".JSON");

    let cfg = OverlayConfig::load().expect("load config");

    assert_eq!(cfg.capture.device, "stub://bench");
    assert_eq!((cfg.capture.width, cfg.capture.height), (1280, 720));
    assert_eq!(cfg.capture.target_fps, 15);
    assert_eq!(cfg.capture.pixel_format, PixelFormat::Rgb24);
    assert_eq!(cfg.model.name, "Shelf");
    assert_eq!(cfg.model.extension, "json");
    assert_eq!(cfg.model.confidence_threshold, 0.75);
    assert_eq!(cfg.display, BufferSize::new(1080, 1920));

    let settings = cfg.pipeline_settings();
    assert_eq!(settings.preferred_resolution, BufferSize::new(1280, 720));
    assert_eq!(settings.display_bounds.width, 1080.0);
    assert_eq!(cfg.capture_config().target_fps, 15);

    clear_env();
}

#[test]
fn toml_config_is_accepted() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = Builder::new().suffix(".toml").tempfile().expect("temp config");
    let toml = r#"
        [capture]
        device = "stub://toml"
        target_fps = 5

        [model]
        name = "Pantry"
    "#;
    std::io::Write::write_all(&mut file, toml.as_bytes()).expect("write config");

    let cfg = OverlayConfig::load_from(Some(file.path())).expect("load config");
    assert_eq!(cfg.capture.device, "stub://toml");
    assert_eq!(cfg.capture.target_fps, 5);
    assert_eq!(cfg.model.name, "Pantry");
    assert_eq!(cfg.capture.width, 640);

    clear_env();
}

#[test]
fn invalid_values_are_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("OVERLAY_CONFIDENCE", "1.5");
    assert!(OverlayConfig::load().is_err());
    std::env::set_var("OVERLAY_CONFIDENCE", "high");
    assert!(OverlayConfig::load().is_err());
    clear_env();

    std::env::set_var("OVERLAY_TARGET_FPS", "0");
    assert!(OverlayConfig::load().is_err());
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, br#"{"display": {"width": 0}}"#).expect("write config");
    assert!(OverlayConfig::load_from(Some(file.path())).is_err());

    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, br#"{"model": {"name": "  "}}"#).expect("write config");
    assert!(OverlayConfig::load_from(Some(file.path())).is_err());

    clear_env();
}
