pub mod capture;
pub mod detect;
pub mod overlay;
pub mod pipeline;
pub mod utils;

use std::path::Path;

use arc_swap::ArcSwap;
use capture::{PixelFormat, Rotation};
use config::{Environment, File};
use serde::{Deserialize, Serialize};

pub use detect::DetectorOptions;
pub use pipeline::{
    FrameSubmitter, Pipeline, PipelineError, PipelineStats, PresentationQueue, ResultRouter,
    SubmitOutcome,
};

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub pipeline: PipelineConfig,
    pub detector: DetectorConfig,
}

/// Where frames come from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    #[default]
    Synthetic,
    V4l2,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub source: SourceKind,
    /// V4L2 device node; empty means auto-detect
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub format: PixelFormat,
    /// Clockwise degrees from sensor to upright
    pub rotation: Rotation,
    /// Raw frames the worker may have queued; a full queue evicts its oldest
    pub queue_depth: usize,
    /// Sensor buffers in circulation
    pub buffer_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Idle RGB buffers kept for reuse
    pub pool_buffers: usize,
    /// Send placeholder frames to the detector instead of dropping them
    pub forward_placeholders: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub accelerated: bool,
    pub confidence_threshold: f32,
    /// Luma above which the demo detector calls a pixel bright
    pub luma_threshold: u8,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            source: SourceKind::Synthetic,
            device: "/dev/video0".into(),
            width: 640,
            height: 480,
            fps: 30,
            format: PixelFormat::Yuv420_888,
            rotation: Rotation::Deg90, // back camera mounted sideways
            queue_depth: 2,
            buffer_count: 4,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            pool_buffers: 4,
            forward_placeholders: false,
        }
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            accelerated: false,
            confidence_threshold: 0.5,
            luma_threshold: 200,
        }
    }
}

impl DetectorConfig {
    pub fn options(&self) -> DetectorOptions {
        DetectorOptions {
            accelerated: self.accelerated,
            confidence_threshold: self.confidence_threshold,
        }
    }
}

impl Config {
    /// Defaults, then the optional TOML file, then `LOOKOUT__SECTION__KEY`
    /// environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        builder
            .add_source(
                Environment::with_prefix("LOOKOUT")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_back_camera_setup() {
        let config = Config::default();
        assert_eq!((config.capture.width, config.capture.height), (640, 480));
        assert_eq!(config.capture.rotation, Rotation::Deg90);
        assert_eq!(config.capture.queue_depth, 2);
        assert!(!config.pipeline.forward_placeholders);
        assert_eq!(config.detector.options(), DetectorOptions::default());
    }

    #[test]
    fn toml_overrides_only_what_it_names() {
        let path = std::env::temp_dir().join(format!("lookout-config-{}.toml", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "[capture]\nformat = \"nv21\"\nrotation = 270\n\n[detector]\naccelerated = true"
        )
        .unwrap();
        drop(file);

        let config = Config::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.capture.format, PixelFormat::Nv21);
        assert_eq!(config.capture.rotation, Rotation::Deg270);
        assert_eq!(config.capture.width, 640);
        assert!(config.detector.accelerated);
        assert_eq!(config.detector.luma_threshold, 200);
    }

    #[test]
    fn rotation_must_be_quarter_turn() {
        let path = std::env::temp_dir().join(format!("lookout-bad-{}.toml", std::process::id()));
        std::fs::write(&path, "[capture]\nrotation = 45\n").unwrap();
        let result = Config::load(Some(&path));
        std::fs::remove_file(&path).unwrap();
        assert!(result.is_err());
    }
}
