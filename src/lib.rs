pub mod capture;
pub mod error;
pub mod inference;
pub mod metrics;
pub mod pipeline;
pub mod server;
pub mod utils;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub use capture::{CaptureMetadata, Frame, PixelFormat, SampledFrame};
pub use error::{ArgusError, FailureKind, Result};
pub use inference::{AlignedResult, Detection};

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub sampling: SamplingConfig,
    pub inference: InferenceConfig,
    pub decode: DecodeConfig,
    pub alignment: AlignmentConfig,
    pub render: RenderConfig,
    pub metrics: MetricsConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub source: SourceKind,
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub format: PixelFormat,
    pub buffer_count: u32,
    /// Rate of the capture metadata side-channel
    pub metadata_hz: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Synthetic,
    V4l2,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    pub interval_ms: u64,
    pub width: u32,
    pub height: u32,
    pub fps_alpha: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InferenceMode {
    Local,
    Remote,
}

impl std::fmt::Display for InferenceMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InferenceMode::Local => f.write_str("local"),
            InferenceMode::Remote => f.write_str("remote"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub mode: InferenceMode,
    pub model_path: PathBuf,
    /// Used when the model does not report a fixed input size
    pub model_size: u32,
    pub remote_url: String,
    pub jpeg_quality: u8,
    pub reply_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecodeConfig {
    pub score_floor: f32,
    pub iou_threshold: f32,
    pub max_detections: usize,
    /// Overrides the built-in COCO label table
    pub labels: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignmentConfig {
    pub capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    pub refresh_hz: u32,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub latency_alpha: f64,
    pub hud_interval_ms: u64,
    /// Keep the last detections for this many ticks without a match. 0 = strict pairing.
    pub hold_missed_frames: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub bandwidth_interval_ms: u64,
    pub output: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            source: SourceKind::Synthetic,
            device: "/dev/video0".into(),
            width: 640,
            height: 480,
            fps: 30,
            format: PixelFormat::Mjpeg,
            buffer_count: 4,
            metadata_hz: 15,
        }
    }
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            interval_ms: 100,
            width: 320,
            height: 240,
            fps_alpha: 0.2,
        }
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            mode: InferenceMode::Remote,
            model_path: PathBuf::from("models/model.onnx"),
            model_size: 320,
            remote_url: "ws://127.0.0.1:8000/detect".into(),
            jpeg_quality: 60,
            reply_timeout_ms: 2000,
        }
    }
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            score_floor: 0.25,
            iou_threshold: 0.45,
            max_detections: 50,
            labels: None,
        }
    }
}

impl Default for AlignmentConfig {
    fn default() -> Self {
        Self { capacity: 8 }
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            refresh_hz: 60,
            viewport_width: 1280,
            viewport_height: 720,
            latency_alpha: 0.2,
            hud_interval_ms: 200,
            hold_missed_frames: 0,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            bandwidth_interval_ms: 1000,
            output: Some(PathBuf::from("metrics.json")),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8000".into(),
        }
    }
}

impl Config {
    /// Load from an optional TOML file, then `ARGUS__SECTION__KEY` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix("ARGUS")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize::<Self>()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject sizes the capture and inference paths cannot work with.
    pub fn validate(&self) -> Result<()> {
        let sizes = [
            ("capture.width", self.capture.width),
            ("capture.height", self.capture.height),
            ("sampling.width", self.sampling.width),
            ("sampling.height", self.sampling.height),
            ("inference.model_size", self.inference.model_size),
        ];
        for (key, value) in sizes {
            if value == 0 {
                return Err(config::ConfigError::Message(format!("{key} must be non-zero")).into());
            }
        }
        Ok(())
    }
}
