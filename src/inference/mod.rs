//! Inference backends and the pure decode / suppression stages

pub mod decode;
pub mod labels;
pub mod letterbox;
pub mod local;
pub mod nms;
#[cfg(feature = "onnx")]
pub mod onnx;
pub mod remote;
pub mod wire;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::capture::{CaptureMetadata, SampledFrame};
use crate::Result;

pub use labels::LabelMap;
pub use letterbox::Letterbox;
pub use local::{LocalBackend, ModelHandle, ModelLoader, ModelRunner, ModelStatus};
pub use remote::RemoteBackend;

/// One detected object. Coordinates are relative to the source frame.
///
/// Invariants: `0 <= xmin < xmax <= 1`, `0 <= ymin < ymax <= 1`, `0 <= score <= 1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    pub score: f32,
    pub xmin: f32,
    pub ymin: f32,
    pub xmax: f32,
    pub ymax: f32,
}

impl Detection {
    /// Clamp into the unit square; `None` for degenerate or non-finite boxes.
    pub fn clamped(
        label: impl Into<String>,
        score: f32,
        xmin: f32,
        ymin: f32,
        xmax: f32,
        ymax: f32,
    ) -> Option<Self> {
        if ![score, xmin, ymin, xmax, ymax].iter().all(|v| v.is_finite()) {
            return None;
        }
        let unit = |v: f32| v.clamp(0.0, 1.0);
        let (xmin, ymin, xmax, ymax) = (unit(xmin), unit(ymin), unit(xmax), unit(ymax));
        if xmax <= xmin || ymax <= ymin {
            return None;
        }
        Some(Self {
            label: label.into(),
            score: unit(score),
            xmin,
            ymin,
            xmax,
            ymax,
        })
    }

    pub fn area(&self) -> f32 {
        (self.xmax - self.xmin).max(0.0) * (self.ymax - self.ymin).max(0.0)
    }
}

/// Model output tensor, dropped right after decoding.
#[derive(Debug, Clone)]
pub struct RawInferenceOutput {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

/// Timing marks carried through one round trip.
///
/// `capture_ts`, `dispatched_ts` and `completed_ts` are session milliseconds;
/// the `server_*` marks come from the remote server's own clock.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct InferenceTiming {
    pub capture_ts: f64,
    pub dispatched_ts: f64,
    pub server_recv_ts: Option<f64>,
    pub server_inference_ts: Option<f64>,
    pub inference_ms: f64,
    pub completed_ts: f64,
}

impl InferenceTiming {
    /// Time between the server receiving the request and finishing inference.
    pub fn server_ms(&self) -> Option<f64> {
        match (self.server_recv_ts, self.server_inference_ts) {
            (Some(recv), Some(done)) => Some((done - recv).max(0.0)),
            _ => None,
        }
    }

    /// Round trip minus server time.
    pub fn network_ms(&self) -> Option<f64> {
        self.server_ms()
            .map(|server| ((self.completed_ts - self.dispatched_ts) - server).max(0.0))
    }
}

/// Detections for one frame, waiting in the alignment buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignedResult {
    pub frame_id: u64,
    pub detections: Vec<Detection>,
    pub inference_ts: f64,
    pub timing: InferenceTiming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Local,
    Remote,
}

impl From<BackendKind> for crate::InferenceMode {
    fn from(kind: BackendKind) -> Self {
        match kind {
            BackendKind::Local => crate::InferenceMode::Local,
            BackendKind::Remote => crate::InferenceMode::Remote,
        }
    }
}

/// Submit a sampled frame, eventually get detections for it.
///
/// The dispatcher never calls `submit` while a previous call is outstanding.
#[async_trait]
pub trait InferenceBackend: Send {
    fn kind(&self) -> BackendKind;

    async fn submit(
        &mut self,
        frame: Arc<SampledFrame>,
        meta: CaptureMetadata,
    ) -> Result<AlignedResult>;

    /// Release the channel or session. Must be idempotent.
    async fn close(&mut self);
}
