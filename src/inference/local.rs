//! In-process model execution

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument};

use super::decode::decode;
use super::labels::LabelMap;
use super::letterbox::Letterbox;
use super::nms::suppress;
use super::{
    AlignedResult, BackendKind, Detection, InferenceBackend, InferenceTiming, RawInferenceOutput,
};
use crate::capture::{CaptureMetadata, SampledFrame};
use crate::utils::SessionClock;
use crate::{ArgusError, DecodeConfig, FailureKind, Result};

/// A loaded model: one `[1, 3, S, S]` input, one output tensor.
pub trait ModelRunner: Send {
    /// Side `S` of the square input
    fn input_size(&self) -> u32;

    fn run(&mut self, input: &[f32]) -> Result<RawInferenceOutput>;
}

/// Builds a runner; executed on the blocking pool.
pub type ModelLoader = Arc<dyn Fn() -> Result<Box<dyn ModelRunner>> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelStatus {
    NotLoaded,
    Loading,
    Ready,
    Failed(String),
}

struct ModelShared {
    status: Mutex<ModelStatus>,
    runner: Mutex<Option<Box<dyn ModelRunner>>>,
}

/// Shared view of the model session: status, load and reload.
#[derive(Clone)]
pub struct ModelHandle {
    shared: Arc<ModelShared>,
    loader: ModelLoader,
}

impl ModelHandle {
    pub fn new(loader: ModelLoader) -> Self {
        Self {
            shared: Arc::new(ModelShared {
                status: Mutex::new(ModelStatus::NotLoaded),
                runner: Mutex::new(None),
            }),
            loader,
        }
    }

    pub fn status(&self) -> ModelStatus {
        self.shared.status.lock().clone()
    }

    /// Begin the one-time load. `None` if already loading or ready.
    pub fn load(&self) -> Option<JoinHandle<()>> {
        {
            let mut status = self.shared.status.lock();
            match *status {
                ModelStatus::Loading | ModelStatus::Ready => return None,
                ModelStatus::NotLoaded | ModelStatus::Failed(_) => {
                    *status = ModelStatus::Loading;
                }
            }
        }
        Some(self.spawn_load())
    }

    /// Drop the current session and load again. `None` if a load is in progress.
    pub fn reload(&self) -> Option<JoinHandle<()>> {
        {
            let mut status = self.shared.status.lock();
            if *status == ModelStatus::Loading {
                return None;
            }
            *status = ModelStatus::Loading;
        }
        self.shared.runner.lock().take();
        Some(self.spawn_load())
    }

    fn spawn_load(&self) -> JoinHandle<()> {
        let shared = self.shared.clone();
        let loader = self.loader.clone();
        tokio::task::spawn_blocking(move || {
            let started = Instant::now();
            match loader() {
                Ok(runner) => {
                    info!(
                        "Model ready ({}x{} input) in {:?}",
                        runner.input_size(),
                        runner.input_size(),
                        started.elapsed()
                    );
                    *shared.runner.lock() = Some(runner);
                    *shared.status.lock() = ModelStatus::Ready;
                }
                Err(e) => {
                    error!("Model load failed: {}", e);
                    *shared.status.lock() = ModelStatus::Failed(e.to_string());
                }
            }
        })
    }

    fn fail(&self, reason: String) {
        *self.shared.status.lock() = ModelStatus::Failed(reason);
    }
}

/// Letterbox `frame` into the model input, run it, decode and suppress.
/// Returns the detections and the wall-clock model time in milliseconds.
pub fn detect(
    runner: &mut dyn ModelRunner,
    frame: &SampledFrame,
    tensor: &mut Vec<f32>,
    config: &DecodeConfig,
    labels: &LabelMap,
) -> Result<(Vec<Detection>, f64)> {
    let letterbox = Letterbox::new(runner.input_size(), frame.width, frame.height);
    letterbox.fill_tensor(&frame.data, tensor)?;

    let started = Instant::now();
    let raw = runner.run(tensor)?;
    let inference_ms = started.elapsed().as_secs_f64() * 1000.0;

    let detections = decode(&raw, &letterbox, config.score_floor, labels)?;
    let detections = suppress(
        detections,
        config.score_floor,
        config.iou_threshold,
        config.max_detections,
    );
    Ok((detections, inference_ms))
}

/// Local variant: letterbox, run, decode, suppress on the blocking pool.
pub struct LocalBackend {
    model: ModelHandle,
    decode: Arc<DecodeConfig>,
    labels: Arc<LabelMap>,
    tensor: Vec<f32>,
    clock: SessionClock,
}

impl LocalBackend {
    pub fn new(model: ModelHandle, decode: DecodeConfig, clock: SessionClock) -> Self {
        let labels = LabelMap::from_config(decode.labels.as_deref());
        Self {
            model,
            decode: Arc::new(decode),
            labels: Arc::new(labels),
            tensor: Vec::new(),
            clock,
        }
    }

    pub fn model(&self) -> &ModelHandle {
        &self.model
    }
}

#[async_trait]
impl InferenceBackend for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    #[instrument(skip(self, frame), fields(frame_id = meta.frame_id))]
    async fn submit(
        &mut self,
        frame: Arc<SampledFrame>,
        meta: CaptureMetadata,
    ) -> Result<AlignedResult> {
        let dispatched_ts = self.clock.now_ms();
        let status = self.model.status();
        if status != ModelStatus::Ready {
            return Err(ArgusError::ModelNotReady(status));
        }

        let model = self.model.clone();
        let (decode, labels) = (self.decode.clone(), self.labels.clone());
        let mut tensor = std::mem::take(&mut self.tensor);
        let (tensor, outcome) = tokio::task::spawn_blocking(move || {
            let outcome = match model.shared.runner.lock().as_mut() {
                Some(runner) => detect(&mut **runner, &frame, &mut tensor, &decode, &labels),
                None => Err(ArgusError::ModelNotReady(ModelStatus::NotLoaded)),
            };
            (tensor, outcome)
        })
        .await
        .map_err(|e| ArgusError::Inference(e.to_string()))?;
        self.tensor = tensor;

        let (detections, inference_ms) = outcome.map_err(|e| {
            if e.kind() == FailureKind::Backend {
                self.model.fail(e.to_string());
            }
            e
        })?;

        let now = self.clock.now_ms();
        Ok(AlignedResult {
            frame_id: meta.frame_id,
            detections,
            inference_ts: now,
            timing: InferenceTiming {
                capture_ts: meta.capture_ts,
                dispatched_ts,
                server_recv_ts: None,
                server_inference_ts: None,
                inference_ms,
                completed_ts: now,
            },
        })
    }

    async fn close(&mut self) {
        self.tensor = Vec::new();
    }
}
