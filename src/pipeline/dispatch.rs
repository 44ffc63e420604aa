//! One-in-flight inference dispatch

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::alignment::AlignmentBuffer;
use crate::capture::{CaptureMetadata, SampledFrame};
use crate::inference::{BackendKind, InferenceBackend, InferenceTiming};
use crate::metrics::MetricsAggregator;
use crate::utils::SessionClock;
use crate::{AlignedResult, ArgusError, FailureKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Started,
    /// A previous submission is still outstanding; the request was dropped.
    Busy,
    Closed,
}

/// Clears the busy flag when the completion task ends, aborted or not.
struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Owns the backend and enforces a single outstanding submission.
pub struct Dispatcher {
    kind: BackendKind,
    backend: Arc<tokio::sync::Mutex<Box<dyn InferenceBackend>>>,
    busy: Arc<AtomicBool>,
    closed: AtomicBool,
    in_flight: Mutex<Option<JoinHandle<()>>>,
    alignment: Arc<AlignmentBuffer>,
    metrics: MetricsAggregator,
    clock: SessionClock,
}

impl Dispatcher {
    pub fn new(
        backend: Box<dyn InferenceBackend>,
        alignment: Arc<AlignmentBuffer>,
        metrics: MetricsAggregator,
        clock: SessionClock,
    ) -> Self {
        Self {
            kind: backend.kind(),
            backend: Arc::new(tokio::sync::Mutex::new(backend)),
            busy: Arc::new(AtomicBool::new(false)),
            closed: AtomicBool::new(false),
            in_flight: Mutex::new(None),
            alignment,
            metrics,
            clock,
        }
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Hand `frame` to the backend unless a submission is outstanding.
    /// Never waits.
    pub fn try_dispatch(&self, frame: Arc<SampledFrame>, meta: CaptureMetadata) -> DispatchOutcome {
        if self.closed.load(Ordering::Acquire) {
            return DispatchOutcome::Closed;
        }
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            ::metrics::counter!("argus_dispatch_dropped_total").increment(1);
            return DispatchOutcome::Busy;
        }

        let guard = BusyGuard(self.busy.clone());
        let backend = self.backend.clone();
        let completion = Completion {
            kind: self.kind,
            alignment: self.alignment.clone(),
            metrics: self.metrics.clone(),
            clock: self.clock,
        };
        let task = tokio::spawn(async move {
            let _guard = guard;
            let outcome = backend.lock().await.submit(frame, meta).await;
            completion.finish(meta, outcome);
        });
        *self.in_flight.lock() = Some(task);
        DispatchOutcome::Started
    }

    /// Wait for the outstanding submission, if any, to finish.
    pub async fn settle(&self) {
        let task = self.in_flight.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                if e.is_panic() {
                    error!("Inference task panicked: {}", e);
                }
            }
        }
    }

    /// Abort any outstanding submission and close the backend. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let task = self.in_flight.lock().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
        self.backend.lock().await.close().await;
        info!("{:?} inference dispatcher closed", self.kind);
    }
}

/// State the completion task needs once the backend answers.
struct Completion {
    kind: BackendKind,
    alignment: Arc<AlignmentBuffer>,
    metrics: MetricsAggregator,
    clock: SessionClock,
}

impl Completion {
    fn finish(&self, meta: CaptureMetadata, outcome: crate::Result<AlignedResult>) {
        match outcome {
            Ok(result) => {
                self.record(&result.timing);
                debug!(
                    frame_id = result.frame_id,
                    detections = result.detections.len(),
                    "Inference complete"
                );
                self.alignment.insert(result);
            }
            Err(e) => self.fail(meta, e),
        }
    }

    fn record(&self, timing: &InferenceTiming) {
        ::metrics::histogram!("argus_inference_ms").record(timing.inference_ms);
        if let Some(server) = timing.server_ms() {
            ::metrics::histogram!("argus_server_latency_ms").record(server);
        }
        if let Some(network) = timing.network_ms() {
            ::metrics::histogram!("argus_network_latency_ms").record(network);
        }
        self.metrics.record_inference(timing);
    }

    fn fail(&self, meta: CaptureMetadata, e: ArgusError) {
        let kind = e.kind();
        ::metrics::counter!("argus_inference_failures_total", "kind" => format!("{:?}", kind))
            .increment(1);
        match (kind, self.kind) {
            (FailureKind::TransientDrop, _) => {
                debug!(frame_id = meta.frame_id, "Dropped: {}", e);
            }
            (_, BackendKind::Local) => {
                error!(frame_id = meta.frame_id, "Local inference failed: {}", e);
                let now = self.clock.now_ms();
                self.alignment.insert(AlignedResult {
                    frame_id: meta.frame_id,
                    detections: Vec::new(),
                    inference_ts: now,
                    timing: InferenceTiming {
                        capture_ts: meta.capture_ts,
                        completed_ts: now,
                        ..InferenceTiming::default()
                    },
                });
            }
            (FailureKind::Transport, BackendKind::Remote) => {
                warn!(frame_id = meta.frame_id, "Remote round trip failed: {}", e);
            }
            (_, BackendKind::Remote) => {
                debug!(frame_id = meta.frame_id, "Remote reply discarded: {}", e);
            }
        }
    }
}
