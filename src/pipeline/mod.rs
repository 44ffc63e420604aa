//! Real-time frame pipeline: sampling, dispatch, alignment and overlay
//!
//! All mutable pipeline state lives in one [`Pipeline`] value. [`Pipeline::spawn`]
//! moves it onto two interval tasks (sampling and render); the dispatcher spawns
//! the per-submission completion task itself.

pub mod alignment;
pub mod dispatch;
pub mod render;
pub mod scheduler;

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

pub use alignment::{AlignmentBuffer, AlignmentStats};
pub use dispatch::{DispatchOutcome, Dispatcher};
pub use render::{Hud, OverlayBox, RenderFrame, RenderLoop, VideoGeometry};
pub use scheduler::{FpsReading, SamplingScheduler, TickOutcome};

use crate::capture::{MetadataSlot, VideoSource};
use crate::inference::InferenceBackend;
use crate::metrics::MetricsAggregator;
use crate::utils::SessionClock;
use crate::Config;

/// Rendered frames waiting for a consumer. A new frame replaces any the
/// consumer has not picked up yet.
const RENDER_QUEUE_DEPTH: usize = 1;

pub struct Pipeline {
    clock: SessionClock,
    sample_period: Duration,
    render_period: Duration,
    source: Arc<dyn VideoSource>,
    metadata: Arc<MetadataSlot>,
    alignment: Arc<AlignmentBuffer>,
    dispatcher: Arc<Dispatcher>,
    metrics: MetricsAggregator,
    scheduler: SamplingScheduler,
    render: RenderLoop,
}

impl Pipeline {
    pub fn new(
        config: &Config,
        clock: SessionClock,
        source: Arc<dyn VideoSource>,
        metadata: Arc<MetadataSlot>,
        backend: Box<dyn InferenceBackend>,
        metrics: MetricsAggregator,
    ) -> Self {
        let alignment = Arc::new(AlignmentBuffer::new(config.alignment.capacity));
        let dispatcher = Arc::new(Dispatcher::new(
            backend,
            alignment.clone(),
            metrics.clone(),
            clock,
        ));
        Self {
            clock,
            sample_period: Duration::from_millis(config.sampling.interval_ms.max(1)),
            render_period: Duration::from_secs_f64(1.0 / config.render.refresh_hz.max(1) as f64),
            source,
            metadata,
            alignment,
            dispatcher,
            metrics,
            scheduler: SamplingScheduler::new(&config.sampling),
            render: RenderLoop::new(&config.render, (config.capture.width, config.capture.height)),
        }
    }

    pub fn alignment(&self) -> &Arc<AlignmentBuffer> {
        &self.alignment
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// One sampling step, for callers that drive the clock themselves.
    pub fn sample(&mut self) -> TickOutcome {
        self.scheduler.tick(
            self.clock.now_ms(),
            self.source.as_ref(),
            &self.metadata,
            &self.dispatcher,
        )
    }

    /// One render step, for callers that drive the clock themselves.
    pub fn render(&mut self) -> RenderFrame {
        self.render.tick(
            self.clock.now_ms(),
            self.metadata.latest(),
            &self.alignment,
            self.scheduler.processed_fps().get(),
            &self.metrics,
        )
    }

    /// Start the sampling and render loops. Rendered frames arrive on the
    /// returned channel.
    pub fn spawn(self) -> (PipelineHandle, flume::Receiver<RenderFrame>) {
        let (tx, rx) = flume::bounded(RENDER_QUEUE_DEPTH);
        let backlog = rx.clone();
        let Pipeline {
            clock,
            sample_period,
            render_period,
            source,
            metadata,
            alignment,
            dispatcher,
            metrics,
            mut scheduler,
            mut render,
        } = self;

        let fps = scheduler.processed_fps();
        let sampling = {
            let dispatcher = dispatcher.clone();
            let metadata = metadata.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(sample_period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    let outcome =
                        scheduler.tick(clock.now_ms(), source.as_ref(), &metadata, &dispatcher);
                    if outcome == TickOutcome::Closed {
                        break;
                    }
                }
                debug!("Sampling loop stopped");
            })
        };

        let rendering = {
            let metrics = metrics.clone();
            let alignment = alignment.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(render_period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    let frame = render.tick(
                        clock.now_ms(),
                        metadata.latest(),
                        &alignment,
                        fps.get(),
                        &metrics,
                    );
                    if !push_latest(&tx, &backlog, frame) {
                        break;
                    }
                }
                debug!("Render loop stopped");
            })
        };

        info!(
            sample_ms = sample_period.as_millis() as u64,
            render_hz = (1.0 / render_period.as_secs_f64()).round() as u64,
            backend = ?dispatcher.kind(),
            "Pipeline running"
        );

        (
            PipelineHandle {
                sampling: Some(sampling),
                rendering: Some(rendering),
                dispatcher,
                alignment,
                metrics,
            },
            rx,
        )
    }
}

/// Queue `frame`, discarding the oldest unread frames to make room.
/// Returns false once every outside receiver is gone.
fn push_latest(
    tx: &flume::Sender<RenderFrame>,
    backlog: &flume::Receiver<RenderFrame>,
    mut frame: RenderFrame,
) -> bool {
    if tx.receiver_count() <= 1 {
        return false;
    }
    loop {
        match tx.try_send(frame) {
            Ok(()) => return true,
            Err(flume::TrySendError::Full(back)) => {
                frame = back;
                if backlog.try_recv().is_ok() {
                    ::metrics::counter!("argus_render_frames_dropped_total").increment(1);
                }
            }
            Err(flume::TrySendError::Disconnected(_)) => return false,
        }
    }
}

/// Owner of the running loops. Dropping it without `shutdown` leaves them running.
pub struct PipelineHandle {
    sampling: Option<JoinHandle<()>>,
    rendering: Option<JoinHandle<()>>,
    dispatcher: Arc<Dispatcher>,
    alignment: Arc<AlignmentBuffer>,
    metrics: MetricsAggregator,
}

impl PipelineHandle {
    pub fn metrics(&self) -> &MetricsAggregator {
        &self.metrics
    }

    pub fn alignment_stats(&self) -> AlignmentStats {
        self.alignment.stats()
    }

    /// Stop both loops, end any metrics session and close the inference
    /// channel. Safe to call more than once.
    pub async fn shutdown(&mut self) {
        for task in [self.sampling.take(), self.rendering.take()].into_iter().flatten() {
            task.abort();
            let _ = task.await;
        }
        if self.metrics.is_running() {
            self.metrics.stop();
        }
        self.dispatcher.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CaptureMetadata, SampledFrame};
    use crate::inference::BackendKind;
    use crate::metrics::ByteCounters;
    use crate::pipeline::dispatch::tests::GatedBackend;
    use crate::InferenceMode;
    use std::sync::atomic::Ordering;

    struct Grey;

    impl VideoSource for Grey {
        fn sample_into(&self, dst: &mut SampledFrame) -> crate::Result<bool> {
            dst.data.fill(90);
            Ok(true)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_pipeline_renders_and_shuts_down() {
        let config = Config::default();
        let clock = SessionClock::new();
        let metadata = Arc::new(MetadataSlot::new());
        let backend = GatedBackend::new(BackendKind::Remote);
        let (gate, calls, closed) = (
            backend.gate.clone(),
            backend.calls.clone(),
            backend.closed.clone(),
        );
        let metrics = MetricsAggregator::new(
            InferenceMode::Remote,
            &crate::MetricsConfig {
                output: None,
                ..Default::default()
            },
            Arc::new(ByteCounters::default()),
            clock,
        );
        let pipeline = Pipeline::new(
            &config,
            clock,
            Arc::new(Grey),
            metadata.clone(),
            Box::new(backend),
            metrics,
        );
        let (mut handle, frames) = pipeline.spawn();
        handle.metrics().start(None);

        metadata.publish(CaptureMetadata {
            frame_id: 1,
            capture_ts: clock.now_ms(),
        });
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        gate.add_permits(1);
        let matched = loop {
            let frame = frames.recv_async().await.unwrap();
            if frame.matched {
                break frame;
            }
        };
        assert_eq!(matched.frame_id, Some(1));
        assert_eq!(matched.boxes.len(), 1);

        handle.shutdown().await;
        handle.shutdown().await;
        assert!(closed.load(Ordering::SeqCst));
        assert!(!handle.metrics().is_running());
        assert!(frames.is_disconnected());
    }

    fn rendered(frame_id: u64) -> RenderFrame {
        let mut render = RenderLoop::new(&crate::RenderConfig::default(), (64, 48));
        let metrics = MetricsAggregator::new(
            InferenceMode::Remote,
            &crate::MetricsConfig::default(),
            Arc::new(ByteCounters::default()),
            SessionClock::new(),
        );
        render.tick(
            0.0,
            Some(CaptureMetadata {
                frame_id,
                capture_ts: 0.0,
            }),
            &AlignmentBuffer::new(1),
            0.0,
            &metrics,
        )
    }

    #[test]
    fn full_queue_keeps_the_newest_frame() {
        let (tx, rx) = flume::bounded(RENDER_QUEUE_DEPTH);
        let backlog = rx.clone();
        for frame_id in 1..=5 {
            assert!(push_latest(&tx, &backlog, rendered(frame_id)));
        }
        assert_eq!(rx.len(), RENDER_QUEUE_DEPTH);
        assert_eq!(rx.try_recv().unwrap().frame_id, Some(5));

        drop(rx);
        assert!(!push_latest(&tx, &backlog, rendered(6)));
    }
}
