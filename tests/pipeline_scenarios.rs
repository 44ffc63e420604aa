//! End-to-end behaviour of the frame pipeline with fake video and backends

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use argus::capture::{MetadataSlot, VideoSource};
use argus::inference::{BackendKind, InferenceBackend, InferenceTiming};
use argus::metrics::{ByteCounters, MetricsAggregator, Stat};
use argus::pipeline::{AlignmentBuffer, Dispatcher, Pipeline, RenderLoop, TickOutcome};
use argus::utils::SessionClock;
use argus::{
    AlignedResult, ArgusError, CaptureMetadata, Config, Detection, InferenceMode, MetricsConfig,
    RenderConfig, SampledFrame,
};
use async_trait::async_trait;
use proptest::prelude::*;
use tokio::sync::Semaphore;

struct StillVideo;

impl VideoSource for StillVideo {
    fn sample_into(&self, dst: &mut SampledFrame) -> argus::Result<bool> {
        dst.data.fill(64);
        Ok(true)
    }
}

/// Holds every submission until a permit is released; records overlap.
#[derive(Clone)]
struct Held {
    gate: Arc<Semaphore>,
    calls: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
}

impl Held {
    fn new() -> Self {
        Self {
            gate: Arc::new(Semaphore::new(0)),
            calls: Arc::default(),
            active: Arc::default(),
            max_active: Arc::default(),
        }
    }
}

struct HeldBackend(Held);

#[async_trait]
impl InferenceBackend for HeldBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }

    async fn submit(
        &mut self,
        _frame: Arc<SampledFrame>,
        meta: CaptureMetadata,
    ) -> argus::Result<AlignedResult> {
        let held = &self.0;
        held.calls.fetch_add(1, Ordering::SeqCst);
        let now = held.active.fetch_add(1, Ordering::SeqCst) + 1;
        held.max_active.fetch_max(now, Ordering::SeqCst);
        let permit = held.gate.acquire().await;
        held.active.fetch_sub(1, Ordering::SeqCst);
        permit.map_err(|_| ArgusError::ChannelClosed)?.forget();

        Ok(AlignedResult {
            frame_id: meta.frame_id,
            detections: vec![person()],
            inference_ts: 20.0,
            timing: InferenceTiming {
                capture_ts: meta.capture_ts,
                ..InferenceTiming::default()
            },
        })
    }

    async fn close(&mut self) {
        self.0.gate.close();
    }
}

fn person() -> Detection {
    Detection::clamped("person", 0.9, 0.2, 0.2, 0.6, 0.8).unwrap()
}

fn metrics(clock: SessionClock) -> MetricsAggregator {
    MetricsAggregator::new(
        InferenceMode::Remote,
        &MetricsConfig {
            output: None,
            ..MetricsConfig::default()
        },
        Arc::new(ByteCounters::default()),
        clock,
    )
}

fn meta(frame_id: u64, capture_ts: f64) -> CaptureMetadata {
    CaptureMetadata {
        frame_id,
        capture_ts,
    }
}

fn aligned(frame_id: u64) -> AlignedResult {
    AlignedResult {
        frame_id,
        detections: vec![person()],
        inference_ts: 20.0,
        timing: InferenceTiming::default(),
    }
}

fn pipeline(held: &Held, clock: SessionClock) -> (Pipeline, Arc<MetadataSlot>) {
    let metadata = Arc::new(MetadataSlot::new());
    let pipeline = Pipeline::new(
        &Config::default(),
        clock,
        Arc::new(StillVideo),
        metadata.clone(),
        Box::new(HeldBackend(held.clone())),
        metrics(clock),
    );
    (pipeline, metadata)
}

#[test]
fn scenario_a_matching_result_is_drawn_once() {
    let buffer = AlignmentBuffer::new(8);
    let mut render = RenderLoop::new(&RenderConfig::default(), (640, 480));
    let metrics = metrics(SessionClock::new());

    let current = Some(meta(5, 1000.0));
    buffer.insert(aligned(5));
    let drawn = render.tick(1016.0, current, &buffer, 0.0, &metrics);
    assert!(drawn.matched);
    assert_eq!(drawn.frame_id, Some(5));
    assert_eq!(drawn.boxes.len(), 1);
    assert!(!buffer.contains(5));

    let next = render.tick(1032.0, current, &buffer, 0.0, &metrics);
    assert!(!next.matched);
    assert!(next.boxes.is_empty());
}

#[test]
fn scenario_b_stale_result_is_never_drawn() {
    let buffer = AlignmentBuffer::new(8);
    let mut render = RenderLoop::new(&RenderConfig::default(), (640, 480));
    let metrics = metrics(SessionClock::new());

    buffer.insert(aligned(5));
    let frame = render.tick(1016.0, Some(meta(6, 1000.0)), &buffer, 0.0, &metrics);
    assert!(!frame.matched);
    assert!(frame.boxes.is_empty());
    assert!(buffer.is_empty());
}

#[tokio::test]
async fn scenario_c_median_and_p95_use_index_rules() {
    let metrics = metrics(SessionClock::new());
    let buffer = AlignmentBuffer::new(8);
    let mut render = RenderLoop::new(
        &RenderConfig {
            latency_alpha: 1.0,
            ..RenderConfig::default()
        },
        (640, 480),
    );

    metrics.start(None);
    for (i, e2e) in [100.0, 150.0, 120.0, 500.0].into_iter().enumerate() {
        render.tick(1000.0 + e2e, Some(meta(i as u64, 1000.0)), &buffer, 10.0, &metrics);
    }
    let summary = metrics.stop();

    assert_eq!(summary.samples.e2e, 4);
    assert_eq!(summary.e2e_latency_ms, Stat { median: 150.0, p95: 150.0 });
    assert_ne!(summary.e2e_latency_ms.p95, 500.0);
    assert_eq!(summary.processed_fps, Stat { median: 10.0, p95: 10.0 });
}

#[tokio::test(start_paused = true)]
async fn scenario_d_ticks_while_outstanding_are_skipped() {
    let held = Held::new();
    let clock = SessionClock::new();
    let (mut pipeline, metadata) = pipeline(&held, clock);
    metadata.publish(meta(1, clock.now_ms()));

    assert_eq!(pipeline.sample(), TickOutcome::Dispatched { frame_id: 1 });
    tokio::task::yield_now().await;
    tokio::time::advance(Duration::from_millis(100)).await;
    assert_eq!(pipeline.sample(), TickOutcome::SkippedBusy);
    tokio::time::advance(Duration::from_millis(100)).await;
    assert_eq!(pipeline.sample(), TickOutcome::SkippedBusy);

    assert_eq!(held.calls.load(Ordering::SeqCst), 1);

    held.gate.add_permits(1);
    pipeline.dispatcher().settle().await;
    let frame = pipeline.render();
    assert!(frame.matched);
    assert_eq!(frame.frame_id, Some(1));
}

#[tokio::test(start_paused = true)]
async fn spawned_pipeline_pairs_exactly_and_never_overlaps() {
    let held = Held::new();
    let clock = SessionClock::new();
    let (pipeline, metadata) = pipeline(&held, clock);
    let (mut handle, frames) = pipeline.spawn();

    // Metadata advances at ~15 Hz; the backend answers every 150 ms.
    let publisher = {
        let metadata = metadata.clone();
        tokio::spawn(async move {
            for frame_id in 1.. {
                metadata.publish(meta(frame_id, clock.now_ms()));
                tokio::time::sleep(Duration::from_millis(66)).await;
            }
        })
    };
    let releaser = {
        let gate = held.gate.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(150)).await;
                gate.add_permits(1);
            }
        })
    };

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    let mut drawn = 0;
    while tokio::time::Instant::now() < deadline {
        let Ok(frame) = frames.recv_async().await else {
            break;
        };
        if frame.matched {
            drawn += 1;
            assert!(!frame.boxes.is_empty());
        }
        if !frame.boxes.is_empty() {
            // Strict pairing: boxes only ever appear on the tick that matched.
            assert!(frame.matched);
        }
    }

    publisher.abort();
    releaser.abort();
    handle.shutdown().await;

    assert!(held.calls.load(Ordering::SeqCst) > 1);
    assert_eq!(held.max_active.load(Ordering::SeqCst), 1);
    let stats = handle.alignment_stats();
    assert!(drawn > 0);
    assert!(stats.taken >= drawn);
    assert!(stats.inserted >= stats.taken);
}

#[tokio::test(start_paused = true)]
async fn stalled_consumer_resumes_on_the_latest_frame() {
    let held = Held::new();
    let clock = SessionClock::new();
    let (pipeline, metadata) = pipeline(&held, clock);
    let (mut handle, frames) = pipeline.spawn();

    for frame_id in 1..=60 {
        metadata.publish(meta(frame_id, clock.now_ms()));
        tokio::time::sleep(Duration::from_millis(16)).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    let first = frames.recv_async().await.unwrap();
    assert_eq!(first.frame_id, Some(60));
    assert!(frames.is_empty());

    handle.shutdown().await;
}

#[tokio::test]
async fn teardown_is_idempotent() {
    let held = Held::new();
    let clock = SessionClock::new();
    let (pipeline, metadata) = pipeline(&held, clock);
    metadata.publish(meta(1, 0.0));
    let (mut handle, _frames) = pipeline.spawn();
    handle.metrics().start(None);

    handle.shutdown().await;
    handle.shutdown().await;
    assert!(!handle.metrics().is_running());
    assert_eq!(handle.metrics().stop().samples.e2e, 0);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Any interleaving of sampling ticks and completions keeps at most one
    /// submission outstanding and never runs more than one per start.
    #[test]
    fn at_most_one_in_flight(steps in prop::collection::vec(any::<bool>(), 1..40)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        runtime.block_on(async {
            let held = Held::new();
            let clock = SessionClock::new();
            let alignment = Arc::new(AlignmentBuffer::new(8));
            let dispatcher = Dispatcher::new(
                Box::new(HeldBackend(held.clone())),
                alignment.clone(),
                metrics(clock),
                clock,
            );
            let mut started = 0;
            for (i, complete) in steps.into_iter().enumerate() {
                if complete {
                    held.gate.add_permits(1);
                    dispatcher.settle().await;
                } else {
                    let frame = Arc::new(SampledFrame::new(4, 4));
                    let outcome = dispatcher.try_dispatch(frame, meta(i as u64, 0.0));
                    if outcome == argus::pipeline::DispatchOutcome::Started {
                        started += 1;
                    }
                    tokio::task::yield_now().await;
                }
                assert!(held.active.load(Ordering::SeqCst) <= 1);
            }
            dispatcher.close().await;
            assert!(held.max_active.load(Ordering::SeqCst) <= 1);
            assert_eq!(held.calls.load(Ordering::SeqCst), started);
        });
    }
}
