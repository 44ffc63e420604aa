//! Fixed-cadence sampling of the live video into the working buffer

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, trace, warn};

use super::dispatch::{DispatchOutcome, Dispatcher};
use crate::capture::{MetadataSlot, SampledFrame, VideoSource};
use crate::utils::Ema;
use crate::SamplingConfig;

/// Smoothed processed-FPS estimate, written by the scheduler and read by the
/// render loop.
#[derive(Debug, Clone, Default)]
pub struct FpsReading(Arc<AtomicU64>);

impl FpsReading {
    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    fn set(&self, fps: f64) {
        self.0.store(fps.to_bits(), Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Dispatched { frame_id: u64 },
    /// Previous sample still outstanding.
    SkippedBusy,
    NoMetadata,
    NoFrame,
    Closed,
}

/// Owns the working pixel buffer. One instance per pipeline, driven by the
/// sampling interval.
pub struct SamplingScheduler {
    buffer: Arc<SampledFrame>,
    width: u32,
    height: u32,
    fps: Ema,
    last_sample_ms: Option<f64>,
    reading: FpsReading,
}

impl SamplingScheduler {
    pub fn new(config: &SamplingConfig) -> Self {
        Self {
            buffer: Arc::new(SampledFrame::new(config.width, config.height)),
            width: config.width,
            height: config.height,
            fps: Ema::new(config.fps_alpha),
            last_sample_ms: None,
            reading: FpsReading::default(),
        }
    }

    pub fn processed_fps(&self) -> FpsReading {
        self.reading.clone()
    }

    pub fn tick(
        &mut self,
        now_ms: f64,
        source: &dyn VideoSource,
        metadata: &MetadataSlot,
        dispatcher: &Dispatcher,
    ) -> TickOutcome {
        if dispatcher.is_busy() {
            ::metrics::counter!("argus_ticks_skipped_total").increment(1);
            trace!("Sample outstanding, tick skipped");
            return TickOutcome::SkippedBusy;
        }
        let Some(meta) = metadata.latest() else {
            return TickOutcome::NoMetadata;
        };

        // The buffer is still shared while a finished submission's frame is
        // being dropped; fall back to a fresh one rather than wait.
        if Arc::get_mut(&mut self.buffer).is_none() {
            self.buffer = Arc::new(SampledFrame::new(self.width, self.height));
        }
        let Some(buffer) = Arc::get_mut(&mut self.buffer) else {
            return TickOutcome::NoFrame;
        };
        match source.sample_into(buffer) {
            Ok(true) => {}
            Ok(false) => return TickOutcome::NoFrame,
            Err(e) => {
                warn!("Video source unavailable: {}", e);
                return TickOutcome::NoFrame;
            }
        }

        match dispatcher.try_dispatch(self.buffer.clone(), meta) {
            DispatchOutcome::Started => {}
            DispatchOutcome::Busy => {
                ::metrics::counter!("argus_ticks_skipped_total").increment(1);
                return TickOutcome::SkippedBusy;
            }
            DispatchOutcome::Closed => return TickOutcome::Closed,
        }

        if let Some(last) = self.last_sample_ms.replace(now_ms) {
            let interval = now_ms - last;
            if interval > 0.0 {
                let fps = self.fps.update(1000.0 / interval);
                self.reading.set(fps);
                ::metrics::gauge!("argus_processed_fps").set(fps);
            }
        }
        debug!(frame_id = meta.frame_id, "Sample dispatched");
        TickOutcome::Dispatched {
            frame_id: meta.frame_id,
        }
    }
}
