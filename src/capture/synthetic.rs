//! Test-pattern producer standing in for a live camera

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::time::MissedTickBehavior;
use tracing::info;

use super::frame::{CaptureMetadata, Frame, FrameMetadata, PixelFormat};
use super::source::{FrameSlot, MetadataSlot};
use crate::utils::SessionClock;
use crate::CaptureConfig;

/// Dark background with a bright square bouncing across it.
pub fn render_pattern(width: u32, height: u32, tick: u64) -> Vec<u8> {
    let (w, h) = (width as usize, height as usize);
    let mut data = vec![32u8; w * h * 3];
    let side = (w.min(h) / 4).max(1);
    let span_x = w.saturating_sub(side).max(1) as u64;
    let span_y = h.saturating_sub(side).max(1) as u64;
    let bounce = |t: u64, span: u64| {
        let p = t % (2 * span);
        (if p < span { p } else { 2 * span - p }) as usize
    };
    let (ox, oy) = (bounce(tick * 4, span_x), bounce(tick * 3, span_y));

    for y in oy..(oy + side).min(h) {
        for x in ox..(ox + side).min(w) {
            let i = (y * w + x) * 3;
            data[i..i + 3].copy_from_slice(&[230, 200, 40]);
        }
    }
    data
}

/// Publish frames at `config.fps` and capture metadata at `config.metadata_hz`
/// until the task is aborted.
pub async fn run_test_pattern(
    config: CaptureConfig,
    frames: Arc<FrameSlot>,
    metadata: Arc<MetadataSlot>,
    clock: SessionClock,
) {
    info!(
        "Synthetic capture {}x{} @ {} fps, metadata @ {} Hz",
        config.width, config.height, config.fps, config.metadata_hz
    );

    let mut frame_tick = tokio::time::interval(Duration::from_secs_f64(
        1.0 / config.fps.max(1) as f64,
    ));
    frame_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut meta_tick = tokio::time::interval(Duration::from_secs_f64(
        1.0 / config.metadata_hz.max(1) as f64,
    ));
    meta_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut sequence = 0u64;
    let mut frame_id = 0u64;
    loop {
        tokio::select! {
            _ = frame_tick.tick() => {
                sequence += 1;
                frames.publish(Frame {
                    data: Bytes::from(render_pattern(config.width, config.height, sequence)),
                    meta: Arc::new(FrameMetadata {
                        sequence,
                        width: config.width,
                        height: config.height,
                        format: PixelFormat::Rgb24,
                    }),
                    timestamp: Instant::now(),
                });
            }
            _ = meta_tick.tick() => {
                frame_id += 1;
                metadata.publish(CaptureMetadata { frame_id, capture_ts: clock.now_ms() });
            }
        }
    }
}
