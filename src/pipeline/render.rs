//! Display-rate overlay loop: geometry, latency HUD, frame-paired detections

use tracing::trace;

use super::alignment::AlignmentBuffer;
use crate::capture::CaptureMetadata;
use crate::metrics::MetricsAggregator;
use crate::utils::Ema;
use crate::{Detection, RenderConfig};

/// Where the video lands inside the viewport, in viewport pixels.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct VideoGeometry {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl VideoGeometry {
    /// Contain-fit `video` into `viewport`, centred.
    pub fn contain(video: (u32, u32), viewport: (u32, u32)) -> Self {
        let (vw, vh) = (video.0 as f32, video.1 as f32);
        let (pw, ph) = (viewport.0 as f32, viewport.1 as f32);
        if vw <= 0.0 || vh <= 0.0 || pw <= 0.0 || ph <= 0.0 {
            return Self::default();
        }
        let scale = (pw / vw).min(ph / vh);
        let (width, height) = (vw * scale, vh * scale);
        Self {
            x: (pw - width) / 2.0,
            y: (ph - height) / 2.0,
            width,
            height,
        }
    }
}

/// One box to draw, in viewport pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct OverlayBox {
    pub text: String,
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl OverlayBox {
    fn place(detection: &Detection, geometry: &VideoGeometry) -> Self {
        Self {
            text: format!("{} {:.0}%", detection.label, detection.score * 100.0),
            x: geometry.x + detection.xmin * geometry.width,
            y: geometry.y + detection.ymin * geometry.height,
            width: (detection.xmax - detection.xmin) * geometry.width,
            height: (detection.ymax - detection.ymin) * geometry.height,
        }
    }
}

/// Numbers shown on screen; refreshed at a throttled rate.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Hud {
    pub e2e_latency_ms: Option<f64>,
    pub processed_fps: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderFrame {
    /// Frame the overlay belongs to
    pub frame_id: Option<u64>,
    pub geometry: VideoGeometry,
    pub boxes: Vec<OverlayBox>,
    /// Detections were resolved for this exact frame on this tick
    pub matched: bool,
    pub hud: Hud,
    pub hud_updated: bool,
}

pub struct RenderLoop {
    video: (u32, u32),
    viewport: (u32, u32),
    latency: Ema,
    hud: Hud,
    hud_interval_ms: f64,
    last_hud_ms: Option<f64>,
    hold_missed: u32,
    missed: u32,
    shown: Vec<Detection>,
}

impl RenderLoop {
    pub fn new(config: &RenderConfig, video: (u32, u32)) -> Self {
        Self {
            video,
            viewport: (config.viewport_width, config.viewport_height),
            latency: Ema::new(config.latency_alpha),
            hud: Hud::default(),
            hud_interval_ms: config.hud_interval_ms as f64,
            last_hud_ms: None,
            hold_missed: config.hold_missed_frames,
            missed: 0,
            shown: Vec::new(),
        }
    }

    pub fn set_viewport(&mut self, width: u32, height: u32) {
        self.viewport = (width, height);
    }

    pub fn tick(
        &mut self,
        now_ms: f64,
        metadata: Option<CaptureMetadata>,
        alignment: &AlignmentBuffer,
        processed_fps: f64,
        metrics: &MetricsAggregator,
    ) -> RenderFrame {
        let geometry = VideoGeometry::contain(self.video, self.viewport);

        let smoothed = metadata.map(|meta| {
            let e2e = (now_ms - meta.capture_ts).max(0.0);
            ::metrics::histogram!("argus_e2e_latency_ms").record(e2e);
            self.latency.update(e2e)
        });

        let hud_updated = self
            .last_hud_ms
            .map_or(true, |last| now_ms - last >= self.hud_interval_ms);
        if hud_updated {
            self.hud = Hud {
                e2e_latency_ms: self.latency.value(),
                processed_fps,
            };
            self.last_hud_ms = Some(now_ms);
        }

        let matched = match metadata {
            Some(meta) => match alignment.take(meta.frame_id) {
                Some(result) => {
                    self.shown = result.detections;
                    self.missed = 0;
                    true
                }
                None => {
                    self.miss();
                    false
                }
            },
            None => {
                self.shown.clear();
                false
            }
        };

        if smoothed.is_some() {
            metrics.record_render(smoothed, processed_fps);
        }

        let boxes = self
            .shown
            .iter()
            .map(|d| OverlayBox::place(d, &geometry))
            .collect();
        trace!(matched, shown = self.shown.len(), "Render tick");

        RenderFrame {
            frame_id: metadata.map(|m| m.frame_id),
            geometry,
            boxes,
            matched,
            hud: self.hud,
            hud_updated,
        }
    }

    /// Strict pairing clears immediately; with a hold window the last set
    /// survives that many consecutive misses.
    fn miss(&mut self) {
        if self.shown.is_empty() {
            return;
        }
        if self.missed < self.hold_missed {
            self.missed += 1;
        } else {
            self.shown.clear();
            self.missed = 0;
        }
    }
}
