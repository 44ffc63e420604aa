use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// Captured frame as delivered by a capture producer
#[derive(Clone)]
pub struct Frame {
    /// Immutable frame data - can be shared across threads without copying
    pub data: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// Capture timestamp for latency tracking
    pub timestamp: Instant,
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Mjpeg,
}

/// Per-frame record from the capture side-channel. Only the latest one matters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CaptureMetadata {
    pub frame_id: u64,
    /// Session-monotonic milliseconds
    pub capture_ts: f64,
}

/// RGB8 working buffer at the fixed sampling resolution.
#[derive(Debug, Clone)]
pub struct SampledFrame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl SampledFrame {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0; width as usize * height as usize * 3],
        }
    }

    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        let i = (y as usize * self.width as usize + x as usize) * 3;
        [self.data[i], self.data[i + 1], self.data[i + 2]]
    }

    /// Nearest-neighbour scale of a packed 3-channel image into this buffer, in place.
    pub fn fill_scaled(&mut self, src: &[u8], src_w: u32, src_h: u32, swap_rb: bool) {
        let (dw, dh) = (self.width as usize, self.height as usize);
        let (sw, sh) = (src_w as usize, src_h as usize);
        if sw == 0 || sh == 0 || src.len() < sw * sh * 3 {
            self.data.fill(0);
            return;
        }

        for y in 0..dh {
            let sy = y * sh / dh;
            for x in 0..dw {
                let sx = x * sw / dw;
                let s = (sy * sw + sx) * 3;
                let d = (y * dw + x) * 3;
                if swap_rb {
                    self.data[d] = src[s + 2];
                    self.data[d + 1] = src[s + 1];
                    self.data[d + 2] = src[s];
                } else {
                    self.data[d..d + 3].copy_from_slice(&src[s..s + 3]);
                }
            }
        }
    }
}
