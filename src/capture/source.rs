//! Latest-wins slots shared between capture producers and the pipeline

use std::sync::Arc;

use arc_swap::ArcSwapOption;

use super::decoder;
use super::frame::{CaptureMetadata, Frame, SampledFrame};
use crate::Result;

/// Live decoded video the scheduler samples from.
pub trait VideoSource: Send + Sync {
    /// Copy the current frame into `dst` at `dst`'s resolution.
    /// Returns `false` when no frame is available yet.
    fn sample_into(&self, dst: &mut SampledFrame) -> Result<bool>;
}

/// Holds only the most recent captured frame.
#[derive(Default)]
pub struct FrameSlot {
    latest: ArcSwapOption<Frame>,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, frame: Frame) {
        self.latest.store(Some(Arc::new(frame)));
    }

    pub fn clear(&self) {
        self.latest.store(None);
    }
}

impl VideoSource for FrameSlot {
    fn sample_into(&self, dst: &mut SampledFrame) -> Result<bool> {
        let Some(frame) = self.latest.load_full() else {
            return Ok(false);
        };
        let pixels = decoder::decode_frame(&frame)?;
        dst.fill_scaled(&pixels.data, pixels.width, pixels.height, pixels.bgr);
        Ok(true)
    }
}

/// Capture metadata side-channel: last write wins, no history.
#[derive(Default)]
pub struct MetadataSlot {
    latest: ArcSwapOption<CaptureMetadata>,
}

impl MetadataSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, meta: CaptureMetadata) {
        self.latest.store(Some(Arc::new(meta)));
    }

    pub fn latest(&self) -> Option<CaptureMetadata> {
        self.latest.load().as_deref().copied()
    }
}
