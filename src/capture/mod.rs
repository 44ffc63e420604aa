pub mod decoder;
pub mod frame;
pub mod source;
pub mod synthetic;
#[cfg(feature = "v4l2")]
pub mod v4l2;

pub use frame::{CaptureMetadata, Frame, FrameMetadata, PixelFormat, SampledFrame};
pub use source::{FrameSlot, MetadataSlot, VideoSource};
