//! V4L2 webcam producer feeding the frame and metadata slots

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tracing::{info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::frame::{CaptureMetadata, Frame, FrameMetadata, PixelFormat};
use super::source::{FrameSlot, MetadataSlot};
use crate::utils::SessionClock;
use crate::{ArgusError, CaptureConfig, Result};

/// Blocking capture loop; run it on a dedicated thread.
/// Returns when `stop` is set or the device fails.
#[instrument(skip_all, fields(device = %config.device))]
pub fn run_capture(
    config: CaptureConfig,
    frames: Arc<FrameSlot>,
    metadata: Arc<MetadataSlot>,
    clock: SessionClock,
    stop: Arc<AtomicBool>,
) -> Result<()> {
    let device = Device::with_path(&config.device)?;

    let caps = device.query_caps()?;
    info!("Device: {} ({})", caps.card, caps.driver);

    if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
        return Err(ArgusError::Source(
            "device doesn't support video capture".into(),
        ));
    }

    let mut fmt = device.format()?;
    fmt.width = config.width;
    fmt.height = config.height;
    fmt.fourcc = match config.format {
        PixelFormat::Mjpeg => FourCC::new(b"MJPG"),
        PixelFormat::Rgb24 => FourCC::new(b"RGB3"),
        PixelFormat::Bgr24 => FourCC::new(b"BGR3"),
    };
    let fmt = device.set_format(&fmt)?;
    if fmt.width != config.width || fmt.height != config.height {
        warn!(
            "Driver negotiated {}x{} instead of {}x{}",
            fmt.width, fmt.height, config.width, config.height
        );
    }

    let mut stream = MmapStream::with_buffers(&device, Type::VideoCapture, config.buffer_count)?;
    info!("Capture stream started with {} buffers", config.buffer_count);

    let mut sequence = 0u64;
    while !stop.load(Ordering::Relaxed) {
        let (buf, _) = stream.next()?;
        sequence += 1;

        frames.publish(Frame {
            data: Bytes::copy_from_slice(buf),
            meta: Arc::new(FrameMetadata {
                sequence,
                width: fmt.width,
                height: fmt.height,
                format: config.format,
            }),
            timestamp: Instant::now(),
        });
        metadata.publish(CaptureMetadata {
            frame_id: sequence,
            capture_ts: clock.now_ms(),
        });
    }

    info!("Capture stream stopped after {} frames", sequence);
    Ok(())
}
