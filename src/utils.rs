use tokio::time::Instant;

/// Monotonic millisecond clock shared by every loop of one session.
///
/// Built on `tokio::time::Instant` so paused-time tests drive it.
#[derive(Debug, Clone, Copy)]
pub struct SessionClock {
    epoch: Instant,
}

impl SessionClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64() * 1000.0
    }
}

impl Default for SessionClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Exponential moving average: `new = alpha * sample + (1 - alpha) * old`.
/// The first sample seeds the average.
#[derive(Debug, Clone, Copy)]
pub struct Ema {
    alpha: f64,
    value: Option<f64>,
}

impl Ema {
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha: alpha.clamp(0.0, 1.0),
            value: None,
        }
    }

    pub fn update(&mut self, sample: f64) -> f64 {
        let next = match self.value {
            Some(old) => self.alpha * sample + (1.0 - self.alpha) * old,
            None => sample,
        };
        self.value = Some(next);
        next
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }

    pub fn reset(&mut self) {
        self.value = None;
    }
}

/// Auto-detect the first V4L2 capture device
#[cfg(feature = "v4l2")]
pub fn auto_detect_device() -> crate::Result<(String, crate::PixelFormat)> {
    use std::path::Path;
    use tracing::info;
    use v4l::{capability::Flags, video::Capture, Device, FourCC};

    info!("Auto-detecting capture devices...");

    for i in 0..10 {
        let path = format!("/dev/video{}", i);
        if !Path::new(&path).exists() {
            continue;
        }

        let Ok(dev) = Device::with_path(&path) else {
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            continue;
        }
        if let Ok(formats) = dev.enum_formats() {
            for fmt in formats {
                if fmt.fourcc == FourCC::new(b"MJPG") {
                    info!("Found MJPEG device: {} - {}", path, caps.card);
                    return Ok((path, crate::PixelFormat::Mjpeg));
                } else if fmt.fourcc == FourCC::new(b"RGB3") {
                    info!("Found RGB24 device: {} - {}", path, caps.card);
                    return Ok((path, crate::PixelFormat::Rgb24));
                }
            }
        }
    }

    Err(crate::ArgusError::Source(
        "no suitable capture device found".into(),
    ))
}
