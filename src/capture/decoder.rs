use zune_jpeg::JpegDecoder;

use super::frame::{Frame, PixelFormat};
use crate::{ArgusError, Result};

/// Packed RGB (or BGR) pixels of a decoded frame.
pub struct DecodedPixels<'a> {
    pub data: std::borrow::Cow<'a, [u8]>,
    pub width: u32,
    pub height: u32,
    pub bgr: bool,
}

pub fn decode_frame(frame: &Frame) -> Result<DecodedPixels<'_>> {
    let meta = &frame.meta;
    match meta.format {
        PixelFormat::Mjpeg => {
            let mut decoder = JpegDecoder::new(&frame.data[..]);
            let pixels = decoder
                .decode()
                .map_err(|e| ArgusError::FrameDecode(format!("{:?}", e)))?;
            let (width, height) = decoder
                .dimensions()
                .map(|(w, h)| (w as u32, h as u32))
                .unwrap_or((meta.width, meta.height));
            Ok(DecodedPixels {
                data: pixels.into(),
                width,
                height,
                bgr: false,
            })
        }
        PixelFormat::Rgb24 | PixelFormat::Bgr24 => Ok(DecodedPixels {
            data: frame.data[..].into(),
            width: meta.width,
            height: meta.height,
            bgr: meta.format == PixelFormat::Bgr24,
        }),
    }
}
