//! Square letterbox preprocessing and its inverse

use crate::{ArgusError, Result};

/// Placement of a source image inside the square model input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub model_size: u32,
    pub src_w: u32,
    pub src_h: u32,
    pub scale: f32,
    pub draw_w: u32,
    pub draw_h: u32,
    pub dx: u32,
    pub dy: u32,
}

impl Letterbox {
    pub fn new(model_size: u32, src_w: u32, src_h: u32) -> Self {
        let (s, w, h) = (model_size as f32, src_w.max(1) as f32, src_h.max(1) as f32);
        let scale = (s / w).min(s / h);
        let draw_w = ((w * scale).round() as u32).clamp(1, model_size.max(1));
        let draw_h = ((h * scale).round() as u32).clamp(1, model_size.max(1));
        Self {
            model_size,
            src_w: src_w.max(1),
            src_h: src_h.max(1),
            scale,
            draw_w,
            draw_h,
            dx: (model_size.saturating_sub(draw_w)) / 2,
            dy: (model_size.saturating_sub(draw_h)) / 2,
        }
    }

    /// Model-input pixel coordinates to source pixel coordinates.
    pub fn to_source(&self, mx: f32, my: f32) -> (f32, f32) {
        (
            (mx - self.dx as f32) / self.scale,
            (my - self.dy as f32) / self.scale,
        )
    }

    /// Model-input pixel coordinates to coordinates relative to the source (unclamped).
    pub fn to_relative(&self, mx: f32, my: f32) -> (f32, f32) {
        let (x, y) = self.to_source(mx, my);
        (x / self.src_w as f32, y / self.src_h as f32)
    }

    /// Write the `[1, 3, S, S]` NCHW tensor for packed RGB `src` into `out`,
    /// scaled to [0, 1] with black padding. `out` is reused between calls.
    pub fn fill_tensor(&self, src: &[u8], out: &mut Vec<f32>) -> Result<()> {
        if self.model_size == 0 {
            return Err(ArgusError::Inference("model input size is zero".into()));
        }
        let (sw, sh) = (self.src_w as usize, self.src_h as usize);
        if src.len() < sw * sh * 3 {
            return Err(ArgusError::FrameDecode(format!(
                "{}x{} RGB frame needs {} bytes, got {}",
                sw,
                sh,
                sw * sh * 3,
                src.len()
            )));
        }

        let s = self.model_size as usize;
        let plane = s * s;
        out.clear();
        out.resize(3 * plane, 0.0);
        let (dw, dh) = (self.draw_w as usize, self.draw_h as usize);
        let (ox, oy) = (self.dx as usize, self.dy as usize);

        for y in 0..dh {
            let sy = (y * sh / dh).min(sh - 1);
            for x in 0..dw {
                let sx = (x * sw / dw).min(sw - 1);
                let p = (sy * sw + sx) * 3;
                let d = (oy + y) * s + ox + x;
                out[d] = src[p] as f32 / 255.0;
                out[plane + d] = src[p + 1] as f32 / 255.0;
                out[2 * plane + d] = src[p + 2] as f32 / 255.0;
            }
        }
        Ok(())
    }
}
