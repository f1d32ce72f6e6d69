//! Rotation of RGB frames into display orientation

use tracing::trace;

use super::frame::{CorrectedFrame, RgbFrame, Rotation};
use crate::pipeline::pool::BufferPool;

/// Applies clockwise quarter-turn rotations.
///
/// The input frame is consumed. `Deg0` hands the same buffer through; every
/// other rotation writes into a fresh pooled buffer and the input buffer goes
/// back to the pool.
#[derive(Debug, Clone)]
pub struct OrientationCorrector {
    pool: BufferPool,
}

impl OrientationCorrector {
    pub fn new(pool: BufferPool) -> Self {
        Self { pool }
    }

    pub fn correct(&self, frame: RgbFrame, rotation: Rotation) -> CorrectedFrame {
        if rotation == Rotation::Deg0 {
            return CorrectedFrame::new(frame);
        }

        let (width, height, src, info) = frame.into_parts();
        let (out_w, out_h) = if rotation.swaps_dimensions() {
            (height, width)
        } else {
            (width, height)
        };

        let mut dst = self.pool.acquire(src.len());
        rotate_rgb(&src, width as usize, height as usize, rotation, &mut dst);
        drop(src);

        trace!(degrees = rotation.degrees(), out_w, out_h, "frame rotated");
        CorrectedFrame::new(RgbFrame::from_buffer(out_w, out_h, dst, info))
    }
}

/// Rotate a `width x height` RGB image clockwise into `dst`.
///
/// `dst` must be the same length as `src`; for 90 and 270 degrees its row
/// width is `height`.
pub fn rotate_rgb(src: &[u8], width: usize, height: usize, rotation: Rotation, dst: &mut [u8]) {
    debug_assert_eq!(src.len(), width * height * 3);
    debug_assert_eq!(src.len(), dst.len());

    for y in 0..height {
        for x in 0..width {
            let (dx, dy, dst_w) = match rotation {
                Rotation::Deg0 => (x, y, width),
                Rotation::Deg90 => (height - 1 - y, x, height),
                Rotation::Deg180 => (width - 1 - x, height - 1 - y, width),
                Rotation::Deg270 => (y, width - 1 - x, height),
            };
            let s = (y * width + x) * 3;
            let d = (dy * dst_w + dx) * 3;
            dst[d..d + 3].copy_from_slice(&src[s..s + 3]);
        }
    }
}
