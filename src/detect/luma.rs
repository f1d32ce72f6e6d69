//! Bright-region detector used by the demo binary and the pipeline tests.
//!
//! Finds the bounding box of pixels whose luma exceeds a threshold. The
//! accelerated path samples every other row and column.

use super::{BoundingBox, Detector, DetectorError, DetectorFactory, DetectorOptions};
use crate::capture::CorrectedFrame;

pub const CLASS_NAME: &str = "bright_region";

/// Fraction of sampled pixels that must be bright before anything is reported
const MIN_COVERAGE: f32 = 0.001;

#[derive(Debug, Clone)]
pub struct LumaDetector {
    threshold: u8,
    step: usize,
    confidence_threshold: f32,
}

impl LumaDetector {
    pub fn new(threshold: u8, options: &DetectorOptions) -> Self {
        Self {
            threshold,
            step: if options.accelerated { 2 } else { 1 },
            confidence_threshold: options.confidence_threshold,
        }
    }
}

#[inline]
fn luma(px: &[u8]) -> u32 {
    (77 * px[0] as u32 + 150 * px[1] as u32 + 29 * px[2] as u32) >> 8
}

impl Detector for LumaDetector {
    fn detect(&mut self, frame: &CorrectedFrame) -> Result<Vec<BoundingBox>, DetectorError> {
        let (width, height) = (frame.width() as usize, frame.height() as usize);
        if width == 0 || height == 0 {
            return Err(DetectorError::Inference("empty frame".into()));
        }
        let pixels = frame.pixels();

        let (mut min_x, mut min_y, mut max_x, mut max_y) = (usize::MAX, usize::MAX, 0, 0);
        let (mut bright, mut sampled, mut luma_sum) = (0usize, 0usize, 0u64);

        for y in (0..height).step_by(self.step) {
            let row = &pixels[y * width * 3..(y + 1) * width * 3];
            for x in (0..width).step_by(self.step) {
                sampled += 1;
                let l = luma(&row[x * 3..x * 3 + 3]);
                if l >= self.threshold as u32 {
                    bright += 1;
                    luma_sum += l as u64;
                    min_x = min_x.min(x);
                    min_y = min_y.min(y);
                    max_x = max_x.max(x);
                    max_y = max_y.max(y);
                }
            }
        }

        if bright == 0 || (bright as f32) < sampled as f32 * MIN_COVERAGE {
            return Ok(Vec::new());
        }

        let confidence = luma_sum as f32 / bright as f32 / 255.0;
        if confidence < self.confidence_threshold {
            return Ok(Vec::new());
        }

        let (w, h) = (width as f32, height as f32);
        Ok(vec![BoundingBox::from_corners(
            min_x as f32 / w,
            min_y as f32 / h,
            (max_x + self.step).min(width) as f32 / w,
            (max_y + self.step).min(height) as f32 / h,
            confidence,
            0,
            CLASS_NAME,
        )])
    }
}

/// Factory handing out [`LumaDetector`]s
#[derive(Debug, Clone, Copy)]
pub struct LumaDetectorFactory {
    threshold: u8,
}

impl LumaDetectorFactory {
    pub fn new(threshold: u8) -> Self {
        Self { threshold }
    }
}

impl DetectorFactory for LumaDetectorFactory {
    fn create(&self, options: &DetectorOptions) -> Result<Box<dyn Detector>, DetectorError> {
        Ok(Box::new(LumaDetector::new(self.threshold, options)))
    }
}
