//! Console stand-in for an on-screen detection overlay

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::detect::BoundingBox;
use crate::pipeline::{DetectionListener, Notice};

/// Keeps the boxes currently on screen and the last inference-time readout,
/// logging whenever either changes.
#[derive(Debug, Default)]
pub struct ConsoleOverlay {
    boxes: Vec<BoundingBox>,
    inference_readout: String,
    last_timestamp: Option<Duration>,
    notices: usize,
}

impl ConsoleOverlay {
    pub fn boxes(&self) -> &[BoundingBox] {
        &self.boxes
    }

    /// e.g. `"12ms"`; empty until the first detection
    pub fn inference_readout(&self) -> &str {
        &self.inference_readout
    }

    pub fn last_timestamp(&self) -> Option<Duration> {
        self.last_timestamp
    }

    pub fn notices(&self) -> usize {
        self.notices
    }
}

impl DetectionListener for ConsoleOverlay {
    fn on_detect(&mut self, timestamp: Duration, boxes: &[BoundingBox], inference_time: Duration) {
        self.inference_readout = format!("{}ms", inference_time.as_millis());
        self.last_timestamp = Some(timestamp);

        if boxes.len() != self.boxes.len() {
            info!(
                count = boxes.len(),
                inference = %self.inference_readout,
                "detections changed"
            );
        }
        for b in boxes {
            debug!(
                class = %b.class_name,
                confidence = b.confidence,
                x1 = b.x1,
                y1 = b.y1,
                x2 = b.x2,
                y2 = b.y2,
                "box"
            );
        }
        self.boxes = boxes.to_vec();
    }

    fn on_empty_detect(&mut self, timestamp: Duration) {
        self.last_timestamp = Some(timestamp);
        if !self.boxes.is_empty() {
            info!("detections cleared");
            self.boxes.clear();
        }
    }

    fn on_notice(&mut self, notice: &Notice) {
        self.notices += 1;
        warn!(?notice, "pipeline notice");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readout_and_clear() {
        let mut overlay = ConsoleOverlay::default();
        assert_eq!(overlay.inference_readout(), "");

        let b = BoundingBox::from_corners(0.1, 0.2, 0.3, 0.4, 0.9, 0, "bright_region");
        overlay.on_detect(Duration::from_millis(33), &[b.clone(), b], Duration::from_micros(12_400));
        assert_eq!(overlay.boxes().len(), 2);
        assert_eq!(overlay.inference_readout(), "12ms");

        overlay.on_empty_detect(Duration::from_millis(66));
        assert!(overlay.boxes().is_empty());
        assert_eq!(overlay.inference_readout(), "12ms");
        assert_eq!(overlay.last_timestamp(), Some(Duration::from_millis(66)));
    }
}
