//! Boundary to the object detection engine
//!
//! The pipeline never loads models itself. It asks a [`DetectorFactory`] for a
//! [`Detector`] on the dispatch thread and calls it one frame at a time.

pub mod luma;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capture::CorrectedFrame;

pub use luma::{LumaDetector, LumaDetectorFactory};

/// One detected object in normalized `[0, 1]` image coordinates
#[derive(Debug, Clone, PartialEq)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub cx: f32,
    pub cy: f32,
    pub w: f32,
    pub h: f32,
    pub confidence: f32,
    pub class_id: u32,
    pub class_name: String,
}

impl BoundingBox {
    pub fn from_corners(
        x1: f32,
        y1: f32,
        x2: f32,
        y2: f32,
        confidence: f32,
        class_id: u32,
        class_name: impl Into<String>,
    ) -> Self {
        Self {
            x1,
            y1,
            x2,
            y2,
            cx: (x1 + x2) / 2.0,
            cy: (y1 + y2) / 2.0,
            w: x2 - x1,
            h: y2 - y1,
            confidence,
            class_id,
            class_name: class_name.into(),
        }
    }
}

/// Settings a detector is (re)built with
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectorOptions {
    /// Use the accelerated execution path when the engine has one
    pub accelerated: bool,
    /// Boxes scoring below this are discarded
    pub confidence_threshold: f32,
}

impl Default for DetectorOptions {
    fn default() -> Self {
        Self {
            accelerated: false,
            confidence_threshold: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DetectorError {
    #[error("detector is not ready")]
    Unavailable,

    #[error("detector failed to initialize: {0}")]
    Init(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("detector panicked: {0}")]
    Panicked(String),
}

/// A loaded detection engine
pub trait Detector: Send {
    /// Run one inference. An empty vector means the engine ran and found
    /// nothing.
    fn detect(&mut self, frame: &CorrectedFrame) -> Result<Vec<BoundingBox>, DetectorError>;

    /// False while the engine is still warming up
    fn is_ready(&self) -> bool {
        true
    }
}

/// Builds detectors; called on the dispatch thread at start and on restart
pub trait DetectorFactory: Send + Sync {
    fn create(&self, options: &DetectorOptions) -> Result<Box<dyn Detector>, DetectorError>;
}

impl<F> DetectorFactory for F
where
    F: Fn(&DetectorOptions) -> Result<Box<dyn Detector>, DetectorError> + Send + Sync,
{
    fn create(&self, options: &DetectorOptions) -> Result<Box<dyn Detector>, DetectorError> {
        self(options)
    }
}
