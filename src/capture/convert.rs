//! Sensor frame to RGB conversion

use std::collections::HashSet;
use std::time::Instant;

use thiserror::Error;
use tracing::{instrument, trace};

use super::frame::{PixelFormat, RawFrame, RgbFrame};
use super::yuv;
use crate::pipeline::pool::{BufferPool, PooledBuffer};

/// Size of the stand-in frame produced when conversion cannot proceed
pub const PLACEHOLDER_WIDTH: u32 = 100;
pub const PLACEHOLDER_HEIGHT: u32 = 100;
/// Fill color of the stand-in frame
pub const PLACEHOLDER_RGB: [u8; 3] = [0, 0, 0];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConvertError {
    #[error("unsupported pixel format {0:?}")]
    UnsupportedFormat(PixelFormat),

    #[error("{format:?} frame is missing plane {index}")]
    PlaneMissing { format: PixelFormat, index: usize },

    #[error("plane {index} holds {actual} bytes but {needed} are required")]
    PlaneTooShort {
        index: usize,
        needed: usize,
        actual: usize,
    },

    #[error("plane {index} has an unusable stride")]
    InvalidStride { index: usize },

    #[error("invalid frame dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },
}

impl ConvertError {
    /// True for the unsupported-layout case, false for malformed frames
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::UnsupportedFormat(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversionStatus {
    Converted,
    /// Output is the fixed-size placeholder. `first_of_kind` is set the first
    /// time this converter sees the condition, so callers can report it once.
    Placeholder {
        error: ConvertError,
        first_of_kind: bool,
    },
}

/// Result of [`PixelConverter::convert`]: always a frame, plus how it was made
#[derive(Debug)]
pub struct Conversion {
    pub frame: RgbFrame,
    pub status: ConversionStatus,
}

impl Conversion {
    pub fn is_placeholder(&self) -> bool {
        matches!(self.status, ConversionStatus::Placeholder { .. })
    }
}

/// Converts sensor frames to interleaved RGB.
///
/// Conversion is total: unsupported layouts and malformed planes produce a
/// [`PLACEHOLDER_WIDTH`] x [`PLACEHOLDER_HEIGHT`] frame instead of an error.
/// The raw frame is consumed, so its lease is returned to the producer on
/// every path.
pub struct PixelConverter {
    pool: BufferPool,
    scratch: Vec<u8>,
    unsupported_seen: HashSet<PixelFormat>,
    failure_seen: bool,
}

impl PixelConverter {
    pub fn new(pool: BufferPool) -> Self {
        Self {
            pool,
            scratch: Vec::new(),
            unsupported_seen: HashSet::new(),
            failure_seen: false,
        }
    }

    #[instrument(skip_all, fields(seq = raw.info().sequence, format = ?raw.format()))]
    pub fn convert(&mut self, raw: RawFrame) -> Conversion {
        let started = Instant::now();
        let info = raw.info();

        let conversion = match self.convert_planes(&raw) {
            Ok(pixels) => Conversion {
                frame: RgbFrame::from_buffer(raw.width(), raw.height(), pixels, info),
                status: ConversionStatus::Converted,
            },
            Err(error) => {
                let first_of_kind = self.first_occurrence(&error);
                let pixels = self.pool.filled(
                    PLACEHOLDER_WIDTH as usize * PLACEHOLDER_HEIGHT as usize * 3,
                    PLACEHOLDER_RGB,
                );
                Conversion {
                    frame: RgbFrame::from_buffer(
                        PLACEHOLDER_WIDTH,
                        PLACEHOLDER_HEIGHT,
                        pixels,
                        info,
                    ),
                    status: ConversionStatus::Placeholder {
                        error,
                        first_of_kind,
                    },
                }
            }
        };

        // Sensor buffer goes back to the producer here, before any later stage
        drop(raw);

        let elapsed = started.elapsed();
        metrics::histogram!("conversion_time_us").record(elapsed.as_micros() as f64);
        trace!(?elapsed, "frame converted");
        conversion
    }

    fn convert_planes(&mut self, raw: &RawFrame) -> Result<PooledBuffer, ConvertError> {
        let (width, height) = (raw.width(), raw.height());
        let rgb_len = (width as usize)
            .checked_mul(height as usize)
            .and_then(|n| n.checked_mul(3))
            .filter(|&n| n > 0)
            .ok_or(ConvertError::InvalidDimensions { width, height })?;
        let (w, h) = (width as usize, height as usize);

        let planes = raw.planes();
        let plane = |index: usize| {
            planes.get(index).ok_or(ConvertError::PlaneMissing {
                format: raw.format(),
                index,
            })
        };

        match raw.format() {
            PixelFormat::Yuv420_888 => {
                yuv::repack_yuv420(w, h, plane(0)?, plane(1)?, plane(2)?, &mut self.scratch)?
            }
            PixelFormat::Nv21 => yuv::repack_nv21(w, h, plane(0)?, plane(1)?, &mut self.scratch)?,
            other => return Err(ConvertError::UnsupportedFormat(other)),
        }

        let mut rgb = self.pool.acquire(rgb_len);
        yuv::nv21_to_rgb(w, h, &self.scratch, &mut rgb);
        Ok(rgb)
    }

    fn first_occurrence(&mut self, error: &ConvertError) -> bool {
        match error {
            ConvertError::UnsupportedFormat(format) => self.unsupported_seen.insert(*format),
            _ => !std::mem::replace(&mut self.failure_seen, true),
        }
    }
}
