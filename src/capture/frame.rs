use std::fmt;
use std::ops::Deref;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::pipeline::pool::PooledBuffer;

/// Sensor pixel layouts the converter knows about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    /// Planar or semi-planar 4:2:0 with independent Y, U and V planes
    #[serde(rename = "yuv420_888")]
    Yuv420_888,
    /// Y plane followed by one interleaved V/U plane
    Nv21,
    /// Any other sensor tag (raw FourCC or platform constant)
    Other(u32),
}

/// Clockwise rotation needed to bring a sensor image upright
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    /// Normalizes any multiple of 90 degrees, negative values included.
    pub fn from_degrees(degrees: i32) -> Option<Self> {
        match degrees.rem_euclid(360) {
            0 => Some(Self::Deg0),
            90 => Some(Self::Deg90),
            180 => Some(Self::Deg180),
            270 => Some(Self::Deg270),
            _ => None,
        }
    }

    pub fn degrees(self) -> u32 {
        match self {
            Self::Deg0 => 0,
            Self::Deg90 => 90,
            Self::Deg180 => 180,
            Self::Deg270 => 270,
        }
    }

    /// Rotation that undoes this one
    pub fn inverse(self) -> Self {
        match self {
            Self::Deg0 => Self::Deg0,
            Self::Deg90 => Self::Deg270,
            Self::Deg180 => Self::Deg180,
            Self::Deg270 => Self::Deg90,
        }
    }

    #[inline]
    pub fn swaps_dimensions(self) -> bool {
        matches!(self, Self::Deg90 | Self::Deg270)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidRotation(pub i32);

impl fmt::Display for InvalidRotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rotation must be a multiple of 90 degrees, got {}", self.0)
    }
}

impl std::error::Error for InvalidRotation {}

impl TryFrom<i32> for Rotation {
    type Error = InvalidRotation;

    fn try_from(degrees: i32) -> Result<Self, Self::Error> {
        Self::from_degrees(degrees).ok_or(InvalidRotation(degrees))
    }
}

impl From<Rotation> for i32 {
    fn from(rotation: Rotation) -> Self {
        rotation.degrees() as i32
    }
}

/// Per-frame metadata carried from the sensor through every stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub sequence: u64,
    /// Monotonic capture time since the sensor started
    pub timestamp: Duration,
    pub rotation: Rotation,
}

/// One sensor plane: bytes plus the strides needed to address samples in it
#[derive(Debug, Clone)]
pub struct Plane {
    pub data: Bytes,
    pub row_stride: usize,
    pub pixel_stride: usize,
}

impl Plane {
    pub fn new(data: impl Into<Bytes>, row_stride: usize, pixel_stride: usize) -> Self {
        Self {
            data: data.into(),
            row_stride,
            pixel_stride,
        }
    }

    /// Plane whose samples are adjacent within a row
    pub fn packed(data: impl Into<Bytes>, row_stride: usize) -> Self {
        Self::new(data, row_stride, 1)
    }
}

/// Hands a frame's backing resource back to the producer.
///
/// The release callback runs exactly once, when the lease is dropped. Every
/// owner of a [`RawFrame`] therefore returns the resource on every exit path
/// without having to call anything.
pub struct FrameLease {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl FrameLease {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// Lease with nothing to give back (copied or synthetic data)
    pub fn detached() -> Self {
        Self { release: None }
    }

    /// Release now instead of at end of scope
    pub fn release(self) {
        drop(self)
    }
}

impl Drop for FrameLease {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for FrameLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameLease")
            .field("held", &self.release.is_some())
            .finish()
    }
}

/// Unconverted sensor output. Immutable once built.
#[derive(Debug)]
pub struct RawFrame {
    width: u32,
    height: u32,
    format: PixelFormat,
    planes: Vec<Plane>,
    info: FrameInfo,
    lease: FrameLease,
}

impl RawFrame {
    pub fn new(
        width: u32,
        height: u32,
        format: PixelFormat,
        planes: Vec<Plane>,
        info: FrameInfo,
    ) -> Self {
        Self {
            width,
            height,
            format,
            planes,
            info,
            lease: FrameLease::detached(),
        }
    }

    /// Attach the producer's release hook
    pub fn with_lease(mut self, lease: FrameLease) -> Self {
        self.lease = lease;
        self
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[inline]
    pub fn format(&self) -> PixelFormat {
        self.format
    }

    #[inline]
    pub fn planes(&self) -> &[Plane] {
        &self.planes
    }

    #[inline]
    pub fn info(&self) -> FrameInfo {
        self.info
    }
}

/// Interleaved 8-bit RGB image, `width * height * 3` bytes
#[derive(Debug)]
pub struct RgbFrame {
    width: u32,
    height: u32,
    data: PooledBuffer,
    info: FrameInfo,
}

impl RgbFrame {
    pub(crate) fn from_buffer(width: u32, height: u32, data: PooledBuffer, info: FrameInfo) -> Self {
        debug_assert_eq!(data.len(), width as usize * height as usize * 3);
        Self {
            width,
            height,
            data,
            info,
        }
    }

    /// Wrap an owned RGB vector; `None` when the length does not match.
    pub fn from_vec(width: u32, height: u32, data: Vec<u8>, info: FrameInfo) -> Option<Self> {
        if data.len() != width as usize * height as usize * 3 {
            return None;
        }
        Some(Self::from_buffer(
            width,
            height,
            PooledBuffer::detached(data),
            info,
        ))
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[inline]
    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn info(&self) -> FrameInfo {
        self.info
    }

    /// RGB triple at `(x, y)`; panics when out of bounds.
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        let offset = (y as usize * self.width as usize + x as usize) * 3;
        [
            self.data[offset],
            self.data[offset + 1],
            self.data[offset + 2],
        ]
    }

    pub(crate) fn into_parts(self) -> (u32, u32, PooledBuffer, FrameInfo) {
        (self.width, self.height, self.data, self.info)
    }
}

/// RGB frame in display orientation, ready for detection
#[derive(Debug)]
pub struct CorrectedFrame(RgbFrame);

impl CorrectedFrame {
    pub(crate) fn new(frame: RgbFrame) -> Self {
        Self(frame)
    }

    /// Treat an already upright frame as corrected
    pub fn upright(frame: RgbFrame) -> Self {
        Self(frame)
    }

    pub fn into_inner(self) -> RgbFrame {
        self.0
    }
}

impl Deref for CorrectedFrame {
    type Target = RgbFrame;

    fn deref(&self) -> &RgbFrame {
        &self.0
    }
}
