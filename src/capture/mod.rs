pub mod convert;
pub mod frame;
pub mod orientation;
pub mod synthetic;
#[cfg(feature = "v4l2")]
pub mod v4l2;
pub mod yuv;

pub use convert::{
    Conversion, ConversionStatus, ConvertError, PixelConverter, PLACEHOLDER_HEIGHT,
    PLACEHOLDER_RGB, PLACEHOLDER_WIDTH,
};
pub use frame::{
    CorrectedFrame, FrameInfo, FrameLease, InvalidRotation, PixelFormat, Plane, RawFrame,
    RgbFrame, Rotation,
};
pub use orientation::OrientationCorrector;
pub use synthetic::SyntheticSensor;
#[cfg(feature = "v4l2")]
pub use v4l2::V4l2Sensor;
