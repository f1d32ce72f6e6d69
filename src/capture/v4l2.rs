//! V4L2 sensor feeding 4:2:0 frames into the pipeline

use std::time::Duration;

use bytes::Bytes;
use color_eyre::{eyre::eyre, Result};
use tracing::{info, instrument, trace};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::frame::{FrameInfo, PixelFormat, Plane, RawFrame, Rotation};
use super::yuv::chroma_dims;
use crate::CaptureConfig;

fn pixel_format(fourcc: FourCC) -> PixelFormat {
    match &fourcc.repr {
        b"YU12" => PixelFormat::Yuv420_888,
        b"NV21" => PixelFormat::Nv21,
        repr => PixelFormat::Other(u32::from_le_bytes(*repr)),
    }
}

fn fourcc(format: PixelFormat) -> FourCC {
    match format {
        PixelFormat::Yuv420_888 => FourCC::new(b"YU12"),
        PixelFormat::Nv21 => FourCC::new(b"NV21"),
        PixelFormat::Other(tag) => FourCC::new(&tag.to_le_bytes()),
    }
}

/// Memory-mapped V4L2 capture.
///
/// Driver buffers are copied out on dequeue and re-queued by the next call,
/// so frames carry detached leases.
pub struct V4l2Sensor {
    _device: Box<Device>,
    stream: MmapStream<'static>,
    width: u32,
    height: u32,
    stride: usize,
    format: PixelFormat,
    rotation: Rotation,
    sequence: u64,
    epoch: Option<Duration>,
}

impl V4l2Sensor {
    pub fn open(path: &str, config: &CaptureConfig) -> Result<Self> {
        info!(path, "initializing V4L2 capture");

        let device = Device::with_path(path)?;
        let caps = device.query_caps()?;
        info!("device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(eyre!("device doesn't support video capture"));
        }

        let mut fmt = device.format()?;
        fmt.width = config.width;
        fmt.height = config.height;
        fmt.fourcc = fourcc(config.format);
        let fmt = device.set_format(&fmt)?;

        // Drivers may pick another size or format; report what we actually got
        let format = pixel_format(fmt.fourcc);
        info!(
            width = fmt.width,
            height = fmt.height,
            stride = fmt.stride,
            ?format,
            "negotiated capture format"
        );

        let stream = MmapStream::with_buffers(&device, Type::VideoCapture, config.buffer_count)?;
        info!("capture stream started with {} buffers", config.buffer_count);

        Ok(Self {
            _device: Box::new(device),
            stream,
            width: fmt.width,
            height: fmt.height,
            stride: (fmt.stride as usize).max(fmt.width as usize),
            format,
            rotation: config.rotation,
            sequence: 0,
            epoch: None,
        })
    }

    /// Block until the driver hands over the next frame
    #[instrument(skip(self))]
    pub fn next_frame(&mut self) -> Result<RawFrame> {
        let (buf, meta) = self.stream.next()?;
        let data = Bytes::copy_from_slice(buf);

        let device_time = Duration::from_secs(meta.timestamp.sec as u64)
            + Duration::from_micros(meta.timestamp.usec as u64);
        let epoch = *self.epoch.get_or_insert(device_time);

        let info = FrameInfo {
            sequence: self.sequence,
            timestamp: device_time.saturating_sub(epoch),
            rotation: self.rotation,
        };
        self.sequence += 1;
        trace!(seq = info.sequence, bytes = data.len(), "frame dequeued");

        Ok(RawFrame::new(
            self.width,
            self.height,
            self.format,
            self.split_planes(data),
            info,
        ))
    }

    /// Slice one contiguous driver buffer into its planes without copying
    fn split_planes(&self, data: Bytes) -> Vec<Plane> {
        let (w, h) = (self.width as usize, self.height as usize);
        let (_, ch) = chroma_dims(w, h);
        let stride = self.stride;
        let luma_len = (stride * h).min(data.len());

        match self.format {
            PixelFormat::Yuv420_888 => {
                let chroma_stride = (stride + 1) / 2;
                let u_end = (luma_len + chroma_stride * ch).min(data.len());
                vec![
                    Plane::packed(data.slice(..luma_len), stride),
                    Plane::packed(data.slice(luma_len..u_end), chroma_stride),
                    Plane::packed(data.slice(u_end..), chroma_stride),
                ]
            }
            PixelFormat::Nv21 => vec![
                Plane::packed(data.slice(..luma_len), stride),
                Plane::new(data.slice(luma_len..), stride, 2),
            ],
            PixelFormat::Other(_) => vec![Plane::packed(data, stride)],
        }
    }
}
