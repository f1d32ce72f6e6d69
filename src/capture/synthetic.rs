//! Test-pattern sensor: a bright square sweeping across a dark gradient.
//!
//! Behaves like a camera with a fixed number of buffer slots. A slot is held
//! by every frame handed out and comes back when the frame's lease is
//! released; with every slot taken, no new frame is produced.

use std::time::Duration;

use flume::{Receiver, Sender};
use tracing::{debug, info};

use super::frame::{FrameInfo, FrameLease, PixelFormat, Plane, RawFrame, Rotation};
use super::yuv::chroma_dims;
use crate::CaptureConfig;

const BACKGROUND_LUMA: u8 = 16;
const GRADIENT_SPAN: usize = 64;
const SQUARE_LUMA: u8 = 235;
const SQUARE_STEP: usize = 4;

pub struct SyntheticSensor {
    width: u32,
    height: u32,
    format: PixelFormat,
    rotation: Rotation,
    fps: u32,
    sequence: u64,
    slots: usize,
    free: Receiver<()>,
    returned: Sender<()>,
}

impl SyntheticSensor {
    pub fn new(config: &CaptureConfig) -> Self {
        let slots = config.buffer_count.max(1) as usize;
        let (returned, free) = flume::bounded(slots);
        for _ in 0..slots {
            let _ = returned.send(());
        }
        info!(
            width = config.width,
            height = config.height,
            format = ?config.format,
            slots,
            "synthetic sensor ready"
        );

        Self {
            width: config.width,
            height: config.height,
            format: config.format,
            rotation: config.rotation,
            fps: config.fps.max(1),
            sequence: 0,
            slots,
            free,
            returned,
        }
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_micros(1_000_000 / self.fps as u64)
    }

    /// Frames handed out and not yet released
    pub fn outstanding(&self) -> usize {
        self.slots - self.free.len()
    }

    /// Produce the next frame, or `None` while every buffer slot is in use.
    pub fn next_frame(&mut self) -> Option<RawFrame> {
        if self.free.try_recv().is_err() {
            debug!(slots = self.slots, "all buffer slots in use");
            return None;
        }

        let sequence = self.sequence;
        self.sequence += 1;
        let info = FrameInfo {
            sequence,
            timestamp: Duration::from_micros(sequence * 1_000_000 / self.fps as u64),
            rotation: self.rotation,
        };

        let returned = self.returned.clone();
        let lease = FrameLease::new(move || {
            let _ = returned.send(());
        });

        let frame = RawFrame::new(self.width, self.height, self.format, self.planes(sequence), info);
        Some(frame.with_lease(lease))
    }

    fn planes(&self, sequence: u64) -> Vec<Plane> {
        let (w, h) = (self.width as usize, self.height as usize);
        let luma = self.luma(sequence);
        let (cw, ch) = chroma_dims(w, h);

        match self.format {
            PixelFormat::Yuv420_888 => vec![
                Plane::packed(luma, w),
                Plane::packed(vec![128; cw * ch], cw),
                Plane::packed(vec![128; cw * ch], cw),
            ],
            PixelFormat::Nv21 => vec![
                Plane::packed(luma, w),
                Plane::new(vec![128; cw * ch * 2], cw * 2, 2),
            ],
            PixelFormat::Other(_) => vec![Plane::packed(luma, w)],
        }
    }

    fn luma(&self, sequence: u64) -> Vec<u8> {
        let (w, h) = (self.width as usize, self.height as usize);
        let side = (w.min(h) / 8).max(1);
        let travel = w.saturating_sub(side).max(1);
        let left = (sequence as usize * SQUARE_STEP) % travel;
        let top = h.saturating_sub(side) / 2;

        let mut luma = Vec::with_capacity(w * h);
        for y in 0..h {
            for x in 0..w {
                let inside = (left..left + side).contains(&x) && (top..top + side).contains(&y);
                luma.push(if inside {
                    SQUARE_LUMA
                } else {
                    BACKGROUND_LUMA + (x * GRADIENT_SPAN / w.max(1)) as u8
                });
            }
        }
        luma
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::PixelConverter;
    use crate::pipeline::pool::BufferPool;

    fn config(format: PixelFormat) -> CaptureConfig {
        CaptureConfig {
            width: 64,
            height: 48,
            format,
            buffer_count: 2,
            ..CaptureConfig::default()
        }
    }

    #[test]
    fn slots_bound_outstanding_frames() {
        let mut sensor = SyntheticSensor::new(&config(PixelFormat::Yuv420_888));

        let first = sensor.next_frame().unwrap();
        let second = sensor.next_frame().unwrap();
        assert_eq!(sensor.outstanding(), 2);
        assert!(sensor.next_frame().is_none());

        drop(first);
        assert_eq!(sensor.outstanding(), 1);
        let third = sensor.next_frame().unwrap();
        assert_eq!(third.info().sequence, 2);
        drop((second, third));
        assert_eq!(sensor.outstanding(), 0);
    }

    #[test]
    fn timestamps_follow_frame_rate() {
        let mut sensor = SyntheticSensor::new(&CaptureConfig {
            fps: 25,
            ..config(PixelFormat::Nv21)
        });
        let a = sensor.next_frame().unwrap().info();
        let b = sensor.next_frame().unwrap().info();
        assert_eq!(a.timestamp, Duration::ZERO);
        assert_eq!(b.timestamp - a.timestamp, Duration::from_millis(40));
        assert_eq!(a.rotation, Rotation::Deg90);
    }

    #[test]
    fn both_layouts_convert_to_the_same_image() {
        let pool = BufferPool::new(4);
        let mut converter = PixelConverter::new(pool);

        let mut planar = SyntheticSensor::new(&config(PixelFormat::Yuv420_888));
        let mut semi = SyntheticSensor::new(&config(PixelFormat::Nv21));
        let a = converter.convert(planar.next_frame().unwrap());
        let b = converter.convert(semi.next_frame().unwrap());

        assert!(!a.is_placeholder());
        assert!(!b.is_placeholder());
        assert_eq!(a.frame.pixels(), b.frame.pixels());
        assert_eq!(planar.outstanding(), 0);
    }

    #[test]
    fn square_is_bright_and_background_is_dark() {
        let pool = BufferPool::new(2);
        let mut converter = PixelConverter::new(pool);
        let mut sensor = SyntheticSensor::new(&config(PixelFormat::Yuv420_888));
        let rgb = converter.convert(sensor.next_frame().unwrap()).frame;

        // 64x48: side 6, first frame starts at the left edge, rows 21..27
        assert_eq!(rgb.pixel(2, 24), [SQUARE_LUMA; 3]);
        assert!(rgb.pixel(40, 2)[0] < 100);
    }
}
