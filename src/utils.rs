use std::io;
use std::thread::{self, JoinHandle};

/// Spawn a named thread that inherits the caller's tracing dispatcher.
pub(crate) fn spawn_thread<F, T>(name: impl Into<String>, f: F) -> io::Result<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let dispatch = tracing::dispatcher::get_default(|current| current.clone());
    thread::Builder::new()
        .name(name.into())
        .spawn(move || tracing::dispatcher::with_default(&dispatch, f))
}

#[cfg(feature = "v4l2")]
pub use device::{auto_detect_device, FoundDevice};

#[cfg(feature = "v4l2")]
mod device {
    use std::path::Path;

    use color_eyre::{eyre::eyre, Result};
    use serde::{Deserialize, Serialize};
    use tracing::info;
    use v4l::{capability::Flags, video::Capture, Device, FourCC};

    use crate::capture::PixelFormat;
    use crate::CaptureConfig;

    /// Detected capture device info
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct FoundDevice {
        pub path: String,
        pub format: PixelFormat,
    }

    impl FoundDevice {
        /// Point `capture` at this device and the format it was picked for
        pub fn apply_to(self, capture: &mut CaptureConfig) {
            capture.device = self.path;
            capture.format = self.format;
        }
    }

    /// Find the first capture device offering a 4:2:0 format the converter
    /// understands. Planar YU12 wins over NV21 on the same device.
    pub fn auto_detect_device() -> Result<FoundDevice> {
        info!("auto-detecting capture devices");

        for i in 0..10 {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }

            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
                continue;
            }
            let Ok(formats) = dev.enum_formats() else {
                continue;
            };

            let fourccs: Vec<FourCC> = formats.iter().map(|fmt| fmt.fourcc).collect();
            let format = if fourccs.contains(&FourCC::new(b"YU12")) {
                PixelFormat::Yuv420_888
            } else if fourccs.contains(&FourCC::new(b"NV21")) {
                PixelFormat::Nv21
            } else {
                continue;
            };

            info!(%path, card = %caps.card, ?format, "found capture device");
            return Ok(FoundDevice { path, format });
        }

        Err(eyre!("no capture device with YU12 or NV21 output found"))
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn found_device_overrides_path_and_format() {
            let mut capture = CaptureConfig {
                device: String::new(),
                ..CaptureConfig::default()
            };
            FoundDevice {
                path: "/dev/video2".into(),
                format: PixelFormat::Nv21,
            }
            .apply_to(&mut capture);

            assert_eq!(capture.device, "/dev/video2");
            assert_eq!(capture.format, PixelFormat::Nv21);
            assert_eq!(capture.width, 640);
        }
    }
}
