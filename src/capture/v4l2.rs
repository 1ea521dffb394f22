//! V4L2 camera driver filling pool buffers from memory-mapped device buffers

use std::time::Duration;

use tracing::{info, instrument};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::capture::driver::CaptureDriver;
use crate::capture::frame::{FrameMetadata, ImageGeometry, PixelFormat};
use crate::error::{Error, Result};

/// Number of buffers requested from the kernel
const DEVICE_BUFFERS: u32 = 4;

pub struct V4l2Driver {
    device: Box<Device>,
    stream: Option<MmapStream<'static>>,
    geometry: ImageGeometry,
    format: PixelFormat,
}

impl V4l2Driver {
    pub fn open(path: &str, geometry: ImageGeometry) -> Result<Self> {
        info!("Opening V4L2 camera: {}", path);

        let device = Device::with_path(path)?;

        // Query capabilities
        let caps = device.query_caps()?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(Error::Config(format!(
                "{path} does not support video capture"
            )));
        }

        let format = geometry.raw_format();
        let mut fmt = device.format()?;
        fmt.width = geometry.width;
        fmt.height = geometry.height;
        fmt.fourcc = match format {
            PixelFormat::Uyvy => FourCC::new(b"UYVY"),
            PixelFormat::Yuyv => FourCC::new(b"YUYV"),
            PixelFormat::Rgb24 => FourCC::new(b"RGB3"),
        };
        let applied = device.set_format(&fmt)?;
        if applied.width != geometry.width || applied.height != geometry.height {
            return Err(Error::Config(format!(
                "{path} negotiated {}x{}, wanted {}x{}",
                applied.width, applied.height, geometry.width, geometry.height
            )));
        }

        // Some sensors only offer YUYV for gray output
        let format = if format == PixelFormat::Uyvy && applied.fourcc == FourCC::new(b"YUYV") {
            PixelFormat::Yuyv
        } else {
            format
        };

        Ok(Self {
            device: Box::new(device),
            stream: None,
            geometry,
            format,
        })
    }
}

impl CaptureDriver for V4l2Driver {
    fn start(&mut self) -> Result<()> {
        let stream = MmapStream::with_buffers(&self.device, Type::VideoCapture, DEVICE_BUFFERS)?;
        self.stream = Some(stream);
        info!("Capture stream started with {} buffers", DEVICE_BUFFERS);
        Ok(())
    }

    #[instrument(level = "trace", skip(self, pixels))]
    fn capture_into(&mut self, pixels: &mut [u8]) -> Result<FrameMetadata> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::fault("stream not started"))?;

        let (buf, meta) = stream.next()?;
        let len = buf.len().min(pixels.len());
        pixels[..len].copy_from_slice(&buf[..len]);

        let mut frame_meta = FrameMetadata::new(self.geometry, self.format, len);
        frame_meta.device_timestamp = Some(
            Duration::from_secs(meta.timestamp.sec as u64)
                + Duration::from_micros(meta.timestamp.usec as u64),
        );
        Ok(frame_meta)
    }

    fn stop(&mut self) {
        self.stream = None;
    }
}
