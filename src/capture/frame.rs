use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Largest sensor resolution the appliance supports.
pub const MAX_IMAGE_WIDTH: u32 = 752;
pub const MAX_IMAGE_HEIGHT: u32 = 480;

/// Pixel formats a capture driver may deliver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    /// Packed 4:2:2, luminance in every odd byte
    Uyvy,
    /// Packed 4:2:2, luminance in every even byte
    Yuyv,
    Rgb24,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Uyvy | PixelFormat::Yuyv => 2,
            PixelFormat::Rgb24 => 3,
        }
    }
}

/// Frame dimensions shared by raw buffers and processed artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageGeometry {
    pub width: u32,
    pub height: u32,
    /// 1 for gray sensors, 3 for color sensors
    pub colors: u8,
}

impl ImageGeometry {
    pub fn new(width: u32, height: u32, colors: u8) -> Self {
        Self {
            width,
            height,
            colors,
        }
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Gray sensors deliver UYVY, so raw frames carry two planes.
    pub fn raw_planes(&self) -> usize {
        if self.colors == 1 {
            2
        } else {
            3
        }
    }

    pub fn raw_format(&self) -> PixelFormat {
        if self.colors == 1 {
            PixelFormat::Uyvy
        } else {
            PixelFormat::Rgb24
        }
    }

    pub fn raw_frame_len(&self) -> usize {
        self.raw_planes() * self.pixel_count()
    }

    pub fn artifact_len(&self) -> usize {
        self.colors as usize * self.pixel_count()
    }
}

impl Default for ImageGeometry {
    fn default() -> Self {
        Self::new(MAX_IMAGE_WIDTH, MAX_IMAGE_HEIGHT, 1)
    }
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    /// Assigned by the pool when the capture completes
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Number of valid bytes at the start of the buffer
    pub len: usize,
    /// Capture timestamp for latency tracking
    pub timestamp: Instant,
    pub device_timestamp: Option<Duration>, // Hardware timestamp if available
}

impl FrameMetadata {
    pub fn new(geometry: ImageGeometry, format: PixelFormat, len: usize) -> Self {
        Self {
            sequence: 0,
            width: geometry.width,
            height: geometry.height,
            format,
            len,
            timestamp: Instant::now(),
            device_timestamp: None,
        }
    }
}
