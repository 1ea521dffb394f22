pub mod driver;
pub mod frame;
pub mod pool;
#[cfg(feature = "v4l2")]
pub mod v4l2;

pub use driver::{CaptureDriver, CaptureThread, TestPatternDriver};
pub use frame::{FrameMetadata, ImageGeometry, PixelFormat};
pub use pool::{
    BufferState, CaptureHandle, CaptureLease, FrameBufferPool, FrameHandle, RawFrame,
    CAMERA_TIMEOUT, NR_FRAME_BUFFERS,
};
#[cfg(feature = "v4l2")]
pub use v4l2::V4l2Driver;
