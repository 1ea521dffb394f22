//! Capture driver seam and the thread that feeds the frame buffer pool

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::utils::Backoff;
use tracing::{debug, info, warn};

use crate::capture::frame::{FrameMetadata, ImageGeometry};
use crate::capture::pool::CaptureHandle;
use crate::error::{Error, Result};

/// A source of raw frames.
///
/// `capture_into` may block until the next frame is available; it writes the
/// frame into the provided buffer and describes what it wrote.
pub trait CaptureDriver: Send + 'static {
    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    fn capture_into(&mut self, pixels: &mut [u8]) -> Result<FrameMetadata>;

    fn stop(&mut self) {}
}

/// Running capture thread
pub struct CaptureThread {
    handle: Option<JoinHandle<Result<()>>>,
    shutdown: Arc<AtomicBool>,
}

impl CaptureThread {
    /// Start `driver` on its own thread, filling buffers from `capture`.
    pub fn spawn<D: CaptureDriver>(mut driver: D, mut capture: CaptureHandle) -> Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let stop = Arc::clone(&shutdown);

        let handle = thread::Builder::new()
            .name("capture".into())
            .spawn(move || {
                driver.start()?;
                let result = capture_loop(&mut driver, &mut capture, &stop);
                driver.stop();
                result
            })?;

        Ok(Self {
            handle: Some(handle),
            shutdown,
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Ask the driver to stop and wait for the thread.
    pub fn stop(&mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::Release);
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| Error::fault("capture thread panicked"))?,
            None => Ok(()),
        }
    }
}

impl Drop for CaptureThread {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("Capture thread ended with error: {}", e);
        }
    }
}

fn capture_loop<D: CaptureDriver>(
    driver: &mut D,
    capture: &mut CaptureHandle,
    shutdown: &AtomicBool,
) -> Result<()> {
    let backoff = Backoff::new();
    info!("Capture loop started");

    while !shutdown.load(Ordering::Acquire) {
        let mut lease = match capture.begin_capture() {
            Ok(lease) => {
                backoff.reset();
                lease
            }
            Err(Error::ResourceExhausted { stalls }) => {
                // Stall until processing releases a buffer
                if backoff.is_completed() {
                    if stalls % 1000 == 0 {
                        debug!(stalls, "Capture stalled, no free frame buffer");
                    }
                    thread::sleep(Duration::from_micros(500));
                } else {
                    backoff.snooze();
                }
                continue;
            }
            Err(e) => return Err(e),
        };

        match lease.fill(|pixels| driver.capture_into(pixels))? {
            Ok(meta) => {
                lease.complete(meta)?;
            }
            Err(e) => {
                warn!("Capture error: {}", e);
                drop(lease);
                thread::sleep(Duration::from_millis(10));
            }
        }
    }

    info!("Capture loop stopped");
    Ok(())
}

/// Synthetic camera producing a bright square moving over a dark gradient.
pub struct TestPatternDriver {
    geometry: ImageGeometry,
    interval: Duration,
    next_due: Instant,
    tick: u32,
}

impl TestPatternDriver {
    pub fn new(geometry: ImageGeometry, fps: u32) -> Self {
        let interval = Duration::from_secs(1) / fps.max(1);
        Self {
            geometry,
            interval,
            next_due: Instant::now(),
            tick: 0,
        }
    }

    /// Luminance of the pattern at `(x, y)` for the current tick.
    fn intensity(&self, x: u32, y: u32) -> u8 {
        let side = (self.geometry.height / 6).max(1);
        let span = self.geometry.width.saturating_sub(side).max(1);
        let left = (self.tick * 4) % span;
        let top = self.geometry.height / 2 - side / 2;
        if x >= left && x < left + side && y >= top && y < top + side {
            230
        } else {
            (16 + (x * 32) / self.geometry.width.max(1)) as u8
        }
    }
}

impl CaptureDriver for TestPatternDriver {
    fn start(&mut self) -> Result<()> {
        info!(
            "Test pattern camera {}x{} at {:?} per frame",
            self.geometry.width, self.geometry.height, self.interval
        );
        self.next_due = Instant::now();
        Ok(())
    }

    fn capture_into(&mut self, pixels: &mut [u8]) -> Result<FrameMetadata> {
        let now = Instant::now();
        if self.next_due > now {
            thread::sleep(self.next_due - now);
        }
        self.next_due += self.interval;

        let format = self.geometry.raw_format();
        let bpp = format.bytes_per_pixel();
        let len = self.geometry.raw_frame_len();
        if pixels.len() < len {
            return Err(Error::Geometry {
                expected: len,
                actual: pixels.len(),
            });
        }

        let width = self.geometry.width as usize;
        for (index, pixel) in pixels[..len].chunks_exact_mut(bpp).enumerate() {
            let value = self.intensity((index % width) as u32, (index / width) as u32);
            match bpp {
                // UYVY: chroma neutral, luma in the second byte
                2 => {
                    pixel[0] = 128;
                    pixel[1] = value;
                }
                _ => pixel.fill(value),
            }
        }
        self.tick = self.tick.wrapping_add(1);

        Ok(FrameMetadata::new(self.geometry, format, len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::pool::{FrameBufferPool, NR_FRAME_BUFFERS};

    #[test]
    fn test_pattern_fills_uyvy_luma() {
        let geometry = ImageGeometry::new(12, 12, 1);
        let mut driver = TestPatternDriver::new(geometry, 1000);
        let mut buf = vec![0u8; geometry.raw_frame_len()];
        let meta = driver.capture_into(&mut buf).unwrap();

        assert_eq!(meta.len, 12 * 12 * 2);
        assert!(buf.chunks_exact(2).all(|px| px[0] == 128));
        assert!(buf.chunks_exact(2).any(|px| px[1] == 230));
    }

    #[test]
    fn test_pattern_rejects_short_buffer() {
        let mut driver = TestPatternDriver::new(ImageGeometry::new(8, 8, 3), 1000);
        let mut buf = vec![0u8; 10];
        assert!(matches!(
            driver.capture_into(&mut buf),
            Err(Error::Geometry { .. })
        ));
    }

    #[test]
    fn test_capture_thread_feeds_pool() {
        let geometry = ImageGeometry::new(16, 12, 1);
        let (mut pool, capture) =
            FrameBufferPool::new(NR_FRAME_BUFFERS, geometry.raw_frame_len(), u32::MAX).unwrap();
        let mut thread =
            CaptureThread::spawn(TestPatternDriver::new(geometry, 500), capture).unwrap();

        let frame = pool.try_acquire_ready(Duration::from_secs(2)).unwrap();
        assert_eq!(frame.lock().unwrap().pixels().len(), geometry.raw_frame_len());
        drop(frame);

        thread.stop().unwrap();
        assert!(!thread.is_running());
    }
}
