//! The processing step run once per captured frame

use tracing::trace;

use crate::capture::frame::{ImageGeometry, PixelFormat};
use crate::capture::pool::RawFrame;
use crate::error::{Error, Result};
use crate::ipc::state::ApplicationState;
use crate::overlay::{Color, DrawCommandQueue, Font};
use crate::pipeline::artifacts::{ArtifactKind, ImageArtifactStore};

/// What a processing step may touch during one cycle.
pub struct ProcessingContext<'a> {
    pub artifacts: &'a mut ImageArtifactStore,
    pub overlay: &'a mut DrawCommandQueue,
    pub state: &'a ApplicationState,
}

/// A processing algorithm fed with every acquired frame.
pub trait FrameProcessor: Send {
    fn process(&mut self, frame: &RawFrame<'_>, ctx: &mut ProcessingContext<'_>) -> Result<()>;

    /// Drop any state carried between cycles.
    fn reset(&mut self) {}
}

/// Background subtraction demo.
///
/// Writes the sensor image, a running-average background and the
/// thresholded difference, then outlines the foreground and captions the
/// frame number. The index slots are left to custom algorithms.
pub struct ThresholdProcessor {
    geometry: ImageGeometry,
    /// Background update rate out of 256
    background_weight: u32,
    background_valid: bool,
    sensor: Vec<u8>,
    mask: Vec<u8>,
}

impl ThresholdProcessor {
    pub fn new(geometry: ImageGeometry, background_weight: u8) -> Self {
        Self {
            geometry,
            background_weight: background_weight.max(1) as u32,
            background_valid: false,
            sensor: vec![0; geometry.artifact_len()],
            mask: vec![0; geometry.artifact_len()],
        }
    }

    /// Convert the raw frame to the artifact layout, applying the perspective.
    fn extract_sensor(&mut self, frame: &RawFrame<'_>, state: &ApplicationState) -> Result<()> {
        let meta = frame.meta();
        let width = self.geometry.width as usize;
        let height = self.geometry.height as usize;
        let bpp = meta.format.bytes_per_pixel();
        let expected = width * height * bpp;
        if meta.width != self.geometry.width
            || meta.height != self.geometry.height
            || frame.pixels().len() < expected
        {
            return Err(Error::Geometry {
                expected,
                actual: frame.pixels().len(),
            });
        }

        let raw = frame.pixels();
        let colors = self.geometry.colors as usize;
        for y in 0..height {
            for x in 0..width {
                let (sx, sy) = state.perspective.map(x, y, width, height);
                let src = &raw[(sy * width + sx) * bpp..][..bpp];
                let dst = &mut self.sensor[(y * width + x) * colors..][..colors];
                match (meta.format, colors) {
                    (PixelFormat::Rgb24, 3) => dst.copy_from_slice(src),
                    (PixelFormat::Rgb24, _) => {
                        let luma = (299 * src[0] as u32 + 587 * src[1] as u32 + 114 * src[2] as u32)
                            / 1000;
                        dst.fill(luma as u8);
                    }
                    (PixelFormat::Uyvy, _) => dst.fill(src[1]),
                    (PixelFormat::Yuyv, _) => dst.fill(src[0]),
                }
            }
        }
        Ok(())
    }
}

impl FrameProcessor for ThresholdProcessor {
    fn process(&mut self, frame: &RawFrame<'_>, ctx: &mut ProcessingContext<'_>) -> Result<()> {
        self.extract_sensor(frame, ctx.state)?;
        ctx.artifacts.write(ArtifactKind::SensorImage, &self.sensor)?;

        let background = ctx.artifacts.slot_mut(ArtifactKind::Background)?;
        if self.background_valid {
            let weight = self.background_weight as i32;
            for (bg, px) in background.pixels_mut().iter_mut().zip(&self.sensor) {
                let delta = (*px as i32 - *bg as i32) * weight / 256;
                *bg = (*bg as i32 + delta).clamp(0, 255) as u8;
            }
        } else {
            background.pixels_mut().copy_from_slice(&self.sensor);
            self.background_valid = true;
        }

        let threshold = ctx.state.threshold;
        let colors = self.geometry.colors as usize;
        let background = ctx.artifacts.read(ArtifactKind::Background).pixels();
        let width = self.geometry.width as i32;
        let mut bounds: Option<(i32, i32, i32, i32)> = None;
        for (index, (mask, (px, bg))) in self
            .mask
            .chunks_exact_mut(colors)
            .zip(self.sensor.chunks_exact(colors).zip(background.chunks_exact(colors)))
            .enumerate()
        {
            let foreground = (px[0] as i32 - bg[0] as i32).abs() > threshold;
            mask.fill(if foreground { 255 } else { 0 });
            if foreground {
                let (x, y) = (index as i32 % width, index as i32 / width);
                bounds = Some(match bounds {
                    None => (x, y, x, y),
                    Some((l, t, r, b)) => (l.min(x), t.min(y), r.max(x), b.max(y)),
                });
            }
        }
        ctx.artifacts.write(ArtifactKind::Threshold, &self.mask)?;

        if let Some((left, top, right, bottom)) = bounds {
            trace!(left, top, right, bottom, "foreground found");
            ctx.overlay
                .enqueue_box(left, bottom, right, top, false, Color::Green);
        }
        let caption = format!("FRAME {}", frame.meta().sequence);
        ctx.overlay
            .enqueue_string(4, 4, caption.len(), Font::Small, Color::White, &caption);
        Ok(())
    }

    fn reset(&mut self) {
        self.background_valid = false;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::capture::frame::FrameMetadata;
    use crate::capture::pool::FrameBufferPool;
    use crate::overlay::DrawCommand;

    const GEOMETRY: ImageGeometry = ImageGeometry {
        width: 8,
        height: 4,
        colors: 1,
    };

    fn run(
        processor: &mut ThresholdProcessor,
        luma: &[u8],
        store: &mut ImageArtifactStore,
    ) -> DrawCommandQueue {
        let (mut pool, mut capture) = FrameBufferPool::new(3, GEOMETRY.raw_frame_len(), 10).unwrap();
        let mut lease = capture.begin_capture().unwrap();
        lease
            .fill(|buf| {
                for (px, y) in buf.chunks_exact_mut(2).zip(luma) {
                    px[0] = 128;
                    px[1] = *y;
                }
            })
            .unwrap();
        lease
            .complete(FrameMetadata::new(GEOMETRY, PixelFormat::Uyvy, GEOMETRY.raw_frame_len()))
            .unwrap();

        let frame = pool.try_acquire_ready(Duration::from_millis(1)).unwrap();
        let raw = frame.lock().unwrap();
        let mut overlay = DrawCommandQueue::new(16);
        let state = ApplicationState {
            threshold: 20,
            ..Default::default()
        };
        let mut ctx = ProcessingContext {
            artifacts: store,
            overlay: &mut overlay,
            state: &state,
        };
        processor.process(&raw, &mut ctx).unwrap();
        overlay
    }

    #[test]
    fn test_first_frame_becomes_background() {
        let mut processor = ThresholdProcessor::new(GEOMETRY, 16);
        let mut store = ImageArtifactStore::new(GEOMETRY);
        let luma = [40u8; 32];
        let overlay = run(&mut processor, &luma, &mut store);

        assert_eq!(store.read(ArtifactKind::SensorImage).pixels(), &luma[..]);
        assert_eq!(store.read(ArtifactKind::Background).pixels(), &luma[..]);
        assert!(store.read(ArtifactKind::Threshold).pixels().iter().all(|p| *p == 0));
        // Only the caption, no foreground box
        assert_eq!(overlay.len(), 1);
    }

    #[test]
    fn test_foreground_is_thresholded_and_boxed() {
        let mut processor = ThresholdProcessor::new(GEOMETRY, 16);
        let mut store = ImageArtifactStore::new(GEOMETRY);
        run(&mut processor, &[40; 32], &mut store);

        let mut luma = [40u8; 32];
        luma[8 + 2] = 200; // (2, 1)
        luma[16 + 5] = 200; // (5, 2)
        let overlay = run(&mut processor, &luma, &mut store);

        let mask = store.read(ArtifactKind::Threshold).pixels();
        assert_eq!(mask.iter().filter(|p| **p == 255).count(), 2);
        assert_eq!(mask[10], 255);
        assert_eq!(
            overlay.iter().next(),
            Some(&DrawCommand::Box {
                left: 2,
                bottom: 2,
                right: 5,
                top: 1,
                filled: false,
                color: Color::Green
            })
        );
        // Background moved towards the new value by weight/256
        assert_eq!(store.read(ArtifactKind::Background).pixels()[10], 50);
    }

    #[test]
    fn test_reset_relearns_background() {
        let mut processor = ThresholdProcessor::new(GEOMETRY, 16);
        let mut store = ImageArtifactStore::new(GEOMETRY);
        run(&mut processor, &[40; 32], &mut store);
        processor.reset();
        run(&mut processor, &[90; 32], &mut store);
        assert!(store.read(ArtifactKind::Background).pixels().iter().all(|p| *p == 90));
        assert!(store.read(ArtifactKind::Threshold).pixels().iter().all(|p| *p == 0));
    }
}
