//! Named image slots written by processing and read by the transport.

use std::ops::{Index, IndexMut};

use crate::capture::frame::ImageGeometry;
use crate::error::{Error, NackReason, Result};
use crate::overlay::DrawCommandQueue;

/// The images processing produces; always address slots through these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    SensorImage,
    Background,
    Threshold,
    Index0,
    Index1,
    /// Compositing scratch slot, never written by processing
    AdditionalInfo,
}

impl ArtifactKind {
    pub const COUNT: usize = 6;

    pub const ALL: [ArtifactKind; ArtifactKind::COUNT] = [
        ArtifactKind::SensorImage,
        ArtifactKind::Background,
        ArtifactKind::Threshold,
        ArtifactKind::Index0,
        ArtifactKind::Index1,
        ArtifactKind::AdditionalInfo,
    ];

    pub fn index(self) -> usize {
        match self {
            ArtifactKind::SensorImage => 0,
            ArtifactKind::Background => 1,
            ArtifactKind::Threshold => 2,
            ArtifactKind::Index0 => 3,
            ArtifactKind::Index1 => 4,
            ArtifactKind::AdditionalInfo => 5,
        }
    }

    pub fn is_reserved(self) -> bool {
        self == ArtifactKind::AdditionalInfo
    }

    pub fn label(self) -> &'static str {
        match self {
            ArtifactKind::SensorImage => "sensor",
            ArtifactKind::Background => "background",
            ArtifactKind::Threshold => "threshold",
            ArtifactKind::Index0 => "index0",
            ArtifactKind::Index1 => "index1",
            ArtifactKind::AdditionalInfo => "additional-info",
        }
    }
}

/// One value per artifact kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactMap<T>([T; ArtifactKind::COUNT]);

impl<T> ArtifactMap<T> {
    pub fn from_fn(mut f: impl FnMut(ArtifactKind) -> T) -> Self {
        Self(std::array::from_fn(|i| f(ArtifactKind::ALL[i])))
    }

    pub fn iter(&self) -> impl Iterator<Item = (ArtifactKind, &T)> {
        ArtifactKind::ALL.into_iter().zip(self.0.iter())
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.0.iter_mut()
    }
}

impl<T> Index<ArtifactKind> for ArtifactMap<T> {
    type Output = T;

    fn index(&self, kind: ArtifactKind) -> &T {
        &self.0[kind.index()]
    }
}

impl<T> IndexMut<ArtifactKind> for ArtifactMap<T> {
    fn index_mut(&mut self, kind: ArtifactKind) -> &mut T {
        &mut self.0[kind.index()]
    }
}

/// Full-resolution interleaved 8-bit image
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Image {
    width: u32,
    height: u32,
    channels: u8,
    pixels: Vec<u8>,
}

impl Image {
    pub fn new(geometry: ImageGeometry) -> Self {
        Self {
            width: geometry.width,
            height: geometry.height,
            channels: geometry.colors.max(1),
            pixels: vec![0; geometry.artifact_len()],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> u8 {
        self.channels
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.pixels
    }

    pub fn fill(&mut self, value: u8) {
        self.pixels.fill(value);
    }

    /// Copy `other` into this image, reusing the allocation.
    pub fn copy_from(&mut self, other: &Image) {
        self.clone_from(other);
    }

    /// Channel values at `(x, y)`, `None` outside the image.
    pub fn get(&self, x: i32, y: i32) -> Option<&[u8]> {
        let offset = self.offset(x, y)?;
        Some(&self.pixels[offset..offset + self.channels as usize])
    }

    /// Paint `(x, y)`; coordinates outside the image are ignored.
    ///
    /// Single-channel images receive the luminance of `rgb`.
    pub fn put(&mut self, x: i32, y: i32, rgb: [u8; 3]) {
        let Some(offset) = self.offset(x, y) else {
            return;
        };
        match self.channels {
            1 => self.pixels[offset] = luma(rgb),
            _ => self.pixels[offset..offset + 3].copy_from_slice(&rgb),
        }
    }

    fn offset(&self, x: i32, y: i32) -> Option<usize> {
        if x < 0 || y < 0 || x as u32 >= self.width || y as u32 >= self.height {
            return None;
        }
        Some((y as usize * self.width as usize + x as usize) * self.channels as usize)
    }
}

fn luma([r, g, b]: [u8; 3]) -> u8 {
    ((299 * r as u32 + 587 * g as u32 + 114 * b as u32) / 1000) as u8
}

/// Fixed set of named image slots.
///
/// Slots are overwritten once per processing cycle and must only be read
/// after the cycle that wrote them has completed.
pub struct ImageArtifactStore {
    geometry: ImageGeometry,
    slots: ArtifactMap<Image>,
}

impl ImageArtifactStore {
    pub fn new(geometry: ImageGeometry) -> Self {
        Self {
            geometry,
            slots: ArtifactMap::from_fn(|_| Image::new(geometry)),
        }
    }

    pub fn geometry(&self) -> ImageGeometry {
        self.geometry
    }

    pub fn read(&self, kind: ArtifactKind) -> &Image {
        &self.slots[kind]
    }

    /// Replace the contents of a processing slot.
    pub fn write(&mut self, kind: ArtifactKind, pixels: &[u8]) -> Result<()> {
        let slot = self.slot_mut(kind)?;
        if pixels.len() != slot.pixels.len() {
            return Err(Error::Geometry {
                expected: slot.pixels.len(),
                actual: pixels.len(),
            });
        }
        slot.pixels.copy_from_slice(pixels);
        Ok(())
    }

    /// In-place access to a processing slot.
    pub fn slot_mut(&mut self, kind: ArtifactKind) -> Result<&mut Image> {
        if kind.is_reserved() {
            return Err(Error::InvalidRequest(NackReason::ReservedSlot));
        }
        Ok(&mut self.slots[kind])
    }

    /// Zero every slot, the scratch slot included.
    pub fn reset_all(&mut self) {
        for slot in self.slots.values_mut() {
            slot.fill(0);
        }
    }

    /// Copy `kind` into the scratch slot and draw the queued overlay on it.
    ///
    /// The source slot is left untouched and the queue is drained.
    pub fn composite(&mut self, kind: ArtifactKind, queue: &mut DrawCommandQueue) -> Result<&Image> {
        if kind.is_reserved() {
            return Err(Error::InvalidRequest(NackReason::ReservedSlot));
        }
        let mut scratch = std::mem::take(&mut self.slots[ArtifactKind::AdditionalInfo]);
        scratch.copy_from(&self.slots[kind]);
        queue.composite_into(&mut scratch);
        self.slots[ArtifactKind::AdditionalInfo] = scratch;
        Ok(&self.slots[ArtifactKind::AdditionalInfo])
    }
}
