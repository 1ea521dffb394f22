pub mod artifacts;
pub mod controller;
pub mod processor;

pub use artifacts::{ArtifactKind, ArtifactMap, Image, ImageArtifactStore};
pub use controller::{Phase, ProcessingController};
pub use processor::{FrameProcessor, ProcessingContext, ThresholdProcessor};
