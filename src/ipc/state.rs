//! Appliance status exposed to the user interface

use std::sync::Arc;

use arc_swap::ArcSwap;
use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

/// Size of the encoded status record
pub const STATUS_RECORD_LEN: usize = 30;

const FLAG_EXPOSURE_CHANGED: u8 = 1 << 0;
const FLAG_RESET_PENDING: u8 = 1 << 1;

/// Camera-scene perspective
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Perspective {
    #[default]
    Default,
    HorizontalMirror,
    VerticalMirror,
    Rotate180,
}

impl Perspective {
    pub fn code(self) -> u8 {
        match self {
            Perspective::Default => 0,
            Perspective::HorizontalMirror => 1,
            Perspective::VerticalMirror => 2,
            Perspective::Rotate180 => 3,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Perspective::Default),
            1 => Some(Perspective::HorizontalMirror),
            2 => Some(Perspective::VerticalMirror),
            3 => Some(Perspective::Rotate180),
            _ => None,
        }
    }

    /// Source coordinates of output pixel `(x, y)` in a `width` x `height` frame.
    pub fn map(self, x: usize, y: usize, width: usize, height: usize) -> (usize, usize) {
        match self {
            Perspective::Default => (x, y),
            Perspective::HorizontalMirror => (width - 1 - x, y),
            Perspective::VerticalMirror => (x, height - 1 - y),
            Perspective::Rotate180 => (width - 1 - x, height - 1 - y),
        }
    }
}

/// Everything the user interface can ask about the appliance.
///
/// Only the processing controller mutates this.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplicationState {
    /// Sequence of the last processed frame
    pub frame_sequence: u64,
    pub cycles: u64,
    pub threshold: i32,
    pub exposure_time_us: u32,
    /// Set when the shutter time changed; processing resets on the next cycle
    pub exposure_changed: bool,
    /// Set when a reset was requested; processing resets on the next cycle
    pub reset_pending: bool,
    pub perspective: Perspective,
    pub width: u16,
    pub height: u16,
}

impl ApplicationState {
    pub fn encode(&self, buf: &mut impl BufMut) {
        let mut flags = 0;
        if self.exposure_changed {
            flags |= FLAG_EXPOSURE_CHANGED;
        }
        if self.reset_pending {
            flags |= FLAG_RESET_PENDING;
        }
        buf.put_u64_le(self.frame_sequence);
        buf.put_u64_le(self.cycles);
        buf.put_i32_le(self.threshold);
        buf.put_u32_le(self.exposure_time_us);
        buf.put_u8(flags);
        buf.put_u8(self.perspective.code());
        buf.put_u16_le(self.width);
        buf.put_u16_le(self.height);
    }

    pub fn decode(mut buf: &[u8]) -> Option<Self> {
        if buf.len() < STATUS_RECORD_LEN {
            return None;
        }
        let frame_sequence = buf.get_u64_le();
        let cycles = buf.get_u64_le();
        let threshold = buf.get_i32_le();
        let exposure_time_us = buf.get_u32_le();
        let flags = buf.get_u8();
        let perspective = Perspective::from_code(buf.get_u8().into())?;
        let width = buf.get_u16_le();
        let height = buf.get_u16_le();
        Some(Self {
            frame_sequence,
            cycles,
            threshold,
            exposure_time_us,
            exposure_changed: flags & FLAG_EXPOSURE_CHANGED != 0,
            reset_pending: flags & FLAG_RESET_PENDING != 0,
            perspective,
            width,
            height,
        })
    }
}

/// Lock-free view of the last published status for observers outside the
/// control thread.
#[derive(Clone, Default)]
pub struct SharedStatus(Arc<ArcSwap<ApplicationState>>);

impl SharedStatus {
    pub fn new(state: ApplicationState) -> Self {
        Self(Arc::new(ArcSwap::from_pointee(state)))
    }

    pub fn publish(&self, state: &ApplicationState) {
        self.0.store(Arc::new(state.clone()));
    }

    pub fn load(&self) -> Arc<ApplicationState> {
        self.0.load_full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_record_layout() {
        let state = ApplicationState {
            frame_sequence: 7,
            cycles: 9,
            threshold: -3,
            exposure_time_us: 25_000,
            exposure_changed: true,
            reset_pending: false,
            perspective: Perspective::Rotate180,
            width: 752,
            height: 480,
        };
        let mut buf = Vec::new();
        state.encode(&mut buf);

        assert_eq!(buf.len(), STATUS_RECORD_LEN);
        assert_eq!(&buf[..8], &7u64.to_le_bytes());
        assert_eq!(buf[24], FLAG_EXPOSURE_CHANGED);
        assert_eq!(buf[25], 3);
        assert_eq!(ApplicationState::decode(&buf), Some(state));
        assert_eq!(ApplicationState::decode(&buf[..29]), None);
    }

    #[test]
    fn test_perspective_mapping() {
        assert_eq!(Perspective::HorizontalMirror.map(0, 1, 4, 3), (3, 1));
        assert_eq!(Perspective::VerticalMirror.map(0, 0, 4, 3), (0, 2));
        assert_eq!(Perspective::Rotate180.map(1, 1, 4, 3), (2, 1));
    }

    #[test]
    fn test_shared_status_publishes_copies() {
        let status = SharedStatus::default();
        let mut state = ApplicationState {
            threshold: 40,
            ..Default::default()
        };
        status.publish(&state);
        state.threshold = 41;
        assert_eq!(status.load().threshold, 40);
    }
}
