//! Request and reply messages exchanged with the user interface

use bytes::Bytes;

use crate::error::NackReason;
use crate::pipeline::artifacts::ArtifactKind;

/// A request from the user interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpcRequest {
    /// Chosen by the requester and echoed in the reply
    pub tag: u64,
    pub param_id: u32,
    /// Value carried by set requests, ignored otherwise
    pub argument: i64,
    /// Largest payload the requester can accept, in bytes
    pub capacity: usize,
}

impl IpcRequest {
    pub fn get(tag: u64, param: Param, capacity: usize) -> Self {
        Self {
            tag,
            param_id: param.id(),
            argument: 0,
            capacity,
        }
    }

    pub fn set(tag: u64, param: Param, argument: i64) -> Self {
        Self {
            tag,
            param_id: param.id(),
            argument,
            capacity: 0,
        }
    }
}

/// Answer to exactly one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpcReply {
    Ack { tag: u64, payload: Bytes },
    Nack { tag: u64, reason: NackReason },
}

impl IpcReply {
    pub fn tag(&self) -> u64 {
        match self {
            IpcReply::Ack { tag, .. } | IpcReply::Nack { tag, .. } => *tag,
        }
    }

    pub fn is_ack(&self) -> bool {
        matches!(self, IpcReply::Ack { .. })
    }
}

/// Parameters the user interface may read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Param {
    /// Whole status record
    AppState,
    /// An artifact composited with the queued overlay
    Image(ArtifactKind),
    Threshold,
    SetThreshold,
    SetExposureTime,
    SetPerspective,
    ResetProcessing,
}

impl Param {
    pub fn id(self) -> u32 {
        match self {
            Param::AppState => 0,
            Param::Image(kind) => 1 + kind.index() as u32,
            Param::Threshold => 16,
            Param::SetThreshold => 32,
            Param::SetExposureTime => 33,
            Param::SetPerspective => 34,
            Param::ResetProcessing => 35,
        }
    }

    pub fn from_id(id: u32) -> Option<Self> {
        let param = match id {
            0 => Param::AppState,
            1..=6 => Param::Image(ArtifactKind::ALL[id as usize - 1]),
            16 => Param::Threshold,
            32 => Param::SetThreshold,
            33 => Param::SetExposureTime,
            34 => Param::SetPerspective,
            35 => Param::ResetProcessing,
            _ => return None,
        };
        Some(param)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_param_ids_are_stable() {
        assert_eq!(Param::AppState.id(), 0);
        assert_eq!(Param::Image(ArtifactKind::SensorImage).id(), 1);
        assert_eq!(Param::Image(ArtifactKind::Threshold).id(), 3);
        assert_eq!(Param::Image(ArtifactKind::AdditionalInfo).id(), 6);
        assert_eq!(Param::ResetProcessing.id(), 35);
    }

    #[test]
    fn test_every_param_parses_back() {
        let params = [
            Param::AppState,
            Param::Threshold,
            Param::SetThreshold,
            Param::SetExposureTime,
            Param::SetPerspective,
            Param::ResetProcessing,
        ]
        .into_iter()
        .chain(ArtifactKind::ALL.into_iter().map(Param::Image));

        for param in params {
            assert_eq!(Param::from_id(param.id()), Some(param));
        }
        assert_eq!(Param::from_id(7), None);
        assert_eq!(Param::from_id(999), None);
    }
}
