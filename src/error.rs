//! Error types shared by every appliance component.

use std::fmt;

/// Why a request was answered with a negative acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackReason {
    /// The parameter id does not name anything the appliance knows.
    UnknownParameter(u32),
    /// The response would not fit into the requester's destination.
    PayloadTooLarge { len: usize, capacity: usize },
    /// The scratch slot used for compositing was addressed directly.
    ReservedSlot,
    /// A set request carried a value outside its accepted range.
    InvalidArgument(i64),
}

impl fmt::Display for NackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NackReason::UnknownParameter(id) => write!(f, "unknown parameter id {id}"),
            NackReason::PayloadTooLarge { len, capacity } => {
                write!(f, "payload of {len} bytes exceeds capacity {capacity}")
            }
            NackReason::ReservedSlot => f.write_str("reserved compositing slot"),
            NackReason::InvalidArgument(value) => write!(f, "argument {value} out of range"),
        }
    }
}

/// Errors that can occur while running the appliance.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No frame became ready within the capture timeout.
    #[error("timed out waiting for a frame")]
    Timeout,

    /// Every frame buffer is borrowed, ready or capturing.
    #[error("frame buffer pool exhausted after {stalls} stalled captures")]
    ResourceExhausted { stalls: u32 },

    /// The peer has not drained the previous reply yet.
    #[error("transport busy, acknowledgement not accepted")]
    TransportBusy,

    /// The request could not be serviced.
    #[error("invalid request: {0}")]
    InvalidRequest(NackReason),

    /// A buffer did not have the size its geometry requires.
    #[error("geometry mismatch: expected {expected} bytes, got {actual}")]
    Geometry { expected: usize, actual: usize },

    /// Configuration values failed validation.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Configuration sources could not be read or deserialized.
    #[error("configuration error: {0}")]
    Settings(#[from] config::ConfigError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything the control loop cannot recover from.
    #[error("unrecoverable fault: {0}")]
    UnrecoverableFault(String),
}

impl Error {
    pub fn fault(msg: impl Into<String>) -> Self {
        Error::UnrecoverableFault(msg.into())
    }

    /// Conditions the control loop handles by simply trying again.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Timeout | Error::TransportBusy)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
