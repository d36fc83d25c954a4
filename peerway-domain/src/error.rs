use thiserror::Error;

use super::rate::RateClassId;

// ---

#[derive(Debug, Error)]
pub enum PeerwayError {
    // ---
    /// An unexpected header or command arrived at a protocol step that
    /// expects a specific type. Fatal to the current transfer or session,
    /// never to the connection.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Final-completion checksum disagreement between the two sides.
    #[error("transfer integrity failure: expected checksum {expected:#010x}, got {actual:#010x}")]
    Integrity { expected: u32, actual: u32 },

    #[error("transport error: {0}")]
    Transport(String),

    /// No protocol event arrived before the transfer deadline.
    #[error("transfer deadline expired")]
    TimedOut,

    #[error("unknown rate class: {0}")]
    UnknownRateClass(RateClassId),

    #[error("invalid rate class {0}: {1}")]
    InvalidRateClass(RateClassId, String),

    #[error("transfer cancelled")]
    Cancelled,

    #[error("session closed")]
    SessionClosed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// ---

pub type Result<T> = std::result::Result<T, PeerwayError>;
