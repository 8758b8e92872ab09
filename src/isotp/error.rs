//! Errors of the ISO-TP layer.
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum Error {
    /// Message does not fit a single frame or exceeds the classic CAN transfer limit
    #[error("Message Of {0} Bytes Too Large")]
    DataTooLarge(usize),
    #[error("Receiver Reported Overflow")]
    Overflow,
    #[error("Consecutive Frame Out Of Order: Expected Index {expected}, Got {actual}")]
    OutOfOrder { expected: u8, actual: u8 },
    #[error("Unknown Frame Type 0x{0:02x}")]
    UnknownFrameType(u8),
    #[error("Malformed Frame")]
    MalformedFrame,
}
