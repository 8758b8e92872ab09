use crate::types::ServerId;

/// Failures of the update sequence that are not failures of a protocol exchange.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Node {0} Not In System Definition")]
    UnknownNode(ServerId),
    #[error("Device Type Mismatch: Expected {expected}, Device Reports {reported}")]
    DeviceTypeMismatch { expected: String, reported: String },
    #[error("Invalid HEX Record In Line {line}: {reason}")]
    HexRecord { line: usize, reason: &'static str },
    #[error("Node {0} Has No Session Of The Required Flashloader Family")]
    WrongFamily(ServerId),
    #[error("Area At 0x{address:08x} Exceeds The Address Range")]
    AreaTooLarge { address: u32 },
}
