use crate::kefex::constants::ErrorCode;

/// Failures reported by the legacy bus protocol.
#[derive(thiserror::Error, Debug, PartialEq, Eq, Copy, Clone)]
pub enum Error {
    #[error("Unknown Service Tag 0x{0:02x}")]
    UnknownService(u8),
    #[error("Negative Response: {}", describe(*.0))]
    NegativeResponse(u8),
    #[error("Unexpected Index: expected 0x{expected:x}, got 0x{actual:x}")]
    UnexpectedIndex { expected: u32, actual: u32 },
    #[error("Response does not echo the request")]
    UnexpectedEcho,
    #[error("Size Mismatch: expected {expected} bytes, peer announced {actual}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("Sequence Mismatch: expected {expected}, got {actual}")]
    SequenceMismatch { expected: u8, actual: u8 },
    #[error("Checksum Mismatch: expected 0x{expected:04x}, calculated 0x{actual:04x}")]
    ChecksumMismatch { expected: u16, actual: u16 },
    #[error("SSL Mismatch: crc 0x{expected_crc:04x}/0x{echoed_crc:04x}, count {expected_count}/{echoed_count}")]
    SslMismatch {
        expected_crc: u16,
        echoed_crc: u16,
        expected_count: u16,
        echoed_count: u16,
    },
    #[error("Malformed Response")]
    MalformedResponse,
    #[error("Request payload of {0} bytes does not fit a frame")]
    RequestTooLong(usize),
}

fn describe(code: u8) -> String {
    match ErrorCode::from_repr(code) {
        Some(code) => format!("{:?}", code),
        None => format!("0x{:02x}", code),
    }
}

impl Error {
    /// Reason code reported by the server, if this is an error response.
    pub fn reason_code(&self) -> Option<u8> {
        match self {
            Error::NegativeResponse(code) => Some(*code),
            _ => None,
        }
    }
}
