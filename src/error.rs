//! Contains the main error type for the library.
use thiserror::Error;

/// The main error type for the library. Each module has it's own error type that is contained by this error.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Not Found")]
    NotFound,
    #[error("Malformed Frame")]
    MalformedFrame,
    #[error("Timeout")]
    Timeout,
    #[error("Not Configured")]
    NotConfigured,
    #[error("Busy")]
    Busy,
    #[error("Out Of Range")]
    Range,
    #[error("Aborted")]
    Aborted,
    #[error("Configuration Error: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    IsoTPError(#[from] crate::isotp::error::Error),
    #[error(transparent)]
    KefexError(#[from] crate::kefex::Error),
    #[error(transparent)]
    OsyError(#[from] crate::osy::Error),
    #[error(transparent)]
    IpError(#[from] crate::ip::Error),
    #[error(transparent)]
    FlashError(#[from] crate::flash::Error),
}

impl Error {
    /// Reason code supplied by the peer with a negative response.
    pub fn reason_code(&self) -> Option<u8> {
        match self {
            Error::KefexError(e) => e.reason_code(),
            Error::OsyError(e) => e.reason_code(),
            _ => None,
        }
    }

    /// Whether the peer did not answer in time.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout)
    }
}
