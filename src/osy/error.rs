macro_rules! response_codes {
    ($($name:ident = $value:literal,)*) => {
        /// Reason codes of a negative response. Codes outside the table are kept as `Other`.
        #[derive(Debug, Copy, Clone, Eq, PartialEq)]
        pub enum NegativeResponseCode {
            $($name,)*
            Other(u8),
        }

        impl From<u8> for NegativeResponseCode {
            fn from(value: u8) -> Self {
                match value {
                    $($value => Self::$name,)*
                    other => Self::Other(other),
                }
            }
        }

        impl From<NegativeResponseCode> for u8 {
            fn from(code: NegativeResponseCode) -> u8 {
                match code {
                    $(NegativeResponseCode::$name => $value,)*
                    NegativeResponseCode::Other(value) => value,
                }
            }
        }
    };
}

response_codes! {
    GeneralReject = 0x10,
    ServiceNotSupported = 0x11,
    SubFunctionNotSupported = 0x12,
    IncorrectMessageLengthOrInvalidFormat = 0x13,
    ResponseTooLong = 0x14,
    BusyRepeatRequest = 0x21,
    ConditionsNotCorrect = 0x22,
    RequestSequenceError = 0x24,
    RequestOutOfRange = 0x31,
    SecurityAccessDenied = 0x33,
    InvalidKey = 0x35,
    ExceededNumberOfAttempts = 0x36,
    RequiredTimeDelayNotExpired = 0x37,
    UploadDownloadNotAccepted = 0x70,
    TransferDataSuspended = 0x71,
    GeneralProgrammingFailure = 0x72,
    WrongBlockSequenceCounter = 0x73,
    RequestCorrectlyReceivedResponsePending = 0x78,
    SubFunctionNotSupportedInActiveSession = 0x7e,
    ServiceNotSupportedInActiveSession = 0x7f,
}

/// Failures reported by the flashloader protocol.
#[derive(thiserror::Error, Debug, Copy, Clone, Eq, PartialEq)]
pub enum Error {
    #[error("Unexpected Service ID in response: 0x{0:02x}")]
    InvalidServiceId(u8),
    #[error("Unexpected Sub Function in response: 0x{0:02x}")]
    InvalidSubFunction(u8),
    #[error("Unexpected Data Identifier in response: 0x{0:04x}")]
    InvalidDataIdentifier(u16),
    #[error("Response too short")]
    InvalidResponseLength,
    #[error("Block Sequence Counter {0} not echoed")]
    InvalidBlockSequenceCounter(u8),
    #[error("Negative Response: {0:?}")]
    NegativeResponse(NegativeResponseCode),
}

impl Error {
    /// Reason code reported by the server, if this is a negative response.
    pub fn reason_code(&self) -> Option<u8> {
        match self {
            Error::NegativeResponse(code) => Some((*code).into()),
            _ => None,
        }
    }
}
