//! Service tags and response layouts of the legacy bus protocol.
use strum_macros::{EnumIter, FromRepr};

/// Bit 7 of the response tag byte flags an error response.
pub const ERROR_BIT: u8 = 0x80;
pub const TAG_MASK: u8 = 0x7f;

/// Payload bytes of a consecutive frame on the read path (`[tag, seq, data...]`).
pub const READ_CF_PAYLOAD: usize = 6;
/// Payload bytes of a consecutive frame on the write path (`[server, tag, seq, data...]`).
pub const WRITE_CF_PAYLOAD: usize = 5;

/// Highest request identifier. Responses use the next identifier, which must stay 11 bit.
pub const MAX_BASE_ID: u32 = 0x7fe;

#[derive(Debug, PartialEq, Eq, Copy, Clone, FromRepr, EnumIter)]
#[repr(u8)]
pub enum ServiceTag {
    SingleRead = 0x01,
    ImmediateWrite = 0x02,
    TimerCyclicRegister = 0x03,
    ChangeCyclicRegister = 0x04,
    AbortIndividual = 0x05,
    AbortAll = 0x06,
    Logon = 0x07,
    Logoff = 0x08,
    UpdateTask = 0x09,
    EepromRead = 0x0a,
    WriteByte = 0x0b,
    WriteWord = 0x0c,
    SslStart = 0x0d,
    SslEnd = 0x0e,
    SegmentedReadStart = 0x10,
    SegmentedReadConsecutive = 0x11,
    SegmentedReadFlowControl = 0x12,
    SegmentedWriteStart = 0x13,
    SegmentedWriteFlowControl = 0x14,
    SegmentedWriteConsecutive = 0x15,
    SegmentedWriteEnd = 0x16,
    CyclicTimestamped = 0x1e,
    Cyclic = 0x1f,
}

impl ServiceTag {
    /// Cyclic transmissions bypass the response slot.
    pub fn is_cyclic(&self) -> bool {
        matches!(self, ServiceTag::Cyclic | ServiceTag::CyclicTimestamped)
    }
}

/// How the bytes after the index are interpreted.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum PayloadKind {
    None,
    /// 16 bit little endian value
    Pair,
    /// 32 bit little endian value
    Quad,
    /// Raw bytes, at most the given count
    Raw(usize),
}

/// Response byte layout of one service tag.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct Layout {
    /// Number of little endian index/address bytes following the tag byte
    pub index_width: usize,
    pub payload: PayloadKind,
}

const fn layout(index_width: usize, payload: PayloadKind) -> Layout {
    Layout { index_width, payload }
}

/// Fixed per-tag response table.
pub fn response_layout(tag: ServiceTag) -> Layout {
    use PayloadKind::*;
    use ServiceTag::*;
    match tag {
        SingleRead => layout(2, Quad),
        ImmediateWrite | TimerCyclicRegister | ChangeCyclicRegister | AbortIndividual => layout(2, None),
        AbortAll | Logoff => layout(0, None),
        Logon => layout(0, Pair),
        UpdateTask => layout(0, Raw(3)),
        EepromRead => layout(4, Raw(2)),
        WriteByte => layout(4, Raw(1)),
        WriteWord => layout(4, Pair),
        SslStart => layout(0, Pair),
        SslEnd => layout(0, Raw(4)),
        SegmentedReadStart => layout(2, Raw(4)),
        SegmentedReadConsecutive => layout(0, Raw(7)),
        SegmentedWriteFlowControl => layout(0, Raw(2)),
        SegmentedWriteEnd => layout(2, Pair),
        CyclicTimestamped => layout(2, Raw(4)),
        Cyclic => layout(2, Quad),
        // Request-only tags, never answered with their own tag
        SegmentedReadFlowControl | SegmentedWriteStart | SegmentedWriteConsecutive => layout(0, Raw(7)),
    }
}

/// Error codes reported in error responses.
#[derive(Debug, PartialEq, Eq, Copy, Clone, FromRepr)]
#[repr(u8)]
pub enum ErrorCode {
    UnknownIndex = 0x01,
    AccessDenied = 0x02,
    OutOfRange = 0x03,
    NotLoggedOn = 0x04,
    Busy = 0x05,
    ChecksumError = 0x06,
    SequenceError = 0x07,
    OutOfMemory = 0x08,
}

/// Static defaults of the communication parameters: (name, min, max, default).
pub static DEFAULT_PARAMETERS: &[(&str, i64, i64, i64)] = &[
    ("BaseID", 0, MAX_BASE_ID as i64, 0x600),
    ("ClientAddress", 0, 127, 0),
    ("ServerAddress", 0, 127, 1),
    ("Timeout", 10, 60000, 200),
    ("BlockSize", 1, 255, 20),
    ("Bus", 0, 15, 0),
];
