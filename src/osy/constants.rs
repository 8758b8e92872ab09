//! Constants of the modern diagnostic protocol: the ISO 14229 services the flashloader implements plus
//! its manufacturer specific services, routines and data identifiers.
use strum_macros::{EnumIter, FromRepr};

pub const POSITIVE_RESPONSE: u8 = 0x40;
pub const NEGATIVE_RESPONSE: u8 = 0x7f;
/// Bit 7 of a sub function asks the server not to send a positive response.
pub const SUPPRESS_POSITIVE_RESPONSE: u8 = 0x80;

/// Node id the tool uses on every bus.
pub const DEFAULT_TESTER_NODE: u8 = 126;

/// Physical request identifier base, `| target << 8 | source`.
pub const PHYSICAL_ID_BASE: u32 = 0x18da_0000;
/// Functional request identifier base, `| source`.
pub const FUNCTIONAL_ID_BASE: u32 = 0x18db_ff00;

/// Service Identifiers (SIDs) as defined in ISO 14229, and the manufacturer specific ones
#[derive(Debug, PartialEq, Copy, Clone, FromRepr)]
#[repr(u8)]
pub enum ServiceIdentifier {
    // Diagnostic and Communication Management
    DiagnosticSessionControl = 0x10,
    EcuReset = 0x11,
    SecurityAccess = 0x27,
    TesterPresent = 0x3e,

    // Data Transmission
    ReadDataByIdentifier = 0x22,
    WriteDataByIdentifier = 0x2e,
    WriteMemoryByAddress = 0x3d,

    // Routine
    RoutineControl = 0x31,

    // Upload/Download
    RequestDownload = 0x34,
    TransferData = 0x36,
    RequestTransferExit = 0x37,
    RequestFileTransfer = 0x38,

    // Manufacturer specific
    ReadSerialNumberBroadcast = 0xba,
    SetNodeIdBroadcastPart1 = 0xbb,
    SetNodeIdBroadcastPart2 = 0xbc,
    SendCanMessage = 0xbf,

    NegativeResponse = 0x7f,
}

/// Unsolicited message carrying a CAN frame received by a gateway with an active tunnel.
pub const EVENT_TUNNELED_CAN_MESSAGE: u8 = 0xf7;

/// Data Identifiers (DIDs) the flashloader supports
#[derive(Debug, PartialEq, Copy, Clone, EnumIter)]
#[repr(u16)]
pub enum DataIdentifier {
    FlashloaderVersion = 0xf180,
    ApplicationSoftwareFingerprint = 0xf184,
    EcuSerialNumber = 0xf18c,
    HardwareVersion = 0xf193,
    EcuSerialNumberExtended = 0xf012,
    DeviceName = 0xa800,
    FlashCount = 0xa801,
    ProtocolVersion = 0xa802,
    ArticleNumber = 0xa803,
    FlashloaderFeatures = 0xa804,
    MaxBlockLength = 0xa805,
}

/// Diagnostic Session Type Sub-Function ID
#[derive(Debug, PartialEq, Copy, Clone)]
#[repr(u8)]
pub enum SessionType {
    Default = 0x01,
    Programming = 0x02,
    ExtendedDiagnostic = 0x03,
    /// Manufacturer specific session the flashloader must be in before switching to programming
    PreProgramming = 0x60,
}

/// ECU Reset Sub-Function ID as defined in ISO 14229
#[derive(Debug, PartialEq, Copy, Clone)]
#[repr(u8)]
pub enum ResetType {
    /// Simulates power-on/start-up sequence after a power loss
    HardReset = 0x01,
    /// Simulates the driver turning the key off and then on again
    KeyOffOnReset = 0x02,
    /// Restart the application software
    SoftReset = 0x03,
    /// Reset into the flashloader (manufacturer specific)
    ResetToFlashloader = 0x60,
}

/// Security Access Type Sub-Function ID. Odd levels request a seed, the next even level sends the key.
#[derive(Debug, PartialEq, Copy, Clone)]
#[repr(u8)]
pub enum SecurityAccessType {
    RequestSeed = 0x01,
    SendKey = 0x02,
    RequestSeedProgramming = 0x07,
    SendKeyProgramming = 0x08,
}

/// Routine Control Sub-Function ID as defined in ISO 14229
#[derive(Debug, PartialEq, Copy, Clone)]
#[repr(u8)]
pub enum RoutineControlType {
    Start = 0x01,
    Stop = 0x02,
    RequestResults = 0x03,
}

/// Routines of the flashloader
#[derive(Debug, PartialEq, Copy, Clone)]
#[repr(u16)]
pub enum RoutineIdentifier {
    RequestProgramming = 0x0203,
    Routing = 0x0206,
    CanTunnel = 0x0215,
    SecurityDebuggerActivation = 0x0218,
    EraseMemory = 0xff00,
}

/// Mode of operation of RequestFileTransfer (0x38)
#[derive(Debug, PartialEq, Copy, Clone)]
#[repr(u8)]
pub enum FileTransferMode {
    AddFile = 0x01,
    ReplaceFile = 0x03,
}
