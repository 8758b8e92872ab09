//! Addressing and identity types shared by all protocol layers.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::Result;

pub const MAX_BUS_ID: u8 = 15;
pub const MAX_NODE_ID: u8 = 126;
/// Node identifier reserved for broadcasts.
pub const BROADCAST_NODE: u8 = 127;

/// (bus, node) pair identifying a diagnostic target.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerId {
    pub bus: u8,
    pub node: u8,
}

impl ServerId {
    pub fn new(bus: u8, node: u8) -> Result<Self> {
        if bus > MAX_BUS_ID || node > MAX_NODE_ID {
            return Err(Error::Range);
        }
        Ok(Self { bus, node })
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.bus, self.node)
    }
}

const SERIAL_FORMAT_POS: u8 = 0;
const SERIAL_FORMAT_ASCII: u8 = 1;

/// Stable device identity used while a device has no usable node id yet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SerialNumber {
    /// Six BCD encoded bytes.
    Pos([u8; 6]),
    /// Variable length serial number in a manufacturer specific format.
    Extended { manufacturer_format: u8, bytes: Vec<u8> },
}

impl SerialNumber {
    /// Wire encoding `[format, len, bytes...]`, format 0 being the POS form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let (format, bytes) = match self {
            SerialNumber::Pos(b) => (SERIAL_FORMAT_POS, &b[..]),
            SerialNumber::Extended {
                manufacturer_format,
                bytes,
            } => (*manufacturer_format, &bytes[..]),
        };
        let mut buf = vec![format, bytes.len() as u8];
        buf.extend(bytes);
        buf
    }

    /// Parse the wire encoding. Returns the serial number and the number of bytes consumed.
    pub fn from_bytes(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < 2 {
            return Err(Error::MalformedFrame);
        }
        let format = buf[0];
        let len = buf[1] as usize;
        let bytes = buf.get(2..2 + len).ok_or(Error::MalformedFrame)?;

        let serial = if format == SERIAL_FORMAT_POS {
            let pos: [u8; 6] = bytes.try_into().map_err(|_| Error::MalformedFrame)?;
            SerialNumber::Pos(pos)
        } else {
            if bytes.is_empty() || bytes.len() > 29 {
                return Err(Error::MalformedFrame);
            }
            SerialNumber::Extended {
                manufacturer_format: format,
                bytes: bytes.to_vec(),
            }
        };
        Ok((serial, 2 + len))
    }

    pub fn is_pos(&self) -> bool {
        matches!(self, SerialNumber::Pos(_))
    }
}

impl fmt::Display for SerialNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SerialNumber::Pos(b) => {
                let digits = hex::encode(b);
                write!(f, "{}.{}.{}", &digits[0..2], &digits[2..8], &digits[8..12])
            }
            SerialNumber::Extended {
                manufacturer_format: SERIAL_FORMAT_ASCII,
                bytes,
            } => write!(f, "{}", String::from_utf8_lossy(bytes)),
            SerialNumber::Extended { bytes, .. } => write!(f, "{}", hex::encode(bytes)),
        }
    }
}
