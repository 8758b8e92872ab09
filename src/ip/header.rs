//! Address header leading every multiplexed diagnostic message: source and target, each packed
//! as `(bus << 7 | node) + 1` in a big-endian 16 bit field. 0 is never a valid value.

use crate::ip::Error;
use crate::types::{ServerId, MAX_BUS_ID};

pub const ADDRESS_HEADER_LEN: usize = 4;

pub fn encode_address(id: ServerId) -> u16 {
    ((((id.bus & 0x0f) as u16) << 7) | (id.node & 0x7f) as u16) + 1
}

pub fn decode_address(raw: u16) -> Result<ServerId, Error> {
    let value = raw.checked_sub(1).ok_or(Error::MalformedHeader)?;
    let bus = (value >> 7) as u8;
    if bus > MAX_BUS_ID {
        return Err(Error::MalformedHeader);
    }
    Ok(ServerId {
        bus,
        node: (value & 0x7f) as u8,
    })
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AddressHeader {
    pub source: ServerId,
    pub target: ServerId,
}

impl AddressHeader {
    pub fn to_bytes(&self) -> [u8; ADDRESS_HEADER_LEN] {
        let source = encode_address(self.source).to_be_bytes();
        let target = encode_address(self.target).to_be_bytes();
        [source[0], source[1], target[0], target[1]]
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < ADDRESS_HEADER_LEN {
            return Err(Error::MalformedHeader);
        }
        Ok(Self {
            source: decode_address(u16::from_be_bytes([buf[0], buf[1]]))?,
            target: decode_address(u16::from_be_bytes([buf[2], buf[3]]))?,
        })
    }
}
