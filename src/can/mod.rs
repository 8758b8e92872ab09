//! Classic CAN frames and the adapter boundary. Everything above this module is hardware agnostic.

pub mod dispatcher;

use std::fmt;

pub use dispatcher::{AdapterDispatcher, CanDispatcher, ClientHandle, RxFilter, SharedCanDispatcher};

use crate::error::Error;

/// Maximum payload of a classic CAN frame.
pub const MAX_DLC: usize = 8;

/// Arbitration identifier. Standard identifiers win arbitration against extended ones, which the
/// derived ordering reflects.
#[derive(Copy, Clone, PartialOrd, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Identifier {
    Standard(u32),
    Extended(u32),
}

impl Identifier {
    pub fn is_extended(&self) -> bool {
        matches!(self, Identifier::Extended(_))
    }

    /// Numeric value without the format flag.
    pub fn raw(&self) -> u32 {
        match *self {
            Identifier::Standard(id) | Identifier::Extended(id) => id,
        }
    }

    fn fits(&self) -> bool {
        match *self {
            Identifier::Standard(id) => id <= 0x7ff,
            Identifier::Extended(id) => id <= 0x1fff_ffff,
        }
    }
}

impl fmt::Debug for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identifier::Standard(id) => write!(f, "0x{:03x}", id),
            Identifier::Extended(id) => write!(f, "0x{:08x}x", id),
        }
    }
}

/// Values that fit 11 bits become standard identifiers.
impl From<u32> for Identifier {
    fn from(id: u32) -> Identifier {
        match id {
            0..=0x7ff => Identifier::Standard(id),
            _ => Identifier::Extended(id),
        }
    }
}

impl From<Identifier> for u32 {
    fn from(id: Identifier) -> u32 {
        id.raw()
    }
}

/// A classic CAN frame. Constructed per send call and never modified afterwards.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    /// Adapter channel the frame was seen on or goes out on
    pub bus: u8,
    pub id: Identifier,
    /// 0 to 8 bytes
    pub data: Vec<u8>,
    /// Set on frames the adapter reports back after sending them
    pub loopback: bool,
}

impl Frame {
    pub fn new(bus: u8, id: Identifier, data: &[u8]) -> Result<Frame, Error> {
        if data.len() > MAX_DLC || !id.fits() {
            return Err(Error::MalformedFrame);
        }
        Ok(Frame {
            bus,
            id,
            data: data.to_vec(),
            loopback: false,
        })
    }

    /// Data length code. Equal to the payload length for classic CAN.
    pub fn dlc(&self) -> u8 {
        self.data.len() as u8
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:?}#{}", self.bus, self.id, hex::encode(&self.data))?;
        if self.loopback {
            write!(f, " (echo)")?;
        }
        Ok(())
    }
}

/// Trait for a non-blocking CAN adapter. This is the boundary to the hardware binding.
pub trait CanAdapter {
    /// Hand frames over to the hardware. Must not block.
    fn send(&mut self, frames: &[Frame]) -> Result<(), Error>;
    /// Return all frames received since the last call, possibly none.
    fn recv(&mut self) -> Result<Vec<Frame>, Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_before_extended() {
        assert!(Identifier::Standard(0x123) < Identifier::Standard(0x124));
        assert!(Identifier::Extended(0x1) > Identifier::Standard(0x7ff));
        assert_eq!(Identifier::from(0x7ff), Identifier::Standard(0x7ff));
        assert_eq!(Identifier::from(0x800), Identifier::Extended(0x800));
    }

    #[test]
    fn frame_rejects_fd_payload() {
        assert!(Frame::new(0, 0x123.into(), &[0u8; 8]).is_ok());
        assert!(matches!(
            Frame::new(0, 0x123.into(), &[0u8; 12]),
            Err(crate::Error::MalformedFrame)
        ));
        assert!(matches!(
            Frame::new(0, Identifier::Standard(0x800), &[]),
            Err(crate::Error::MalformedFrame)
        ));
        assert!(Frame::new(0, Identifier::Extended(0x2000_0000), &[]).is_err());
    }
}
