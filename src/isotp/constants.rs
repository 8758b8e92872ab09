use strum_macros::FromRepr;

/// Protocol control information carried in the upper nibble of the first byte.
#[derive(Debug, PartialEq, Copy, Clone, FromRepr)]
#[repr(u8)]
pub enum FrameType {
    Single = 0x00,
    First = 0x10,
    Consecutive = 0x20,
    FlowControl = 0x30,
}

impl FrameType {
    pub fn of(pci: u8) -> Option<FrameType> {
        FrameType::from_repr(pci & 0xf0)
    }
}

/// Largest message a classic (non FD) ISO-TP transfer can carry.
pub const MAX_MESSAGE_LEN: usize = 4095;

#[derive(Debug, PartialEq, Copy, Clone, FromRepr)]
#[repr(u8)]
pub enum FlowStatus {
    ContinueToSend = 0x0,
    Wait = 0x1,
    Overflow = 0x2,
}
