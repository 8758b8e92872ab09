use std::time::Duration;

use crate::can::Frame;
use crate::isotp::constants::FlowStatus;
use crate::isotp::error::Error;

/// Parameters announced by the receiver in a flow control frame.
#[derive(Debug, Copy, Clone)]
pub struct FlowControlConfig {
    pub status: FlowStatus,
    /// Consecutive frames until the next flow control, 0 for no limit
    pub block_size: u8,
    pub separation_time_min: Duration,
}

/// STmin encodes milliseconds up to 0x7f and 100 us steps in 0xf1..=0xf9.
fn separation_time(raw: u8) -> Option<Duration> {
    match raw {
        0x00..=0x7f => Some(Duration::from_millis(raw.into())),
        0xf1..=0xf9 => Some(Duration::from_micros(u64::from(raw - 0xf0) * 100)),
        _ => None,
    }
}

impl TryFrom<&Frame> for FlowControlConfig {
    type Error = crate::error::Error;
    fn try_from(frame: &Frame) -> Result<Self, Self::Error> {
        let [pci, block_size, st_min, ..] = frame.data[..] else {
            return Err(Error::MalformedFrame.into());
        };
        let status = FlowStatus::from_repr(pci & 0x0f).ok_or(Error::MalformedFrame)?;
        let separation_time_min = separation_time(st_min).ok_or(Error::MalformedFrame)?;

        Ok(Self {
            status,
            block_size,
            separation_time_min,
        })
    }
}
