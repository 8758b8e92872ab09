//! Segmented transfer of variables too large for one frame.
//!
//! Read: the tool starts with its block size, the server answers with a first frame carrying the
//! total size and CRC. The tool then grants blocks of consecutive frames with flow control frames:
//! one after the first frame and one after every `block_size` consecutive frames, except after the
//! last. Consecutive frames carry a sequence counter starting at 0 and wrapping at 256.
//!
//! Write: the tool announces size and CRC, the server grants a block size and a minimum separation
//! time, and is asked for a new grant after every `block_size` consecutive frames except the last.
//! The server confirms the complete transfer with an end frame.

use std::time::Duration;

use tracing::{debug, warn};

use crate::error::Error;
use crate::kefex::constants::{ServiceTag, READ_CF_PAYLOAD, WRITE_CF_PAYLOAD};
use crate::kefex::locks::LockCategory;
use crate::kefex::ssl::crc16;
use crate::kefex::{Error as KefexError, KefexProtocol};
use crate::Result;

/// Progress of a segmented write.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WriteState {
    Idle,
    SentFirstFrame,
    AwaitingFlowControl,
    StreamingBlock,
    Done,
    Failed,
}

/// Grant received from the server during a segmented write.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FlowControl {
    /// Consecutive frames until the next grant. 0 means no further grant is needed.
    pub block_size: u8,
    pub st_min: Duration,
}

fn split_index_size(index: u32, size: usize) -> Result<([u8; 2], [u8; 2])> {
    let index = u16::try_from(index).map_err(|_| Error::Range)?;
    let size = u16::try_from(size).map_err(|_| Error::Range)?;
    Ok((index.to_le_bytes(), size.to_le_bytes()))
}

impl KefexProtocol {
    fn send_read_flow_control(&self, block_size: u8) -> Result<()> {
        self.request(ServiceTag::SegmentedReadFlowControl, &[block_size])
    }

    /// Read a variable of `expected_size` bytes. Fails with [`Error::Busy`] if another segmented
    /// read is in progress.
    pub fn segmented_read(&self, index: u32, expected_size: usize) -> Result<Vec<u8>> {
        let (idx, _) = split_index_size(index, expected_size)?;
        let _guard = self.locks().try_acquire(LockCategory::SegmentedRead)?;
        let block_size = self.settings().block_size;

        self.request(ServiceTag::SegmentedReadStart, &[idx[0], idx[1], block_size])?;
        let first = self.wait_response(ServiceTag::SegmentedReadStart, Some(index))?;
        let header = first.payload();
        if header.len() < 4 {
            return Err(KefexError::MalformedResponse.into());
        }
        let size = u16::from_le_bytes([header[0], header[1]]) as usize;
        let expected_crc = u16::from_le_bytes([header[2], header[3]]);
        if size != expected_size {
            return Err(KefexError::SizeMismatch {
                expected: expected_size,
                actual: size,
            }
            .into());
        }
        debug!("Segmented read of 0x{:04x}: {} bytes, crc 0x{:04x}", index, size, expected_crc);

        let frames = size.div_ceil(READ_CF_PAYLOAD);
        let mut data = Vec::with_capacity(size);
        let mut sequence: u8 = 0;
        let mut in_block = 0;

        if frames > 0 {
            self.send_read_flow_control(block_size)?;
        }

        for frame in 1..=frames {
            let response = self.wait_response(ServiceTag::SegmentedReadConsecutive, None)?;
            let payload = response.payload();
            let (&received, chunk) = payload.split_first().ok_or(KefexError::MalformedResponse)?;
            if received != sequence {
                return Err(KefexError::SequenceMismatch {
                    expected: sequence,
                    actual: received,
                }
                .into());
            }

            let wanted = (size - data.len()).min(READ_CF_PAYLOAD);
            let chunk = chunk.get(..wanted).ok_or(KefexError::MalformedResponse)?;
            data.extend_from_slice(chunk);
            sequence = sequence.wrapping_add(1);

            in_block += 1;
            if in_block == block_size && frame < frames {
                self.send_read_flow_control(block_size)?;
                in_block = 0;
            }
        }

        let actual = crc16(&data);
        if actual != expected_crc {
            return Err(KefexError::ChecksumMismatch {
                expected: expected_crc,
                actual,
            }
            .into());
        }
        Ok(data)
    }

    fn wait_write_flow_control(&self) -> Result<FlowControl> {
        let response = self.wait_response(ServiceTag::SegmentedWriteFlowControl, None)?;
        match response.payload() {
            [block_size, st_min, ..] => Ok(FlowControl {
                block_size: *block_size,
                st_min: Duration::from_millis(*st_min as u64),
            }),
            _ => Err(KefexError::MalformedResponse.into()),
        }
    }

    /// Write a variable. Fails with [`Error::Busy`] if another segmented write is in progress.
    pub fn segmented_write(&self, index: u32, data: &[u8]) -> Result<()> {
        let (idx, size) = split_index_size(index, data.len())?;
        let _guard = self.locks().try_acquire(LockCategory::SegmentedWrite)?;

        let mut state = WriteState::Idle;
        let result = self.run_segmented_write(index, idx, size, data, &mut state);
        if let Err(e) = &result {
            warn!("Segmented write of 0x{:04x} failed in state {:?}: {}", index, state, e);
            state = WriteState::Failed;
        }
        self.set_write_state(state);
        result
    }

    fn run_segmented_write(
        &self,
        index: u32,
        idx: [u8; 2],
        size: [u8; 2],
        data: &[u8],
        state: &mut WriteState,
    ) -> Result<()> {
        let crc = crc16(data).to_le_bytes();

        self.request(
            ServiceTag::SegmentedWriteStart,
            &[idx[0], idx[1], size[0], size[1], crc[0], crc[1]],
        )?;
        *state = WriteState::SentFirstFrame;

        *state = WriteState::AwaitingFlowControl;
        let mut flow_control = self.wait_write_flow_control()?;
        let mut in_block = 0;

        for (sequence, chunk) in data.chunks(WRITE_CF_PAYLOAD).enumerate() {
            if flow_control.block_size != 0 && in_block == flow_control.block_size {
                *state = WriteState::AwaitingFlowControl;
                flow_control = self.wait_write_flow_control()?;
                in_block = 0;
            }
            *state = WriteState::StreamingBlock;

            if sequence > 0 {
                if flow_control.st_min.is_zero() {
                    std::thread::yield_now();
                } else {
                    std::thread::sleep(flow_control.st_min);
                }
            }

            let mut payload = vec![sequence as u8];
            payload.extend(chunk);
            self.request(ServiceTag::SegmentedWriteConsecutive, &payload)?;
            in_block += 1;
        }

        let end = self.wait_response(ServiceTag::SegmentedWriteEnd, Some(index))?;
        if end.payload() != size {
            return Err(KefexError::SizeMismatch {
                expected: u16::from_le_bytes(size) as usize,
                actual: end.value_u16() as usize,
            }
            .into());
        }
        *state = WriteState::Done;
        Ok(())
    }
}
