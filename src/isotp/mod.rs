//! ISO Transport Protocol (ISO-TP) implementation, implements ISO 15765-2
//! ## Example:
//! ```rust,no_run
//! fn isotp_example(dispatcher: ecu_flash::can::SharedCanDispatcher) -> ecu_flash::Result<()> {
//!    let config = ecu_flash::isotp::IsoTpConfig::new(0, ecu_flash::can::Identifier::Standard(0x7a1));
//!    let mut isotp = ecu_flash::isotp::IsoTpChannel::new(dispatcher, config)?;
//!
//!    isotp.send(&[0x3e, 0x00])?;
//!    let response = isotp.recv()?;
//!    Ok(())
//! }
//! ```

pub mod constants;
pub mod error;
pub mod types;

use crate::can::{ClientHandle, Frame, Identifier, RxFilter, SharedCanDispatcher};
use crate::isotp::constants::{FlowStatus, FrameType, MAX_MESSAGE_LEN};
use crate::isotp::types::FlowControlConfig;
use crate::poll::{poll_until, poll_with_deadline, Deadline};
use crate::Result;

use tracing::debug;

const DEFAULT_TIMEOUT_MS: u64 = 100;

/// Configuration of an [`IsoTpChannel`].
#[derive(Debug, Copy, Clone)]
pub struct IsoTpConfig {
    pub bus: u8,
    /// Transmit ID
    pub tx_id: Identifier,
    /// Receive ID
    pub rx_id: Identifier,
    /// Transmit Data Length
    pub tx_dl: usize,
    /// Padding byte (0x00, or more efficient 0xAA)
    pub padding: u8,
    /// Max timeout for receiving a frame
    pub timeout: std::time::Duration,
}

impl IsoTpConfig {
    pub fn new(bus: u8, id: Identifier) -> Self {
        let tx_id = id;
        let rx_id = match id {
            Identifier::Standard(id) => Identifier::Standard(id + 8),
            Identifier::Extended(id) => {
                let bytes = id.to_be_bytes();
                let id = u32::from_be_bytes([bytes[0], bytes[1], bytes[3], bytes[2]]); // Swap last two bytes
                Identifier::Extended(id)
            }
        };

        Self {
            bus,
            tx_id,
            rx_id,
            tx_dl: 8,
            padding: 0xaa,
            timeout: std::time::Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }
}

/// Build a padded single frame. Used for functional requests that never span several frames.
pub fn single_frame(config: &IsoTpConfig, id: Identifier, data: &[u8]) -> Result<Frame> {
    if data.len() > config.tx_dl - 1 {
        return Err(crate::isotp::error::Error::DataTooLarge(data.len()).into());
    }
    let mut buf = vec![FrameType::Single as u8 | data.len() as u8];
    buf.extend(data);
    buf.resize(config.tx_dl, config.padding);
    Frame::new(config.bus, id, &buf)
}

/// Parse a single frame, returning its payload.
pub fn parse_single_frame(frame: &Frame) -> Result<Vec<u8>> {
    let first = *frame.data.first().ok_or(crate::isotp::error::Error::MalformedFrame)?;
    if FrameType::of(first) != Some(FrameType::Single) {
        return Err(crate::isotp::error::Error::UnknownFrameType(first).into());
    }
    let len = (first & 0xf) as usize;
    if len == 0 || frame.data.len() < len + 1 {
        return Err(crate::isotp::error::Error::MalformedFrame.into());
    }
    Ok(frame.data[1..len + 1].to_vec())
}

struct Reassembly {
    buf: Vec<u8>,
    len: usize,
    idx: u8,
}

/// ISO-TP channel on a shared dispatcher. CAN-FD ISO-TP is currently not supported.
///
/// Receiving is driven by [`IsoTpChannel::poll`], which pulls frames from the dispatcher and returns
/// a message once it is complete.
pub struct IsoTpChannel {
    dispatcher: SharedCanDispatcher,
    client: ClientHandle,
    config: IsoTpConfig,
    rx: Option<Reassembly>,
}

impl IsoTpChannel {
    pub fn new(dispatcher: SharedCanDispatcher, config: IsoTpConfig) -> Result<Self> {
        let client = {
            let mut d = dispatcher.lock();
            let client = d.register_client();
            d.set_rx_filter(client, Some(RxFilter::exact(config.rx_id)))?;
            client
        };
        Ok(Self {
            dispatcher,
            client,
            config,
            rx: None,
        })
    }

    pub fn config(&self) -> &IsoTpConfig {
        &self.config
    }

    fn pad(&self, data: &mut Vec<u8>) {
        data.resize(self.config.tx_dl, self.config.padding);
    }

    fn send_frame(&self, buf: &[u8]) -> Result<()> {
        let frame = Frame::new(self.config.bus, self.config.tx_id, buf)?;
        self.dispatcher.lock().send(&frame)
    }

    fn next_frame(&self) -> Result<Option<Frame>> {
        let mut dispatcher = self.dispatcher.lock();
        if let Some(frame) = dispatcher.read_from_queue(self.client)? {
            return Ok(Some(frame));
        }
        dispatcher.dispatch_incoming()?;
        dispatcher.read_from_queue(self.client)
    }

    fn send_single_frame(&self, data: &[u8]) -> Result<()> {
        let frame = single_frame(&self.config, self.config.tx_id, data)?;
        debug!("TX SF, length: {} data {}", data.len(), hex::encode(&frame.data));
        self.dispatcher.lock().send(&frame)
    }

    fn send_first_frame(&self, data: &[u8]) -> Result<()> {
        let b0: u8 = FrameType::First as u8 | ((data.len() >> 8) & 0xF) as u8;
        let b1: u8 = (data.len() & 0xFF) as u8;

        let mut buf = vec![b0, b1];
        buf.extend(&data[..self.config.tx_dl - 2]);

        debug!("TX FF, length: {} data {}", data.len(), hex::encode(&buf));
        self.send_frame(&buf)
    }

    fn send_consecutive_frame(&self, data: &[u8], idx: usize) -> Result<()> {
        let idx = ((idx + 1) & 0xF) as u8;

        let mut buf = vec![FrameType::Consecutive as u8 | idx];
        buf.extend(data);
        self.pad(&mut buf);

        debug!("TX CF, idx: {} data {}", idx, hex::encode(&buf));
        self.send_frame(&buf)
    }

    /// Wait for a flow control frame that allows sending. Wait frames restart the timeout.
    fn wait_flow_control(&mut self) -> Result<FlowControlConfig> {
        let timeout = self.config.timeout;
        let mut deadline = Deadline::after(timeout);
        poll_with_deadline(&mut deadline, |deadline| {
            while let Some(frame) = self.next_frame()? {
                if frame.data.first().and_then(|b| FrameType::of(*b)) != Some(FrameType::FlowControl) {
                    debug!("Ignoring {:?} while waiting for flow control", frame);
                    continue;
                }
                debug!("RX FC, data {}", hex::encode(&frame.data));
                let fc = FlowControlConfig::try_from(&frame)?;
                match fc.status {
                    FlowStatus::ContinueToSend => return Ok(Some(fc)),
                    FlowStatus::Wait => deadline.reset(timeout),
                    FlowStatus::Overflow => return Err(crate::isotp::error::Error::Overflow.into()),
                }
            }
            Ok(None)
        })
    }

    fn send_multiple(&mut self, data: &[u8]) -> Result<()> {
        self.send_first_frame(data)?;
        let mut fc = self.wait_flow_control()?;
        let mut in_block = 0;

        let chunks = data[self.config.tx_dl - 2..].chunks(self.config.tx_dl - 1);
        for (idx, chunk) in chunks.enumerate() {
            if fc.block_size != 0 && in_block == fc.block_size {
                fc = self.wait_flow_control()?;
                in_block = 0;
            }
            if idx > 0 && !fc.separation_time_min.is_zero() {
                std::thread::sleep(fc.separation_time_min);
            }
            self.send_consecutive_frame(chunk, idx)?;
            in_block += 1;
        }

        Ok(())
    }

    /// Send an ISO-TP message of up to 4095 bytes. Returns [`crate::Error::Timeout`] if the ECU is not
    /// responding in time with flow control messages.
    pub fn send(&mut self, data: &[u8]) -> Result<()> {
        debug!("TX {}", hex::encode(data));

        if data.len() <= self.config.tx_dl - 1 {
            self.send_single_frame(data)
        } else if data.len() <= MAX_MESSAGE_LEN {
            self.send_multiple(data)
        } else {
            Err(crate::isotp::error::Error::DataTooLarge(data.len()).into())
        }
    }

    fn recv_first_frame(&mut self, frame: &Frame) -> Result<()> {
        if frame.data.len() < self.config.tx_dl {
            return Err(crate::isotp::error::Error::MalformedFrame.into());
        }
        let b0 = frame.data[0] as u16;
        let b1 = frame.data[1] as u16;
        let len = ((b0 << 8 | b1) & 0xFFF) as usize;

        debug!("RX FF, length: {}, data {}", len, hex::encode(&frame.data));

        self.rx = Some(Reassembly {
            buf: frame.data[2..].to_vec(),
            len,
            idx: 1,
        });

        // Send Flow Control
        let mut flow_control = vec![0x30, 0x00, 0x00];
        self.pad(&mut flow_control);

        debug!("TX FC, data {}", hex::encode(&flow_control));
        self.send_frame(&flow_control)
    }

    fn recv_consecutive_frame(&mut self, frame: &Frame) -> Result<Option<Vec<u8>>> {
        let Some(rx) = self.rx.as_mut() else {
            debug!("Ignoring CF without FF {}", hex::encode(&frame.data));
            return Ok(None);
        };

        let msg_idx = frame.data[0] & 0xF;
        if msg_idx != rx.idx {
            let expected = rx.idx;
            self.rx = None;
            return Err(crate::isotp::error::Error::OutOfOrder {
                expected,
                actual: msg_idx,
            }
            .into());
        }
        rx.idx = if rx.idx == 0xF { 0 } else { rx.idx + 1 };

        let remaining_len = rx.len - rx.buf.len();
        let end_idx = std::cmp::min(remaining_len + 1, frame.data.len());
        rx.buf.extend(&frame.data[1..end_idx]);
        debug!("RX CF, idx: {}, data {}", msg_idx, hex::encode(&frame.data));

        if rx.buf.len() >= rx.len {
            return Ok(self.rx.take().map(|rx| rx.buf));
        }
        Ok(None)
    }

    fn handle_frame(&mut self, frame: &Frame) -> Result<Option<Vec<u8>>> {
        let first = *frame.data.first().ok_or(crate::isotp::error::Error::MalformedFrame)?;
        match FrameType::of(first) {
            Some(FrameType::Single) => {
                self.rx = None;
                let data = parse_single_frame(frame)?;
                debug!("RX SF, length: {} data {}", data.len(), hex::encode(&frame.data));
                Ok(Some(data))
            }
            Some(FrameType::First) => {
                self.recv_first_frame(frame)?;
                Ok(None)
            }
            Some(FrameType::Consecutive) => self.recv_consecutive_frame(frame),
            Some(FrameType::FlowControl) => Ok(None),
            None => Err(crate::isotp::error::Error::UnknownFrameType(first).into()),
        }
    }

    /// Process everything received so far. Returns a message as soon as one is complete.
    pub fn poll(&mut self) -> Result<Option<Vec<u8>>> {
        while let Some(frame) = self.next_frame()? {
            if let Some(message) = self.handle_frame(&frame)? {
                return Ok(Some(message));
            }
        }
        Ok(None)
    }

    /// Receive one message. Returns [`crate::Error::Timeout`] if none completes within the timeout.
    pub fn recv(&mut self) -> Result<Vec<u8>> {
        poll_until(self.config.timeout, || self.poll())
    }

    /// Drop queued frames and any partially received message.
    pub fn flush(&mut self) -> Result<()> {
        self.rx = None;
        self.dispatcher.lock().clear_rx_queue(self.client)
    }
}

impl Drop for IsoTpChannel {
    fn drop(&mut self) {
        self.dispatcher.lock().remove_client(self.client);
    }
}
