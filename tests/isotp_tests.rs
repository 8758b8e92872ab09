mod common;

use std::collections::VecDeque;
use std::sync::Arc;

use ecu_flash::can::{AdapterDispatcher, CanAdapter, Frame, Identifier, SharedCanDispatcher};
use ecu_flash::isotp::{IsoTpChannel, IsoTpConfig};
use parking_lot::Mutex;

use common::init_logging;

const REQUEST_ID: u32 = 0x7a1;
const RESPONSE_ID: u32 = 0x7a9;

struct Reassembly {
    len: usize,
    buf: Vec<u8>,
    in_block: u8,
}

/// ECU echoing every ISO-TP message back, with configurable flow control.
struct EchoEcu {
    block_size: u8,
    /// Flow control frames with status "wait" sent before each "continue to send"
    wait_frames: usize,
    rx: Option<Reassembly>,
    tx: Option<Vec<u8>>,
    pending: VecDeque<Frame>,
    received: Arc<Mutex<Vec<Frame>>>,
}

impl EchoEcu {
    fn reply(&mut self, mut data: Vec<u8>) {
        data.resize(8, 0xaa);
        self.pending
            .push_back(Frame::new(0, Identifier::Standard(RESPONSE_ID), &data).unwrap());
    }

    fn flow_control(&mut self) {
        for _ in 0..self.wait_frames {
            self.reply(vec![0x31, 0x00, 0x00]);
        }
        self.reply(vec![0x30, self.block_size, 0x00]);
    }

    fn echo(&mut self, data: Vec<u8>) {
        if data.len() <= 7 {
            let mut frame = vec![data.len() as u8];
            frame.extend(&data);
            self.reply(frame);
        } else {
            let mut frame = vec![0x10 | (data.len() >> 8) as u8, data.len() as u8];
            frame.extend(&data[..6]);
            self.reply(frame);
            self.tx = Some(data);
        }
    }

    fn handle(&mut self, frame: &Frame) {
        if frame.id != Identifier::Standard(REQUEST_ID) {
            return;
        }
        let data = &frame.data;
        match data[0] & 0xf0 {
            0x00 => {
                let len = (data[0] & 0x0f) as usize;
                self.echo(data[1..1 + len].to_vec());
            }
            0x10 => {
                let len = ((data[0] as usize & 0x0f) << 8) | data[1] as usize;
                self.rx = Some(Reassembly {
                    len,
                    buf: data[2..].to_vec(),
                    in_block: 0,
                });
                self.flow_control();
            }
            0x20 => {
                let Some(rx) = self.rx.as_mut() else {
                    return;
                };
                let take = (rx.len - rx.buf.len()).min(7);
                rx.buf.extend(&data[1..1 + take]);
                rx.in_block += 1;
                if rx.buf.len() >= rx.len {
                    let message = self.rx.take().map(|rx| rx.buf).unwrap_or_default();
                    self.echo(message);
                } else if self.block_size != 0 && rx.in_block == self.block_size {
                    rx.in_block = 0;
                    self.flow_control();
                }
            }
            0x30 => {
                let Some(message) = self.tx.take() else {
                    return;
                };
                for (i, chunk) in message[6..].chunks(7).enumerate() {
                    let mut frame = vec![0x20 | ((i + 1) & 0x0f) as u8];
                    frame.extend(chunk);
                    self.reply(frame);
                }
            }
            _ => {}
        }
    }
}

impl CanAdapter for EchoEcu {
    fn send(&mut self, frames: &[Frame]) -> ecu_flash::Result<()> {
        for frame in frames {
            self.received.lock().push(frame.clone());
            self.handle(frame);
        }
        Ok(())
    }

    fn recv(&mut self) -> ecu_flash::Result<Vec<Frame>> {
        Ok(self.pending.drain(..).collect())
    }
}

fn echo_bus(block_size: u8, wait_frames: usize) -> (SharedCanDispatcher, Arc<Mutex<Vec<Frame>>>) {
    let received = Arc::new(Mutex::new(vec![]));
    let ecu = EchoEcu {
        block_size,
        wait_frames,
        rx: None,
        tx: None,
        pending: VecDeque::new(),
        received: received.clone(),
    };
    (AdapterDispatcher::new_shared(ecu), received)
}

fn isotp_echo(msg_len: usize, block_size: u8) -> Vec<Frame> {
    init_logging();
    let (dispatcher, received) = echo_bus(block_size, 0);
    let config = IsoTpConfig::new(0, Identifier::Standard(REQUEST_ID));
    let mut isotp = IsoTpChannel::new(dispatcher, config).unwrap();

    let request: Vec<u8> = (0..msg_len).map(|i| i as u8).collect();
    isotp.send(&request).unwrap();
    let response = isotp.recv().unwrap();
    assert_eq!(response, request);

    let frames = received.lock().clone();
    frames
}

#[test]
fn isotp_test_single_frame() {
    let frames = isotp_echo(7, 0);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].data, vec![0x07, 0, 1, 2, 3, 4, 5, 6]);
}

#[test]
fn isotp_test_padding() {
    let frames = isotp_echo(3, 0);
    assert_eq!(frames[0].data, vec![0x03, 0, 1, 2, 0xaa, 0xaa, 0xaa, 0xaa]);
}

#[test]
fn isotp_test_first_frame() {
    // First frame with 6 bytes, one consecutive frame with 2, and our flow control for the answer
    let frames = isotp_echo(8, 0);
    assert_eq!(frames.len(), 3);
    assert_eq!(frames[0].data[..2], [0x10, 0x08]);
    assert_eq!(frames[1].data, vec![0x21, 6, 7, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa]);
    assert_eq!(frames[2].data[..3], [0x30, 0x00, 0x00]);
}

#[test]
fn isotp_test_consecutive_index_wraps() {
    // 6 + 16 * 7 bytes: the last consecutive frame has index 0 again
    let frames = isotp_echo(118, 0);
    let consecutive: Vec<u8> = frames
        .iter()
        .filter(|f| f.data[0] & 0xf0 == 0x20)
        .map(|f| f.data[0] & 0x0f)
        .collect();
    assert_eq!(consecutive.len(), 16);
    assert_eq!(consecutive[14], 0x0f);
    assert_eq!(consecutive[15], 0x00);
}

#[test]
fn isotp_test_block_size() {
    isotp_echo(64, 2);
    isotp_echo(64, 3);
}

#[test]
fn isotp_test_max_length() {
    isotp_echo(4095, 8);
}

#[test]
fn isotp_test_wait_frames() {
    let (dispatcher, _) = echo_bus(4, 3);
    let config = IsoTpConfig::new(0, Identifier::Standard(REQUEST_ID));
    let mut isotp = IsoTpChannel::new(dispatcher, config).unwrap();

    let request = vec![0x55; 40];
    isotp.send(&request).unwrap();
    assert_eq!(isotp.recv().unwrap(), request);
}

#[test]
fn isotp_test_too_large() {
    let (dispatcher, received) = echo_bus(0, 0);
    let config = IsoTpConfig::new(0, Identifier::Standard(REQUEST_ID));
    let mut isotp = IsoTpChannel::new(dispatcher, config).unwrap();

    assert!(matches!(
        isotp.send(&[0; 4096]),
        Err(ecu_flash::Error::IsoTPError(ecu_flash::isotp::error::Error::DataTooLarge(4096)))
    ));
    assert!(received.lock().is_empty());
}

#[test]
fn isotp_test_no_flow_control() {
    let (dispatcher, _) = echo_bus(0, 0);
    // Nobody answers on this identifier
    let config = IsoTpConfig::new(0, Identifier::Standard(0x7b1));
    let mut isotp = IsoTpChannel::new(dispatcher, config).unwrap();

    assert!(isotp.send(&[0; 20]).unwrap_err().is_timeout());
    isotp.send(&[0x3e, 0x00]).unwrap();
    assert!(isotp.recv().unwrap_err().is_timeout());
}
