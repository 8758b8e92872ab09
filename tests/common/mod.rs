#![allow(dead_code)]
//! Simulated servers shared by the integration tests: a legacy flashloader on a simulated CAN bus
//! and a modern flashloader behind a message transport.
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use ecu_flash::can::{AdapterDispatcher, CanAdapter, Frame, SharedCanDispatcher};
use ecu_flash::kefex::ssl::{crc16, SslCrc};
use ecu_flash::kefex::KefexSettings;
use ecu_flash::osy::{decode_tunneled_frame, encode_tunneled_frame, OsyTransport, EVENT_TUNNELED_CAN_MESSAGE};
use ecu_flash::types::SerialNumber;
use parking_lot::Mutex;

pub fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

struct ReadTransfer {
    data: Vec<u8>,
    offset: usize,
    sequence: u8,
}

struct WriteTransfer {
    index: u16,
    size: u16,
    crc: u16,
    buf: Vec<u8>,
    in_block: u8,
    sequence: u8,
}

struct SslTransfer {
    crc: SslCrc,
    count: u16,
}

/// Legacy flashloader answering on the request identifier of `settings`.
pub struct KefexServer {
    pub settings: KefexSettings,
    pub variables: HashMap<u16, Vec<u8>>,
    pub memory: BTreeMap<u32, u8>,
    pub logon_crc: Option<u16>,
    /// Block size granted to segmented writes
    pub write_block_size: u8,
    pub read_flow_controls: usize,
    pub write_flow_controls: usize,
    pub write_consecutive_frames: usize,
    /// Send the second consecutive frame of a read with a wrong sequence number
    pub skip_read_sequence: bool,
    read: Option<ReadTransfer>,
    write: Option<WriteTransfer>,
    ssl: Option<SslTransfer>,
}

impl KefexServer {
    pub fn new(settings: KefexSettings) -> Self {
        Self {
            settings,
            variables: HashMap::new(),
            memory: BTreeMap::new(),
            logon_crc: None,
            write_block_size: 2,
            read_flow_controls: 0,
            write_flow_controls: 0,
            write_consecutive_frames: 0,
            skip_read_sequence: false,
            read: None,
            write: None,
            ssl: None,
        }
    }

    fn reply(&self, bus: u8, data: Vec<u8>) -> Frame {
        Frame::new(bus, self.settings.response_id(), &data).unwrap()
    }

    fn write_flow_control(&mut self, bus: u8) -> Frame {
        self.write_flow_controls += 1;
        self.reply(bus, vec![0x14, self.write_block_size, 0])
    }

    /// Answer one request frame.
    pub fn handle(&mut self, frame: &Frame) -> Vec<Frame> {
        if frame.id != self.settings.request_id() || frame.data.first() != Some(&self.settings.server_address) {
            return vec![];
        }
        let bus = frame.bus;
        let tag = frame.data[1];
        let p = &frame.data[2..];

        match tag {
            // Single read
            0x01 => {
                let index = u16::from_le_bytes([p[0], p[1]]);
                let mut value = self.variables.get(&index).cloned().unwrap_or_default();
                value.resize(4, 0);
                let mut data = vec![0x01, p[0], p[1]];
                data.extend(&value[..4]);
                vec![self.reply(bus, data)]
            }
            // Logon / logoff
            0x07 => {
                self.logon_crc = Some(u16::from_le_bytes([p[0], p[1]]));
                vec![self.reply(bus, vec![0x07, p[0], p[1]])]
            }
            0x08 => {
                self.logon_crc = None;
                vec![self.reply(bus, vec![0x08])]
            }
            // Guarded memory writes
            0x0d => {
                let count = u16::from_le_bytes([p[0], p[1]]);
                self.ssl = Some(SslTransfer {
                    crc: SslCrc::new(),
                    count: 0,
                });
                vec![self.reply(bus, vec![0x0d, count.to_le_bytes()[0], count.to_le_bytes()[1]])]
            }
            0x0b | 0x0c => {
                let address = u32::from_le_bytes([p[0], p[1], p[2], p[3]]);
                let value = &p[4..];
                for (i, b) in value.iter().enumerate() {
                    self.memory.insert(address + i as u32, *b);
                }
                if let Some(ssl) = self.ssl.as_mut() {
                    ssl.crc.update(p);
                    ssl.count += 1;
                }
                let mut data = vec![tag];
                data.extend(p);
                vec![self.reply(bus, data)]
            }
            0x0e => {
                let Some(ssl) = self.ssl.take() else {
                    return vec![self.reply(bus, vec![0x8e, 0x07])];
                };
                let mut data = vec![0x0e];
                data.extend(ssl.crc.value().to_le_bytes());
                data.extend(ssl.count.to_le_bytes());
                vec![self.reply(bus, data)]
            }
            // Segmented read
            0x10 => {
                let index = u16::from_le_bytes([p[0], p[1]]);
                let Some(data) = self.variables.get(&index).cloned() else {
                    return vec![self.reply(bus, vec![0x90, p[0], p[1], 0x01])];
                };
                let mut first = vec![0x10, p[0], p[1]];
                first.extend((data.len() as u16).to_le_bytes());
                first.extend(crc16(&data).to_le_bytes());
                self.read = Some(ReadTransfer {
                    data,
                    offset: 0,
                    sequence: 0,
                });
                vec![self.reply(bus, first)]
            }
            0x12 => {
                self.read_flow_controls += 1;
                let block_size = p[0];
                let skip = self.skip_read_sequence;
                let Some(read) = self.read.as_mut() else {
                    return vec![];
                };
                let mut frames = vec![];
                for _ in 0..block_size {
                    if read.offset >= read.data.len() {
                        break;
                    }
                    let end = (read.offset + 6).min(read.data.len());
                    let sequence = if skip && read.sequence == 1 { 2 } else { read.sequence };
                    let mut data = vec![0x11, sequence];
                    data.extend(&read.data[read.offset..end]);
                    frames.push(data);
                    read.offset = end;
                    read.sequence = read.sequence.wrapping_add(1);
                }
                if read.offset >= read.data.len() {
                    self.read = None;
                }
                frames.into_iter().map(|d| self.reply(bus, d)).collect()
            }
            // Segmented write
            0x13 => {
                self.write = Some(WriteTransfer {
                    index: u16::from_le_bytes([p[0], p[1]]),
                    size: u16::from_le_bytes([p[2], p[3]]),
                    crc: u16::from_le_bytes([p[4], p[5]]),
                    buf: vec![],
                    in_block: 0,
                    sequence: 0,
                });
                vec![self.write_flow_control(bus)]
            }
            0x15 => {
                self.write_consecutive_frames += 1;
                let block_size = self.write_block_size;
                let Some(write) = self.write.as_mut() else {
                    return vec![];
                };
                if p[0] != write.sequence {
                    let index = write.index.to_le_bytes();
                    self.write = None;
                    return vec![self.reply(bus, vec![0x96, index[0], index[1], 0x07])];
                }
                write.sequence = write.sequence.wrapping_add(1);
                let remaining = write.size as usize - write.buf.len();
                let chunk = &p[1..];
                write.buf.extend(&chunk[..chunk.len().min(remaining)]);
                write.in_block += 1;

                if write.buf.len() == write.size as usize {
                    let Some(write) = self.write.take() else {
                        return vec![];
                    };
                    let index = write.index.to_le_bytes();
                    if crc16(&write.buf) != write.crc {
                        return vec![self.reply(bus, vec![0x96, index[0], index[1], 0x06])];
                    }
                    self.variables.insert(write.index, write.buf);
                    let size = write.size.to_le_bytes();
                    return vec![self.reply(bus, vec![0x16, index[0], index[1], size[0], size[1]])];
                }
                if block_size != 0 && write.in_block == block_size {
                    write.in_block = 0;
                    return vec![self.write_flow_control(bus)];
                }
                vec![]
            }
            _ => vec![self.reply(bus, vec![tag | 0x80, 0x01])],
        }
    }
}

/// CAN bus with a single legacy server on it. Responses are available right after the request.
pub struct SimulatedBus {
    server: Arc<Mutex<KefexServer>>,
    pending: VecDeque<Frame>,
    pub sent: Arc<Mutex<Vec<Frame>>>,
}

impl CanAdapter for SimulatedBus {
    fn send(&mut self, frames: &[Frame]) -> ecu_flash::Result<()> {
        for frame in frames {
            self.sent.lock().push(frame.clone());
            let responses = self.server.lock().handle(frame);
            self.pending.extend(responses);
        }
        Ok(())
    }

    fn recv(&mut self) -> ecu_flash::Result<Vec<Frame>> {
        Ok(self.pending.drain(..).collect())
    }
}

pub fn kefex_bus(settings: KefexSettings) -> (SharedCanDispatcher, Arc<Mutex<KefexServer>>) {
    let server = Arc::new(Mutex::new(KefexServer::new(settings)));
    let bus = SimulatedBus {
        server: server.clone(),
        pending: VecDeque::new(),
        sent: Arc::new(Mutex::new(vec![])),
    };
    (AdapterDispatcher::new_shared(bus), server)
}

pub enum Download {
    Memory { address: u32, data: Vec<u8> },
    File { name: String, data: Vec<u8> },
}

/// State of a simulated modern flashloader.
pub struct FlashloaderState {
    pub device_name: String,
    pub serial_number: SerialNumber,
    pub seed: Vec<u8>,
    pub expected_key: Vec<u8>,
    pub unlocked: bool,
    pub session: u8,
    pub features: u32,
    pub max_block_length: u16,
    pub fingerprint: Vec<u8>,
    pub erased: Vec<(u32, u32)>,
    pub memory: BTreeMap<u32, Vec<u8>>,
    pub files: HashMap<String, Vec<u8>>,
    pub exits: Vec<Vec<u8>>,
    pub block_counters: Vec<u8>,
    pub security_debugger: Option<(bool, bool)>,
    pub routing: Vec<(bool, u8)>,
    pub tunnel: Vec<(bool, u8)>,
    pub resets: Vec<u8>,
    pub tester_present: usize,
    /// Device name reads answered with "conditions not correct" before the real answer
    pub device_name_failures: usize,
    /// Legacy server reached through the CAN tunnel
    pub tunnel_target: Option<Arc<Mutex<KefexServer>>>,
    pub download: Option<Download>,
}

impl Default for FlashloaderState {
    fn default() -> Self {
        Self {
            device_name: "ESX3CM".into(),
            serial_number: SerialNumber::Pos([0x05, 0x12, 0x34, 0x56, 0x78, 0x90]),
            seed: vec![],
            expected_key: vec![],
            unlocked: false,
            session: 0x01,
            features: 0,
            max_block_length: 66,
            fingerprint: ecu_flash::osy::Fingerprint::default().to_bytes(),
            erased: vec![],
            memory: BTreeMap::new(),
            files: HashMap::new(),
            exits: vec![],
            block_counters: vec![],
            security_debugger: None,
            routing: vec![],
            tunnel: vec![],
            resets: vec![],
            tester_present: 0,
            device_name_failures: 0,
            tunnel_target: None,
            download: None,
        }
    }
}

fn negative(sid: u8, code: u8) -> Vec<Vec<u8>> {
    vec![vec![0x7f, sid, code]]
}

impl FlashloaderState {
    fn read_did(&mut self, did: u16) -> Option<Vec<u8>> {
        Some(match did {
            0xa800 => {
                let mut name = self.device_name.as_bytes().to_vec();
                name.resize(28, 0);
                name
            }
            0xa801 => vec![0x00, 0x00, 0x07],
            0xa802 => vec![3, 0, 1],
            0xa803 => 123456u32.to_be_bytes().to_vec(),
            0xa804 => self.features.to_be_bytes().to_vec(),
            0xa805 => self.max_block_length.to_be_bytes().to_vec(),
            0xf012 => self.serial_number.to_bytes(),
            0xf18c => match &self.serial_number {
                SerialNumber::Pos(pos) => pos.to_vec(),
                SerialNumber::Extended { .. } => return None,
            },
            0xf180 => b"V1.02r0".to_vec(),
            0xf184 => self.fingerprint.clone(),
            0xf193 => b"HW 2\0".to_vec(),
            _ => return None,
        })
    }

    /// Responses and events sent in answer to `request`.
    pub fn handle(&mut self, request: &[u8]) -> Vec<Vec<u8>> {
        let sid = request[0];
        let sub = request.get(1).copied().unwrap_or_default();
        let suppress = sub & 0x80 != 0;

        match sid {
            0x10 => {
                self.session = sub;
                vec![vec![0x50, sub]]
            }
            0x11 => {
                self.resets.push(sub & 0x7f);
                if suppress {
                    vec![]
                } else {
                    vec![vec![0x51, sub]]
                }
            }
            0x27 if sub % 2 == 1 => {
                let seed = if self.seed.is_empty() { vec![0; 4] } else { self.seed.clone() };
                let mut response = vec![0x67, sub];
                response.extend(seed);
                vec![response]
            }
            0x27 => {
                if request[2..] != self.expected_key[..] {
                    return negative(sid, 0x35);
                }
                self.unlocked = true;
                vec![vec![0x67, sub]]
            }
            0x3e => {
                self.tester_present += 1;
                if suppress {
                    vec![]
                } else {
                    vec![vec![0x7e, 0x00]]
                }
            }
            0x22 => {
                let did = u16::from_be_bytes([request[1], request[2]]);
                if did == 0xa800 && self.device_name_failures > 0 {
                    self.device_name_failures -= 1;
                    return negative(sid, 0x22);
                }
                match self.read_did(did) {
                    Some(data) => {
                        let mut response = vec![0x62, request[1], request[2]];
                        response.extend(data);
                        vec![response]
                    }
                    None => negative(sid, 0x31),
                }
            }
            0x2e => {
                let did = u16::from_be_bytes([request[1], request[2]]);
                if did != 0xf184 {
                    return negative(sid, 0x31);
                }
                self.fingerprint = request[3..].to_vec();
                vec![vec![0x6e, request[1], request[2]]]
            }
            0x31 => {
                let routine = u16::from_be_bytes([request[2], request[3]]);
                let data = &request[4..];
                match routine {
                    0xff00 => {
                        let address = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
                        let size = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
                        self.erased.push((address, size));
                    }
                    0x0206 => self.routing.push((sub == 0x01, data[0])),
                    0x0215 => self.tunnel.push((sub == 0x01, data[0])),
                    0x0218 => self.security_debugger = Some((data[0] != 0, data[1] != 0)),
                    0x0203 => {}
                    _ => return negative(sid, 0x31),
                }
                vec![vec![0x71, sub, request[2], request[3]]]
            }
            0x34 => {
                let address = u32::from_be_bytes([request[3], request[4], request[5], request[6]]);
                self.download = Some(Download::Memory { address, data: vec![] });
                let mut response = vec![0x74, 0x20];
                response.extend(self.max_block_length.to_be_bytes());
                vec![response]
            }
            0x38 => {
                let len = u16::from_be_bytes([request[2], request[3]]) as usize;
                let name = String::from_utf8_lossy(&request[4..4 + len]).into_owned();
                self.download = Some(Download::File { name, data: vec![] });
                let mut response = vec![0x78, sub, 0x20];
                response.extend(self.max_block_length.to_be_bytes());
                vec![response]
            }
            0x36 => {
                if request.len() > self.max_block_length as usize {
                    return negative(sid, 0x13);
                }
                self.block_counters.push(sub);
                match self.download.as_mut() {
                    Some(Download::Memory { data, .. } | Download::File { data, .. }) => {
                        data.extend(&request[2..]);
                        vec![vec![0x76, sub]]
                    }
                    None => negative(sid, 0x24),
                }
            }
            0x37 => {
                self.exits.push(request[1..].to_vec());
                match self.download.take() {
                    Some(Download::Memory { address, data }) => {
                        self.memory.insert(address, data);
                    }
                    Some(Download::File { name, data }) => {
                        self.files.insert(name, data);
                    }
                    None => return negative(sid, 0x24),
                }
                vec![vec![0x77]]
            }
            0xbf => {
                let Some(server) = self.tunnel_target.clone() else {
                    return vec![];
                };
                let Ok(frame) = decode_tunneled_frame(&request[1..]) else {
                    return vec![];
                };
                let responses = server.lock().handle(&frame);
                responses
                    .iter()
                    .map(|f| {
                        let mut event = vec![EVENT_TUNNELED_CAN_MESSAGE];
                        event.extend(encode_tunneled_frame(f));
                        event
                    })
                    .collect()
            }
            _ => negative(sid, 0x11),
        }
    }
}

/// Transport delivering requests straight to a simulated flashloader.
pub struct SimulatedFlashloader {
    pub state: Arc<Mutex<FlashloaderState>>,
    outbox: VecDeque<Vec<u8>>,
}

impl SimulatedFlashloader {
    pub fn new(state: FlashloaderState) -> (Self, Arc<Mutex<FlashloaderState>>) {
        let state = Arc::new(Mutex::new(state));
        (
            Self {
                state: state.clone(),
                outbox: VecDeque::new(),
            },
            state,
        )
    }
}

impl OsyTransport for SimulatedFlashloader {
    fn send(&mut self, request: &[u8]) -> ecu_flash::Result<()> {
        let responses = self.state.lock().handle(request);
        self.outbox.extend(responses);
        Ok(())
    }

    fn poll(&mut self) -> ecu_flash::Result<Option<Vec<u8>>> {
        Ok(self.outbox.pop_front())
    }
}

/// Intel HEX text of `data` at `address`, in records of 16 bytes.
pub fn hex_image(address: u32, data: &[u8]) -> String {
    fn record(record_type: u8, offset: u16, data: &[u8]) -> String {
        let mut bytes = vec![data.len() as u8];
        bytes.extend(offset.to_be_bytes());
        bytes.push(record_type);
        bytes.extend(data);
        let sum = bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
        bytes.push(sum.wrapping_neg());
        format!(":{}", hex::encode_upper(bytes))
    }

    let mut lines = vec![record(0x04, 0, &((address >> 16) as u16).to_be_bytes())];
    for (i, chunk) in data.chunks(16).enumerate() {
        lines.push(record(0x00, (address as u16).wrapping_add(16 * i as u16), chunk));
    }
    lines.push(":00000001FF".to_string());
    lines.join("\n")
}
