//! Client for the modern flashloader protocol, a UDS (ISO 14229) dialect with manufacturer specific
//! services for broadcasts, routing and CAN tunneling.
//!
//! The client is transport agnostic: on CAN it runs on an [`IsoTpChannel`](crate::isotp::IsoTpChannel),
//! on Ethernet on a [`DoIpChannel`](crate::ip::doip::DoIpChannel).
//! ## Example
//! ```rust,no_run
//! fn osy_example(dispatcher: ecu_flash::can::SharedCanDispatcher) -> ecu_flash::Result<()> {
//!     let config = ecu_flash::config::StackConfig::default();
//!     let server = ecu_flash::types::ServerId::new(0, 3)?;
//!     let mut client = ecu_flash::osy::OsyClient::on_can(dispatcher, 0, server, &config)?;
//!
//!     client.tester_present()?;
//!     let name = client.read_device_name()?;
//!     println!("Device name: {}", name);
//!     Ok(())
//! }
//! ```

pub mod broadcast;
pub mod constants;
mod error;
pub mod types;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bstr::ByteSlice;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::can::{Frame, Identifier, SharedCanDispatcher};
use crate::config::StackConfig;
use crate::isotp::{IsoTpChannel, IsoTpConfig};
use crate::poll::{poll_with_deadline, Deadline};
use crate::types::{SerialNumber, ServerId};
use crate::Result;
pub use constants::*;
pub use error::{Error, NegativeResponseCode};
pub use types::*;

/// Message oriented transport carrying requests and responses of one client/server pair.
pub trait OsyTransport: Send {
    fn send(&mut self, request: &[u8]) -> Result<()>;
    /// Next complete message received from the server, if any. Must not block.
    fn poll(&mut self) -> Result<Option<Vec<u8>>>;
}

impl OsyTransport for IsoTpChannel {
    fn send(&mut self, request: &[u8]) -> Result<()> {
        IsoTpChannel::send(self, request)
    }

    fn poll(&mut self) -> Result<Option<Vec<u8>>> {
        IsoTpChannel::poll(self)
    }
}

pub type SharedOsyClient = Arc<Mutex<OsyClient>>;

/// Physical request identifier from `source` to `target` on CAN.
pub fn physical_id(target: u8, source: u8) -> Identifier {
    Identifier::Extended(PHYSICAL_ID_BASE | (target as u32) << 8 | source as u32)
}

/// Functional (broadcast) request identifier of `source` on CAN.
pub fn functional_id(source: u8) -> Identifier {
    Identifier::Extended(FUNCTIONAL_ID_BASE | source as u32)
}

/// Encode a CAN frame as carried by the send and tunnel services: `[bus, id (4, bit 31 = extended), data...]`.
pub fn encode_tunneled_frame(frame: &Frame) -> Vec<u8> {
    let mut id: u32 = frame.id.into();
    if frame.id.is_extended() {
        id |= 0x8000_0000;
    }
    let mut buf = vec![frame.bus];
    buf.extend(id.to_be_bytes());
    buf.extend(&frame.data);
    buf
}

pub fn decode_tunneled_frame(buf: &[u8]) -> Result<Frame> {
    if buf.len() < 5 {
        return Err(Error::InvalidResponseLength.into());
    }
    let raw = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
    let id = if raw & 0x8000_0000 != 0 {
        Identifier::Extended(raw & 0x1fff_ffff)
    } else {
        Identifier::Standard(raw)
    };
    Frame::new(buf[0], id, &buf[5..])
}

#[derive(Debug, Copy, Clone)]
struct Timing {
    p2: Duration,
    p2_star: Duration,
    erase: Duration,
}

/// Client session with one server. Requests are strictly sequential.
pub struct OsyClient {
    transport: Box<dyn OsyTransport>,
    server: ServerId,
    timing: Timing,
    tunneled: VecDeque<Frame>,
}

impl OsyClient {
    pub fn new(transport: Box<dyn OsyTransport>, server: ServerId, config: &StackConfig) -> Self {
        Self {
            transport,
            server,
            timing: Timing {
                p2: config.response_timeout(),
                p2_star: config.response_pending_timeout(),
                erase: config.erase_timeout(),
            },
            tunneled: VecDeque::new(),
        }
    }

    /// Client on CAN using normal fixed addressing between the tester node and `server`. `channel`
    /// is the adapter channel the tool is connected to; `server` may sit on another bus behind a
    /// gateway.
    pub fn on_can(
        dispatcher: SharedCanDispatcher,
        channel: u8,
        server: ServerId,
        config: &StackConfig,
    ) -> Result<Self> {
        let mut isotp = IsoTpConfig::new(channel, physical_id(server.node, config.tester_node_id));
        isotp.timeout = config.response_timeout();
        let channel = IsoTpChannel::new(dispatcher, isotp)?;
        Ok(Self::new(Box::new(channel), server, config))
    }

    pub fn into_shared(self) -> SharedOsyClient {
        Arc::new(Mutex::new(self))
    }

    pub fn server_id(&self) -> ServerId {
        self.server
    }

    fn handle_event(&mut self, message: &[u8]) -> bool {
        if message.first() != Some(&EVENT_TUNNELED_CAN_MESSAGE) {
            return false;
        }
        match decode_tunneled_frame(&message[1..]) {
            Ok(frame) => self.tunneled.push_back(frame),
            Err(e) => debug!("Dropping malformed tunnel event: {}", e),
        }
        true
    }

    /// Send `request` and wait for its positive response. "Response pending" restarts the wait with
    /// the extended timeout.
    fn exchange(&mut self, request: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        let sid = request[0];
        self.transport.send(request)?;

        let pending = self.timing.p2_star;
        let mut deadline = Deadline::after(timeout);
        poll_with_deadline(&mut deadline, |deadline| {
            while let Some(response) = self.transport.poll()? {
                if self.handle_event(&response) {
                    continue;
                }
                let Some(&response_sid) = response.first() else {
                    continue;
                };

                // Check for errors
                if response_sid == NEGATIVE_RESPONSE && response.len() >= 3 && response[1] == sid {
                    let code: NegativeResponseCode = response[2].into();

                    if code == NegativeResponseCode::RequestCorrectlyReceivedResponsePending {
                        info!("Received Response Pending");
                        deadline.reset(pending);
                        continue;
                    }

                    return Err(Error::NegativeResponse(code).into());
                }

                if response_sid == sid | POSITIVE_RESPONSE {
                    return Ok(Some(response));
                }
                debug!("Ignoring unexpected response {}", hex::encode(&response));
            }
            Ok(None)
        })
    }

    fn build_request(sid: u8, sub_function: Option<u8>, data: Option<&[u8]>) -> Vec<u8> {
        let mut request: Vec<u8> = vec![sid];

        if let Some(sub_function) = sub_function {
            request.push(sub_function);
        }

        if let Some(data) = data {
            request.extend(data);
        }
        request
    }

    /// Helper function to make custom requests. This function will verify the ECU responds with the correct service identifier and sub function, handle negative responses, and will return the response data.
    pub fn request(&mut self, sid: u8, sub_function: Option<u8>, data: Option<&[u8]>) -> Result<Vec<u8>> {
        let timeout = self.timing.p2;
        self.request_with_timeout(sid, sub_function, data, timeout)
    }

    pub fn request_with_timeout(
        &mut self,
        sid: u8,
        sub_function: Option<u8>,
        data: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let request = Self::build_request(sid, sub_function, data);
        let response = self.exchange(&request, timeout)?;

        // Check sub function
        if let Some(sub_function) = sub_function {
            match response.get(1) {
                Some(&received) if received == sub_function => {}
                Some(&received) => return Err(Error::InvalidSubFunction(received).into()),
                None => return Err(Error::InvalidResponseLength.into()),
            }
        }

        let start: usize = if sub_function.is_some() { 2 } else { 1 };
        Ok(response[start..].to_vec())
    }

    /// Send a request no response is expected for.
    pub fn send_one_way(&mut self, sid: u8, sub_function: Option<u8>, data: Option<&[u8]>) -> Result<()> {
        let request = Self::build_request(sid, sub_function, data);
        self.transport.send(&request)
    }

    /// 0x10 - Diagnostic Session Control. ECU may optionally return 4 bytes of sessionParameterRecord with some timing information.
    pub fn diagnostic_session_control(&mut self, session_type: u8) -> Result<Option<SessionParameterRecord>> {
        let result = self.request(
            ServiceIdentifier::DiagnosticSessionControl as u8,
            Some(session_type),
            None,
        )?;

        let result = if result.len() == 4 {
            let p2_server_max = u16::from_be_bytes([result[0], result[1]]);
            let p2_server_max = Duration::from_millis(p2_server_max as u64);
            let p2_star_server_max = u16::from_be_bytes([result[2], result[3]]);
            let p2_star_server_max = Duration::from_millis(p2_star_server_max as u64 * 10);

            Some(SessionParameterRecord {
                p2_server_max,
                p2_star_server_max,
            })
        } else {
            None
        };

        Ok(result)
    }

    /// 0x11 - ECU Reset, waiting for the positive response.
    pub fn ecu_reset(&mut self, reset_type: u8) -> Result<()> {
        self.request(ServiceIdentifier::EcuReset as u8, Some(reset_type), None)?;
        Ok(())
    }

    /// 0x11 - ECU Reset with the positive response suppressed. The server may reset before it
    /// could answer.
    pub fn ecu_reset_one_way(&mut self, reset_type: u8) -> Result<()> {
        self.send_one_way(
            ServiceIdentifier::EcuReset as u8,
            Some(reset_type | SUPPRESS_POSITIVE_RESPONSE),
            None,
        )
    }

    /// 0x27 - Security Access. Odd `access_type` values are used to request a seed, even values to send a key.
    pub fn security_access(&mut self, access_type: u8, data: Option<&[u8]>) -> Result<Vec<u8>> {
        let send_key = access_type % 2 == 0;
        if send_key && data.is_none() {
            return Err(crate::Error::Range);
        }

        self.request(ServiceIdentifier::SecurityAccess as u8, Some(access_type), data)
    }

    /// 0x3E - Tester Present
    pub fn tester_present(&mut self) -> Result<()> {
        self.request(ServiceIdentifier::TesterPresent as u8, Some(0), None)?;
        Ok(())
    }

    /// 0x3E - Tester Present without response, used to keep a session open
    pub fn tester_present_one_way(&mut self) -> Result<()> {
        self.send_one_way(
            ServiceIdentifier::TesterPresent as u8,
            Some(SUPPRESS_POSITIVE_RESPONSE),
            None,
        )
    }

    /// 0x22 - Read Data By Identifier. Reading multiple identifiers at once is not supported.
    pub fn read_data_by_identifier(&mut self, data_identifier: u16) -> Result<Vec<u8>> {
        let did = data_identifier.to_be_bytes();
        let resp = self.request(ServiceIdentifier::ReadDataByIdentifier as u8, None, Some(&did))?;

        if resp.len() < 2 {
            return Err(Error::InvalidResponseLength.into());
        }

        let did = u16::from_be_bytes([resp[0], resp[1]]);
        if did != data_identifier {
            return Err(Error::InvalidDataIdentifier(did).into());
        }

        Ok(resp[2..].to_vec())
    }

    /// 0x2E - Write Data By Identifier
    pub fn write_data_by_identifier(&mut self, data_identifier: u16, data_record: &[u8]) -> Result<()> {
        let mut data: Vec<u8> = data_identifier.to_be_bytes().to_vec();
        data.extend(data_record);

        let resp = self.request(ServiceIdentifier::WriteDataByIdentifier as u8, None, Some(&data))?;

        if resp.len() < 2 {
            return Err(Error::InvalidResponseLength.into());
        }

        let did = u16::from_be_bytes([resp[0], resp[1]]);
        if did != data_identifier {
            return Err(Error::InvalidDataIdentifier(did).into());
        }

        Ok(())
    }

    /// 0x31 - Routine Control. The ECU can optionally return data for all routine operations.
    pub fn routine_control(
        &mut self,
        routine_control_type: RoutineControlType,
        routine_identifier: u16,
        data: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>> {
        let timeout = self.timing.p2;
        self.routine_control_with_timeout(routine_control_type, routine_identifier, data, timeout)
    }

    fn routine_control_with_timeout(
        &mut self,
        routine_control_type: RoutineControlType,
        routine_identifier: u16,
        data: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>> {
        let mut buf: Vec<u8> = vec![];
        buf.extend(routine_identifier.to_be_bytes());
        if let Some(data) = data {
            buf.extend(data);
        }

        let resp = self.request_with_timeout(
            ServiceIdentifier::RoutineControl as u8,
            Some(routine_control_type as u8),
            Some(&buf),
            timeout,
        )?;

        if resp.len() < 2 {
            return Err(Error::InvalidResponseLength.into());
        }

        let id = u16::from_be_bytes([resp[0], resp[1]]);
        if id != routine_identifier {
            return Err(Error::InvalidDataIdentifier(id).into());
        }

        Ok(if resp.len() > 2 { Some(resp[2..].to_vec()) } else { None })
    }

    fn parse_max_block_length(resp: &[u8]) -> Result<usize> {
        // Ensure the response contains at least a length format
        if resp.is_empty() {
            return Err(Error::InvalidResponseLength.into());
        }

        let num_length_bytes = (resp[0] >> 4) as usize;
        if num_length_bytes == 0 || num_length_bytes > 8 || resp.len() < num_length_bytes + 1 {
            return Err(Error::InvalidResponseLength.into());
        }

        // Convert the length bytes to a usize
        Ok(resp[1..num_length_bytes + 1]
            .iter()
            .fold(0, |acc, &x| (acc << 8) | x as usize))
    }

    /// 0x34 - Request Download. Used to initiate a transfer from the client to the ECU. Returns the maximum number of bytes to include in each TransferData request.
    pub fn request_download(&mut self, memory_address: u32, memory_size: u32) -> Result<usize> {
        let mut data: Vec<u8> = vec![0x00, 0x44];
        data.extend(memory_address.to_be_bytes());
        data.extend(memory_size.to_be_bytes());

        let resp = self.request(ServiceIdentifier::RequestDownload as u8, None, Some(&data))?;
        Self::parse_max_block_length(&resp)
    }

    /// 0x38 - Request File Transfer. Returns the maximum number of bytes to include in each TransferData request.
    pub fn request_file_transfer(&mut self, mode: FileTransferMode, path: &str, file_size: u32) -> Result<usize> {
        let path_len = u16::try_from(path.len()).map_err(|_| crate::Error::Range)?;
        let mut data: Vec<u8> = path_len.to_be_bytes().to_vec();
        data.extend(path.as_bytes());
        // dataFormatIdentifier, then uncompressed and compressed size with 4 bytes each
        data.extend([0x00, 0x04]);
        data.extend(file_size.to_be_bytes());
        data.extend(file_size.to_be_bytes());

        let resp = self.request(ServiceIdentifier::RequestFileTransfer as u8, Some(mode as u8), Some(&data))?;
        Self::parse_max_block_length(&resp)
    }

    /// 0x36 - Transfer Data. `block_sequence_counter` starts at 1 and wraps around to 0.
    pub fn transfer_data(&mut self, block_sequence_counter: u8, data: &[u8]) -> Result<()> {
        let mut buf: Vec<u8> = vec![block_sequence_counter];
        buf.extend(data);

        let resp = self.request(ServiceIdentifier::TransferData as u8, None, Some(&buf))?;

        // Ensure the response contains at least the block sequence counter
        if resp.is_empty() {
            return Err(Error::InvalidResponseLength.into());
        }

        // Check block sequence counter
        if resp[0] != block_sequence_counter {
            return Err(Error::InvalidBlockSequenceCounter(resp[0]).into());
        }

        Ok(())
    }

    /// 0x37 - Request Transfer Exit. Used to terminate a download. The optional `data` carries the
    /// signature address of an address based transfer or the CRC32 of a file based one.
    pub fn request_transfer_exit(&mut self, data: Option<&[u8]>) -> Result<Option<Vec<u8>>> {
        let resp = self.request(ServiceIdentifier::RequestTransferExit as u8, None, data)?;

        Ok(if !resp.is_empty() { Some(resp) } else { None })
    }

    pub fn read_serial_number(&mut self) -> Result<SerialNumber> {
        let data = self.read_data_by_identifier(DataIdentifier::EcuSerialNumber as u16)?;
        let pos: [u8; 6] = data.as_slice().try_into().map_err(|_| Error::InvalidResponseLength)?;
        Ok(SerialNumber::Pos(pos))
    }

    /// Serial number in the variable length format, for devices that do not use the POS format.
    pub fn read_serial_number_extended(&mut self) -> Result<SerialNumber> {
        let data = self.read_data_by_identifier(DataIdentifier::EcuSerialNumberExtended as u16)?;
        let (serial, _) = SerialNumber::from_bytes(&data)?;
        Ok(serial)
    }

    fn read_string(&mut self, did: DataIdentifier) -> Result<String> {
        let data = self.read_data_by_identifier(did as u16)?;
        let text = data.split(|b| *b == 0).next().unwrap_or_default();
        Ok(text.to_str_lossy().trim_end().to_string())
    }

    pub fn read_device_name(&mut self) -> Result<String> {
        self.read_string(DataIdentifier::DeviceName)
    }

    pub fn read_flashloader_version(&mut self) -> Result<String> {
        self.read_string(DataIdentifier::FlashloaderVersion)
    }

    pub fn read_hardware_version(&mut self) -> Result<String> {
        self.read_string(DataIdentifier::HardwareVersion)
    }

    pub fn read_article_number(&mut self) -> Result<u32> {
        let data = self.read_data_by_identifier(DataIdentifier::ArticleNumber as u16)?;
        let bytes: [u8; 4] = data.as_slice().try_into().map_err(|_| Error::InvalidResponseLength)?;
        Ok(u32::from_be_bytes(bytes))
    }

    /// Protocol version as (major, minor, release).
    pub fn read_protocol_version(&mut self) -> Result<(u8, u8, u8)> {
        match self.read_data_by_identifier(DataIdentifier::ProtocolVersion as u16)?.as_slice() {
            [major, minor, release] => Ok((*major, *minor, *release)),
            _ => Err(Error::InvalidResponseLength.into()),
        }
    }

    pub fn read_flash_count(&mut self) -> Result<u32> {
        match self.read_data_by_identifier(DataIdentifier::FlashCount as u16)?.as_slice() {
            [a, b, c] => Ok(u32::from_be_bytes([0, *a, *b, *c])),
            _ => Err(Error::InvalidResponseLength.into()),
        }
    }

    pub fn read_fingerprint(&mut self) -> Result<Fingerprint> {
        let data = self.read_data_by_identifier(DataIdentifier::ApplicationSoftwareFingerprint as u16)?;
        Ok(Fingerprint::from_bytes(&data).ok_or(Error::InvalidResponseLength)?)
    }

    pub fn write_fingerprint(&mut self, fingerprint: &Fingerprint) -> Result<()> {
        self.write_data_by_identifier(
            DataIdentifier::ApplicationSoftwareFingerprint as u16,
            &fingerprint.to_bytes(),
        )
    }

    pub fn read_features(&mut self) -> Result<FeatureSet> {
        let data = self.read_data_by_identifier(DataIdentifier::FlashloaderFeatures as u16)?;
        let bytes: [u8; 4] = data.as_slice().try_into().map_err(|_| Error::InvalidResponseLength)?;
        Ok(FeatureSet::from_bits(u32::from_be_bytes(bytes)))
    }

    pub fn read_max_block_length(&mut self) -> Result<u16> {
        let data = self.read_data_by_identifier(DataIdentifier::MaxBlockLength as u16)?;
        let bytes: [u8; 2] = data.as_slice().try_into().map_err(|_| Error::InvalidResponseLength)?;
        Ok(u16::from_be_bytes(bytes))
    }

    /// Erase a flash area. Takes long; waits up to the erase timeout.
    pub fn erase_memory(&mut self, address: u32, size: u32) -> Result<()> {
        let mut data = address.to_be_bytes().to_vec();
        data.extend(size.to_be_bytes());
        let timeout = self.timing.erase;
        self.routine_control_with_timeout(
            RoutineControlType::Start,
            RoutineIdentifier::EraseMemory as u16,
            Some(&data),
            timeout,
        )?;
        Ok(())
    }

    /// Start or stop forwarding of diagnostic traffic to `bus`.
    pub fn set_routing(&mut self, enabled: bool, bus: u8) -> Result<()> {
        let control = if enabled {
            RoutineControlType::Start
        } else {
            RoutineControlType::Stop
        };
        self.routine_control(control, RoutineIdentifier::Routing as u16, Some(&[bus]))?;
        Ok(())
    }

    /// Start or stop tunneling of CAN frames received on `bus` whose identifier matches `filter`.
    /// Tunneled frames arrive as events and are collected by [`OsyClient::take_tunneled_frames`].
    pub fn set_can_tunnel(&mut self, enabled: bool, bus: u8, filter: Identifier) -> Result<()> {
        let mut id: u32 = filter.into();
        if filter.is_extended() {
            id |= 0x8000_0000;
        }
        let mut data = vec![bus];
        data.extend(id.to_be_bytes());
        let control = if enabled {
            RoutineControlType::Start
        } else {
            RoutineControlType::Stop
        };
        self.routine_control(control, RoutineIdentifier::CanTunnel as u16, Some(&data))?;
        Ok(())
    }

    /// Ask a running application to stay in the flashloader after the next reset.
    pub fn request_programming(&mut self) -> Result<()> {
        self.routine_control(
            RoutineControlType::Start,
            RoutineIdentifier::RequestProgramming as u16,
            None,
        )?;
        Ok(())
    }

    pub fn set_security_debugger(&mut self, security: bool, debugger: bool) -> Result<()> {
        self.routine_control(
            RoutineControlType::Start,
            RoutineIdentifier::SecurityDebuggerActivation as u16,
            Some(&[security as u8, debugger as u8]),
        )?;
        Ok(())
    }

    /// 0xBF - Send a CAN frame on one of the server's buses. No response.
    pub fn send_can_message(&mut self, frame: &Frame) -> Result<()> {
        let data = encode_tunneled_frame(frame);
        self.send_one_way(ServiceIdentifier::SendCanMessage as u8, None, Some(&data))
    }

    /// Process unsolicited messages without sending anything.
    pub fn poll_events(&mut self) -> Result<()> {
        while let Some(message) = self.transport.poll()? {
            if !self.handle_event(&message) {
                debug!("Ignoring unsolicited message {}", hex::encode(&message));
            }
        }
        Ok(())
    }

    /// Frames received through an active CAN tunnel since the last call.
    pub fn take_tunneled_frames(&mut self) -> Vec<Frame> {
        self.tunneled.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    type Responder = Box<dyn FnMut(&[u8]) -> Vec<(Duration, Vec<u8>)> + Send>;

    /// Answers each request with a list of delayed messages.
    struct Scripted {
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
        pending: VecDeque<(Instant, Vec<u8>)>,
        responder: Responder,
    }

    impl OsyTransport for Scripted {
        fn send(&mut self, request: &[u8]) -> Result<()> {
            self.sent.lock().push(request.to_vec());
            let now = Instant::now();
            for (delay, message) in (self.responder)(request) {
                self.pending.push_back((now + delay, message));
            }
            Ok(())
        }

        fn poll(&mut self) -> Result<Option<Vec<u8>>> {
            match self.pending.front() {
                Some((at, _)) if *at <= Instant::now() => Ok(self.pending.pop_front().map(|(_, m)| m)),
                _ => Ok(None),
            }
        }
    }

    fn client(responder: Responder) -> (OsyClient, Arc<Mutex<Vec<Vec<u8>>>>) {
        let config = StackConfig {
            response_timeout_ms: 50,
            response_pending_timeout_ms: 500,
            ..Default::default()
        };
        let sent = Arc::new(Mutex::new(vec![]));
        let transport = Scripted {
            sent: sent.clone(),
            pending: VecDeque::new(),
            responder,
        };
        let server = ServerId { bus: 0, node: 3 };
        (OsyClient::new(Box::new(transport), server, &config), sent)
    }

    #[test]
    fn response_pending_extends_the_wait() {
        let (mut client, _) = client(Box::new(|_| {
            vec![
                (Duration::ZERO, vec![0x7f, 0x22, 0x78]),
                (Duration::from_millis(150), vec![0x62, 0xa8, 0x00, b'E', b'S', b'X', 0, 0]),
            ]
        }));
        assert_eq!(client.read_device_name().unwrap(), "ESX");
    }

    #[test]
    fn no_response_times_out() {
        let (mut client, _) = client(Box::new(|_| vec![]));
        assert!(client.tester_present().unwrap_err().is_timeout());
    }

    #[test]
    fn negative_response_carries_reason() {
        let (mut client, _) = client(Box::new(|_| vec![(Duration::ZERO, vec![0x7f, 0x27, 0x35])]));
        let err = client.security_access(0x08, Some(&[1, 2])).unwrap_err();
        assert_eq!(err.reason_code(), Some(0x35));
    }

    #[test]
    fn send_key_requires_key() {
        let (mut client, sent) = client(Box::new(|_| vec![]));
        assert!(matches!(client.security_access(0x02, None), Err(crate::Error::Range)));
        assert!(sent.lock().is_empty());
    }

    #[test]
    fn tunnel_events_are_kept_while_waiting() {
        let tunneled = Frame::new(1, Identifier::Standard(0x581), &[0x11, 0x22]).unwrap();
        let mut event = vec![EVENT_TUNNELED_CAN_MESSAGE];
        event.extend(encode_tunneled_frame(&tunneled));

        let (mut client, _) = client(Box::new(move |_| {
            vec![(Duration::ZERO, event.clone()), (Duration::ZERO, vec![0x7e, 0x00])]
        }));
        client.tester_present().unwrap();
        let frames = client.take_tunneled_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].id, Identifier::Standard(0x581));
        assert_eq!(frames[0].data, vec![0x11, 0x22]);
        assert!(client.take_tunneled_frames().is_empty());
    }

    #[test]
    fn one_way_requests_suppress_the_response() {
        let (mut client, sent) = client(Box::new(|_| vec![]));
        client.tester_present_one_way().unwrap();
        client.ecu_reset_one_way(ResetType::HardReset as u8).unwrap();
        assert_eq!(*sent.lock(), vec![vec![0x3e, 0x80], vec![0x11, 0x81]]);
    }

    #[test]
    fn request_download_reports_block_length() {
        let (mut client, sent) = client(Box::new(|_| vec![(Duration::ZERO, vec![0x74, 0x20, 0x01, 0x02])]));
        assert_eq!(client.request_download(0x8000, 0x100).unwrap(), 0x102);
        assert_eq!(
            sent.lock()[0],
            vec![0x34, 0x00, 0x44, 0x00, 0x00, 0x80, 0x00, 0x00, 0x00, 0x01, 0x00]
        );
    }

    #[test]
    fn wrong_block_sequence_counter_is_rejected() {
        let (mut client, _) = client(Box::new(|_| vec![(Duration::ZERO, vec![0x76, 0x02])]));
        assert!(matches!(
            client.transfer_data(1, &[0xaa]),
            Err(crate::Error::OsyError(Error::InvalidBlockSequenceCounter(2)))
        ));
    }

    #[test]
    fn tunneled_frame_keeps_extended_flag() {
        let frame = Frame::new(2, Identifier::Extended(0x18da_7e05), &[1, 2, 3]).unwrap();
        let encoded = encode_tunneled_frame(&frame);
        assert_eq!(&encoded[..5], &[0x02, 0x98, 0xda, 0x7e, 0x05]);
        assert_eq!(decode_tunneled_frame(&encoded).unwrap(), frame);
    }
}
