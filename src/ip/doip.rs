//! Diagnostics over IP framing (ISO 13400-2 generic header) and a channel carrying the modern
//! protocol over a shared TCP connection.
use std::time::Duration;

use strum_macros::FromRepr;
use tracing::{debug, info, warn};

use crate::ip::header::{encode_address, AddressHeader, ADDRESS_HEADER_LEN};
use crate::ip::{BufferIdentifier, Error, IpDispatcher, RoutedRead, SharedIpDispatcher, TcpHandle};
use crate::osy::OsyTransport;
use crate::poll::poll_until;
use crate::types::ServerId;
use crate::Result;

pub const PROTOCOL_VERSION: u8 = 0x02;
pub const HEADER_LEN: usize = 8;
/// Longest payload accepted from a peer. Transfer blocks are bounded by a 16 bit length.
pub const MAX_PAYLOAD_LEN: u32 = 0x1_0000 + ADDRESS_HEADER_LEN as u32;

const ROUTING_ACTIVATION_DEFAULT: u8 = 0x00;
const ROUTING_ACTIVATION_SUCCESS: u8 = 0x10;

#[derive(Debug, PartialEq, Eq, Copy, Clone, FromRepr)]
#[repr(u16)]
pub enum PayloadType {
    GenericNegativeAcknowledge = 0x0000,
    RoutingActivationRequest = 0x0005,
    RoutingActivationResponse = 0x0006,
    AliveCheckRequest = 0x0007,
    AliveCheckResponse = 0x0008,
    DiagnosticMessage = 0x8001,
    DiagnosticMessagePositiveAck = 0x8002,
    DiagnosticMessageNegativeAck = 0x8003,

    // Manufacturer specific, carried over UDP
    GetDeviceInfoRequest = 0xf001,
    GetDeviceInfoResponse = 0xf002,
    ReadSerialNumberRequest = 0xf003,
    ReadSerialNumberResponse = 0xf004,
    SetNodeIdRequest = 0xf005,
    SetNodeIdResponse = 0xf006,
    SetIpAddressRequest = 0xf007,
    SetIpAddressResponse = 0xf008,
    RequestProgramming = 0xf009,
    NetReset = 0xf00a,
}

/// Generic header of every message.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Header {
    pub payload_type: u16,
    pub payload_len: u32,
}

impl Header {
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let t = self.payload_type.to_be_bytes();
        let l = self.payload_len.to_be_bytes();
        [PROTOCOL_VERSION, !PROTOCOL_VERSION, t[0], t[1], l[0], l[1], l[2], l[3]]
    }

    pub fn from_bytes(buf: &[u8]) -> std::result::Result<Self, Error> {
        if buf.len() < HEADER_LEN || buf[0] != PROTOCOL_VERSION || buf[1] != !PROTOCOL_VERSION {
            return Err(Error::MalformedHeader);
        }
        let payload_len = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(Error::MessageTooLong(payload_len));
        }
        Ok(Self {
            payload_type: u16::from_be_bytes([buf[2], buf[3]]),
            payload_len,
        })
    }

    pub fn message_len(&self) -> usize {
        HEADER_LEN + self.payload_len as usize
    }
}

/// Complete message: header followed by `payload`.
pub fn encode(payload_type: PayloadType, payload: &[u8]) -> Vec<u8> {
    let header = Header {
        payload_type: payload_type as u16,
        payload_len: payload.len() as u32,
    };
    let mut buf = header.to_bytes().to_vec();
    buf.extend(payload);
    buf
}

/// Split a complete message into its type and payload. Unknown types are kept as raw value.
pub fn decode(buf: &[u8]) -> std::result::Result<(u16, &[u8]), Error> {
    let header = Header::from_bytes(buf)?;
    let payload = buf.get(HEADER_LEN..header.message_len()).ok_or(Error::MalformedHeader)?;
    Ok((header.payload_type, payload))
}

/// Diagnostic message from `source` to `target`.
pub fn diagnostic_message(source: ServerId, target: ServerId, data: &[u8]) -> Vec<u8> {
    let mut payload = AddressHeader { source, target }.to_bytes().to_vec();
    payload.extend(data);
    encode(PayloadType::DiagnosticMessage, &payload)
}

/// Modern protocol transport over TCP. Several channels may share one connection; each only sees
/// the messages exchanged between its tester and target address.
pub struct DoIpChannel {
    dispatcher: SharedIpDispatcher,
    handle: TcpHandle,
    tester: ServerId,
    target: ServerId,
}

impl DoIpChannel {
    pub fn new(dispatcher: SharedIpDispatcher, handle: TcpHandle, tester: ServerId, target: ServerId) -> Self {
        Self {
            dispatcher,
            handle,
            tester,
            target,
        }
    }

    pub fn handle(&self) -> TcpHandle {
        self.handle
    }

    fn id(&self) -> BufferIdentifier {
        BufferIdentifier::new(self.tester, self.target)
    }

    /// Ask the entity to route diagnostic messages of this tester. Must be done once per connection.
    pub fn activate_routing(&mut self, timeout: Duration) -> Result<()> {
        let mut payload = encode_address(self.tester).to_be_bytes().to_vec();
        payload.push(ROUTING_ACTIVATION_DEFAULT);
        payload.extend([0u8; 4]);
        let request = encode(PayloadType::RoutingActivationRequest, &payload);
        self.dispatcher.lock().send_tcp(self.handle, &request)?;

        poll_until(timeout, || {
            let mut dispatcher = self.dispatcher.lock();
            let Some(header) = peek_header(&mut dispatcher, self.handle)? else {
                return Ok(None);
            };
            let Some(message) = dispatcher.read_tcp(self.handle, header.message_len())? else {
                return Ok(None);
            };
            if header.payload_type != PayloadType::RoutingActivationResponse as u16 {
                debug!("Skipping message type 0x{:04x} before routing activation", header.payload_type);
                return Ok(None);
            }
            let code = *message.get(HEADER_LEN + 4).ok_or(Error::MalformedHeader)?;
            if code != ROUTING_ACTIVATION_SUCCESS {
                return Err(Error::RoutingActivationRejected(code).into());
            }
            info!("Routing activated for {}", self.tester);
            Ok(Some(()))
        })
    }

    /// Process one complete message. Returns the diagnostic data if the message was for us.
    fn handle_message(&mut self, message: &[u8]) -> Result<Option<Vec<u8>>> {
        let (payload_type, payload) = decode(message)?;
        match PayloadType::from_repr(payload_type) {
            Some(PayloadType::DiagnosticMessage) => {
                let data = payload.get(ADDRESS_HEADER_LEN..).ok_or(Error::MalformedHeader)?;
                Ok(Some(data.to_vec()))
            }
            Some(PayloadType::DiagnosticMessagePositiveAck) => Ok(None),
            Some(PayloadType::DiagnosticMessageNegativeAck) => {
                let code = payload.get(ADDRESS_HEADER_LEN).copied().unwrap_or_default();
                Err(Error::NegativeAcknowledge(code).into())
            }
            Some(PayloadType::GenericNegativeAcknowledge) => {
                Err(Error::NegativeAcknowledge(payload.first().copied().unwrap_or_default()).into())
            }
            Some(PayloadType::AliveCheckRequest) => {
                let response = encode(
                    PayloadType::AliveCheckResponse,
                    &encode_address(self.tester).to_be_bytes(),
                );
                self.dispatcher.lock().send_tcp(self.handle, &response)?;
                Ok(None)
            }
            _ => {
                debug!("Ignoring message type 0x{:04x}", payload_type);
                Ok(None)
            }
        }
    }

    fn read_message(&mut self) -> Result<Option<Vec<u8>>> {
        let id = self.id();
        let mut dispatcher = self.dispatcher.lock();
        if let Some(message) = dispatcher.drain_buffer(&id) {
            return Ok(Some(message));
        }

        let Some(header) = peek_header(&mut dispatcher, self.handle)? else {
            return Ok(None);
        };
        let addressed = matches!(
            PayloadType::from_repr(header.payload_type),
            Some(PayloadType::DiagnosticMessage)
                | Some(PayloadType::DiagnosticMessagePositiveAck)
                | Some(PayloadType::DiagnosticMessageNegativeAck)
        );
        if !addressed {
            return Ok(dispatcher.read_tcp(self.handle, header.message_len())?);
        }
        if (header.payload_len as usize) < ADDRESS_HEADER_LEN {
            warn!("Diagnostic message without address header");
            return Err(Error::MalformedHeader.into());
        }

        match dispatcher.read_tcp_routed(self.handle, header.message_len(), id)? {
            RoutedRead::Data(message) => Ok(Some(message)),
            RoutedRead::NotEnoughData | RoutedRead::WrongRecipient => Ok(None),
        }
    }
}

/// Header of the next message without consuming it. A stream that does not start with a valid
/// header cannot be resynchronized and is dropped.
fn peek_header(dispatcher: &mut IpDispatcher, handle: TcpHandle) -> Result<Option<Header>> {
    let Some(raw) = dispatcher.peek_tcp(handle, HEADER_LEN)? else {
        return Ok(None);
    };
    match Header::from_bytes(&raw) {
        Ok(header) => Ok(Some(header)),
        Err(e) => {
            warn!("Dropping connection: {}", e);
            dispatcher.disconnect(handle);
            Err(e.into())
        }
    }
}

impl OsyTransport for DoIpChannel {
    fn send(&mut self, request: &[u8]) -> Result<()> {
        let message = diagnostic_message(self.tester, self.target, request);
        self.dispatcher.lock().send_tcp(self.handle, &message)?;
        Ok(())
    }

    fn poll(&mut self) -> Result<Option<Vec<u8>>> {
        while let Some(message) = self.read_message()? {
            if let Some(data) = self.handle_message(&message)? {
                return Ok(Some(data));
            }
        }
        Ok(None)
    }
}
