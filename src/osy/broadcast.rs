//! Broadcast services used before a device has a usable address: discovery and address assignment by
//! serial number, plus the one-way programming request and network reset.
//!
//! On CAN they are functional single frames, answered by every node with a physical single frame.
//! On Ethernet they are UDP datagrams with the DoIP generic header and manufacturer specific payload
//! types, answered from the protocol port.
use std::net::Ipv4Addr;
use std::time::Duration;

use bstr::ByteSlice;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::can::{ClientHandle, Frame, RxFilter, SharedCanDispatcher};
use crate::ip::doip::{self, PayloadType};
use crate::ip::header::{decode_address, encode_address};
use crate::ip::SharedIpDispatcher;
use crate::isotp::{parse_single_frame, single_frame, IsoTpConfig};
use crate::osy::constants::*;
use crate::osy::{functional_id, Error, NegativeResponseCode};
use crate::poll::{collect_for, poll_until};
use crate::types::{SerialNumber, ServerId};
use crate::Result;

const DEVICE_NAME_LEN: usize = 28;
const RESULT_OK: u8 = 0x00;

/// Answer to a serial number broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialNumberResult {
    pub sender: ServerId,
    pub serial_number: SerialNumber,
    /// Sender address, for answers received over IP
    pub ip: Option<Ipv4Addr>,
}

/// Answer to a device info broadcast. IP only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfoResult {
    pub sender: ServerId,
    pub device_name: String,
    pub serial_number: SerialNumber,
    pub ip: Ipv4Addr,
}

/// Address settings assigned with [`IpBroadcast::set_ip_address`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpSettings {
    pub address: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,
}

fn negative(sid: u8, message: &[u8]) -> Option<NegativeResponseCode> {
    match message {
        [NEGATIVE_RESPONSE, s, code, ..] if *s == sid => Some((*code).into()),
        _ => None,
    }
}

/// Broadcast services on one CAN bus.
pub struct CanBroadcast {
    dispatcher: SharedCanDispatcher,
    client: ClientHandle,
    config: IsoTpConfig,
    tester: u8,
    window: Duration,
}

impl CanBroadcast {
    pub fn new(dispatcher: SharedCanDispatcher, bus: u8, tester: u8, window: Duration) -> Result<Self> {
        let client = {
            let mut d = dispatcher.lock();
            let client = d.register_client();
            // Every physical response to the tester, whatever the sender
            let filter = RxFilter {
                id: PHYSICAL_ID_BASE | (tester as u32) << 8,
                mask: 0x1fff_ff00,
                extended: true,
            };
            d.set_rx_filter(client, Some(filter))?;
            client
        };
        Ok(Self {
            dispatcher,
            client,
            config: IsoTpConfig::new(bus, functional_id(tester)),
            tester,
            window,
        })
    }

    fn send(&self, data: &[u8]) -> Result<()> {
        let frame = single_frame(&self.config, functional_id(self.tester), data)?;
        debug!("TX broadcast {}", hex::encode(data));
        let mut dispatcher = self.dispatcher.lock();
        dispatcher.clear_rx_queue(self.client)?;
        dispatcher.send(&frame)
    }

    fn next_response(&self) -> Result<Option<(u8, Vec<u8>)>> {
        let frame: Option<Frame> = {
            let mut dispatcher = self.dispatcher.lock();
            match dispatcher.read_from_queue(self.client)? {
                Some(frame) => Some(frame),
                None => {
                    dispatcher.dispatch_incoming()?;
                    dispatcher.read_from_queue(self.client)?
                }
            }
        };
        let Some(frame) = frame else {
            return Ok(None);
        };
        let sender = (u32::from(frame.id) & 0xff) as u8;
        match parse_single_frame(&frame) {
            Ok(data) => Ok(Some((sender, data))),
            Err(e) => {
                debug!("Ignoring {:?}: {}", frame, e);
                Ok(Some((sender, vec![])))
            }
        }
    }

    /// Collect every answer to `sid` within the broadcast window.
    fn collect(&self, sid: u8) -> Result<Vec<(u8, Vec<u8>)>> {
        let responses = collect_for(self.window, || self.next_response())?;
        Ok(responses
            .into_iter()
            .filter(|(_, data)| data.first() == Some(&(sid | POSITIVE_RESPONSE)) || negative(sid, data).is_some())
            .collect())
    }

    /// Wait for the first answer to `sid`.
    fn expect(&self, sid: u8) -> Result<()> {
        poll_until(self.window, || {
            while let Some((sender, data)) = self.next_response()? {
                if let Some(code) = negative(sid, &data) {
                    return Err(Error::NegativeResponse(code).into());
                }
                if data.first() == Some(&(sid | POSITIVE_RESPONSE)) {
                    debug!("Node {} confirmed 0x{:02x}", sender, sid);
                    return Ok(Some(()));
                }
            }
            Ok(None)
        })
    }

    /// Serial numbers of every node on the bus. No answer at all is a valid result.
    pub fn read_serial_number(&self) -> Result<Vec<SerialNumberResult>> {
        let sid = ServiceIdentifier::ReadSerialNumberBroadcast as u8;
        self.send(&[sid])?;

        let mut results = vec![];
        for (node, data) in self.collect(sid)? {
            let Ok(serial) = <[u8; 6]>::try_from(data.get(1..7).unwrap_or_default()) else {
                debug!("Ignoring short serial number answer from {}", node);
                continue;
            };
            results.push(SerialNumberResult {
                sender: ServerId::new(self.config.bus, node)?,
                serial_number: SerialNumber::Pos(serial),
                ip: None,
            });
        }
        info!("{} node(s) answered the serial number broadcast", results.len());
        Ok(results)
    }

    /// Assign `node_id` to the device with `serial_number`. Only the POS form fits into one frame.
    pub fn set_node_id_by_serial_number(&self, serial_number: &SerialNumber, node_id: ServerId) -> Result<()> {
        let SerialNumber::Pos(serial) = serial_number else {
            return Err(crate::Error::Range);
        };

        let part1 = ServiceIdentifier::SetNodeIdBroadcastPart1 as u8;
        let mut request = vec![part1];
        request.extend(serial);
        self.send(&request)?;
        self.expect(part1)?;

        let part2 = ServiceIdentifier::SetNodeIdBroadcastPart2 as u8;
        self.send(&[part2, node_id.node, node_id.bus])?;
        self.expect(part2)?;
        info!("Assigned {} to {}", node_id, serial_number);
        Ok(())
    }

    /// Ask every application on the bus to stay in the flashloader after the next reset.
    pub fn request_programming(&self) -> Result<()> {
        let mut request = vec![
            ServiceIdentifier::RoutineControl as u8,
            RoutineControlType::Start as u8 | SUPPRESS_POSITIVE_RESPONSE,
        ];
        request.extend((RoutineIdentifier::RequestProgramming as u16).to_be_bytes());
        self.send(&request)
    }

    /// Reset every node on the bus.
    pub fn net_reset(&self, reset_type: ResetType) -> Result<()> {
        self.send(&[
            ServiceIdentifier::EcuReset as u8,
            reset_type as u8 | SUPPRESS_POSITIVE_RESPONSE,
        ])
    }
}

impl Drop for CanBroadcast {
    fn drop(&mut self) {
        self.dispatcher.lock().remove_client(self.client);
    }
}

/// Broadcast services on the local networks.
pub struct IpBroadcast {
    dispatcher: SharedIpDispatcher,
    window: Duration,
}

impl IpBroadcast {
    pub fn new(dispatcher: SharedIpDispatcher, window: Duration) -> Self {
        Self { dispatcher, window }
    }

    fn broadcast(&self, payload_type: PayloadType, payload: &[u8]) -> Result<()> {
        let message = doip::encode(payload_type, payload);
        let mut dispatcher = self.dispatcher.lock();
        // Stale answers of an earlier broadcast
        while dispatcher.read_udp()?.is_some() {}
        dispatcher.send_udp_broadcast(&message)?;
        Ok(())
    }

    /// Next datagram of `payload_type`, with its sender.
    fn next_response(&self, payload_type: PayloadType) -> Result<Option<(Vec<u8>, Ipv4Addr)>> {
        let mut dispatcher = self.dispatcher.lock();
        while let Some((message, ip)) = dispatcher.read_udp()? {
            match doip::decode(&message) {
                Ok((t, payload)) if t == payload_type as u16 => return Ok(Some((payload.to_vec(), ip))),
                Ok((t, _)) => debug!("Ignoring datagram type 0x{:04x} from {}", t, ip),
                Err(e) => debug!("Ignoring datagram from {}: {}", ip, e),
            }
        }
        Ok(None)
    }

    fn collect(&self, payload_type: PayloadType) -> Result<Vec<(Vec<u8>, Ipv4Addr)>> {
        collect_for(self.window, || self.next_response(payload_type))
    }

    fn expect_result(&self, payload_type: PayloadType) -> Result<()> {
        let (payload, ip) = poll_until(self.window, || self.next_response(payload_type))?;
        match payload.first() {
            Some(&RESULT_OK) => Ok(()),
            Some(&code) => {
                debug!("{} rejected the request with 0x{:02x}", ip, code);
                Err(Error::NegativeResponse(code.into()).into())
            }
            None => Err(Error::InvalidResponseLength.into()),
        }
    }

    /// Device name, serial number and address of every device on the local networks.
    pub fn get_device_info(&self) -> Result<Vec<DeviceInfoResult>> {
        self.broadcast(PayloadType::GetDeviceInfoRequest, &[])?;

        let mut results = vec![];
        for (payload, ip) in self.collect(PayloadType::GetDeviceInfoResponse)? {
            let parsed = (|| -> Result<DeviceInfoResult> {
                let address = payload.get(..2).ok_or(Error::InvalidResponseLength)?;
                let name = payload.get(2..2 + DEVICE_NAME_LEN).ok_or(Error::InvalidResponseLength)?;
                let (serial_number, _) = SerialNumber::from_bytes(&payload[2 + DEVICE_NAME_LEN..])?;
                Ok(DeviceInfoResult {
                    sender: decode_address(u16::from_be_bytes([address[0], address[1]]))?,
                    device_name: name.split(|b| *b == 0).next().unwrap_or_default().to_str_lossy().into_owned(),
                    serial_number,
                    ip,
                })
            })();
            match parsed {
                Ok(result) => results.push(result),
                Err(e) => debug!("Ignoring device info from {}: {}", ip, e),
            }
        }
        info!("{} device(s) answered the device info broadcast", results.len());
        Ok(results)
    }

    pub fn read_serial_number(&self) -> Result<Vec<SerialNumberResult>> {
        self.broadcast(PayloadType::ReadSerialNumberRequest, &[])?;

        let mut results = vec![];
        for (payload, ip) in self.collect(PayloadType::ReadSerialNumberResponse)? {
            let parsed = (|| -> Result<SerialNumberResult> {
                let address = payload.get(..2).ok_or(Error::InvalidResponseLength)?;
                let (serial_number, _) = SerialNumber::from_bytes(&payload[2..])?;
                Ok(SerialNumberResult {
                    sender: decode_address(u16::from_be_bytes([address[0], address[1]]))?,
                    serial_number,
                    ip: Some(ip),
                })
            })();
            match parsed {
                Ok(result) => results.push(result),
                Err(e) => debug!("Ignoring serial number from {}: {}", ip, e),
            }
        }
        Ok(results)
    }

    pub fn set_node_id_by_serial_number(&self, serial_number: &SerialNumber, node_id: ServerId) -> Result<()> {
        let mut payload = serial_number.to_bytes();
        payload.extend(encode_address(node_id).to_be_bytes());
        self.broadcast(PayloadType::SetNodeIdRequest, &payload)?;
        self.expect_result(PayloadType::SetNodeIdResponse)?;
        info!("Assigned {} to {}", node_id, serial_number);
        Ok(())
    }

    /// Assign new IP settings to the device with `serial_number`. `node_id` selects the interface
    /// of the device the settings apply to.
    pub fn set_ip_address_by_serial_number(
        &self,
        serial_number: &SerialNumber,
        settings: &IpSettings,
        node_id: ServerId,
    ) -> Result<()> {
        let mut payload = serial_number.to_bytes();
        payload.extend(settings.address.octets());
        payload.extend(settings.netmask.octets());
        payload.extend(settings.gateway.octets());
        payload.extend(encode_address(node_id).to_be_bytes());
        self.broadcast(PayloadType::SetIpAddressRequest, &payload)?;
        self.expect_result(PayloadType::SetIpAddressResponse)?;
        info!("Assigned {} to {}", settings.address, serial_number);
        Ok(())
    }

    pub fn request_programming(&self) -> Result<()> {
        self.broadcast(PayloadType::RequestProgramming, &[])
    }

    pub fn net_reset(&self, reset_type: ResetType) -> Result<()> {
        self.broadcast(PayloadType::NetReset, &[reset_type as u8])
    }
}
