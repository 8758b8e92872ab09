//! Translation between 8 byte bus frames and typed service responses, and the single-slot response
//! cache the polling loop reads from.

use tracing::warn;

use crate::kefex::constants::{response_layout, PayloadKind, ServiceTag, ERROR_BIT, TAG_MASK};
use crate::kefex::error::Error;

/// Maximum request payload after the server address and tag bytes.
pub const MAX_REQUEST_PAYLOAD: usize = 6;

/// Decoded response to a request.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct ServiceResponse {
    pub service: u8,
    /// Index or address, depending on the service
    pub index: u32,
    pub data: [u8; 7],
    /// Number of valid bytes in `data`
    pub len: u8,
    pub is_new: bool,
    pub is_error: bool,
    /// Set when this response replaced one that was never consumed
    pub was_overrun: bool,
}

impl ServiceResponse {
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    pub fn tag(&self) -> Option<ServiceTag> {
        ServiceTag::from_repr(self.service)
    }

    pub fn value_u16(&self) -> u16 {
        u16::from_le_bytes([self.data[0], self.data[1]])
    }

    pub fn value_u32(&self) -> u32 {
        u32::from_le_bytes([self.data[0], self.data[1], self.data[2], self.data[3]])
    }

    /// Reason code of an error response.
    pub fn error_code(&self) -> Option<u8> {
        if self.is_error {
            Some(self.data[0])
        } else {
            None
        }
    }
}

/// Event-style transmission registered with one of the cyclic services.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CyclicTransmission {
    pub index: u32,
    pub value: i64,
    pub timestamp: u16,
    pub is_timestamped: bool,
    pub is_error: bool,
}

/// Receiver of cyclic transmissions. Runs on whichever thread drives the protocol and must not call
/// back into it.
pub type CyclicCallback = Box<dyn FnMut(CyclicTransmission) + Send>;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Decoded {
    Response(ServiceResponse),
    Cyclic(CyclicTransmission),
}

fn read_le(bytes: &[u8]) -> u32 {
    bytes.iter().rev().fold(0, |acc, &b| (acc << 8) | b as u32)
}

/// Decode the data bytes of a response frame.
pub fn decode(data: &[u8]) -> Result<Decoded, Error> {
    let first = *data.first().ok_or(Error::MalformedResponse)?;
    let is_error = first & ERROR_BIT != 0;
    let tag = ServiceTag::from_repr(first & TAG_MASK).ok_or(Error::UnknownService(first & TAG_MASK))?;
    let layout = response_layout(tag);

    let index_end = 1 + layout.index_width;
    if data.len() < index_end {
        return Err(Error::MalformedResponse);
    }
    let index = read_le(&data[1..index_end]);
    let rest = &data[index_end..];

    let payload = if is_error {
        rest.get(..1).ok_or(Error::MalformedResponse)?
    } else {
        match layout.payload {
            PayloadKind::None => &rest[..0],
            PayloadKind::Pair => rest.get(..2).ok_or(Error::MalformedResponse)?,
            PayloadKind::Quad => rest.get(..4).ok_or(Error::MalformedResponse)?,
            PayloadKind::Raw(max) => &rest[..rest.len().min(max)],
        }
    };

    if tag.is_cyclic() {
        let (value, timestamp) = match (is_error, tag) {
            (true, _) => (payload[0] as i64, 0),
            (false, ServiceTag::CyclicTimestamped) => {
                if payload.len() < 4 {
                    return Err(Error::MalformedResponse);
                }
                let value = i16::from_le_bytes([payload[0], payload[1]]) as i64;
                (value, u16::from_le_bytes([payload[2], payload[3]]))
            }
            (false, _) => (read_le(payload) as i32 as i64, 0),
        };
        return Ok(Decoded::Cyclic(CyclicTransmission {
            index,
            value,
            timestamp,
            is_timestamped: tag == ServiceTag::CyclicTimestamped,
            is_error,
        }));
    }

    let mut response = ServiceResponse {
        service: tag as u8,
        index,
        len: payload.len() as u8,
        is_error,
        ..Default::default()
    };
    response.data[..payload.len()].copy_from_slice(payload);
    Ok(Decoded::Response(response))
}

/// Encode a request `[server, tag, payload...]`.
pub fn encode_request(server_address: u8, tag: ServiceTag, payload: &[u8]) -> Result<Vec<u8>, Error> {
    if payload.len() > MAX_REQUEST_PAYLOAD {
        return Err(Error::RequestTooLong(payload.len()));
    }
    let mut buf = vec![server_address, tag as u8];
    buf.extend(payload);
    Ok(buf)
}

/// The "last response" slot. Only one response is in flight per session; a response arriving while
/// the previous one was not consumed overwrites it and is flagged as overrun.
#[derive(Debug, Default)]
pub struct ResponseSlot {
    response: Option<ServiceResponse>,
}

impl ResponseSlot {
    pub fn set(&mut self, mut response: ServiceResponse) {
        if let Some(previous) = &self.response {
            if previous.is_new {
                warn!(
                    "Response 0x{:02x} overwritten by 0x{:02x} before it was read",
                    previous.service, response.service
                );
                response.was_overrun = true;
            }
        }
        response.is_new = true;
        self.response = Some(response);
    }

    pub fn peek(&self) -> Option<&ServiceResponse> {
        self.response.as_ref()
    }

    /// Consume the unread response, if any.
    pub fn take(&mut self) -> Option<ServiceResponse> {
        let response = self.response.as_mut().filter(|r| r.is_new)?;
        let copy = *response;
        response.is_new = false;
        Some(copy)
    }

    /// Consume the unread response only if it answers `tag`.
    pub fn take_matching(&mut self, tag: ServiceTag) -> Option<ServiceResponse> {
        match &self.response {
            Some(r) if r.is_new && r.service == tag as u8 => self.take(),
            _ => None,
        }
    }

    pub fn clear(&mut self) {
        self.response = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_payload_fits_one_frame() {
        let frame = encode_request(5, ServiceTag::Logon, &[0x34, 0x12]).unwrap();
        assert_eq!(frame, vec![5, ServiceTag::Logon as u8, 0x34, 0x12]);
        assert_eq!(
            encode_request(5, ServiceTag::SegmentedWriteConsecutive, &[0; 7]),
            Err(Error::RequestTooLong(7))
        );
    }

    #[test]
    fn decode_single_read() {
        let decoded = decode(&[0x01, 0x34, 0x12, 0x78, 0x56, 0x34, 0x12]).unwrap();
        let Decoded::Response(r) = decoded else {
            panic!("expected a response");
        };
        assert_eq!(r.index, 0x1234);
        assert_eq!(r.value_u32(), 0x1234_5678);
        assert!(!r.is_error);
    }

    #[test]
    fn decode_error_response() {
        let Decoded::Response(r) = decode(&[0x81, 0x34, 0x12, 0x01]).unwrap() else {
            panic!("expected a response");
        };
        assert!(r.is_error);
        assert_eq!(r.error_code(), Some(0x01));
    }

    #[test]
    fn decode_cyclic_bypasses_responses() {
        let decoded = decode(&[0x1e, 0x05, 0x00, 0xfe, 0xff, 0x10, 0x00]).unwrap();
        assert_eq!(
            decoded,
            Decoded::Cyclic(CyclicTransmission {
                index: 5,
                value: -2,
                timestamp: 0x10,
                is_timestamped: true,
                is_error: false,
            })
        );
    }

    #[test]
    fn decode_short_frame_is_malformed() {
        assert_eq!(decode(&[0x01, 0x34]), Err(Error::MalformedResponse));
        assert_eq!(decode(&[0x7d]), Err(Error::UnknownService(0x7d)));
    }

    #[test]
    fn overrun_last_writer_wins() {
        let mut slot = ResponseSlot::default();
        slot.set(ServiceResponse {
            service: 0x01,
            ..Default::default()
        });
        slot.set(ServiceResponse {
            service: 0x02,
            ..Default::default()
        });

        let r = slot.take().unwrap();
        assert_eq!(r.service, 0x02);
        assert!(r.was_overrun);
        assert_eq!(slot.take(), None);

        // Consumed responses do not cause an overrun
        slot.set(ServiceResponse {
            service: 0x03,
            ..Default::default()
        });
        assert!(!slot.take().unwrap().was_overrun);
    }

    #[test]
    fn take_matching_leaves_other_tags() {
        let mut slot = ResponseSlot::default();
        slot.set(ServiceResponse {
            service: ServiceTag::Logon as u8,
            ..Default::default()
        });
        assert_eq!(slot.take_matching(ServiceTag::Logoff), None);
        assert!(slot.take_matching(ServiceTag::Logon).is_some());
    }
}
