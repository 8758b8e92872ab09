//! Types used by the modern diagnostic protocol.
use std::time::Duration;

use bstr::ByteSlice;
use serde::{Deserialize, Serialize};

/// Struct returned by DiagnosticSessionControl (0x10)
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct SessionParameterRecord {
    /// Performance requirement for the server (i.e. the ECU) to start with th response message after the reception of a request message.
    pub p2_server_max: Duration,
    /// Performance requirement for the server (i.e. the ECU) to start with the response message after the transmission of a "ResponsePending" message.
    pub p2_star_server_max: Duration,
}

/// Who programmed the device last and when. Stored by the flashloader before every update.
#[derive(Debug, Clone, Eq, PartialEq, Default, Serialize, Deserialize)]
pub struct Fingerprint {
    /// Year (two digits), month, day
    pub date: (u8, u8, u8),
    /// Hour, minute, second
    pub time: (u8, u8, u8),
    pub username: String,
}

const FINGERPRINT_USERNAME_LEN: usize = 20;

impl Fingerprint {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![
            self.date.0,
            self.date.1,
            self.date.2,
            self.time.0,
            self.time.1,
            self.time.2,
        ];
        let mut name = self.username.as_bytes().to_vec();
        name.resize(FINGERPRINT_USERNAME_LEN, 0);
        buf.extend(name);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < 6 {
            return None;
        }
        let name = buf[6..].split(|b| *b == 0).next().unwrap_or_default();
        Some(Self {
            date: (buf[0], buf[1], buf[2]),
            time: (buf[3], buf[4], buf[5]),
            username: name.to_str_lossy().into_owned(),
        })
    }
}

/// Optional flashloader capabilities, reported as a 32 bit big-endian bitfield.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default, Serialize, Deserialize)]
pub struct FeatureSet {
    pub flash_count: bool,
    pub can_routing: bool,
    pub ethernet_routing: bool,
    pub file_based_transfer: bool,
    pub security: bool,
    pub debugger_control: bool,
    pub extended_serial_number: bool,
    pub max_block_length: bool,
}

impl FeatureSet {
    pub fn from_bits(bits: u32) -> Self {
        let bit = |n: u32| bits & (1 << n) != 0;
        Self {
            flash_count: bit(0),
            can_routing: bit(1),
            ethernet_routing: bit(2),
            file_based_transfer: bit(3),
            security: bit(4),
            debugger_control: bit(5),
            extended_serial_number: bit(6),
            max_block_length: bit(7),
        }
    }

    pub fn to_bits(&self) -> u32 {
        [
            self.flash_count,
            self.can_routing,
            self.ethernet_routing,
            self.file_based_transfer,
            self.security,
            self.debugger_control,
            self.extended_serial_number,
            self.max_block_length,
        ]
        .iter()
        .enumerate()
        .fold(0, |acc, (n, set)| acc | ((*set as u32) << n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_username_is_nul_padded() {
        let fingerprint = Fingerprint {
            date: (24, 3, 1),
            time: (12, 30, 0),
            username: "flasher".into(),
        };
        let bytes = fingerprint.to_bytes();
        assert_eq!(bytes.len(), 26);
        assert_eq!(Fingerprint::from_bytes(&bytes), Some(fingerprint));
    }

    #[test]
    fn feature_bits() {
        let features = FeatureSet::from_bits(0b1000_0110);
        assert!(features.can_routing && features.ethernet_routing && features.max_block_length);
        assert!(!features.flash_count);
        assert_eq!(features.to_bits(), 0b1000_0110);
    }
}
