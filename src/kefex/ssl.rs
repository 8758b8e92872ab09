//! CRC guarded bulk memory writes ("SSL" mode). The tool announces the number of write services,
//! streams them, then sends the CRC it accumulated over every address and value byte together with
//! the count. The server echoes what it received.

use crc::{Crc, Digest, CRC_16_SPI_FUJITSU};
use tracing::{debug, warn};

use crate::error::Error;
use crate::kefex::constants::ServiceTag;
use crate::kefex::locks::LockCategory;
use crate::kefex::{Error as KefexError, KefexProtocol};
use crate::Result;

/// CCITT polynomial 0x1021 seeded with 0x1d0f, no reflection, no final xor.
static CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_SPI_FUJITSU);

/// CRC over a complete buffer.
pub fn crc16(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

/// Running CRC of an SSL transfer.
#[derive(Clone)]
pub struct SslCrc {
    digest: Digest<'static, u16>,
}

impl Default for SslCrc {
    fn default() -> Self {
        Self::new()
    }
}

impl SslCrc {
    pub fn new() -> Self {
        Self {
            digest: CRC16.digest(),
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.digest.update(bytes);
    }

    pub fn value(&self) -> u16 {
        self.digest.clone().finalize()
    }
}

impl KefexProtocol {
    /// Write `data` to server memory starting at `address`, one word service per two bytes and a
    /// trailing byte service for odd lengths, guarded by the SSL start/end handshake.
    pub fn write_memory(&self, address: u32, data: &[u8]) -> Result<()> {
        self.ssl_write(address, data)
    }

    /// EEPROM is written through the same services as RAM and flash.
    pub fn write_eeprom(&self, address: u32, data: &[u8]) -> Result<()> {
        self.ssl_write(address, data)
    }

    fn ssl_write(&self, address: u32, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        address.checked_add(data.len() as u32 - 1).ok_or(Error::Range)?;
        let count = u16::try_from(data.len().div_ceil(2)).map_err(|_| Error::Range)?;

        let _guard = self.locks().acquire(LockCategory::EepromWrite);

        self.request(ServiceTag::SslStart, &count.to_le_bytes())?;
        let start = self.wait_response(ServiceTag::SslStart, None)?;
        if start.value_u16() != count {
            return Err(KefexError::UnexpectedEcho.into());
        }

        let mut crc = SslCrc::new();
        for (i, chunk) in data.chunks(2).enumerate() {
            let chunk_address = address + 2 * i as u32;
            let tag = if chunk.len() == 2 {
                ServiceTag::WriteWord
            } else {
                ServiceTag::WriteByte
            };

            let mut payload = chunk_address.to_le_bytes().to_vec();
            payload.extend(chunk);
            crc.update(&payload);

            self.request(tag, &payload)?;
            let response = self.wait_response(tag, Some(chunk_address))?;
            if response.payload() != chunk {
                return Err(KefexError::UnexpectedEcho.into());
            }
        }

        let expected_crc = crc.value();
        let mut end = expected_crc.to_le_bytes().to_vec();
        end.extend(count.to_le_bytes());
        self.request(ServiceTag::SslEnd, &end)?;

        let response = self.wait_response(ServiceTag::SslEnd, None)?;
        let echo = response.payload();
        if echo.len() < 4 {
            return Err(KefexError::MalformedResponse.into());
        }
        let echoed_crc = u16::from_le_bytes([echo[0], echo[1]]);
        let echoed_count = u16::from_le_bytes([echo[2], echo[3]]);

        if echoed_crc != expected_crc || echoed_count != count {
            warn!(
                "SSL write at 0x{:08x} rejected: crc 0x{:04x} echoed 0x{:04x}, count {} echoed {}",
                address, expected_crc, echoed_crc, count, echoed_count
            );
            return Err(KefexError::SslMismatch {
                expected_crc,
                echoed_crc,
                expected_count: count,
                echoed_count,
            }
            .into());
        }

        debug!("SSL write of {} bytes at 0x{:08x} confirmed", data.len(), address);
        Ok(())
    }
}
