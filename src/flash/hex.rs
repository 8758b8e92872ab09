//! Intel HEX images: record parsing with checksum validation, merging into contiguous areas, and
//! lookup of the blocks the flashloader cares about.
use std::path::Path;

use crc::{Crc, CRC_32_ISO_HDLC};

use crate::flash::Error;
use crate::Result;

static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Marks the application information block, followed by the device name.
pub const APPLICATION_BLOCK_MAGIC: &[u8; 8] = b"APP_INFO";
/// Marks the signature block. Its address is reported to the flashloader at the end of a transfer.
pub const SIGNATURE_BLOCK_MAGIC: &[u8; 8] = b"SIG_BLK\0";
const DEVICE_NAME_LEN: usize = 28;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
enum RecordType {
    Data = 0x00,
    EndOfFile = 0x01,
    ExtendedSegmentAddress = 0x02,
    StartSegmentAddress = 0x03,
    ExtendedLinearAddress = 0x04,
    StartLinearAddress = 0x05,
}

impl TryFrom<u8> for RecordType {
    type Error = &'static str;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        Ok(match value {
            0x00 => RecordType::Data,
            0x01 => RecordType::EndOfFile,
            0x02 => RecordType::ExtendedSegmentAddress,
            0x03 => RecordType::StartSegmentAddress,
            0x04 => RecordType::ExtendedLinearAddress,
            0x05 => RecordType::StartLinearAddress,
            _ => return Err("unknown record type"),
        })
    }
}

/// Contiguous memory area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HexArea {
    pub address: u32,
    pub data: Vec<u8>,
}

impl HexArea {
    pub fn end(&self) -> u64 {
        self.address as u64 + self.data.len() as u64
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HexFile {
    /// Sorted by address, never overlapping or adjacent
    pub areas: Vec<HexArea>,
    pub start_address: Option<u32>,
}

fn parse_record(line: &str) -> std::result::Result<(RecordType, u16, Vec<u8>), &'static str> {
    let body = line.strip_prefix(':').ok_or("missing start code")?;
    let bytes = hex::decode(body).map_err(|_| "invalid hex digits")?;
    if bytes.len() < 5 {
        return Err("record too short");
    }
    let len = bytes[0] as usize;
    if bytes.len() != len + 5 {
        return Err("length mismatch");
    }
    let sum = bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    if sum != 0 {
        return Err("checksum mismatch");
    }
    let record_type = RecordType::try_from(bytes[3])?;
    let offset = u16::from_be_bytes([bytes[1], bytes[2]]);
    Ok((record_type, offset, bytes[4..4 + len].to_vec()))
}

impl HexFile {
    pub fn parse(text: &str) -> Result<Self> {
        let mut file = HexFile::default();
        let mut base: u32 = 0;
        let mut finished = false;

        for (number, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let invalid = |reason| Error::HexRecord {
                line: number + 1,
                reason,
            };
            if finished {
                return Err(invalid("data after end of file").into());
            }

            let (record_type, offset, data) = parse_record(line).map_err(invalid)?;
            match record_type {
                RecordType::Data => {
                    let address = base.checked_add(offset as u32).ok_or(invalid("address overflow"))?;
                    file.insert(address, &data)?;
                }
                RecordType::EndOfFile => finished = true,
                RecordType::ExtendedSegmentAddress => {
                    let segment = data.get(..2).ok_or(invalid("short address record"))?;
                    base = (u16::from_be_bytes([segment[0], segment[1]]) as u32) << 4;
                }
                RecordType::ExtendedLinearAddress => {
                    let upper = data.get(..2).ok_or(invalid("short address record"))?;
                    base = (u16::from_be_bytes([upper[0], upper[1]]) as u32) << 16;
                }
                RecordType::StartSegmentAddress | RecordType::StartLinearAddress => {
                    let start: [u8; 4] = data.as_slice().try_into().map_err(|_| invalid("short start record"))?;
                    file.start_address = Some(u32::from_be_bytes(start));
                }
            }
        }

        if !finished {
            return Err(Error::HexRecord {
                line: text.lines().count(),
                reason: "missing end of file record",
            }
            .into());
        }
        Ok(file)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Add data, joining it with adjacent areas. Later data overwrites earlier data.
    fn insert(&mut self, address: u32, data: &[u8]) -> Result<()> {
        let end = address as u64 + data.len() as u64;
        if end > u32::MAX as u64 + 1 {
            return Err(Error::AreaTooLarge { address }.into());
        }

        let mut merged = HexArea {
            address,
            data: data.to_vec(),
        };
        let mut kept = Vec::with_capacity(self.areas.len() + 1);
        for area in std::mem::take(&mut self.areas) {
            if area.end() < merged.address as u64 || area.address as u64 > merged.end() {
                kept.push(area);
                continue;
            }
            let start = area.address.min(merged.address);
            let stop = area.end().max(merged.end());
            let mut data = vec![0xff; (stop - start as u64) as usize];
            let old = (area.address - start) as usize;
            data[old..old + area.data.len()].copy_from_slice(&area.data);
            let new = (merged.address - start) as usize;
            data[new..new + merged.data.len()].copy_from_slice(&merged.data);
            merged = HexArea { address: start, data };
        }
        kept.push(merged);
        kept.sort_by_key(|a| a.address);
        self.areas = kept;
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.areas.iter().map(|a| a.data.len()).sum()
    }

    fn find(&self, magic: &[u8]) -> Option<(u32, &[u8])> {
        self.areas.iter().find_map(|area| {
            let position = area.data.windows(magic.len()).position(|w| w == magic)?;
            Some((area.address + position as u32, &area.data[position + magic.len()..]))
        })
    }

    /// Device name stored in the application information block.
    pub fn device_name(&self) -> Option<String> {
        let (_, rest) = self.find(APPLICATION_BLOCK_MAGIC)?;
        let name = rest.get(..DEVICE_NAME_LEN).unwrap_or(rest);
        let name = name.split(|b| *b == 0).next().unwrap_or_default();
        Some(String::from_utf8_lossy(name).into_owned())
    }

    /// Address of the signature block, if the image carries one.
    pub fn signature_address(&self) -> Option<u32> {
        self.find(SIGNATURE_BLOCK_MAGIC).map(|(address, _)| address)
    }
}

/// CRC-32 as reported at the end of a file based transfer.
pub fn crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(record_type: u8, offset: u16, data: &[u8]) -> String {
        let mut bytes = vec![data.len() as u8];
        bytes.extend(offset.to_be_bytes());
        bytes.push(record_type);
        bytes.extend(data);
        let sum = bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
        bytes.push(sum.wrapping_neg());
        format!(":{}", hex::encode_upper(bytes))
    }

    #[test]
    fn crc32_check_value() {
        assert_eq!(crc32(b"123456789"), 0xcbf4_3926);
    }

    #[test]
    fn parses_and_merges_areas() {
        let text = [
            record(0x04, 0, &[0x00, 0x01]),
            record(0x00, 0x0000, &[1, 2, 3, 4]),
            record(0x00, 0x0004, &[5, 6]),
            record(0x00, 0x1000, &[9]),
            record(0x05, 0, &[0x00, 0x01, 0x00, 0x00]),
            ":00000001FF".to_string(),
        ]
        .join("\n");
        let file = HexFile::parse(&text).unwrap();
        assert_eq!(
            file.areas,
            vec![
                HexArea {
                    address: 0x1_0000,
                    data: vec![1, 2, 3, 4, 5, 6]
                },
                HexArea {
                    address: 0x1_1000,
                    data: vec![9]
                },
            ]
        );
        assert_eq!(file.start_address, Some(0x1_0000));
        assert_eq!(file.size(), 7);
    }

    #[test]
    fn rejects_bad_checksum() {
        let text = ":0400000001020304F1\n:00000001FF\n";
        assert!(matches!(
            HexFile::parse(text),
            Err(crate::Error::FlashError(Error::HexRecord { line: 1, .. }))
        ));
    }

    #[test]
    fn requires_end_of_file() {
        let text = record(0x00, 0, &[1]);
        assert!(HexFile::parse(&text).is_err());
    }

    #[test]
    fn finds_blocks() {
        let mut image = vec![0u8; 4];
        image.extend(APPLICATION_BLOCK_MAGIC);
        let mut name = b"ESX-3CM".to_vec();
        name.resize(DEVICE_NAME_LEN, 0);
        image.extend(name);
        image.extend(SIGNATURE_BLOCK_MAGIC);

        let text = [record(0x00, 0x0100, &image), ":00000001FF".to_string()].join("\n");
        let file = HexFile::parse(&text).unwrap();
        assert_eq!(file.device_name().as_deref(), Some("ESX-3CM"));
        assert_eq!(file.signature_address(), Some(0x100 + 4 + 8 + 28));
    }
}
