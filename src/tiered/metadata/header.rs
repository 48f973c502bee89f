//! Fixed 64-byte prefix of the metadata log.
//!
//! ```text
//! 0       8        10       12                16             24                32       60      64
//! | magic | format | unused | snapshot every | next edit seq | next generation | zeroes | crc32 |
//! ```
//!
//! The trailing CRC covers the first 60 bytes, so a header torn by a crash
//! during [`super::MetadataStore::sync`] is reported instead of trusted.

use std::io::Write;

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};

use crate::error::{Error, Result};
use crate::hasher::BLOCK_CRC;

pub const HEADER_SIZE: usize = 64;
const CHECKSUM_AT: usize = HEADER_SIZE - 4;
const MAGIC: &[u8; 8] = b"TIERDBMD";
const FORMAT: u16 = 2;
const DEFAULT_SNAPSHOT_INTERVAL: u32 = 100;

/// Counters that survive restarts without replaying the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataHeader {
    pub current_seq: u64,
    pub next_generation: u64,
    /// Edits between automatic snapshots.
    pub snapshot_interval: u32,
}

impl Default for MetadataHeader {
    fn default() -> Self {
        Self::new()
    }
}

impl MetadataHeader {
    pub fn new() -> Self {
        Self {
            current_seq: 0,
            next_generation: 1,
            snapshot_interval: DEFAULT_SNAPSHOT_INTERVAL,
        }
    }

    pub fn encode(&self) -> Result<[u8; HEADER_SIZE]> {
        let mut buf = [0u8; HEADER_SIZE];
        {
            let mut out = &mut buf[..CHECKSUM_AT];
            out.write_all(MAGIC)?;
            out.write_u16::<BigEndian>(FORMAT)?;
            out.write_u16::<BigEndian>(0)?;
            out.write_u32::<BigEndian>(self.snapshot_interval)?;
            out.write_u64::<BigEndian>(self.current_seq)?;
            out.write_u64::<BigEndian>(self.next_generation)?;
        }
        let crc = BLOCK_CRC.checksum(&buf[..CHECKSUM_AT]);
        BigEndian::write_u32(&mut buf[CHECKSUM_AT..], crc);
        Ok(buf)
    }

    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Result<Self> {
        if &buf[0..8] != MAGIC {
            return Err(Error::InvalidData(
                "not a tierdb metadata log (bad magic)".to_string(),
            ));
        }
        let format = BigEndian::read_u16(&buf[8..10]);
        if format != FORMAT {
            return Err(Error::InvalidData(format!(
                "metadata log format {} is not supported",
                format
            )));
        }
        let stored = BigEndian::read_u32(&buf[CHECKSUM_AT..]);
        let actual = BLOCK_CRC.checksum(&buf[..CHECKSUM_AT]);
        if stored != actual {
            return Err(Error::InvalidData(format!(
                "metadata header checksum {:#010x} does not match {:#010x}",
                stored, actual
            )));
        }

        Ok(Self {
            snapshot_interval: BigEndian::read_u32(&buf[12..16]),
            current_seq: BigEndian::read_u64(&buf[16..24]),
            next_generation: BigEndian::read_u64(&buf[24..32]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_survive_encoding() -> Result<()> {
        let header = MetadataHeader {
            current_seq: 42,
            next_generation: 7,
            snapshot_interval: 10,
        };
        assert_eq!(MetadataHeader::decode(&header.encode()?)?, header);
        Ok(())
    }

    #[test]
    fn test_foreign_file_is_rejected() {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(b"SQLite f");
        assert!(matches!(
            MetadataHeader::decode(&buf),
            Err(Error::InvalidData(_))
        ));
    }

    #[test]
    fn test_unknown_format_is_rejected() -> Result<()> {
        let mut buf = MetadataHeader::new().encode()?;
        BigEndian::write_u16(&mut buf[8..10], 1);
        assert!(matches!(
            MetadataHeader::decode(&buf),
            Err(Error::InvalidData(_))
        ));
        Ok(())
    }

    #[test]
    fn test_torn_counter_fails_checksum() -> Result<()> {
        let mut buf = MetadataHeader::new().encode()?;
        buf[20] ^= 0xff;
        let err = MetadataHeader::decode(&buf).unwrap_err();
        assert!(err.to_string().contains("checksum"));
        Ok(())
    }
}
