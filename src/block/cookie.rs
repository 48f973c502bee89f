//! Address cookies: the on-disk encoding of a block location.
//!
//! ```text
//! triple:    | 0x03 | offset:u64 | size:u32 | checksum:u32 |               (17 bytes)
//! quadruple: | 0x04 | offset:u64 | size:u32 | checksum:u32 | object_id:u32 |  (21 bytes)
//! ```
//!
//! All integers are big-endian. A triple always refers to the object the cookie
//! is stored in (object id 0); a quadruple names another object explicitly and
//! never carries object id 0.

use std::fmt;
use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const TRIPLE_TAG: u8 = 0x03;
pub const QUAD_TAG: u8 = 0x04;
pub const TRIPLE_LEN: usize = 17;
pub const QUAD_LEN: usize = 21;

/// A block location relative to the object that stores the reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressCookie {
    pub offset: u64,
    pub size: u32,
    pub checksum: u32,
    /// 0 means "the object holding this cookie".
    pub object_id: u32,
}

/// An absolute block location: which object, where, and what it should hash to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockAddr {
    pub object_id: u32,
    pub offset: u64,
    pub size: u32,
    pub checksum: u32,
}

impl AddressCookie {
    pub fn triple(offset: u64, size: u32, checksum: u32) -> Self {
        Self {
            offset,
            size,
            checksum,
            object_id: 0,
        }
    }

    pub fn quad(offset: u64, size: u32, checksum: u32, object_id: u32) -> Self {
        Self {
            offset,
            size,
            checksum,
            object_id,
        }
    }

    pub fn is_triple(&self) -> bool {
        self.object_id == 0
    }

    pub fn encoded_len(&self) -> usize {
        if self.is_triple() {
            TRIPLE_LEN
        } else {
            QUAD_LEN
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        let tag = if self.is_triple() { TRIPLE_TAG } else { QUAD_TAG };
        buf.push(tag);
        buf.extend_from_slice(&self.offset.to_be_bytes());
        buf.extend_from_slice(&self.size.to_be_bytes());
        buf.extend_from_slice(&self.checksum.to_be_bytes());
        if !self.is_triple() {
            buf.extend_from_slice(&self.object_id.to_be_bytes());
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let tag = *buf
            .first()
            .ok_or_else(|| Error::InvalidCookie("empty cookie".to_string()))?;

        let expected_len = match tag {
            TRIPLE_TAG => TRIPLE_LEN,
            QUAD_TAG => QUAD_LEN,
            other => {
                return Err(Error::InvalidCookie(format!(
                    "unknown cookie tag {:#04x}",
                    other
                )))
            }
        };
        if buf.len() != expected_len {
            return Err(Error::InvalidCookie(format!(
                "cookie with tag {:#04x} must be {} bytes, got {}",
                tag,
                expected_len,
                buf.len()
            )));
        }

        let mut cursor = Cursor::new(&buf[1..]);
        let offset = cursor.read_u64::<BigEndian>()?;
        let size = cursor.read_u32::<BigEndian>()?;
        let checksum = cursor.read_u32::<BigEndian>()?;

        if tag == TRIPLE_TAG {
            return Ok(Self::triple(offset, size, checksum));
        }

        let object_id = cursor.read_u32::<BigEndian>()?;
        if object_id == 0 {
            return Err(Error::InvalidCookie(
                "quadruple cookie carries object id 0".to_string(),
            ));
        }
        Ok(Self::quad(offset, size, checksum, object_id))
    }

    /// Turns the cookie into an absolute address, given the object it was read from.
    pub fn resolve_at(&self, site: u32) -> BlockAddr {
        let object_id = if self.is_triple() {
            site
        } else {
            self.object_id
        };
        BlockAddr {
            object_id,
            offset: self.offset,
            size: self.size,
            checksum: self.checksum,
        }
    }
}

impl fmt::Display for AddressCookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}: {}-{}, {}, {:#010x}]",
            self.object_id,
            self.offset,
            self.offset.saturating_add(self.size as u64),
            self.size,
            self.checksum
        )
    }
}

impl BlockAddr {
    /// Cookie for this block as stored inside object `site`.
    pub fn cookie_at(&self, site: u32) -> AddressCookie {
        if self.object_id == site {
            AddressCookie::triple(self.offset, self.size, self.checksum)
        } else {
            AddressCookie::quad(self.offset, self.size, self.checksum, self.object_id)
        }
    }

    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.size as u64)
    }
}
