use std::fmt;

use crc::{Crc, Digest, CRC_32_ISCSI, CRC_64_ECMA_182};

/// Checksum stored in address cookies for every block.
pub const BLOCK_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Used for plan-cache key fingerprints.
pub static SHAPE_CRC: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

/// Computes the checksum of a block payload.
pub fn block_checksum(data: &[u8]) -> u32 {
    BLOCK_CRC.checksum(data)
}

/// Incremental 64-bit hasher over a sequence of byte fragments.
#[derive(Clone)]
pub struct Hasher {
    digest: Digest<'static, u64>,
}

impl fmt::Debug for Hasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hasher")
    }
}

impl Hasher {
    pub fn new() -> Self {
        Self {
            digest: SHAPE_CRC.digest(),
        }
    }

    pub fn write(&mut self, data: &[u8]) {
        self.digest.update(data);
    }

    /// Writes a length-prefixed fragment so `("ab", "c")` and `("a", "bc")` differ.
    pub fn write_str(&mut self, s: &str) {
        self.digest.update(&(s.len() as u32).to_be_bytes());
        self.digest.update(s.as_bytes());
    }

    pub fn checksum(&self) -> u64 {
        self.digest.clone().finalize()
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}
