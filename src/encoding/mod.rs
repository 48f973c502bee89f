//! Serialization helpers for page payloads and checkpoint roots.
//!
//! Block addresses have their own fixed binary format (see `block::cookie`);
//! everything stored *inside* a block is encoded with bincode.

pub mod bincode;

pub use self::bincode::{deserialize, serialize};
