//! Block storage: address cookies, open object handles and the per-btree
//! block manager.
//!
//! A table's btree is stored across a sequence of objects numbered from 1.
//! Only the newest ("current") object is writable; older objects are read-only
//! and may be migrated to an object store, after which their local copies can
//! be reclaimed and later fetched back on demand.

pub mod cookie;
pub mod extent;
pub mod file;
pub mod handle;
pub mod handle_cache;
pub mod manager;

use std::fmt;

pub use cookie::{AddressCookie, BlockAddr};
pub use file::{Advice, FileHandle, FileSystem, LocalFs, MemFs};
pub use handle::{BlockHandle, HandleRef};
pub use handle_cache::{BlockHandleCache, RemoteSource};
pub use manager::{BlockManager, PendingSwitch};

/// Id of the first object of every table.
pub const FIRST_OBJECT_ID: u32 = 1;

/// Identifies one object of one table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub table: String,
    pub object_id: u32,
}

impl ObjectKey {
    pub fn new(table: impl Into<String>, object_id: u32) -> Self {
        Self {
            table: table.into(),
            object_id,
        }
    }

    pub fn local_name(&self) -> String {
        local_object_name(&self.table, self.object_id)
    }

    pub fn remote_name(&self, prefix: &str) -> String {
        remote_object_name(prefix, &self.table, self.object_id)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.table, self.object_id)
    }
}

pub fn local_object_name(table: &str, object_id: u32) -> String {
    format!("{}-{:010}.tobj", table, object_id)
}

pub fn remote_object_name(prefix: &str, table: &str, object_id: u32) -> String {
    format!("{}{}", prefix, local_object_name(table, object_id))
}
