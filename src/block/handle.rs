use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use super::file::FileHandle;
use super::ObjectKey;

/// One open object. Owned by the handle cache; everyone else either holds a
/// counted [`HandleRef`] or a plain `Arc` that must be re-pinned before use.
pub struct BlockHandle {
    key: ObjectKey,
    file: Arc<dyn FileHandle>,
    refs: AtomicUsize,
    removable: AtomicBool,
    swept: AtomicBool,
    read_only: AtomicBool,
}

impl BlockHandle {
    pub(crate) fn new(key: ObjectKey, file: Arc<dyn FileHandle>) -> Self {
        Self {
            key,
            file,
            refs: AtomicUsize::new(0),
            removable: AtomicBool::new(false),
            swept: AtomicBool::new(false),
            read_only: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &ObjectKey {
        &self.key
    }

    pub fn table(&self) -> &str {
        &self.key.table
    }

    pub fn object_id(&self) -> u32 {
        self.key.object_id
    }

    pub fn file(&self) -> &Arc<dyn FileHandle> {
        &self.file
    }

    pub fn refs(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    pub fn is_removable(&self) -> bool {
        self.removable.load(Ordering::Acquire)
    }

    pub fn is_swept(&self) -> bool {
        self.swept.load(Ordering::Acquire)
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    pub(crate) fn set_read_only(&self) {
        self.read_only.store(true, Ordering::Release);
    }

    pub(crate) fn set_removable(&self) {
        self.removable.store(true, Ordering::Release);
    }

    pub(crate) fn set_swept(&self) {
        self.swept.store(true, Ordering::Release);
    }

    /// Only the handle cache calls this, with its lock held.
    pub(crate) fn pin(self: &Arc<Self>) -> HandleRef {
        self.refs.fetch_add(1, Ordering::AcqRel);
        HandleRef {
            handle: self.clone(),
        }
    }
}

impl fmt::Debug for BlockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockHandle")
            .field("key", &self.key)
            .field("refs", &self.refs())
            .field("removable", &self.is_removable())
            .field("read_only", &self.is_read_only())
            .finish()
    }
}

/// A counted reference to a [`BlockHandle`]; the count drops with the guard.
pub struct HandleRef {
    handle: Arc<BlockHandle>,
}

impl HandleRef {
    /// The uncounted handle, for storing in a handle array.
    pub fn handle(&self) -> &Arc<BlockHandle> {
        &self.handle
    }

    pub fn release(self) {}
}

impl Deref for HandleRef {
    type Target = BlockHandle;

    fn deref(&self) -> &BlockHandle {
        &self.handle
    }
}

impl Clone for HandleRef {
    fn clone(&self) -> Self {
        self.handle.pin()
    }
}

impl Drop for HandleRef {
    fn drop(&mut self) {
        let previous = self.handle.refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "handle refcount underflow");
    }
}

impl fmt::Debug for HandleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HandleRef").field(&self.handle).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::file::{FileSystem, MemFs};
    use crate::error::Result;

    #[test]
    fn test_refs_follow_guards() -> Result<()> {
        let fs = MemFs::new();
        let handle = Arc::new(BlockHandle::new(
            ObjectKey::new("t", 1),
            fs.open("t", true)?,
        ));
        assert_eq!(handle.refs(), 0);

        let a = handle.pin();
        let b = a.clone();
        assert_eq!(handle.refs(), 2);

        a.release();
        assert_eq!(handle.refs(), 1);
        drop(b);
        assert_eq!(handle.refs(), 0);
        Ok(())
    }
}
