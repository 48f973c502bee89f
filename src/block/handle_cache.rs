//! Connection-wide registry of open objects.
//!
//! `acquire` and `pin` run under the shared lock and bump an atomic refcount;
//! `sweep` runs under the exclusive lock, so a handle is never reclaimed
//! between a reader finding it and counting itself in.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::file::FileSystem;
use super::handle::{BlockHandle, HandleRef};
use super::ObjectKey;
use crate::error::{Error, Result};
use crate::tiered::object_store::ObjectStore;

/// Where confirmed remote copies are fetched from on rehydration.
#[derive(Clone)]
pub struct RemoteSource {
    pub store: Arc<dyn ObjectStore>,
    pub bucket: String,
    pub prefix: String,
}

#[derive(Default)]
struct Inner {
    handles: HashMap<ObjectKey, Arc<BlockHandle>>,
    /// Objects with a confirmed remote copy.
    remote: HashSet<ObjectKey>,
    /// Objects removed everywhere; acquiring them fails.
    tombstones: HashSet<ObjectKey>,
    /// Removable objects that are not open; their local files go on the next sweep.
    orphans: HashSet<ObjectKey>,
}

pub struct BlockHandleCache {
    fs: Arc<dyn FileSystem>,
    remote: Option<RemoteSource>,
    inner: RwLock<Inner>,
    rehydrate_seq: AtomicU64,
}

impl BlockHandleCache {
    pub fn new(fs: Arc<dyn FileSystem>, remote: Option<RemoteSource>) -> Self {
        Self {
            fs,
            remote,
            inner: RwLock::new(Inner::default()),
            rehydrate_seq: AtomicU64::new(0),
        }
    }

    pub fn file_system(&self) -> &Arc<dyn FileSystem> {
        &self.fs
    }

    /// Returns a counted reference to the object, opening it if needed.
    pub fn acquire(&self, table: &str, object_id: u32) -> Result<HandleRef> {
        self.acquire_key(ObjectKey::new(table, object_id), false)
    }

    /// Like `acquire`, but creates an empty local object if none exists.
    pub fn create(&self, table: &str, object_id: u32) -> Result<HandleRef> {
        self.acquire_key(ObjectKey::new(table, object_id), true)
    }

    fn acquire_key(&self, key: ObjectKey, create: bool) -> Result<HandleRef> {
        loop {
            {
                let inner = self.inner.read();
                if inner.tombstones.contains(&key) {
                    return Err(Error::NotFound(format!("object {} was removed", key)));
                }
                if let Some(handle) = inner.handles.get(&key) {
                    return Ok(handle.pin());
                }
            }

            // Open outside the lock; another thread may race us to insert.
            let opened = Arc::new(self.open_object(&key, create)?);

            let mut inner = self.inner.write();
            if inner.tombstones.contains(&key) {
                return Err(Error::NotFound(format!("object {} was removed", key)));
            }
            if let Some(existing) = inner.handles.get(&key) {
                return Ok(existing.pin());
            }
            if !self.fs.exists(&key.local_name()) {
                // A sweep reclaimed the file after we opened it.
                debug!(table = %key.table, object_id = key.object_id, "Object swept while opening");
                continue;
            }
            if inner.remote.contains(&key) && inner.orphans.remove(&key) {
                opened.set_removable();
            }
            inner.handles.insert(key.clone(), opened.clone());
            debug!(table = %key.table, object_id = key.object_id, "Opened object handle");
            return Ok(opened.pin());
        }
    }

    fn open_object(&self, key: &ObjectKey, create: bool) -> Result<BlockHandle> {
        let name = key.local_name();
        if self.fs.exists(&name) {
            return Ok(BlockHandle::new(key.clone(), self.fs.open(&name, false)?));
        }

        let has_remote = self.inner.read().remote.contains(key);
        if has_remote {
            let handle = BlockHandle::new(key.clone(), self.rehydrate(key)?);
            // The local copy is only a cache of the remote one.
            handle.set_read_only();
            handle.set_removable();
            return Ok(handle);
        }

        if create {
            return Ok(BlockHandle::new(key.clone(), self.fs.open(&name, true)?));
        }
        Err(Error::NotFound(format!("object {} has no local file", key)))
    }

    fn rehydrate(&self, key: &ObjectKey) -> Result<Arc<dyn super::FileHandle>> {
        let remote = self.remote.as_ref().ok_or_else(|| {
            Error::NotFound(format!(
                "object {} is remote but no object store is configured",
                key
            ))
        })?;

        let remote_name = key.remote_name(&remote.prefix);
        let mut reader = remote.store.get_object(&remote.bucket, &remote_name)?;

        // Stage under a unique name so concurrent rehydrations don't interleave.
        let seq = self.rehydrate_seq.fetch_add(1, Ordering::Relaxed);
        let staging = format!("{}.rehydrate-{}", key.local_name(), seq);
        let file = self.fs.open(&staging, true)?;

        let mut buf = vec![0u8; 64 * 1024];
        let mut offset = 0u64;
        loop {
            let n = match io::Read::read(&mut reader, &mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.fs.remove(&staging)?;
                    return Err(e.into());
                }
            };
            file.write_at(&buf[..n], offset)?;
            offset += n as u64;
        }
        file.sync()?;
        drop(file);

        self.fs.rename(&staging, &key.local_name())?;
        info!(
            table = %key.table,
            object_id = key.object_id,
            bytes = offset,
            "Rehydrated object from remote storage"
        );
        self.fs.open(&key.local_name(), false)
    }

    /// Counts a new reference to a handle the caller already knows about.
    /// Fails with `ConcurrentModification` if a sweep reclaimed it meanwhile.
    pub fn pin(&self, handle: &Arc<BlockHandle>) -> Result<HandleRef> {
        let _inner = self.inner.read();
        if handle.is_swept() {
            return Err(Error::ConcurrentModification {
                table: handle.table().to_string(),
                object_id: handle.object_id(),
            });
        }
        Ok(handle.pin())
    }

    pub fn release(&self, handle: HandleRef) {
        handle.release();
    }

    /// Records that a remote copy of the object is confirmed.
    pub fn mark_remote(&self, table: &str, object_id: u32) {
        self.inner
            .write()
            .remote
            .insert(ObjectKey::new(table, object_id));
    }

    pub fn has_remote(&self, table: &str, object_id: u32) -> bool {
        self.inner
            .read()
            .remote
            .contains(&ObjectKey::new(table, object_id))
    }

    /// Allows the local copy to be reclaimed once nobody references it.
    pub fn mark_removable(&self, table: &str, object_id: u32) {
        let key = ObjectKey::new(table, object_id);
        let mut inner = self.inner.write();
        inner.remote.insert(key.clone());
        match inner.handles.get(&key) {
            Some(handle) => handle.set_removable(),
            None => {
                inner.orphans.insert(key);
            }
        }
    }

    /// The object is gone everywhere: later acquires fail with `NotFound`.
    pub fn tombstone(&self, table: &str, object_id: u32) {
        let key = ObjectKey::new(table, object_id);
        let mut inner = self.inner.write();
        inner.remote.remove(&key);
        match inner.handles.get(&key) {
            Some(handle) => handle.set_removable(),
            None => {
                inner.orphans.insert(key.clone());
            }
        }
        inner.tombstones.insert(key);
    }

    /// Forgets every unreferenced handle of a table, e.g. before a rename.
    pub fn close_table(&self, table: &str) -> Result<()> {
        let mut inner = self.inner.write();
        if let Some(busy) = inner
            .handles
            .values()
            .find(|h| h.table() == table && h.refs() > 0)
        {
            return Err(Error::InvalidState(format!(
                "object {} still has {} references",
                busy.key(),
                busy.refs()
            )));
        }
        inner.handles.retain(|key, handle| {
            if key.table == table {
                handle.set_swept();
                false
            } else {
                true
            }
        });
        inner.remote.retain(|key| key.table != table);
        inner.orphans.retain(|key| key.table != table);
        Ok(())
    }

    /// Reclaims every unreferenced removable handle: deletes its local file
    /// and drops the cache entry. A file that cannot be removed stays
    /// registered for the next sweep. Returns what was reclaimed.
    pub fn sweep(&self) -> Vec<ObjectKey> {
        let mut inner = self.inner.write();

        let victims: Vec<ObjectKey> = inner
            .handles
            .iter()
            .filter(|(_, handle)| handle.refs() == 0 && handle.is_removable())
            .map(|(key, _)| key.clone())
            .collect();

        let mut reclaimed = Vec::with_capacity(victims.len());
        for key in victims {
            if let Err(e) = self.fs.remove(&key.local_name()) {
                warn!(
                    table = %key.table,
                    object_id = key.object_id,
                    error = %e,
                    "Failed to remove local object"
                );
                continue;
            }
            if let Some(handle) = inner.handles.remove(&key) {
                handle.set_swept();
            }
            debug!(table = %key.table, object_id = key.object_id, "Swept object handle");
            reclaimed.push(key);
        }

        let orphans: Vec<ObjectKey> = inner.orphans.iter().cloned().collect();
        for key in orphans {
            let name = key.local_name();
            if self.fs.exists(&name) {
                if let Err(e) = self.fs.remove(&name) {
                    warn!(
                        table = %key.table,
                        object_id = key.object_id,
                        error = %e,
                        "Failed to remove orphaned local object"
                    );
                    continue;
                }
                reclaimed.push(key.clone());
            }
            inner.orphans.remove(&key);
        }

        if !reclaimed.is_empty() {
            info!(count = reclaimed.len(), "Reclaimed local objects");
        }
        reclaimed
    }

    pub fn len(&self) -> usize {
        self.inner.read().handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current refcount of an open object, if it is open.
    pub fn refs(&self, table: &str, object_id: u32) -> Option<usize> {
        self.inner
            .read()
            .handles
            .get(&ObjectKey::new(table, object_id))
            .map(|h| h.refs())
    }
}

impl Drop for BlockHandleCache {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        let busy = inner.handles.values().filter(|h| h.refs() > 0).count();
        if busy > 0 {
            warn!(busy, "Handle cache dropped with referenced handles");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::file::{FileHandle, MemFs};
    use crate::tiered::object_store::MemoryStore;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicBool;

    fn cache() -> (Arc<MemFs>, BlockHandleCache) {
        let fs = Arc::new(MemFs::new());
        let cache = BlockHandleCache::new(fs.clone(), None);
        (fs, cache)
    }

    #[test]
    fn test_acquire_shares_handle() -> Result<()> {
        let (_fs, cache) = cache();
        let a = cache.create("t", 1)?;
        let b = cache.acquire("t", 1)?;

        assert!(Arc::ptr_eq(a.handle(), b.handle()));
        assert_eq!(cache.refs("t", 1), Some(2));

        cache.release(a);
        assert_eq!(cache.refs("t", 1), Some(1));
        drop(b);
        assert_eq!(cache.refs("t", 1), Some(0));
        Ok(())
    }

    #[test]
    fn test_acquire_missing_object() {
        let (_fs, cache) = cache();
        assert!(matches!(cache.acquire("t", 7), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_sweep_waits_for_release() -> Result<()> {
        let (fs, cache) = cache();
        let handle = cache.create("t", 1)?;
        handle.file().write_at(b"data", 0)?;

        cache.mark_removable("t", 1);
        assert!(cache.sweep().is_empty());
        assert!(fs.exists("t-0000000001.tobj"));

        cache.release(handle);
        assert_eq!(cache.sweep(), vec![ObjectKey::new("t", 1)]);
        assert!(!fs.exists("t-0000000001.tobj"));
        assert!(cache.sweep().is_empty());
        Ok(())
    }

    #[test]
    fn test_pin_after_sweep_is_concurrent_modification() -> Result<()> {
        let (_fs, cache) = cache();
        let handle = cache.create("t", 1)?;
        let raw = handle.handle().clone();
        drop(handle);

        cache.mark_removable("t", 1);
        cache.sweep();

        let err = cache.pin(&raw).unwrap_err();
        assert!(err.is_retryable());
        Ok(())
    }

    #[test]
    fn test_tombstoned_object_is_not_found() -> Result<()> {
        let (_fs, cache) = cache();
        drop(cache.create("t", 1)?);
        cache.tombstone("t", 1);
        assert!(matches!(cache.acquire("t", 1), Err(Error::NotFound(_))));
        assert_eq!(cache.sweep().len(), 1);
        Ok(())
    }

    #[test]
    fn test_rehydrate_after_local_removal() -> Result<()> {
        let fs = Arc::new(MemFs::new());
        let store = Arc::new(MemoryStore::new());
        let cache = BlockHandleCache::new(
            fs.clone(),
            Some(RemoteSource {
                store: store.clone(),
                bucket: "b".to_string(),
                prefix: "p/".to_string(),
            }),
        );

        let handle = cache.create("t", 1)?;
        handle.file().write_at(b"cold bytes", 0)?;
        store.put_object(handle.file().as_ref(), "b", "p/t-0000000001.tobj")?;
        drop(handle);

        cache.mark_removable("t", 1);
        cache.sweep();
        assert!(!fs.exists("t-0000000001.tobj"));

        let back = cache.acquire("t", 1)?;
        let mut buf = [0u8; 10];
        back.file().read_at(&mut buf, 0)?;
        assert_eq!(&buf, b"cold bytes");
        assert!(back.is_removable());
        Ok(())
    }

    #[test]
    fn test_orphan_removed_on_sweep() -> Result<()> {
        let (fs, cache) = cache();
        fs.open("t-0000000003.tobj", true)?;
        cache.mark_removable("t", 3);
        assert_eq!(cache.sweep(), vec![ObjectKey::new("t", 3)]);
        assert!(!fs.exists("t-0000000003.tobj"));
        Ok(())
    }

    #[test]
    fn test_close_table_requires_no_references() -> Result<()> {
        let (_fs, cache) = cache();
        let handle = cache.create("t", 1)?;
        assert!(matches!(cache.close_table("t"), Err(Error::InvalidState(_))));
        drop(handle);
        cache.close_table("t")?;
        assert!(cache.is_empty());
        Ok(())
    }

    #[test]
    fn test_concurrent_acquire_and_sweep() -> Result<()> {
        let (fs, cache) = cache();
        drop(cache.create("t", 1)?);
        fs.open("t-0000000001.tobj", true)?.write_at(&[1u8; 64], 0)?;

        std::thread::scope(|s| {
            for _ in 0..2 {
                s.spawn(|| {
                    for _ in 0..500 {
                        match cache.acquire("t", 1) {
                            Ok(handle) => {
                                assert!(!handle.is_swept());
                                let mut buf = [0u8; 64];
                                let read = handle.file().read_at(&mut buf, 0);
                                assert!(read.is_ok(), "read of a held object failed: {read:?}");
                                assert_eq!(buf, [1u8; 64]);
                                assert!(handle.refs() >= 1);
                            }
                            Err(e) => assert!(e.is_not_found() || e.is_retryable(), "{e}"),
                        }
                    }
                });
            }
            s.spawn(|| {
                for _ in 0..200 {
                    cache.mark_removable("t", 1);
                    for key in cache.sweep() {
                        assert_eq!(key, ObjectKey::new("t", 1));
                    }
                }
            });
        });

        // Every acquire was released: one final sweep leaves nothing behind.
        cache.mark_removable("t", 1);
        cache.sweep();
        assert_eq!(cache.refs("t", 1), None);
        Ok(())
    }

    /// Memory file system whose removals can be made to fail.
    #[derive(Debug, Default)]
    struct StuckFs {
        inner: MemFs,
        fail_remove: AtomicBool,
    }

    impl FileSystem for StuckFs {
        fn open(&self, name: &str, create: bool) -> Result<Arc<dyn FileHandle>> {
            self.inner.open(name, create)
        }

        fn exists(&self, name: &str) -> bool {
            self.inner.exists(name)
        }

        fn remove(&self, name: &str) -> Result<()> {
            if self.fail_remove.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only").into());
            }
            self.inner.remove(name)
        }

        fn rename(&self, from: &str, to: &str) -> Result<()> {
            self.inner.rename(from, to)
        }

        fn list(&self, prefix: &str) -> Result<Vec<String>> {
            self.inner.list(prefix)
        }
    }

    #[test]
    fn test_failed_removal_keeps_object_for_next_sweep() -> Result<()> {
        let fs = Arc::new(StuckFs::default());
        let cache = BlockHandleCache::new(fs.clone(), None);
        drop(cache.create("t", 1)?);
        drop(cache.create("t", 2)?);
        fs.open("t-0000000003.tobj", true)?;
        cache.mark_removable("t", 1);
        cache.mark_removable("t", 2);
        cache.mark_removable("t", 3);

        fs.fail_remove.store(true, Ordering::SeqCst);
        assert!(cache.sweep().is_empty());
        assert_eq!(cache.refs("t", 1), Some(0));
        assert_eq!(cache.refs("t", 2), Some(0));
        assert!(fs.exists("t-0000000003.tobj"));

        fs.fail_remove.store(false, Ordering::SeqCst);
        let mut reclaimed = cache.sweep();
        reclaimed.sort();
        assert_eq!(
            reclaimed,
            vec![
                ObjectKey::new("t", 1),
                ObjectKey::new("t", 2),
                ObjectKey::new("t", 3)
            ]
        );
        assert!(cache.is_empty());
        assert!(fs.list("t-")?.is_empty());
        Ok(())
    }

    /// Memory file system that runs a sweep of `cache` the next time an
    /// object file is opened, once the open has found the file.
    #[derive(Debug, Default)]
    struct SweepingFs {
        inner: MemFs,
        cache: parking_lot::Mutex<Option<std::sync::Weak<BlockHandleCache>>>,
    }

    impl FileSystem for SweepingFs {
        fn open(&self, name: &str, create: bool) -> Result<Arc<dyn FileHandle>> {
            let file = self.inner.open(name, create)?;
            let armed = self.cache.lock().take();
            if let Some(cache) = armed.and_then(|weak| weak.upgrade()) {
                cache.sweep();
            }
            Ok(file)
        }

        fn exists(&self, name: &str) -> bool {
            self.inner.exists(name)
        }

        fn remove(&self, name: &str) -> Result<()> {
            self.inner.remove(name)
        }

        fn rename(&self, from: &str, to: &str) -> Result<()> {
            self.inner.rename(from, to)
        }

        fn list(&self, prefix: &str) -> Result<Vec<String>> {
            self.inner.list(prefix)
        }
    }

    #[test]
    fn test_orphan_swept_during_acquire_is_rehydrated() -> Result<()> {
        let fs = Arc::new(SweepingFs::default());
        let store = Arc::new(MemoryStore::new());
        let file = fs.open("t-0000000001.tobj", true)?;
        file.write_at(b"cold bytes", 0)?;
        store.put_object(file.as_ref(), "b", "p/t-0000000001.tobj")?;
        drop(file);

        let cache = Arc::new(BlockHandleCache::new(
            fs.clone(),
            Some(RemoteSource {
                store: store.clone(),
                bucket: "b".to_string(),
                prefix: "p/".to_string(),
            }),
        ));
        cache.mark_removable("t", 1);
        *fs.cache.lock() = Some(Arc::downgrade(&cache));

        let handle = cache.acquire("t", 1)?;
        assert!(fs.exists("t-0000000001.tobj"));
        assert!(handle.is_removable());
        let mut buf = [0u8; 10];
        handle.file().read_at(&mut buf, 0)?;
        assert_eq!(&buf, b"cold bytes");

        drop(handle);
        assert_eq!(cache.sweep(), vec![ObjectKey::new("t", 1)]);
        assert!(!fs.exists("t-0000000001.tobj"));
        Ok(())
    }

    #[derive(Debug, Clone)]
    enum Op {
        Acquire,
        Release,
        MarkRemovable,
        Sweep,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Acquire),
            Just(Op::Release),
            Just(Op::MarkRemovable),
            Just(Op::Sweep),
        ]
    }

    proptest! {
        #[test]
        fn prop_never_reclaimed_while_referenced(ops in proptest::collection::vec(op(), 1..64)) {
            let (fs, cache) = cache();
            drop(cache.create("t", 1).unwrap());
            let mut held: Vec<HandleRef> = Vec::new();
            let mut removed = false;

            for op in ops {
                match op {
                    Op::Acquire => {
                        match cache.acquire("t", 1) {
                            Ok(handle) => held.push(handle),
                            Err(e) => prop_assert!(removed && e.is_not_found()),
                        }
                    }
                    Op::Release => {
                        if let Some(handle) = held.pop() {
                            cache.release(handle);
                        }
                    }
                    Op::MarkRemovable => cache.mark_removable("t", 1),
                    Op::Sweep => {
                        let reclaimed = cache.sweep();
                        if !reclaimed.is_empty() {
                            prop_assert!(held.is_empty());
                            removed = true;
                        }
                    }
                }
                for handle in &held {
                    prop_assert!(!handle.is_swept());
                }
            }

            held.clear();
            cache.mark_removable("t", 1);
            let reclaimed = cache.sweep();
            if !removed {
                prop_assert_eq!(reclaimed.len(), 1);
            }
            prop_assert!(cache.sweep().is_empty());
            prop_assert!(!fs.exists("t-0000000001.tobj"));
        }
    }
}
