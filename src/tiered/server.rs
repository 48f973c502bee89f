//! Single-worker tiered server.
//!
//! Items are processed one at a time under `worker`, whatever thread calls
//! [`TieredServer::process_next`]. A failed copy never loses its item: it is
//! requeued, and after `max_flush_attempts` parked on the failed list with
//! the object left `Migrating` and its local copy untouched.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use super::metadata::{MetadataStore, ObjectState, TableMeta, TieringMeta};
use super::object_store::ObjectStore;
use super::queue::WorkQueue;
use super::work::{WorkItem, WorkType};
use crate::block::{BlockHandleCache, BlockManager, ObjectKey};
use crate::config::TieredConfig;
use crate::error::{Error, Result};

/// Bucket and name prefix an object is stored under.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Location {
    bucket: String,
    prefix: String,
}

pub struct TieredServer {
    queue: WorkQueue,
    store: Arc<dyn ObjectStore>,
    cache: Arc<BlockHandleCache>,
    metadata: Arc<MetadataStore>,
    config: TieredConfig,
    failed: Mutex<Vec<WorkItem>>,
    worker: Mutex<()>,
    /// Block managers told when their objects become archived.
    managers: RwLock<HashMap<String, Arc<BlockManager>>>,
    /// Where dropped tables kept their objects, for pending remote deletes.
    dropped: RwLock<HashMap<String, Location>>,
}

impl TieredServer {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        cache: Arc<BlockHandleCache>,
        metadata: Arc<MetadataStore>,
        config: TieredConfig,
    ) -> Self {
        Self {
            queue: WorkQueue::new(),
            store,
            cache,
            metadata,
            config,
            failed: Mutex::new(Vec::new()),
            worker: Mutex::new(()),
            managers: RwLock::new(HashMap::new()),
            dropped: RwLock::new(HashMap::new()),
        }
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    pub fn enqueue(&self, item: WorkItem) {
        self.queue.enqueue(item);
    }

    pub fn mark_checkpoint_complete(&self, table: &str, generation: u64) {
        self.queue.mark_checkpoint_complete(table, generation);
        debug!(table = %table, generation, "Checkpoint generation complete");
    }

    pub fn register_manager(&self, manager: Arc<BlockManager>) {
        self.managers
            .write()
            .insert(manager.table().to_string(), manager);
    }

    pub fn unregister_manager(&self, table: &str) -> Option<Arc<BlockManager>> {
        self.managers.write().remove(table)
    }

    /// Items that exhausted their attempts.
    pub fn failed_items(&self) -> Vec<WorkItem> {
        self.failed.lock().clone()
    }

    /// Requeues every failed item with a fresh attempt budget.
    pub fn retry_failed(&self) -> usize {
        let items: Vec<WorkItem> = self.failed.lock().drain(..).collect();
        let count = items.len();
        for mut item in items {
            item.attempts = 0;
            self.queue.enqueue(item);
        }
        if count > 0 {
            info!(count, "Requeued failed work items");
        }
        count
    }

    /// Processes one ready item. Returns its type, or `None` if nothing is
    /// ready. Object store failures are absorbed by the retry policy; any
    /// other failure puts the item back (or parks it) before returning.
    pub fn process_next(&self) -> Result<Option<WorkType>> {
        let _worker = self.worker.lock();

        let item = match self.queue.next_any() {
            Some(item) => item,
            None => return Ok(None),
        };
        let kind = item.kind;
        debug!(item = %item, "Processing work item");

        let result = match kind {
            WorkType::Flush => self.flush(&item),
            WorkType::FlushFinish => {
                self.flush_finish(&item);
                Ok(())
            }
            WorkType::RemoveLocal => self.remove_local(&item),
            WorkType::RemoveShared => self.remove_shared(&item),
        };
        if let Err(e) = result {
            if e.is_fatal() || matches!(e, Error::InvalidState(_)) {
                self.park(item, &e);
            } else {
                self.requeue_or_fail(item, &e);
            }
            return Err(e);
        }
        Ok(Some(kind))
    }

    /// Processes items until none is ready. A failing item does not hold
    /// back the ones behind it; the first error is returned at the end.
    pub fn drain(&self) -> Result<usize> {
        let mut processed = 0;
        let mut first_error = None;
        loop {
            match self.process_next() {
                Ok(Some(_)) => processed += 1,
                Ok(None) => break,
                Err(e) => {
                    processed += 1;
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(processed),
        }
    }

    fn location(&self, tiering: Option<&TieringMeta>) -> Location {
        match tiering {
            Some(t) => Location {
                bucket: t.bucket.clone(),
                prefix: t.bucket_prefix.clone(),
            },
            None => Location {
                bucket: self.config.bucket.clone(),
                prefix: self.config.bucket_prefix.clone(),
            },
        }
    }

    fn table_location(&self, table: &str) -> Location {
        if let Some(meta) = self.metadata.table(table) {
            return self.location(meta.tiering.as_ref());
        }
        self.dropped
            .read()
            .get(table)
            .cloned()
            .unwrap_or_else(|| self.location(None))
    }

    fn flush(&self, item: &WorkItem) -> Result<()> {
        let table = match self.metadata.table(&item.table) {
            Some(table) => table,
            None => {
                debug!(item = %item, "Table gone, dropping flush");
                return Ok(());
            }
        };

        match table.object(item.object_id).map(|o| o.state) {
            Some(ObjectState::Local) | Some(ObjectState::Migrating) => {}
            Some(state) => {
                debug!(item = %item, state = ?state, "Object already migrated");
                return Ok(());
            }
            None => {
                return Err(Error::InvalidState(format!(
                    "flush of object {} which table {} does not list as read-only",
                    item.object_id, item.table
                )))
            }
        }

        self.metadata
            .set_object_state(&item.table, item.object_id, ObjectState::Migrating, false)?;

        let location = self.location(table.tiering.as_ref());
        match self.copy_to_remote(item, &location) {
            Ok(()) => {
                self.metadata.set_object_state(
                    &item.table,
                    item.object_id,
                    ObjectState::RemoteAvailable,
                    true,
                )?;
                self.cache.mark_remote(&item.table, item.object_id);
                info!(
                    table = %item.table,
                    object_id = item.object_id,
                    bucket = %location.bucket,
                    "Object copied to remote storage"
                );

                self.queue.enqueue(item.chain(WorkType::FlushFinish));
                self.queue.enqueue(item.chain(WorkType::RemoveLocal));
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                self.requeue_or_fail(item.clone(), &e);
                Ok(())
            }
        }
    }

    fn copy_to_remote(&self, item: &WorkItem, location: &Location) -> Result<()> {
        let handle = self.cache.acquire(&item.table, item.object_id)?;
        handle.file().sync()?;
        let name = item.key().remote_name(&location.prefix);
        self.store
            .put_object(handle.file().as_ref(), &location.bucket, &name)
    }

    fn requeue_or_fail(&self, mut item: WorkItem, e: &Error) {
        item.attempts += 1;
        if item.attempts >= self.config.max_flush_attempts {
            self.park(item, e);
        } else {
            warn!(
                item = %item,
                attempts = item.attempts,
                error = %e,
                "Work item failed, will retry"
            );
            self.queue.enqueue(item);
        }
    }

    fn park(&self, item: WorkItem, e: &Error) {
        error!(
            item = %item,
            attempts = item.attempts,
            error = %e,
            "Work item failed, parking it"
        );
        self.failed.lock().push(item);
    }

    fn flush_finish(&self, item: &WorkItem) {
        let manager = self.managers.read().get(&item.table).cloned();
        match manager {
            Some(manager) => manager.notify_object_archived(item.object_id),
            None => debug!(item = %item, "No open block manager to notify"),
        }
    }

    fn remove_local(&self, item: &WorkItem) -> Result<()> {
        let state = match self.metadata.table(&item.table) {
            Some(table) => table.object(item.object_id).map(|o| (o.state, o.remote)),
            None => {
                debug!(item = %item, "Table gone, dropping local removal");
                return Ok(());
            }
        };

        match state {
            Some((ObjectState::RemoteAvailable, true)) => {}
            Some((ObjectState::LocalRemovable, _)) | Some((ObjectState::Removed, _)) => {
                return Ok(())
            }
            other => {
                error!(item = %item, state = ?other, "Local removal before remote copy");
                return Err(Error::InvalidState(format!(
                    "object {}:{} has no confirmed remote copy",
                    item.table, item.object_id
                )));
            }
        }

        self.cache.mark_removable(&item.table, item.object_id);
        self.metadata.set_object_state(
            &item.table,
            item.object_id,
            ObjectState::LocalRemovable,
            true,
        )?;
        debug!(table = %item.table, object_id = item.object_id, "Local copy removable");
        Ok(())
    }

    fn remove_shared(&self, item: &WorkItem) -> Result<()> {
        let location = self.table_location(&item.table);
        let name = item.key().remote_name(&location.prefix);

        if let Err(e) = self.store.delete_object(&location.bucket, &name) {
            self.requeue_or_fail(item.clone(), &e);
            return Ok(());
        }

        self.cache.tombstone(&item.table, item.object_id);
        let listed = self
            .metadata
            .table(&item.table)
            .map_or(false, |t| t.object(item.object_id).is_some());
        if listed {
            self.metadata
                .set_object_state(&item.table, item.object_id, ObjectState::Removed, false)?;
        }
        info!(
            table = %item.table,
            object_id = item.object_id,
            bucket = %location.bucket,
            "Remote copy deleted"
        );
        Ok(())
    }

    /// Queues deletion of every remote copy of a table that is being dropped
    /// and discards its other pending work. Returns the number of deletes.
    pub fn drop_table(&self, meta: &TableMeta) -> usize {
        let purged = self.queue.purge_table(&meta.name);
        self.unregister_manager(&meta.name);
        self.dropped
            .write()
            .insert(meta.name.clone(), self.location(meta.tiering.as_ref()));

        let mut deletes = 0;
        for object in meta.objects.iter().filter(|o| o.remote) {
            self.queue.enqueue(WorkItem::new(
                WorkType::RemoveShared,
                meta.name.clone(),
                object.object_id,
                0,
            ));
            deletes += 1;
        }
        debug!(table = %meta.name, purged, deletes, "Queued remote deletes for dropped table");
        deletes
    }

    /// Reclaims unreferenced removable local copies and records them removed.
    /// Every reclaimed object is recorded even if an earlier record fails;
    /// the first failure is returned.
    pub fn sweep(&self) -> Result<Vec<ObjectKey>> {
        let reclaimed = self.cache.sweep();
        let mut first_error = None;
        for key in &reclaimed {
            let removable = self
                .metadata
                .table(&key.table)
                .and_then(|t| t.object(key.object_id).map(|o| o.state))
                == Some(ObjectState::LocalRemovable);
            if !removable {
                continue;
            }
            if let Err(e) =
                self.metadata
                    .set_object_state(&key.table, key.object_id, ObjectState::Removed, true)
            {
                error!(
                    table = %key.table,
                    object_id = key.object_id,
                    error = %e,
                    "Failed to record swept object"
                );
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(reclaimed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{FileSystem, MemFs, RemoteSource};
    use crate::tiered::object_store::MemoryStore;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        fs: Arc<MemFs>,
        store: Arc<MemoryStore>,
        cache: Arc<BlockHandleCache>,
        metadata: Arc<MetadataStore>,
        server: TieredServer,
    }

    fn tiering() -> TieringMeta {
        TieringMeta {
            bucket: "cold".to_string(),
            bucket_prefix: "pfx/".to_string(),
            storage_source: "memory".to_string(),
        }
    }

    /// Table `t` with object 1 written and switched away from.
    fn fixture() -> Result<Fixture> {
        let dir = TempDir::new()?;
        let fs = Arc::new(MemFs::new());
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(BlockHandleCache::new(
            fs.clone(),
            Some(RemoteSource {
                store: store.clone(),
                bucket: "cold".to_string(),
                prefix: "pfx/".to_string(),
            }),
        ));
        let metadata = Arc::new(MetadataStore::open_home(dir.path())?);
        let server = TieredServer::new(
            store.clone(),
            cache.clone(),
            metadata.clone(),
            TieredConfig::default(),
        );

        metadata.create_table("t", Some(tiering()))?;
        let handle = cache.create("t", 1)?;
        handle.file().write_at(b"object one", 0)?;
        drop(handle);
        metadata.switch_object("t", 2)?;

        Ok(Fixture {
            _dir: dir,
            fs,
            store,
            cache,
            metadata,
            server,
        })
    }

    fn state_of(f: &Fixture, id: u32) -> Option<(ObjectState, bool)> {
        f.metadata
            .table("t")
            .and_then(|t| t.object(id).map(|o| (o.state, o.remote)))
    }

    #[test]
    fn test_flush_waits_for_generation_then_chains() -> Result<()> {
        let f = fixture()?;
        f.server.enqueue(WorkItem::new(WorkType::Flush, "t", 1, 5));

        assert_eq!(f.server.process_next()?, None);
        f.server.mark_checkpoint_complete("t", 4);
        assert_eq!(f.server.process_next()?, None);

        f.server.mark_checkpoint_complete("t", 5);
        assert_eq!(f.server.process_next()?, Some(WorkType::Flush));
        assert!(f.store.contains("cold", "pfx/t-0000000001.tobj"));
        assert_eq!(state_of(&f, 1), Some((ObjectState::RemoteAvailable, true)));

        let queued: Vec<WorkType> = f.server.queue().items().iter().map(|i| i.kind).collect();
        assert_eq!(queued, vec![WorkType::FlushFinish, WorkType::RemoveLocal]);
        Ok(())
    }

    #[test]
    fn test_full_lifecycle_and_rehydration() -> Result<()> {
        let f = fixture()?;
        f.server.enqueue(WorkItem::new(WorkType::Flush, "t", 1, 1));
        f.server.mark_checkpoint_complete("t", 1);

        assert_eq!(f.server.drain()?, 3);
        assert_eq!(state_of(&f, 1), Some((ObjectState::LocalRemovable, true)));

        let reclaimed = f.server.sweep()?;
        assert_eq!(reclaimed, vec![ObjectKey::new("t", 1)]);
        assert!(!f.fs.exists("t-0000000001.tobj"));
        assert_eq!(state_of(&f, 1), Some((ObjectState::Removed, true)));

        let handle = f.cache.acquire("t", 1)?;
        let mut buf = [0u8; 10];
        handle.file().read_at(&mut buf, 0)?;
        assert_eq!(&buf, b"object one");
        assert!(handle.is_read_only());
        Ok(())
    }

    #[test]
    fn test_failed_flush_is_parked_not_lost() -> Result<()> {
        let f = fixture()?;
        f.store.set_failing(true);
        f.server.enqueue(WorkItem::new(WorkType::Flush, "t", 1, 0));

        assert_eq!(f.server.drain()?, 3);
        assert_eq!(f.store.put_attempts(), 3);
        assert!(f.server.queue().is_empty());

        let failed = f.server.failed_items();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].attempts, 3);
        assert_eq!(state_of(&f, 1), Some((ObjectState::Migrating, false)));
        assert!(f.fs.exists("t-0000000001.tobj"));

        f.store.set_failing(false);
        assert_eq!(f.server.retry_failed(), 1);
        f.server.drain()?;
        assert!(f.server.failed_items().is_empty());
        assert_eq!(state_of(&f, 1), Some((ObjectState::LocalRemovable, true)));
        Ok(())
    }

    #[test]
    fn test_remove_local_requires_remote_copy() -> Result<()> {
        let f = fixture()?;
        f.server.enqueue(WorkItem::new(WorkType::RemoveLocal, "t", 1, 0));

        assert!(matches!(f.server.process_next(), Err(Error::InvalidState(_))));
        assert_eq!(f.server.failed_items().len(), 1);
        assert!(f.server.sweep()?.is_empty());
        assert!(f.fs.exists("t-0000000001.tobj"));
        assert_eq!(state_of(&f, 1), Some((ObjectState::Local, false)));
        Ok(())
    }

    #[test]
    fn test_referenced_object_survives_sweep() -> Result<()> {
        let f = fixture()?;
        let reader = f.cache.acquire("t", 1)?;
        f.server.enqueue(WorkItem::new(WorkType::Flush, "t", 1, 0));
        f.server.drain()?;

        assert!(f.server.sweep()?.is_empty());
        assert_eq!(state_of(&f, 1), Some((ObjectState::LocalRemovable, true)));

        drop(reader);
        assert_eq!(f.server.sweep()?.len(), 1);
        assert_eq!(state_of(&f, 1), Some((ObjectState::Removed, true)));
        Ok(())
    }

    #[test]
    fn test_drop_table_deletes_remote_copies() -> Result<()> {
        let f = fixture()?;
        f.server.enqueue(WorkItem::new(WorkType::Flush, "t", 1, 0));
        f.server.process_next()?;
        assert!(f.store.contains("cold", "pfx/t-0000000001.tobj"));

        let meta = f.metadata.drop_table("t")?;
        assert_eq!(f.server.drop_table(&meta), 1);
        assert_eq!(f.server.queue().len_of(WorkType::FlushFinish), 0);

        assert_eq!(f.server.drain()?, 1);
        assert!(!f.store.contains("cold", "pfx/t-0000000001.tobj"));
        assert!(matches!(f.cache.acquire("t", 1), Err(Error::NotFound(_))));
        Ok(())
    }

    #[test]
    fn test_flush_finish_notifies_manager() -> Result<()> {
        let f = fixture()?;
        let manager = Arc::new(BlockManager::open(
            "t",
            f.cache.clone(),
            Default::default(),
            2,
        )?);
        f.server.register_manager(manager.clone());

        f.server.enqueue(WorkItem::new(WorkType::Flush, "t", 1, 0));
        f.server.drain()?;
        assert_eq!(manager.archived_upto(), 1);
        Ok(())
    }

    #[test]
    fn test_unlisted_object_is_parked_and_drain_continues() -> Result<()> {
        let f = fixture()?;
        f.server.enqueue(WorkItem::new(WorkType::Flush, "t", 9, 0));
        f.server.enqueue(WorkItem::new(WorkType::Flush, "t", 1, 0));

        assert!(matches!(f.server.drain(), Err(Error::InvalidState(_))));
        assert!(f.server.queue().is_empty());

        let failed = f.server.failed_items();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].object_id, 9);
        assert_eq!(state_of(&f, 1), Some((ObjectState::LocalRemovable, true)));
        Ok(())
    }

    /// Drops the table from the metadata as soon as a copy lands.
    struct DropOnPut {
        inner: Arc<MemoryStore>,
        metadata: Arc<MetadataStore>,
    }

    impl ObjectStore for DropOnPut {
        fn put_object(
            &self,
            source: &dyn crate::block::FileHandle,
            bucket: &str,
            name: &str,
        ) -> Result<()> {
            self.inner.put_object(source, bucket, name)?;
            self.metadata.drop_table("t")?;
            Ok(())
        }

        fn get_object(&self, bucket: &str, name: &str) -> Result<Box<dyn std::io::Read + Send>> {
            self.inner.get_object(bucket, name)
        }

        fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
            self.inner.list_objects(bucket, prefix)
        }

        fn delete_object(&self, bucket: &str, name: &str) -> Result<()> {
            self.inner.delete_object(bucket, name)
        }
    }

    #[test]
    fn test_metadata_failure_after_copy_requeues_item() -> Result<()> {
        let f = fixture()?;
        let server = TieredServer::new(
            Arc::new(DropOnPut {
                inner: f.store.clone(),
                metadata: f.metadata.clone(),
            }),
            f.cache.clone(),
            f.metadata.clone(),
            TieredConfig::default(),
        );
        server.enqueue(WorkItem::new(WorkType::Flush, "t", 1, 0));

        assert!(matches!(server.process_next(), Err(Error::NotFound(_))));
        let queued = server.queue().items();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].kind, WorkType::Flush);
        assert_eq!(queued[0].attempts, 1);
        assert!(server.failed_items().is_empty());

        // The table is gone now, so the retry drops the item cleanly.
        assert_eq!(server.process_next()?, Some(WorkType::Flush));
        assert!(server.queue().is_empty());
        Ok(())
    }
}
