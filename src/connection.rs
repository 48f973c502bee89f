//! A connection to one database home.
//!
//! Owns everything shared between tables: the handle cache, the metadata log,
//! the tiered server and the checkpoint orchestrator, plus the collection
//! catalog and planner. Nothing here is process-global; two connections to
//! different homes are fully independent.

use std::collections::HashMap;
use std::fs;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::block::{local_object_name, BlockHandleCache, FileSystem, LocalFs, RemoteSource};
use crate::checkpoint::{CheckpointOrchestrator, CheckpointReport, EvictionControl};
use crate::config::ConnectionConfig;
use crate::error::{Error, Result};
use crate::flock::FileLock;
use crate::plan::{Catalog, PlanCacheRegistry, PlanResult, Planner, Query};
use crate::scheduler::Scheduler;
use crate::table::Table;
use crate::tiered::{
    DirStore, MetadataStore, ObjectState, ObjectStore, SweepTask, TableMeta, TieredServer,
    TieredWorkTask, TieringMeta, WorkItem, WorkType,
};

/// Local object files live here, under the home.
const OBJECTS_DIR: &str = "objects";
/// Root of the default directory-backed object store.
const OBJECT_STORE_DIR: &str = "object_store";

pub struct Connection {
    config: ConnectionConfig,
    fs: Arc<dyn FileSystem>,
    cache: Arc<BlockHandleCache>,
    metadata: Arc<MetadataStore>,
    server: Arc<TieredServer>,
    eviction: Arc<EvictionControl>,
    orchestrator: CheckpointOrchestrator,
    tables: RwLock<HashMap<String, Arc<Table>>>,
    planner: Planner,
    _lock: FileLock,
}

impl Connection {
    /// Opens with a directory-backed object store inside the home.
    pub fn open(config: ConnectionConfig) -> Result<Self> {
        fs::create_dir_all(&config.home)?;
        let store = Arc::new(DirStore::new(config.home.join(OBJECT_STORE_DIR))?);
        Self::open_with_store(config, store)
    }

    pub fn open_with_store(config: ConnectionConfig, store: Arc<dyn ObjectStore>) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.home)?;
        let lock = FileLock::lock_home(&config.home)?;

        let fs: Arc<dyn FileSystem> = Arc::new(LocalFs::new(config.home.join(OBJECTS_DIR))?);
        let cache = Arc::new(BlockHandleCache::new(
            fs.clone(),
            Some(RemoteSource {
                store: store.clone(),
                bucket: config.tiered.bucket.clone(),
                prefix: config.tiered.bucket_prefix.clone(),
            }),
        ));
        let metadata = Arc::new(MetadataStore::open_home(&config.home)?);
        let server = Arc::new(TieredServer::new(
            store,
            cache.clone(),
            metadata.clone(),
            config.tiered.clone(),
        ));
        let eviction = Arc::new(EvictionControl::new(config.eviction.clone()));
        let orchestrator =
            CheckpointOrchestrator::new(metadata.clone(), server.clone(), eviction.clone());
        let registry = Arc::new(PlanCacheRegistry::new(config.planner.cache_capacity));
        let planner = Planner::new(config.planner.clone(), Arc::new(Catalog::new(registry)));

        let conn = Self {
            config,
            fs,
            cache,
            metadata,
            server,
            eviction,
            orchestrator,
            tables: RwLock::new(HashMap::new()),
            planner,
            _lock: lock,
        };
        conn.recover_object_states();

        info!(home = %conn.config.home.display(), tables = conn.metadata.tables().len(), "Opened connection");
        Ok(conn)
    }

    /// Rebuilds the handle cache's view of remote copies from the metadata
    /// log and queues again migrations a restart interrupted.
    fn recover_object_states(&self) {
        for meta in self.metadata.tables() {
            for object in &meta.objects {
                let id = object.object_id;
                if object.remote {
                    self.cache.mark_remote(&meta.name, id);
                }
                match object.state {
                    ObjectState::Migrating => {
                        self.server
                            .enqueue(WorkItem::new(WorkType::Flush, meta.name.clone(), id, 0));
                    }
                    ObjectState::RemoteAvailable => {
                        self.server
                            .enqueue(WorkItem::new(WorkType::RemoveLocal, meta.name.clone(), id, 0));
                    }
                    ObjectState::LocalRemovable => self.cache.mark_removable(&meta.name, id),
                    ObjectState::Removed if !object.remote => self.cache.tombstone(&meta.name, id),
                    ObjectState::Local | ObjectState::Removed => {}
                }
            }
        }
        if !self.server.queue().is_empty() {
            debug!(items = self.server.queue().len(), "Requeued interrupted tiered work");
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn metadata(&self) -> &Arc<MetadataStore> {
        &self.metadata
    }

    pub fn server(&self) -> &Arc<TieredServer> {
        &self.server
    }

    pub fn handle_cache(&self) -> &Arc<BlockHandleCache> {
        &self.cache
    }

    pub fn eviction(&self) -> &Arc<EvictionControl> {
        &self.eviction
    }

    /// Creates a table; tiered tables flush to the connection's bucket.
    pub fn create_table(&self, name: &str, tiered: bool) -> Result<Arc<Table>> {
        let tiering = tiered.then(|| TieringMeta {
            bucket: self.config.tiered.bucket.clone(),
            bucket_prefix: self.config.tiered.bucket_prefix.clone(),
            storage_source: self.config.tiered.storage_source.clone(),
        });
        let meta = self.metadata.create_table(name, tiering)?;
        info!(table = name, tiered, "Created table");
        self.open_meta(&meta)
    }

    pub fn open_table(&self, name: &str) -> Result<Arc<Table>> {
        if let Some(table) = self.tables.read().get(name) {
            return Ok(table.clone());
        }
        let meta = self
            .metadata
            .table(name)
            .ok_or_else(|| Error::NotFound(format!("table {}", name)))?;
        self.open_meta(&meta)
    }

    fn open_meta(&self, meta: &TableMeta) -> Result<Arc<Table>> {
        let mut tables = self.tables.write();
        if let Some(table) = tables.get(&meta.name) {
            return Ok(table.clone());
        }
        let table = Arc::new(Table::open(meta, self.cache.clone(), self.config.block.clone())?);
        self.server.register_manager(table.manager().clone());
        tables.insert(meta.name.clone(), table.clone());
        Ok(table)
    }

    /// Takes a table out of the open set and releases its handles. Fails if
    /// anyone else still holds it.
    fn close_table(&self, name: &str) -> Result<()> {
        let mut tables = self.tables.write();
        if let Some(table) = tables.remove(name) {
            if Arc::strong_count(&table) > 1 {
                tables.insert(name.to_string(), table);
                return Err(Error::InvalidState(format!("table {} is still in use", name)));
            }
        }
        self.server.unregister_manager(name);
        self.cache.close_table(name)
    }

    /// Drops a table: local objects are deleted now, remote copies by the
    /// tiered worker.
    pub fn drop_table(&self, name: &str) -> Result<()> {
        if self.metadata.table(name).is_none() {
            return Err(Error::NotFound(format!("table {}", name)));
        }
        self.close_table(name)?;
        let meta = self.metadata.drop_table(name)?;
        let remote_deletes = self.server.drop_table(&meta);

        for id in object_ids(&meta) {
            let local = local_object_name(name, id);
            if self.fs.exists(&local) {
                self.fs.remove(&local)?;
            }
        }
        info!(table = name, remote_deletes, "Dropped table");
        Ok(())
    }

    /// Renames a non-tiered table and its object files.
    pub fn rename_table(&self, from: &str, to: &str) -> Result<()> {
        let meta = self
            .metadata
            .table(from)
            .ok_or_else(|| Error::NotFound(format!("table {}", from)))?;
        if meta.is_tiered() {
            return Err(Error::InvalidOperation(format!(
                "cannot rename tiered table {}",
                from
            )));
        }
        if self.metadata.table(to).is_some() {
            return Err(Error::InvalidOperation(format!("table {} already exists", to)));
        }

        self.close_table(from)?;
        for id in object_ids(&meta) {
            let local = local_object_name(from, id);
            if self.fs.exists(&local) {
                self.fs.rename(&local, &local_object_name(to, id))?;
            }
        }
        self.metadata.rename_table(from, to)?;
        info!(from, to, "Renamed table");
        Ok(())
    }

    fn open_tables(&self) -> Vec<Arc<Table>> {
        let mut tables: Vec<Arc<Table>> = self.tables.read().values().cloned().collect();
        tables.sort_by(|a, b| a.name().cmp(b.name()));
        tables
    }

    /// Checkpoints every modified open table.
    pub fn checkpoint(&self) -> Result<CheckpointReport> {
        self.orchestrator.checkpoint(&self.open_tables(), false)
    }

    /// Checkpoints and queues the data of tiered tables for the object store.
    pub fn flush_tier(&self) -> Result<CheckpointReport> {
        self.orchestrator.checkpoint(&self.open_tables(), true)
    }

    /// Drains ready tiered work on the calling thread.
    pub fn process_tiered_work(&self) -> Result<usize> {
        self.server.drain()
    }

    /// Reclaims local copies that are no longer needed.
    pub fn sweep(&self) -> Result<usize> {
        Ok(self.server.sweep()?.len())
    }

    /// Evicts pages of every open table whose memory use crossed the trigger.
    pub fn evict(&self) -> Result<usize> {
        let mut evicted = 0;
        for table in self.open_tables() {
            evicted += table.evict_if_needed(&self.eviction)?;
        }
        Ok(evicted)
    }

    /// Starts the tiered worker and the sweep on the current tokio runtime.
    pub fn start_background(&self) -> Scheduler {
        let scheduler = Scheduler::new();
        scheduler
            .register(Arc::new(TieredWorkTask::new(
                self.server.clone(),
                self.config.tiered.work_interval,
            )))
            .register(Arc::new(SweepTask::new(
                self.server.clone(),
                self.config.tiered.sweep_interval,
            )));
        scheduler
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        self.planner.catalog()
    }

    pub fn planner(&self) -> &Planner {
        &self.planner
    }

    pub fn find(&self, query: &Query) -> Result<PlanResult> {
        self.planner.find(query)
    }
}

fn object_ids(meta: &TableMeta) -> Vec<u32> {
    meta.objects
        .iter()
        .map(|o| o.object_id)
        .chain(std::iter::once(meta.current_object))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TieredConfig;
    use crate::plan::{doc, Expr, IndexDesc, PlanStrategy};
    use crate::tiered::MemoryStore;
    use std::time::Duration;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> ConnectionConfig {
        ConnectionConfig::new(dir.path())
    }

    #[test]
    fn test_home_is_locked() -> Result<()> {
        let dir = TempDir::new()?;
        let _conn = Connection::open(config(&dir))?;
        assert!(matches!(Connection::open(config(&dir)), Err(Error::Lock(_))));
        Ok(())
    }

    #[test]
    fn test_tables_survive_reopen() -> Result<()> {
        let dir = TempDir::new()?;
        {
            let conn = Connection::open(config(&dir))?;
            let table = conn.create_table("plain", false)?;
            table.put(1, b"one".to_vec());
            table.put(2, b"two".to_vec());
            let report = conn.checkpoint()?;
            assert_eq!(report.tables, vec!["plain".to_string()]);
        }

        let conn = Connection::open(config(&dir))?;
        let table = conn.open_table("plain")?;
        assert_eq!(table.get(1)?, Some(b"one".to_vec()));
        assert_eq!(table.get(2)?, Some(b"two".to_vec()));
        assert!(matches!(conn.open_table("missing"), Err(Error::NotFound(_))));
        Ok(())
    }

    #[test]
    fn test_tiered_data_is_fetched_back_after_reopen() -> Result<()> {
        let dir = TempDir::new()?;
        {
            let conn = Connection::open(config(&dir))?;
            let table = conn.create_table("t", true)?;
            table.put(1, b"cold".to_vec());

            let report = conn.flush_tier()?;
            assert_eq!(report.switched, vec![("t".to_string(), 1)]);
            assert_eq!(conn.process_tiered_work()?, 3);
            assert_eq!(conn.sweep()?, 1);
            assert!(!dir.path().join(OBJECTS_DIR).join("t-0000000001.tobj").exists());
        }

        let conn = Connection::open(config(&dir))?;
        let meta = conn
            .metadata()
            .table("t")
            .ok_or_else(|| Error::NotFound("t".into()))?;
        let first = meta.object(1).map(|o| (o.state, o.remote));
        assert_eq!(first, Some((ObjectState::Removed, true)));

        let table = conn.open_table("t")?;
        assert_eq!(table.get(1)?, Some(b"cold".to_vec()));
        Ok(())
    }

    #[test]
    fn test_interrupted_flush_is_requeued() -> Result<()> {
        let dir = TempDir::new()?;
        let store = Arc::new(MemoryStore::new());
        {
            let conn = Connection::open_with_store(config(&dir), store.clone())?;
            let table = conn.create_table("t", true)?;
            table.put(1, b"x".to_vec());
            conn.flush_tier()?;
        }

        let conn = Connection::open_with_store(config(&dir), store.clone())?;
        assert_eq!(conn.server().queue().len_of(WorkType::Flush), 1);
        conn.process_tiered_work()?;
        assert!(store.contains("tierdb", "t-0000000001.tobj"));
        let state = conn
            .metadata()
            .table("t")
            .and_then(|t| t.object(1).map(|o| o.state));
        assert_eq!(state, Some(ObjectState::LocalRemovable));
        Ok(())
    }

    #[test]
    fn test_drop_table_removes_local_and_remote_objects() -> Result<()> {
        let dir = TempDir::new()?;
        let store = Arc::new(MemoryStore::new());
        let conn = Connection::open_with_store(config(&dir), store.clone())?;
        let table = conn.create_table("t", true)?;
        table.put(1, b"x".to_vec());
        conn.flush_tier()?;
        conn.process_tiered_work()?;
        assert!(store.contains("tierdb", "t-0000000001.tobj"));

        // Held elsewhere: refused.
        assert!(matches!(conn.drop_table("t"), Err(Error::InvalidState(_))));
        drop(table);

        conn.drop_table("t")?;
        assert!(conn.metadata().table("t").is_none());
        assert!(!dir.path().join(OBJECTS_DIR).join("t-0000000002.tobj").exists());

        conn.process_tiered_work()?;
        assert!(!store.contains("tierdb", "t-0000000001.tobj"));
        assert!(matches!(conn.drop_table("t"), Err(Error::NotFound(_))));
        Ok(())
    }

    #[test]
    fn test_rename_table() -> Result<()> {
        let dir = TempDir::new()?;
        let conn = Connection::open(config(&dir))?;
        conn.create_table("old", false)?.put(7, b"seven".to_vec());
        conn.checkpoint()?;
        conn.create_table("cold", true)?;
        conn.create_table("taken", false)?;

        assert!(matches!(conn.rename_table("cold", "warm"), Err(Error::InvalidOperation(_))));
        assert!(matches!(conn.rename_table("old", "taken"), Err(Error::InvalidOperation(_))));

        conn.rename_table("old", "new")?;
        assert!(conn.metadata().table("old").is_none());
        let table = conn.open_table("new")?;
        assert_eq!(table.get(7)?, Some(b"seven".to_vec()));
        Ok(())
    }

    #[test]
    fn test_find_through_connection() -> Result<()> {
        let dir = TempDir::new()?;
        let conn = Connection::open(config(&dir))?;
        for i in 0..20 {
            conn.catalog().insert("orders", doc([("qty", i), ("status", i % 2)]))?;
        }
        conn.catalog()
            .create_index("orders", IndexDesc::new("qty_1", "qty"))?;

        let result = conn.find(&Query::new("orders", Expr::lt("qty", 4)))?;
        assert_eq!(result.strategy, PlanStrategy::SingleSolution);
        assert_eq!(result.documents.len(), 4);

        let missing = conn.find(&Query::new("nope", Expr::True))?;
        assert_eq!(missing.strategy, PlanStrategy::Eof);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_background_tasks_migrate_objects() -> Result<()> {
        let dir = TempDir::new()?;
        let store = Arc::new(MemoryStore::new());
        let config = config(&dir).tiered(
            TieredConfig::default()
                .work_interval(Duration::from_millis(10))
                .sweep_interval(Duration::from_millis(10)),
        );
        let conn = Connection::open_with_store(config, store.clone())?;
        let table = conn.create_table("t", true)?;
        table.put(1, b"x".to_vec());
        conn.flush_tier()?;

        let scheduler = conn.start_background();
        assert_eq!(scheduler.task_count(), 2);

        let mut state = None;
        for _ in 0..200 {
            state = conn
                .metadata()
                .table("t")
                .and_then(|t| t.object(1).map(|o| o.state));
            if state == Some(ObjectState::Removed) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        scheduler.shutdown().await?;

        assert_eq!(state, Some(ObjectState::Removed));
        assert!(store.contains("tierdb", "t-0000000001.tobj"));
        Ok(())
    }
}
