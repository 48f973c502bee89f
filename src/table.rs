use std::sync::Arc;

use crate::block::{BlockHandleCache, BlockManager};
use crate::checkpoint::btree::{Btree, PageId};
use crate::checkpoint::eviction::EvictionControl;
use crate::config::BlockConfig;
use crate::error::Result;
use crate::tiered::{TableMeta, TieringMeta};

/// An open table: its block manager and the pages stored through it.
pub struct Table {
    name: String,
    manager: Arc<BlockManager>,
    btree: Btree,
    tiering: Option<TieringMeta>,
}

impl Table {
    /// Opens a table at its recorded current object and last checkpoint.
    pub fn open(meta: &TableMeta, cache: Arc<BlockHandleCache>, config: BlockConfig) -> Result<Self> {
        let manager = Arc::new(BlockManager::open(
            meta.name.clone(),
            cache,
            config,
            meta.current_object,
        )?);
        let btree = Btree::open(manager.clone(), meta.checkpoint.map(|c| c.root))?;
        Ok(Self {
            name: meta.name.clone(),
            manager,
            btree,
            tiering: meta.tiering.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn manager(&self) -> &Arc<BlockManager> {
        &self.manager
    }

    pub fn btree(&self) -> &Btree {
        &self.btree
    }

    pub fn tiering(&self) -> Option<&TieringMeta> {
        self.tiering.as_ref()
    }

    pub fn is_tiered(&self) -> bool {
        self.tiering.is_some()
    }

    pub fn put(&self, page: PageId, data: Vec<u8>) {
        self.btree.put_page(page, data);
    }

    pub fn get(&self, page: PageId) -> Result<Option<Vec<u8>>> {
        self.btree.get_page(page)
    }

    pub fn delete(&self, page: PageId) -> bool {
        self.btree.delete_page(page)
    }

    /// Evicts pages down to the target once memory use crosses the trigger.
    pub fn evict_if_needed(&self, eviction: &EvictionControl) -> Result<usize> {
        if !eviction.needs_eviction(self.btree.in_memory_bytes())? {
            return Ok(0);
        }
        self.btree.evict(eviction, eviction.target_bytes()?)
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("name", &self.name)
            .field("manager", &self.manager)
            .field("tiered", &self.is_tiered())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemFs;
    use crate::config::EvictionConfig;

    #[test]
    fn test_open_from_metadata() -> Result<()> {
        let cache = Arc::new(BlockHandleCache::new(Arc::new(MemFs::new()), None));
        let mut meta = TableMeta::new("t", None);
        meta.current_object = 3;

        let table = Table::open(&meta, cache.clone(), BlockConfig::default())?;
        assert_eq!(table.manager().current_object_id(), 3);
        table.put(1, b"page".to_vec());
        let root = table.btree().checkpoint()?;
        drop(table);

        meta.checkpoint = Some(crate::tiered::metadata::CheckpointMeta {
            root,
            generation: 1,
        });
        let table = Table::open(&meta, cache, BlockConfig::default())?;
        assert_eq!(table.get(1)?, Some(b"page".to_vec()));
        Ok(())
    }

    #[test]
    fn test_evict_if_needed() -> Result<()> {
        let cache = Arc::new(BlockHandleCache::new(Arc::new(MemFs::new()), None));
        let table = Table::open(&TableMeta::new("t", None), cache, BlockConfig::default())?;
        let eviction = EvictionControl::new(
            EvictionConfig::default()
                .cache_size(1000)
                .target(50.0)
                .trigger(90.0),
        );

        table.put(1, vec![0u8; 400]);
        table.put(2, vec![0u8; 400]);
        assert_eq!(table.evict_if_needed(&eviction)?, 0);

        table.put(3, vec![0u8; 400]);
        assert_eq!(table.evict_if_needed(&eviction)?, 2);
        assert_eq!(table.btree().in_memory_bytes(), 400);
        Ok(())
    }
}
