//! Collections and their indexes. Every index-set change invalidates the
//! plan caches that could hold plans built against the old set.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use super::exec::{IndexDesc, MemCollection, RecordId};
use super::query::Document;
use super::registry::PlanCacheRegistry;
use crate::error::{Error, Result};

pub type CollectionRef = Arc<RwLock<MemCollection>>;

#[derive(Debug)]
pub struct Catalog {
    collections: RwLock<HashMap<String, CollectionRef>>,
    registry: Arc<PlanCacheRegistry>,
}

impl Catalog {
    pub fn new(registry: Arc<PlanCacheRegistry>) -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<PlanCacheRegistry> {
        &self.registry
    }

    pub fn collection(&self, name: &str) -> Option<CollectionRef> {
        self.collections.read().get(name).cloned()
    }

    pub fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn create_collection(&self, name: &str) -> Result<CollectionRef> {
        let mut collections = self.collections.write();
        if collections.contains_key(name) {
            return Err(Error::InvalidOperation(format!(
                "collection {} already exists",
                name
            )));
        }
        let coll = Arc::new(RwLock::new(MemCollection::new(name)));
        collections.insert(name.to_string(), coll.clone());
        info!(collection = name, "Created collection");
        Ok(coll)
    }

    pub fn drop_collection(&self, name: &str) -> Result<()> {
        self.collections
            .write()
            .remove(name)
            .ok_or_else(|| Error::NotFound(format!("collection {}", name)))?;
        let removed = self.registry.on_collection_dropped(name);
        info!(collection = name, plans_removed = removed, "Dropped collection");
        Ok(())
    }

    /// Inserts into `collection`, creating it on first use.
    pub fn insert(&self, collection: &str, doc: Document) -> Result<RecordId> {
        let coll = match self.collection(collection) {
            Some(coll) => coll,
            None => {
                let mut collections = self.collections.write();
                collections
                    .entry(collection.to_string())
                    .or_insert_with(|| Arc::new(RwLock::new(MemCollection::new(collection))))
                    .clone()
            }
        };
        let id = coll.write().insert(doc)?;
        Ok(id)
    }

    pub fn create_index(&self, collection: &str, desc: IndexDesc) -> Result<()> {
        let coll = self
            .collection(collection)
            .ok_or_else(|| Error::NotFound(format!("collection {}", collection)))?;
        let name = desc.name.clone();
        coll.write().create_index(desc)?;
        let removed = self.registry.on_index_created(collection);
        debug!(collection, index = %name, plans_removed = removed, "Created index");
        Ok(())
    }

    pub fn drop_index(&self, collection: &str, index: &str) -> Result<IndexDesc> {
        let coll = self
            .collection(collection)
            .ok_or_else(|| Error::NotFound(format!("collection {}", collection)))?;
        let desc = coll.write().drop_index(index)?;
        let removed = self.registry.on_index_dropped(collection, index);
        debug!(collection, index, plans_removed = removed, "Dropped index");
        Ok(desc)
    }
}
