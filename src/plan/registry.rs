//! One plan cache per execution engine, invalidated together on catalog changes.

use std::fmt;

use tracing::debug;

use super::cache::PlanCache;
use super::shape::PlanCacheKey;
use super::solution::PlanTemplate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Engine {
    Classic,
    Vectorized,
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Engine::Classic => write!(f, "classic"),
            Engine::Vectorized => write!(f, "vectorized"),
        }
    }
}

pub type TemplateCache = PlanCache<PlanCacheKey, PlanTemplate>;

#[derive(Debug)]
pub struct PlanCacheRegistry {
    classic: TemplateCache,
    vectorized: TemplateCache,
}

impl PlanCacheRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            classic: PlanCache::new(capacity),
            vectorized: PlanCache::new(capacity),
        }
    }

    pub fn cache(&self, engine: Engine) -> &TemplateCache {
        match engine {
            Engine::Classic => &self.classic,
            Engine::Vectorized => &self.vectorized,
        }
    }

    fn each(&self) -> [&TemplateCache; 2] {
        [&self.classic, &self.vectorized]
    }

    /// A new index can beat any cached plan on the collection.
    pub fn on_index_created(&self, collection: &str) -> usize {
        let removed: usize = self
            .each()
            .iter()
            .map(|c| c.invalidate(|key, _| key.collection == collection))
            .sum();
        debug!(collection, removed, "Invalidated plans after index creation");
        removed
    }

    pub fn on_index_dropped(&self, collection: &str, index: &str) -> usize {
        let removed: usize = self
            .each()
            .iter()
            .map(|c| {
                c.invalidate(|key, template| {
                    key.collection == collection && template.references(index)
                })
            })
            .sum();
        debug!(collection, index, removed, "Invalidated plans after index drop");
        removed
    }

    pub fn on_collection_dropped(&self, collection: &str) -> usize {
        self.each()
            .iter()
            .map(|c| c.invalidate(|key, _| key.collection == collection))
            .sum()
    }

    pub fn clear(&self) {
        self.classic.clear();
        self.vectorized.clear();
    }
}
