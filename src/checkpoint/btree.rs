//! Checkpointable page store standing in for a table's btree.
//!
//! Pages live in memory until evicted (written to the current object) or
//! checkpointed. A checkpoint writes every dirty page and then a root block
//! listing all pages; the root's cookies are relative to the object the root
//! is written to, so pages left behind in older objects become quadruples.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::eviction::EvictionControl;
use crate::block::{AddressCookie, BlockAddr, BlockManager};
use crate::encoding;
use crate::error::{Error, Result};

pub type PageId = u64;

#[derive(Debug, Serialize, Deserialize)]
struct RootEntry {
    page_id: PageId,
    cookie: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RootPage {
    entries: Vec<RootEntry>,
}

#[derive(Debug, Default)]
struct Page {
    /// `None` once evicted.
    data: Option<Vec<u8>>,
    dirty: bool,
    /// Where the last written version lives.
    addr: Option<BlockAddr>,
}

#[derive(Default)]
struct Inner {
    pages: BTreeMap<PageId, Page>,
    /// Modified since the last checkpoint.
    modified: bool,
    /// Superseded blocks; still referenced by the last root until the next one.
    obsolete: Vec<BlockAddr>,
    root: Option<BlockAddr>,
}

pub struct Btree {
    manager: Arc<BlockManager>,
    inner: Mutex<Inner>,
}

impl Btree {
    pub fn new(manager: Arc<BlockManager>) -> Self {
        Self {
            manager,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Loads the page directory from a checkpoint root. Page contents are
    /// read lazily.
    pub fn open(manager: Arc<BlockManager>, root: Option<BlockAddr>) -> Result<Self> {
        let root_addr = match root {
            Some(root) => root,
            None => return Ok(Self::new(manager)),
        };

        let bytes = manager.read_addr(&root_addr)?;
        let root_page: RootPage = encoding::deserialize(&bytes)?;

        let mut pages = BTreeMap::new();
        for entry in root_page.entries {
            let cookie = AddressCookie::decode(&entry.cookie)?;
            pages.insert(
                entry.page_id,
                Page {
                    data: None,
                    dirty: false,
                    addr: Some(cookie.resolve_at(root_addr.object_id)),
                },
            );
        }

        debug!(
            table = %manager.table(),
            pages = pages.len(),
            root = ?root_addr,
            "Loaded checkpoint root"
        );

        Ok(Self {
            manager,
            inner: Mutex::new(Inner {
                pages,
                modified: false,
                obsolete: Vec::new(),
                root: Some(root_addr),
            }),
        })
    }

    pub fn manager(&self) -> &Arc<BlockManager> {
        &self.manager
    }

    pub fn put_page(&self, id: PageId, data: Vec<u8>) {
        let mut inner = self.inner.lock();
        let page = inner.pages.entry(id).or_default();
        let previous = page.addr.take();
        page.data = Some(data);
        page.dirty = true;
        if let Some(addr) = previous {
            inner.obsolete.push(addr);
        }
        inner.modified = true;
    }

    pub fn delete_page(&self, id: PageId) -> bool {
        let mut inner = self.inner.lock();
        match inner.pages.remove(&id) {
            Some(page) => {
                if let Some(addr) = page.addr {
                    inner.obsolete.push(addr);
                }
                inner.modified = true;
                true
            }
            None => false,
        }
    }

    pub fn get_page(&self, id: PageId) -> Result<Option<Vec<u8>>> {
        let addr = {
            let inner = self.inner.lock();
            match inner.pages.get(&id) {
                None => return Ok(None),
                Some(Page {
                    data: Some(data), ..
                }) => return Ok(Some(data.clone())),
                Some(Page { addr: Some(addr), .. }) => *addr,
                Some(_) => {
                    return Err(Error::InvalidState(format!(
                        "page {} of {} has neither data nor address",
                        id,
                        self.manager.table()
                    )))
                }
            }
        };

        let data = self.manager.read_addr(&addr)?;

        let mut inner = self.inner.lock();
        if let Some(page) = inner.pages.get_mut(&id) {
            if page.data.is_none() && page.addr == Some(addr) {
                page.data = Some(data.clone());
            }
        }
        Ok(Some(data))
    }

    pub fn page_ids(&self) -> Vec<PageId> {
        self.inner.lock().pages.keys().copied().collect()
    }

    pub fn is_modified(&self) -> bool {
        self.inner.lock().modified
    }

    pub fn is_dirty(&self, id: PageId) -> bool {
        self.inner.lock().pages.get(&id).map_or(false, |p| p.dirty)
    }

    pub fn root(&self) -> Option<BlockAddr> {
        self.inner.lock().root
    }

    /// Bytes of page data held in memory.
    pub fn in_memory_bytes(&self) -> u64 {
        self.inner
            .lock()
            .pages
            .values()
            .filter_map(|p| p.data.as_ref())
            .map(|d| d.len() as u64)
            .sum()
    }

    /// Writes one page out to the current object and drops it from memory.
    /// Returns false if eviction is blocked for this table.
    pub fn evict_page(&self, id: PageId, eviction: &EvictionControl) -> Result<bool> {
        let _ticket = match eviction.begin_eviction(self.manager.table()) {
            Some(ticket) => ticket,
            None => return Ok(false),
        };

        let mut inner = self.inner.lock();
        let page = match inner.pages.get_mut(&id) {
            Some(page) => page,
            None => return Ok(false),
        };
        let data = match page.data.take() {
            Some(data) => data,
            None => return Ok(false),
        };
        if page.dirty {
            match self.manager.write_block(&data) {
                Ok(addr) => {
                    page.addr = Some(addr);
                    page.dirty = false;
                }
                Err(e) => {
                    page.data = Some(data);
                    return Err(e);
                }
            }
        }
        debug!(table = %self.manager.table(), page = id, "Evicted page");
        Ok(true)
    }

    /// Evicts pages, lowest id first, until at most `target` bytes remain in
    /// memory. Returns the number evicted.
    pub fn evict(&self, eviction: &EvictionControl, target: u64) -> Result<usize> {
        let mut evicted = 0;
        for id in self.page_ids() {
            if self.in_memory_bytes() <= target {
                break;
            }
            if self.evict_page(id, eviction)? {
                evicted += 1;
            } else if eviction.is_blocked(self.manager.table()) {
                break;
            }
        }
        Ok(evicted)
    }

    /// Writes every dirty page, then the root. The caller guarantees this is
    /// the only writer on the table for the duration.
    pub fn checkpoint(&self) -> Result<BlockAddr> {
        let mut inner = self.inner.lock();

        for (id, page) in inner.pages.iter_mut().filter(|(_, p)| p.dirty) {
            let data = page.data.as_ref().ok_or_else(|| {
                Error::InvalidState(format!("dirty page {} has no data", id))
            })?;
            page.addr = Some(self.manager.write_block(data)?);
            page.dirty = false;
        }

        let site = self.manager.current_object_id();
        let mut entries = Vec::with_capacity(inner.pages.len());
        for (id, page) in &inner.pages {
            let addr = page.addr.ok_or_else(|| {
                Error::InvalidState(format!("page {} was never written", id))
            })?;
            entries.push(RootEntry {
                page_id: *id,
                cookie: addr.cookie_at(site).encode(),
            });
        }

        let root = self
            .manager
            .write_block(&encoding::serialize(&RootPage { entries })?)?;
        if root.object_id != site {
            return Err(Error::InvalidState(format!(
                "root of {} landed in object {}, expected {}",
                self.manager.table(),
                root.object_id,
                site
            )));
        }

        // The previous root and the blocks only it referenced are now free.
        let mut obsolete = std::mem::take(&mut inner.obsolete);
        if let Some(previous) = inner.root.replace(root) {
            obsolete.push(previous);
        }
        for addr in &obsolete {
            self.manager.free(addr)?;
        }
        inner.modified = false;

        info!(
            table = %self.manager.table(),
            pages = inner.pages.len(),
            freed = obsolete.len(),
            object_id = root.object_id,
            "Checkpointed btree"
        );
        Ok(root)
    }
}
