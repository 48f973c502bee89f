//! Per-btree block manager.
//!
//! Owns the "current" writable object and the handle array. The state lock is
//! held only to look up or swap handles; block I/O always happens outside it.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::cookie::{AddressCookie, BlockAddr};
use super::extent::ExtentList;
use super::handle::{BlockHandle, HandleRef};
use super::handle_cache::BlockHandleCache;
use crate::config::BlockConfig;
use crate::error::{Error, Result};
use crate::hasher::block_checksum;

/// Attempts to re-pin a handle that a concurrent sweep reclaimed.
const MAX_REACQUIRE: usize = 3;

/// Token returned by [`BlockManager::switch_object`], redeemed by
/// [`BlockManager::complete_switch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingSwitch {
    pub previous: u32,
    pub object_id: u32,
}

struct CurrentObject {
    handle: HandleRef,
    extents: Mutex<ExtentList>,
}

struct State {
    current: Arc<CurrentObject>,
    pending: Option<(PendingSwitch, HandleRef)>,
    /// Uncounted; always contains the current handle.
    handles: Vec<Arc<BlockHandle>>,
    archived_upto: u32,
    garbage_bytes: u64,
}

impl State {
    fn find(&self, object_id: u32) -> Option<&Arc<BlockHandle>> {
        self.handles.iter().find(|h| h.object_id() == object_id)
    }
}

pub struct BlockManager {
    table: String,
    cache: Arc<BlockHandleCache>,
    config: BlockConfig,
    state: RwLock<State>,
    switch_lock: Mutex<()>,
}

impl BlockManager {
    /// Opens a table's block manager with `current` as its writable object,
    /// creating the object if it does not exist yet.
    pub fn open(
        table: impl Into<String>,
        cache: Arc<BlockHandleCache>,
        config: BlockConfig,
        current: u32,
    ) -> Result<Self> {
        let table = table.into();
        let handle = cache.create(&table, current)?;
        let end = handle.file().size()?;
        let extents = ExtentList::with_end(config.allocation_size, end);

        debug!(table = %table, object_id = current, end, "Opened block manager");

        let handles = vec![handle.handle().clone()];
        Ok(Self {
            table,
            cache,
            config,
            state: RwLock::new(State {
                current: Arc::new(CurrentObject {
                    handle,
                    extents: Mutex::new(extents),
                }),
                pending: None,
                handles,
                archived_upto: 0,
                garbage_bytes: 0,
            }),
            switch_lock: Mutex::new(()),
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn current_object_id(&self) -> u32 {
        self.state.read().current.handle.object_id()
    }

    pub fn pending_switch(&self) -> Option<PendingSwitch> {
        self.state.read().pending.as_ref().map(|(token, _)| *token)
    }

    /// Object ids in the handle array, oldest first.
    pub fn handle_ids(&self) -> Vec<u32> {
        self.state.read().handles.iter().map(|h| h.object_id()).collect()
    }

    pub fn archived_upto(&self) -> u32 {
        self.state.read().archived_upto
    }

    /// Bytes freed in read-only objects, never reused.
    pub fn garbage_bytes(&self) -> u64 {
        self.state.read().garbage_bytes
    }

    /// Bytes written to the current object so far.
    pub fn current_size(&self) -> u64 {
        self.state.read().current.extents.lock().end()
    }

    /// Resolves a cookie read from the current object.
    pub fn resolve(&self, cookie: &AddressCookie) -> Result<(HandleRef, BlockAddr)> {
        self.resolve_from(self.current_object_id(), cookie)
    }

    /// Resolves a cookie that was stored inside object `site`.
    pub fn resolve_from(&self, site: u32, cookie: &AddressCookie) -> Result<(HandleRef, BlockAddr)> {
        let addr = cookie.resolve_at(site);
        let handle = self.handle_for(addr.object_id)?;
        Ok((handle, addr))
    }

    /// Counted reference to one of this table's objects, adding it to the
    /// handle array if needed.
    pub fn handle_for(&self, object_id: u32) -> Result<HandleRef> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.try_handle_for(object_id) {
                Err(e) if e.is_retryable() && attempts < MAX_REACQUIRE => {
                    debug!(
                        table = %self.table,
                        object_id,
                        "Handle reclaimed concurrently, re-acquiring"
                    );
                    self.forget(object_id);
                }
                other => return other,
            }
        }
    }

    fn try_handle_for(&self, object_id: u32) -> Result<HandleRef> {
        {
            let state = self.state.read();
            if state.current.handle.object_id() == object_id {
                return Ok(state.current.handle.clone());
            }
            if let Some(handle) = state.find(object_id) {
                return self.cache.pin(handle);
            }
        }

        let handle = self.cache.acquire(&self.table, object_id)?;

        let mut state = self.state.write();
        if state.find(object_id).is_none() {
            state.handles.push(handle.handle().clone());
            self.trim_handles(&mut state);
        }
        Ok(handle)
    }

    fn forget(&self, object_id: u32) {
        let mut state = self.state.write();
        let current = state.current.handle.object_id();
        state
            .handles
            .retain(|h| h.object_id() == current || h.object_id() != object_id || !h.is_swept());
    }

    /// Keeps the array bounded; the current and pending handles always stay.
    fn trim_handles(&self, state: &mut State) {
        let current = state.current.handle.object_id();
        let pending = state.pending.as_ref().map(|(token, _)| token.object_id);
        while state.handles.len() > self.config.max_handle_array {
            let victim = state
                .handles
                .iter()
                .position(|h| h.object_id() != current && Some(h.object_id()) != pending);
            match victim {
                Some(index) => {
                    state.handles.remove(index);
                }
                None => break,
            }
        }
    }

    /// Reads and verifies the block a cookie (stored in the current object) points to.
    pub fn read(&self, cookie: &AddressCookie) -> Result<Vec<u8>> {
        let (handle, addr) = self.resolve(cookie)?;
        self.read_from(&handle, &addr)
    }

    /// Reads and verifies a block by absolute address.
    pub fn read_addr(&self, addr: &BlockAddr) -> Result<Vec<u8>> {
        let handle = self.handle_for(addr.object_id)?;
        self.read_from(&handle, addr)
    }

    fn read_from(&self, handle: &HandleRef, addr: &BlockAddr) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; addr.size as usize];
        handle.file().read_at(&mut buf, addr.offset)?;

        let actual = block_checksum(&buf);
        if actual != addr.checksum {
            warn!(
                table = %self.table,
                object_id = addr.object_id,
                offset = addr.offset,
                expected = addr.checksum,
                actual,
                "Block checksum mismatch"
            );
            return Err(Error::ChecksumMismatch {
                table: self.table.clone(),
                object_id: addr.object_id,
                offset: addr.offset,
                expected: addr.checksum,
                actual,
            });
        }
        Ok(buf)
    }

    /// Writes a block to the current object and returns its absolute address.
    pub fn write_block(&self, data: &[u8]) -> Result<BlockAddr> {
        let size = u32::try_from(data.len()).map_err(|_| {
            Error::InvalidOperation(format!("block of {} bytes is too large", data.len()))
        })?;

        let current = self.state.read().current.clone();
        let offset = current.extents.lock().alloc(data.len() as u64);
        current.handle.file().write_at(data, offset)?;

        Ok(BlockAddr {
            object_id: current.handle.object_id(),
            offset,
            size,
            checksum: block_checksum(data),
        })
    }

    /// Writes a block to the current object; the cookie is relative to it.
    pub fn write(&self, data: &[u8]) -> Result<AddressCookie> {
        let addr = self.write_block(data)?;
        Ok(addr.cookie_at(addr.object_id))
    }

    /// Releases a block's space. Space in read-only objects is only accounted
    /// as garbage.
    pub fn free(&self, addr: &BlockAddr) -> Result<()> {
        let mut state = self.state.write();
        if addr.object_id == state.current.handle.object_id() {
            let current = state.current.clone();
            drop(state);
            let mut extents = current.extents.lock();
            return extents.free(addr.offset, addr.size as u64);
        }
        state.garbage_bytes += addr.size as u64;
        Ok(())
    }

    /// Creates the next object and adds it to the handle array without making
    /// it current. A switch left pending by an earlier failed checkpoint is
    /// handed out again instead of allocating another object.
    pub fn switch_object(&self) -> Result<PendingSwitch> {
        let _serial = self.switch_lock.lock();

        let previous = {
            let state = self.state.read();
            if let Some((token, _)) = &state.pending {
                info!(
                    table = %self.table,
                    object_id = token.object_id,
                    "Reusing pending object switch"
                );
                return Ok(*token);
            }
            state.current.handle.object_id()
        };

        let object_id = previous + 1;
        let handle = self.cache.create(&self.table, object_id)?;
        let token = PendingSwitch {
            previous,
            object_id,
        };

        let mut state = self.state.write();
        state.handles.push(handle.handle().clone());
        state.pending = Some((token, handle));
        self.trim_handles(&mut state);

        debug!(table = %self.table, previous, object_id, "Prepared object switch");
        Ok(token)
    }

    /// Makes the pending object current. The caller guarantees no writes are
    /// in flight against the old current object, which becomes read-only.
    pub fn complete_switch(&self, token: PendingSwitch) -> Result<u32> {
        let _serial = self.switch_lock.lock();
        let mut state = self.state.write();

        let handle = match state.pending.take() {
            Some((pending, handle)) if pending == token => handle,
            Some(other) => {
                let message = format!(
                    "switch to object {} is pending, not {}",
                    other.0.object_id, token.object_id
                );
                state.pending = Some(other);
                return Err(Error::InvalidState(message));
            }
            None => {
                return Err(Error::InvalidState(format!(
                    "no pending switch for {} object {}",
                    self.table, token.object_id
                )))
            }
        };

        let end = handle.file().size()?;
        let next = Arc::new(CurrentObject {
            handle,
            extents: Mutex::new(ExtentList::with_end(self.config.allocation_size, end)),
        });
        let old = std::mem::replace(&mut state.current, next);
        old.handle.set_read_only();
        let old_id = old.handle.object_id();
        drop(state);

        info!(
            table = %self.table,
            previous = old_id,
            current = token.object_id,
            "Switched current object"
        );
        Ok(old_id)
    }

    /// Flushes an object to stable storage.
    pub fn sync_object(&self, object_id: u32) -> Result<()> {
        let handle = self.handle_for(object_id)?;
        handle.file().sync()
    }

    /// Objects up to and including `object_id` now have durable remote copies;
    /// the handle cache may fetch them back if their local files go away.
    pub fn notify_object_archived(&self, object_id: u32) {
        let mut state = self.state.write();
        let current = state.current.handle.object_id();
        let upto = object_id.min(current.saturating_sub(1));
        for id in (state.archived_upto + 1)..=upto {
            self.cache.mark_remote(&self.table, id);
        }
        state.archived_upto = state.archived_upto.max(upto);
        debug!(table = %self.table, archived_upto = state.archived_upto, "Objects archived");
    }
}

impl std::fmt::Debug for BlockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockManager")
            .field("table", &self.table)
            .field("current", &self.current_object_id())
            .field("handles", &self.handle_ids())
            .finish()
    }
}
