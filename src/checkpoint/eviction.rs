//! Per-table eviction switch and the cache pressure check.
//!
//! Evictors take an [`EvictionTicket`] before writing a page out; blocking a
//! table refuses new tickets and waits for the outstanding ones to drop, so
//! nothing lands in the table's current object once `block` returns.

use std::collections::HashMap;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::config::EvictionConfig;
use crate::error::Result;

#[derive(Debug, Default)]
struct TableEviction {
    /// Nesting count of blockers.
    blockers: usize,
    /// Evictions in flight.
    active: usize,
}

impl TableEviction {
    fn is_idle(&self) -> bool {
        self.blockers == 0 && self.active == 0
    }
}

pub struct EvictionControl {
    config: EvictionConfig,
    tables: Mutex<HashMap<String, TableEviction>>,
    drained: Condvar,
}

impl EvictionControl {
    pub fn new(config: EvictionConfig) -> Self {
        Self {
            config,
            tables: Mutex::new(HashMap::new()),
            drained: Condvar::new(),
        }
    }

    /// Refuses new evictions of `table` and waits for running ones to finish.
    pub fn block_eviction(&self, table: &str) {
        let mut tables = self.tables.lock();
        tables.entry(table.to_string()).or_default().blockers += 1;
        while tables.get(table).map_or(false, |t| t.active > 0) {
            self.drained.wait(&mut tables);
        }
        debug!(table = %table, "Eviction blocked");
    }

    pub fn allow_eviction(&self, table: &str) {
        let mut tables = self.tables.lock();
        if let Some(state) = tables.get_mut(table) {
            if state.blockers > 0 {
                state.blockers -= 1;
                if state.blockers == 0 {
                    debug!(table = %table, "Eviction allowed");
                }
            }
            if state.is_idle() {
                tables.remove(table);
            }
        }
    }

    pub fn is_blocked(&self, table: &str) -> bool {
        self.tables
            .lock()
            .get(table)
            .map_or(false, |t| t.blockers > 0)
    }

    /// Registers an eviction of one of `table`'s pages, or `None` while the
    /// table is blocked.
    pub fn begin_eviction(&self, table: &str) -> Option<EvictionTicket<'_>> {
        let mut tables = self.tables.lock();
        let state = tables.entry(table.to_string()).or_default();
        if state.blockers > 0 {
            return None;
        }
        state.active += 1;
        Some(EvictionTicket {
            control: self,
            table: table.to_string(),
        })
    }

    fn end_eviction(&self, table: &str) {
        let mut tables = self.tables.lock();
        if let Some(state) = tables.get_mut(table) {
            state.active = state.active.saturating_sub(1);
            if state.is_idle() {
                tables.remove(table);
            }
        }
        self.drained.notify_all();
    }

    /// Blocks eviction for `table` until the guard is dropped.
    pub fn block(&self, table: &str) -> EvictionGuard<'_> {
        self.block_eviction(table);
        EvictionGuard {
            control: self,
            table: table.to_string(),
        }
    }

    /// Whether `used` bytes of cache have crossed the trigger.
    pub fn needs_eviction(&self, used: u64) -> Result<bool> {
        let trigger = self.config.trigger_pct()?;
        Ok(used as f64 >= self.config.cache_size as f64 * trigger / 100.0)
    }

    /// Bytes eviction should bring usage down to.
    pub fn target_bytes(&self) -> Result<u64> {
        let target = self.config.target_pct()?;
        Ok((self.config.cache_size as f64 * target / 100.0) as u64)
    }
}

pub struct EvictionGuard<'a> {
    control: &'a EvictionControl,
    table: String,
}

impl Drop for EvictionGuard<'_> {
    fn drop(&mut self) {
        self.control.allow_eviction(&self.table);
    }
}

/// One eviction in flight; blockers of the table wait for it to drop.
pub struct EvictionTicket<'a> {
    control: &'a EvictionControl,
    table: String,
}

impl Drop for EvictionTicket<'_> {
    fn drop(&mut self) {
        self.control.end_eviction(&self.table);
    }
}
