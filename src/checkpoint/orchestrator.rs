//! Checkpoint with optional tier flush.
//!
//! Phases: prepare (pick tables, pre-allocate next objects, queue flushes),
//! then per table: block eviction, write the checkpoint, complete the object
//! switch, fsync the old object, record metadata, re-enable eviction. Tables
//! are processed one at a time; a failed table does not stop the others but
//! its generation is not marked complete.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info};

use super::eviction::EvictionControl;
use crate::block::PendingSwitch;
use crate::error::Result;
use crate::table::Table;
use crate::tiered::metadata::{CheckpointMeta, MetadataStore, ObjectState};
use crate::tiered::{TieredServer, WorkItem, WorkType};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointReport {
    pub generation: u64,
    /// Tables whose checkpoint completed.
    pub tables: Vec<String>,
    /// `(table, object_id)` of objects made read-only and queued for flush.
    pub switched: Vec<(String, u32)>,
}

pub struct CheckpointOrchestrator {
    metadata: Arc<MetadataStore>,
    server: Arc<TieredServer>,
    eviction: Arc<EvictionControl>,
    running: Mutex<()>,
}

impl CheckpointOrchestrator {
    pub fn new(
        metadata: Arc<MetadataStore>,
        server: Arc<TieredServer>,
        eviction: Arc<EvictionControl>,
    ) -> Self {
        Self {
            metadata,
            server,
            eviction,
            running: Mutex::new(()),
        }
    }

    /// Checkpoints every modified table. With `flush_tier`, tiered tables with
    /// unflushed data also switch objects and queue the old one for flush.
    pub fn checkpoint(&self, tables: &[Arc<Table>], flush_tier: bool) -> Result<CheckpointReport> {
        let _running = self.running.lock();
        let generation = self.metadata.next_generation()?;

        let (candidates, mut switches) = self.prepare(tables, flush_tier, generation)?;
        debug!(
            generation,
            tables = candidates.len(),
            switches = switches.len(),
            "Checkpoint prepared"
        );

        let mut report = CheckpointReport {
            generation,
            ..Default::default()
        };
        let mut first_error = None;

        for table in candidates {
            let token = switches.remove(table.name());
            match self.checkpoint_table(&table, token, generation) {
                Ok(()) => {
                    if let Some(token) = token {
                        report
                            .switched
                            .push((table.name().to_string(), token.previous));
                    }
                    self.server
                        .mark_checkpoint_complete(table.name(), generation);
                    report.tables.push(table.name().to_string());
                }
                Err(e) => {
                    error!(
                        table = %table.name(),
                        generation,
                        error = %e,
                        "Table checkpoint failed"
                    );
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }

        info!(
            generation,
            tables = report.tables.len(),
            switched = report.switched.len(),
            flush_tier,
            "Checkpoint complete"
        );
        Ok(report)
    }

    /// Picks the tables to checkpoint. For tiered ones under `flush_tier`,
    /// allocates the next object now and queues the flush of the current one,
    /// gated on this generation.
    #[allow(clippy::type_complexity)]
    fn prepare(
        &self,
        tables: &[Arc<Table>],
        flush_tier: bool,
        generation: u64,
    ) -> Result<(Vec<Arc<Table>>, HashMap<String, PendingSwitch>)> {
        let mut candidates = Vec::new();
        let mut switches = HashMap::new();

        for table in tables {
            let manager = table.manager();
            let modified = table.btree().is_modified();
            let flush =
                flush_tier && table.is_tiered() && (modified || manager.current_size() > 0);
            if !modified && !flush {
                continue;
            }

            if flush {
                let token = manager.switch_object()?;
                self.server.enqueue(WorkItem::new(
                    WorkType::Flush,
                    table.name(),
                    token.previous,
                    generation,
                ));
                switches.insert(table.name().to_string(), token);
            }
            candidates.push(table.clone());
        }
        Ok((candidates, switches))
    }

    fn checkpoint_table(
        &self,
        table: &Table,
        token: Option<PendingSwitch>,
        generation: u64,
    ) -> Result<()> {
        let name = table.name();
        let manager = table.manager();
        let _blocked = self.eviction.block(name);

        let root = table.btree().checkpoint()?;

        match token {
            Some(token) => {
                manager.complete_switch(token)?;
                manager.sync_object(token.previous)?;
                let recorded = self
                    .metadata
                    .switch_object(name, token.object_id)
                    .and_then(|()| {
                        self.metadata.set_object_state(
                            name,
                            token.previous,
                            ObjectState::Migrating,
                            false,
                        )
                    });
                if let Err(e) = recorded {
                    error!(
                        table = %name,
                        previous = token.previous,
                        current = token.object_id,
                        error = %e,
                        "Object switch completed but not recorded in metadata"
                    );
                    return Err(e);
                }
                debug!(
                    table = %name,
                    previous = token.previous,
                    current = token.object_id,
                    "Object switched at checkpoint"
                );
            }
            None => manager.sync_object(root.object_id)?,
        }

        self.metadata
            .record_checkpoint(name, CheckpointMeta { root, generation })?;
        Ok(())
    }
}
