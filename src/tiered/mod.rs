//! Tiered storage: migrating read-only objects to an object store.
//!
//! The checkpoint orchestrator enqueues work; a single [`TieredServer`]
//! worker drains it. An object moves through
//! `Local -> Migrating -> RemoteAvailable -> LocalRemovable -> Removed`, and
//! every transition is recorded in the [`metadata`] log.

pub mod metadata;
pub mod object_store;
pub mod queue;
pub mod server;
pub mod tasks;
pub mod work;

pub use metadata::{MetadataStore, ObjectState, TableMeta, TieringMeta};
pub use object_store::{DirStore, MemoryStore, ObjectStore};
pub use queue::WorkQueue;
pub use server::TieredServer;
pub use tasks::{SweepTask, TieredWorkTask};
pub use work::{WorkItem, WorkType};
