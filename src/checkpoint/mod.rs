//! Checkpoints, the per-table eviction switch and the page store they act on.

pub mod btree;
pub mod eviction;
pub mod orchestrator;

pub use btree::{Btree, PageId};
pub use eviction::{EvictionControl, EvictionGuard, EvictionTicket};
pub use orchestrator::{CheckpointOrchestrator, CheckpointReport};
