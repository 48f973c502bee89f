use std::fmt;

use crate::block::ObjectKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkType {
    /// Copy a read-only object to the object store.
    Flush,
    /// Tell the object's owner that its remote copy is durable.
    FlushFinish,
    /// Allow the local copy to be reclaimed.
    RemoveLocal,
    /// Delete the remote copy.
    RemoveShared,
}

impl WorkType {
    pub const ALL: [WorkType; 4] = [
        WorkType::Flush,
        WorkType::FlushFinish,
        WorkType::RemoveLocal,
        WorkType::RemoveShared,
    ];

    pub fn index(self) -> usize {
        match self {
            WorkType::Flush => 0,
            WorkType::FlushFinish => 1,
            WorkType::RemoveLocal => 2,
            WorkType::RemoveShared => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkType::Flush => "flush",
            WorkType::FlushFinish => "flush_finish",
            WorkType::RemoveLocal => "remove_local",
            WorkType::RemoveShared => "remove_shared",
        }
    }
}

impl fmt::Display for WorkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub kind: WorkType,
    pub table: String,
    pub object_id: u32,
    /// Checkpoint generation that must complete before this item is ready.
    pub generation: u64,
    /// Failed attempts so far.
    pub attempts: u32,
}

impl WorkItem {
    pub fn new(kind: WorkType, table: impl Into<String>, object_id: u32, generation: u64) -> Self {
        Self {
            kind,
            table: table.into(),
            object_id,
            generation,
            attempts: 0,
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.table.clone(), self.object_id)
    }

    /// Follow-up item for the same object and generation.
    pub fn chain(&self, kind: WorkType) -> Self {
        Self::new(kind, self.table.clone(), self.object_id, self.generation)
    }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}({}:{} gen {})",
            self.kind, self.table, self.object_id, self.generation
        )
    }
}
