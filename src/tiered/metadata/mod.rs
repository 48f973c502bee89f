//! Metadata log: the durable mapping from table name to its objects.
//!
//! Every object switch, migration state change and checkpoint is appended as
//! one edit and synced before the in-memory view changes, so a reopened store
//! replays to exactly the state callers last observed.
//!
//! # File Format
//!
//! ```text
//! +------------------+
//! | Header (64 bytes)|
//! +------------------+
//! | MetaEdit 1       |
//! +------------------+
//! | MetaEdit 2       |
//! +------------------+
//! | ...              |
//! +------------------+
//! ```
//!
//! Each edit is framed as:
//!
//! ```text
//! +-----------+------------------+-----------+
//! |length:u32 | serialized_edit  |crc32:u32  |
//! +-----------+------------------+-----------+
//! ```
//!
//! Every `snapshot_interval` edits a `Snapshot` edit carrying all tables is
//! appended; replay restarts from the last snapshot it sees.

pub mod edit;
pub mod header;
pub mod meta;

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::hasher::BLOCK_CRC;
pub use edit::MetaEdit;
use header::{MetadataHeader, HEADER_SIZE};
pub use meta::{CheckpointMeta, ObjectMeta, ObjectState, TableMeta, TieringMeta};

/// File name of the metadata log inside a database home.
pub const METADATA_FILE: &str = "tierdb.meta";

/// Replayed view of the metadata log.
#[derive(Debug, Clone, Default)]
pub struct MetadataState {
    pub tables: BTreeMap<String, TableMeta>,
    pub next_generation: u64,
}

impl MetadataState {
    fn new() -> Self {
        Self {
            tables: BTreeMap::new(),
            next_generation: 1,
        }
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut TableMeta> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(format!("table {}", name)))
    }

    fn apply(&mut self, edit: &MetaEdit) -> Result<()> {
        match edit {
            MetaEdit::CreateTable { table, .. } => {
                self.tables.insert(table.name.clone(), table.clone());
            }

            MetaEdit::SwitchObject {
                table, object_id, ..
            } => {
                let meta = self.table_mut(table)?;
                let previous = meta.current_object;
                if meta.object(previous).is_none() {
                    meta.objects.push(ObjectMeta::local(previous));
                }
                meta.current_object = *object_id;
            }

            MetaEdit::ObjectState {
                table,
                object_id,
                state,
                remote,
                ..
            } => {
                let meta = self.table_mut(table)?;
                let object = meta.object_mut(*object_id).ok_or_else(|| {
                    Error::NotFound(format!("object {} of table {}", object_id, table))
                })?;
                object.state = *state;
                object.remote = *remote;
            }

            MetaEdit::Checkpoint {
                table, checkpoint, ..
            } => {
                self.table_mut(table)?.checkpoint = Some(*checkpoint);
                self.next_generation = self.next_generation.max(checkpoint.generation + 1);
            }

            MetaEdit::DropTable { table, .. } => {
                self.tables.remove(table);
            }

            MetaEdit::RenameTable { from, to, .. } => {
                let mut meta = self
                    .tables
                    .remove(from)
                    .ok_or_else(|| Error::NotFound(format!("table {}", from)))?;
                meta.name = to.clone();
                self.tables.insert(to.clone(), meta);
            }

            MetaEdit::Snapshot {
                tables,
                next_generation,
                ..
            } => {
                self.tables = tables
                    .iter()
                    .map(|t| (t.name.clone(), t.clone()))
                    .collect();
                self.next_generation = *next_generation;
            }
        }
        Ok(())
    }
}

pub struct MetadataStore {
    file: File,
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
    header: RwLock<MetadataHeader>,
    state: RwLock<MetadataState>,
    edit_count: AtomicU32,
}

impl MetadataStore {
    /// Opens (or creates) the log at `path` and replays it.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;

        let header = if file.metadata()?.len() == 0 {
            let h = MetadataHeader::new();
            file.write_all(&h.encode()?)?;
            file.sync_all()?;
            h
        } else {
            let mut buf = [0u8; HEADER_SIZE];
            file.read_exact(&mut buf)?;
            MetadataHeader::decode(&buf)?
        };

        let (state, valid_len, last_seq) = Self::replay(&file)?;

        // Drop a torn tail so new edits follow the last complete one.
        if file.metadata()?.len() > valid_len {
            file.set_len(valid_len)?;
        }
        // Separate append-mode descriptor: header rewrites seek `file` freely.
        let append = OpenOptions::new().append(true).open(&path)?;

        let mut header = header;
        header.current_seq = header.current_seq.max(last_seq + 1);
        header.next_generation = header.next_generation.max(state.next_generation);

        info!(
            path = %path.display(),
            tables = state.tables.len(),
            next_generation = header.next_generation,
            "Opened metadata log"
        );

        Ok(Self {
            file,
            path,
            writer: Mutex::new(BufWriter::new(append)),
            header: RwLock::new(header),
            state: RwLock::new(state),
            edit_count: AtomicU32::new(0),
        })
    }

    /// Opens the log inside a database home.
    pub fn open_home(home: impl AsRef<Path>) -> Result<Self> {
        Self::open(home.as_ref().join(METADATA_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replays every complete edit. Returns the state, the byte length of the
    /// valid prefix and the highest sequence number seen.
    fn replay(file: &File) -> Result<(MetadataState, u64, u64)> {
        let mut reader = BufReader::new(file.try_clone()?);
        reader.seek(SeekFrom::Start(HEADER_SIZE as u64))?;

        let mut state = MetadataState::new();
        let mut valid_len = HEADER_SIZE as u64;
        let mut last_seq = 0;

        loop {
            let edit = match read_edit(&mut reader)? {
                Some((edit, framed_len)) => {
                    valid_len += framed_len;
                    edit
                }
                None => break,
            };
            last_seq = last_seq.max(edit.seq());
            state.apply(&edit)?;
        }

        Ok((state, valid_len, last_seq))
    }

    /// Reads every edit currently in the log.
    pub fn edits(&self) -> Result<Vec<MetaEdit>> {
        let mut writer = self.writer.lock();
        writer.flush()?;
        let mut reader = BufReader::new(self.file.try_clone()?);
        reader.seek(SeekFrom::Start(HEADER_SIZE as u64))?;

        let mut edits = Vec::new();
        while let Some((edit, _)) = read_edit(&mut reader)? {
            edits.push(edit);
        }
        Ok(edits)
    }

    /// Validates and builds an edit under the writer lock, makes it durable,
    /// then applies it to the in-memory state.
    fn commit<F>(&self, build: F) -> Result<()>
    where
        F: FnOnce(u64, &MetadataState) -> Result<MetaEdit>,
    {
        let mut writer = self.writer.lock();

        let seq = {
            let mut header = self.header.write();
            let seq = header.current_seq;
            header.current_seq += 1;
            seq
        };
        let edit = build(seq, &self.state.read())?;

        Self::append(&mut writer, &edit)?;
        writer.flush()?;
        writer.get_ref().sync_data()?;
        self.state.write().apply(&edit)?;
        debug!(seq, edit = ?edit, "Committed metadata edit");

        let count = self.edit_count.fetch_add(1, Ordering::SeqCst) + 1;
        if count >= self.header.read().snapshot_interval {
            self.edit_count.store(0, Ordering::SeqCst);
            self.write_snapshot(&mut writer)?;
        }
        Ok(())
    }

    fn append(writer: &mut BufWriter<File>, edit: &MetaEdit) -> Result<()> {
        let edit_bytes = edit.encode()?;
        let checksum = BLOCK_CRC.checksum(&edit_bytes);

        writer.write_u32::<BigEndian>(edit_bytes.len() as u32)?;
        writer.write_all(&edit_bytes)?;
        writer.write_u32::<BigEndian>(checksum)?;
        Ok(())
    }

    fn write_snapshot(&self, writer: &mut BufWriter<File>) -> Result<()> {
        let seq = {
            let mut header = self.header.write();
            let seq = header.current_seq;
            header.current_seq += 1;
            seq
        };
        let edit = {
            let state = self.state.read();
            MetaEdit::Snapshot {
                seq,
                tables: state.tables.values().cloned().collect(),
                next_generation: state.next_generation,
            }
        };
        Self::append(writer, &edit)?;
        writer.flush()?;
        writer.get_ref().sync_data()?;
        debug!(seq, "Wrote metadata snapshot");
        Ok(())
    }

    /// Appends a snapshot of the current state now.
    pub fn snapshot(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        self.write_snapshot(&mut writer)
    }

    /// Persists the header (sequence and generation counters).
    pub fn sync(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.flush()?;

        let header_bytes = self.header.read().encode()?;
        let mut file = self.file.try_clone()?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header_bytes)?;
        file.sync_all()?;
        Ok(())
    }

    /// Reserves the next checkpoint generation.
    pub fn next_generation(&self) -> Result<u64> {
        let generation = {
            let mut header = self.header.write();
            let generation = header.next_generation;
            header.next_generation += 1;
            generation
        };
        self.state.write().next_generation = generation + 1;
        self.sync()?;
        Ok(generation)
    }

    pub fn table(&self, name: &str) -> Option<TableMeta> {
        self.state.read().tables.get(name).cloned()
    }

    pub fn tables(&self) -> Vec<TableMeta> {
        self.state.read().tables.values().cloned().collect()
    }

    pub fn create_table(&self, name: &str, tiering: Option<TieringMeta>) -> Result<TableMeta> {
        let table = TableMeta::new(name, tiering);
        let created = table.clone();
        self.commit(|seq, state| {
            if state.tables.contains_key(name) {
                return Err(Error::InvalidOperation(format!(
                    "table {} already exists",
                    name
                )));
            }
            Ok(MetaEdit::CreateTable { seq, table })
        })?;
        Ok(created)
    }

    /// Records that `object_id` is now the table's current object.
    pub fn switch_object(&self, table: &str, object_id: u32) -> Result<()> {
        self.commit(|seq, state| {
            let meta = state
                .tables
                .get(table)
                .ok_or_else(|| Error::NotFound(format!("table {}", table)))?;
            if object_id <= meta.current_object {
                return Err(Error::InvalidState(format!(
                    "table {} cannot switch from object {} to {}",
                    table, meta.current_object, object_id
                )));
            }
            Ok(MetaEdit::SwitchObject {
                seq,
                table: table.to_string(),
                object_id,
            })
        })
    }

    pub fn set_object_state(
        &self,
        table: &str,
        object_id: u32,
        state: ObjectState,
        remote: bool,
    ) -> Result<()> {
        self.commit(|seq, current| {
            let known = current
                .tables
                .get(table)
                .and_then(|t| t.object(object_id))
                .is_some();
            if !known {
                return Err(Error::NotFound(format!(
                    "object {} of table {}",
                    object_id, table
                )));
            }
            Ok(MetaEdit::ObjectState {
                seq,
                table: table.to_string(),
                object_id,
                state,
                remote,
            })
        })
    }

    pub fn record_checkpoint(&self, table: &str, checkpoint: CheckpointMeta) -> Result<()> {
        self.commit(|seq, state| {
            if !state.tables.contains_key(table) {
                return Err(Error::NotFound(format!("table {}", table)));
            }
            Ok(MetaEdit::Checkpoint {
                seq,
                table: table.to_string(),
                checkpoint,
            })
        })
    }

    pub fn drop_table(&self, table: &str) -> Result<TableMeta> {
        let dropped = self
            .table(table)
            .ok_or_else(|| Error::NotFound(format!("table {}", table)))?;
        self.commit(|seq, state| {
            if !state.tables.contains_key(table) {
                return Err(Error::NotFound(format!("table {}", table)));
            }
            Ok(MetaEdit::DropTable {
                seq,
                table: table.to_string(),
            })
        })?;
        Ok(dropped)
    }

    /// Renames a table. Tiered tables cannot be renamed: their remote objects
    /// are named after the table.
    pub fn rename_table(&self, from: &str, to: &str) -> Result<()> {
        self.commit(|seq, state| {
            let meta = state
                .tables
                .get(from)
                .ok_or_else(|| Error::NotFound(format!("table {}", from)))?;
            if meta.is_tiered() {
                return Err(Error::InvalidOperation(format!(
                    "cannot rename tiered table {}",
                    from
                )));
            }
            if state.tables.contains_key(to) {
                return Err(Error::InvalidOperation(format!(
                    "table {} already exists",
                    to
                )));
            }
            Ok(MetaEdit::RenameTable {
                seq,
                from: from.to_string(),
                to: to.to_string(),
            })
        })
    }
}

impl Drop for MetadataStore {
    fn drop(&mut self) {
        if let Err(e) = self.sync() {
            tracing::warn!(error = %e, "Failed to sync metadata header on close");
        }
    }
}

/// Reads one framed edit; `None` at a clean end or a torn tail.
fn read_edit<R: Read>(reader: &mut R) -> Result<Option<(MetaEdit, u64)>> {
    let edit_len = match reader.read_u32::<BigEndian>() {
        Ok(len) => len as usize,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut edit_bytes = vec![0u8; edit_len];
    match reader.read_exact(&mut edit_bytes) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let stored_checksum = match reader.read_u32::<BigEndian>() {
        Ok(checksum) => checksum,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let computed_checksum = BLOCK_CRC.checksum(&edit_bytes);
    if computed_checksum != stored_checksum {
        return Err(Error::InvalidData(
            "Metadata edit checksum mismatch".to_string(),
        ));
    }

    let edit = MetaEdit::decode(&edit_bytes)?;
    Ok(Some((edit, 8 + edit_len as u64)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockAddr;
    use tempfile::TempDir;

    fn tiering() -> TieringMeta {
        TieringMeta {
            bucket: "cold".to_string(),
            bucket_prefix: "pfx/".to_string(),
            storage_source: "dir_store".to_string(),
        }
    }

    fn checkpoint(generation: u64) -> CheckpointMeta {
        CheckpointMeta {
            root: BlockAddr {
                object_id: 2,
                offset: 0,
                size: 10,
                checksum: 3,
            },
            generation,
        }
    }

    #[test]
    fn test_new_store_is_empty() -> Result<()> {
        let dir = TempDir::new()?;
        let store = MetadataStore::open_home(dir.path())?;
        assert!(store.tables().is_empty());
        assert!(store.edits()?.is_empty());
        assert_eq!(store.next_generation()?, 1);
        assert_eq!(store.next_generation()?, 2);
        Ok(())
    }

    #[test]
    fn test_object_lifecycle_survives_reopen() -> Result<()> {
        let dir = TempDir::new()?;
        {
            let store = MetadataStore::open_home(dir.path())?;
            store.create_table("t", Some(tiering()))?;
            store.switch_object("t", 2)?;
            store.set_object_state("t", 1, ObjectState::Migrating, false)?;
            store.set_object_state("t", 1, ObjectState::RemoteAvailable, true)?;
            store.record_checkpoint("t", checkpoint(4))?;
        }

        let store = MetadataStore::open_home(dir.path())?;
        let table = store.table("t").ok_or_else(|| Error::NotFound("t".into()))?;
        assert_eq!(table.current_object, 2);
        assert_eq!(
            table.objects,
            vec![ObjectMeta {
                object_id: 1,
                state: ObjectState::RemoteAvailable,
                remote: true,
            }]
        );
        assert_eq!(table.checkpoint, Some(checkpoint(4)));
        assert!(store.next_generation()? >= 5);
        Ok(())
    }

    #[test]
    fn test_validation_happens_before_append() -> Result<()> {
        let dir = TempDir::new()?;
        let store = MetadataStore::open_home(dir.path())?;
        store.create_table("t", None)?;

        assert!(store.create_table("t", None).is_err());
        assert!(store.switch_object("t", 1).is_err());
        assert!(store.set_object_state("t", 7, ObjectState::Local, false).is_err());
        assert!(store.record_checkpoint("missing", checkpoint(1)).is_err());
        assert_eq!(store.edits()?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_rename_rejects_tiered_tables() -> Result<()> {
        let dir = TempDir::new()?;
        let store = MetadataStore::open_home(dir.path())?;
        store.create_table("cold", Some(tiering()))?;
        store.create_table("hot", None)?;

        assert!(matches!(
            store.rename_table("cold", "colder"),
            Err(Error::InvalidOperation(_))
        ));
        assert!(matches!(
            store.rename_table("hot", "cold"),
            Err(Error::InvalidOperation(_))
        ));

        store.rename_table("hot", "warm")?;
        assert!(store.table("hot").is_none());
        assert_eq!(store.table("warm").map(|t| t.name), Some("warm".to_string()));
        Ok(())
    }

    #[test]
    fn test_drop_table() -> Result<()> {
        let dir = TempDir::new()?;
        let store = MetadataStore::open_home(dir.path())?;
        store.create_table("t", None)?;
        let dropped = store.drop_table("t")?;
        assert_eq!(dropped.name, "t");
        assert!(store.table("t").is_none());
        assert!(store.drop_table("t").is_err());
        Ok(())
    }

    #[test]
    fn test_snapshot_replay() -> Result<()> {
        let dir = TempDir::new()?;
        {
            let store = MetadataStore::open_home(dir.path())?;
            store.create_table("a", None)?;
            store.create_table("b", None)?;
            store.snapshot()?;
            store.drop_table("a")?;
        }
        let store = MetadataStore::open_home(dir.path())?;
        let names: Vec<String> = store.tables().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["b".to_string()]);

        let edits = store.edits()?;
        assert!(matches!(edits[2], MetaEdit::Snapshot { .. }));
        Ok(())
    }

    #[test]
    fn test_torn_tail_is_ignored() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join(METADATA_FILE);
        {
            let store = MetadataStore::open(&path)?;
            store.create_table("t", None)?;
        }
        {
            let mut file = OpenOptions::new().append(true).open(&path)?;
            file.write_all(&[0, 0, 0, 50, 1, 2])?;
        }

        let store = MetadataStore::open(&path)?;
        assert!(store.table("t").is_some());
        store.create_table("u", None)?;
        drop(store);

        let store = MetadataStore::open(&path)?;
        assert_eq!(store.tables().len(), 2);
        Ok(())
    }

    #[test]
    fn test_corrupted_edit_fails_open() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join(METADATA_FILE);
        {
            let store = MetadataStore::open(&path)?;
            store.create_table("t", None)?;
        }
        {
            let mut file = OpenOptions::new().write(true).open(&path)?;
            file.seek(SeekFrom::Start(HEADER_SIZE as u64 + 6))?;
            file.write_all(&[0xFF])?;
        }
        assert!(matches!(
            MetadataStore::open(&path),
            Err(Error::InvalidData(_))
        ));
        Ok(())
    }
}
