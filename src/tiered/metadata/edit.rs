use super::meta::{read_string, write_string, CheckpointMeta, ObjectState, TableMeta};
use crate::error::{Error, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

const CREATE_TABLE: u8 = 0x01;
const SWITCH_OBJECT: u8 = 0x02;
const OBJECT_STATE: u8 = 0x03;
const CHECKPOINT: u8 = 0x04;
const DROP_TABLE: u8 = 0x05;
const RENAME_TABLE: u8 = 0x06;
const SNAPSHOT: u8 = 0x07;

#[derive(Debug, Clone, PartialEq)]
pub enum MetaEdit {
    CreateTable {
        seq: u64,
        table: TableMeta,
    },

    /// `object_id` became the table's current object.
    SwitchObject {
        seq: u64,
        table: String,
        object_id: u32,
    },

    ObjectState {
        seq: u64,
        table: String,
        object_id: u32,
        state: ObjectState,
        remote: bool,
    },

    Checkpoint {
        seq: u64,
        table: String,
        checkpoint: CheckpointMeta,
    },

    DropTable {
        seq: u64,
        table: String,
    },

    RenameTable {
        seq: u64,
        from: String,
        to: String,
    },

    Snapshot {
        seq: u64,
        tables: Vec<TableMeta>,
        next_generation: u64,
    },
}

impl MetaEdit {
    pub fn seq(&self) -> u64 {
        match self {
            MetaEdit::CreateTable { seq, .. }
            | MetaEdit::SwitchObject { seq, .. }
            | MetaEdit::ObjectState { seq, .. }
            | MetaEdit::Checkpoint { seq, .. }
            | MetaEdit::DropTable { seq, .. }
            | MetaEdit::RenameTable { seq, .. }
            | MetaEdit::Snapshot { seq, .. } => *seq,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();

        match self {
            MetaEdit::CreateTable { seq, table } => {
                buf.write_u8(CREATE_TABLE)?;
                buf.write_u64::<BigEndian>(*seq)?;
                table.encode_into(&mut buf)?;
            }

            MetaEdit::SwitchObject {
                seq,
                table,
                object_id,
            } => {
                buf.write_u8(SWITCH_OBJECT)?;
                buf.write_u64::<BigEndian>(*seq)?;
                write_string(&mut buf, table)?;
                buf.write_u32::<BigEndian>(*object_id)?;
            }

            MetaEdit::ObjectState {
                seq,
                table,
                object_id,
                state,
                remote,
            } => {
                buf.write_u8(OBJECT_STATE)?;
                buf.write_u64::<BigEndian>(*seq)?;
                write_string(&mut buf, table)?;
                buf.write_u32::<BigEndian>(*object_id)?;
                buf.write_u8(state.to_u8())?;
                buf.write_u8(*remote as u8)?;
            }

            MetaEdit::Checkpoint {
                seq,
                table,
                checkpoint,
            } => {
                buf.write_u8(CHECKPOINT)?;
                buf.write_u64::<BigEndian>(*seq)?;
                write_string(&mut buf, table)?;
                checkpoint.encode_into(&mut buf)?;
            }

            MetaEdit::DropTable { seq, table } => {
                buf.write_u8(DROP_TABLE)?;
                buf.write_u64::<BigEndian>(*seq)?;
                write_string(&mut buf, table)?;
            }

            MetaEdit::RenameTable { seq, from, to } => {
                buf.write_u8(RENAME_TABLE)?;
                buf.write_u64::<BigEndian>(*seq)?;
                write_string(&mut buf, from)?;
                write_string(&mut buf, to)?;
            }

            MetaEdit::Snapshot {
                seq,
                tables,
                next_generation,
            } => {
                buf.write_u8(SNAPSHOT)?;
                buf.write_u64::<BigEndian>(*seq)?;
                buf.write_u64::<BigEndian>(*next_generation)?;

                buf.write_u32::<BigEndian>(tables.len() as u32)?;
                for table in tables {
                    table.encode_into(&mut buf)?;
                }
            }
        }

        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(buf);
        let edit_type = cursor.read_u8()?;

        match edit_type {
            CREATE_TABLE => {
                let seq = cursor.read_u64::<BigEndian>()?;
                let table = TableMeta::decode_from(&mut cursor)?;
                Ok(MetaEdit::CreateTable { seq, table })
            }

            SWITCH_OBJECT => {
                let seq = cursor.read_u64::<BigEndian>()?;
                let table = read_string(&mut cursor)?;
                let object_id = cursor.read_u32::<BigEndian>()?;
                Ok(MetaEdit::SwitchObject {
                    seq,
                    table,
                    object_id,
                })
            }

            OBJECT_STATE => {
                let seq = cursor.read_u64::<BigEndian>()?;
                let table = read_string(&mut cursor)?;
                let object_id = cursor.read_u32::<BigEndian>()?;
                let state = ObjectState::from_u8(cursor.read_u8()?)?;
                let remote = cursor.read_u8()? != 0;
                Ok(MetaEdit::ObjectState {
                    seq,
                    table,
                    object_id,
                    state,
                    remote,
                })
            }

            CHECKPOINT => {
                let seq = cursor.read_u64::<BigEndian>()?;
                let table = read_string(&mut cursor)?;
                let checkpoint = CheckpointMeta::decode_from(&mut cursor)?;
                Ok(MetaEdit::Checkpoint {
                    seq,
                    table,
                    checkpoint,
                })
            }

            DROP_TABLE => {
                let seq = cursor.read_u64::<BigEndian>()?;
                let table = read_string(&mut cursor)?;
                Ok(MetaEdit::DropTable { seq, table })
            }

            RENAME_TABLE => {
                let seq = cursor.read_u64::<BigEndian>()?;
                let from = read_string(&mut cursor)?;
                let to = read_string(&mut cursor)?;
                Ok(MetaEdit::RenameTable { seq, from, to })
            }

            SNAPSHOT => {
                let seq = cursor.read_u64::<BigEndian>()?;
                let next_generation = cursor.read_u64::<BigEndian>()?;

                let table_count = cursor.read_u32::<BigEndian>()? as usize;
                let mut tables = Vec::with_capacity(table_count);
                for _ in 0..table_count {
                    tables.push(TableMeta::decode_from(&mut cursor)?);
                }

                Ok(MetaEdit::Snapshot {
                    seq,
                    tables,
                    next_generation,
                })
            }

            _ => Err(Error::InvalidData(format!(
                "Invalid edit type: {}",
                edit_type
            ))),
        }
    }
}
