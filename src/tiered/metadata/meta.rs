use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::block::{BlockAddr, FIRST_OBJECT_ID};
use crate::error::{Error, Result};

/// Migration state of one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectState {
    /// Only the local copy exists.
    Local,
    /// Queued for, or in the middle of, a copy to the object store.
    Migrating,
    /// The remote copy is confirmed.
    RemoteAvailable,
    /// The local copy may be reclaimed once unreferenced.
    LocalRemovable,
    /// Removed; `remote` on the object tells whether a remote copy survives.
    Removed,
}

impl ObjectState {
    pub(super) fn to_u8(self) -> u8 {
        match self {
            ObjectState::Local => 0,
            ObjectState::Migrating => 1,
            ObjectState::RemoteAvailable => 2,
            ObjectState::LocalRemovable => 3,
            ObjectState::Removed => 4,
        }
    }

    pub(super) fn from_u8(value: u8) -> Result<Self> {
        Ok(match value {
            0 => ObjectState::Local,
            1 => ObjectState::Migrating,
            2 => ObjectState::RemoteAvailable,
            3 => ObjectState::LocalRemovable,
            4 => ObjectState::Removed,
            other => {
                return Err(Error::InvalidData(format!(
                    "Invalid object state: {}",
                    other
                )))
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub object_id: u32,
    pub state: ObjectState,
    /// A remote copy exists.
    pub remote: bool,
}

impl ObjectMeta {
    pub fn local(object_id: u32) -> Self {
        Self {
            object_id,
            state: ObjectState::Local,
            remote: false,
        }
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.write_u32::<BigEndian>(self.object_id)?;
        buf.write_u8(self.state.to_u8())?;
        buf.write_u8(self.remote as u8)?;
        Ok(())
    }

    pub fn decode_from(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        let object_id = cursor.read_u32::<BigEndian>()?;
        let state = ObjectState::from_u8(cursor.read_u8()?)?;
        let remote = cursor.read_u8()? != 0;
        Ok(Self {
            object_id,
            state,
            remote,
        })
    }
}

/// Where a tiered table's objects are flushed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TieringMeta {
    pub bucket: String,
    pub bucket_prefix: String,
    pub storage_source: String,
}

impl TieringMeta {
    pub fn encode_into(&self, buf: &mut Vec<u8>) -> Result<()> {
        write_string(buf, &self.bucket)?;
        write_string(buf, &self.bucket_prefix)?;
        write_string(buf, &self.storage_source)
    }

    pub fn decode_from(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        Ok(Self {
            bucket: read_string(cursor)?,
            bucket_prefix: read_string(cursor)?,
            storage_source: read_string(cursor)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointMeta {
    pub root: BlockAddr,
    pub generation: u64,
}

impl CheckpointMeta {
    pub fn encode_into(&self, buf: &mut Vec<u8>) -> Result<()> {
        encode_addr(buf, &self.root)?;
        buf.write_u64::<BigEndian>(self.generation)?;
        Ok(())
    }

    pub fn decode_from(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        let root = decode_addr(cursor)?;
        let generation = cursor.read_u64::<BigEndian>()?;
        Ok(Self { root, generation })
    }
}

/// Everything the metadata store knows about one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMeta {
    pub name: String,
    pub current_object: u32,
    /// Superseded objects, oldest first.
    pub objects: Vec<ObjectMeta>,
    pub tiering: Option<TieringMeta>,
    pub checkpoint: Option<CheckpointMeta>,
}

impl TableMeta {
    pub fn new(name: impl Into<String>, tiering: Option<TieringMeta>) -> Self {
        Self {
            name: name.into(),
            current_object: FIRST_OBJECT_ID,
            objects: Vec::new(),
            tiering,
            checkpoint: None,
        }
    }

    pub fn is_tiered(&self) -> bool {
        self.tiering.is_some()
    }

    pub fn object(&self, object_id: u32) -> Option<&ObjectMeta> {
        self.objects.iter().find(|o| o.object_id == object_id)
    }

    pub fn object_mut(&mut self, object_id: u32) -> Option<&mut ObjectMeta> {
        self.objects.iter_mut().find(|o| o.object_id == object_id)
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) -> Result<()> {
        write_string(buf, &self.name)?;
        buf.write_u32::<BigEndian>(self.current_object)?;

        buf.write_u32::<BigEndian>(self.objects.len() as u32)?;
        for object in &self.objects {
            object.encode_into(buf)?;
        }

        match &self.tiering {
            Some(tiering) => {
                buf.write_u8(1)?;
                tiering.encode_into(buf)?;
            }
            None => buf.write_u8(0)?,
        }

        match &self.checkpoint {
            Some(checkpoint) => {
                buf.write_u8(1)?;
                checkpoint.encode_into(buf)?;
            }
            None => buf.write_u8(0)?,
        }
        Ok(())
    }

    pub fn decode_from(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        let name = read_string(cursor)?;
        let current_object = cursor.read_u32::<BigEndian>()?;

        let object_count = cursor.read_u32::<BigEndian>()? as usize;
        let mut objects = Vec::with_capacity(object_count);
        for _ in 0..object_count {
            objects.push(ObjectMeta::decode_from(cursor)?);
        }

        let tiering = match cursor.read_u8()? {
            0 => None,
            _ => Some(TieringMeta::decode_from(cursor)?),
        };
        let checkpoint = match cursor.read_u8()? {
            0 => None,
            _ => Some(CheckpointMeta::decode_from(cursor)?),
        };

        Ok(Self {
            name,
            current_object,
            objects,
            tiering,
            checkpoint,
        })
    }
}

pub(super) fn write_string(buf: &mut Vec<u8>, s: &str) -> Result<()> {
    buf.write_u32::<BigEndian>(s.len() as u32)?;
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

pub(super) fn read_string(cursor: &mut Cursor<&[u8]>) -> Result<String> {
    let len = cursor.read_u32::<BigEndian>()? as usize;
    let mut bytes = vec![0u8; len];
    cursor.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|e| Error::InvalidData(format!("Invalid name: {}", e)))
}

pub(super) fn encode_addr(buf: &mut Vec<u8>, addr: &BlockAddr) -> Result<()> {
    buf.write_u32::<BigEndian>(addr.object_id)?;
    buf.write_u64::<BigEndian>(addr.offset)?;
    buf.write_u32::<BigEndian>(addr.size)?;
    buf.write_u32::<BigEndian>(addr.checksum)?;
    Ok(())
}

pub(super) fn decode_addr(cursor: &mut Cursor<&[u8]>) -> Result<BlockAddr> {
    Ok(BlockAddr {
        object_id: cursor.read_u32::<BigEndian>()?,
        offset: cursor.read_u64::<BigEndian>()?,
        size: cursor.read_u32::<BigEndian>()?,
        checksum: cursor.read_u32::<BigEndian>()?,
    })
}
