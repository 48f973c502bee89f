//! File handle abstraction shared by every object backend.
//!
//! A block manager only ever talks to a [`FileHandle`]; whether the bytes live
//! in a local file or in memory is decided by the [`FileSystem`] the handle
//! cache was built with.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{Error, Result};

/// Access pattern hints passed to [`FileHandle::advise`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advice {
    Normal,
    Sequential,
    Random,
    DontNeed,
}

pub trait FileHandle: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Fills `buf` from `offset`; a short read is an error.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()>;

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<()>;

    fn size(&self) -> Result<u64>;

    fn sync(&self) -> Result<()>;

    fn truncate(&self, len: u64) -> Result<()>;

    /// Extends the file to at least `len` bytes.
    fn allocate(&self, len: u64) -> Result<()>;

    fn advise(&self, advice: Advice) -> Result<()>;

    /// Takes an exclusive, non-blocking lock on the file.
    fn lock(&self) -> Result<()>;
}

pub trait FileSystem: Send + Sync + fmt::Debug {
    fn open(&self, name: &str, create: bool) -> Result<Arc<dyn FileHandle>>;

    fn exists(&self, name: &str) -> bool;

    fn remove(&self, name: &str) -> Result<()>;

    fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// Names starting with `prefix`, sorted.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Objects stored as plain files in one directory.
#[derive(Debug, Clone)]
pub struct LocalFs {
    root: PathBuf,
}

impl LocalFs {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

impl FileSystem for LocalFs {
    fn open(&self, name: &str, create: bool) -> Result<Arc<dyn FileHandle>> {
        let path = self.path(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .truncate(false)
            .open(&path)
            .map_err(|e| {
                if e.kind() == io::ErrorKind::NotFound {
                    Error::NotFound(format!("object file {}", path.display()))
                } else {
                    Error::Io(e)
                }
            })?;
        Ok(Arc::new(LocalFile {
            name: name.to_string(),
            file,
        }))
    }

    fn exists(&self, name: &str) -> bool {
        self.path(name).exists()
    }

    fn remove(&self, name: &str) -> Result<()> {
        match fs::remove_file(self.path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        fs::rename(self.path(from), self.path(to))?;
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if name.starts_with(prefix) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

#[derive(Debug)]
pub struct LocalFile {
    name: String,
    file: File,
}

impl FileHandle for LocalFile {
    fn name(&self) -> &str {
        &self.name
    }

    #[cfg(unix)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    #[cfg(windows)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        use std::os::windows::fs::FileExt;
        let mut done = 0;
        while done < buf.len() {
            let n = self.file.seek_read(&mut buf[done..], offset + done as u64)?;
            if n == 0 {
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
            }
            done += n;
        }
        Ok(())
    }

    #[cfg(unix)]
    fn write_at(&self, buf: &[u8], offset: u64) -> Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    #[cfg(windows)]
    fn write_at(&self, buf: &[u8], offset: u64) -> Result<()> {
        use std::os::windows::fs::FileExt;
        let mut done = 0;
        while done < buf.len() {
            done += self.file.seek_write(&buf[done..], offset + done as u64)?;
        }
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        Ok(())
    }

    fn allocate(&self, len: u64) -> Result<()> {
        if self.size()? < len {
            self.file.set_len(len)?;
        }
        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn advise(&self, advice: Advice) -> Result<()> {
        use std::os::unix::io::AsRawFd;

        let flag = match advice {
            Advice::Normal => libc::POSIX_FADV_NORMAL,
            Advice::Sequential => libc::POSIX_FADV_SEQUENTIAL,
            Advice::Random => libc::POSIX_FADV_RANDOM,
            Advice::DontNeed => libc::POSIX_FADV_DONTNEED,
        };
        // SAFETY: the descriptor is owned by `self.file` and open for the
        // whole call; fadvise only hints the page cache.
        let result = unsafe { libc::posix_fadvise(self.file.as_raw_fd(), 0, 0, flag) };
        if result != 0 {
            return Err(io::Error::from_raw_os_error(result).into());
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn advise(&self, _advice: Advice) -> Result<()> {
        Ok(())
    }

    fn lock(&self) -> Result<()> {
        crate::flock::try_lock_exclusive(&self.file).map_err(Error::Lock)
    }
}

/// In-memory file system; contents vanish with the value.
#[derive(Debug, Default)]
pub struct MemFs {
    files: RwLock<BTreeMap<String, Arc<MemFile>>>,
}

impl MemFs {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FileSystem for MemFs {
    fn open(&self, name: &str, create: bool) -> Result<Arc<dyn FileHandle>> {
        if let Some(file) = self.files.read().get(name) {
            return Ok(file.clone());
        }
        if !create {
            return Err(Error::NotFound(format!("object file {}", name)));
        }
        let mut files = self.files.write();
        let file = files
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemFile::new(name)))
            .clone();
        Ok(file)
    }

    fn exists(&self, name: &str) -> bool {
        self.files.read().contains_key(name)
    }

    fn remove(&self, name: &str) -> Result<()> {
        self.files.write().remove(name);
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        let mut files = self.files.write();
        let file = files
            .remove(from)
            .ok_or_else(|| Error::NotFound(format!("object file {}", from)))?;
        let renamed = Arc::new(MemFile {
            name: to.to_string(),
            data: RwLock::new(file.data.read().clone()),
            locked: RwLock::new(false),
        });
        files.insert(to.to_string(), renamed);
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .files
            .read()
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[derive(Debug)]
pub struct MemFile {
    name: String,
    data: RwLock<Vec<u8>>,
    locked: RwLock<bool>,
}

impl MemFile {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            data: RwLock::new(Vec::new()),
            locked: RwLock::new(false),
        }
    }
}

impl FileHandle for MemFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let data = self.data.read();
        let end = offset
            .checked_add(buf.len() as u64)
            .filter(|&end| end <= data.len() as u64)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("read past end of {}", self.name),
                )
            })?;
        buf.copy_from_slice(&data[offset as usize..end as usize]);
        Ok(())
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<()> {
        let mut data = self.data.write();
        let (start, end) = offset
            .checked_add(buf.len() as u64)
            .and_then(|end| Some((usize::try_from(offset).ok()?, usize::try_from(end).ok()?)))
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("write at {} beyond addressable size of {}", offset, self.name),
                )
            })?;
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.data.write().resize(len as usize, 0);
        Ok(())
    }

    fn allocate(&self, len: u64) -> Result<()> {
        let mut data = self.data.write();
        if (data.len() as u64) < len {
            data.resize(len as usize, 0);
        }
        Ok(())
    }

    fn advise(&self, _advice: Advice) -> Result<()> {
        Ok(())
    }

    fn lock(&self) -> Result<()> {
        let mut locked = self.locked.write();
        if *locked {
            return Err(Error::Lock(io::Error::new(
                io::ErrorKind::WouldBlock,
                format!("{} is already locked", self.name),
            )));
        }
        *locked = true;
        Ok(())
    }
}
