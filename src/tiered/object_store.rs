//! Object store capability consumed by the tiered server.
//!
//! Provider failures are opaque: every backend maps its errors to
//! [`Error::ObjectStore`] (or `Io`) and the core never interprets them.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::RwLock;
use tracing::debug;

use crate::block::file::FileHandle;
use crate::error::{Error, Result};

const COPY_CHUNK: usize = 64 * 1024;

pub trait ObjectStore: Send + Sync {
    /// Copies the whole of a local object into `bucket` under `name`.
    fn put_object(&self, source: &dyn FileHandle, bucket: &str, name: &str) -> Result<()>;

    fn get_object(&self, bucket: &str, name: &str) -> Result<Box<dyn Read + Send>>;

    /// Object names in `bucket` starting with `prefix`, sorted.
    fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>>;

    fn delete_object(&self, bucket: &str, name: &str) -> Result<()>;
}

/// Streams a file handle's contents into a writer.
fn copy_out(source: &dyn FileHandle, out: &mut dyn Write) -> Result<u64> {
    let size = source.size()?;
    let mut buf = vec![0u8; COPY_CHUNK];
    let mut offset = 0u64;
    while offset < size {
        let n = COPY_CHUNK.min((size - offset) as usize);
        source.read_at(&mut buf[..n], offset)?;
        out.write_all(&buf[..n])?;
        offset += n as u64;
    }
    Ok(size)
}

/// A bucket is a directory under `root`; objects are files in it. Names may
/// contain `/`, which become subdirectories.
#[derive(Debug, Clone)]
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn object_path(&self, bucket: &str, name: &str) -> Result<PathBuf> {
        if bucket.is_empty() || bucket.contains("..") || name.contains("..") {
            return Err(Error::ObjectStore(format!(
                "invalid object location {}/{}",
                bucket, name
            )));
        }
        Ok(self.root.join(bucket).join(name))
    }

    fn collect(dir: &Path, base: &Path, out: &mut Vec<String>) -> io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                Self::collect(&path, base, out)?;
            } else if let Ok(relative) = path.strip_prefix(base) {
                if let Some(name) = relative.to_str() {
                    out.push(name.replace('\\', "/"));
                }
            }
        }
        Ok(())
    }
}

impl ObjectStore for DirStore {
    fn put_object(&self, source: &dyn FileHandle, bucket: &str, name: &str) -> Result<()> {
        let path = self.object_path(bucket, name)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Write then rename, so readers never see a partial object.
        let staging = path.with_extension("partial");
        let mut file = File::create(&staging)?;
        let bytes = copy_out(source, &mut file)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&staging, &path)?;

        debug!(bucket, name, bytes, "Stored object");
        Ok(())
    }

    fn get_object(&self, bucket: &str, name: &str) -> Result<Box<dyn Read + Send>> {
        let path = self.object_path(bucket, name)?;
        match File::open(&path) {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("object {}/{}", bucket, name)))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let dir = self.root.join(bucket);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        Self::collect(&dir, &dir, &mut names)?;
        names.retain(|name| name.starts_with(prefix) && !name.ends_with(".partial"));
        names.sort();
        Ok(names)
    }

    fn delete_object(&self, bucket: &str, name: &str) -> Result<()> {
        let path = self.object_path(bucket, name)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory store with a failure switch, for exercising retry paths.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: RwLock<BTreeMap<(String, String), Vec<u8>>>,
    failing: AtomicBool,
    puts: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every operation fails.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of put attempts, including failed ones.
    pub fn put_attempts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn contains(&self, bucket: &str, name: &str) -> bool {
        self.objects
            .read()
            .contains_key(&(bucket.to_string(), name.to_string()))
    }

    fn check(&self, op: &str) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::ObjectStore(format!("{} failed: store unreachable", op)));
        }
        Ok(())
    }
}

impl ObjectStore for MemoryStore {
    fn put_object(&self, source: &dyn FileHandle, bucket: &str, name: &str) -> Result<()> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.check("put_object")?;
        let mut data = Vec::new();
        copy_out(source, &mut data)?;
        self.objects
            .write()
            .insert((bucket.to_string(), name.to_string()), data);
        Ok(())
    }

    fn get_object(&self, bucket: &str, name: &str) -> Result<Box<dyn Read + Send>> {
        self.check("get_object")?;
        let data = self
            .objects
            .read()
            .get(&(bucket.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("object {}/{}", bucket, name)))?;
        Ok(Box::new(Cursor::new(data)))
    }

    fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        self.check("list_objects")?;
        Ok(self
            .objects
            .read()
            .keys()
            .filter(|(b, name)| b == bucket && name.starts_with(prefix))
            .map(|(_, name)| name.clone())
            .collect())
    }

    fn delete_object(&self, bucket: &str, name: &str) -> Result<()> {
        self.check("delete_object")?;
        self.objects
            .write()
            .remove(&(bucket.to_string(), name.to_string()));
        Ok(())
    }
}
