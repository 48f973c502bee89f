use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

use crate::error::{Error, Result};

/// Name of the lock file created in every database home.
pub const LOCK_FILE: &str = "tierdb.lock";

/// Exclusive advisory lock on a database home.
///
/// Held for the lifetime of a `Connection`; the OS drops the lock when the
/// file is closed, so a crashed process never leaves a stale lock behind.
pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    /// Creates the lock file if needed and takes an exclusive lock on it.
    /// The lock file contains the process ID for debugging purposes.
    pub fn lock<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        // No truncate before locking: the holder's pid must survive a failed attempt.
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        try_lock_exclusive(&file).map_err(Error::Lock)?;

        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;

        Ok(Self { _file: file, path })
    }

    /// Locks `tierdb.lock` inside `home`.
    pub fn lock_home<P: AsRef<Path>>(home: P) -> Result<Self> {
        Self::lock(home.as_ref().join(LOCK_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Non-blocking exclusive lock on an open file.
#[cfg(unix)]
pub(crate) fn try_lock_exclusive(file: &File) -> io::Result<()> {
    use libc::{flock, LOCK_EX, LOCK_NB};

    let fd = file.as_raw_fd();
    // SAFETY: `fd` belongs to `file`, which outlives the call.
    let result = unsafe { flock(fd, LOCK_EX | LOCK_NB) };
    if result != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(windows)]
pub(crate) fn try_lock_exclusive(file: &File) -> io::Result<()> {
    use std::os::windows::io::AsRawHandle;
    use winapi::um::fileapi::LockFileEx;
    use winapi::um::minwinbase::OVERLAPPED;
    use winapi::um::winnt::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY};

    let handle = file.as_raw_handle();
    // SAFETY: OVERLAPPED is plain data and all-zero is its documented
    // initial state; the handle belongs to `file` for the whole call.
    let mut overlapped: OVERLAPPED = unsafe { std::mem::zeroed() };
    let result = unsafe {
        LockFileEx(
            handle as *mut _,
            LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
            0,
            !0,
            !0,
            &mut overlapped,
        )
    };

    if result == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(any(unix, windows)))]
pub(crate) fn try_lock_exclusive(_file: &File) -> io::Result<()> {
    Ok(())
}
