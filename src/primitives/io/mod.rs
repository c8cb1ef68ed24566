#![deny(unsafe_code)]
//! File-system abstraction consumed by the engine.
//!
//! [`Vfs`] opens, probes and deletes files; [`FileIo`] performs positioned
//! reads and writes, syncs, and advisory byte-range locking. Tests substitute
//! [`memory::MemVfs`] for crash simulation and fault injection.

pub mod memory;
mod oslock;

use std::{
    fs::{File, OpenOptions},
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::types::{BtError, Result};

pub use memory::MemVfs;

/// Lock strength for byte-range and slot locks.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum LockMode {
    /// Any number of holders.
    Shared,
    /// A single holder and no shared holders.
    Exclusive,
}

/// Positioned file I/O.
pub trait FileIo: Send + Sync + 'static {
    /// Reads exactly `dst.len()` bytes at `off`. Reading past EOF is an error.
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()>;
    /// Reads up to `dst.len()` bytes at `off`, zero-filling anything past EOF.
    fn read_zeroed(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        let len = self.len()?;
        dst.fill(0);
        if off >= len {
            return Ok(());
        }
        let avail = ((len - off) as usize).min(dst.len());
        self.read_at(off, &mut dst[..avail])
    }
    /// Writes all of `src` at `off`, extending the file as needed.
    fn write_at(&self, off: u64, src: &[u8]) -> Result<()>;
    /// Flushes data and metadata to stable storage.
    fn sync_all(&self) -> Result<()>;
    /// Current length in bytes.
    fn len(&self) -> Result<u64>;
    /// Returns true if the file is empty.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
    /// Truncates or extends the file.
    fn truncate(&self, len: u64) -> Result<()>;
    /// Takes an advisory lock on `[start, start + len)`.
    ///
    /// Returns `Ok(false)` when a non-blocking attempt conflicts with another
    /// process. Implementations without cross-process visibility succeed.
    fn lock(&self, _start: u64, _len: u64, _mode: LockMode, _blocking: bool) -> Result<bool> {
        Ok(true)
    }
    /// Releases an advisory lock taken by [`FileIo::lock`].
    fn unlock(&self, _start: u64, _len: u64) -> Result<()> {
        Ok(())
    }
}

/// File-system entry points.
pub trait Vfs: Send + Sync + 'static {
    /// Opens `path` read-write, creating it if missing.
    fn open(&self, path: &Path) -> Result<Arc<dyn FileIo>>;
    /// Whether `path` exists.
    fn exists(&self, path: &Path) -> Result<bool>;
    /// Removes `path`. Missing files are not an error.
    fn delete(&self, path: &Path) -> Result<()>;
    /// Canonical form used as the key of the process registry.
    fn canonical(&self, path: &Path) -> Result<PathBuf>;
}

/// Appends `suffix` to the file name of `path` (`db` becomes `db-wal`).
pub fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// OS-backed [`Vfs`].
#[derive(Default, Clone, Copy, Debug)]
pub struct StdVfs;

impl Vfs for StdVfs {
    fn open(&self, path: &Path) -> Result<Arc<dyn FileIo>> {
        Ok(Arc::new(StdFileIo::open(path)?))
    }

    fn exists(&self, path: &Path) -> Result<bool> {
        Ok(path.try_exists()?)
    }

    fn delete(&self, path: &Path) -> Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn canonical(&self, path: &Path) -> Result<PathBuf> {
        if path.try_exists()? {
            return Ok(std::fs::canonicalize(path)?);
        }
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => std::fs::canonicalize(p)?,
            _ => std::env::current_dir()?,
        };
        let name = path
            .file_name()
            .ok_or(BtError::Misuse("database path has no file name"))?;
        Ok(parent.join(name))
    }
}

/// Standard file I/O implementation using `Arc<File>`.
#[derive(Clone)]
pub struct StdFileIo {
    inner: Arc<File>,
}

impl StdFileIo {
    /// Wraps an open file handle.
    pub fn new(file: File) -> Self {
        Self {
            inner: Arc::new(file),
        }
    }

    /// Opens or creates a file for read-write access.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self::new(file))
    }

    fn file(&self) -> &File {
        &self.inner
    }
}

#[cfg(unix)]
mod positioned {
    use std::{fs::File, io, os::unix::fs::FileExt};

    pub fn read_some(file: &File, dst: &mut [u8], off: u64) -> io::Result<usize> {
        file.read_at(dst, off)
    }

    pub fn write_some(file: &File, src: &[u8], off: u64) -> io::Result<usize> {
        file.write_at(src, off)
    }
}

#[cfg(windows)]
mod positioned {
    use std::{fs::File, io, os::windows::fs::FileExt};

    pub fn read_some(file: &File, dst: &mut [u8], off: u64) -> io::Result<usize> {
        file.seek_read(dst, off)
    }

    pub fn write_some(file: &File, src: &[u8], off: u64) -> io::Result<usize> {
        file.seek_write(src, off)
    }
}

impl FileIo for StdFileIo {
    fn read_at(&self, mut off: u64, mut dst: &mut [u8]) -> Result<()> {
        while !dst.is_empty() {
            let read = match positioned::read_some(self.file(), dst, off) {
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            };
            if read == 0 {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "read_at reached EOF").into());
            }
            dst = &mut dst[read..];
            off += read as u64;
        }
        Ok(())
    }

    fn write_at(&self, mut off: u64, mut src: &[u8]) -> Result<()> {
        while !src.is_empty() {
            let written = match positioned::write_some(self.file(), src, off) {
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            };
            if written == 0 {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "write_at wrote zero bytes").into());
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }

    fn sync_all(&self) -> Result<()> {
        Ok(self.file().sync_all()?)
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file().metadata()?.len())
    }

    fn truncate(&self, len: u64) -> Result<()> {
        Ok(self.file().set_len(len)?)
    }

    fn lock(&self, start: u64, len: u64, mode: LockMode, blocking: bool) -> Result<bool> {
        Ok(oslock::lock_region(self.file(), start, len, mode, blocking)?)
    }

    fn unlock(&self, start: u64, len: u64) -> Result<()> {
        Ok(oslock::unlock_region(self.file(), start, len)?)
    }
}
