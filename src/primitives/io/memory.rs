//! In-memory [`Vfs`] with crash simulation and fault injection.
//!
//! Every file keeps two images: the live bytes and the bytes as of the last
//! successful `sync_all`. [`MemVfs::crash`] throws away everything that was
//! never synced, which is what a power cut does to a real file.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{FileIo, Vfs};
use crate::types::Result;

#[derive(Debug)]
struct Faults {
    /// Writes left before failures begin; negative disables injection.
    writes_left: AtomicI64,
    fail_syncs: AtomicBool,
}

impl Faults {
    fn check_write(&self) -> Result<()> {
        let left = self.writes_left.load(Ordering::SeqCst);
        if left < 0 {
            return Ok(());
        }
        if left == 0 {
            return Err(io::Error::new(io::ErrorKind::Other, "injected write failure").into());
        }
        self.writes_left.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Images {
    live: Vec<u8>,
    synced: Vec<u8>,
}

struct MemFile {
    images: Mutex<Images>,
    faults: Arc<Faults>,
}

impl FileIo for MemFile {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        let images = self.images.lock();
        let start = off as usize;
        let end = start + dst.len();
        if end > images.live.len() {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "read past end of memory file").into());
        }
        dst.copy_from_slice(&images.live[start..end]);
        Ok(())
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        self.faults.check_write()?;
        let mut images = self.images.lock();
        let start = off as usize;
        let end = start + src.len();
        if images.live.len() < end {
            images.live.resize(end, 0);
        }
        images.live[start..end].copy_from_slice(src);
        Ok(())
    }

    fn sync_all(&self) -> Result<()> {
        if self.faults.fail_syncs.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected sync failure").into());
        }
        let mut images = self.images.lock();
        images.synced = images.live.clone();
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.images.lock().live.len() as u64)
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.faults.check_write()?;
        self.images.lock().live.resize(len as usize, 0);
        Ok(())
    }
}

/// Shared in-memory file system. Clones see the same files.
#[derive(Clone)]
pub struct MemVfs {
    files: Arc<Mutex<HashMap<PathBuf, Arc<MemFile>>>>,
    faults: Arc<Faults>,
}

impl Default for MemVfs {
    fn default() -> Self {
        Self {
            files: Arc::default(),
            faults: Arc::new(Faults {
                writes_left: AtomicI64::new(-1),
                fail_syncs: AtomicBool::new(false),
            }),
        }
    }
}

impl MemVfs {
    /// Creates an empty file system.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reverts every file to its last synced image.
    pub fn crash(&self) {
        for file in self.files.lock().values() {
            let mut images = file.images.lock();
            images.live = images.synced.clone();
        }
    }

    /// Lets `n` more writes succeed, then fails every write. `None` disables.
    pub fn fail_writes_after(&self, n: Option<u64>) {
        let v = n.map(|n| n as i64).unwrap_or(-1);
        self.faults.writes_left.store(v, Ordering::SeqCst);
    }

    /// Makes every `sync_all` fail while set.
    pub fn set_fail_syncs(&self, fail: bool) {
        self.faults.fail_syncs.store(fail, Ordering::SeqCst);
    }

    /// Copy of the live bytes of `path`, if it exists.
    pub fn snapshot(&self, path: &Path) -> Option<Vec<u8>> {
        self.files
            .lock()
            .get(path)
            .map(|f| f.images.lock().live.clone())
    }

    /// Overwrites the live bytes of `path`; used to corrupt files in tests.
    pub fn poke(&self, path: &Path, off: usize, bytes: &[u8]) {
        if let Some(file) = self.files.lock().get(path) {
            let mut images = file.images.lock();
            if images.live.len() < off + bytes.len() {
                images.live.resize(off + bytes.len(), 0);
            }
            images.live[off..off + bytes.len()].copy_from_slice(bytes);
            images.synced = images.live.clone();
        }
    }
}

impl Vfs for MemVfs {
    fn open(&self, path: &Path) -> Result<Arc<dyn FileIo>> {
        let mut files = self.files.lock();
        let file = files
            .entry(path.to_path_buf())
            .or_insert_with(|| {
                Arc::new(MemFile {
                    images: Mutex::new(Images::default()),
                    faults: Arc::clone(&self.faults),
                })
            })
            .clone();
        Ok(file)
    }

    fn exists(&self, path: &Path) -> Result<bool> {
        Ok(self.files.lock().contains_key(path))
    }

    fn delete(&self, path: &Path) -> Result<()> {
        self.files.lock().remove(path);
        Ok(())
    }

    fn canonical(&self, path: &Path) -> Result<PathBuf> {
        Ok(path.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crash_discards_unsynced_writes() -> Result<()> {
        let vfs = MemVfs::new();
        let file = vfs.open(Path::new("a"))?;
        file.write_at(0, b"durable")?;
        file.sync_all()?;
        file.write_at(0, b"volatile!")?;
        vfs.crash();
        let mut buf = [0u8; 7];
        file.read_at(0, &mut buf)?;
        assert_eq!(&buf, b"durable");
        assert_eq!(file.len()?, 7);
        Ok(())
    }

    #[test]
    fn injected_write_failures() -> Result<()> {
        let vfs = MemVfs::new();
        let file = vfs.open(Path::new("b"))?;
        vfs.fail_writes_after(Some(1));
        file.write_at(0, b"ok")?;
        assert!(file.write_at(2, b"boom").is_err());
        vfs.fail_writes_after(None);
        file.write_at(2, b"fine")?;
        Ok(())
    }
}
