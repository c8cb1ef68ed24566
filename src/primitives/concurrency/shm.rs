//! Shared-memory region backing the WAL index.
//!
//! The region is addressed as a flat byte space split into 48 KiB chunks. In
//! single-process mode chunks live on the heap inside the process registry; in
//! multi-process mode they are read and written through the `-shm` file so
//! every process sees the same bytes.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::primitives::io::FileIo;
use crate::types::Result;

/// Size of one shared-memory chunk.
pub const SHM_CHUNK: usize = 48 * 1024;

enum Backing {
    Heap(RwLock<Vec<Box<[u8]>>>),
    File(Arc<dyn FileIo>),
}

/// Chunked shared-memory region.
pub struct Shm {
    backing: Backing,
}

impl Shm {
    /// Heap-backed region visible to this process only.
    pub fn heap() -> Self {
        Self {
            backing: Backing::Heap(RwLock::new(Vec::new())),
        }
    }

    /// Region stored in `file`, visible to every process that opens it.
    pub fn file(file: Arc<dyn FileIo>) -> Self {
        Self {
            backing: Backing::File(file),
        }
    }

    /// Copies bytes at `off` into `dst`. Never-written bytes read as zero.
    pub fn read(&self, off: usize, dst: &mut [u8]) -> Result<()> {
        match &self.backing {
            Backing::Heap(chunks) => {
                let chunks = chunks.read();
                let mut done = 0;
                while done < dst.len() {
                    let pos = off + done;
                    let (idx, within) = (pos / SHM_CHUNK, pos % SHM_CHUNK);
                    let n = (SHM_CHUNK - within).min(dst.len() - done);
                    match chunks.get(idx) {
                        Some(chunk) => dst[done..done + n].copy_from_slice(&chunk[within..within + n]),
                        None => dst[done..done + n].fill(0),
                    }
                    done += n;
                }
                Ok(())
            }
            Backing::File(file) => file.read_zeroed(off as u64, dst),
        }
    }

    /// Writes `src` at `off`, mapping new chunks as needed.
    pub fn write(&self, off: usize, src: &[u8]) -> Result<()> {
        match &self.backing {
            Backing::Heap(chunks) => {
                let mut chunks = chunks.write();
                let last = (off + src.len()).div_ceil(SHM_CHUNK);
                while chunks.len() < last {
                    chunks.push(vec![0u8; SHM_CHUNK].into_boxed_slice());
                }
                let mut done = 0;
                while done < src.len() {
                    let pos = off + done;
                    let (idx, within) = (pos / SHM_CHUNK, pos % SHM_CHUNK);
                    let n = (SHM_CHUNK - within).min(src.len() - done);
                    chunks[idx][within..within + n].copy_from_slice(&src[done..done + n]);
                    done += n;
                }
                Ok(())
            }
            Backing::File(file) => file.write_at(off as u64, src),
        }
    }

    /// Reads a big-endian u32.
    pub fn read_u32(&self, off: usize) -> Result<u32> {
        let mut b = [0u8; 4];
        self.read(off, &mut b)?;
        Ok(u32::from_be_bytes(b))
    }

    /// Writes a big-endian u32.
    pub fn write_u32(&self, off: usize, v: u32) -> Result<()> {
        self.write(off, &v.to_be_bytes())
    }

    /// Zeroes `len` bytes at `off`.
    pub fn zero(&self, off: usize, len: usize) -> Result<()> {
        self.write(off, &vec![0u8; len])
    }

    /// Drops every chunk; the region reads as zeroes afterwards.
    pub fn reset(&self) -> Result<()> {
        match &self.backing {
            Backing::Heap(chunks) => {
                chunks.write().clear();
                Ok(())
            }
            Backing::File(file) => file.truncate(0),
        }
    }

    /// Number of chunks currently mapped.
    pub fn mapped_chunks(&self) -> Result<usize> {
        match &self.backing {
            Backing::Heap(chunks) => Ok(chunks.read().len()),
            Backing::File(file) => Ok((file.len()? as usize).div_ceil(SHM_CHUNK)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::io::{MemVfs, Vfs};
    use std::path::Path;

    #[test]
    fn heap_reads_cross_chunk_boundaries() -> Result<()> {
        let shm = Shm::heap();
        assert_eq!(shm.read_u32(100)?, 0);
        let off = SHM_CHUNK - 2;
        shm.write(off, &[1, 2, 3, 4])?;
        let mut buf = [0u8; 4];
        shm.read(off, &mut buf)?;
        assert_eq!(buf, [1, 2, 3, 4]);
        assert_eq!(shm.mapped_chunks()?, 2);
        shm.reset()?;
        assert_eq!(shm.mapped_chunks()?, 0);
        Ok(())
    }

    #[test]
    fn file_backed_region_is_shared() -> Result<()> {
        let vfs = MemVfs::new();
        let a = Shm::file(vfs.open(Path::new("x-shm"))?);
        let b = Shm::file(vfs.open(Path::new("x-shm"))?);
        a.write_u32(SHM_CHUNK + 8, 77)?;
        assert_eq!(b.read_u32(SHM_CHUNK + 8)?, 77);
        Ok(())
    }
}
