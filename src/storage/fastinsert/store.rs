//! Page stores with a fixed budget.

use std::sync::Arc;

use crate::primitives::io::FileIo;
use crate::primitives::pager::{PageRef, Pager};
use crate::storage::btree::{PageSource, PageStore};
use crate::types::{BtError, PageNo, Result};

use super::schedule::{extent_page, Extent};

/// Bump allocator over the current fast-insert block. Pages go through the
/// pager like any other write; freed pages stay in the block until the
/// whole level is released.
pub struct BlockStore<'a> {
    pager: &'a mut Pager,
}

impl<'a> BlockStore<'a> {
    /// Store over the block named in the database header.
    pub fn new(pager: &'a mut Pager) -> Self {
        Self { pager }
    }
}

impl PageSource for BlockStore<'_> {
    fn page_size(&self) -> usize {
        self.pager.page_size()
    }

    fn read_page(&mut self, pgno: PageNo) -> Result<PageRef> {
        self.pager.page(pgno)
    }
}

impl PageStore for BlockStore<'_> {
    fn alloc_page(&mut self) -> Result<PageNo> {
        let hdr = self.pager.header()?;
        if hdr.fi_block.is_none() {
            return Err(BtError::Misuse("no current fast-insert block"));
        }
        if hdr.fi_used >= hdr.block_pages() {
            return Err(BtError::Full);
        }
        let pgno = PageNo(hdr.fi_block.0 + hdr.fi_used);
        self.pager.header_mut()?.fi_used += 1;
        Ok(pgno)
    }

    fn free_page(&mut self, _pgno: PageNo) -> Result<()> {
        Ok(())
    }

    fn write_page(&mut self, pgno: PageNo, image: &[u8]) -> Result<()> {
        self.pager.write_page(pgno, image)
    }
}

/// Bump allocator over the extents of a merge, writing straight into the
/// database file. Nothing here passes through the log.
pub struct ExtentStore {
    db: Arc<dyn FileIo>,
    page_size: usize,
    block_pages: u32,
    extents: Vec<Extent>,
    used: u64,
}

impl ExtentStore {
    /// Store over `extents` with the first `used` pages already taken.
    pub fn new(db: Arc<dyn FileIo>, page_size: usize, block_pages: u32, extents: Vec<Extent>, used: u64) -> Self {
        Self {
            db,
            page_size,
            block_pages,
            extents,
            used,
        }
    }

    /// Pages taken so far.
    pub fn used(&self) -> u64 {
        self.used
    }

    /// Pages still available.
    pub fn remaining(&self) -> u64 {
        let capacity: u64 = self
            .extents
            .iter()
            .map(|e| u64::from(e.blocks) * u64::from(self.block_pages))
            .sum();
        capacity.saturating_sub(self.used)
    }
}

impl PageSource for ExtentStore {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn read_page(&mut self, pgno: PageNo) -> Result<PageRef> {
        let mut buf = vec![0u8; self.page_size];
        self.db.read_zeroed(pgno.offset(self.page_size), &mut buf)?;
        Ok(PageRef::detached(pgno, buf))
    }
}

impl PageStore for ExtentStore {
    fn alloc_page(&mut self) -> Result<PageNo> {
        let pgno = extent_page(&self.extents, self.used, self.block_pages).ok_or(BtError::Full)?;
        self.used += 1;
        Ok(pgno)
    }

    fn free_page(&mut self, _pgno: PageNo) -> Result<()> {
        Ok(())
    }

    fn write_page(&mut self, pgno: PageNo, image: &[u8]) -> Result<()> {
        let mut page = vec![0u8; self.page_size];
        page[..image.len()].copy_from_slice(image);
        self.db.write_at(pgno.offset(self.page_size), &page)?;
        Ok(())
    }
}
