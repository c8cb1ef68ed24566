#![forbid(unsafe_code)]

//! Paged B-trees with stable roots, overflow payloads and cursors.
//!
//! Tree code never talks to the pager directly. Reads go through
//! [`PageSource`] and writes through [`PageStore`], so the same code builds
//! main-tree pages in the log, fast-insert pages inside a block, and merge
//! output written straight into the database file.

mod balance;
pub mod cell;
mod cursor;
pub mod node;
pub mod overflow;
mod stats;
mod tree;

use std::collections::HashMap;
use std::sync::Arc;

use crate::primitives::io::FileIo;
use crate::primitives::pager::{PageRef, Pager};
use crate::types::{PageNo, Result};

pub use cell::{max_key_len, Cell, OverflowPages};
pub use cursor::{SeekResult, TreeCursor, TreeSeek};
pub use node::Node;
pub use stats::{BTreeStats, BTreeStatsSnapshot};
pub use tree::Tree;

/// Read access to pages.
pub trait PageSource {
    /// Page size in bytes.
    fn page_size(&self) -> usize;
    /// Reads one page.
    fn read_page(&mut self, pgno: PageNo) -> Result<PageRef>;
}

/// Write access to pages and an allocator for new ones.
pub trait PageStore: PageSource {
    /// Allocates a page. Allocators with a fixed budget fail with
    /// [`crate::types::BtError::Full`].
    fn alloc_page(&mut self) -> Result<PageNo>;
    /// Releases a page the tree no longer uses.
    fn free_page(&mut self, pgno: PageNo) -> Result<()>;
    /// Replaces the image of `pgno`; shorter images are zero-padded.
    fn write_page(&mut self, pgno: PageNo, image: &[u8]) -> Result<()>;
}

impl PageSource for Pager {
    fn page_size(&self) -> usize {
        Pager::page_size(self)
    }

    fn read_page(&mut self, pgno: PageNo) -> Result<PageRef> {
        self.page(pgno)
    }
}

impl PageStore for Pager {
    fn alloc_page(&mut self) -> Result<PageNo> {
        Pager::alloc_page(self)
    }

    fn free_page(&mut self, pgno: PageNo) -> Result<()> {
        Pager::free_page(self, pgno)
    }

    fn write_page(&mut self, pgno: PageNo, image: &[u8]) -> Result<()> {
        let page = self.page_mut(pgno)?;
        page[..image.len()].copy_from_slice(image);
        page[image.len()..].fill(0);
        Ok(())
    }
}

/// Reads pages straight from the database file, bypassing the log.
pub struct FileSource {
    db: Arc<dyn FileIo>,
    page_size: usize,
    cache: HashMap<PageNo, PageRef>,
}

impl FileSource {
    const CACHE_LIMIT: usize = 256;

    /// Reader over `db`.
    pub fn new(db: Arc<dyn FileIo>, page_size: usize) -> Self {
        Self {
            db,
            page_size,
            cache: HashMap::new(),
        }
    }

    /// The underlying file.
    pub fn file(&self) -> &Arc<dyn FileIo> {
        &self.db
    }

    /// Forgets a cached image after the page was rewritten.
    pub fn forget(&mut self, pgno: PageNo) {
        self.cache.remove(&pgno);
    }
}

impl PageSource for FileSource {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn read_page(&mut self, pgno: PageNo) -> Result<PageRef> {
        if let Some(page) = self.cache.get(&pgno) {
            return Ok(page.clone());
        }
        let mut buf = vec![0u8; self.page_size];
        self.db.read_zeroed(pgno.offset(self.page_size), &mut buf)?;
        let page = PageRef::detached(pgno, buf);
        if self.cache.len() >= Self::CACHE_LIMIT {
            self.cache.clear();
        }
        self.cache.insert(pgno, page.clone());
        Ok(page)
    }
}
