//! Free-page and free-block lists.
//!
//! Both lists are chains of trunk pages laid out as
//! `[next: u32][count: u32][entry: u32; count]`. A freed page is appended to
//! the head trunk, or becomes the new head trunk when that one is full. Free
//! blocks are recorded by first page; their trunk pages come from the page
//! allocator and go back to it when emptied.

use std::fmt;

use tracing::trace;

use super::Pager;
use crate::primitives::bytes::ord;
use crate::types::{BtError, PageNo, Result};

const TRUNK_NEXT: usize = 0;
const TRUNK_COUNT: usize = 4;
const TRUNK_ENTRIES: usize = 8;

/// Every page and block reachable from the free lists.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FreeListDump {
    /// Free pages, trunks included.
    pub pages: Vec<PageNo>,
    /// First pages of free blocks.
    pub blocks: Vec<PageNo>,
    /// Trunk pages of the free-block list.
    pub block_trunks: Vec<PageNo>,
}

impl fmt::Display for FreeListDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "free_pages={} free_blocks={} block_trunks={}",
            self.pages.len(),
            self.blocks.len(),
            self.block_trunks.len()
        )
    }
}

fn trunk_next(page: &[u8]) -> PageNo {
    PageNo(ord::get_u32(page, TRUNK_NEXT))
}

fn trunk_count(page: &[u8]) -> u32 {
    ord::get_u32(page, TRUNK_COUNT)
}

fn entry_at(i: u32) -> usize {
    TRUNK_ENTRIES + 4 * i as usize
}

impl Pager {
    fn trunk_capacity(&self) -> u32 {
        ((self.page_size - TRUNK_ENTRIES) / 4) as u32
    }

    /// Pops the last entry of trunk `head`, or `None` when it is empty.
    fn pop_entry(&mut self, head: PageNo) -> Result<Option<PageNo>> {
        let trunk = self.page(head)?;
        let count = trunk_count(trunk.data());
        if count > self.trunk_capacity() {
            return Err(BtError::Corruption("free-list trunk count"));
        }
        if count == 0 {
            return Ok(None);
        }
        let entry = PageNo(ord::get_u32(trunk.data(), entry_at(count - 1)));
        drop(trunk);
        ord::put_u32(self.page_mut(head)?, TRUNK_COUNT, count - 1);
        Ok(Some(entry))
    }

    /// Appends `entry` to trunk `head`. Returns `false` when the trunk is full.
    fn push_entry(&mut self, head: PageNo, entry: PageNo) -> Result<bool> {
        let count = trunk_count(self.page(head)?.data());
        if count >= self.trunk_capacity() {
            return Ok(false);
        }
        let page = self.page_mut(head)?;
        ord::put_u32(page, entry_at(count), entry.0);
        ord::put_u32(page, TRUNK_COUNT, count + 1);
        Ok(true)
    }

    fn check_range(&self, pgno: PageNo) -> Result<()> {
        let n_page = self.header()?.n_page;
        if pgno.0 < 2 || pgno.0 > n_page {
            return Err(BtError::Corruption("free-list page out of range"));
        }
        Ok(())
    }

    /// Allocates a zeroed page, reusing a free one when possible.
    pub fn alloc_page(&mut self) -> Result<PageNo> {
        let head = self.header()?.free_page_head;
        let pgno = if head.is_none() {
            let hdr = self.header_mut()?;
            hdr.n_page = hdr
                .n_page
                .checked_add(1)
                .ok_or(BtError::Full)?;
            PageNo(hdr.n_page)
        } else {
            let reused = match self.pop_entry(head)? {
                Some(entry) => entry,
                None => {
                    let next = trunk_next(self.page(head)?.data());
                    self.header_mut()?.free_page_head = next;
                    head
                }
            };
            let hdr = self.header_mut()?;
            hdr.free_pages = hdr.free_pages.saturating_sub(1);
            self.check_range(reused)?;
            reused
        };
        self.page_mut(pgno)?.fill(0);
        trace!(pgno = pgno.0, "pager.alloc_page");
        Ok(pgno)
    }

    /// Returns `pgno` to the free-page list.
    pub fn free_page(&mut self, pgno: PageNo) -> Result<()> {
        self.check_range(pgno)?;
        let head = self.header()?.free_page_head;
        if head.is_none() || !self.push_entry(head, pgno)? {
            let page = self.page_mut(pgno)?;
            page.fill(0);
            ord::put_u32(page, TRUNK_NEXT, head.0);
            self.header_mut()?.free_page_head = pgno;
        }
        self.header_mut()?.free_pages += 1;
        trace!(pgno = pgno.0, "pager.free_page");
        Ok(())
    }

    /// Allocates a block-aligned run of pages and returns its first page.
    /// Pages skipped to reach alignment go onto the free-page list.
    pub fn alloc_block(&mut self) -> Result<PageNo> {
        loop {
            let head = self.header()?.free_block_head;
            if head.is_none() {
                break;
            }
            match self.pop_entry(head)? {
                Some(first) => {
                    let hdr = self.header_mut()?;
                    hdr.free_blocks = hdr.free_blocks.saturating_sub(1);
                    trace!(first = first.0, "pager.alloc_block.reused");
                    return Ok(first);
                }
                None => {
                    let next = trunk_next(self.page(head)?.data());
                    self.header_mut()?.free_block_head = next;
                    self.free_page(head)?;
                }
            }
        }
        let (n_page, bp) = {
            let hdr = self.header()?;
            (hdr.n_page, hdr.block_pages())
        };
        let first = n_page
            .div_ceil(bp)
            .checked_mul(bp)
            .and_then(|p| p.checked_add(1))
            .ok_or(BtError::Full)?;
        let end = first.checked_add(bp - 1).ok_or(BtError::Full)?;
        self.header_mut()?.n_page = end;
        for pad in n_page + 1..first {
            self.free_page(PageNo(pad))?;
        }
        trace!(first, padded = first - n_page - 1, "pager.alloc_block.extended");
        Ok(PageNo(first))
    }

    /// Returns the block starting at `first` to the free-block list.
    pub fn free_block(&mut self, first: PageNo) -> Result<()> {
        self.check_range(first)?;
        let head = self.header()?.free_block_head;
        if head.is_none() || !self.push_entry(head, first)? {
            let trunk = self.alloc_page()?;
            let page = self.page_mut(trunk)?;
            ord::put_u32(page, TRUNK_NEXT, head.0);
            ord::put_u32(page, TRUNK_COUNT, 1);
            ord::put_u32(page, entry_at(0), first.0);
            self.header_mut()?.free_block_head = trunk;
        }
        self.header_mut()?.free_blocks += 1;
        trace!(first = first.0, "pager.free_block");
        Ok(())
    }

    /// Walks both free lists. Fails on cycles or out-of-range entries.
    pub fn free_lists(&mut self) -> Result<FreeListDump> {
        let (page_head, block_head, n_page) = {
            let hdr = self.header()?;
            (hdr.free_page_head, hdr.free_block_head, hdr.n_page)
        };
        let mut dump = FreeListDump::default();
        let mut trunk = page_head;
        while !trunk.is_none() {
            self.check_range(trunk)?;
            if dump.pages.len() > n_page as usize {
                return Err(BtError::Corruption("free-page list cycle"));
            }
            dump.pages.push(trunk);
            trunk = self.read_trunk(trunk, &mut dump.pages)?;
        }
        let mut trunk = block_head;
        while !trunk.is_none() {
            self.check_range(trunk)?;
            if dump.block_trunks.len() > n_page as usize {
                return Err(BtError::Corruption("free-block list cycle"));
            }
            dump.block_trunks.push(trunk);
            trunk = self.read_trunk(trunk, &mut dump.blocks)?;
        }
        Ok(dump)
    }

    fn read_trunk(&mut self, trunk: PageNo, out: &mut Vec<PageNo>) -> Result<PageNo> {
        let page = self.page(trunk)?;
        let count = trunk_count(page.data());
        if count > self.trunk_capacity() {
            return Err(BtError::Corruption("free-list trunk count"));
        }
        for i in 0..count {
            out.push(PageNo(ord::get_u32(page.data(), entry_at(i))));
        }
        Ok(trunk_next(page.data()))
    }
}
