//! Database header stored at the start of page 1.

use std::fmt;
use std::ops::Range;

use crate::primitives::bytes::ord;
use crate::primitives::wal::DB_HEADER_BYTES;
use crate::types::checksum::{seal_record, verify_record};
use crate::types::{BtError, PageNo, Result};

const MAGIC: [u8; 4] = *b"BTDB";
const FORMAT_VERSION: u32 = 1;

const HDR_MAGIC: Range<usize> = 0..4;
const HDR_VERSION: usize = 4;
const HDR_PAGE_SIZE: usize = 8;
const HDR_BLOCK_SIZE: usize = 12;
const HDR_N_PAGE: usize = 16;
const HDR_MAIN_ROOT: usize = 20;
const HDR_META_ROOT: usize = 24;
const HDR_SCHEDULE: usize = 28;
const HDR_FI_BLOCK: usize = 32;
const HDR_FI_USED: usize = 36;
const HDR_COOKIE: usize = 40;
const HDR_FREE_PAGE_HEAD: usize = 44;
const HDR_FREE_BLOCK_HEAD: usize = 48;
const HDR_FREE_PAGES: usize = 52;
const HDR_FREE_BLOCKS: usize = 56;

/// Smallest supported page size.
pub const MIN_PAGE_SIZE: usize = 512;
/// Largest supported page size.
pub const MAX_PAGE_SIZE: usize = 65536;

/// Root pointers, sizes and allocator state of one database.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatabaseHeader {
    /// Bytes per page.
    pub page_size: u32,
    /// Bytes per block; a multiple of the page size.
    pub block_size: u32,
    /// Database size in pages.
    pub n_page: u32,
    /// Root of the main tree.
    pub main_root: PageNo,
    /// Root of the fast-insert meta-tree.
    pub meta_root: PageNo,
    /// Page holding the merge schedule.
    pub schedule: PageNo,
    /// First page of the block the current fast-insert level lives in.
    pub fi_block: PageNo,
    /// Pages of `fi_block` handed out so far.
    pub fi_used: u32,
    /// User cookie.
    pub cookie: u32,
    /// First trunk of the free-page list.
    pub free_page_head: PageNo,
    /// First trunk of the free-block list.
    pub free_block_head: PageNo,
    /// Pages on the free-page list, trunks included.
    pub free_pages: u32,
    /// Blocks on the free-block list.
    pub free_blocks: u32,
}

impl DatabaseHeader {
    /// Header of an empty database with the standard initial layout: page 1
    /// header, page 2 main root, page 3 meta root, page 4 merge schedule.
    pub fn initial(page_size: u32, block_size: u32) -> DatabaseHeader {
        DatabaseHeader {
            page_size,
            block_size,
            n_page: 4,
            main_root: PageNo(2),
            meta_root: PageNo(3),
            schedule: PageNo(4),
            fi_block: PageNo::NONE,
            fi_used: 0,
            cookie: 0,
            free_page_head: PageNo::NONE,
            free_block_head: PageNo::NONE,
            free_pages: 0,
            free_blocks: 0,
        }
    }

    /// Pages per block.
    pub fn block_pages(&self) -> u32 {
        self.block_size / self.page_size
    }

    /// Serialises into the fixed header record, CRC last.
    pub fn encode(&self) -> [u8; DB_HEADER_BYTES] {
        let mut out = [0u8; DB_HEADER_BYTES];
        out[HDR_MAGIC].copy_from_slice(&MAGIC);
        ord::put_u32(&mut out, HDR_VERSION, FORMAT_VERSION);
        ord::put_u32(&mut out, HDR_PAGE_SIZE, self.page_size);
        ord::put_u32(&mut out, HDR_BLOCK_SIZE, self.block_size);
        ord::put_u32(&mut out, HDR_N_PAGE, self.n_page);
        ord::put_u32(&mut out, HDR_MAIN_ROOT, self.main_root.0);
        ord::put_u32(&mut out, HDR_META_ROOT, self.meta_root.0);
        ord::put_u32(&mut out, HDR_SCHEDULE, self.schedule.0);
        ord::put_u32(&mut out, HDR_FI_BLOCK, self.fi_block.0);
        ord::put_u32(&mut out, HDR_FI_USED, self.fi_used);
        ord::put_u32(&mut out, HDR_COOKIE, self.cookie);
        ord::put_u32(&mut out, HDR_FREE_PAGE_HEAD, self.free_page_head.0);
        ord::put_u32(&mut out, HDR_FREE_BLOCK_HEAD, self.free_block_head.0);
        ord::put_u32(&mut out, HDR_FREE_PAGES, self.free_pages);
        ord::put_u32(&mut out, HDR_FREE_BLOCKS, self.free_blocks);
        seal_record(&mut out);
        out
    }

    /// Parses a header record. `None` when the magic or CRC does not match.
    pub fn decode(src: &[u8]) -> Option<DatabaseHeader> {
        let rec = src.get(..DB_HEADER_BYTES)?;
        if rec[HDR_MAGIC] != MAGIC || !verify_record(rec) {
            return None;
        }
        if ord::get_u32(rec, HDR_VERSION) != FORMAT_VERSION {
            return None;
        }
        let hdr = DatabaseHeader {
            page_size: ord::get_u32(rec, HDR_PAGE_SIZE),
            block_size: ord::get_u32(rec, HDR_BLOCK_SIZE),
            n_page: ord::get_u32(rec, HDR_N_PAGE),
            main_root: PageNo(ord::get_u32(rec, HDR_MAIN_ROOT)),
            meta_root: PageNo(ord::get_u32(rec, HDR_META_ROOT)),
            schedule: PageNo(ord::get_u32(rec, HDR_SCHEDULE)),
            fi_block: PageNo(ord::get_u32(rec, HDR_FI_BLOCK)),
            fi_used: ord::get_u32(rec, HDR_FI_USED),
            cookie: ord::get_u32(rec, HDR_COOKIE),
            free_page_head: PageNo(ord::get_u32(rec, HDR_FREE_PAGE_HEAD)),
            free_block_head: PageNo(ord::get_u32(rec, HDR_FREE_BLOCK_HEAD)),
            free_pages: ord::get_u32(rec, HDR_FREE_PAGES),
            free_blocks: ord::get_u32(rec, HDR_FREE_BLOCKS),
        };
        validate_sizes(hdr.page_size as usize, hdr.block_size as usize).ok()?;
        Some(hdr)
    }
}

/// Checks that `page_size` is a supported power of two and `block_size` a
/// whole number of pages.
pub fn validate_sizes(page_size: usize, block_size: usize) -> Result<()> {
    if !page_size.is_power_of_two() || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
        return Err(BtError::Misuse("page size must be a power of two in 512..=65536"));
    }
    if block_size < page_size * 4 || block_size % page_size != 0 {
        return Err(BtError::Misuse("block size must be a multiple of at least four pages"));
    }
    Ok(())
}

impl fmt::Display for DatabaseHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "page_size       {}", self.page_size)?;
        writeln!(f, "block_size      {}", self.block_size)?;
        writeln!(f, "n_page          {}", self.n_page)?;
        writeln!(f, "main_root       {}", self.main_root)?;
        writeln!(f, "meta_root       {}", self.meta_root)?;
        writeln!(f, "schedule        {}", self.schedule)?;
        writeln!(f, "fi_block        {} (used {})", self.fi_block, self.fi_used)?;
        writeln!(f, "cookie          {}", self.cookie)?;
        writeln!(f, "free pages      {} (head {})", self.free_pages, self.free_page_head)?;
        write!(f, "free blocks     {} (head {})", self.free_blocks, self.free_block_head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrips_and_rejects_damage() {
        let mut hdr = DatabaseHeader::initial(4096, 1 << 20);
        hdr.cookie = 77;
        hdr.free_page_head = PageNo(9);
        let enc = hdr.encode();
        assert_eq!(DatabaseHeader::decode(&enc), Some(hdr.clone()));
        let mut bad = enc;
        bad[HDR_COOKIE + 3] ^= 1;
        assert_eq!(DatabaseHeader::decode(&bad), None);
        assert_eq!(DatabaseHeader::decode(&[0u8; DB_HEADER_BYTES]), None);
        assert_eq!(hdr.block_pages(), 256);
    }

    #[test]
    fn size_validation() {
        assert!(validate_sizes(4096, 1 << 20).is_ok());
        assert!(validate_sizes(1000, 1 << 20).is_err());
        assert!(validate_sizes(256, 4096).is_err());
        assert!(validate_sizes(4096, 4096 * 3).is_err());
        assert!(validate_sizes(4096, 4096 * 5 + 1).is_err());
    }
}
