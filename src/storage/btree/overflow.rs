//! Overflow payloads.
//!
//! Value bytes beyond the local prefix are cut into page-sized chunks. The
//! first [`MAX_DIRECT`] chunk pages are listed in the cell; the rest hang off
//! a pointer tree whose pages are arrays of big-endian page numbers, zero
//! terminated when not full. Every walk uses an explicit stack bounded by
//! [`MAX_TREE_DEPTH`].

use crate::primitives::bytes::ord;
use crate::types::{BtError, PageNo, Result};

use super::cell::{max_key_len, max_local, overflow_overhead, Cell, OverflowPages, MAX_DIRECT, MAX_TREE_DEPTH};
use super::{PageSource, PageStore};

fn fanout(page_size: usize) -> usize {
    page_size / 4
}

/// Pointer-tree depth needed for `n` data pages, `None` if too deep.
fn tree_depth(n: usize, page_size: usize) -> Option<u8> {
    if n == 0 {
        return Some(0);
    }
    let mut depth = 1u8;
    let mut reach = fanout(page_size);
    while reach < n {
        depth += 1;
        if depth > MAX_TREE_DEPTH {
            return None;
        }
        reach = reach.saturating_mul(fanout(page_size));
    }
    Some(depth)
}

/// Pages an overflow payload of `value_len` bytes with `local` bytes kept on
/// the leaf occupies: data pages plus pointer pages.
pub fn pages_for(value_len: u64, local: usize, page_size: usize) -> usize {
    let rest = value_len.saturating_sub(local as u64) as usize;
    let data = rest.div_ceil(page_size);
    let mut total = data;
    let mut level = data.saturating_sub(MAX_DIRECT);
    while level > 0 {
        level = level.div_ceil(fanout(page_size));
        total += level;
        if level == 1 {
            break;
        }
    }
    total
}

/// Pages a cell needs beyond its leaf slot.
pub fn cell_pages(cell: &Cell, page_size: usize) -> usize {
    match cell {
        Cell::Overflow {
            value_len, local, ..
        } => pages_for(*value_len, local.len(), page_size),
        _ => 0,
    }
}

/// Local value bytes an overflow cell for `key` keeps.
fn local_len(key: &[u8], value_len: u64, page_size: usize) -> usize {
    max_local(page_size).saturating_sub(overflow_overhead(key, value_len, page_size))
}

/// Builds the cell for `key`/`value`, writing overflow pages through `store`
/// when the pair does not fit locally.
pub fn build_cell<S: PageStore + ?Sized>(store: &mut S, key: &[u8], value: &[u8]) -> Result<Cell> {
    let ps = store.page_size();
    if key.len() > max_key_len(ps) {
        return Err(BtError::TooBig);
    }
    let inline = Cell::Inline {
        key: key.to_vec(),
        value: value.to_vec(),
    };
    if inline.encoded_len() <= max_local(ps) {
        return Ok(inline);
    }
    let local = local_len(key, value.len() as u64, ps).min(value.len());
    let chunks: Vec<&[u8]> = value[local..].chunks(ps).collect();
    let tree_pages = chunks.len().saturating_sub(MAX_DIRECT);
    let depth = tree_depth(tree_pages, ps).ok_or(BtError::TooBig)?;
    let mut data = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        let pgno = store.alloc_page()?;
        store.write_page(pgno, chunk)?;
        data.push(pgno);
    }
    let direct = data.iter().take(MAX_DIRECT).copied().collect();
    let tree = build_tree(store, &data[MAX_DIRECT.min(data.len())..], depth)?;
    Ok(Cell::Overflow {
        key: key.to_vec(),
        value_len: value.len() as u64,
        local: value[..local].to_vec(),
        pages: OverflowPages { direct, tree, depth },
    })
}

/// Writes pointer pages over `leaves` bottom-up and returns the root.
fn build_tree<S: PageStore + ?Sized>(store: &mut S, leaves: &[PageNo], depth: u8) -> Result<PageNo> {
    if depth == 0 {
        return Ok(PageNo::NONE);
    }
    let ps = store.page_size();
    let mut level: Vec<PageNo> = leaves.to_vec();
    for _ in 0..depth {
        let mut parents = Vec::with_capacity(level.len().div_ceil(fanout(ps)));
        for group in level.chunks(fanout(ps)) {
            let mut image = vec![0u8; ps];
            for (i, pgno) in group.iter().enumerate() {
                ord::put_u32(&mut image, i * 4, pgno.0);
            }
            let pgno = store.alloc_page()?;
            store.write_page(pgno, &image)?;
            parents.push(pgno);
        }
        level = parents;
    }
    match level.as_slice() {
        [root] => Ok(*root),
        _ => Err(BtError::Corruption("overflow pointer tree root")),
    }
}

/// Data pages of an overflow chain in order, plus its pointer pages.
fn chain<S: PageSource + ?Sized>(src: &mut S, pages: &OverflowPages, data_pages: usize) -> Result<(Vec<PageNo>, Vec<PageNo>)> {
    let mut data: Vec<PageNo> = pages.direct.clone();
    let mut pointers = Vec::new();
    if pages.depth > 0 {
        let mut stack = vec![(pages.tree, pages.depth)];
        while let Some((pgno, depth)) = stack.pop() {
            pointers.push(pgno);
            let page = src.read_page(pgno)?;
            let entries: Vec<PageNo> = page
                .data()
                .chunks_exact(4)
                .map(|b| PageNo(u32::from_be_bytes([b[0], b[1], b[2], b[3]])))
                .take_while(|p| !p.is_none())
                .collect();
            if depth == 1 {
                data.extend(entries);
            } else {
                stack.extend(entries.into_iter().rev().map(|p| (p, depth - 1)));
            }
            if data.len() > data_pages {
                return Err(BtError::Corruption("overflow chain longer than its value"));
            }
        }
    }
    if data.len() != data_pages {
        return Err(BtError::Corruption("overflow chain length"));
    }
    Ok((data, pointers))
}

fn data_page_count(value_len: u64, local: usize, page_size: usize) -> usize {
    (value_len.saturating_sub(local as u64) as usize).div_ceil(page_size)
}

/// Reads `len` value bytes starting at `offset`; the range is clipped to the value.
pub fn read_value<S: PageSource + ?Sized>(src: &mut S, cell: &Cell, offset: u64, len: usize) -> Result<Vec<u8>> {
    let total = cell.value_len();
    let start = offset.min(total);
    let end = start.saturating_add(len as u64).min(total);
    match cell {
        Cell::Inline { value, .. } => Ok(value[start as usize..end as usize].to_vec()),
        Cell::Tombstone { .. } => Ok(Vec::new()),
        Cell::Overflow {
            value_len,
            local,
            pages,
            ..
        } => {
            let ps = src.page_size();
            let mut out = Vec::with_capacity((end - start) as usize);
            let local_end = (local.len() as u64).min(end);
            if start < local_end {
                out.extend_from_slice(&local[start as usize..local_end as usize]);
            }
            if end <= local.len() as u64 {
                return Ok(out);
            }
            let (data, _) = chain(src, pages, data_page_count(*value_len, local.len(), ps))?;
            let from = start.max(local.len() as u64) - local.len() as u64;
            let to = end - local.len() as u64;
            let mut at = from;
            while at < to {
                let index = (at / ps as u64) as usize;
                let within = (at % ps as u64) as usize;
                let take = ((to - at) as usize).min(ps - within);
                let pgno = data.get(index).ok_or(BtError::Corruption("overflow chain length"))?;
                let page = src.read_page(*pgno)?;
                out.extend_from_slice(&page.data()[within..within + take]);
                at += take as u64;
            }
            Ok(out)
        }
    }
}

/// Reads the whole value of `cell`.
pub fn full_value<S: PageSource + ?Sized>(src: &mut S, cell: &Cell) -> Result<Vec<u8>> {
    let len = usize::try_from(cell.value_len()).map_err(|_| BtError::TooBig)?;
    read_value(src, cell, 0, len)
}

/// Frees every page behind an overflow cell.
pub fn free_cell<S: PageStore + ?Sized>(store: &mut S, cell: &Cell) -> Result<()> {
    let Cell::Overflow {
        value_len,
        local,
        pages,
        ..
    } = cell
    else {
        return Ok(());
    };
    let ps = store.page_size();
    let (data, pointers) = chain(store, pages, data_page_count(*value_len, local.len(), ps))?;
    for pgno in data.into_iter().chain(pointers) {
        store.free_page(pgno)?;
    }
    Ok(())
}

/// Every page behind an overflow cell.
pub fn cell_page_list<S: PageSource + ?Sized>(src: &mut S, cell: &Cell) -> Result<Vec<PageNo>> {
    let Cell::Overflow {
        value_len,
        local,
        pages,
        ..
    } = cell
    else {
        return Ok(Vec::new());
    };
    let ps = src.page_size();
    let (mut data, pointers) = chain(src, pages, data_page_count(*value_len, local.len(), ps))?;
    data.extend(pointers);
    Ok(data)
}

/// Rebuilds `cell` in `dst`, copying any overflow payload out of `src`.
pub fn copy_cell<S: PageSource + ?Sized, D: PageStore + ?Sized>(src: &mut S, dst: &mut D, cell: &Cell) -> Result<Cell> {
    match cell {
        Cell::Overflow { key, .. } => {
            let value = full_value(src, cell)?;
            build_cell(dst, key, &value)
        }
        other => Ok(other.clone()),
    }
}
