//! The meta tree: one entry per fast-insert sub-tree plus a per-age summary.
//!
//! Entry keys are `[age u8][!level u32 BE][prefix]`, so a plain key-order
//! walk visits levels from newest to oldest: younger ages first and, within
//! an age, higher levels first. The value is `[root u32][n varint][block u32 * n]`.
//! The summary lives under the single byte key `0xFF`, after every entry.

use crate::primitives::bytes::buf::{Reader, Writer};
use crate::primitives::pager::Pager;
use crate::storage::btree::overflow::{build_cell, free_cell, full_value};
use crate::storage::btree::{BTreeStats, Tree, TreeCursor};
use crate::types::{BtError, PageNo, Result};

/// Key of the summary record.
pub(crate) const SUMMARY_KEY: &[u8] = &[0xFF];
/// Oldest age a level can reach.
pub const MAX_AGE: u8 = 0xFE;
/// Bytes a meta key adds in front of a sub-tree prefix.
pub(crate) const META_KEY_OVERHEAD: usize = 5;

/// Meta key for a sub-tree of `age`/`level` starting at `prefix`.
pub(crate) fn meta_key(age: u8, level: u32, prefix: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(META_KEY_OVERHEAD + prefix.len());
    key.push(age);
    key.extend_from_slice(&(!level).to_be_bytes());
    key.extend_from_slice(prefix);
    key
}

fn parse_meta_key(key: &[u8]) -> Result<(u8, u32, &[u8])> {
    if key.len() < META_KEY_OVERHEAD || key[0] > MAX_AGE {
        return Err(BtError::Corruption("meta key"));
    }
    let level = !u32::from_be_bytes([key[1], key[2], key[3], key[4]]);
    Ok((key[0], level, &key[META_KEY_OVERHEAD..]))
}

/// One sub-tree of a level, covering keys from `prefix` up to the next
/// sub-tree's prefix.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubTree {
    /// Smallest key the sub-tree may hold.
    pub prefix: Vec<u8>,
    /// Root page.
    pub root: PageNo,
    /// Blocks released together with the level.
    pub blocks: Vec<PageNo>,
}

/// All sub-trees of one level, ordered by prefix.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Level {
    /// Generation; 0 is the youngest.
    pub age: u8,
    /// Position within the age; higher is newer.
    pub level: u32,
    /// Sub-trees with disjoint key ranges.
    pub trees: Vec<SubTree>,
}

impl Level {
    /// Every block the level owns.
    pub fn blocks(&self) -> impl Iterator<Item = PageNo> + '_ {
        self.trees.iter().flat_map(|t| t.blocks.iter().copied())
    }
}

fn encode_entry(root: PageNo, blocks: &[PageNo]) -> Vec<u8> {
    let mut w = Writer::with_capacity(5 + 4 * blocks.len());
    w.u32(root.0).varint(blocks.len() as u64);
    for block in blocks {
        w.u32(block.0);
    }
    w.finish()
}

fn decode_entry(value: &[u8]) -> Result<(PageNo, Vec<PageNo>)> {
    let mut r = Reader::new(value, "meta entry");
    let root = PageNo(r.u32()?);
    let n = r.len_prefix()?;
    let blocks = (0..n).map(|_| r.u32().map(PageNo)).collect::<Result<Vec<_>>>()?;
    Ok((root, blocks))
}

/// Active level range of one age.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AgeSummary {
    /// Age described.
    pub age: u8,
    /// Oldest registered level.
    pub min: u32,
    /// Newest registered level.
    pub max: u32,
    /// Newest level an in-progress merge consumes; zero when none.
    pub merging: u32,
}

fn encode_summary(ages: &[AgeSummary]) -> Vec<u8> {
    let mut w = Writer::with_capacity(1 + 13 * ages.len());
    w.varint(ages.len() as u64);
    for a in ages {
        w.u8(a.age).u32(a.min).u32(a.max).u32(a.merging);
    }
    w.finish()
}

fn decode_summary(value: &[u8]) -> Result<Vec<AgeSummary>> {
    let mut r = Reader::new(value, "fast-insert summary");
    let n = r.len_prefix()?;
    (0..n)
        .map(|_| {
            Ok(AgeSummary {
                age: r.u8()?,
                min: r.u32()?,
                max: r.u32()?,
                merging: r.u32()?,
            })
        })
        .collect()
}

fn meta_tree(pager: &Pager) -> Result<Tree> {
    Ok(Tree::new(pager.header()?.meta_root))
}

/// Every registered level, newest first.
pub fn load_levels(pager: &mut Pager) -> Result<Vec<Level>> {
    let tree = meta_tree(pager)?;
    let mut cursor = TreeCursor::new(tree.root());
    let mut levels: Vec<Level> = Vec::new();
    let mut ok = cursor.first(pager)?;
    while ok {
        let cell = cursor.cell().cloned().ok_or(BtError::Corruption("meta cursor"))?;
        if cell.key() == SUMMARY_KEY {
            break;
        }
        let (age, level, prefix) = parse_meta_key(cell.key())?;
        let (root, blocks) = decode_entry(&full_value(pager, &cell)?)?;
        let sub = SubTree {
            prefix: prefix.to_vec(),
            root,
            blocks,
        };
        match levels.last_mut() {
            Some(last) if last.age == age && last.level == level => last.trees.push(sub),
            _ => levels.push(Level {
                age,
                level,
                trees: vec![sub],
            }),
        }
        ok = cursor.next(pager)?;
    }
    Ok(levels)
}

fn put(pager: &mut Pager, stats: &BTreeStats, key: &[u8], value: &[u8]) -> Result<()> {
    let tree = meta_tree(pager)?;
    let cell = build_cell(pager, key, value)?;
    if let Some(old) = tree.upsert(pager, cell, stats)? {
        free_cell(pager, &old)?;
    }
    Ok(())
}

fn remove(pager: &mut Pager, stats: &BTreeStats, key: &[u8]) -> Result<()> {
    let tree = meta_tree(pager)?;
    if let Some(old) = tree.remove(pager, key, stats)? {
        free_cell(pager, &old)?;
    }
    Ok(())
}

/// Registers a sub-tree.
pub(crate) fn register(
    pager: &mut Pager,
    stats: &BTreeStats,
    age: u8,
    level: u32,
    tree: &SubTree,
) -> Result<()> {
    put(
        pager,
        stats,
        &meta_key(age, level, &tree.prefix),
        &encode_entry(tree.root, &tree.blocks),
    )
}

/// Drops every entry of `level`. Its blocks are the caller's to release.
pub(crate) fn unregister(pager: &mut Pager, stats: &BTreeStats, level: &Level) -> Result<()> {
    for tree in &level.trees {
        remove(pager, stats, &meta_key(level.age, level.level, &tree.prefix))?;
    }
    Ok(())
}

/// Per-age summary as last written.
pub fn read_summary(pager: &mut Pager) -> Result<Vec<AgeSummary>> {
    let tree = meta_tree(pager)?;
    match tree.get(pager, SUMMARY_KEY)? {
        Some(cell) => decode_summary(&full_value(pager, &cell)?),
        None => Ok(Vec::new()),
    }
}

/// Rewrites the summary from the registered levels. `merging` names the age
/// and newest input level of an in-progress merge.
pub(crate) fn write_summary(
    pager: &mut Pager,
    stats: &BTreeStats,
    merging: Option<(u8, u32)>,
) -> Result<()> {
    let levels = load_levels(pager)?;
    let mut ages: Vec<AgeSummary> = Vec::new();
    for level in &levels {
        match ages.last_mut() {
            Some(a) if a.age == level.age => a.min = level.level,
            _ => ages.push(AgeSummary {
                age: level.age,
                min: level.level,
                max: level.level,
                merging: 0,
            }),
        }
    }
    if let Some((age, hi)) = merging {
        if let Some(a) = ages.iter_mut().find(|a| a.age == age) {
            a.merging = hi;
        }
    }
    if ages.is_empty() {
        remove(pager, stats, SUMMARY_KEY)
    } else {
        put(pager, stats, SUMMARY_KEY, &encode_summary(&ages))
    }
}

/// Removes every entry and the summary, returning the levels that were registered.
pub(crate) fn clear(pager: &mut Pager, stats: &BTreeStats) -> Result<Vec<Level>> {
    let levels = load_levels(pager)?;
    for level in &levels {
        unregister(pager, stats, level)?;
    }
    remove(pager, stats, SUMMARY_KEY)?;
    Ok(levels)
}
