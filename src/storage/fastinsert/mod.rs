#![forbid(unsafe_code)]

//! Fast-insert levels and their background merge.
//!
//! Writes land in the current level: a B-tree confined to one block, rooted
//! at the block's first page. When the block fills, the level is sealed and
//! a fresh one started. Sealed levels of one age are merged, oldest first,
//! into a single new level of the next age. Merges run a round at a time
//! inside checkpoints (see [`merge`]); a maintenance pass run under the
//! checkpointer lock schedules them, gives starved rounds more room and
//! integrates finished output into the meta tree.

pub mod meta;
mod merge;
mod multi;
pub mod schedule;
mod store;

use tracing::{debug, info};

use crate::primitives::pager::Pager;
use crate::storage::btree::overflow::{build_cell, free_cell, full_value};
use crate::storage::btree::{self, BTreeStats, Cell, PageStore, Tree};
use crate::types::{BtError, PageNo, Result};

pub use merge::{BulkWriter, MergeHook};
pub use meta::{load_levels, read_summary, AgeSummary, Level, SubTree, MAX_AGE};
pub use multi::{LevelCursor, MultiCursor, SeekMode};
pub use schedule::{Schedule, ScheduleState};
pub use store::{BlockStore, ExtentStore};

use meta::META_KEY_OVERHEAD;
use schedule::InputTree;

/// Most levels one merge consumes.
const MAX_MERGE_LEVELS: usize = 16;
/// Maintenance/checkpoint passes [`run_merges`] makes before giving up.
const MAX_DRIVE_STEPS: usize = 10_000;

/// When merges are scheduled and how much room each round gets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MergePolicy {
    /// Sealed levels an age needs before it is merged.
    pub min_levels: u32,
    /// Blocks allocated to a merge up front and added when a round starves.
    pub blocks_per_round: u32,
}

impl Default for MergePolicy {
    fn default() -> Self {
        Self {
            min_levels: 4,
            blocks_per_round: 4,
        }
    }
}

/// What a maintenance pass did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Maintenance {
    /// Nothing scheduled and nothing to schedule.
    Idle,
    /// A merge is scheduled and waits for a checkpoint.
    Waiting,
    /// A new merge was scheduled.
    Scheduled,
    /// A starved merge received more blocks.
    Extended,
    /// A finished merge was folded into the meta tree.
    Integrated,
}

/// Totals from [`run_merges`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Merge rounds run by checkpoints.
    pub rounds: u64,
    /// Merges integrated.
    pub integrated: u64,
}

/// Longest user key fast-insert accepts.
pub fn max_key_len(page_size: usize) -> usize {
    btree::max_key_len(page_size) - META_KEY_OVERHEAD
}

/// True when any fast-insert level is registered.
pub fn is_active(pager: &mut Pager) -> Result<bool> {
    let meta = Tree::new(pager.header()?.meta_root);
    Ok(!meta.is_empty(pager)?)
}

fn read_schedule(pager: &mut Pager) -> Result<Schedule> {
    let pgno = pager.header()?.schedule;
    let page = pager.page_uncached(pgno)?;
    Schedule::decode(page.data())
}

fn write_schedule(pager: &mut Pager, sched: &Schedule) -> Result<()> {
    let pgno = pager.header()?.schedule;
    let image = sched.encode(pager.page_size())?;
    pager.write_page(pgno, &image)
}

fn merging(sched: &Schedule) -> Option<(u8, u32)> {
    (sched.state != ScheduleState::Empty).then_some((sched.age, sched.hi))
}

/// Writes `key` into the current level; `None` stores a delete marker.
/// Needs an open write transaction, which is left as it was on failure.
pub fn write(
    pager: &mut Pager,
    key: &[u8],
    value: Option<&[u8]>,
    policy: &MergePolicy,
    stats: &BTreeStats,
) -> Result<()> {
    let level = pager.level();
    if level < 2 {
        return Err(BtError::Misuse("fast-insert write outside a write transaction"));
    }
    if key.len() > max_key_len(pager.page_size()) {
        return Err(BtError::TooBig);
    }
    let mut fresh = false;
    loop {
        if pager.header()?.fi_block.is_none() {
            pager.scoped(|p| new_level(p, policy, stats))?;
            fresh = true;
        }
        match pager.scoped(|p| insert_current(p, key, value, stats)) {
            Ok(()) => return Ok(()),
            Err(BtError::Full) if !fresh => {
                pager.scoped(|p| new_level(p, policy, stats))?;
                fresh = true;
            }
            Err(BtError::Full) => return Err(BtError::TooBig),
            Err(err) => return Err(err),
        }
    }
}

fn insert_current(pager: &mut Pager, key: &[u8], value: Option<&[u8]>, stats: &BTreeStats) -> Result<()> {
    let root = pager.header()?.fi_block;
    let mut store = BlockStore::new(pager);
    let cell = match value {
        Some(value) => build_cell(&mut store, key, value)?,
        None => Cell::Tombstone { key: key.to_vec() },
    };
    // replaced pages stay in the block until the level is released
    Tree::new(root).upsert(&mut store, cell, stats)?;
    Ok(())
}

/// Seals the current level, if any, and starts a new one in a fresh block.
fn new_level(pager: &mut Pager, policy: &MergePolicy, stats: &BTreeStats) -> Result<()> {
    let next = read_summary(pager)?
        .iter()
        .find(|a| a.age == 0)
        .map_or(1, |a| a.max + 1);
    let block = pager.alloc_block()?;
    pager.page_mut(block)?.fill(0);
    {
        let hdr = pager.header_mut()?;
        hdr.fi_block = block;
        hdr.fi_used = 1;
    }
    let tree = SubTree {
        prefix: Vec::new(),
        root: block,
        blocks: vec![block],
    };
    meta::register(pager, stats, 0, next, &tree)?;
    let sched = read_schedule(pager)?;
    meta::write_summary(pager, stats, merging(&sched))?;
    debug!(level = next, block = block.0, "fastinsert.level.new");
    maintain(pager, policy, stats, false)?;
    Ok(())
}

/// The merge to schedule next: the age with the most sealed levels, at
/// least `min_levels` of them, younger ages winning ties. Returns the age
/// and its oldest levels, newest first.
fn choose<'a>(levels: &'a [Level], current: Option<u32>, policy: &MergePolicy, page_size: usize) -> Option<(u8, Vec<&'a Level>)> {
    let tree_budget = page_size / 2 / 8;
    let mut best: Option<(u8, Vec<&Level>)> = None;
    let mut i = 0;
    while i < levels.len() {
        let age = levels[i].age;
        let end = levels[i..].iter().position(|l| l.age != age).map_or(levels.len(), |n| i + n);
        let sealed: Vec<&Level> = levels[i..end]
            .iter()
            .filter(|l| !(age == 0 && Some(l.level) == current))
            .collect();
        i = end;
        if age >= MAX_AGE {
            continue;
        }
        let mut picked = Vec::new();
        let mut trees = 0;
        for level in sealed.iter().rev().take(MAX_MERGE_LEVELS) {
            trees += level.trees.len();
            if !picked.is_empty() && trees > tree_budget {
                break;
            }
            picked.push(*level);
        }
        picked.reverse();
        let enough = picked.len() >= policy.min_levels.max(1) as usize;
        let better = best.as_ref().map_or(true, |(_, b)| picked.len() > b.len());
        if enough && better {
            best = Some((age, picked));
        }
    }
    best
}

/// One maintenance step. Must run inside a write transaction; takes the
/// checkpointer lock for the rest of it. With `touch`, a merge waiting for
/// its next round has its schedule page rewritten so the next checkpoint
/// picks it up.
pub fn maintain(pager: &mut Pager, policy: &MergePolicy, stats: &BTreeStats, touch: bool) -> Result<Maintenance> {
    pager.lock_checkpointer()?;
    let mut sched = read_schedule(pager)?;
    let block_pages = pager.header()?.block_pages();
    match sched.state {
        ScheduleState::Empty => schedule_merge(pager, policy, stats),
        ScheduleState::Done => {
            integrate(pager, stats, &sched)?;
            Ok(Maintenance::Integrated)
        }
        ScheduleState::Busy if sched.starved => {
            let have = (sched.capacity(block_pages) / u64::from(block_pages.max(1))) as u32;
            let add = have.max(policy.blocks_per_round).max(1);
            for _ in 0..add {
                let block = pager.alloc_block()?;
                sched.add_block(block, block_pages);
            }
            sched.starved = false;
            write_schedule(pager, &sched)?;
            debug!(added = add, "fastinsert.merge.extended");
            Ok(Maintenance::Extended)
        }
        ScheduleState::Busy => {
            if touch {
                write_schedule(pager, &sched)?;
            }
            Ok(Maintenance::Waiting)
        }
    }
}

fn schedule_merge(pager: &mut Pager, policy: &MergePolicy, stats: &BTreeStats) -> Result<Maintenance> {
    let levels = load_levels(pager)?;
    let hdr = pager.header()?;
    let fi_block = hdr.fi_block;
    let block_pages = hdr.block_pages();
    let current = if fi_block.is_none() {
        None
    } else {
        levels.iter().find(|l| l.age == 0).map(|l| l.level)
    };
    let Some((age, picked)) = choose(&levels, current, policy, pager.page_size()) else {
        return Ok(Maintenance::Idle);
    };
    let out_level = levels
        .iter()
        .filter(|l| l.age == age + 1)
        .map(|l| l.level)
        .max()
        .map_or(1, |m| m + 1);
    let mut sched = Schedule {
        state: ScheduleState::Busy,
        age,
        lo: picked.last().map_or(0, |l| l.level),
        hi: picked.first().map_or(0, |l| l.level),
        out_level,
        inputs: picked
            .iter()
            .flat_map(|l| l.trees.iter().map(|t| InputTree { level: l.level, root: t.root }))
            .collect(),
        ..Schedule::default()
    };
    for _ in 0..policy.blocks_per_round.max(1) {
        let block = pager.alloc_block()?;
        sched.add_block(block, block_pages);
    }
    write_schedule(pager, &sched)?;
    meta::write_summary(pager, stats, merging(&sched))?;
    info!(age, lo = sched.lo, hi = sched.hi, out_level, "fastinsert.merge.scheduled");
    Ok(Maintenance::Scheduled)
}

/// Replaces the inputs of a finished merge with its output.
fn integrate(pager: &mut Pager, stats: &BTreeStats, sched: &Schedule) -> Result<()> {
    let block_pages = pager.header()?.block_pages();
    let levels = load_levels(pager)?;
    for level in levels
        .iter()
        .filter(|l| l.age == sched.age && (sched.lo..=sched.hi).contains(&l.level))
    {
        meta::unregister(pager, stats, level)?;
        for block in level.blocks() {
            pager.free_block(block)?;
        }
    }
    let blocks = sched.blocks(block_pages);
    let used = if sched.outputs.is_empty() {
        0
    } else {
        (sched.used as usize).div_ceil(block_pages.max(1) as usize).min(blocks.len())
    };
    for &block in &blocks[used..] {
        pager.free_block(block)?;
    }
    for (i, output) in sched.outputs.iter().enumerate() {
        let tree = SubTree {
            prefix: output.prefix.clone(),
            root: output.root,
            blocks: if i == 0 { blocks[..used].to_vec() } else { Vec::new() },
        };
        meta::register(pager, stats, sched.age + 1, sched.out_level, &tree)?;
    }
    write_schedule(pager, &Schedule::default())?;
    meta::write_summary(pager, stats, None)?;
    info!(
        age = sched.age,
        lo = sched.lo,
        hi = sched.hi,
        outputs = sched.outputs.len(),
        "fastinsert.merge.integrated"
    );
    Ok(())
}

/// Folds every fast-insert level into the main tree and releases them.
/// Any scheduled merge is abandoned. Needs an open write transaction.
/// Returns the number of entries applied.
pub fn flush(pager: &mut Pager, stats: &BTreeStats) -> Result<u64> {
    if pager.level() < 2 {
        return Err(BtError::Misuse("fast-insert flush outside a write transaction"));
    }
    pager.lock_checkpointer()?;
    let block_pages = pager.header()?.block_pages();
    let sched = read_schedule(pager)?;
    if sched.state != ScheduleState::Empty {
        for block in sched.blocks(block_pages) {
            pager.free_block(block)?;
        }
        write_schedule(pager, &Schedule::default())?;
    }

    let levels = load_levels(pager)?;
    let main = Tree::new(pager.header()?.main_root);
    let mut cursor = MultiCursor::over(&levels, None, true);
    let mut applied = 0u64;
    let mut more = cursor.first(pager)?;
    while more {
        let cell = cursor.cell().cloned().ok_or(BtError::Corruption("fast-insert cursor"))?;
        let old = if cell.is_tombstone() {
            main.remove(pager, cell.key(), stats)?
        } else {
            let value = full_value(pager, &cell)?;
            let copy = build_cell(pager, cell.key(), &value)?;
            main.upsert(pager, copy, stats)?
        };
        if let Some(old) = old {
            free_cell(pager, &old)?;
        }
        applied += 1;
        more = cursor.next(pager)?;
    }

    for level in meta::clear(pager, stats)? {
        for block in level.blocks() {
            pager.free_block(block)?;
        }
    }
    let hdr = pager.header_mut()?;
    hdr.fi_block = PageNo::NONE;
    hdr.fi_used = 0;
    info!(applied, levels = levels.len(), "fastinsert.flush");
    Ok(applied)
}

/// Drives scheduled merges to completion: maintenance in its own write
/// transaction, then a checkpoint to run the round, until nothing is left.
/// Fails with [`BtError::Busy`] when a checkpoint cannot make progress.
pub fn run_merges(pager: &mut Pager, policy: &MergePolicy, stats: &BTreeStats) -> Result<MergeReport> {
    if pager.level() != 0 {
        return Err(BtError::Misuse("merges run outside transactions"));
    }
    let mut report = MergeReport::default();
    for _ in 0..MAX_DRIVE_STEPS {
        pager.begin(2)?;
        let step = match maintain(pager, policy, stats, true) {
            Ok(step) => step,
            Err(err) => {
                pager.rollback(0)?;
                return Err(err);
            }
        };
        pager.commit(0)?;
        if step == Maintenance::Idle {
            return Ok(report);
        }
        if step == Maintenance::Integrated {
            report.integrated += 1;
        }
        let ckpt = pager.checkpoint(0)?;
        if ckpt.merged {
            report.rounds += 1;
        } else if step == Maintenance::Waiting {
            return Err(BtError::Busy);
        }
    }
    Err(BtError::Busy)
}

#[cfg(test)]
mod tests;
