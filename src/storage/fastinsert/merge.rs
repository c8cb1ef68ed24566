//! Merge rounds.
//!
//! A round runs inside a checkpoint, after the schedule page reached the
//! database file. It reads the input sub-trees from the file, writes their
//! merged content into the schedule's extents and stores the updated
//! schedule back in the file. Everything a round reads is fixed by the
//! schedule it starts from, so repeating a round after a crash writes the
//! same pages again.

use std::sync::Arc;

use tracing::debug;

use crate::primitives::bytes::separator;
use crate::primitives::io::FileIo;
use crate::primitives::wal::CheckpointHook;
use crate::storage::btree::cell::{internal_cell_len, usable};
use crate::storage::btree::overflow::{cell_pages, copy_cell};
use crate::storage::btree::{Cell, FileSource, Node, PageSource, PageStore, SeekResult};
use crate::types::{BtError, PageNo, Result};

use super::multi::{LevelCursor, MultiCursor, SeekMode};
use super::schedule::{OutputTree, Schedule, ScheduleState};
use super::store::ExtentStore;

#[derive(Debug, Default)]
struct Spine {
    /// Children with the separator that follows each.
    entries: Vec<(PageNo, Vec<u8>)>,
    size: usize,
}

/// Builds a tree bottom-up from cells arriving in key order. Leaves are
/// filled completely before a new one starts; full internal nodes are
/// written as soon as the next separator no longer fits.
#[derive(Debug)]
pub struct BulkWriter {
    page_size: usize,
    leaf: Vec<Cell>,
    leaf_size: usize,
    spine: Vec<Spine>,
}

fn write_new<D: PageStore + ?Sized>(store: &mut D, node: &Node) -> Result<PageNo> {
    let image = node.encode(store.page_size())?;
    let pgno = store.alloc_page()?;
    store.write_page(pgno, &image)?;
    Ok(pgno)
}

impl BulkWriter {
    /// Empty writer for pages of `page_size` bytes.
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            leaf: Vec::new(),
            leaf_size: 0,
            spine: Vec::new(),
        }
    }

    /// Pages that must be free before the next push so that the push and a
    /// later [`BulkWriter::finish`] both succeed.
    pub fn reserve(&self) -> u64 {
        2 * self.spine.len() as u64 + 3
    }

    /// Appends a cell; keys must arrive in strictly ascending order.
    pub fn push<D: PageStore + ?Sized>(&mut self, store: &mut D, cell: Cell) -> Result<()> {
        let cost = cell.encoded_len();
        if let Some(last) = self.leaf.last() {
            if last.key() >= cell.key() {
                return Err(BtError::Misuse("bulk writer keys out of order"));
            }
            if self.leaf_size + cost > usable(self.page_size) {
                let sep = separator(last.key(), cell.key());
                let leaf = Node::Leaf(std::mem::take(&mut self.leaf));
                self.leaf_size = 0;
                let pgno = write_new(store, &leaf)?;
                self.add_child(store, pgno, sep)?;
            }
        }
        self.leaf_size += cost;
        self.leaf.push(cell);
        Ok(())
    }

    fn add_child<D: PageStore + ?Sized>(&mut self, store: &mut D, child: PageNo, sep: Vec<u8>) -> Result<()> {
        let cap = usable(self.page_size);
        let (mut level, mut child, mut sep) = (0, child, sep);
        loop {
            if self.spine.len() == level {
                self.spine.push(Spine::default());
            }
            let cost = internal_cell_len(&sep);
            let node = &mut self.spine[level];
            if node.entries.is_empty() || node.size + cost <= cap {
                node.entries.push((child, sep));
                node.size += cost;
                return Ok(());
            }
            let (children, mut keys): (Vec<PageNo>, Vec<Vec<u8>>) =
                std::mem::take(&mut node.entries).into_iter().unzip();
            let promoted = keys.pop().ok_or(BtError::Corruption("bulk writer spine"))?;
            node.entries.push((child, sep));
            node.size = cost;
            let pgno = write_new(store, &Node::Internal { keys, children })?;
            level += 1;
            child = pgno;
            sep = promoted;
        }
    }

    /// Writes the partial nodes and returns the root, or `None` if no cell
    /// was pushed.
    pub fn finish<D: PageStore + ?Sized>(self, store: &mut D) -> Result<Option<PageNo>> {
        if self.leaf.is_empty() && self.spine.is_empty() {
            return Ok(None);
        }
        let mut child = write_new(store, &Node::Leaf(self.leaf))?;
        for node in self.spine {
            let (mut children, keys): (Vec<PageNo>, Vec<Vec<u8>>) = node.entries.into_iter().unzip();
            children.push(child);
            child = write_new(store, &Node::Internal { keys, children })?;
        }
        Ok(Some(child))
    }
}

/// Runs one round of the merge described by `sched`, updating it in place.
/// The round stops early, leaving the schedule busy and starved, when the
/// extents cannot take the next cell.
pub(crate) fn run_round(
    src: &mut FileSource,
    sched: &mut Schedule,
    page_size: usize,
    block_pages: u32,
) -> Result<()> {
    let sources = sched.inputs.iter().map(|t| LevelCursor::single(t.root)).collect();
    let mut cursor = MultiCursor::new(sources, true);
    let start = sched.resume.clone();
    let mut more = match &start {
        Some(key) => cursor.seek(src, key, SeekMode::Ge)? != SeekResult::NotFound,
        None => cursor.first(src)?,
    };
    let mut store = ExtentStore::new(
        Arc::clone(src.file()),
        page_size,
        block_pages,
        sched.extents.clone(),
        u64::from(sched.used),
    );
    let mut writer = BulkWriter::new(page_size);
    let mut stopped_at = None;
    let mut cells = 0u64;
    while more {
        let cell = cursor.cell().cloned().ok_or(BtError::Corruption("merge cursor"))?;
        if store.remaining() < cell_pages(&cell, page_size) as u64 + writer.reserve() {
            stopped_at = Some(cell.key().to_vec());
            break;
        }
        let copy = copy_cell(src, &mut store, &cell)?;
        writer.push(&mut store, copy)?;
        cells += 1;
        more = cursor.next(src)?;
    }
    if let Some(root) = writer.finish(&mut store)? {
        sched.outputs.push(OutputTree {
            prefix: start.unwrap_or_default(),
            root,
        });
    }
    sched.used = u32::try_from(store.used()).map_err(|_| BtError::Corruption("extent usage"))?;
    debug!(cells, used = sched.used, done = stopped_at.is_none(), "fastinsert.merge.round");
    match stopped_at {
        Some(key) => {
            sched.resume = Some(key);
            sched.starved = true;
        }
        None => {
            sched.resume = None;
            sched.starved = false;
            sched.state = ScheduleState::Done;
        }
    }
    Ok(())
}

/// Checkpoint hook that advances the scheduled merge.
#[derive(Debug)]
pub struct MergeHook {
    schedule: PageNo,
    block_pages: u32,
}

impl MergeHook {
    /// Hook for a database whose schedule lives in `schedule`.
    pub fn new(schedule: PageNo, block_pages: u32) -> Self {
        Self { schedule, block_pages }
    }
}

impl CheckpointHook for MergeHook {
    fn schedule_page(&self) -> Option<PageNo> {
        Some(self.schedule)
    }

    fn merge(&mut self, db: &Arc<dyn FileIo>, page_size: usize) -> Result<bool> {
        let mut src = FileSource::new(Arc::clone(db), page_size);
        let page = src.read_page(self.schedule)?;
        let mut sched = Schedule::decode(page.data())?;
        if sched.state != ScheduleState::Busy || sched.starved {
            return Ok(false);
        }
        run_round(&mut src, &mut sched, page_size, self.block_pages)?;
        db.write_at(self.schedule.offset(page_size), &sched.encode(page_size)?)?;
        Ok(true)
    }
}
