//! Merged iteration over several levels.
//!
//! Sources are ordered by precedence: the first source holding a key owns
//! it and older copies are skipped. While moving forward every source sits
//! on its smallest key at or after the current one; moving backward, on its
//! largest key at or before it. Changing direction reseeks every source.

use crate::storage::btree::{Cell, PageSource, SeekResult, TreeCursor, TreeSeek};
use crate::types::{PageNo, Result};

use super::meta::Level;

/// Seek modes of a merged cursor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeekMode {
    /// Exact key only.
    Eq,
    /// Largest key at or below the target.
    Le,
    /// Same position as [`SeekMode::Le`], but only the owning source is
    /// aligned; the others catch up on the next step.
    LeFast,
    /// Smallest key at or above the target.
    Ge,
}

/// Cursor over one level: sub-trees with disjoint ranges, ordered by prefix.
#[derive(Debug)]
pub struct LevelCursor {
    trees: Vec<(Vec<u8>, PageNo)>,
    tree: usize,
    cursor: TreeCursor,
}

impl LevelCursor {
    /// Cursor over sub-trees given as `(prefix, root)` in prefix order.
    pub fn new(trees: Vec<(Vec<u8>, PageNo)>) -> Self {
        let root = trees.first().map_or(PageNo::NONE, |t| t.1);
        Self {
            trees,
            tree: 0,
            cursor: TreeCursor::new(root),
        }
    }

    /// Cursor over a single tree.
    pub fn single(root: PageNo) -> Self {
        Self::new(vec![(Vec::new(), root)])
    }

    /// Cursor over a registered level.
    pub fn level(level: &Level) -> Self {
        Self::new(level.trees.iter().map(|t| (t.prefix.clone(), t.root)).collect())
    }

    /// Cell under the cursor.
    pub fn cell(&self) -> Option<&Cell> {
        self.cursor.cell()
    }

    /// Key under the cursor.
    pub fn key(&self) -> Option<&[u8]> {
        self.cursor.key()
    }

    fn enter(&mut self, tree: usize) {
        self.tree = tree;
        self.cursor = TreeCursor::new(self.trees[tree].1);
    }

    fn first_from<S: PageSource + ?Sized>(&mut self, src: &mut S, start: usize) -> Result<bool> {
        for i in start..self.trees.len() {
            self.enter(i);
            if self.cursor.first(src)? {
                return Ok(true);
            }
        }
        self.cursor.reset();
        Ok(false)
    }

    fn last_from<S: PageSource + ?Sized>(&mut self, src: &mut S, end: usize) -> Result<bool> {
        for i in (0..end).rev() {
            self.enter(i);
            if self.cursor.last(src)? {
                return Ok(true);
            }
        }
        self.cursor.reset();
        Ok(false)
    }

    /// Positions on the first cell.
    pub fn first<S: PageSource + ?Sized>(&mut self, src: &mut S) -> Result<bool> {
        self.first_from(src, 0)
    }

    /// Positions on the last cell.
    pub fn last<S: PageSource + ?Sized>(&mut self, src: &mut S) -> Result<bool> {
        let n = self.trees.len();
        self.last_from(src, n)
    }

    /// Advances one cell.
    pub fn next<S: PageSource + ?Sized>(&mut self, src: &mut S) -> Result<bool> {
        if self.cursor.next(src)? {
            return Ok(true);
        }
        let next = self.tree + 1;
        self.first_from(src, next)
    }

    /// Steps back one cell.
    pub fn prev<S: PageSource + ?Sized>(&mut self, src: &mut S) -> Result<bool> {
        if self.cursor.prev(src)? {
            return Ok(true);
        }
        let end = self.tree;
        self.last_from(src, end)
    }

    /// Positions relative to `key`.
    pub fn seek<S: PageSource + ?Sized>(&mut self, src: &mut S, key: &[u8], mode: TreeSeek) -> Result<SeekResult> {
        if self.trees.is_empty() {
            return Ok(SeekResult::NotFound);
        }
        let tree = self
            .trees
            .partition_point(|(prefix, _)| prefix.as_slice() <= key)
            .saturating_sub(1);
        self.enter(tree);
        let result = self.cursor.seek(src, key, mode)?;
        if result != SeekResult::NotFound {
            return Ok(result);
        }
        let found = match mode {
            TreeSeek::Eq => false,
            TreeSeek::Ge => self.first_from(src, tree + 1)?,
            TreeSeek::Le => self.last_from(src, tree)?,
        };
        Ok(if found { SeekResult::Inexact } else { SeekResult::NotFound })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Direction {
    Forward,
    Backward,
    Unaligned,
}

/// Cursor yielding the newest version of every key across its sources.
#[derive(Debug)]
pub struct MultiCursor {
    sources: Vec<LevelCursor>,
    dir: Direction,
    winner: Option<usize>,
    keep_tombstones: bool,
}

impl MultiCursor {
    /// Merges `sources`, highest precedence first. Delete markers are
    /// reported only with `keep_tombstones`.
    pub fn new(sources: Vec<LevelCursor>, keep_tombstones: bool) -> Self {
        Self {
            sources,
            dir: Direction::Unaligned,
            winner: None,
            keep_tombstones,
        }
    }

    /// Cursor over the registered fast-insert `levels`, newest first, and
    /// optionally the main tree underneath them.
    pub fn over(levels: &[Level], main: Option<PageNo>, keep_tombstones: bool) -> Self {
        let mut sources: Vec<LevelCursor> = levels.iter().map(LevelCursor::level).collect();
        if let Some(root) = main {
            sources.push(LevelCursor::single(root));
        }
        Self::new(sources, keep_tombstones)
    }

    /// Cell of the current entry.
    pub fn cell(&self) -> Option<&Cell> {
        self.winner.and_then(|w| self.sources[w].cell())
    }

    /// Key of the current entry.
    pub fn key(&self) -> Option<&[u8]> {
        self.cell().map(Cell::key)
    }

    /// True when positioned.
    pub fn valid(&self) -> bool {
        self.winner.is_some()
    }

    fn pick(&mut self, forward: bool) {
        let mut best: Option<(usize, &[u8])> = None;
        for (i, source) in self.sources.iter().enumerate() {
            let Some(key) = source.key() else { continue };
            let better = match best {
                None => true,
                Some((_, b)) if forward => key < b,
                Some((_, b)) => key > b,
            };
            if better {
                best = Some((i, key));
            }
        }
        self.winner = best.map(|(i, _)| i);
    }

    fn skip_tombstones<S: PageSource + ?Sized>(&mut self, src: &mut S, forward: bool) -> Result<()> {
        while !self.keep_tombstones && self.cell().is_some_and(Cell::is_tombstone) {
            self.step(src, forward)?;
        }
        Ok(())
    }

    /// Moves every source past the current key and picks the next winner.
    fn step<S: PageSource + ?Sized>(&mut self, src: &mut S, forward: bool) -> Result<()> {
        let Some(current) = self.key().map(<[u8]>::to_vec) else {
            return Ok(());
        };
        let wanted = if forward { Direction::Forward } else { Direction::Backward };
        if self.dir != wanted {
            let mode = if forward { TreeSeek::Ge } else { TreeSeek::Le };
            for source in &mut self.sources {
                source.seek(src, &current, mode)?;
            }
            self.dir = wanted;
        }
        for source in &mut self.sources {
            if source.key() == Some(current.as_slice()) {
                if forward {
                    source.next(src)?;
                } else {
                    source.prev(src)?;
                }
            }
        }
        self.pick(forward);
        Ok(())
    }

    fn classify(&self, key: &[u8]) -> SeekResult {
        match self.key() {
            None => SeekResult::NotFound,
            Some(k) if k == key => SeekResult::Exact,
            Some(_) => SeekResult::Inexact,
        }
    }

    /// Positions on the first live entry.
    pub fn first<S: PageSource + ?Sized>(&mut self, src: &mut S) -> Result<bool> {
        for source in &mut self.sources {
            source.first(src)?;
        }
        self.dir = Direction::Forward;
        self.pick(true);
        self.skip_tombstones(src, true)?;
        Ok(self.valid())
    }

    /// Positions on the last live entry.
    pub fn last<S: PageSource + ?Sized>(&mut self, src: &mut S) -> Result<bool> {
        for source in &mut self.sources {
            source.last(src)?;
        }
        self.dir = Direction::Backward;
        self.pick(false);
        self.skip_tombstones(src, false)?;
        Ok(self.valid())
    }

    /// Advances to the next live entry.
    pub fn next<S: PageSource + ?Sized>(&mut self, src: &mut S) -> Result<bool> {
        self.step(src, true)?;
        self.skip_tombstones(src, true)?;
        Ok(self.valid())
    }

    /// Steps back to the previous live entry.
    pub fn prev<S: PageSource + ?Sized>(&mut self, src: &mut S) -> Result<bool> {
        self.step(src, false)?;
        self.skip_tombstones(src, false)?;
        Ok(self.valid())
    }

    /// Positions relative to `key` per `mode`.
    pub fn seek<S: PageSource + ?Sized>(&mut self, src: &mut S, key: &[u8], mode: SeekMode) -> Result<SeekResult> {
        match mode {
            SeekMode::Eq => {
                self.winner = None;
                self.dir = Direction::Unaligned;
                for i in 0..self.sources.len() {
                    if self.sources[i].seek(src, key, TreeSeek::Eq)? == SeekResult::Exact {
                        self.winner = Some(i);
                        break;
                    }
                }
                if !self.keep_tombstones && self.cell().is_some_and(Cell::is_tombstone) {
                    self.winner = None;
                }
                Ok(self.classify(key))
            }
            SeekMode::Ge => {
                for source in &mut self.sources {
                    source.seek(src, key, TreeSeek::Ge)?;
                }
                self.dir = Direction::Forward;
                self.pick(true);
                self.skip_tombstones(src, true)?;
                Ok(self.classify(key))
            }
            SeekMode::Le | SeekMode::LeFast => {
                for source in &mut self.sources {
                    source.seek(src, key, TreeSeek::Le)?;
                }
                self.dir = Direction::Backward;
                self.pick(false);
                self.skip_tombstones(src, false)?;
                if mode == SeekMode::LeFast {
                    self.dir = Direction::Unaligned;
                }
                Ok(self.classify(key))
            }
        }
    }
}
