use smallvec::SmallVec;

use crate::types::{BtError, PageNo, Result};

use super::balance::{child_index, MAX_DEPTH};
use super::cell::Cell;
use super::node::Node;
use super::PageSource;

/// How [`TreeCursor::seek`] treats a missing key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TreeSeek {
    /// Only an exact match.
    Eq,
    /// Largest key at or below the target.
    Le,
    /// Smallest key at or above the target.
    Ge,
}

/// Outcome of a seek.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeekResult {
    /// Positioned on the target key.
    Exact,
    /// Positioned on a neighbouring key.
    Inexact,
    /// No suitable key; the cursor is invalid.
    NotFound,
}

#[derive(Debug)]
struct Level {
    node: Node,
    idx: usize,
}

/// Position inside one tree: the nodes from the root to a leaf cell.
///
/// The cursor copies the nodes it walks, so it never pins pages, but it
/// also does not notice later writes; owners reseek after modifying the tree.
#[derive(Debug)]
pub struct TreeCursor {
    root: PageNo,
    stack: SmallVec<[Level; 8]>,
}

impl TreeCursor {
    /// Unpositioned cursor over the tree rooted at `root`.
    pub fn new(root: PageNo) -> Self {
        Self {
            root,
            stack: SmallVec::new(),
        }
    }

    /// Root of the tree walked.
    pub fn root(&self) -> PageNo {
        self.root
    }

    /// True when positioned on a cell.
    pub fn valid(&self) -> bool {
        self.cell().is_some()
    }

    /// Cell under the cursor.
    pub fn cell(&self) -> Option<&Cell> {
        match self.stack.last() {
            Some(Level {
                node: Node::Leaf(cells),
                idx,
            }) => cells.get(*idx),
            _ => None,
        }
    }

    /// Key under the cursor.
    pub fn key(&self) -> Option<&[u8]> {
        self.cell().map(Cell::key)
    }

    /// Drops the position.
    pub fn reset(&mut self) {
        self.stack.clear();
    }

    fn push<S: PageSource + ?Sized>(&mut self, src: &mut S, pgno: PageNo) -> Result<()> {
        if self.stack.len() >= MAX_DEPTH {
            return Err(BtError::Corruption("tree deeper than any valid tree"));
        }
        let page = src.read_page(pgno)?;
        let node = Node::decode(page.data())?;
        self.stack.push(Level { node, idx: 0 });
        Ok(())
    }

    /// Descends from the node on top of the stack along its first or last
    /// children down to a leaf.
    fn descend_edge<S: PageSource + ?Sized>(&mut self, src: &mut S, first: bool) -> Result<()> {
        loop {
            let Some(top) = self.stack.last_mut() else {
                return Ok(());
            };
            match &top.node {
                Node::Leaf(cells) => {
                    top.idx = if first { 0 } else { cells.len().saturating_sub(1) };
                    return Ok(());
                }
                Node::Internal { children, .. } => {
                    top.idx = if first { 0 } else { children.len() - 1 };
                    let child = children[top.idx];
                    self.push(src, child)?;
                }
            }
        }
    }

    /// Moves to the first cell of the next non-empty leaf, or the last cell of
    /// the previous one. Invalidates the cursor when there is none.
    fn step_leaf<S: PageSource + ?Sized>(&mut self, src: &mut S, forward: bool) -> Result<()> {
        loop {
            self.stack.pop();
            loop {
                let Some(top) = self.stack.last_mut() else {
                    return Ok(());
                };
                let Node::Internal { children, .. } = &top.node else {
                    return Err(BtError::Corruption("leaf above a leaf"));
                };
                if forward && top.idx + 1 < children.len() {
                    top.idx += 1;
                    break;
                }
                if !forward && top.idx > 0 {
                    top.idx -= 1;
                    break;
                }
                self.stack.pop();
            }
            let child = match self.stack.last() {
                Some(Level {
                    node: Node::Internal { children, .. },
                    idx,
                }) => children[*idx],
                _ => return Err(BtError::Corruption("cursor stack")),
            };
            self.push(src, child)?;
            self.descend_edge(src, forward)?;
            if self.valid() {
                return Ok(());
            }
        }
    }

    /// Positions on the first cell.
    pub fn first<S: PageSource + ?Sized>(&mut self, src: &mut S) -> Result<bool> {
        self.edge(src, true)
    }

    /// Positions on the last cell.
    pub fn last<S: PageSource + ?Sized>(&mut self, src: &mut S) -> Result<bool> {
        self.edge(src, false)
    }

    fn edge<S: PageSource + ?Sized>(&mut self, src: &mut S, first: bool) -> Result<bool> {
        self.stack.clear();
        self.push(src, self.root)?;
        self.descend_edge(src, first)?;
        if !self.valid() {
            self.step_leaf(src, first)?;
        }
        Ok(self.valid())
    }

    /// Advances one cell. Returns false when the cursor ran off the end.
    pub fn next<S: PageSource + ?Sized>(&mut self, src: &mut S) -> Result<bool> {
        if !self.valid() {
            return Ok(false);
        }
        if let Some(Level {
            node: Node::Leaf(cells),
            idx,
        }) = self.stack.last_mut()
        {
            if *idx + 1 < cells.len() {
                *idx += 1;
                return Ok(true);
            }
        }
        self.step_leaf(src, true)?;
        Ok(self.valid())
    }

    /// Steps back one cell. Returns false when the cursor ran off the start.
    pub fn prev<S: PageSource + ?Sized>(&mut self, src: &mut S) -> Result<bool> {
        if !self.valid() {
            return Ok(false);
        }
        self.back(src)
    }

    /// Steps back from the leaf position, which may sit one past the last cell.
    fn back<S: PageSource + ?Sized>(&mut self, src: &mut S) -> Result<bool> {
        if let Some(Level { idx, .. }) = self.stack.last_mut() {
            if *idx > 0 {
                *idx -= 1;
                return Ok(true);
            }
        }
        self.step_leaf(src, false)?;
        Ok(self.valid())
    }

    /// Positions relative to `key` per `mode`.
    pub fn seek<S: PageSource + ?Sized>(
        &mut self,
        src: &mut S,
        key: &[u8],
        mode: TreeSeek,
    ) -> Result<SeekResult> {
        self.stack.clear();
        let mut pgno = self.root;
        loop {
            self.push(src, pgno)?;
            let Some(top) = self.stack.last_mut() else {
                return Err(BtError::Corruption("cursor stack"));
            };
            match &top.node {
                Node::Leaf(cells) => {
                    top.idx = cells.partition_point(|c| c.key() < key);
                    break;
                }
                Node::Internal { keys, children } => {
                    top.idx = child_index(keys, key);
                    pgno = children[top.idx];
                }
            }
        }
        if self.key() == Some(key) {
            return Ok(SeekResult::Exact);
        }
        let found = match mode {
            TreeSeek::Eq => false,
            TreeSeek::Ge => self.valid() || {
                self.step_leaf(src, true)?;
                self.valid()
            },
            TreeSeek::Le => self.back(src)?,
        };
        if found {
            Ok(SeekResult::Inexact)
        } else {
            self.stack.clear();
            Ok(SeekResult::NotFound)
        }
    }
}
